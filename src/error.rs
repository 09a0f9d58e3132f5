use std::time::Duration;

use thiserror::Error;

use crate::gatt::{AttributeHandle, NotFound, OperationKind, SessionAction, SessionState, Status};
use crate::link::DeviceAddress;

/// Errors returned synchronously at the call site of a session operation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("`{kind}` requires a {required} session, but the session is {state}")]
    NotReady {
        kind: OperationKind,
        state: SessionState,
        required: SessionState,
    },
    #[error("cannot connect: the session is already {state}")]
    AlreadyConnecting { state: SessionState },
    #[error("cannot {action} while the session is {state}")]
    InvalidTransition {
        action: SessionAction,
        state: SessionState,
    },
    #[error(transparent)]
    NotFound(#[from] NotFound),
    #[error("the link driver does not support {capability}")]
    Unsupported { capability: &'static str },
    #[error("requested MTU {mtu} is outside {min}..={max}")]
    InvalidMtu { mtu: u16, min: u16, max: u16 },
    #[error("the link driver rejected the request")]
    Link(#[from] LinkError),
}

/// Errors delivered through a pending operation instead of its result.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum OperationError {
    #[error("`{kind}` timed out after {}", humantime::format_duration(*timeout))]
    Timeout {
        kind: OperationKind,
        timeout: Duration,
    },
    #[error("`{kind}` was cancelled before it completed")]
    Cancelled { kind: OperationKind },
    #[error("`{kind}` failed with link status `{status}`")]
    LinkFailure { kind: OperationKind, status: Status },
    #[error("`{kind}` is not supported by the peer")]
    Unsupported { kind: OperationKind },
    #[error("`{kind}` completed with a payload of the wrong shape")]
    UnexpectedPayload { kind: OperationKind },
}

impl OperationError {
    /// Maps a non-success link status onto the error taxonomy.
    pub(crate) fn from_status(kind: OperationKind, status: Status) -> Self {
        match status {
            Status::RequestNotSupported => Self::Unsupported { kind },
            status => Self::LinkFailure { kind, status },
        }
    }
}

/// Errors raised by a link driver when a request cannot even be submitted.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("the link is not connected")]
    NotConnected,
    #[error("attribute handle {handle} is unknown to the link")]
    UnknownHandle { handle: AttributeHandle },
    #[error("the link driver has been closed")]
    Closed,
}

/// Errors returned when parsing fake peripheral fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("fixture records must look like `service/characteristic:properties[=hex]`")]
    InvalidRecordShape { record: String },
    #[error("`{value}` is not a 16-bit or 128-bit UUID")]
    InvalidUuid { value: String },
    #[error("unknown characteristic property `{value}`")]
    UnknownProperty { value: String },
    #[error("`{value}` is not an attribute handle")]
    InvalidHandle { value: String },
    #[error("invalid hex payload")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Errors raised while running a `gattctl` command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("could not connect to {address}: the session is {state}")]
    ConnectFailed {
        address: DeviceAddress,
        state: SessionState,
    },
    #[error("failed to listen for Ctrl+C")]
    CtrlC {
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("fake peripheral options require --fake")]
    FakeOptionsWithoutFake,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
