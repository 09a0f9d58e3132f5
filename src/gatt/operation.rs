use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use strum_macros::{Display, EnumIter};
use tokio::sync::oneshot;

use super::attribute::{AttributeHandle, Service};
use super::status::{ConnectionPriority, Status, WriteType};
use crate::error::OperationError;

/// Kinds of GATT request a session can have pending.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[strum(to_string = "read_characteristic")]
    ReadCharacteristic,
    #[strum(to_string = "write_characteristic")]
    WriteCharacteristic,
    #[strum(to_string = "read_descriptor")]
    ReadDescriptor,
    #[strum(to_string = "write_descriptor")]
    WriteDescriptor,
    #[strum(to_string = "read_rssi")]
    ReadRssi,
    #[strum(to_string = "request_mtu")]
    RequestMtu,
    #[strum(to_string = "request_priority")]
    RequestPriority,
    #[strum(to_string = "set_notification")]
    SetNotification,
    /// Service discovery; tracked by the state machine rather than the queue.
    #[strum(to_string = "discover_services")]
    DiscoverServices,
}

impl OperationKind {
    /// Whether the request only needs an established link rather than a discovered table.
    #[must_use]
    pub fn is_link_level(self) -> bool {
        matches!(
            self,
            Self::ReadRssi | Self::RequestMtu | Self::RequestPriority
        )
    }
}

/// A queued GATT request with its arguments.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OperationRequest {
    ReadCharacteristic {
        handle: AttributeHandle,
    },
    WriteCharacteristic {
        handle: AttributeHandle,
        value: Vec<u8>,
        write_type: WriteType,
    },
    ReadDescriptor {
        handle: AttributeHandle,
    },
    WriteDescriptor {
        handle: AttributeHandle,
        value: Vec<u8>,
    },
    ReadRssi,
    RequestMtu {
        mtu: u16,
    },
    RequestPriority {
        priority: ConnectionPriority,
    },
    SetNotification {
        handle: AttributeHandle,
        enable: bool,
    },
}

impl OperationRequest {
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::ReadCharacteristic { .. } => OperationKind::ReadCharacteristic,
            Self::WriteCharacteristic { .. } => OperationKind::WriteCharacteristic,
            Self::ReadDescriptor { .. } => OperationKind::ReadDescriptor,
            Self::WriteDescriptor { .. } => OperationKind::WriteDescriptor,
            Self::ReadRssi => OperationKind::ReadRssi,
            Self::RequestMtu { .. } => OperationKind::RequestMtu,
            Self::RequestPriority { .. } => OperationKind::RequestPriority,
            Self::SetNotification { .. } => OperationKind::SetNotification,
        }
    }

    /// The attribute this request addresses, if any.
    #[must_use]
    pub fn target(&self) -> Option<AttributeHandle> {
        match self {
            Self::ReadCharacteristic { handle }
            | Self::WriteCharacteristic { handle, .. }
            | Self::ReadDescriptor { handle }
            | Self::WriteDescriptor { handle, .. }
            | Self::SetNotification { handle, .. } => Some(*handle),
            Self::ReadRssi | Self::RequestMtu { .. } | Self::RequestPriority { .. } => None,
        }
    }

    pub(crate) fn completion_key(&self) -> CompletionKey {
        match self {
            Self::ReadCharacteristic { handle } | Self::ReadDescriptor { handle } => {
                CompletionKey::Read(*handle)
            }
            Self::WriteCharacteristic { handle, .. } | Self::WriteDescriptor { handle, .. } => {
                CompletionKey::Write(*handle)
            }
            Self::SetNotification { handle, .. } => CompletionKey::Notification(*handle),
            Self::ReadRssi => CompletionKey::Rssi,
            Self::RequestMtu { .. } => CompletionKey::Mtu,
            Self::RequestPriority { .. } => CompletionKey::Priority,
        }
    }
}

/// Identifies which in-flight request a link completion answers.
///
/// The link reports reads and writes per handle without distinguishing characteristics from
/// descriptors, so both share one key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display)]
pub(crate) enum CompletionKey {
    #[display("read({_0})")]
    Read(AttributeHandle),
    #[display("write({_0})")]
    Write(AttributeHandle),
    #[display("notification({_0})")]
    Notification(AttributeHandle),
    #[display("rssi")]
    Rssi,
    #[display("mtu")]
    Mtu,
    #[display("priority")]
    Priority,
}

/// Successful payload of a completed request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OperationOutput {
    Value(Vec<u8>),
    Written,
    NotificationSet { enabled: bool },
    Rssi(i16),
    Mtu(u16),
    Priority(ConnectionPriority),
    Services(Vec<Service>),
}

pub(crate) type OperationResult = Result<OperationOutput, OperationError>;
pub(crate) type Responder = oneshot::Sender<OperationResult>;

/// Result of a request that completes asynchronously.
///
/// Resolves exactly once: with the peer's answer, or with `Timeout`, `Cancelled`,
/// `LinkFailure`, or `Unsupported`. A session that goes away resolves it as `Cancelled`.
#[derive(Debug)]
#[must_use = "a pending operation resolves only when awaited"]
pub struct Pending<T> {
    kind: OperationKind,
    receiver: oneshot::Receiver<OperationResult>,
    extract: fn(OperationKind, OperationOutput) -> Result<T, OperationError>,
}

impl<T> Pending<T> {
    pub(crate) fn new(
        kind: OperationKind,
        receiver: oneshot::Receiver<OperationResult>,
        extract: fn(OperationKind, OperationOutput) -> Result<T, OperationError>,
    ) -> Self {
        Self {
            kind,
            receiver,
            extract,
        }
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, OperationError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let kind = self.kind;
        let extract = self.extract;
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| match received {
                Ok(result) => result.and_then(|output| extract(kind, output)),
                Err(_closed) => Err(OperationError::Cancelled { kind }),
            })
    }
}

pub(crate) fn value_output(
    kind: OperationKind,
    output: OperationOutput,
) -> Result<Vec<u8>, OperationError> {
    match output {
        OperationOutput::Value(value) => Ok(value),
        _ => Err(OperationError::UnexpectedPayload { kind }),
    }
}

pub(crate) fn status_output(
    kind: OperationKind,
    output: OperationOutput,
) -> Result<Status, OperationError> {
    match output {
        OperationOutput::Written
        | OperationOutput::NotificationSet { .. }
        | OperationOutput::Priority(_) => Ok(Status::Success),
        _ => Err(OperationError::UnexpectedPayload { kind }),
    }
}

pub(crate) fn rssi_output(kind: OperationKind, output: OperationOutput) -> Result<i16, OperationError> {
    match output {
        OperationOutput::Rssi(rssi) => Ok(rssi),
        _ => Err(OperationError::UnexpectedPayload { kind }),
    }
}

pub(crate) fn mtu_output(kind: OperationKind, output: OperationOutput) -> Result<u16, OperationError> {
    match output {
        OperationOutput::Mtu(mtu) => Ok(mtu),
        _ => Err(OperationError::UnexpectedPayload { kind }),
    }
}

pub(crate) fn services_output(
    kind: OperationKind,
    output: OperationOutput,
) -> Result<Vec<Service>, OperationError> {
    match output {
        OperationOutput::Services(services) => Ok(services),
        _ => Err(OperationError::UnexpectedPayload { kind }),
    }
}
