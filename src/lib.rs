//! A GATT client session manager for Bluetooth Low Energy peripherals.
//!
//! A [`GattSession`] owns one link to one peripheral. It serialises attribute operations
//! through a FIFO queue, tracks the connection lifecycle, keeps the discovered attribute
//! table, and routes asynchronous link events back to the callers waiting on them.

mod app;
mod cli;
mod error;
mod gatt;
mod link;
mod telemetry;
mod terminal;
mod utils;

pub use app::{fake_link_backend, real_link_backend, run, run_with_clients};
pub use cli::{
    Args, Command, FakeArgs, Invocation, ListenArgs, LogLevel, OutputFormat, ReadArgs, WriteArgs,
};
pub use error::{CommandError, FixtureError, LinkError, OperationError, SessionError};
pub use gatt::{
    AttributeHandle, AttributeKind, AttributeTable, Characteristic, CharacteristicNotification,
    CharacteristicProperties, ConnectionPriority, DEFAULT_MTU, DEFAULT_NOTIFICATION_CAPACITY,
    DEFAULT_OPERATION_TIMEOUT, Descriptor, GattSession, LinkEvent, LinkEventSender, LinkState,
    MAX_MTU, NotFound, OperationKind, OperationOutput, OperationRequest, Pending, Service,
    SessionAction, SessionConfig, SessionId, SessionInfo, SessionState, Status, WriteType,
    uuid_from_u16,
};
pub use link::{
    BtleplugBackend, DeviceAddress, FakeLinkBackend, FakeLinkController, FakeLinkDriver,
    FakePeripheral, LinkBackend, LinkCommand, LinkDriver, NotificationScript, PeripheralFixture,
};
pub use terminal::TerminalClient;
