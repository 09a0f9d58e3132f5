//! Client-side GATT session: attribute table, request queue, lifecycle, and event routing.

mod attribute;
mod core;
mod dispatcher;
mod operation;
mod queue;
mod session;
mod state;
mod status;
#[cfg(test)]
mod test_support;

pub use self::attribute::{
    AttributeHandle, AttributeKind, AttributeTable, Characteristic, CharacteristicProperties,
    Descriptor, NotFound, Service, uuid_from_u16,
};
pub use self::core::{DEFAULT_MTU, MAX_MTU, SessionInfo};
pub use self::dispatcher::{CharacteristicNotification, LinkEvent, LinkEventSender, LinkState};
pub use self::operation::{OperationKind, OperationOutput, OperationRequest, Pending};
pub use self::session::{
    DEFAULT_NOTIFICATION_CAPACITY, DEFAULT_OPERATION_TIMEOUT, GattSession, SessionConfig,
    SessionId,
};
pub use self::state::{SessionAction, SessionState};
pub use self::status::{ConnectionPriority, Status, WriteType};
