use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, broadcast, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::attribute::{AttributeHandle, AttributeTable, CharacteristicProperties, Service};
use super::dispatcher::{CharacteristicNotification, LinkEventSender};
use super::operation::{OperationKind, OperationOutput, OperationRequest, OperationResult};
use super::queue::OperationQueue;
use super::session::{SessionConfig, SessionId};
use super::state::{DisconnectStep, SessionState, SessionStateMachine};
use super::status::{ConnectionPriority, Status, WriteType};
use crate::error::{OperationError, SessionError};
use crate::link::LinkDriver;

/// Default ATT MTU before any exchange.
pub const DEFAULT_MTU: u16 = 23;
/// Largest ATT MTU a request may ask for.
pub const MAX_MTU: u16 = 517;

/// Snapshot of the link parameters of a session.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct SessionInfo {
    id: SessionId,
    state: SessionState,
    mtu: u16,
    priority: ConnectionPriority,
}

impl SessionInfo {
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated ATT MTU.
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    #[must_use]
    pub fn priority(&self) -> ConnectionPriority {
        self.priority
    }
}

/// Channels through which the core publishes its state to readers.
#[derive(Debug)]
pub(crate) struct SessionObservers {
    pub(crate) state: watch::Receiver<SessionState>,
    pub(crate) table: watch::Receiver<Arc<AttributeTable>>,
    pub(crate) notifications: broadcast::Sender<CharacteristicNotification>,
}

#[derive(Debug)]
pub(super) struct DiscoveryWaiter {
    responder: oneshot::Sender<OperationResult>,
    deadline: Option<Instant>,
}

/// All mutable session state; owned by exactly one writer at a time.
#[derive(Debug)]
pub(crate) struct SessionCore {
    id: SessionId,
    config: SessionConfig,
    pub(super) machine: SessionStateMachine,
    pub(super) queue: OperationQueue,
    pub(super) link: Box<dyn LinkDriver>,
    pub(super) discovery: Option<DiscoveryWaiter>,
    pub(super) notifications: broadcast::Sender<CharacteristicNotification>,
    pub(super) mtu: u16,
    pub(super) priority: ConnectionPriority,
    events: LinkEventSender,
    table: watch::Sender<Arc<AttributeTable>>,
    rearm: Arc<Notify>,
    closed: bool,
}

impl SessionCore {
    pub(crate) fn new(
        id: SessionId,
        link: Box<dyn LinkDriver>,
        config: SessionConfig,
        events: LinkEventSender,
        rearm: Arc<Notify>,
    ) -> (Self, SessionObservers) {
        let (machine, state) = SessionStateMachine::new();
        let (table_publisher, table) = watch::channel(Arc::new(AttributeTable::default()));
        let (notifications, _) = broadcast::channel(config.notification_capacity().max(1));
        let observers = SessionObservers {
            state,
            table,
            notifications: notifications.clone(),
        };

        (
            Self {
                id,
                config,
                machine,
                queue: OperationQueue::default(),
                link,
                discovery: None,
                notifications,
                mtu: DEFAULT_MTU,
                priority: ConnectionPriority::default(),
                events,
                table: table_publisher,
                rearm,
                closed: false,
            },
            observers,
        )
    }

    pub(crate) fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.machine.state(),
            mtu: self.mtu,
            priority: self.priority,
        }
    }

    pub(crate) fn connect(&mut self) -> Result<(), SessionError> {
        self.machine.begin_connect()?;
        if let Err(error) = self.link.connect(self.id.address(), self.events.clone()) {
            warn!(%error, "link driver rejected connect");
            self.machine.link_lost();
            return Err(error.into());
        }
        Ok(())
    }

    pub(crate) fn discover_services(
        &mut self,
        now: Instant,
    ) -> Result<oneshot::Receiver<OperationResult>, SessionError> {
        self.machine.begin_discovery()?;
        let (responder, receiver) = oneshot::channel();
        self.discovery = Some(DiscoveryWaiter {
            responder,
            deadline: self
                .config
                .discovery_timeout()
                .and_then(|timeout| now.checked_add(timeout)),
        });

        if let Err(error) = self.link.discover_services() {
            warn!(%error, "link driver rejected service discovery");
            self.finish_discovery(Err(OperationError::LinkFailure {
                kind: OperationKind::DiscoverServices,
                status: Status::Failure,
            }));
            return Err(error.into());
        }
        self.rearm.notify_one();
        Ok(receiver)
    }

    /// Validates and queues one request.
    pub(crate) fn submit(
        &mut self,
        request: OperationRequest,
        now: Instant,
    ) -> Result<oneshot::Receiver<OperationResult>, SessionError> {
        self.machine.admit(request.kind())?;
        self.validate(&request)?;

        let (responder, receiver) = oneshot::channel();
        self.queue.enqueue(
            request,
            self.config.operation_timeout(),
            responder,
            self.link.as_mut(),
            now,
        );
        self.rearm.notify_one();
        Ok(receiver)
    }

    fn validate(&self, request: &OperationRequest) -> Result<(), SessionError> {
        let table = self.table.borrow();
        match request {
            OperationRequest::ReadCharacteristic { handle }
            | OperationRequest::WriteCharacteristic { handle, .. }
            | OperationRequest::SetNotification { handle, .. } => {
                table.characteristic(*handle)?;
            }
            OperationRequest::ReadDescriptor { handle }
            | OperationRequest::WriteDescriptor { handle, .. } => {
                table.descriptor(*handle)?;
            }
            OperationRequest::RequestMtu { mtu } => {
                if !(DEFAULT_MTU..=MAX_MTU).contains(mtu) {
                    return Err(SessionError::InvalidMtu {
                        mtu: *mtu,
                        min: DEFAULT_MTU,
                        max: MAX_MTU,
                    });
                }
            }
            OperationRequest::ReadRssi | OperationRequest::RequestPriority { .. } => {}
        }
        Ok(())
    }

    /// Picks an acknowledged write unless the characteristic only allows unacknowledged ones.
    pub(crate) fn default_write_type(&self, handle: AttributeHandle) -> WriteType {
        let table = self.table.borrow();
        let Ok(characteristic) = table.characteristic(handle) else {
            return WriteType::WithResponse;
        };
        let properties = characteristic.properties();
        if !properties.contains(CharacteristicProperties::WRITE)
            && properties.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        }
    }

    pub(crate) fn refresh(&mut self) -> Result<(), SessionError> {
        if !self.link.supports_cache_refresh() {
            return Err(SessionError::Unsupported {
                capability: "attribute cache refresh",
            });
        }
        self.machine.begin_refresh()?;
        let cancelled = self
            .queue
            .cancel_waiting_where(|request| !request.kind().is_link_level());
        debug!(
            cancelled,
            kept = self.queue.waiting_len(),
            "attribute cache refresh requested"
        );
        self.clear_table();
        self.link.refresh_cache()?;
        Ok(())
    }

    pub(crate) fn disconnect(&mut self) -> Result<(), SessionError> {
        match self.machine.begin_disconnect()? {
            DisconnectStep::Immediate => {
                self.release();
            }
            DisconnectStep::InProgress => {}
            DisconnectStep::TearDown => {
                self.release();
                if let Err(error) = self.link.disconnect() {
                    warn!(%error, "link driver rejected disconnect; treating the link as gone");
                    self.machine.link_lost();
                }
            }
        }
        Ok(())
    }

    /// Tears the session down for good; every pending operation is resolved before returning.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(DisconnectStep::TearDown) = self.machine.begin_disconnect()
            && let Err(error) = self.link.disconnect()
        {
            debug!(%error, "link driver rejected disconnect during close");
        }
        self.machine.link_lost();
        self.release();
        self.link.close();
        self.closed = true;
    }

    /// Cancels all outstanding work and forgets the attribute table.
    pub(super) fn release(&mut self) {
        let cancelled = self.queue.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding operations");
        }
        if let Some(waiter) = self.discovery.take() {
            let _ = waiter.responder.send(Err(OperationError::Cancelled {
                kind: OperationKind::DiscoverServices,
            }));
        }
        self.clear_table();
    }

    /// Resolves the discovery in progress and applies its outcome to the state machine.
    pub(super) fn finish_discovery(
        &mut self,
        outcome: Result<Vec<Service>, OperationError>,
    ) {
        let Some(waiter) = self.discovery.take() else {
            return;
        };

        match outcome {
            Ok(services) => {
                self.table
                    .send_replace(Arc::new(AttributeTable::from_services(services.clone())));
                self.machine.discovery_finished(true);
                let _ = waiter
                    .responder
                    .send(Ok(OperationOutput::Services(services)));
            }
            Err(error) => {
                warn!(%error, "service discovery failed; disconnecting");
                self.machine.discovery_finished(false);
                self.release();
                if let Err(link_error) = self.link.disconnect() {
                    debug!(%link_error, "link driver rejected forced disconnect");
                }
                let _ = waiter.responder.send(Err(error));
            }
        }
    }

    pub(super) fn cache_value(&mut self, handle: AttributeHandle, value: &[u8]) -> bool {
        self.table
            .send_if_modified(|table| Arc::make_mut(table).update_value(handle, value))
    }

    fn clear_table(&mut self) {
        self.table.send_if_modified(|table| {
            if table.is_empty() {
                return false;
            }
            Arc::make_mut(table).clear();
            true
        });
    }

    /// The earliest instant at which [`SessionCore::expire`] has work to do.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let discovery = self
            .discovery
            .as_ref()
            .and_then(|waiter| waiter.deadline);
        match (self.queue.deadline(), discovery) {
            (Some(operation), Some(discovery)) => Some(operation.min(discovery)),
            (operation, discovery) => operation.or(discovery),
        }
    }

    /// Fails whatever has outlived its deadline.
    pub(crate) fn expire(&mut self, now: Instant) {
        self.queue.expire(self.link.as_mut(), now);

        let discovery_expired = self
            .discovery
            .as_ref()
            .and_then(|waiter| waiter.deadline)
            .is_some_and(|deadline| deadline <= now);
        if discovery_expired {
            let timeout = self.config.discovery_timeout().unwrap_or_default();
            self.finish_discovery(Err(OperationError::Timeout {
                kind: OperationKind::DiscoverServices,
                timeout,
            }));
        }
    }
}
