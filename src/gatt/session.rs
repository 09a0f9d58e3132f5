use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bon::Builder;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, instrument, trace, warn};
use uuid::Uuid;

use super::attribute::{AttributeHandle, AttributeTable, Characteristic, Service};
use super::core::{SessionCore, SessionInfo};
use super::dispatcher::{CharacteristicNotification, LinkEvent, LinkEventSender};
use super::operation::{
    OperationKind, OperationOutput, OperationRequest, Pending, mtu_output, rssi_output, services_output,
    status_output, value_output,
};
use super::state::SessionState;
use super::status::{ConnectionPriority, Status, WriteType};
use crate::error::{OperationError, SessionError};
use crate::link::{DeviceAddress, LinkDriver};

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Identity of one logical connection: the peer address plus a process-wide epoch.
///
/// Connecting to the same address again produces a new epoch, so stale handles to an old
/// session never compare equal to the new one.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, derive_more::Display)]
#[display("{address}#{epoch}")]
pub struct SessionId {
    address: DeviceAddress,
    epoch: u64,
}

impl SessionId {
    /// Draws a fresh identity for `address`.
    #[must_use]
    pub fn next(address: DeviceAddress) -> Self {
        Self {
            address,
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Tunables for a session.
#[derive(Debug, Clone, Eq, PartialEq, Builder)]
pub struct SessionConfig {
    #[builder(default = DEFAULT_OPERATION_TIMEOUT)]
    operation_timeout: Duration,
    /// Service discovery waits forever when unset.
    discovery_timeout: Option<Duration>,
    #[builder(default = DEFAULT_NOTIFICATION_CAPACITY)]
    notification_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SessionConfig {
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    #[must_use]
    pub fn discovery_timeout(&self) -> Option<Duration> {
        self.discovery_timeout
    }

    /// Notifications a slow subscriber may fall behind before it starts missing some.
    #[must_use]
    pub fn notification_capacity(&self) -> usize {
        self.notification_capacity
    }
}

fn lock(core: &Mutex<SessionCore>) -> MutexGuard<'_, SessionCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client-side session with one GATT peripheral.
///
/// Every method returns immediately. Failures that can be decided on the spot come back as
/// [`SessionError`]; everything that needs the peer is returned as a [`Pending`] that resolves
/// exactly once. Requests reach the link strictly one at a time, in submission order.
///
/// Dropping the session closes it.
#[derive(Debug)]
pub struct GattSession {
    id: SessionId,
    core: Arc<Mutex<SessionCore>>,
    state: watch::Receiver<SessionState>,
    table: watch::Receiver<Arc<AttributeTable>>,
    notifications: broadcast::Sender<CharacteristicNotification>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl GattSession {
    /// Creates an idle session and spawns its event loop on the current tokio runtime.
    pub fn new(address: DeviceAddress, link: Box<dyn LinkDriver>, config: SessionConfig) -> Self {
        let id = SessionId::next(address);
        let (events, receiver) = LinkEventSender::channel();
        let rearm = Arc::new(Notify::new());
        let (core, observers) = SessionCore::new(id.clone(), link, config, events, rearm.clone());
        let core = Arc::new(Mutex::new(core));
        let shutdown = CancellationToken::new();

        let span = info_span!("gatt_session", session = %id);
        let task = tokio::spawn(
            run_event_loop(core.clone(), receiver, rearm, shutdown.clone()).instrument(span),
        );

        Self {
            id,
            core,
            state: observers.state,
            table: observers.table,
            notifications: observers.notifications,
            shutdown,
            task: Some(task),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        self.id.address()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Waits until the session reaches `target` or a terminal state, returning the one reached.
    pub async fn wait_for_state(&self, target: SessionState) -> SessionState {
        let mut state = self.state.clone();
        match state
            .wait_for(|state| *state == target || state.is_terminal())
            .await
        {
            Ok(reached) => *reached,
            Err(_closed) => SessionState::Disconnected,
        }
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        lock(&self.core).info()
    }

    #[instrument(skip(self), fields(session = %self.id), err)]
    pub fn connect(&self) -> Result<(), SessionError> {
        lock(&self.core).connect()
    }

    /// Starts service discovery; the session becomes `Ready` when it succeeds.
    #[instrument(skip(self), fields(session = %self.id), err)]
    pub fn discover_services(&self) -> Result<Pending<Vec<Service>>, SessionError> {
        let receiver = lock(&self.core).discover_services(Instant::now())?;
        Ok(Pending::new(
            OperationKind::DiscoverServices,
            receiver,
            services_output,
        ))
    }

    /// Snapshot of the discovered services; empty unless the session is `Ready`.
    #[must_use]
    pub fn services(&self) -> Vec<Service> {
        self.table.borrow().services().to_vec()
    }

    #[must_use]
    pub fn attribute_table(&self) -> Arc<AttributeTable> {
        self.table.borrow().clone()
    }

    pub fn service(&self, uuid: Uuid) -> Result<Service, SessionError> {
        Ok(self.table.borrow().service(uuid)?.clone())
    }

    pub fn characteristic(&self, handle: AttributeHandle) -> Result<Characteristic, SessionError> {
        Ok(self.table.borrow().characteristic(handle)?.clone())
    }

    #[instrument(skip(self), fields(session = %self.id), err)]
    pub fn read_characteristic(
        &self,
        handle: AttributeHandle,
    ) -> Result<Pending<Vec<u8>>, SessionError> {
        self.submit(
            OperationRequest::ReadCharacteristic { handle },
            value_output,
        )
    }

    /// Write type used by [`GattSession::write_characteristic`]: unacknowledged only when the
    /// characteristic allows nothing else.
    #[must_use]
    pub fn default_write_type(&self, handle: AttributeHandle) -> WriteType {
        lock(&self.core).default_write_type(handle)
    }

    /// Writes with the type the characteristic's properties call for.
    #[instrument(skip(self, value), fields(session = %self.id, len = value.len()), err)]
    pub fn write_characteristic(
        &self,
        handle: AttributeHandle,
        value: &[u8],
    ) -> Result<Pending<Status>, SessionError> {
        let write_type = self.default_write_type(handle);
        self.write_characteristic_with(handle, value, write_type)
    }

    #[instrument(skip(self, value), fields(session = %self.id, len = value.len()), err)]
    pub fn write_characteristic_with(
        &self,
        handle: AttributeHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<Pending<Status>, SessionError> {
        self.submit(
            OperationRequest::WriteCharacteristic {
                handle,
                value: value.to_vec(),
                write_type,
            },
            status_output,
        )
    }

    #[instrument(skip(self), fields(session = %self.id), err)]
    pub fn read_descriptor(
        &self,
        handle: AttributeHandle,
    ) -> Result<Pending<Vec<u8>>, SessionError> {
        self.submit(OperationRequest::ReadDescriptor { handle }, value_output)
    }

    #[instrument(skip(self, value), fields(session = %self.id, len = value.len()), err)]
    pub fn write_descriptor(
        &self,
        handle: AttributeHandle,
        value: &[u8],
    ) -> Result<Pending<Status>, SessionError> {
        self.submit(
            OperationRequest::WriteDescriptor {
                handle,
                value: value.to_vec(),
            },
            status_output,
        )
    }

    #[instrument(skip(self), fields(session = %self.id), err)]
    pub fn read_remote_rssi(&self) -> Result<Pending<i16>, SessionError> {
        self.submit(OperationRequest::ReadRssi, rssi_output)
    }

    /// Asks the peer for a larger ATT MTU; resolves with the MTU actually negotiated.
    #[instrument(skip(self), fields(session = %self.id), err)]
    pub fn request_mtu(&self, mtu: u16) -> Result<Pending<u16>, SessionError> {
        self.submit(OperationRequest::RequestMtu { mtu }, mtu_output)
    }

    #[instrument(skip(self), fields(session = %self.id), err)]
    pub fn request_connection_priority(
        &self,
        priority: ConnectionPriority,
    ) -> Result<Pending<Status>, SessionError> {
        self.submit(OperationRequest::RequestPriority { priority }, status_output)
    }

    #[instrument(skip(self), fields(session = %self.id), err)]
    pub fn set_characteristic_notification(
        &self,
        handle: AttributeHandle,
        enable: bool,
    ) -> Result<Pending<Status>, SessionError> {
        self.submit(
            OperationRequest::SetNotification { handle, enable },
            status_output,
        )
    }

    /// Values pushed by the peer, in arrival order, from the moment of subscription.
    ///
    /// A subscriber that falls more than the configured capacity behind skips the oldest values.
    pub fn notifications(&self) -> impl Stream<Item = CharacteristicNotification> + use<> {
        BroadcastStream::new(self.notifications.subscribe()).filter_map(|received| match received
        {
            Ok(notification) => Some(notification),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "notification subscriber lagged behind");
                None
            }
        })
    }

    /// Drops the attribute cache and returns to `Connected`; rediscover before further
    /// attribute operations.
    #[instrument(skip(self), fields(session = %self.id), err)]
    pub fn refresh(&self) -> Result<(), SessionError> {
        lock(&self.core).refresh()
    }

    #[instrument(skip(self), fields(session = %self.id), err)]
    pub fn disconnect(&self) -> Result<(), SessionError> {
        lock(&self.core).disconnect()
    }

    /// Closes the session and waits for its event loop to stop.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn close(mut self) {
        lock(&self.core).close();
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(error) = task.await
        {
            warn!(%error, "session event loop ended abnormally");
        }
    }

    fn submit<T>(
        &self,
        request: OperationRequest,
        extract: fn(OperationKind, OperationOutput) -> Result<T, OperationError>,
    ) -> Result<Pending<T>, SessionError> {
        let kind = request.kind();
        let receiver = lock(&self.core).submit(request, Instant::now())?;
        Ok(Pending::new(kind, receiver, extract))
    }
}

impl Drop for GattSession {
    fn drop(&mut self) {
        lock(&self.core).close();
        self.shutdown.cancel();
    }
}

async fn run_event_loop(
    core: Arc<Mutex<SessionCore>>,
    mut events: UnboundedReceiver<LinkEvent>,
    rearm: Arc<Notify>,
    shutdown: CancellationToken,
) {
    debug!("session event loop started");
    loop {
        let deadline = lock(&core).next_deadline();
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                trace!(?event, "link event received");
                lock(&core).handle_event(event, Instant::now());
            }
            () = rearm.notified() => {}
            () = wait_for_deadline(deadline) => {
                lock(&core).expire(Instant::now());
            }
        }
    }
    debug!("session event loop stopped");
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn session_ids_for_the_same_address_never_repeat() {
        let address = DeviceAddress::new("AA:BB:CC:DD:EE:FF");
        let first = SessionId::next(address.clone());
        let second = SessionId::next(address);

        assert_eq!(first.address(), second.address());
        assert!(second.epoch() > first.epoch());
        assert_ne!(first, second);
    }

    #[test]
    fn default_config_uses_thirty_second_timeouts_and_no_discovery_limit() {
        let config = SessionConfig::default();
        assert_eq!(Duration::from_secs(30), config.operation_timeout());
        assert_eq!(None, config.discovery_timeout());
        assert_eq!(64, config.notification_capacity());
    }

    #[test]
    fn builder_overrides_individual_settings() {
        let config = SessionConfig::builder()
            .operation_timeout(Duration::from_secs(2))
            .discovery_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(Duration::from_secs(2), config.operation_timeout());
        assert_eq!(Some(Duration::from_secs(5)), config.discovery_timeout());
        assert_eq!(DEFAULT_NOTIFICATION_CAPACITY, config.notification_capacity());
    }
}
