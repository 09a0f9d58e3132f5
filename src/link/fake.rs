use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::time::sleep;
use tracing::trace;

use super::fixture::{NotificationScript, PeripheralFixture};
use super::{DeviceAddress, LinkBackend, LinkCommand, LinkDriver};
use crate::error::LinkError;
use crate::gatt::{
    AttributeHandle, ConnectionPriority, LinkEvent, LinkEventSender, LinkState, Service, Status,
    WriteType,
};

const DEFAULT_RSSI: i16 = -60;
const DEFAULT_MAX_MTU: u16 = 517;

/// Behaviour of a scripted in-memory peripheral.
#[derive(Debug, Clone, Builder)]
pub struct FakePeripheral {
    #[builder(default = PeripheralFixture::default().into())]
    services: Vec<Service>,
    #[builder(default = DEFAULT_RSSI)]
    rssi: i16,
    /// Largest MTU the peripheral agrees to.
    #[builder(default = DEFAULT_MAX_MTU)]
    max_mtu: u16,
    #[builder(default)]
    supports_cache_refresh: bool,
    /// Delay before each answer; zero answers inline.
    #[builder(default)]
    response_delay: Duration,
    /// Requests to these handles are accepted and never answered.
    #[builder(default)]
    unresponsive_handles: Vec<AttributeHandle>,
    #[builder(default)]
    failing_handles: Vec<(AttributeHandle, Status)>,
    #[builder(default = true)]
    discovery_succeeds: bool,
    #[builder(default = true)]
    accepts_connections: bool,
    /// When `false` nothing is answered; tests inject events through the controller.
    #[builder(default = true)]
    auto_respond: bool,
    #[builder(default)]
    notifications: NotificationScript,
}

impl Default for FakePeripheral {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
struct FakeLinkState {
    values: HashMap<AttributeHandle, Vec<u8>>,
    events: Option<LinkEventSender>,
    commands: Vec<LinkCommand>,
    outstanding: usize,
    max_outstanding: usize,
    closed: bool,
}

fn lock(state: &Mutex<FakeLinkState>) -> MutexGuard<'_, FakeLinkState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Link driver that plays the part of a peripheral entirely in memory.
#[derive(Debug)]
pub struct FakeLinkDriver {
    peripheral: FakePeripheral,
    state: Arc<Mutex<FakeLinkState>>,
}

impl FakeLinkDriver {
    /// Creates a driver plus a controller observing the same peripheral.
    #[must_use]
    pub fn new(peripheral: FakePeripheral) -> (Self, FakeLinkController) {
        let values = peripheral
            .services
            .iter()
            .flat_map(Service::characteristics)
            .flat_map(|characteristic| {
                let value = (
                    characteristic.handle(),
                    characteristic.value().unwrap_or_default().to_vec(),
                );
                let descriptors = characteristic.descriptors().iter().map(|descriptor| {
                    (
                        descriptor.handle(),
                        descriptor.value().unwrap_or_default().to_vec(),
                    )
                });
                std::iter::once(value).chain(descriptors).collect::<Vec<_>>()
            })
            .collect();
        let state = Arc::new(Mutex::new(FakeLinkState {
            values,
            ..FakeLinkState::default()
        }));

        (
            Self {
                peripheral,
                state: state.clone(),
            },
            FakeLinkController { state },
        )
    }

    /// Records `command`, failing once the driver has been closed.
    fn record(&self, command: LinkCommand) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(LinkError::Closed);
        }
        trace!(?command, "fake link command");
        state.commands.push(command);
        Ok(())
    }

    /// Sends `answer` (plus any follow-up events) back to the session.
    fn respond(&self, answer: LinkEvent, follow_ups: Vec<LinkEvent>) {
        let sender = {
            let mut state = lock(&self.state);
            state.outstanding += 1;
            state.max_outstanding = state.max_outstanding.max(state.outstanding);
            if !self.peripheral.auto_respond {
                return;
            }
            state.events.clone()
        };
        let Some(sender) = sender else {
            return;
        };

        let events: Vec<LinkEvent> = std::iter::once(answer).chain(follow_ups).collect();
        let delay = self.peripheral.response_delay;
        if delay.is_zero() {
            deliver(&self.state, &sender, events);
        } else {
            let state = self.state.clone();
            tokio::spawn(async move {
                sleep(delay).await;
                deliver(&state, &sender, events);
            });
        }
    }

    /// Marks a request as accepted without ever answering it.
    fn swallow(&self) {
        let mut state = lock(&self.state);
        state.outstanding += 1;
        state.max_outstanding = state.max_outstanding.max(state.outstanding);
    }

    fn check_handle(&self, handle: AttributeHandle) -> Result<HandleBehaviour, LinkError> {
        if !lock(&self.state).values.contains_key(&handle) {
            return Err(LinkError::UnknownHandle { handle });
        }
        if self.peripheral.unresponsive_handles.contains(&handle) {
            return Ok(HandleBehaviour::Silent);
        }
        Ok(self
            .peripheral
            .failing_handles
            .iter()
            .find(|(candidate, _)| *candidate == handle)
            .map_or(HandleBehaviour::Answer(Status::Success), |(_, status)| {
                HandleBehaviour::Answer(*status)
            }))
    }
}

#[derive(Debug, Clone, Copy)]
enum HandleBehaviour {
    Answer(Status),
    Silent,
}

fn deliver(state: &Mutex<FakeLinkState>, sender: &LinkEventSender, events: Vec<LinkEvent>) {
    {
        let mut state = lock(state);
        state.outstanding = state.outstanding.saturating_sub(1);
    }
    for event in events {
        sender.send(event);
    }
}

impl LinkDriver for FakeLinkDriver {
    fn connect(
        &mut self,
        address: &DeviceAddress,
        events: LinkEventSender,
    ) -> Result<(), LinkError> {
        self.record(LinkCommand::Connect {
            address: address.clone(),
        })?;
        lock(&self.state).events = Some(events);
        let answer = if self.peripheral.accepts_connections {
            LinkEvent::ConnectionStateChanged {
                status: Status::Success,
                state: LinkState::Connected,
            }
        } else {
            LinkEvent::ConnectionStateChanged {
                status: Status::Failure,
                state: LinkState::Disconnected,
            }
        };
        self.respond(answer, Vec::new());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.record(LinkCommand::Disconnect)?;
        self.respond(
            LinkEvent::ConnectionStateChanged {
                status: Status::Success,
                state: LinkState::Disconnected,
            },
            Vec::new(),
        );
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), LinkError> {
        self.record(LinkCommand::DiscoverServices)?;
        let answer = if self.peripheral.discovery_succeeds {
            LinkEvent::ServicesDiscovered {
                status: Status::Success,
                services: self.peripheral.services.clone(),
            }
        } else {
            LinkEvent::ServicesDiscovered {
                status: Status::Failure,
                services: Vec::new(),
            }
        };
        self.respond(answer, Vec::new());
        Ok(())
    }

    fn read_attribute(&mut self, handle: AttributeHandle) -> Result<(), LinkError> {
        let behaviour = self.check_handle(handle)?;
        self.record(LinkCommand::ReadAttribute { handle })?;
        match behaviour {
            HandleBehaviour::Silent => self.swallow(),
            HandleBehaviour::Answer(status) => {
                let value = if status.is_success() {
                    lock(&self.state)
                        .values
                        .get(&handle)
                        .cloned()
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                self.respond(
                    LinkEvent::AttributeRead {
                        handle,
                        status,
                        value,
                    },
                    Vec::new(),
                );
            }
        }
        Ok(())
    }

    fn write_attribute(
        &mut self,
        handle: AttributeHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), LinkError> {
        let behaviour = self.check_handle(handle)?;
        self.record(LinkCommand::WriteAttribute {
            handle,
            value: value.to_vec(),
            write_type,
        })?;
        match behaviour {
            HandleBehaviour::Silent => self.swallow(),
            HandleBehaviour::Answer(status) => {
                if status.is_success() {
                    lock(&self.state).values.insert(handle, value.to_vec());
                }
                self.respond(LinkEvent::AttributeWritten { handle, status }, Vec::new());
            }
        }
        Ok(())
    }

    fn set_notification(&mut self, handle: AttributeHandle, enable: bool) -> Result<(), LinkError> {
        let behaviour = self.check_handle(handle)?;
        self.record(LinkCommand::SetNotification { handle, enable })?;
        match behaviour {
            HandleBehaviour::Silent => self.swallow(),
            HandleBehaviour::Answer(status) => {
                let follow_ups = if enable && status.is_success() {
                    self.peripheral
                        .notifications
                        .payloads_for(handle)
                        .map(|payload| LinkEvent::CharacteristicChanged {
                            handle,
                            value: payload.to_vec(),
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                self.respond(
                    LinkEvent::NotificationSet {
                        handle,
                        status,
                        enabled: enable,
                    },
                    follow_ups,
                );
            }
        }
        Ok(())
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), LinkError> {
        self.record(LinkCommand::RequestMtu { mtu })?;
        self.respond(
            LinkEvent::MtuChanged {
                status: Status::Success,
                mtu: mtu.min(self.peripheral.max_mtu),
            },
            Vec::new(),
        );
        Ok(())
    }

    fn request_connection_priority(
        &mut self,
        priority: ConnectionPriority,
    ) -> Result<(), LinkError> {
        self.record(LinkCommand::RequestConnectionPriority { priority })?;
        self.respond(
            LinkEvent::ConnectionPriorityChanged {
                status: Status::Success,
                priority,
            },
            Vec::new(),
        );
        Ok(())
    }

    fn read_rssi(&mut self) -> Result<(), LinkError> {
        self.record(LinkCommand::ReadRssi)?;
        self.respond(
            LinkEvent::RemoteRssiRead {
                status: Status::Success,
                rssi: self.peripheral.rssi,
            },
            Vec::new(),
        );
        Ok(())
    }

    fn supports_cache_refresh(&self) -> bool {
        self.peripheral.supports_cache_refresh
    }

    fn refresh_cache(&mut self) -> Result<(), LinkError> {
        self.record(LinkCommand::RefreshCache)
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.commands.push(LinkCommand::Close);
        state.events = None;
        state.closed = true;
    }
}

/// Test-side view of a [`FakeLinkDriver`]: inspects what the session sent and injects events.
#[derive(Debug, Clone)]
pub struct FakeLinkController {
    state: Arc<Mutex<FakeLinkState>>,
}

impl FakeLinkController {
    /// Every command the session has issued so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<LinkCommand> {
        lock(&self.state).commands.clone()
    }

    /// Highest number of requests the link was ever asked to hold unanswered at once.
    #[must_use]
    pub fn max_outstanding(&self) -> usize {
        lock(&self.state).max_outstanding
    }

    /// Current value of an attribute on the peripheral side.
    #[must_use]
    pub fn value(&self, handle: AttributeHandle) -> Option<Vec<u8>> {
        lock(&self.state).values.get(&handle).cloned()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Delivers `event` to the session as if the link had raised it.
    ///
    /// Returns `false` when no session is listening.
    pub fn emit(&self, event: LinkEvent) -> bool {
        let sender = {
            let mut state = lock(&self.state);
            state.outstanding = state.outstanding.saturating_sub(1);
            state.events.clone()
        };
        sender.is_some_and(|sender| sender.send(event))
    }

    /// Pushes an unsolicited notification.
    pub fn notify(&self, handle: AttributeHandle, value: impl Into<Vec<u8>>) -> bool {
        let sender = lock(&self.state).events.clone();
        sender.is_some_and(|sender| {
            sender.send(LinkEvent::CharacteristicChanged {
                handle,
                value: value.into(),
            })
        })
    }

    /// Drops the link from the peripheral side.
    pub fn drop_link(&self, status: Status) -> bool {
        self.emit(LinkEvent::ConnectionStateChanged {
            status,
            state: LinkState::Disconnected,
        })
    }
}

/// Opens [`FakeLinkDriver`]s for the command-line `--fake` mode.
#[derive(Debug)]
pub struct FakeLinkBackend {
    peripheral: FakePeripheral,
}

impl FakeLinkBackend {
    #[must_use]
    pub fn new(peripheral: FakePeripheral) -> Self {
        Self { peripheral }
    }
}

#[async_trait]
impl LinkBackend for FakeLinkBackend {
    async fn open(self: Box<Self>) -> Result<Box<dyn LinkDriver>, LinkError> {
        let (driver, _controller) = FakeLinkDriver::new(self.peripheral);
        Ok(Box::new(driver))
    }
}
