use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::attribute::{AttributeHandle, Service};
use super::core::SessionCore;
use super::operation::{CompletionKey, OperationKind, OperationOutput};
use super::status::{ConnectionPriority, Status};
use crate::error::OperationError;

/// Physical link state reported by the driver.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display)]
pub enum LinkState {
    #[strum(to_string = "connected")]
    Connected,
    #[strum(to_string = "disconnected")]
    Disconnected,
}

/// Asynchronous notice from the link driver.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LinkEvent {
    ConnectionStateChanged {
        status: Status,
        state: LinkState,
    },
    ServicesDiscovered {
        status: Status,
        services: Vec<Service>,
    },
    /// Unsolicited notification or indication from the peer.
    CharacteristicChanged {
        handle: AttributeHandle,
        value: Vec<u8>,
    },
    AttributeRead {
        handle: AttributeHandle,
        status: Status,
        value: Vec<u8>,
    },
    AttributeWritten {
        handle: AttributeHandle,
        status: Status,
    },
    NotificationSet {
        handle: AttributeHandle,
        status: Status,
        enabled: bool,
    },
    RemoteRssiRead {
        status: Status,
        rssi: i16,
    },
    MtuChanged {
        status: Status,
        mtu: u16,
    },
    ConnectionPriorityChanged {
        status: Status,
        priority: ConnectionPriority,
    },
}

/// Handle a link driver uses to report events back to its session.
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    sender: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queues an event for the session; returns `false` once the session is gone.
    pub fn send(&self, event: LinkEvent) -> bool {
        match self.sender.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                trace!(?event, "session closed; dropping link event");
                false
            }
        }
    }
}

/// A value pushed by the peer for a characteristic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharacteristicNotification {
    pub handle: AttributeHandle,
    pub value: Vec<u8>,
}

impl SessionCore {
    /// Routes one link event; events are handled strictly in arrival order.
    pub(crate) fn handle_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::ConnectionStateChanged {
                status,
                state: LinkState::Connected,
            } if status.is_success() => self.on_link_connected(),
            LinkEvent::ConnectionStateChanged { status, state } => {
                self.on_link_disconnected(status, state);
            }
            LinkEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, services);
            }
            LinkEvent::CharacteristicChanged { handle, value } => {
                self.on_characteristic_changed(handle, value);
            }
            LinkEvent::AttributeRead {
                handle,
                status,
                value,
            } => {
                let cached = value.clone();
                let matched = self.complete(
                    CompletionKey::Read(handle),
                    status,
                    OperationOutput::Value(value),
                    now,
                );
                if matched && status.is_success() {
                    self.cache_value(handle, &cached);
                }
            }
            LinkEvent::AttributeWritten { handle, status } => {
                self.complete(CompletionKey::Write(handle), status, OperationOutput::Written, now);
            }
            LinkEvent::NotificationSet {
                handle,
                status,
                enabled,
            } => {
                self.complete(
                    CompletionKey::Notification(handle),
                    status,
                    OperationOutput::NotificationSet { enabled },
                    now,
                );
            }
            LinkEvent::RemoteRssiRead { status, rssi } => {
                self.complete(CompletionKey::Rssi, status, OperationOutput::Rssi(rssi), now);
            }
            LinkEvent::MtuChanged { status, mtu } => self.on_mtu_changed(status, mtu, now),
            LinkEvent::ConnectionPriorityChanged { status, priority } => {
                if self.complete(
                    CompletionKey::Priority,
                    status,
                    OperationOutput::Priority(priority),
                    now,
                ) && status.is_success()
                {
                    self.priority = priority;
                }
            }
        }
    }

    fn complete(
        &mut self,
        key: CompletionKey,
        status: Status,
        output: OperationOutput,
        now: Instant,
    ) -> bool {
        self.queue
            .complete(key, status, output, self.link.as_mut(), now)
    }

    fn on_link_connected(&mut self) {
        if self.machine.link_connected() {
            info!("link connected");
        } else {
            debug!(state = %self.machine.state(), "ignoring link-connected event");
        }
    }

    fn on_link_disconnected(&mut self, status: Status, state: LinkState) {
        if self.machine.link_lost() {
            info!(%status, %state, "link lost");
            self.release();
        } else {
            trace!(%status, "ignoring link-down event for a terminal session");
        }
    }

    fn on_services_discovered(&mut self, status: Status, services: Vec<Service>) {
        if self.discovery.is_none() {
            warn!(%status, "services discovered without a discovery in progress; ignoring");
            return;
        }

        if status.is_success() {
            debug!(service_count = services.len(), "service discovery finished");
            self.finish_discovery(Ok(services));
        } else {
            self.finish_discovery(Err(OperationError::from_status(
                OperationKind::DiscoverServices,
                status,
            )));
        }
    }

    fn on_characteristic_changed(&mut self, handle: AttributeHandle, value: Vec<u8>) {
        if !self.machine.state().has_link() {
            trace!(%handle, "notification after link teardown; ignoring");
            return;
        }
        if !self.cache_value(handle, &value) {
            trace!(%handle, "notification for an attribute outside the table");
        }
        if self
            .notifications
            .send(CharacteristicNotification { handle, value })
            .is_err()
        {
            trace!(%handle, "no notification subscribers");
        }
    }

    fn on_mtu_changed(&mut self, status: Status, mtu: u16, now: Instant) {
        let requested = self
            .queue
            .in_flight()
            .is_some_and(|request| request.kind() == OperationKind::RequestMtu);
        if status.is_success() {
            debug!(mtu, "link MTU changed");
            self.mtu = mtu;
        }
        if requested {
            self.complete(CompletionKey::Mtu, status, OperationOutput::Mtu(mtu), now);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    use super::*;
    use crate::gatt::core::SessionObservers;
    use crate::gatt::{
        Characteristic, CharacteristicProperties, SessionConfig, SessionId, SessionState,
        uuid_from_u16,
    };
    use crate::link::{DeviceAddress, FakeLinkDriver, FakePeripheral};

    fn services() -> Vec<Service> {
        vec![
            Service::new(AttributeHandle::new(1), uuid_from_u16(0x180F), true).with_characteristic(
                Characteristic::new(
                    AttributeHandle::new(3),
                    uuid_from_u16(0x2A19),
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                ),
            ),
        ]
    }

    fn ready_core() -> (SessionCore, SessionObservers) {
        let peripheral = FakePeripheral::builder().auto_respond(false).build();
        let (driver, _controller) = FakeLinkDriver::new(peripheral);
        let (events, _receiver) = LinkEventSender::channel();
        let (mut core, observers) = SessionCore::new(
            SessionId::next(DeviceAddress::new("AA:BB")),
            Box::new(driver),
            SessionConfig::default(),
            events,
            Arc::new(Notify::new()),
        );
        let now = Instant::now();
        core.connect().expect("idle session should connect");
        core.handle_event(
            LinkEvent::ConnectionStateChanged {
                status: Status::Success,
                state: LinkState::Connected,
            },
            now,
        );
        let _discovery = core
            .discover_services(now)
            .expect("connected session should discover");
        core.handle_event(
            LinkEvent::ServicesDiscovered {
                status: Status::Success,
                services: services(),
            },
            now,
        );
        assert_eq!(SessionState::Ready, core.state());
        (core, observers)
    }

    #[test]
    fn unsolicited_notification_updates_cache_without_completing_operations() {
        let (mut core, mut observers) = ready_core();
        let mut notifications = observers.notifications.subscribe();
        let now = Instant::now();
        let mut pending = core
            .submit(
                crate::gatt::OperationRequest::ReadCharacteristic {
                    handle: AttributeHandle::new(3),
                },
                now,
            )
            .expect("ready session should accept reads");

        core.handle_event(
            LinkEvent::CharacteristicChanged {
                handle: AttributeHandle::new(3),
                value: vec![0x10],
            },
            now,
        );

        let table = observers.table.borrow_and_update().clone();
        let characteristic = table
            .characteristic(AttributeHandle::new(3))
            .expect("battery level should be in the table");
        assert_eq!(Some([0x10].as_slice()), characteristic.value());
        assert_matches!(
            pending.try_recv(),
            Err(tokio::sync::oneshot::error::TryRecvError::Empty)
        );
        assert_matches!(
            notifications.try_recv(),
            Ok(notification) if notification == CharacteristicNotification {
                handle: AttributeHandle::new(3),
                value: vec![0x10],
            }
        );
    }

    #[test]
    fn unsolicited_mtu_change_updates_the_link_mtu() {
        let (mut core, _observers) = ready_core();
        core.handle_event(
            LinkEvent::MtuChanged {
                status: Status::Success,
                mtu: 185,
            },
            Instant::now(),
        );
        assert_eq!(185, core.info().mtu());
    }

    #[test]
    fn failed_discovery_forces_disconnect() {
        let peripheral = FakePeripheral::builder().auto_respond(false).build();
        let (driver, controller) = FakeLinkDriver::new(peripheral);
        let (events, _receiver) = LinkEventSender::channel();
        let (mut core, _observers) = SessionCore::new(
            SessionId::next(DeviceAddress::new("AA:BB")),
            Box::new(driver),
            SessionConfig::default(),
            events,
            Arc::new(Notify::new()),
        );
        let now = Instant::now();
        core.connect().expect("idle session should connect");
        core.handle_event(
            LinkEvent::ConnectionStateChanged {
                status: Status::Success,
                state: LinkState::Connected,
            },
            now,
        );
        let mut discovery = core
            .discover_services(now)
            .expect("connected session should discover");

        core.handle_event(
            LinkEvent::ServicesDiscovered {
                status: Status::Failure,
                services: Vec::new(),
            },
            now,
        );

        assert_eq!(SessionState::Disconnected, core.state());
        assert_eq!(
            Ok(Err(OperationError::LinkFailure {
                kind: OperationKind::DiscoverServices,
                status: Status::Failure,
            })),
            discovery.try_recv()
        );
        assert!(
            controller
                .commands()
                .contains(&crate::link::LinkCommand::Disconnect)
        );
    }

    #[test]
    fn link_drop_cancels_outstanding_operations() {
        let (mut core, observers) = ready_core();
        let now = Instant::now();
        let mut receivers: Vec<_> = [3, 3, 3]
            .into_iter()
            .map(|raw| {
                core.submit(
                    crate::gatt::OperationRequest::ReadCharacteristic {
                        handle: AttributeHandle::new(raw),
                    },
                    now,
                )
                .expect("ready session should accept reads")
            })
            .collect();

        core.handle_event(
            LinkEvent::ConnectionStateChanged {
                status: Status::Failure,
                state: LinkState::Disconnected,
            },
            now,
        );

        assert_eq!(SessionState::Disconnected, core.state());
        for receiver in &mut receivers {
            assert_matches!(
                receiver.try_recv(),
                Ok(Err(OperationError::Cancelled { .. }))
            );
        }
        assert!(observers.table.borrow().is_empty());
    }
}
