use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    self, Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::runtime::Handle;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

use super::{DeviceAddress, LinkBackend, LinkDriver};
use crate::error::LinkError;
use crate::gatt::{
    AttributeHandle, Characteristic, CharacteristicProperties, ConnectionPriority, DEFAULT_MTU,
    Descriptor, LinkEvent, LinkEventSender, LinkState, Service, Status, WriteType,
};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Opens a [`LinkDriver`] over the host's Bluetooth adapters.
#[derive(Debug, Default)]
pub struct BtleplugBackend;

#[async_trait]
impl LinkBackend for BtleplugBackend {
    #[instrument(skip(self), level = "debug")]
    async fn open(self: Box<Self>) -> Result<Box<dyn LinkDriver>, LinkError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(LinkError::NoAdapters);
        }
        debug!(adapter_count = adapters.len(), "opened BLE adapters");
        Ok(Box::new(BtleplugLinkDriver::new(adapters, Handle::current())))
    }
}

#[derive(Debug, Clone)]
enum AttributeTarget {
    Characteristic(api::Characteristic),
    Descriptor(api::Descriptor),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Link driver backed by `btleplug`; each request runs as its own task and reports back
/// through the session's event sender.
#[derive(Debug)]
struct BtleplugLinkDriver {
    runtime: Handle,
    adapters: Vec<Adapter>,
    peripheral: Arc<Mutex<Option<Peripheral>>>,
    targets: Arc<Mutex<HashMap<AttributeHandle, AttributeTarget>>>,
    events: Option<LinkEventSender>,
    shutdown: CancellationToken,
    /// Cancelled by `disconnect`; scopes the current connect attempt and its watchers.
    link: CancellationToken,
}

impl BtleplugLinkDriver {
    fn new(adapters: Vec<Adapter>, runtime: Handle) -> Self {
        Self {
            runtime,
            adapters,
            peripheral: Arc::new(Mutex::new(None)),
            targets: Arc::new(Mutex::new(HashMap::new())),
            events: None,
            link: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn events(&self) -> Result<LinkEventSender, LinkError> {
        self.events.clone().ok_or(LinkError::NotConnected)
    }

    fn connected_peripheral(&self) -> Result<Peripheral, LinkError> {
        lock(&self.peripheral)
            .clone()
            .ok_or(LinkError::NotConnected)
    }

    fn target(&self, handle: AttributeHandle) -> Result<AttributeTarget, LinkError> {
        lock(&self.targets)
            .get(&handle)
            .cloned()
            .ok_or(LinkError::UnknownHandle { handle })
    }

    /// Runs `request` in the background and sends the event it produces.
    fn spawn<F>(&self, name: &'static str, request: F) -> Result<(), LinkError>
    where
        F: Future<Output = LinkEvent> + Send + 'static,
    {
        let events = self.events()?;
        let shutdown = self.shutdown.clone();
        self.runtime.spawn(
            async move {
                if let Some(event) = shutdown.run_until_cancelled(request).await {
                    events.send(event);
                }
            }
            .instrument(info_span!("btleplug_request", request = name)),
        );
        Ok(())
    }
}

impl LinkDriver for BtleplugLinkDriver {
    fn connect(
        &mut self,
        address: &DeviceAddress,
        events: LinkEventSender,
    ) -> Result<(), LinkError> {
        if self.shutdown.is_cancelled() {
            return Err(LinkError::Closed);
        }
        self.events = Some(events.clone());

        let link = self.shutdown.child_token();
        self.link = link.clone();
        let adapters = self.adapters.clone();
        let address = address.clone();
        let slot = self.peripheral.clone();
        let targets = self.targets.clone();
        self.runtime.spawn(
            async move {
                let Some(located) = link
                    .run_until_cancelled(locate_and_connect(&adapters, &address))
                    .await
                else {
                    debug!(%address, "connect abandoned while scanning");
                    stop_scans(&adapters).await;
                    return;
                };
                let event = match located {
                    Ok((adapter, peripheral)) => {
                        if let Err(peripheral) =
                            store_unless_released(&slot, &link, peripheral.clone())
                        {
                            debug!(%address, "link released while connecting; dropping the connection");
                            if let Err(error) = peripheral.disconnect().await {
                                debug!(%error, "peripheral disconnect failed");
                            }
                            return;
                        }
                        info!(%address, "connected to peripheral");
                        watch_link(&adapter, &peripheral, targets, events.clone(), link).await;
                        LinkEvent::ConnectionStateChanged {
                            status: Status::Success,
                            state: LinkState::Connected,
                        }
                    }
                    Err(error) => {
                        warn!(%address, %error, "failed to connect to peripheral");
                        LinkEvent::ConnectionStateChanged {
                            status: status_for(&error),
                            state: LinkState::Disconnected,
                        }
                    }
                };
                events.send(event);
            }
            .instrument(info_span!("btleplug_request", request = "connect")),
        );
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.link.cancel();
        let peripheral = lock(&self.peripheral).take();
        lock(&self.targets).clear();
        self.spawn("disconnect", async move {
            if let Some(peripheral) = peripheral
                && let Err(error) = peripheral.disconnect().await
            {
                debug!(%error, "peripheral disconnect failed; treating the link as gone");
            }
            LinkEvent::ConnectionStateChanged {
                status: Status::Success,
                state: LinkState::Disconnected,
            }
        })
    }

    fn discover_services(&mut self) -> Result<(), LinkError> {
        let peripheral = self.connected_peripheral()?;
        let targets = self.targets.clone();
        self.spawn("discover_services", async move {
            if let Err(error) = peripheral.discover_services().await {
                warn!(%error, "service discovery failed");
                return LinkEvent::ServicesDiscovered {
                    status: status_for(&error),
                    services: Vec::new(),
                };
            }
            let (services, discovered) = map_services(&peripheral.services());
            *lock(&targets) = discovered;
            LinkEvent::ServicesDiscovered {
                status: Status::Success,
                services,
            }
        })
    }

    fn read_attribute(&mut self, handle: AttributeHandle) -> Result<(), LinkError> {
        let target = self.target(handle)?;
        let peripheral = self.connected_peripheral()?;
        self.spawn("read_attribute", async move {
            let read = match &target {
                AttributeTarget::Characteristic(characteristic) => {
                    peripheral.read(characteristic).await
                }
                AttributeTarget::Descriptor(descriptor) => {
                    peripheral.read_descriptor(descriptor).await
                }
            };
            match read {
                Ok(value) => LinkEvent::AttributeRead {
                    handle,
                    status: Status::Success,
                    value,
                },
                Err(error) => {
                    debug!(%handle, %error, "attribute read failed");
                    LinkEvent::AttributeRead {
                        handle,
                        status: status_for(&error),
                        value: Vec::new(),
                    }
                }
            }
        })
    }

    fn write_attribute(
        &mut self,
        handle: AttributeHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), LinkError> {
        let target = self.target(handle)?;
        let peripheral = self.connected_peripheral()?;
        let value = value.to_vec();
        self.spawn("write_attribute", async move {
            let written = match &target {
                AttributeTarget::Characteristic(characteristic) => {
                    let write_type = match write_type {
                        WriteType::WithResponse => api::WriteType::WithResponse,
                        WriteType::WithoutResponse => api::WriteType::WithoutResponse,
                    };
                    peripheral.write(characteristic, &value, write_type).await
                }
                AttributeTarget::Descriptor(descriptor) => {
                    peripheral.write_descriptor(descriptor, &value).await
                }
            };
            let status = written.map_or_else(
                |error| {
                    debug!(%handle, %error, "attribute write failed");
                    status_for(&error)
                },
                |()| Status::Success,
            );
            LinkEvent::AttributeWritten { handle, status }
        })
    }

    fn set_notification(&mut self, handle: AttributeHandle, enable: bool) -> Result<(), LinkError> {
        let AttributeTarget::Characteristic(characteristic) = self.target(handle)? else {
            return Err(LinkError::UnknownHandle { handle });
        };
        let peripheral = self.connected_peripheral()?;
        self.spawn("set_notification", async move {
            let result = if enable {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            LinkEvent::NotificationSet {
                handle,
                status: result.map_or_else(|error| status_for(&error), |()| Status::Success),
                enabled: enable,
            }
        })
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), LinkError> {
        trace!(mtu, "MTU exchange is negotiated by the platform");
        self.events()?.send(LinkEvent::MtuChanged {
            status: Status::RequestNotSupported,
            mtu: DEFAULT_MTU,
        });
        Ok(())
    }

    fn request_connection_priority(
        &mut self,
        priority: ConnectionPriority,
    ) -> Result<(), LinkError> {
        self.events()?.send(LinkEvent::ConnectionPriorityChanged {
            status: Status::RequestNotSupported,
            priority,
        });
        Ok(())
    }

    fn read_rssi(&mut self) -> Result<(), LinkError> {
        let peripheral = self.connected_peripheral()?;
        self.spawn("read_rssi", async move {
            match peripheral.properties().await {
                Ok(Some(properties)) => match properties.rssi {
                    Some(rssi) => LinkEvent::RemoteRssiRead {
                        status: Status::Success,
                        rssi,
                    },
                    None => LinkEvent::RemoteRssiRead {
                        status: Status::RequestNotSupported,
                        rssi: 0,
                    },
                },
                Ok(None) => LinkEvent::RemoteRssiRead {
                    status: Status::Failure,
                    rssi: 0,
                },
                Err(error) => LinkEvent::RemoteRssiRead {
                    status: status_for(&error),
                    rssi: 0,
                },
            }
        })
    }

    fn close(&mut self) {
        self.shutdown.cancel();
        self.events = None;
        lock(&self.targets).clear();
        if let Some(peripheral) = lock(&self.peripheral).take() {
            self.runtime.spawn(async move {
                if let Err(error) = peripheral.disconnect().await {
                    debug!(%error, "peripheral disconnect on close failed");
                }
            });
        }
    }
}

/// Polls every adapter until a peripheral matching `address` shows up, then connects to it.
#[instrument(skip(adapters), level = "debug", fields(%address))]
async fn locate_and_connect(
    adapters: &[Adapter],
    address: &DeviceAddress,
) -> Result<(Adapter, Peripheral), btleplug::Error> {
    for adapter in adapters {
        adapter.start_scan(ScanFilter::default()).await?;
    }

    let (adapter, peripheral) = 'scan: loop {
        for adapter in adapters {
            for peripheral in adapter.peripherals().await? {
                if address.matches(&peripheral.address().to_string())
                    || address.matches(&peripheral.id().to_string())
                {
                    break 'scan (adapter.clone(), peripheral);
                }
            }
        }
        sleep(SCAN_POLL_INTERVAL).await;
    };

    stop_scans(adapters).await;
    if !peripheral.is_connected().await? {
        peripheral.connect().await?;
    }
    Ok((adapter, peripheral))
}

async fn stop_scans(adapters: &[Adapter]) {
    for adapter in adapters {
        if let Err(error) = adapter.stop_scan().await {
            debug!(%error, "failed to stop adapter scan cleanly");
        }
    }
}

/// Publishes a freshly connected peripheral unless `link` was released meanwhile, in which
/// case the peripheral is handed back to be torn down.
fn store_unless_released<P>(
    slot: &Mutex<Option<P>>,
    link: &CancellationToken,
    peripheral: P,
) -> Result<(), P> {
    let mut slot = lock(slot);
    if link.is_cancelled() {
        return Err(peripheral);
    }
    *slot = Some(peripheral);
    Ok(())
}

/// Forwards notifications and adapter-side disconnects for `peripheral` until `shutdown` fires.
async fn watch_link(
    adapter: &Adapter,
    peripheral: &Peripheral,
    targets: Arc<Mutex<HashMap<AttributeHandle, AttributeTarget>>>,
    events: LinkEventSender,
    shutdown: CancellationToken,
) {
    match peripheral.notifications().await {
        Ok(mut notifications) => {
            let events = events.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while let Some(Some(notification)) =
                    shutdown.run_until_cancelled(notifications.next()).await
                {
                    let handle = lock(&targets).iter().find_map(|(handle, target)| {
                        matches!(target, AttributeTarget::Characteristic(characteristic)
                            if characteristic.uuid == notification.uuid
                                && characteristic.service_uuid == notification.service_uuid)
                        .then_some(*handle)
                    });
                    let Some(handle) = handle else {
                        trace!(uuid = %notification.uuid, "notification for an unmapped characteristic");
                        continue;
                    };
                    events.send(LinkEvent::CharacteristicChanged {
                        handle,
                        value: notification.value,
                    });
                }
            });
        }
        Err(error) => warn!(%error, "notification stream unavailable"),
    }

    match adapter.events().await {
        Ok(mut adapter_events) => {
            let id = peripheral.id();
            tokio::spawn(async move {
                while let Some(Some(event)) =
                    shutdown.run_until_cancelled(adapter_events.next()).await
                {
                    if let CentralEvent::DeviceDisconnected(disconnected) = event
                        && disconnected == id
                    {
                        info!("peripheral dropped the link");
                        events.send(LinkEvent::ConnectionStateChanged {
                            status: Status::Failure,
                            state: LinkState::Disconnected,
                        });
                        break;
                    }
                }
            });
        }
        Err(error) => warn!(%error, "adapter event stream unavailable"),
    }
}

fn status_for(error: &btleplug::Error) -> Status {
    match error {
        btleplug::Error::NotSupported(_) => Status::RequestNotSupported,
        btleplug::Error::PermissionDenied => Status::InsufficientAuthentication,
        _ => Status::Failure,
    }
}

fn properties_from(flags: CharPropFlags) -> CharacteristicProperties {
    const MAPPING: [(CharPropFlags, CharacteristicProperties); 8] = [
        (CharPropFlags::BROADCAST, CharacteristicProperties::BROADCAST),
        (CharPropFlags::READ, CharacteristicProperties::READ),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        ),
        (CharPropFlags::WRITE, CharacteristicProperties::WRITE),
        (CharPropFlags::NOTIFY, CharacteristicProperties::NOTIFY),
        (CharPropFlags::INDICATE, CharacteristicProperties::INDICATE),
        (
            CharPropFlags::AUTHENTICATED_SIGNED_WRITES,
            CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES,
        ),
        (
            CharPropFlags::EXTENDED_PROPERTIES,
            CharacteristicProperties::EXTENDED_PROPERTIES,
        ),
    ];
    MAPPING
        .iter()
        .filter(|(platform, _)| flags.contains(*platform))
        .fold(CharacteristicProperties::empty(), |properties, (_, ours)| {
            properties | *ours
        })
}

/// Numbers the platform's services the way an ATT database would: service, then per
/// characteristic a declaration, the value, and its descriptors.
fn map_services(
    services: &BTreeSet<api::Service>,
) -> (Vec<Service>, HashMap<AttributeHandle, AttributeTarget>) {
    let mut targets = HashMap::new();
    let mut next_handle: u16 = 1;
    let mut allocate = || {
        let handle = AttributeHandle::new(next_handle);
        next_handle = next_handle.saturating_add(1);
        handle
    };

    let mapped = services
        .iter()
        .map(|service| {
            let mut mapped = Service::new(allocate(), service.uuid, service.primary);
            for characteristic in &service.characteristics {
                let _declaration = allocate();
                let handle = allocate();
                targets.insert(
                    handle,
                    AttributeTarget::Characteristic(characteristic.clone()),
                );
                let mut ours = Characteristic::new(
                    handle,
                    characteristic.uuid,
                    properties_from(characteristic.properties),
                );
                for descriptor in &characteristic.descriptors {
                    let handle = allocate();
                    targets.insert(handle, AttributeTarget::Descriptor(descriptor.clone()));
                    ours = ours.with_descriptor(Descriptor::new(handle, descriptor.uuid));
                }
                mapped = mapped.with_characteristic(ours);
            }
            mapped
        })
        .collect();
    (mapped, targets)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::gatt::uuid_from_u16;

    #[test]
    fn connected_peripheral_is_published_while_the_link_is_live() {
        let slot = Mutex::new(None);
        let link = CancellationToken::new();

        assert_eq!(Ok(()), store_unless_released(&slot, &link, "peripheral"));
        assert_eq!(Some("peripheral"), *lock(&slot));
    }

    #[test]
    fn peripheral_connected_after_disconnect_is_handed_back() {
        let slot = Mutex::new(None);
        let link = CancellationToken::new();
        link.cancel();

        assert_eq!(Err("peripheral"), store_unless_released(&slot, &link, "peripheral"));
        assert_eq!(None, *lock(&slot));
    }

    #[rstest]
    #[case(CharPropFlags::READ, CharacteristicProperties::READ)]
    #[case(
        CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::NOTIFY,
        CharacteristicProperties::WRITE_WITHOUT_RESPONSE | CharacteristicProperties::NOTIFY
    )]
    #[case(CharPropFlags::empty(), CharacteristicProperties::empty())]
    fn platform_flags_map_onto_characteristic_properties(
        #[case] flags: CharPropFlags,
        #[case] expected: CharacteristicProperties,
    ) {
        assert_eq!(expected, properties_from(flags));
    }

    #[test]
    fn services_get_sequential_handles() {
        let service_uuid = uuid_from_u16(0x180F);
        let characteristic_uuid = uuid_from_u16(0x2A19);
        let descriptor = api::Descriptor {
            uuid: uuid_from_u16(0x2902),
            service_uuid,
            characteristic_uuid,
        };
        let characteristic = api::Characteristic {
            uuid: characteristic_uuid,
            service_uuid,
            properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
            descriptors: BTreeSet::from([descriptor]),
        };
        let services = BTreeSet::from([api::Service {
            uuid: service_uuid,
            primary: true,
            characteristics: BTreeSet::from([characteristic]),
        }]);

        let (mapped, targets) = map_services(&services);

        assert_eq!(AttributeHandle::new(1), mapped[0].handle());
        let battery = &mapped[0].characteristics()[0];
        assert_eq!(AttributeHandle::new(3), battery.handle());
        assert_eq!(AttributeHandle::new(4), battery.descriptors()[0].handle());
        assert_eq!(2, targets.len());
        assert!(matches!(
            targets.get(&AttributeHandle::new(4)),
            Some(AttributeTarget::Descriptor(_))
        ));
    }

    #[test]
    fn not_supported_errors_map_to_request_not_supported() {
        assert_eq!(
            Status::RequestNotSupported,
            status_for(&btleplug::Error::NotSupported("mtu".to_string()))
        );
        assert_eq!(Status::Failure, status_for(&btleplug::Error::DeviceNotFound));
    }
}
