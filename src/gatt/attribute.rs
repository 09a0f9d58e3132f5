use std::collections::HashMap;
use std::collections::hash_map::Entry;

use bitflags::bitflags;
use serde::Serialize;
use serde_with::hex::Hex;
use serde_with::{SerializeDisplay, serde_as};
use strum_macros::Display;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expands a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
///
/// ```
/// let battery = gatt_session::uuid_from_u16(0x180F);
/// assert_eq!("0000180f-0000-1000-8000-00805f9b34fb", battery.to_string());
/// ```
#[must_use]
pub fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96))
}

/// Link-level handle addressing one attribute on the connected peer.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
    SerializeDisplay,
)]
#[display("0x{_0:04x}")]
pub struct AttributeHandle(u16);

impl AttributeHandle {
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }
}

bitflags! {
    /// Characteristic property bits as advertised in the characteristic declaration.
    #[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    /// Lower-case property labels, `none` when no bit is set.
    #[must_use]
    pub fn labels(self) -> Vec<String> {
        let labels: Vec<String> = self
            .iter_names()
            .map(|(name, _)| name.to_lowercase())
            .collect();
        if labels.is_empty() {
            vec!["none".to_string()]
        } else {
            labels
        }
    }
}

/// A descriptor discovered under a characteristic.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Descriptor {
    handle: AttributeHandle,
    uuid: Uuid,
    #[serde_as(as = "Option<Hex>")]
    value: Option<Vec<u8>>,
}

impl Descriptor {
    #[must_use]
    pub fn new(handle: AttributeHandle, uuid: Uuid) -> Self {
        Self {
            handle,
            uuid,
            value: None,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn handle(&self) -> AttributeHandle {
        self.handle
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Last value read from or notified for this descriptor.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

/// A characteristic with its descriptors and cached value.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Characteristic {
    handle: AttributeHandle,
    uuid: Uuid,
    properties: CharacteristicProperties,
    descriptors: Vec<Descriptor>,
    #[serde_as(as = "Option<Hex>")]
    value: Option<Vec<u8>>,
}

impl Characteristic {
    #[must_use]
    pub fn new(handle: AttributeHandle, uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            handle,
            uuid,
            properties,
            descriptors: Vec::new(),
            value: None,
        }
    }

    #[must_use]
    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn handle(&self) -> AttributeHandle {
        self.handle
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    #[must_use]
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Last value read from or notified for this characteristic.
    ///
    /// Stale once the owning session has left `Ready`.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

/// A discovered GATT service.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Service {
    handle: AttributeHandle,
    uuid: Uuid,
    primary: bool,
    characteristics: Vec<Characteristic>,
}

impl Service {
    #[must_use]
    pub fn new(handle: AttributeHandle, uuid: Uuid, primary: bool) -> Self {
        Self {
            handle,
            uuid,
            primary,
            characteristics: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    #[must_use]
    pub fn handle(&self) -> AttributeHandle {
        self.handle
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    #[must_use]
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    /// Looks up a characteristic of this service by UUID.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound`] when the service has no such characteristic.
    pub fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, NotFound> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or_else(|| NotFound::new(AttributeKind::Characteristic, uuid))
    }
}

/// Kind of attribute named in a failed lookup.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    #[strum(to_string = "service")]
    Service,
    #[strum(to_string = "characteristic")]
    Characteristic,
    #[strum(to_string = "descriptor")]
    Descriptor,
}

/// Lookup failure for an unknown service, characteristic, or descriptor.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("no {kind} matches `{key}`")]
pub struct NotFound {
    kind: AttributeKind,
    key: String,
}

impl NotFound {
    pub(crate) fn new(kind: AttributeKind, key: impl ToString) -> Self {
        Self {
            kind,
            key: key.to_string(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum AttributeLocation {
    Characteristic {
        service: usize,
        characteristic: usize,
    },
    Descriptor {
        service: usize,
        characteristic: usize,
        descriptor: usize,
    },
}

/// Services discovered on the peer, indexed by attribute handle.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AttributeTable {
    services: Vec<Service>,
    index: HashMap<AttributeHandle, AttributeLocation>,
}

impl AttributeTable {
    pub(crate) fn from_services(services: Vec<Service>) -> Self {
        let mut table = Self::default();
        table.replace(services);
        table
    }

    /// Rebuilds the table from a complete discovery result.
    #[instrument(skip(self, services), level = "trace", fields(service_count = services.len()))]
    pub(crate) fn replace(&mut self, services: Vec<Service>) {
        let mut index = HashMap::new();
        for (service_index, service) in services.iter().enumerate() {
            for (characteristic_index, characteristic) in service.characteristics.iter().enumerate()
            {
                insert_location(
                    &mut index,
                    characteristic.handle,
                    AttributeLocation::Characteristic {
                        service: service_index,
                        characteristic: characteristic_index,
                    },
                );
                for (descriptor_index, descriptor) in characteristic.descriptors.iter().enumerate()
                {
                    insert_location(
                        &mut index,
                        descriptor.handle,
                        AttributeLocation::Descriptor {
                            service: service_index,
                            characteristic: characteristic_index,
                            descriptor: descriptor_index,
                        },
                    );
                }
            }
        }

        self.services = services;
        self.index = index;
    }

    pub(crate) fn clear(&mut self) {
        self.services.clear();
        self.index.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// All services in discovery order.
    #[must_use]
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Returns the first service whose UUID matches exactly.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound`] when no service has this UUID.
    pub fn service(&self, uuid: Uuid) -> Result<&Service, NotFound> {
        self.services
            .iter()
            .find(|service| service.uuid == uuid)
            .ok_or_else(|| NotFound::new(AttributeKind::Service, uuid))
    }

    /// # Errors
    ///
    /// Returns [`NotFound`] when the handle is not a characteristic value handle.
    pub fn characteristic(&self, handle: AttributeHandle) -> Result<&Characteristic, NotFound> {
        match self.index.get(&handle) {
            Some(AttributeLocation::Characteristic {
                service,
                characteristic,
            }) => Ok(&self.services[*service].characteristics[*characteristic]),
            _ => Err(NotFound::new(AttributeKind::Characteristic, handle)),
        }
    }

    /// # Errors
    ///
    /// Returns [`NotFound`] when the handle is not a descriptor handle.
    pub fn descriptor(&self, handle: AttributeHandle) -> Result<&Descriptor, NotFound> {
        match self.index.get(&handle) {
            Some(AttributeLocation::Descriptor {
                service,
                characteristic,
                descriptor,
            }) => Ok(&self.services[*service].characteristics[*characteristic].descriptors
                [*descriptor]),
            _ => Err(NotFound::new(AttributeKind::Descriptor, handle)),
        }
    }

    /// Replaces the cached value of a characteristic or descriptor.
    ///
    /// Returns `false` when the handle is unknown.
    pub(crate) fn update_value(&mut self, handle: AttributeHandle, value: &[u8]) -> bool {
        let slot = match self.index.get(&handle).copied() {
            Some(AttributeLocation::Characteristic {
                service,
                characteristic,
            }) => &mut self.services[service].characteristics[characteristic].value,
            Some(AttributeLocation::Descriptor {
                service,
                characteristic,
                descriptor,
            }) => {
                &mut self.services[service].characteristics[characteristic].descriptors[descriptor]
                    .value
            }
            None => return false,
        };
        *slot = Some(value.to_vec());
        true
    }
}

fn insert_location(
    index: &mut HashMap<AttributeHandle, AttributeLocation>,
    handle: AttributeHandle,
    location: AttributeLocation,
) {
    match index.entry(handle) {
        Entry::Vacant(vacant) => {
            vacant.insert(location);
        }
        Entry::Occupied(_) => {
            warn!(%handle, "duplicate attribute handle in discovery result; keeping the first");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn battery_service() -> Service {
        Service::new(AttributeHandle::new(0x0001), uuid_from_u16(0x180F), true).with_characteristic(
            Characteristic::new(
                AttributeHandle::new(0x0003),
                uuid_from_u16(0x2A19),
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            )
            .with_descriptor(Descriptor::new(
                AttributeHandle::new(0x0004),
                uuid_from_u16(0x2902),
            )),
        )
    }

    fn device_information_service() -> Service {
        Service::new(AttributeHandle::new(0x0010), uuid_from_u16(0x180A), true).with_characteristic(
            Characteristic::new(
                AttributeHandle::new(0x0012),
                uuid_from_u16(0x2A29),
                CharacteristicProperties::READ,
            ),
        )
    }

    #[test]
    fn service_lookup_is_exact() {
        let table =
            AttributeTable::from_services(vec![battery_service(), device_information_service()]);

        let service = table
            .service(uuid_from_u16(0x180A))
            .expect("device information service should resolve");
        assert_eq!(AttributeHandle::new(0x0010), service.handle());

        let missing = table.service(uuid_from_u16(0x1800));
        assert_matches!(missing, Err(error) if error.kind() == AttributeKind::Service);
    }

    #[rstest]
    #[case(0x0003, true, false)]
    #[case(0x0004, false, true)]
    #[case(0x0001, false, false)]
    #[case(0x00FF, false, false)]
    fn handle_lookup_distinguishes_characteristics_and_descriptors(
        #[case] raw: u16,
        #[case] is_characteristic: bool,
        #[case] is_descriptor: bool,
    ) {
        let table = AttributeTable::from_services(vec![battery_service()]);
        let handle = AttributeHandle::new(raw);

        assert_eq!(is_characteristic, table.characteristic(handle).is_ok());
        assert_eq!(is_descriptor, table.descriptor(handle).is_ok());
    }

    #[test]
    fn replace_discards_previous_services() {
        let mut table = AttributeTable::from_services(vec![battery_service()]);
        table.replace(vec![device_information_service()]);

        assert_eq!(1, table.services().len());
        assert!(table.characteristic(AttributeHandle::new(0x0003)).is_err());
        assert!(table.characteristic(AttributeHandle::new(0x0012)).is_ok());
    }

    #[test]
    fn update_value_caches_bytes_for_known_handles_only() {
        let mut table = AttributeTable::from_services(vec![battery_service()]);

        assert!(table.update_value(AttributeHandle::new(0x0003), &[0x42]));
        assert!(table.update_value(AttributeHandle::new(0x0004), &[0x01, 0x00]));
        assert!(!table.update_value(AttributeHandle::new(0x0099), &[0x00]));

        let characteristic = table
            .characteristic(AttributeHandle::new(0x0003))
            .expect("battery level should resolve");
        assert_eq!(Some([0x42].as_slice()), characteristic.value());
        let descriptor = table
            .descriptor(AttributeHandle::new(0x0004))
            .expect("cccd should resolve");
        assert_eq!(Some([0x01, 0x00].as_slice()), descriptor.value());
    }

    #[test]
    fn clear_empties_the_table() {
        let mut table = AttributeTable::from_services(vec![battery_service()]);
        table.clear();

        assert!(table.is_empty());
        assert!(table.characteristic(AttributeHandle::new(0x0003)).is_err());
    }

    #[test]
    fn properties_render_lowercase_labels() {
        let labels = (CharacteristicProperties::READ | CharacteristicProperties::NOTIFY).labels();
        assert_eq!(vec!["read".to_string(), "notify".to_string()], labels);
        assert_eq!(vec!["none".to_string()], CharacteristicProperties::empty().labels());
    }

    #[test]
    fn handle_displays_as_padded_hex() {
        assert_eq!("0x002a", AttributeHandle::new(0x2A).to_string());
    }
}
