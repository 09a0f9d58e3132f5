use std::str::FromStr;

use uuid::Uuid;

use crate::error::FixtureError;
use crate::gatt::{
    AttributeHandle, Characteristic, CharacteristicProperties, Descriptor, Service, uuid_from_u16,
};

const CLIENT_CHARACTERISTIC_CONFIGURATION: u16 = 0x2902;
const BATTERY_SERVICE: u16 = 0x180F;
const BATTERY_LEVEL: u16 = 0x2A19;
const DEVICE_INFORMATION_SERVICE: u16 = 0x180A;
const MANUFACTURER_NAME: u16 = 0x2A29;

/// Services of a fake peripheral, parsed from `service/characteristic:properties[=hex]`
/// records separated by `;`.
///
/// Consecutive records naming the same service share it. Handles are assigned in order:
/// the service, then per characteristic its declaration, its value, and a client
/// configuration descriptor when it can notify or indicate.
///
/// ```
/// let fixture: gatt_session::PeripheralFixture = "180f/2a19:read,notify=64".parse()?;
/// let services = fixture.services();
/// assert_eq!(1, services.len());
/// assert_eq!("0x0003", services[0].characteristics()[0].handle().to_string());
/// # Ok::<(), gatt_session::FixtureError>(())
/// ```
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Into)]
pub struct PeripheralFixture {
    services: Vec<Service>,
}

impl PeripheralFixture {
    #[must_use]
    pub fn services(&self) -> &[Service] {
        &self.services
    }
}

impl Default for PeripheralFixture {
    /// A battery service with a notifying level and a device information service.
    fn default() -> Self {
        let records = [
            FixtureRecord {
                service: uuid_from_u16(BATTERY_SERVICE),
                characteristic: uuid_from_u16(BATTERY_LEVEL),
                properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                value: Some(vec![0x64]),
            },
            FixtureRecord {
                service: uuid_from_u16(DEVICE_INFORMATION_SERVICE),
                characteristic: uuid_from_u16(MANUFACTURER_NAME),
                properties: CharacteristicProperties::READ,
                value: Some(b"gattctl".to_vec()),
            },
        ];
        Self {
            services: assign_handles(records),
        }
    }
}

impl FromStr for PeripheralFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let records = value
            .split(';')
            .map(parse_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            services: assign_handles(records),
        })
    }
}

/// Notifications a fake peripheral pushes once a handle's notifications are enabled,
/// parsed from comma-separated `handle=hex` pairs.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct NotificationScript {
    entries: Vec<(AttributeHandle, Vec<u8>)>,
}

impl NotificationScript {
    #[must_use]
    pub fn new(entries: Vec<(AttributeHandle, Vec<u8>)>) -> Self {
        Self { entries }
    }

    /// Scripted payloads for `handle`, in script order.
    pub fn payloads_for(&self, handle: AttributeHandle) -> impl Iterator<Item = &[u8]> {
        self.entries
            .iter()
            .filter(move |(candidate, _)| *candidate == handle)
            .map(|(_, payload)| payload.as_slice())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromStr for NotificationScript {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Ok(Self::default());
        }
        let entries = value
            .split(',')
            .map(|entry| {
                let (handle, payload) =
                    entry
                        .split_once('=')
                        .ok_or_else(|| FixtureError::InvalidRecordShape {
                            record: entry.to_string(),
                        })?;
                Ok((parse_handle(handle)?, parse_hex(payload)?))
            })
            .collect::<Result<Vec<_>, FixtureError>>()?;
        Ok(Self { entries })
    }
}

/// Parses a hexadecimal attribute handle, with or without a `0x` prefix.
pub(crate) fn parse_handle(value: &str) -> Result<AttributeHandle, FixtureError> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16)
        .map(AttributeHandle::new)
        .map_err(|_| FixtureError::InvalidHandle {
            value: value.to_string(),
        })
}

/// Hex payload given on the command line.
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Into)]
pub(crate) struct HexPayload {
    bytes: Vec<u8>,
}

impl HexPayload {
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for HexPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl FromStr for HexPayload {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_hex(value).map(Self::from)
    }
}

/// Parses a hex payload, ignoring whitespace.
pub(crate) fn parse_hex(value: &str) -> Result<Vec<u8>, FixtureError> {
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(hex::decode(cleaned)?)
}

#[derive(Debug)]
struct FixtureRecord {
    service: Uuid,
    characteristic: Uuid,
    properties: CharacteristicProperties,
    value: Option<Vec<u8>>,
}

fn parse_record(raw_record: &str) -> Result<FixtureRecord, FixtureError> {
    let shape_error = || FixtureError::InvalidRecordShape {
        record: raw_record.to_string(),
    };
    let (path, rest) = raw_record.trim().split_once(':').ok_or_else(shape_error)?;
    let (service, characteristic) = path.split_once('/').ok_or_else(shape_error)?;
    let (properties, value) = match rest.split_once('=') {
        Some((properties, value)) => (properties, Some(parse_hex(value)?)),
        None => (rest, None),
    };

    Ok(FixtureRecord {
        service: parse_uuid(service)?,
        characteristic: parse_uuid(characteristic)?,
        properties: parse_properties(properties)?,
        value,
    })
}

fn parse_uuid(value: &str) -> Result<Uuid, FixtureError> {
    let trimmed = value.trim();
    if trimmed.len() == 4
        && let Ok(short) = u16::from_str_radix(trimmed, 16)
    {
        return Ok(uuid_from_u16(short));
    }
    Uuid::parse_str(trimmed).map_err(|_| FixtureError::InvalidUuid {
        value: value.to_string(),
    })
}

fn parse_properties(value: &str) -> Result<CharacteristicProperties, FixtureError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .try_fold(CharacteristicProperties::empty(), |properties, name| {
            let property = match name.to_ascii_lowercase().as_str() {
                "broadcast" => CharacteristicProperties::BROADCAST,
                "read" => CharacteristicProperties::READ,
                "write_without_response" => CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
                "write" => CharacteristicProperties::WRITE,
                "notify" => CharacteristicProperties::NOTIFY,
                "indicate" => CharacteristicProperties::INDICATE,
                "authenticated_signed_writes" => {
                    CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES
                }
                "extended_properties" => CharacteristicProperties::EXTENDED_PROPERTIES,
                _ => {
                    return Err(FixtureError::UnknownProperty {
                        value: name.to_string(),
                    });
                }
            };
            Ok(properties | property)
        })
}

fn assign_handles(records: impl IntoIterator<Item = FixtureRecord>) -> Vec<Service> {
    let mut services: Vec<Service> = Vec::new();
    let mut next_handle: u16 = 1;
    let mut allocate = || {
        let handle = AttributeHandle::new(next_handle);
        next_handle = next_handle.saturating_add(1);
        handle
    };

    for record in records {
        let starts_new_service = services
            .last()
            .is_none_or(|service| service.uuid() != record.service);
        if starts_new_service {
            services.push(Service::new(allocate(), record.service, true));
        }

        let _declaration = allocate();
        let mut characteristic =
            Characteristic::new(allocate(), record.characteristic, record.properties);
        if let Some(value) = record.value {
            characteristic = characteristic.with_value(value);
        }
        if record
            .properties
            .intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE)
        {
            characteristic = characteristic.with_descriptor(
                Descriptor::new(allocate(), uuid_from_u16(CLIENT_CHARACTERISTIC_CONFIGURATION))
                    .with_value(vec![0x00, 0x00]),
            );
        }

        if let Some(service) = services.pop() {
            services.push(service.with_characteristic(characteristic));
        }
    }
    services
}
