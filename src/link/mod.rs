//! Collaborator interface to the radio link, plus the drivers shipped with the crate.

mod btleplug_driver;
mod fake;
mod fixture;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::LinkError;
use crate::gatt::{AttributeHandle, ConnectionPriority, LinkEventSender, WriteType};

pub use self::btleplug_driver::BtleplugBackend;
pub use self::fake::{FakeLinkBackend, FakeLinkController, FakeLinkDriver, FakePeripheral};
pub use self::fixture::{NotificationScript, PeripheralFixture};
pub(crate) use self::fixture::{HexPayload, parse_handle};

/// Identifier of a remote peripheral: a Bluetooth address or a platform peripheral id.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, derive_more::Display)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Creates an address, normalising surrounding whitespace and letter case.
    #[must_use]
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_uppercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a platform-rendered identifier.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        self.0.eq_ignore_ascii_case(candidate.trim())
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A radio link to one peripheral.
///
/// Every method only submits work and returns at once. Its completion arrives later as a
/// [`LinkEvent`](crate::gatt::LinkEvent) on the sender handed over in [`LinkDriver::connect`].
/// An `Err` means the request never reached the air.
pub trait LinkDriver: Send + fmt::Debug {
    fn connect(&mut self, address: &DeviceAddress, events: LinkEventSender)
    -> Result<(), LinkError>;

    fn disconnect(&mut self) -> Result<(), LinkError>;

    fn discover_services(&mut self) -> Result<(), LinkError>;

    fn read_attribute(&mut self, handle: AttributeHandle) -> Result<(), LinkError>;

    fn write_attribute(
        &mut self,
        handle: AttributeHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), LinkError>;

    fn set_notification(&mut self, handle: AttributeHandle, enable: bool)
    -> Result<(), LinkError>;

    fn request_mtu(&mut self, mtu: u16) -> Result<(), LinkError>;

    fn request_connection_priority(
        &mut self,
        priority: ConnectionPriority,
    ) -> Result<(), LinkError>;

    fn read_rssi(&mut self) -> Result<(), LinkError>;

    /// Whether the link can drop its cached attribute database on request.
    fn supports_cache_refresh(&self) -> bool {
        false
    }

    /// Drops the link's cached attribute database. Only called when
    /// [`LinkDriver::supports_cache_refresh`] is `true`.
    fn refresh_cache(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    /// Releases every resource held by the driver. No events follow.
    fn close(&mut self) {}
}

/// A request as seen by a link driver; recorded by the fake driver.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LinkCommand {
    Connect {
        address: DeviceAddress,
    },
    Disconnect,
    DiscoverServices,
    ReadAttribute {
        handle: AttributeHandle,
    },
    WriteAttribute {
        handle: AttributeHandle,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetNotification {
        handle: AttributeHandle,
        enable: bool,
    },
    RequestMtu {
        mtu: u16,
    },
    RequestConnectionPriority {
        priority: ConnectionPriority,
    },
    ReadRssi,
    RefreshCache,
    Close,
}

/// Opens a link driver; the real backend needs asynchronous adapter set-up first.
#[async_trait]
pub trait LinkBackend: Send {
    async fn open(self: Box<Self>) -> Result<Box<dyn LinkDriver>, LinkError>;
}
