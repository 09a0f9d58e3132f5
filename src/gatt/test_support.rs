use crate::error::LinkError;
use crate::gatt::{AttributeHandle, ConnectionPriority, LinkEventSender, WriteType};
use crate::link::{DeviceAddress, LinkCommand, LinkDriver};

/// Link double that records submissions and never answers them.
#[derive(Debug, Default)]
pub(crate) struct RecordingLink {
    pub(crate) commands: Vec<LinkCommand>,
    pub(crate) reject_handle: Option<AttributeHandle>,
}

impl RecordingLink {
    fn record(&mut self, command: LinkCommand) -> Result<(), LinkError> {
        self.commands.push(command);
        Ok(())
    }

    fn check(&self, handle: AttributeHandle) -> Result<(), LinkError> {
        if self.reject_handle == Some(handle) {
            return Err(LinkError::UnknownHandle { handle });
        }
        Ok(())
    }
}

impl LinkDriver for RecordingLink {
    fn connect(
        &mut self,
        address: &DeviceAddress,
        _events: LinkEventSender,
    ) -> Result<(), LinkError> {
        self.record(LinkCommand::Connect {
            address: address.clone(),
        })
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.record(LinkCommand::Disconnect)
    }

    fn discover_services(&mut self) -> Result<(), LinkError> {
        self.record(LinkCommand::DiscoverServices)
    }

    fn read_attribute(&mut self, handle: AttributeHandle) -> Result<(), LinkError> {
        self.check(handle)?;
        self.record(LinkCommand::ReadAttribute { handle })
    }

    fn write_attribute(
        &mut self,
        handle: AttributeHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), LinkError> {
        self.check(handle)?;
        self.record(LinkCommand::WriteAttribute {
            handle,
            value: value.to_vec(),
            write_type,
        })
    }

    fn set_notification(&mut self, handle: AttributeHandle, enable: bool) -> Result<(), LinkError> {
        self.check(handle)?;
        self.record(LinkCommand::SetNotification { handle, enable })
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), LinkError> {
        self.record(LinkCommand::RequestMtu { mtu })
    }

    fn request_connection_priority(
        &mut self,
        priority: ConnectionPriority,
    ) -> Result<(), LinkError> {
        self.record(LinkCommand::RequestConnectionPriority { priority })
    }

    fn read_rssi(&mut self) -> Result<(), LinkError> {
        self.record(LinkCommand::ReadRssi)
    }

    fn refresh_cache(&mut self) -> Result<(), LinkError> {
        self.record(LinkCommand::RefreshCache)
    }

    fn close(&mut self) {
        self.commands.push(LinkCommand::Close);
    }
}
