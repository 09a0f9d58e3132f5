pub(crate) mod command;
pub(crate) mod inspect;
pub(crate) mod listen;
pub(crate) mod read;
pub(crate) mod ui;
pub(crate) mod write;

use anyhow::Result;
use tracing::instrument;

use crate::error::{CommandError, SessionError};
use crate::gatt::{AttributeHandle, AttributeKind, GattSession, SessionConfig, SessionState};
use crate::link::{DeviceAddress, LinkBackend};

use self::ui::Spinner;

pub use self::command::{Args, Command, FakeArgs, Invocation, LogLevel, OutputFormat};
pub use self::listen::ListenArgs;
pub use self::read::ReadArgs;
pub use self::write::WriteArgs;

/// Opens the link, connects, and discovers services.
#[instrument(skip(config, backend, spinner), level = "info", fields(%address))]
pub(crate) async fn open_ready_session(
    address: &DeviceAddress,
    config: &SessionConfig,
    backend: Box<dyn LinkBackend>,
    spinner: &Spinner,
) -> Result<GattSession> {
    let driver = backend.open().await?;
    let session = GattSession::new(address.clone(), driver, config.clone());

    spinner
        .with_spinner("Connecting and discovering services", || async {
            session.connect()?;
            let state = session.wait_for_state(SessionState::Connected).await;
            if state != SessionState::Connected {
                return Err(CommandError::ConnectFailed {
                    address: address.clone(),
                    state,
                }
                .into());
            }
            session.discover_services()?.await?;
            Ok::<(), anyhow::Error>(())
        })
        .await?;

    Ok(session)
}

/// Whether `handle` names a characteristic or a descriptor in the session's table.
pub(crate) fn attribute_kind(
    session: &GattSession,
    handle: AttributeHandle,
) -> Result<AttributeKind, SessionError> {
    let table = session.attribute_table();
    if table.characteristic(handle).is_ok() {
        return Ok(AttributeKind::Characteristic);
    }
    table.descriptor(handle)?;
    Ok(AttributeKind::Descriptor)
}
