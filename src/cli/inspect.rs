use std::io;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::cli::OutputFormat;
use crate::gatt::{GattSession, Service, SessionInfo};

use super::ui::{InspectView, Painter};

/// Everything `inspect` learned about the peripheral.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct InspectReport {
    session: SessionInfo,
    rssi: Option<i16>,
    services: Vec<Service>,
}

impl InspectReport {
    pub(crate) fn new(session: SessionInfo, rssi: Option<i16>, services: Vec<Service>) -> Self {
        Self {
            session,
            rssi,
            services,
        }
    }

    pub(crate) fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub(crate) fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    pub(crate) fn services(&self) -> &[Service] {
        &self.services
    }
}

/// Executes the `inspect` command against a ready session.
#[instrument(skip(session, out, painter), level = "info", fields(?output_format))]
pub(crate) async fn run<W>(
    session: &GattSession,
    out: &mut W,
    painter: &Painter,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let rssi = match session.read_remote_rssi() {
        Ok(pending) => match pending.await {
            Ok(rssi) => Some(rssi),
            Err(error) => {
                debug!(%error, "RSSI read failed during inspect");
                None
            }
        },
        Err(error) => {
            debug!(%error, "RSSI read rejected during inspect");
            None
        }
    };
    let report = InspectReport::new(session.info(), rssi, session.services());

    match output_format {
        OutputFormat::Pretty => writeln!(out, "{}", InspectView::new(&report, painter))?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }

    Ok(())
}
