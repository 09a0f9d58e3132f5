use std::io;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use serde_with::{hex::Hex, serde_as};
use tracing::instrument;

use crate::cli::OutputFormat;
use crate::gatt::{AttributeHandle, AttributeKind, GattSession};
use crate::link::parse_handle;

use super::ui::{Painter, ReadView};

/// Arguments for the `read` command.
#[derive(Debug, Args)]
pub struct ReadArgs {
    /// Attribute handle to read, in hex (e.g. `0x0003`).
    #[arg(long, value_parser = parse_handle)]
    handle: AttributeHandle,
}

impl ReadArgs {
    #[must_use]
    pub fn new(handle: AttributeHandle) -> Self {
        Self { handle }
    }

    pub(crate) fn handle(&self) -> AttributeHandle {
        self.handle
    }
}

/// Result of one attribute read.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub(crate) struct ReadReport {
    handle: AttributeHandle,
    kind: AttributeKind,
    #[serde_as(as = "Hex")]
    value: Vec<u8>,
}

impl ReadReport {
    pub(crate) fn new(handle: AttributeHandle, kind: AttributeKind, value: Vec<u8>) -> Self {
        Self {
            handle,
            kind,
            value,
        }
    }

    pub(crate) fn handle(&self) -> AttributeHandle {
        self.handle
    }

    pub(crate) fn kind(&self) -> AttributeKind {
        self.kind
    }

    pub(crate) fn value(&self) -> &[u8] {
        &self.value
    }
}

/// Executes the `read` command against a ready session.
#[instrument(skip(session, out, painter), level = "info", fields(handle = %args.handle()))]
pub(crate) async fn run<W>(
    session: &GattSession,
    args: &ReadArgs,
    out: &mut W,
    painter: &Painter,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let handle = args.handle();
    let kind = super::attribute_kind(session, handle)?;
    let value = match kind {
        AttributeKind::Descriptor => session.read_descriptor(handle)?.await?,
        _ => session.read_characteristic(handle)?.await?,
    };
    let report = ReadReport::new(handle, kind, value);

    match output_format {
        OutputFormat::Pretty => writeln!(out, "{}", ReadView::new(&report, painter))?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }

    Ok(())
}
