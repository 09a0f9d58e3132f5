use std::io;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tracing::instrument;

use crate::cli::OutputFormat;
use crate::gatt::{AttributeHandle, AttributeKind, GattSession, Status, WriteType};
use crate::link::{HexPayload, parse_handle};

use super::ui::{Painter, WriteView};

/// Arguments for the `write` command.
#[derive(Debug, Args)]
pub struct WriteArgs {
    /// Attribute handle to write, in hex (e.g. `0x0004`).
    #[arg(long, value_parser = parse_handle)]
    handle: AttributeHandle,
    /// Payload in hex (e.g. `0100`).
    #[arg(long)]
    value: HexPayload,
    /// Forces a write command even when the characteristic supports acknowledged writes.
    #[arg(long)]
    without_response: bool,
}

impl WriteArgs {
    #[must_use]
    pub fn new(handle: AttributeHandle, value: impl Into<Vec<u8>>) -> Self {
        Self {
            handle,
            value: HexPayload::from(value.into()),
            without_response: false,
        }
    }

    #[must_use]
    pub fn without_response(mut self) -> Self {
        self.without_response = true;
        self
    }

    pub(crate) fn handle(&self) -> AttributeHandle {
        self.handle
    }
}

/// Result of one attribute write.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub(crate) struct WriteReport {
    handle: AttributeHandle,
    kind: AttributeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    write_type: Option<WriteType>,
    bytes: usize,
    status: Status,
}

impl WriteReport {
    pub(crate) fn handle(&self) -> AttributeHandle {
        self.handle
    }

    pub(crate) fn kind(&self) -> AttributeKind {
        self.kind
    }

    pub(crate) fn write_type(&self) -> Option<WriteType> {
        self.write_type
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn status(&self) -> Status {
        self.status
    }
}

/// Executes the `write` command against a ready session.
#[instrument(skip(session, out, painter), level = "info", fields(handle = %args.handle()))]
pub(crate) async fn run<W>(
    session: &GattSession,
    args: &WriteArgs,
    out: &mut W,
    painter: &Painter,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let handle = args.handle();
    let kind = super::attribute_kind(session, handle)?;
    let (write_type, status) = match kind {
        AttributeKind::Descriptor => (None, session.write_descriptor(handle, args.value.bytes())?.await?),
        _ => {
            let write_type = if args.without_response {
                WriteType::WithoutResponse
            } else {
                session.default_write_type(handle)
            };
            let status = session
                .write_characteristic_with(handle, args.value.bytes(), write_type)?
                .await?;
            (Some(write_type), status)
        }
    };
    let report = WriteReport {
        handle,
        kind,
        write_type,
        bytes: args.value.bytes().len(),
        status,
    };

    match output_format {
        OutputFormat::Pretty => writeln!(out, "{}", WriteView::new(&report, painter))?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        args: WriteArgs,
    }

    #[test]
    fn parses_handle_and_hex_payload() {
        let parsed = Harness::try_parse_from(["write", "--handle", "0x0004", "--value", "01 00"])
            .expect("write arguments should parse");
        assert_eq!(AttributeHandle::new(4), parsed.args.handle());
        assert_eq!(&[0x01, 0x00], parsed.args.value.bytes());
        assert!(!parsed.args.without_response);
    }
}
