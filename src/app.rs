use std::io;

use anyhow::Result;
use tracing::instrument;

use crate::cli::ui::{Painter, Spinner};
use crate::cli::{Command, FakeArgs, Invocation, LogLevel, OutputFormat, open_ready_session};
use crate::link::{BtleplugBackend, FakeLinkBackend, LinkBackend};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Creates a link backend that drives the host's Bluetooth adapters.
#[must_use]
pub fn real_link_backend() -> Box<dyn LinkBackend> {
    Box::new(BtleplugBackend::default())
}

/// Creates a link backend backed by an in-memory fake peripheral.
#[must_use]
pub fn fake_link_backend(fake_args: FakeArgs) -> Box<dyn LinkBackend> {
    Box::new(FakeLinkBackend::new(fake_args.into_peripheral()))
}

/// Runs a resolved command against the real terminal.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = gatt_session::Args::try_parse_from(["gattctl", "AA:BB:CC:DD:EE:FF", "--fake", "inspect"])?;
/// let (invocation, maybe_fake_args) = args.into_invocation()?;
/// let backend = match maybe_fake_args {
///     Some(fake_args) => gatt_session::fake_link_backend(fake_args),
///     None => gatt_session::real_link_backend(),
/// };
/// let mut out = Vec::new();
/// gatt_session::run(invocation, &mut out, backend).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the session cannot be brought up, the
/// command fails, or output writing fails.
pub async fn run<W>(invocation: Invocation, out: &mut W, backend: Box<dyn LinkBackend>) -> Result<()>
where
    W: io::Write,
{
    run_with_clients(invocation, out, &SystemTerminalClient, backend).await
}

/// Runs a resolved command with an injected terminal client.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// struct FakeTerminal;
/// impl gatt_session::TerminalClient for FakeTerminal {
///     fn stdout_is_terminal(&self) -> bool { false }
///     fn stderr_is_terminal(&self) -> bool { false }
/// }
///
/// let args = gatt_session::Args::try_parse_from([
///     "gattctl",
///     "AA:BB:CC:DD:EE:FF",
///     "--fake",
///     "read",
///     "--handle",
///     "0x0003",
/// ])?;
/// let (invocation, maybe_fake_args) = args.into_invocation()?;
/// let backend = match maybe_fake_args {
///     Some(fake_args) => gatt_session::fake_link_backend(fake_args),
///     None => gatt_session::real_link_backend(),
/// };
/// let mut out = Vec::new();
/// gatt_session::run_with_clients(invocation, &mut out, &FakeTerminal, backend).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the session cannot be brought up, the
/// command fails, or output writing fails.
#[instrument(
    skip(invocation, out, terminal_client, backend),
    level = "info",
    fields(command = invocation.command().name(), address = %invocation.address())
)]
pub async fn run_with_clients<W>(
    invocation: Invocation,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    backend: Box<dyn LinkBackend>,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "gattctl",
        terminal_client.stderr_is_terminal(),
        invocation.log_level().map(LogLevel::as_level_filter),
    )?;

    let output_format = invocation.output().unwrap_or(if terminal_client.stdout_is_terminal() {
        OutputFormat::Pretty
    } else {
        OutputFormat::Json
    });
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let spinner = Spinner::new(terminal_client.stderr_is_terminal());

    let session = open_ready_session(
        invocation.address(),
        invocation.config(),
        backend,
        &spinner,
    )
    .await?;

    let result = match invocation.command() {
        Command::Inspect => {
            crate::cli::inspect::run(&session, out, &painter, output_format).await
        }
        Command::Read(args) => {
            crate::cli::read::run(&session, args, out, &painter, output_format).await
        }
        Command::Write(args) => {
            crate::cli::write::run(&session, args, out, &painter, output_format).await
        }
        Command::Listen(args) => {
            crate::cli::listen::run(&session, args, out, &painter, output_format).await
        }
    };
    session.close().await;

    result
}
