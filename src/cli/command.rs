use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

use crate::cli::listen::ListenArgs;
use crate::cli::read::ReadArgs;
use crate::cli::write::WriteArgs;
use crate::error::{CliConfigError, FixtureError};
use crate::gatt::SessionConfig;
use crate::link::{DeviceAddress, FakePeripheral, NotificationScript, PeripheralFixture};

/// Command-line options for the GATT client tool.
#[derive(Debug, Parser)]
#[command(name = "gattctl", about = "Connect to a BLE peripheral and talk GATT to it.")]
pub struct Args {
    /// Bluetooth address (or platform peripheral id) of the peripheral.
    #[arg(value_parser = parse_address)]
    address: DeviceAddress,
    /// Per-operation timeout (e.g. `500ms`, `5s`).
    #[arg(long, global = true, value_parser = parse_duration)]
    timeout: Option<Duration>,
    /// Service discovery timeout; discovery waits indefinitely when omitted.
    #[arg(long, global = true, value_parser = parse_duration)]
    discovery_timeout: Option<Duration>,
    /// Overrides `RUST_LOG` for this run.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// Uses an in-memory fake peripheral instead of a Bluetooth adapter.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake services as `service/characteristic:properties[=hex];...`.
    #[arg(long, global = true, requires = "fake")]
    fake_services: Option<PeripheralFixture>,
    /// Fake notifications pushed once enabled, as `handle=hex,...`.
    #[arg(long, global = true, requires = "fake")]
    fake_notifications: Option<NotificationScript>,
    /// Artificial delay before the fake peripheral answers (e.g. `50ms`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_delay: Option<Duration>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use gatt_session::{Args, Command, DeviceAddress};
    ///
    /// let args = Args::new(DeviceAddress::new("AA:BB:CC:DD:EE:FF"), Command::Inspect);
    /// let _ = args;
    /// ```
    #[must_use]
    pub fn new(address: DeviceAddress, command: Command) -> Self {
        Self {
            address,
            timeout: None,
            discovery_timeout: None,
            log_level: None,
            output: None,
            fake: false,
            fake_services: None,
            fake_notifications: None,
            fake_delay: None,
            command,
        }
    }

    /// Enables fake mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            services,
            notifications,
            response_delay,
        } = fake;

        self.fake = true;
        self.fake_services = services;
        self.fake_notifications = notifications;
        self.fake_delay = Some(response_delay);
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = Some(output);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Splits parsed arguments into what to run and the optional fake peripheral settings.
    ///
    /// # Errors
    ///
    /// Returns an error if fake peripheral settings are given without fake mode.
    pub fn into_invocation(self) -> anyhow::Result<(Invocation, Option<FakeArgs>)> {
        let Args {
            address,
            timeout,
            discovery_timeout,
            log_level,
            output,
            fake,
            fake_services,
            fake_notifications,
            fake_delay,
            command,
        } = self;

        let fake_args = if fake {
            Some(FakeArgs {
                services: fake_services,
                notifications: fake_notifications,
                response_delay: fake_delay.unwrap_or(Duration::ZERO),
            })
        } else if fake_services.is_some() || fake_notifications.is_some() || fake_delay.is_some()
        {
            return Err(CliConfigError::FakeOptionsWithoutFake.into());
        } else {
            None
        };

        let config = SessionConfig::builder()
            .maybe_operation_timeout(timeout)
            .maybe_discovery_timeout(discovery_timeout)
            .build();

        Ok((
            Invocation {
                address,
                command,
                config,
                output,
                log_level,
            },
            fake_args,
        ))
    }
}

/// A fully resolved command ready to run.
#[derive(Debug)]
pub struct Invocation {
    address: DeviceAddress,
    command: Command,
    config: SessionConfig,
    output: Option<OutputFormat>,
    log_level: Option<LogLevel>,
}

impl Invocation {
    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn output(&self) -> Option<OutputFormat> {
        self.output
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }
}

/// Fake peripheral arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    services: Option<PeripheralFixture>,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    notifications: Option<NotificationScript>,
    #[builder(default)]
    response_delay: Duration,
}

impl FakeArgs {
    pub(crate) fn into_peripheral(self) -> FakePeripheral {
        let Self {
            services,
            notifications,
            response_delay,
        } = self;

        FakePeripheral::builder()
            .maybe_services(services.map(Into::into))
            .maybe_notifications(notifications)
            .response_delay(response_delay)
            .build()
    }
}

/// Supported commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect, discover services, and print the attribute table.
    Inspect,
    /// Read one characteristic or descriptor.
    Read(ReadArgs),
    /// Write one characteristic or descriptor.
    Write(WriteArgs),
    /// Enable notifications on a characteristic and print what arrives.
    Listen(ListenArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Inspect => "inspect",
            Self::Read(_args) => "read",
            Self::Write(_args) => "write",
            Self::Listen(_args) => "listen",
        }
    }
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// How command results are printed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

fn parse_address(value: &str) -> Result<DeviceAddress, String> {
    if value.trim().is_empty() {
        return Err("the peripheral address must not be empty".to_string());
    }
    Ok(DeviceAddress::new(value))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::gatt::AttributeHandle;

    #[rstest]
    #[case(&["gattctl", "AA:BB", "--fake-services", "180f/2a19:read", "inspect"])]
    #[case(&["gattctl", "AA:BB", "--fake-notifications", "0003=01", "inspect"])]
    #[case(&["gattctl", "AA:BB", "--fake-delay", "10ms", "inspect"])]
    fn fake_options_require_fake_mode(#[case] argv: &[&str]) {
        let error = Args::try_parse_from(argv).expect_err("fake options should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn write_command_parses_a_hex_value() {
        let args = Args::try_parse_from([
            "gattctl", "AA:BB", "--fake", "write", "--handle", "0x0003", "--value", "32",
        ])
        .expect("write arguments should parse");
        let (invocation, _fake) = args.into_invocation().expect("arguments should resolve");
        assert_matches!(invocation.command(), Command::Write(write) if write.handle() == AttributeHandle::new(3));
    }

    #[test]
    fn fake_mode_builds_fake_settings() {
        let args = Args::try_parse_from([
            "gattctl",
            "aa:bb",
            "--fake",
            "--fake-delay",
            "25ms",
            "--timeout",
            "2s",
            "inspect",
        ])
        .expect("valid fake arguments should parse");

        let (invocation, fake) = args
            .into_invocation()
            .expect("valid fake arguments should resolve");
        assert_eq!("AA:BB", invocation.address().as_str());
        assert_matches!(invocation.command(), Command::Inspect);
        assert_eq!(Duration::from_secs(2), invocation.config().operation_timeout());
        let fake = fake.expect("fake mode should produce fake settings");
        assert_eq!(Duration::from_millis(25), fake.response_delay);
    }

    #[test]
    fn malformed_fixture_is_a_parse_error() {
        let error = Args::try_parse_from([
            "gattctl",
            "AA:BB",
            "--fake",
            "--fake-services",
            "not-a-record",
            "inspect",
        ])
        .expect_err("malformed fixture should fail");
        assert_eq!(ErrorKind::ValueValidation, error.kind());
    }

    #[test]
    fn programmatic_fake_options_without_fake_mode_are_rejected() {
        let mut args = Args::new(DeviceAddress::new("AA:BB"), Command::Inspect);
        args.fake_delay = Some(Duration::from_millis(5));

        let error = args
            .into_invocation()
            .expect_err("fake options without --fake should be rejected");
        assert_matches!(
            error.downcast_ref::<CliConfigError>(),
            Some(CliConfigError::FakeOptionsWithoutFake)
        );
    }

    #[test]
    fn log_level_maps_to_level_filter() {
        let args = Args::try_parse_from(["gattctl", "AA:BB", "--log-level", "debug", "inspect"])
            .expect("log level should parse");
        let (invocation, _fake) = args.into_invocation().expect("arguments should resolve");
        assert_eq!(
            Some(LevelFilter::DEBUG),
            invocation.log_level().map(LogLevel::as_level_filter)
        );
    }
}
