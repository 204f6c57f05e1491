use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::config::{ConnectionConfig, DEFAULT_RECONNECTION_TIMEOUT};
use crate::error::{CliConfigError, FixtureError};
use crate::framing::{FIRST_FRAME_HEADER_LEN, FrameSize};
use crate::hw::{DEFAULT_FAKE_DEVICE_NAME, DEFAULT_FAKE_MTU, FakeDevice, FakeResponse};

pub(crate) const DEFAULT_NAME_PREFIX: &str = "Ledger";

/// Command-line options for the hardware-wallet APDU tool.
#[derive(Debug, Parser)]
#[command(name = "hwlink", about = "Exchange APDUs with Ledger hardware wallets over BLE.")]
pub struct Args {
    /// Overrides `RUST_LOG` for this run.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to pretty on terminals and JSON otherwise.
    #[arg(long, global = true, value_enum)]
    output_format: Option<OutputFormat>,
    /// Only connect to devices whose local name starts with this prefix.
    #[arg(long, global = true, default_value = DEFAULT_NAME_PREFIX)]
    name_prefix: String,
    /// How long a disconnected device has to come back (e.g. `5s`, `1500ms`).
    #[arg(long, global = true, value_parser = parse_duration)]
    reconnection_timeout: Option<Duration>,
    /// Uses the in-memory fake device instead of a BLE adapter.
    #[arg(long, global = true)]
    fake: bool,
    /// MTU advertised by the fake device.
    #[arg(long, global = true, requires = "fake")]
    fake_mtu: Option<u8>,
    /// Scripted fake responses as hexadecimal bytes, status word last. Repeatable.
    #[arg(long = "fake-response", global = true, requires = "fake")]
    fake_responses: Vec<FakeResponse>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use hwlink::{Args, Command};
    ///
    /// let args = Args::new(Command::AppVersion);
    /// let _ = args;
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            output_format: None,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            reconnection_timeout: None,
            fake: false,
            fake_mtu: None,
            fake_responses: Vec::new(),
            command,
        }
    }

    /// Enables fake backend mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs { mtu, responses } = fake;

        self.fake = true;
        self.fake_mtu = Some(mtu);
        self.fake_responses = responses;
        self
    }

    #[must_use]
    pub fn with_output_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = Some(output_format);
        self
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output_format
    }

    /// Splits parsed CLI arguments into the command, its run settings and
    /// optional fake-device settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the reconnection timeout is zero or the fake MTU
    /// cannot carry a frame.
    pub fn into_parts(self) -> anyhow::Result<(Command, RunSettings, Option<FakeArgs>)> {
        let Args {
            log_level: _,
            output_format: _,
            name_prefix,
            reconnection_timeout,
            fake,
            fake_mtu,
            fake_responses,
            command,
        } = self;

        let reconnection_timeout = reconnection_timeout.unwrap_or(DEFAULT_RECONNECTION_TIMEOUT);
        if reconnection_timeout.is_zero() {
            return Err(CliConfigError::ZeroReconnectionTimeout.into());
        }
        let settings = RunSettings {
            name_prefix,
            config: ConnectionConfig::builder()
                .reconnection_timeout(reconnection_timeout)
                .build(),
        };

        let fake_args = if fake {
            Some(
                FakeArgs::builder()
                    .mtu(fake_mtu.unwrap_or(DEFAULT_FAKE_MTU))?
                    .responses(fake_responses)
                    .build(),
            )
        } else {
            None
        };

        Ok((command, settings, fake_args))
    }
}

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct RunSettings {
    name_prefix: String,
    config: ConnectionConfig,
}

impl RunSettings {
    #[must_use]
    pub fn new(name_prefix: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            config,
        }
    }

    #[must_use]
    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    #[must_use]
    pub fn config(&self) -> ConnectionConfig {
        self.config
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            config: ConnectionConfig::default(),
        }
    }
}

/// Fake device arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |mtu: u8| -> Result<_, FixtureError> { validate_fake_mtu(mtu) })]
    mtu: u8,
    #[builder(default)]
    responses: Vec<FakeResponse>,
}

impl FakeArgs {
    pub(crate) fn into_device(self) -> FakeDevice {
        let Self { mtu, responses } = self;

        FakeDevice::builder()
            .name(DEFAULT_FAKE_DEVICE_NAME)
            .mtu(mtu)
            .responses(responses.into_iter().map(Vec::from).collect())
            .build()
    }
}

fn validate_fake_mtu(mtu: u8) -> Result<u8, FixtureError> {
    match FrameSize::new(mtu) {
        Some(size) if size.get() > FIRST_FRAME_HEADER_LEN => Ok(mtu),
        _ => Err(FixtureError::MtuTooSmall),
    }
}

/// Supported CLI commands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Connect to the first matching device and exchange one APDU.
    Send(SendArgs),
    /// Connect to the first matching device and print the open application.
    AppVersion,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Send(_args) => "send",
            Self::AppVersion => "app-version",
        }
    }
}

/// Arguments for the `send` command.
#[derive(Debug, Clone, clap::Args)]
pub struct SendArgs {
    /// APDU as hexadecimal bytes; whitespace is ignored.
    #[arg(value_parser = parse_apdu)]
    apdu: ::std::vec::Vec<u8>,
    /// The APDU makes the device reboot or switch application.
    #[arg(long)]
    triggers_disconnection: bool,
    /// Give up waiting for the response after this long.
    #[arg(long, value_parser = parse_duration)]
    abort_timeout: Option<Duration>,
}

impl SendArgs {
    #[must_use]
    pub fn new(apdu: Vec<u8>) -> Self {
        Self {
            apdu,
            triggers_disconnection: false,
            abort_timeout: None,
        }
    }

    #[must_use]
    pub fn with_triggers_disconnection(mut self, triggers_disconnection: bool) -> Self {
        self.triggers_disconnection = triggers_disconnection;
        self
    }

    #[must_use]
    pub fn with_abort_timeout(mut self, abort_timeout: Duration) -> Self {
        self.abort_timeout = Some(abort_timeout);
        self
    }

    pub(crate) fn apdu(&self) -> &[u8] {
        &self.apdu
    }

    pub(crate) fn triggers_disconnection(&self) -> bool {
        self.triggers_disconnection
    }

    pub(crate) fn abort_timeout(&self) -> Option<Duration> {
        self.abort_timeout
    }
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Trace => LevelFilter::TRACE,
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            Self::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

fn parse_apdu(value: &str) -> Result<Vec<u8>, String> {
    crate::hw::parse_hex(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn fake_flags_require_fake_mode() {
        let result = Args::try_parse_from(["hwlink", "--fake-mtu", "64", "app-version"]);

        let error = result.expect_err("--fake-mtu should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn send_parses_spaced_hex_and_flags() {
        let args = Args::try_parse_from([
            "hwlink",
            "send",
            "e0d8 0000 07",
            "--triggers-disconnection",
            "--abort-timeout",
            "2s",
        ])
        .expect("valid send arguments should parse");

        let (command, _, fake_args) = args.into_parts().expect("settings should resolve");
        let Command::Send(send) = command else {
            panic!("expected send command");
        };
        assert_eq!(vec![0xe0, 0xd8, 0x00, 0x00, 0x07], send.apdu);
        assert!(send.triggers_disconnection);
        assert_eq!(Some(Duration::from_secs(2)), send.abort_timeout);
        assert_matches!(fake_args, None);
    }

    #[test]
    fn invalid_apdu_hex_is_rejected() {
        let result = Args::try_parse_from(["hwlink", "send", "e0z"]);

        let error = result.expect_err("invalid hex should fail argument parsing");
        assert_eq!(ErrorKind::ValueValidation, error.kind());
    }

    #[test]
    fn fake_mode_builds_fake_settings() {
        let args = Args::try_parse_from([
            "hwlink",
            "--fake",
            "--fake-response",
            "6e00",
            "--fake-response",
            "9000",
            "--reconnection-timeout",
            "1500ms",
            "app-version",
        ])
        .expect("valid fake arguments should parse");

        let (command, settings, fake_args) = args
            .into_parts()
            .expect("valid fake arguments should resolve");
        assert_matches!(command, Command::AppVersion);
        assert_eq!(DEFAULT_NAME_PREFIX, settings.name_prefix());
        assert_eq!(
            Duration::from_millis(1500),
            settings.config().reconnection_timeout()
        );
        let fake_args = fake_args.expect("--fake should produce fake settings");
        assert_eq!(DEFAULT_FAKE_MTU, fake_args.mtu);
        assert_eq!(2, fake_args.responses.len());
    }

    #[test]
    fn zero_reconnection_timeout_is_rejected() {
        let args = Args::try_parse_from(["hwlink", "--reconnection-timeout", "0s", "app-version"])
            .expect("zero durations parse");

        let error = args
            .into_parts()
            .expect_err("zero reconnection timeout should be rejected");
        assert_matches!(
            error.downcast_ref::<CliConfigError>(),
            Some(CliConfigError::ZeroReconnectionTimeout)
        );
    }

    #[rstest]
    #[case(0)]
    #[case(5)]
    fn fake_mtu_must_fit_a_frame(#[case] mtu: u8) {
        assert!(matches!(
            FakeArgs::builder().mtu(mtu),
            Err(FixtureError::MtuTooSmall)
        ));
    }

    #[test]
    fn log_levels_map_to_filters() {
        assert_eq!(LevelFilter::DEBUG, LogLevel::Debug.as_level_filter());
        assert_eq!(LevelFilter::ERROR, LogLevel::Error.as_level_filter());
    }
}
