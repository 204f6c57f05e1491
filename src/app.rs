use std::io::{self, IsTerminal};

use anyhow::Result;
use tracing::{info, instrument};

use crate::cli::exchange::{run_app_version, run_send};
use crate::cli::ui::Painter;
use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat, RunSettings};
use crate::hw::{
    DeviceSession, FakeDevice, HardwareClient, fake_hardware_client as build_fake_hardware_client,
    real_hardware_client as build_real_hardware_client,
};
use crate::telemetry;

/// Creates a hardware client backed by the platform BLE adapters.
///
/// # Errors
///
/// Returns an error if the BLE manager cannot be created.
pub async fn real_hardware_client() -> Result<Box<dyn HardwareClient>> {
    Ok(build_real_hardware_client().await?)
}

/// Creates a hardware client backed by the in-memory fake device.
#[must_use]
pub fn fake_hardware_client(fake_args: FakeArgs) -> Box<dyn HardwareClient> {
    build_fake_hardware_client(fake_args.into_device())
}

/// Creates a hardware client for a pre-configured fake device.
#[must_use]
pub fn fake_device_client(device: FakeDevice) -> Box<dyn HardwareClient> {
    build_fake_hardware_client(device)
}

/// Session-level app helper for acquiring a hardware-wallet connection.
pub struct SessionHandler {
    hardware_client: Box<dyn HardwareClient>,
    settings: RunSettings,
}

impl SessionHandler {
    /// Creates a session handler with the default name prefix and timings.
    ///
    /// ```
    /// # async fn demo() -> anyhow::Result<()> {
    /// let fake = hwlink::FakeArgs::builder().mtu(0x99)?.build();
    /// let handler = hwlink::SessionHandler::new(hwlink::fake_hardware_client(fake));
    /// let _ = handler;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn new(hardware_client: Box<dyn HardwareClient>) -> Self {
        Self {
            hardware_client,
            settings: RunSettings::default(),
        }
    }

    /// Overrides the name prefix and connection timings.
    #[must_use]
    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Connects to the first matching hardware wallet.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery, connection or MTU negotiation fails.
    #[instrument(skip(self), level = "info", fields(name_prefix = %self.settings.name_prefix()))]
    pub async fn connect_first(self) -> Result<DeviceSession> {
        let Self {
            hardware_client,
            settings,
        } = self;
        let session = hardware_client
            .connect_first_device(settings.name_prefix(), settings.config())
            .await?;
        info!(device_id = session.device().device_id(), "connected");
        Ok(session)
    }
}

/// Runs the CLI command with an injected hardware client.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = hwlink::Args::try_parse_from(["hwlink", "--fake", "app-version"])?;
/// let (command, settings, maybe_fake_args) = args.into_parts()?;
/// let hardware_client = match maybe_fake_args {
///     Some(fake_args) => hwlink::fake_hardware_client(fake_args),
///     None => hwlink::real_hardware_client().await?,
/// };
/// let mut out = Vec::new();
/// hwlink::run(command, settings, &mut out, hardware_client, hwlink::OutputFormat::Json).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the device exchange
/// fails, or output writing fails.
pub async fn run<W>(
    command: Command,
    settings: RunSettings,
    out: &mut W,
    hardware_client: Box<dyn HardwareClient>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run_with_log_level(command, settings, out, hardware_client, None, output_format).await
}

/// Runs the CLI command with an explicit telemetry log-level override.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the device exchange
/// fails, or output writing fails.
#[instrument(
    skip(settings, out, hardware_client),
    level = "info",
    fields(command = command.name(), ?log_level)
)]
pub async fn run_with_log_level<W>(
    command: Command,
    settings: RunSettings,
    out: &mut W,
    hardware_client: Box<dyn HardwareClient>,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "hwlink",
        io::stderr().is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    let painter = Painter::new(
        matches!(output_format, OutputFormat::Pretty) && io::stdout().is_terminal(),
    );
    match &command {
        Command::Send(args) => {
            run_send(hardware_client, &settings, args, out, output_format, &painter).await
        }
        Command::AppVersion => {
            run_app_version(hardware_client, &settings, out, output_format, &painter).await
        }
    }
}
