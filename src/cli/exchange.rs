use std::io;

use anyhow::Result;
use serde::Serialize;
use tracing::instrument;

use crate::apdu::{ApduResponse, AppAndVersion};
use crate::app::SessionHandler;
use crate::cli::{OutputFormat, RunSettings, SendArgs};
use crate::hw::{FoundDevice, HardwareClient};
use crate::utils::format_hex;

use super::ui::{AppVersionView, DeviceView, Painter, ResponseView};

#[derive(Debug, Serialize)]
struct ResponseReport<'a> {
    device: &'a FoundDevice,
    status_word: String,
    success: bool,
    data: String,
}

impl<'a> ResponseReport<'a> {
    fn new(device: &'a FoundDevice, response: &ApduResponse) -> Self {
        Self {
            device,
            status_word: format!("{:04x}", response.status_word()),
            success: response.is_success(),
            data: hex::encode(response.data()),
        }
    }
}

#[derive(Debug, Serialize)]
struct AppVersionReport<'a> {
    device: &'a FoundDevice,
    #[serde(flatten)]
    app: &'a AppAndVersion,
}

/// Executes the `send` command.
#[instrument(
    skip(client, settings, args, out, painter),
    level = "info",
    fields(apdu = %format_hex(args.apdu()), ?output_format)
)]
pub(crate) async fn run_send<W>(
    client: Box<dyn HardwareClient>,
    settings: &RunSettings,
    args: &SendArgs,
    out: &mut W,
    output_format: OutputFormat,
    painter: &Painter,
) -> Result<()>
where
    W: io::Write,
{
    let session = SessionHandler::new(client)
        .with_settings(settings.clone())
        .connect_first()
        .await?;
    let device = session.device().clone();
    let outcome = session
        .send_apdu(
            args.apdu().to_vec(),
            args.triggers_disconnection(),
            args.abort_timeout(),
        )
        .await;
    session.close().await;
    let response = outcome?;

    match output_format {
        OutputFormat::Pretty => {
            writeln!(out, "{}", DeviceView::new(&device, painter))?;
            writeln!(out, "{}", ResponseView::new(&response, painter))?;
        }
        OutputFormat::Json => write_json_line(out, &ResponseReport::new(&device, &response))?,
    }

    Ok(())
}

/// Executes the `app-version` command.
#[instrument(skip(client, settings, out, painter), level = "info", fields(?output_format))]
pub(crate) async fn run_app_version<W>(
    client: Box<dyn HardwareClient>,
    settings: &RunSettings,
    out: &mut W,
    output_format: OutputFormat,
    painter: &Painter,
) -> Result<()>
where
    W: io::Write,
{
    let session = SessionHandler::new(client)
        .with_settings(settings.clone())
        .connect_first()
        .await?;
    let device = session.device().clone();
    let outcome = session.app_and_version(None).await;
    session.close().await;
    let app = outcome?;

    match output_format {
        OutputFormat::Pretty => {
            writeln!(out, "{}", DeviceView::new(&device, painter))?;
            writeln!(out, "{}", AppVersionView::new(&app, painter))?;
        }
        OutputFormat::Json => write_json_line(
            out,
            &AppVersionReport {
                device: &device,
                app: &app,
            },
        )?,
    }

    Ok(())
}

fn write_json_line<W, T>(out: &mut W, value: &T) -> Result<()>
where
    W: io::Write,
    T: Serialize,
{
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
