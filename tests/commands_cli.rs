use clap::Parser;
use clap::error::ErrorKind;
use pretty_assertions::assert_eq;
use serde_json::Value;

async fn run_with_parsed_args(
    args: hwlink::Args,
    output_format: hwlink::OutputFormat,
) -> anyhow::Result<String> {
    let mut output = Vec::new();
    let (command, settings, maybe_fake_args) = args.into_parts()?;
    let hardware_client = match maybe_fake_args {
        Some(fake_args) => hwlink::fake_hardware_client(fake_args),
        None => hwlink::real_hardware_client().await?,
    };
    hwlink::run(command, settings, &mut output, hardware_client, output_format).await?;
    Ok(String::from_utf8(output)?)
}

async fn run_with_argv<const N: usize>(
    argv: [&str; N],
    output_format: hwlink::OutputFormat,
) -> anyhow::Result<String> {
    let parsed_args = hwlink::Args::try_parse_from(argv)?;
    run_with_parsed_args(parsed_args, output_format).await
}

fn parse_json_line(stdout: &str) -> anyhow::Result<Value> {
    let mut lines = stdout.lines();
    let line = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("no output line"))?;
    assert_eq!(None, lines.next());
    Ok(serde_json::from_str(line)?)
}

#[tokio::test]
async fn app_version_command_reports_fake_device_as_json() -> anyhow::Result<()> {
    let stdout = run_with_argv(
        ["hwlink", "--fake", "app-version"],
        hwlink::OutputFormat::Json,
    )
    .await?;
    let report = parse_json_line(&stdout)?;

    assert_eq!("BOLOS", report["name"]);
    assert_eq!("2.2.3", report["version"]);
    assert_eq!("Ledger Nano X FAKE", report["device"]["local_name"]);
    assert_eq!("nano_x", report["device"]["family"]);
    Ok(())
}

#[tokio::test]
async fn send_command_reports_scripted_status_word() -> anyhow::Result<()> {
    let stdout = run_with_argv(
        [
            "hwlink",
            "--fake",
            "--fake-response",
            "01026e00",
            "send",
            "e0 01 00 00 00",
        ],
        hwlink::OutputFormat::Json,
    )
    .await?;
    let report = parse_json_line(&stdout)?;

    assert_eq!("6e00", report["status_word"]);
    assert_eq!(false, report["success"]);
    assert_eq!("0102", report["data"]);
    Ok(())
}

#[tokio::test]
async fn send_command_prints_pretty_response() -> anyhow::Result<()> {
    let fake = hwlink::FakeArgs::builder().mtu(0x20)?.build();
    let args = hwlink::Args::new(hwlink::Command::Send(hwlink::SendArgs::new(vec![
        0xe0, 0x01, 0x00, 0x00, 0x00,
    ])))
    .with_fake(fake);

    let stdout = run_with_parsed_args(args, hwlink::OutputFormat::Pretty).await?;

    assert!(stdout.contains("Ledger Nano X FAKE"), "{stdout}");
    assert!(stdout.contains("9000"), "{stdout}");
    Ok(())
}

#[tokio::test]
async fn unmatched_name_prefix_fails() -> anyhow::Result<()> {
    let outcome = run_with_argv(
        ["hwlink", "--fake", "--name-prefix", "Trezor", "app-version"],
        hwlink::OutputFormat::Json,
    )
    .await;

    let error = outcome.err().ok_or_else(|| anyhow::anyhow!("command succeeded"))?;
    assert!(
        matches!(
            error.downcast_ref::<hwlink::DeviceExchangeError>(),
            Some(hwlink::DeviceExchangeError::Link(
                hwlink::LinkError::NoMatchingFixtureDevice { .. }
            ))
        ),
        "{error:?}"
    );
    Ok(())
}

#[test]
fn invalid_apdu_hex_is_a_parse_error() {
    let error = hwlink::Args::try_parse_from(["hwlink", "--fake", "send", "e0zz"])
        .err()
        .map(|error| error.kind());

    assert_eq!(Some(ErrorKind::ValueValidation), error);
}

#[test]
fn fake_mtu_requires_fake() {
    let error = hwlink::Args::try_parse_from(["hwlink", "--fake-mtu", "32", "app-version"])
        .err()
        .map(|error| error.kind());

    assert_eq!(Some(ErrorKind::MissingRequiredArgument), error);
}

#[test]
fn tiny_fake_mtu_is_rejected() -> anyhow::Result<()> {
    let args = hwlink::Args::try_parse_from(["hwlink", "--fake", "--fake-mtu", "3", "app-version"])?;

    let error = args
        .into_parts()
        .err()
        .ok_or_else(|| anyhow::anyhow!("tiny MTU accepted"))?;

    assert!(
        matches!(
            error.downcast_ref::<hwlink::FixtureError>(),
            Some(hwlink::FixtureError::MtuTooSmall)
        ),
        "{error:?}"
    );
    Ok(())
}

#[test]
fn zero_reconnection_timeout_is_rejected() -> anyhow::Result<()> {
    let args = hwlink::Args::try_parse_from([
        "hwlink",
        "--fake",
        "--reconnection-timeout",
        "0s",
        "app-version",
    ])?;

    assert!(args.into_parts().is_err());
    Ok(())
}
