use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rstest::rstest;

use hwlink::{
    AppAndVersion, BleDeviceConnection, BleDeviceConnectionParams, ConnectionConfig,
    DeviceExchangeError, FakeDevice, GET_APP_AND_VERSION,
};

const OPEN_APP: [u8; 8] = [0xe0, 0xd8, 0x00, 0x00, 0x03, 0x42, 0x54, 0x43];

fn config() -> ConnectionConfig {
    ConnectionConfig::builder()
        .settle_delay(Duration::from_millis(10))
        .retry_backoff(Duration::from_millis(5))
        .build()
}

fn connection(device: &FakeDevice) -> anyhow::Result<Arc<BleDeviceConnection>> {
    Ok(Arc::new(BleDeviceConnection::new(
        BleDeviceConnectionParams::builder()
            .link(device.link())
            .characteristics(device.characteristics()?)
            .characteristic_ids(device.characteristic_ids())
            .config(config())
            .build(),
    )))
}

#[tokio::test(start_paused = true)]
async fn setup_negotiates_frame_size() -> anyhow::Result<()> {
    let device = FakeDevice::builder().build();
    let connection = connection(&device)?;
    assert!(!connection.is_ready());

    connection.setup().await?;

    assert!(connection.is_ready());
    assert_eq!(1, device.written_frames().len());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn setup_skips_zero_size_replies() -> anyhow::Result<()> {
    let device = FakeDevice::builder().zero_mtu_replies_first(2).build();
    let connection = connection(&device)?;

    connection.setup().await?;

    assert!(connection.is_ready());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn setup_fails_when_device_never_answers_mtu_request() -> anyhow::Result<()> {
    let device = FakeDevice::builder().ignore_mtu_requests(true).build();
    let connection = connection(&device)?;

    let outcome = connection.setup().await;

    assert_matches!(outcome, Err(DeviceExchangeError::DeviceNotInitialized { .. }));
    assert!(!connection.is_ready());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn app_and_version_round_trip() -> anyhow::Result<()> {
    let device = FakeDevice::builder().build();
    let connection = connection(&device)?;
    connection.setup().await?;

    let response = connection
        .send_apdu(&GET_APP_AND_VERSION, false, None)
        .await?;
    let app = AppAndVersion::decode(&response)?;

    assert_eq!("BOLOS", app.name());
    assert_eq!("2.2.3", app.version());
    assert_eq!(vec![GET_APP_AND_VERSION.to_vec()], device.received_apdus());
    Ok(())
}

#[rstest]
#[case::two_frames(0x10, 14)]
#[case::many_frames(0x10, 120)]
#[case::large_mtu(0x99, 200)]
#[tokio::test(start_paused = true)]
async fn long_apdus_are_split_and_reassembled(
    #[case] mtu: u8,
    #[case] payload_len: usize,
) -> anyhow::Result<()> {
    let device = FakeDevice::builder().mtu(mtu).build();
    let connection = connection(&device)?;
    connection.setup().await?;
    let mut apdu = vec![0xe0, 0x04, 0x00, 0x00, u8::try_from(payload_len.min(255))?];
    apdu.extend((0..payload_len).map(|index| (index % 251) as u8));

    let response = connection.send_apdu(&apdu, false, None).await?;

    assert!(response.is_success());
    assert_eq!(vec![apdu], device.received_apdus());
    assert!(device.written_frames().len() > 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scripted_status_word_is_returned_as_is() -> anyhow::Result<()> {
    let device = FakeDevice::builder()
        .responses(vec![vec![0x6e, 0x00]])
        .build();
    let connection = connection(&device)?;
    connection.setup().await?;

    let response = connection.send_apdu(&OPEN_APP, false, None).await?;

    assert_eq!(0x6e00, response.status_word());
    assert!(!response.is_success());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_without_setup_negotiates_first() -> anyhow::Result<()> {
    let device = FakeDevice::builder().build();
    let connection = connection(&device)?;

    let response = connection
        .send_apdu(&GET_APP_AND_VERSION, false, None)
        .await?;

    assert!(response.is_success());
    assert!(connection.is_ready());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_device_times_out() -> anyhow::Result<()> {
    let device = FakeDevice::builder().silent(true).build();
    let connection = connection(&device)?;
    connection.setup().await?;

    let outcome = connection
        .send_apdu(&GET_APP_AND_VERSION, false, Some(Duration::from_secs(1)))
        .await;

    assert_matches!(
        outcome,
        Err(DeviceExchangeError::SendApduTimeout { timeout }) if timeout == Duration::from_secs(1)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejected_writes_surface_as_timeout() -> anyhow::Result<()> {
    let device = FakeDevice::builder().build();
    let connection = connection(&device)?;
    connection.setup().await?;
    device.fail_next_writes(1);

    let outcome = connection
        .send_apdu(&GET_APP_AND_VERSION, false, Some(Duration::from_millis(500)))
        .await;

    assert_matches!(outcome, Err(DeviceExchangeError::SendApduTimeout { .. }));
    assert!(device.received_apdus().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_on_dropped_link_fails_with_reconnection_failed() -> anyhow::Result<()> {
    let device = FakeDevice::builder().build();
    let connection = connection(&device)?;
    connection.setup().await?;
    device.drop_link();

    let outcome = connection
        .send_apdu(&GET_APP_AND_VERSION, false, None)
        .await;

    assert_matches!(outcome, Err(DeviceExchangeError::ReconnectionFailed));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnecting_command_waits_for_reconnect() -> anyhow::Result<()> {
    let device = FakeDevice::builder()
        .restart_delay(Duration::from_millis(300))
        .build();
    let connection = connection(&device)?;
    connection.setup().await?;

    let sending = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.send_apdu(&OPEN_APP, true, None).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!device.is_connected());
    assert!(!sending.is_finished());

    tokio::time::sleep(Duration::from_millis(300)).await;
    connection.reconnect().await?;
    let response = sending.await??;

    assert!(response.is_success());
    assert!(device.is_connected());
    assert!(connection.is_ready());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_reconnect_attempt_keeps_the_send_waiting() -> anyhow::Result<()> {
    let device = FakeDevice::builder()
        .restart_delay(Duration::from_millis(300))
        .build();
    let connection = connection(&device)?;
    connection.setup().await?;

    let sending = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.send_apdu(&OPEN_APP, true, None).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_matches!(connection.reconnect().await, Err(DeviceExchangeError::Link(_)));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!sending.is_finished());

    tokio::time::sleep(Duration::from_millis(400)).await;
    connection.reconnect().await?;

    assert!(sending.await??.is_success());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_rejects_waiting_send() -> anyhow::Result<()> {
    let device = FakeDevice::builder()
        .restart_delay(Duration::from_secs(10))
        .build();
    let connection = connection(&device)?;
    connection.setup().await?;

    let sending = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.send_apdu(&OPEN_APP, true, None).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    connection.disconnect();

    assert_matches!(sending.await?, Err(DeviceExchangeError::ReconnectionFailed));
    assert!(!connection.is_ready());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reconnect_fails_while_device_restarts() -> anyhow::Result<()> {
    let device = FakeDevice::builder().build();
    let connection = connection(&device)?;
    connection.setup().await?;
    device.set_restarting(true);
    device.drop_link();

    let outcome = connection.reconnect().await;

    assert_matches!(outcome, Err(DeviceExchangeError::Link(_)));
    assert!(!connection.is_ready());
    assert_eq!(1, device.connect_calls());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reconnect_restarts_notifications() -> anyhow::Result<()> {
    let device = FakeDevice::builder().build();
    let connection = connection(&device)?;
    connection.setup().await?;
    let attempts_before = device.start_notification_attempts();
    device.drop_link();

    connection.reconnect().await?;
    let response = connection
        .send_apdu(&GET_APP_AND_VERSION, false, None)
        .await?;

    assert!(response.is_success());
    assert!(device.start_notification_attempts() > attempts_before);
    Ok(())
}
