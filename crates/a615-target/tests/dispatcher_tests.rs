//! Dispatcher driving the whole target: maintenance entry, load, image
//! verification and the access point retry policy.

mod common;

use a615_codec::RecordKind;
use a615_target::ap::AccessPoint;
use a615_target::config::SensorConfig;
use a615_target::sensors::StaticSensors;
use a615_target::tftp::packet::{OCTET_MODE, Packet, data_packet};
use a615_target::verify::{Sha256ImageVerifier, package_image};
use a615_target::{
    Collaborators, ConnectionSubstate, Dispatcher, DispatcherSettings, EventKind,
    MaintenanceSubstate, StateSnapshot, SystemMode, TargetConfig, TargetError, TargetHandle,
    event_channel,
};
use common::{
    FakeGse, LOAD_PART_NUMBER, Loader, PART_NUMBER, TestResult, WAIT, sample_lur, temp_dir,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn test_config(gse: &FakeGse) -> TestResult<TargetConfig> {
    let mut config = TargetConfig::default();
    config.root_dir = temp_dir("dispatcher")?;
    config.bind_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    config.gse.get_addr = gse.get_addr;
    config.gse.put_addr = gse.put_addr;
    config.timeouts.session_recv_ms = 1000;
    config.timeouts.client_recv_ms = 300;
    config.timeouts.dispatcher_poll_ms = 20;
    config.access_point.simulate_station = true;
    config.access_point.retry_backoff_ms = 20;
    Ok(config)
}

fn start(config: &TargetConfig, collaborators: Option<Collaborators>) -> TestResult<TargetHandle> {
    let (events, rx) = event_channel(config.queues.events, config.timeouts.event_post())?;
    let collaborators = collaborators.unwrap_or_else(|| Collaborators::host(config, &events));
    let (dispatcher, handle) =
        Dispatcher::new(DispatcherSettings::from(config), collaborators, events, rx);
    tokio::spawn(dispatcher.run());
    Ok(handle)
}

fn maintenance(maintenance: MaintenanceSubstate, connection: ConnectionSubstate) -> StateSnapshot {
    StateSnapshot {
        mode: SystemMode::Maintenance,
        maintenance,
        connection,
    }
}

async fn eventually(condition: impl Fn() -> bool) -> TestResult {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err("condition not met in time".into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

async fn upload_lur(target: SocketAddr) -> TestResult {
    let mut loader = Loader::new(target).await?;
    loader
        .send_request(Packet::Wrq {
            filename: RecordKind::Lur.file_name(PART_NUMBER),
            mode: OCTET_MODE.to_string(),
        })
        .await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 0 });
    loader.send_session(&data_packet(1, &sample_lur()?)).await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 1 });
    Ok(())
}

#[tokio::test]
async fn verified_load_waits_for_authorization() -> TestResult {
    let image = package_image(PART_NUMBER, b"flight software build 7")?;
    let gse = FakeGse::start(HashMap::from([(LOAD_PART_NUMBER.to_string(), image)])).await?;
    let config = test_config(&gse)?;
    let handle = start(&config, None)?;

    handle.events().post(EventKind::EnterMaintenanceRequest).await?;
    let target = handle.wait_for_listener(WAIT).await?;
    handle
        .wait_for_state(
            |s| *s == maintenance(MaintenanceSubstate::Connected, ConnectionSubstate::WaitingRequest),
            WAIT,
        )
        .await?;

    upload_lur(target).await?;
    handle
        .wait_for_state(
            |s| s.maintenance == MaintenanceSubstate::WaitingAuthorization,
            WAIT,
        )
        .await?;
    assert_eq!(handle.state().connection, ConnectionSubstate::Unset);
    assert!(config.root_dir.join(LOAD_PART_NUMBER).exists());

    handle
        .events()
        .post(EventKind::AbortMaintenanceImmediate)
        .await?;
    handle
        .wait_for_state(|s| *s == StateSnapshot::OPERATIONAL, WAIT)
        .await?;
    eventually(|| handle.listener_addr().is_none()).await?;
    handle.shutdown();
    Ok(())
}

#[tokio::test]
async fn image_for_other_device_reopens_receiving() -> TestResult {
    let image = package_image("EMB-HW-999-999-999", b"someone else's software")?;
    let gse = FakeGse::start(HashMap::from([(LOAD_PART_NUMBER.to_string(), image)])).await?;
    let config = test_config(&gse)?;
    let handle = start(&config, None)?;

    handle.events().post(EventKind::EnterMaintenanceRequest).await?;
    let target = handle.wait_for_listener(WAIT).await?;
    handle
        .wait_for_state(|s| s.connection == ConnectionSubstate::WaitingRequest, WAIT)
        .await?;

    upload_lur(target).await?;
    let stored = config.root_dir.join(LOAD_PART_NUMBER);
    eventually(|| stored.exists()).await?;
    // Verification fails and a bad image never authorizes.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        handle.state(),
        maintenance(MaintenanceSubstate::Connected, ConnectionSubstate::ReceivingPackets)
    );
    handle.shutdown();
    Ok(())
}

/// Access point that fails a fixed number of starts before coming up.
struct FlakyAccessPoint {
    failures_left: AtomicU32,
    starts: Arc<AtomicU32>,
}

impl AccessPoint for FlakyAccessPoint {
    fn start(&self) -> a615_target::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(TargetError::Transport("radio did not come up".to_string()));
        }
        Ok(())
    }

    fn stop(&self) {}
}

fn flaky(config: &TargetConfig, failures: u32) -> (Collaborators, Arc<AtomicU32>) {
    let starts = Arc::new(AtomicU32::new(0));
    let collaborators = Collaborators {
        access_point: Arc::new(FlakyAccessPoint {
            failures_left: AtomicU32::new(failures),
            starts: Arc::clone(&starts),
        }),
        sensors: Arc::new(StaticSensors::new(&config.maintenance.sensors)),
        verifier: Arc::new(Sha256ImageVerifier::new(PART_NUMBER)),
    };
    (collaborators, starts)
}

#[tokio::test]
async fn access_point_failures_are_retried() -> TestResult {
    let gse = FakeGse::start(HashMap::new()).await?;
    let config = test_config(&gse)?;
    let (collaborators, starts) = flaky(&config, 2);
    let handle = start(&config, Some(collaborators))?;

    handle.events().post(EventKind::EnterMaintenanceRequest).await?;
    handle.wait_for_listener(WAIT).await?;
    assert_eq!(handle.state().mode, SystemMode::Maintenance);
    assert_eq!(starts.load(Ordering::SeqCst), 3);
    handle.shutdown();
    Ok(())
}

#[tokio::test]
async fn retries_stop_after_configured_attempts() -> TestResult {
    let gse = FakeGse::start(HashMap::new()).await?;
    let config = test_config(&gse)?;
    let (collaborators, starts) = flaky(&config, u32::MAX);
    let handle = start(&config, Some(collaborators))?;

    handle.events().post(EventKind::EnterMaintenanceRequest).await?;
    eventually(|| starts.load(Ordering::SeqCst) >= config.access_point.max_start_attempts).await?;
    // Longer than any remaining backoff.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(starts.load(Ordering::SeqCst), config.access_point.max_start_attempts);
    assert_eq!(handle.state(), StateSnapshot::OPERATIONAL);
    assert_eq!(handle.listener_addr(), None);
    handle.shutdown();
    Ok(())
}

#[tokio::test]
async fn sensor_interlock_blocks_maintenance() -> TestResult {
    let gse = FakeGse::start(HashMap::new()).await?;
    let mut config = test_config(&gse)?;
    config.maintenance.require_sensor_interlock = true;
    config.maintenance.sensors = SensorConfig {
        parking_brake: true,
        weight_on_wheels: false,
        maintenance_signal: true,
    };
    let handle = start(&config, None)?;

    handle.events().post(EventKind::EnterMaintenanceRequest).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.state(), StateSnapshot::OPERATIONAL);
    assert_eq!(handle.listener_addr(), None);

    handle.shutdown();
    Ok(())
}

#[tokio::test]
async fn sensor_interlock_allows_maintenance_on_ground() -> TestResult {
    let gse = FakeGse::start(HashMap::new()).await?;
    let mut config = test_config(&gse)?;
    config.maintenance.require_sensor_interlock = true;
    config.maintenance.sensors = SensorConfig {
        parking_brake: true,
        weight_on_wheels: true,
        maintenance_signal: true,
    };
    let handle = start(&config, None)?;

    handle.events().post(EventKind::EnterMaintenanceRequest).await?;
    handle.wait_for_listener(WAIT).await?;
    assert_eq!(handle.state().mode, SystemMode::Maintenance);
    handle.shutdown();
    Ok(())
}
