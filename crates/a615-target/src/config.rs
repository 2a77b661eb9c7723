use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TargetError};

/// Longest part number accepted in configuration; it must fit in a TFTP
/// file name.
pub const MAX_PART_NUMBER_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Directory the downloaded loads are written to
    pub root_dir: PathBuf,
    /// Well-known TFTP address the packet source binds in maintenance mode
    pub bind_addr: SocketAddr,
    pub device: DeviceConfig,
    pub gse: GseConfig,
    pub timeouts: TimeoutConfig,
    pub queues: QueueConfig,
    pub access_point: AccessPointConfig,
    pub maintenance: MaintenanceConfig,
    pub logging: LoggingConfig,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/a615-target/loads"),
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 69),
            device: DeviceConfig::default(),
            gse: GseConfig::default(),
            timeouts: TimeoutConfig::default(),
            queues: QueueConfig::default(),
            access_point: AccessPointConfig::default(),
            maintenance: MaintenanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Hardware part number; file names must contain it to address this target
    pub part_number: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            part_number: "EMB-HW-002-021-003".to_string(),
        }
    }
}

/// Ground support equipment (data loader) endpoints used in the active role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GseConfig {
    /// Where load files are fetched from (GET)
    pub get_addr: SocketAddr,
    /// Where status files are uploaded to (PUT)
    pub put_addr: SocketAddr,
}

impl Default for GseConfig {
    fn default() -> Self {
        let gse = Ipv4Addr::new(192, 168, 4, 2);
        Self {
            get_addr: SocketAddr::new(gse.into(), 6969),
            put_addr: SocketAddr::new(gse.into(), 69),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Receive timeout of the well-known port listener
    pub listener_recv_ms: u64,
    /// Receive timeout inside a server-side session
    pub session_recv_ms: u64,
    /// Receive timeout of the active-role client
    pub client_recv_ms: u64,
    /// How long a producer waits on a full event queue; unset waits forever
    pub event_post_ms: Option<u64>,
    /// Dispatcher poll interval for housekeeping
    pub dispatcher_poll_ms: u64,
    /// Upper bound on stopping the maintenance network tasks
    pub stack_shutdown_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            listener_recv_ms: 1000,
            session_recv_ms: 3000,
            client_recv_ms: 2000,
            event_post_ms: Some(1000),
            dispatcher_poll_ms: 100,
            stack_shutdown_ms: 2000,
        }
    }
}

impl TimeoutConfig {
    pub fn listener_recv(&self) -> Duration {
        Duration::from_millis(self.listener_recv_ms)
    }

    pub fn session_recv(&self) -> Duration {
        Duration::from_millis(self.session_recv_ms)
    }

    pub fn client_recv(&self) -> Duration {
        Duration::from_millis(self.client_recv_ms)
    }

    pub fn event_post(&self) -> Option<Duration> {
        self.event_post_ms.map(Duration::from_millis)
    }

    pub fn dispatcher_poll(&self) -> Duration {
        Duration::from_millis(self.dispatcher_poll_ms)
    }

    pub fn stack_shutdown(&self) -> Duration {
        Duration::from_millis(self.stack_shutdown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub events: usize,
    pub packets: usize,
    pub lus: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            events: 10,
            packets: 8,
            lus: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub channel: u8,
    /// Attempts to bring the access point up before giving up
    pub max_start_attempts: u32,
    /// Backoff between attempts, multiplied by the attempt number
    pub retry_backoff_ms: u64,
    /// Report a station association right after start (no radio on the host)
    pub simulate_station: bool,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "A615-TARGET".to_string(),
            channel: 6,
            max_start_attempts: 3,
            retry_backoff_ms: 1000,
            simulate_station: false,
        }
    }
}

impl AccessPointConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Refuse maintenance unless parking brake, weight on wheels and the
    /// maintenance discrete are all set
    pub require_sensor_interlock: bool,
    /// Route load requests through a credential exchange phase
    pub require_credential_exchange: bool,
    pub sensors: SensorConfig,
}

/// Fixed sensor readings for hosts without discrete inputs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SensorConfig {
    pub parking_brake: bool,
    pub weight_on_wheels: bool,
    pub maintenance_signal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Emit structured JSON audit records for load activity
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// One JSON object per line
    Json,
}

pub fn load_config(path: &Path) -> Result<TargetConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TargetConfig = toml::from_str(&contents)
        .map_err(|e| TargetError::Config(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &TargetConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TargetError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate the target configuration before anything is started.
pub fn validate_config(config: &TargetConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TargetError::Config(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TargetError::Config("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TargetError::Config(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TargetError::Io(e)),
    }

    if config.bind_addr.port() == 0 {
        return Err(TargetError::Config(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TargetError::Config(format!(
            "bind_addr is not available: {}",
            e
        )));
    }

    let part_number = config.device.part_number.trim();
    if part_number.is_empty() {
        return Err(TargetError::Config(
            "device.part_number must not be empty".to_string(),
        ));
    }
    if part_number.len() > MAX_PART_NUMBER_LEN {
        return Err(TargetError::Config(format!(
            "device.part_number exceeds {} bytes",
            MAX_PART_NUMBER_LEN
        )));
    }

    for (name, port) in [
        ("gse.get_addr", config.gse.get_addr.port()),
        ("gse.put_addr", config.gse.put_addr.port()),
    ] {
        if port == 0 {
            return Err(TargetError::Config(format!("{name} port must be non-zero")));
        }
    }

    validate_queue_config(&config.queues)?;
    validate_timeout_config(&config.timeouts)?;
    validate_access_point_config(&config.access_point)?;

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TargetError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TargetError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(TargetError::Config(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
    }

    Ok(())
}

fn validate_queue_config(queues: &QueueConfig) -> Result<()> {
    for (name, capacity) in [
        ("queues.events", queues.events),
        ("queues.packets", queues.packets),
        ("queues.lus", queues.lus),
    ] {
        if capacity == 0 {
            return Err(TargetError::Config(format!("{name} must be at least 1")));
        }
    }
    Ok(())
}

fn validate_timeout_config(timeouts: &TimeoutConfig) -> Result<()> {
    for (name, value) in [
        ("timeouts.listener_recv_ms", timeouts.listener_recv_ms),
        ("timeouts.session_recv_ms", timeouts.session_recv_ms),
        ("timeouts.client_recv_ms", timeouts.client_recv_ms),
        ("timeouts.dispatcher_poll_ms", timeouts.dispatcher_poll_ms),
    ] {
        if value == 0 {
            return Err(TargetError::Config(format!("{name} must be non-zero")));
        }
    }
    Ok(())
}

fn validate_access_point_config(ap: &AccessPointConfig) -> Result<()> {
    if ap.ssid.is_empty() || ap.ssid.len() > 32 {
        return Err(TargetError::Config(
            "access_point.ssid must be 1-32 bytes".to_string(),
        ));
    }
    if !(1..=13).contains(&ap.channel) {
        return Err(TargetError::Config(
            "access_point.channel must be in range 1-13".to_string(),
        ));
    }
    if ap.max_start_attempts == 0 {
        return Err(TargetError::Config(
            "access_point.max_start_attempts must be at least 1".to_string(),
        ));
    }
    Ok(())
}
