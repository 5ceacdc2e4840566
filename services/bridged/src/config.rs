use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// The placeholder secret shipped in the example config. Startup refuses it.
pub const PLACEHOLDER_SECRET: &str = "changeme-shared-secret";

pub const DEFAULT_TOPIC_PREFIX: &str = "br/";

/// Serial device and link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Pre-shared handshake secret. Absent means an unauthenticated lab link.
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u16,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u8,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u32,
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub tls_insecure: bool,
    #[serde(default)]
    pub cafile: Option<PathBuf>,
    #[serde(default)]
    pub certfile: Option<PathBuf>,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
}

/// Backpressure caps and sandbox quotas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_console_queue_limit_bytes")]
    pub console_queue_limit_bytes: usize,
    #[serde(default = "default_mailbox_queue_limit")]
    pub mailbox_queue_limit: usize,
    #[serde(default = "default_mailbox_queue_bytes_limit")]
    pub mailbox_queue_bytes_limit: usize,
    #[serde(default = "default_pending_pin_request_limit")]
    pub pending_pin_request_limit: usize,
    #[serde(default = "default_file_write_max_bytes")]
    pub file_write_max_bytes: usize,
    #[serde(default = "default_file_storage_quota_bytes")]
    pub file_storage_quota_bytes: u64,
    #[serde(default = "default_process_slots")]
    pub process_slots: usize,
}

/// Filesystem sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_file_system_root")]
    pub system_root: PathBuf,
}

/// Deny-by-default switches gating sensitive MQTT topic actions, plus the
/// shell allow-list. Every switch defaults to off; operators opt in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizeConfig {
    #[serde(default)]
    pub allow_file_read: bool,
    #[serde(default)]
    pub allow_file_write: bool,
    #[serde(default)]
    pub allow_file_remove: bool,
    #[serde(default)]
    pub allow_datastore_get: bool,
    #[serde(default)]
    pub allow_datastore_put: bool,
    #[serde(default)]
    pub allow_mailbox_read: bool,
    #[serde(default)]
    pub allow_mailbox_write: bool,
    #[serde(default)]
    pub allow_shell_run: bool,
    #[serde(default)]
    pub allow_shell_run_async: bool,
    #[serde(default)]
    pub allow_shell_poll: bool,
    #[serde(default)]
    pub allow_shell_kill: bool,
    #[serde(default)]
    pub allow_console_input: bool,
    #[serde(default)]
    pub allow_digital_read: bool,
    #[serde(default)]
    pub allow_digital_write: bool,
    #[serde(default)]
    pub allow_digital_mode: bool,
    #[serde(default)]
    pub allow_analog_read: bool,
    #[serde(default)]
    pub allow_analog_write: bool,
    /// Space-separated binary names runnable through the shell topics. Empty
    /// means none; the single entry `*` means all (lab setups only).
    #[serde(default)]
    pub allowed_commands: String,
}

/// Status snapshot and republish cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_summary_interval_secs")]
    pub bridge_summary_interval: u64,
    #[serde(default = "default_handshake_interval_secs")]
    pub bridge_handshake_interval: u64,
    #[serde(default)]
    pub allow_non_tmp_paths: bool,
}

/// Optional Prometheus/JSON metrics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> MetricsConfig {
        MetricsConfig {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub serial: SerialConfig,
    pub mqtt: MqttConfig,
    #[serde(default = "default_limits")]
    pub limits: LimitsConfig,
    #[serde(default = "default_files")]
    pub files: FilesConfig,
    #[serde(default)]
    pub authorize: AuthorizeConfig,
    #[serde(default = "default_status")]
    pub status: StatusConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Optional sloggers TOML file for the process logger.
    #[serde(default)]
    pub log_config: Option<PathBuf>,
}

/// Rejection reasons; all abort startup with exit code 1.
#[derive(Debug)]
pub enum ConfigError {
    Read(String),
    PlaceholderSecret,
    EmptySerialPort,
    BadBaud(u32),
    TlsMaterialMissing(&'static str),
    MalformedAllowList(String),
    ShellWithoutAllowList,
    NonTmpPath(PathBuf),
    BadInterval(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Read(detail) => write!(f, "config unreadable: {}", detail),
            ConfigError::PlaceholderSecret => {
                write!(f, "serial.shared_secret still holds the placeholder value")
            }
            ConfigError::EmptySerialPort => write!(f, "serial.port must not be empty"),
            ConfigError::BadBaud(baud) => write!(f, "unsupported baudrate {}", baud),
            ConfigError::TlsMaterialMissing(which) => {
                write!(f, "mqtt.tls enabled but {} is missing or unreadable", which)
            }
            ConfigError::MalformedAllowList(detail) => {
                write!(f, "authorize.allowed_commands malformed: {}", detail)
            }
            ConfigError::ShellWithoutAllowList => write!(
                f,
                "shell topics enabled but authorize.allowed_commands is empty"
            ),
            ConfigError::NonTmpPath(path) => write!(
                f,
                "{} is outside /tmp; set status.allow_non_tmp_paths to override",
                path.display()
            ),
            ConfigError::BadInterval(which) => write!(f, "{} must be greater than zero", which),
        }
    }
}

impl std::error::Error for ConfigError {}

impl BridgeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BridgeConfig, ConfigError> {
        let config: BridgeConfig = serdeconv::from_toml_file(path.as_ref())
            .map_err(|err| ConfigError::Read(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<BridgeConfig, ConfigError> {
        let config: BridgeConfig =
            serdeconv::from_toml_str(raw).map_err(|err| ConfigError::Read(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The parsed shell allow-list. `None` stands for the `*` wildcard.
    pub fn allowed_commands(&self) -> Option<Vec<String>> {
        parse_allow_list(&self.authorize.allowed_commands).expect("validated at load time")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.is_empty() {
            return Err(ConfigError::EmptySerialPort);
        }

        if let Some(ref secret) = self.serial.shared_secret {
            if secret == PLACEHOLDER_SECRET {
                return Err(ConfigError::PlaceholderSecret);
            }
        }

        if self.serial.baud < 1200 || self.serial.baud > 1_000_000 {
            return Err(ConfigError::BadBaud(self.serial.baud));
        }

        if self.mqtt.tls {
            match self.mqtt.cafile {
                Some(ref cafile) if cafile.is_file() => (),
                _ => return Err(ConfigError::TlsMaterialMissing("mqtt.cafile")),
            }
            // Client certificates travel as a pair.
            match (&self.mqtt.certfile, &self.mqtt.keyfile) {
                (None, None) => (),
                (Some(cert), Some(key)) if cert.is_file() && key.is_file() => (),
                _ => return Err(ConfigError::TlsMaterialMissing("mqtt.certfile/keyfile")),
            }
        }

        let allow_list = parse_allow_list(&self.authorize.allowed_commands)
            .map_err(ConfigError::MalformedAllowList)?;
        let shell_enabled = self.authorize.allow_shell_run || self.authorize.allow_shell_run_async;
        if shell_enabled {
            match allow_list {
                Some(ref list) if list.is_empty() => {
                    return Err(ConfigError::ShellWithoutAllowList)
                }
                _ => (),
            }
        }

        if !self.status.allow_non_tmp_paths {
            for path in [&self.status.snapshot_path, &self.mqtt.spool_dir].iter() {
                if !path.starts_with("/tmp") {
                    return Err(ConfigError::NonTmpPath(path.to_path_buf()));
                }
            }
        }

        if self.status.snapshot_interval_secs == 0 {
            return Err(ConfigError::BadInterval("status.snapshot_interval_secs"));
        }
        if self.status.bridge_summary_interval == 0 {
            return Err(ConfigError::BadInterval("status.bridge_summary_interval"));
        }
        if self.status.bridge_handshake_interval == 0 {
            return Err(ConfigError::BadInterval("status.bridge_handshake_interval"));
        }

        Ok(())
    }
}

/// `None` = wildcard, `Some(list)` = exact binary names. The wildcard is
/// recognised only as the sole entry.
fn parse_allow_list(raw: &str) -> Result<Option<Vec<String>>, String> {
    let entries: Vec<&str> = raw.split_whitespace().collect();

    if entries.iter().any(|entry| *entry == "*") {
        if entries.len() != 1 {
            return Err("`*` must be the only entry".to_string());
        }
        return Ok(None);
    }

    if let Some(bad) = entries.iter().find(|entry| entry.contains('/')) {
        return Err(format!("`{}` must be a bare binary name", bad));
    }

    Ok(Some(entries.iter().map(|entry| entry.to_string()).collect()))
}

fn default_baud() -> u32 {
    115200
}
fn default_ack_timeout_ms() -> u16 {
    ferrite::spec::DEFAULT_ACK_TIMEOUT_MS
}
fn default_retry_limit() -> u8 {
    ferrite::spec::DEFAULT_RETRY_LIMIT
}
fn default_response_timeout_ms() -> u32 {
    ferrite::spec::DEFAULT_RESPONSE_TIMEOUT_MS
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}
fn default_queue_limit() -> usize {
    256
}
fn default_spool_dir() -> PathBuf {
    PathBuf::from("/tmp/bridged/spool")
}
fn default_console_queue_limit_bytes() -> usize {
    4096
}
fn default_mailbox_queue_limit() -> usize {
    32
}
fn default_mailbox_queue_bytes_limit() -> usize {
    16384
}
fn default_pending_pin_request_limit() -> usize {
    8
}
fn default_file_write_max_bytes() -> usize {
    65536
}
fn default_file_storage_quota_bytes() -> u64 {
    1_048_576
}
fn default_process_slots() -> usize {
    4
}
fn default_file_system_root() -> PathBuf {
    PathBuf::from("/tmp/bridged/files")
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/tmp/bridged/status.json")
}
fn default_snapshot_interval_secs() -> u64 {
    5
}
fn default_summary_interval_secs() -> u64 {
    60
}
fn default_handshake_interval_secs() -> u64 {
    60
}
fn default_metrics_listen() -> String {
    "127.0.0.1:9465".to_string()
}
fn default_limits() -> LimitsConfig {
    LimitsConfig {
        console_queue_limit_bytes: default_console_queue_limit_bytes(),
        mailbox_queue_limit: default_mailbox_queue_limit(),
        mailbox_queue_bytes_limit: default_mailbox_queue_bytes_limit(),
        pending_pin_request_limit: default_pending_pin_request_limit(),
        file_write_max_bytes: default_file_write_max_bytes(),
        file_storage_quota_bytes: default_file_storage_quota_bytes(),
        process_slots: default_process_slots(),
    }
}
fn default_files() -> FilesConfig {
    FilesConfig {
        system_root: default_file_system_root(),
    }
}
fn default_status() -> StatusConfig {
    StatusConfig {
        snapshot_path: default_snapshot_path(),
        snapshot_interval_secs: default_snapshot_interval_secs(),
        bridge_summary_interval: default_summary_interval_secs(),
        bridge_handshake_interval: default_handshake_interval_secs(),
        allow_non_tmp_paths: false,
    }
}
