use crate::bus::{MqttSettings, ReconnectPolicy};
use crate::errors::SignalBenchError;
use crate::logging::{DEFAULT_DISK_BUDGET_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::runtime::FileSystem;
use crate::types::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub trace_path: Option<PathBuf>,
    pub trace_name: Option<String>,
    pub speed: Option<f64>,
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub reconnect: ReconnectConfig,
    pub player: PlayerConfig,
    pub tester: TesterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub player_client_id: String,
    pub tester_client_id: String,
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub inbox_capacity: usize,
    pub startup_retry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub first_delay_secs: u64,
    pub rate: u32,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerConfig {
    pub trace_path: PathBuf,
    pub trace_name: Option<String>,
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TesterConfig {
    pub trace_name: Option<String>,
    pub speed: f64,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub topic_prefix: String,
    pub poll_interval_ms: u64,
    pub loop_interval_ms: u64,
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    pub min_level: LogLevel,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig {
                host: "localhost".to_string(),
                port: 1883,
                username: None,
                password: None,
                player_client_id: "IoT_signal_player".to_string(),
                tester_client_id: "IoT_signal_tester".to_string(),
                qos: 0,
                keep_alive_secs: 5,
                inbox_capacity: 256,
                startup_retry_ms: 1000,
            },
            reconnect: ReconnectConfig {
                first_delay_secs: 1,
                rate: 2,
                max_delay_secs: 60,
                max_attempts: 12,
            },
            player: PlayerConfig {
                trace_path: PathBuf::from("input_file.json"),
                trace_name: None,
                tick_ms: 100,
            },
            tester: TesterConfig {
                trace_name: None,
                speed: 1.0,
                input_dir: PathBuf::from("input_json_files"),
                output_dir: PathBuf::from("output_csv_files"),
                topic_prefix: "mqtt".to_string(),
                poll_interval_ms: 1000,
                loop_interval_ms: 100,
                settle_ms: 1000,
            },
            logging: LoggingConfig {
                path: None,
                min_level: LogLevel::Info,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

impl AppConfig {
    pub fn mqtt_settings(&self, client_id: &str) -> MqttSettings {
        MqttSettings {
            host: self.bus.host.clone(),
            port: self.bus.port,
            client_id: client_id.to_string(),
            username: self.bus.username.clone(),
            password: self.bus.password.clone(),
            qos: self.bus.qos,
            keep_alive: Duration::from_secs(self.bus.keep_alive_secs),
            inbox_capacity: self.bus.inbox_capacity,
            startup_retry: Duration::from_millis(self.bus.startup_retry_ms),
            reconnect: ReconnectPolicy {
                first_delay: Duration::from_secs(self.reconnect.first_delay_secs),
                rate: self.reconnect.rate,
                max_delay: Duration::from_secs(self.reconnect.max_delay_secs),
                max_attempts: self.reconnect.max_attempts,
            },
        }
    }

    pub fn tester_trace_name(&self) -> Result<&str, SignalBenchError> {
        self.tester
            .trace_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                SignalBenchError::InvalidConfig(
                    "tester.trace_name is required (config, TRACE_NAME or --trace-name)"
                        .to_string(),
                )
            })
    }

    pub fn tester_input_path(&self, trace_name: &str) -> PathBuf {
        self.tester
            .input_dir
            .join(format!("input_file_{trace_name}.json"))
    }

    pub fn tester_report_path(&self, trace_name: &str) -> PathBuf {
        self.tester
            .output_dir
            .join(format!("test-result-{trace_name}.csv"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    bus: Option<PartialBusConfig>,
    reconnect: Option<PartialReconnectConfig>,
    player: Option<PartialPlayerConfig>,
    tester: Option<PartialTesterConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialBusConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    player_client_id: Option<String>,
    tester_client_id: Option<String>,
    qos: Option<u8>,
    keep_alive_secs: Option<u64>,
    inbox_capacity: Option<usize>,
    startup_retry_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialReconnectConfig {
    first_delay_secs: Option<u64>,
    rate: Option<u32>,
    max_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPlayerConfig {
    trace_path: Option<PathBuf>,
    trace_name: Option<String>,
    tick_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialTesterConfig {
    trace_name: Option<String>,
    speed: Option<f64>,
    input_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    topic_prefix: Option<String>,
    poll_interval_ms: Option<u64>,
    loop_interval_ms: Option<u64>,
    settle_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    min_level: Option<LogLevel>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

pub fn load_config(
    overrides: &CliOverrides,
    env: &EnvMap,
    fs: &dyn FileSystem,
) -> Result<AppConfig, SignalBenchError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| SignalBenchError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_env_overrides(&mut cfg, env)?;
    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(bus) = partial.bus {
        if let Some(value) = bus.host {
            cfg.bus.host = value;
        }
        if let Some(value) = bus.port {
            cfg.bus.port = value;
        }
        if bus.username.is_some() {
            cfg.bus.username = bus.username;
        }
        if bus.password.is_some() {
            cfg.bus.password = bus.password;
        }
        if let Some(value) = bus.player_client_id {
            cfg.bus.player_client_id = value;
        }
        if let Some(value) = bus.tester_client_id {
            cfg.bus.tester_client_id = value;
        }
        if let Some(value) = bus.qos {
            cfg.bus.qos = value;
        }
        if let Some(value) = bus.keep_alive_secs {
            cfg.bus.keep_alive_secs = value;
        }
        if let Some(value) = bus.inbox_capacity {
            cfg.bus.inbox_capacity = value;
        }
        if let Some(value) = bus.startup_retry_ms {
            cfg.bus.startup_retry_ms = value;
        }
    }

    if let Some(reconnect) = partial.reconnect {
        if let Some(value) = reconnect.first_delay_secs {
            cfg.reconnect.first_delay_secs = value;
        }
        if let Some(value) = reconnect.rate {
            cfg.reconnect.rate = value;
        }
        if let Some(value) = reconnect.max_delay_secs {
            cfg.reconnect.max_delay_secs = value;
        }
        if let Some(value) = reconnect.max_attempts {
            cfg.reconnect.max_attempts = value;
        }
    }

    if let Some(player) = partial.player {
        if let Some(value) = player.trace_path {
            cfg.player.trace_path = value;
        }
        if player.trace_name.is_some() {
            cfg.player.trace_name = player.trace_name;
        }
        if let Some(value) = player.tick_ms {
            cfg.player.tick_ms = value;
        }
    }

    if let Some(tester) = partial.tester {
        if tester.trace_name.is_some() {
            cfg.tester.trace_name = tester.trace_name;
        }
        if let Some(value) = tester.speed {
            cfg.tester.speed = value;
        }
        if let Some(value) = tester.input_dir {
            cfg.tester.input_dir = value;
        }
        if let Some(value) = tester.output_dir {
            cfg.tester.output_dir = value;
        }
        if let Some(value) = tester.topic_prefix {
            cfg.tester.topic_prefix = value;
        }
        if let Some(value) = tester.poll_interval_ms {
            cfg.tester.poll_interval_ms = value;
        }
        if let Some(value) = tester.loop_interval_ms {
            cfg.tester.loop_interval_ms = value;
        }
        if let Some(value) = tester.settle_ms {
            cfg.tester.settle_ms = value;
        }
    }

    if let Some(logging) = partial.logging {
        if logging.path.is_some() {
            cfg.logging.path = logging.path;
        }
        if let Some(value) = logging.min_level {
            cfg.logging.min_level = value;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

fn apply_env_overrides(cfg: &mut AppConfig, env: &EnvMap) -> Result<(), SignalBenchError> {
    let non_empty = |key: &str| env.get(key).filter(|value| !value.trim().is_empty()).cloned();

    if let Some(host) = non_empty("MQTT_HOST") {
        cfg.bus.host = host;
    }
    if let Some(port) = non_empty("MQTT_PORT") {
        cfg.bus.port = port.trim().parse().map_err(|_| {
            SignalBenchError::InvalidConfig(format!("MQTT_PORT must be a port number, got {port}"))
        })?;
    }
    if let Some(username) = non_empty("MQTT_USERNAME") {
        cfg.bus.username = Some(username);
    }
    if let Some(password) = non_empty("MQTT_PASSWORD") {
        cfg.bus.password = Some(password);
    }
    if let Some(trace_name) = non_empty("TRACE_NAME").or_else(|| non_empty("TEST_TRACE")) {
        cfg.tester.trace_name = Some(trace_name);
    }
    Ok(())
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(host) = &overrides.host {
        cfg.bus.host = host.clone();
    }
    if let Some(port) = overrides.port {
        cfg.bus.port = port;
    }
    if let Some(path) = &overrides.trace_path {
        cfg.player.trace_path = path.clone();
    }
    if let Some(name) = &overrides.trace_name {
        cfg.tester.trace_name = Some(name.clone());
    }
    if let Some(speed) = overrides.speed {
        cfg.tester.speed = speed;
    }
    if let Some(dir) = &overrides.input_dir {
        cfg.tester.input_dir = dir.clone();
    }
    if let Some(dir) = &overrides.output_dir {
        cfg.tester.output_dir = dir.clone();
    }
    if let Some(path) = &overrides.log_path {
        cfg.logging.path = Some(path.clone());
    }
    if let Some(level) = overrides.log_level {
        cfg.logging.min_level = level;
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), SignalBenchError> {
    let invalid = |message: &str| Err(SignalBenchError::InvalidConfig(message.to_string()));

    if cfg.bus.host.trim().is_empty() {
        return invalid("bus.host must not be empty");
    }
    if cfg.bus.qos > 2 {
        return invalid("bus.qos must be 0, 1 or 2");
    }
    if cfg.bus.inbox_capacity == 0 {
        return invalid("bus.inbox_capacity must be greater than zero");
    }
    if cfg.reconnect.rate == 0 {
        return invalid("reconnect.rate must be at least 1");
    }
    if cfg.reconnect.max_attempts == 0 {
        return invalid("reconnect.max_attempts must be greater than zero");
    }
    if cfg.player.tick_ms == 0 {
        return invalid("player.tick_ms must be greater than zero");
    }
    if !cfg.tester.speed.is_finite() || cfg.tester.speed <= 0.0 {
        return invalid("tester.speed must be greater than zero");
    }
    if cfg.tester.poll_interval_ms == 0 || cfg.tester.loop_interval_ms == 0 {
        return invalid("tester.poll_interval_ms and tester.loop_interval_ms must be greater than zero");
    }
    Ok(())
}

pub fn resolve_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}
