use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::EngineSettings;
use crate::ingest::SourceSettings;
use crate::notify::MqttSettings;

const DEFAULT_DEVICE_ID: &str = "orangepi5-core-001";
const DEFAULT_SIM_WIDTH: u32 = 640;
const DEFAULT_SIM_HEIGHT: u32 = 480;
const DEFAULT_SIM_FPS: u32 = 15;
const DEFAULT_RECONNECT_SECS: u64 = 5;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONF_THRESHOLD: f32 = 0.5;
const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
const DEFAULT_SIMULATED_LATENCY_MS: u64 = 20;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 60;
const DEFAULT_LOG_INTERVAL_FRAMES: u64 = 100;
const DEFAULT_JPEG_QUALITY: u8 = 85;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SentinelConfigFile {
    device_id: Option<String>,
    source: Option<SourceConfigFile>,
    detector: Option<DetectorConfigFile>,
    alerts: Option<AlertConfigFile>,
    mqtt: Option<MqttConfigFile>,
    evidence: Option<EvidenceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    url: Option<String>,
    use_simulation: Option<bool>,
    sim_width: Option<u32>,
    sim_height: Option<u32>,
    sim_fps: Option<u32>,
    queue_capacity: Option<usize>,
    reconnect_delay_secs: Option<u64>,
    stop_timeout_secs: Option<u64>,
    frame_timeout_ms: Option<u64>,
    hardware_decode: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    conf_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    simulated_latency_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AlertConfigFile {
    cooldown_secs: Option<u64>,
    status_interval_secs: Option<u64>,
    log_interval_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EvidenceConfigFile {
    dir: Option<PathBuf>,
    http_url: Option<String>,
    jpeg_quality: Option<u8>,
    label_font: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub device_id: String,
    pub source: SourceSettings,
    /// Longest wait for one frame before the loop turns around.
    pub frame_timeout: Duration,
    pub detector: EngineSettings,
    pub alerts: AlertSettings,
    pub mqtt: MqttConfig,
    pub evidence: EvidenceSettings,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub cooldown: Duration,
    pub status_interval: Duration,
    /// Progress log cadence, in processed frames.
    pub log_interval_frames: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MqttConfig {
    pub broker_addr: Option<String>,
    /// Defaults to the device id.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EvidenceSettings {
    pub dir: Option<PathBuf>,
    pub http_url: Option<String>,
    pub jpeg_quality: u8,
    /// Font for box labels; outlines only when unset.
    pub label_font: Option<PathBuf>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self::from_file(SentinelConfigFile::default())
    }
}

impl SentinelConfig {
    /// Defaults, then the file named by `PPE_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PPE_CONFIG").ok().filter(|p| !p.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file instead of `PPE_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SentinelConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Self {
        let device_id = file
            .device_id
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());

        let src = file.source.unwrap_or_default();
        let source = SourceSettings {
            url: src.url.filter(|url| !url.trim().is_empty()),
            use_simulation: src.use_simulation.unwrap_or(true),
            sim_width: src.sim_width.unwrap_or(DEFAULT_SIM_WIDTH),
            sim_height: src.sim_height.unwrap_or(DEFAULT_SIM_HEIGHT),
            sim_fps: src.sim_fps.unwrap_or(DEFAULT_SIM_FPS),
            queue_capacity: src
                .queue_capacity
                .unwrap_or(crate::frame::DEFAULT_QUEUE_CAPACITY),
            reconnect_delay: Duration::from_secs(
                src.reconnect_delay_secs.unwrap_or(DEFAULT_RECONNECT_SECS),
            ),
            stop_timeout: Duration::from_secs(
                src.stop_timeout_secs.unwrap_or(DEFAULT_STOP_TIMEOUT_SECS),
            ),
            hardware_decode: src.hardware_decode.unwrap_or(true),
        };
        let frame_timeout =
            Duration::from_millis(src.frame_timeout_ms.unwrap_or(DEFAULT_FRAME_TIMEOUT_MS));

        let det = file.detector.unwrap_or_default();
        let detector = EngineSettings {
            model_path: det.model_path,
            input_width: det.input_width.unwrap_or(DEFAULT_INPUT_SIZE),
            input_height: det.input_height.unwrap_or(DEFAULT_INPUT_SIZE),
            conf_threshold: det.conf_threshold.unwrap_or(DEFAULT_CONF_THRESHOLD),
            nms_threshold: det.nms_threshold.unwrap_or(DEFAULT_NMS_THRESHOLD),
            use_simulation: source.use_simulation,
            simulated_latency: Duration::from_millis(
                det.simulated_latency_ms
                    .unwrap_or(DEFAULT_SIMULATED_LATENCY_MS),
            ),
        };

        let alert = file.alerts.unwrap_or_default();
        let alerts = AlertSettings {
            cooldown: Duration::from_secs(alert.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS)),
            status_interval: Duration::from_secs(
                alert
                    .status_interval_secs
                    .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS),
            ),
            log_interval_frames: alert
                .log_interval_frames
                .unwrap_or(DEFAULT_LOG_INTERVAL_FRAMES),
        };

        let mqtt = file
            .mqtt
            .map(|m| MqttConfig {
                broker_addr: m.broker_addr,
                client_id: m.client_id,
                username: m.username,
                password: m.password,
            })
            .unwrap_or_default();

        let ev = file.evidence.unwrap_or_default();
        let evidence = EvidenceSettings {
            dir: ev.dir,
            http_url: ev.http_url,
            jpeg_quality: ev.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            label_font: ev.label_font,
        };

        Self {
            device_id,
            source,
            frame_timeout,
            detector,
            alerts,
            mqtt,
            evidence,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(name) = env_string("THING_NAME") {
            self.device_id = name;
        }
        if let Some(url) = env_string("RTSP_URL") {
            self.source.url = Some(url);
        }
        if let Some(value) = env_string("USE_SIMULATION") {
            self.set_simulation(parse_bool("USE_SIMULATION", &value)?);
        }
        if let Some(value) = env_string("RECONNECT_DELAY_SECS") {
            self.source.reconnect_delay = Duration::from_secs(value.parse().map_err(|_| {
                anyhow!("RECONNECT_DELAY_SECS must be an integer number of seconds")
            })?);
        }
        if let Some(path) = env_string("MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(value) = env_string("CONF_THRESHOLD") {
            self.detector.conf_threshold = value
                .parse()
                .map_err(|_| anyhow!("CONF_THRESHOLD must be a number"))?;
        }
        if let Some(value) = env_string("NMS_THRESHOLD") {
            self.detector.nms_threshold = value
                .parse()
                .map_err(|_| anyhow!("NMS_THRESHOLD must be a number"))?;
        }
        if let Some(value) = env_string("ALERT_COOLDOWN_SECS") {
            self.alerts.cooldown = Duration::from_secs(value.parse().map_err(|_| {
                anyhow!("ALERT_COOLDOWN_SECS must be an integer number of seconds")
            })?);
        }
        if let Some(value) = env_string("STATUS_INTERVAL_SECS") {
            self.alerts.status_interval = Duration::from_secs(value.parse().map_err(|_| {
                anyhow!("STATUS_INTERVAL_SECS must be an integer number of seconds")
            })?);
        }
        if let Some(addr) = env_string("MQTT_BROKER_ADDR") {
            self.mqtt.broker_addr = Some(addr);
        }
        if let Some(id) = env_string("MQTT_CLIENT_ID") {
            self.mqtt.client_id = Some(id);
        }
        if let Some(user) = env_string("MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = env_string("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(dir) = env_string("EVIDENCE_DIR") {
            self.evidence.dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = env_string("EVIDENCE_URL") {
            self.evidence.http_url = Some(url);
        }
        if let Some(font) = env_string("EVIDENCE_LABEL_FONT") {
            self.evidence.label_font = Some(PathBuf::from(font));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(anyhow!("device_id must not be empty"));
        }
        if self.device_id.contains(['/', '+', '#']) {
            return Err(anyhow!(
                "device_id '{}' must not contain MQTT topic separators or wildcards",
                self.device_id
            ));
        }
        if self.source.queue_capacity == 0 {
            return Err(anyhow!("source.queue_capacity must be at least 1"));
        }
        if self.source.sim_width == 0 || self.source.sim_height == 0 {
            return Err(anyhow!("simulated frame dimensions must be non-zero"));
        }
        if self.source.sim_fps == 0 {
            return Err(anyhow!("source.sim_fps must be at least 1"));
        }
        if self.frame_timeout.is_zero() {
            return Err(anyhow!("frame timeout must be greater than zero"));
        }
        self.detector.validate()?;
        if self.alerts.status_interval.is_zero() {
            return Err(anyhow!("status interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.evidence.jpeg_quality) {
            return Err(anyhow!(
                "evidence.jpeg_quality must be within 1..=100, got {}",
                self.evidence.jpeg_quality
            ));
        }
        if let Some(addr) = &self.mqtt.broker_addr {
            if addr.trim().is_empty() {
                return Err(anyhow!("mqtt.broker_addr must not be empty"));
            }
        }
        Ok(())
    }

    /// Switch both the frame source and the detector between simulated and live.
    pub fn set_simulation(&mut self, enabled: bool) {
        self.source.use_simulation = enabled;
        self.detector.use_simulation = enabled;
    }

    /// True when frames come from the synthetic generator.
    pub fn simulated_source(&self) -> bool {
        self.source.simulated()
    }

    /// MQTT settings when a broker is configured.
    pub fn mqtt_settings(&self) -> Option<MqttSettings> {
        let broker_addr = self.mqtt.broker_addr.clone()?;
        Some(MqttSettings {
            broker_addr,
            client_id: self
                .mqtt
                .client_id
                .clone()
                .unwrap_or_else(|| self.device_id.clone()),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be true or false, got '{}'", key, value)),
    }
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg: SentinelConfigFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
