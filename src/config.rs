use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::frame::CanvasSpec;
use crate::output::{OutputSelection, PublishPolicy};

const DEFAULT_DEVICE_PATH: &str = "/dev/video0";
const DEFAULT_FPS: u32 = 20;
const DEFAULT_LARGE_WIDTH: u32 = 640;
const DEFAULT_LARGE_HEIGHT: u32 = 360;
const DEFAULT_SMALL_WIDTH: u32 = 256;
const DEFAULT_SMALL_HEIGHT: u32 = 144;
const DEFAULT_BASE_TOPIC: &str = "cameras/main_navigation";
const DEFAULT_OPEN_BACKOFF_MS: u64 = 500;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_MQTT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "camfeedd";

/// Extra frames per second added to the tick rate so ticks outpace delivery.
const LOCAL_TICK_MARGIN_FPS: u32 = 2;
const NETWORK_TICK_MARGIN_FPS: u32 = 10;

const MAX_OPEN_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FeedConfigFile {
    mode: Option<String>,
    device_path: Option<String>,
    fps: Option<u32>,
    upside_down: Option<bool>,
    native: Option<SizeConfigFile>,
    large: Option<SizeConfigFile>,
    small: Option<SizeConfigFile>,
    base_topic: Option<String>,
    initial_output: Option<String>,
    publish_policy: Option<String>,
    open_retries: Option<u32>,
    open_backoff_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(deny_unknown_fields)]
struct SizeConfigFile {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    allow_remote: Option<bool>,
}

/// Where frames come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Local capture device (V4L2).
    #[default]
    Local,
    /// Network video stream (RTSP).
    Network,
}

impl AcquisitionMode {
    /// Network streams pick their own resolution and get letterboxed.
    pub fn letterbox(self) -> bool {
        matches!(self, Self::Network)
    }

    fn tick_margin_fps(self) -> u32 {
        match self {
            Self::Local => LOCAL_TICK_MARGIN_FPS,
            Self::Network => NETWORK_TICK_MARGIN_FPS,
        }
    }
}

impl FromStr for AcquisitionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" | "usb" | "v4l2" => Ok(Self::Local),
            "network" | "rtsp" => Ok(Self::Network),
            other => Err(anyhow!(
                "unknown acquisition mode '{}': expected 'local' or 'network'",
                other
            )),
        }
    }
}

impl std::fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Capture settings. Fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub mode: AcquisitionMode,
    /// Device node for local capture, stream URL for network capture.
    pub device_path: String,
    pub fps: u32,
    /// Resolution requested from a local device; frame size of synthetic streams.
    pub native_width: u32,
    pub native_height: u32,
    /// Rotate every frame 180°.
    pub upside_down: bool,
}

impl CaptureConfig {
    /// Interval between ticks: `1000 / (fps + margin)` milliseconds.
    pub fn tick_period(&self) -> Duration {
        let rate = self.fps.saturating_add(self.mode.tick_margin_fps()).max(1);
        Duration::from_millis(u64::from(1000 / rate).max(1))
    }
}

/// How many times to retry opening the source before giving up.
///
/// `retries == 0` gives up after the first failure and leaves the pipeline idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRetryPolicy {
    pub retries: u32,
    pub initial_backoff: Duration,
}

impl OpenRetryPolicy {
    pub const fn no_retry() -> Self {
        Self {
            retries: 0,
            initial_backoff: Duration::from_millis(DEFAULT_OPEN_BACKOFF_MS),
        }
    }

    /// Delay before retry number `attempt` (1-based). Doubles each time, capped at 30s.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(MAX_OPEN_BACKOFF)
            .min(MAX_OPEN_BACKOFF)
    }
}

impl Default for OpenRetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    /// Permit brokers outside loopback.
    pub allow_remote: bool,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub capture: CaptureConfig,
    pub large: CanvasSpec,
    pub small: CanvasSpec,
    pub base_topic: String,
    pub initial_output: OutputSelection,
    pub publish_policy: PublishPolicy,
    pub open_retry: OpenRetryPolicy,
    pub jpeg_quality: u8,
    pub mqtt: MqttSettings,
}

impl FeedConfig {
    /// Load from `CAMFEED_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMFEED_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (JSON, or TOML for `.toml` paths), then
    /// apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FeedConfigFile) -> Result<Self> {
        let mode = match file.mode.as_deref() {
            Some(mode) => mode.parse()?,
            None => AcquisitionMode::default(),
        };
        let large = canvas_from(file.large, DEFAULT_LARGE_WIDTH, DEFAULT_LARGE_HEIGHT);
        let small = canvas_from(file.small, DEFAULT_SMALL_WIDTH, DEFAULT_SMALL_HEIGHT);
        let native = file.native.unwrap_or_default();

        let capture = CaptureConfig {
            mode,
            device_path: file
                .device_path
                .unwrap_or_else(|| DEFAULT_DEVICE_PATH.to_string()),
            fps: file.fps.unwrap_or(DEFAULT_FPS),
            native_width: native.width.unwrap_or(large.width),
            native_height: native.height.unwrap_or(large.height),
            upside_down: file.upside_down.unwrap_or(false),
        };

        let initial_output = match file.initial_output.as_deref() {
            Some(selection) => selection.parse()?,
            None => OutputSelection::default(),
        };
        let publish_policy = match file.publish_policy.as_deref() {
            Some(policy) => policy.parse()?,
            None => PublishPolicy::default(),
        };

        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttSettings {
            broker_addr: mqtt_file
                .broker_addr
                .unwrap_or_else(|| DEFAULT_MQTT_BROKER_ADDR.to_string()),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            username: mqtt_file.username,
            password: mqtt_file.password,
            use_tls: mqtt_file.use_tls.unwrap_or(false),
            tls_ca_path: mqtt_file.tls_ca_path,
            tls_client_cert_path: mqtt_file.tls_client_cert_path,
            tls_client_key_path: mqtt_file.tls_client_key_path,
            allow_remote: mqtt_file.allow_remote.unwrap_or(false),
        };

        Ok(Self {
            capture,
            large,
            small,
            base_topic: file
                .base_topic
                .unwrap_or_else(|| DEFAULT_BASE_TOPIC.to_string()),
            initial_output,
            publish_policy,
            open_retry: OpenRetryPolicy {
                retries: file.open_retries.unwrap_or(0),
                initial_backoff: Duration::from_millis(
                    file.open_backoff_ms.unwrap_or(DEFAULT_OPEN_BACKOFF_MS),
                ),
            },
            jpeg_quality: file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            mqtt,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(mode) = non_empty_env("CAMFEED_MODE") {
            self.capture.mode = mode.parse()?;
        }
        if let Some(device) = non_empty_env("CAMFEED_DEVICE") {
            self.capture.device_path = device;
        }
        if let Some(fps) = non_empty_env("CAMFEED_FPS") {
            self.capture.fps = fps
                .parse()
                .map_err(|_| anyhow!("CAMFEED_FPS must be an integer frame rate"))?;
        }
        if let Some(flag) = non_empty_env("CAMFEED_UPSIDE_DOWN") {
            self.capture.upside_down = parse_bool("CAMFEED_UPSIDE_DOWN", &flag)?;
        }
        if let Some(topic) = non_empty_env("CAMFEED_BASE_TOPIC") {
            self.base_topic = topic;
        }
        if let Some(retries) = non_empty_env("CAMFEED_OPEN_RETRIES") {
            self.open_retry.retries = retries
                .parse()
                .map_err(|_| anyhow!("CAMFEED_OPEN_RETRIES must be a non-negative integer"))?;
        }
        if let Some(addr) = non_empty_env("MQTT_BROKER_ADDR") {
            self.mqtt.broker_addr = addr;
        }
        if let Some(client_id) = non_empty_env("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Some(username) = non_empty_env("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = non_empty_env("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.capture.device_path.trim().is_empty() {
            return Err(anyhow!("device_path must not be empty"));
        }
        if self.capture.fps == 0 {
            return Err(anyhow!("fps must be greater than zero"));
        }
        for (name, canvas) in [("large", &self.large), ("small", &self.small)] {
            if canvas.width == 0 || canvas.height == 0 {
                return Err(anyhow!("{} canvas must have a non-zero size, got {}", name, canvas));
            }
        }
        if self.capture.native_width == 0 || self.capture.native_height == 0 {
            return Err(anyhow!("native capture size must be non-zero"));
        }
        self.base_topic = self.base_topic.trim().trim_end_matches('/').to_string();
        if self.base_topic.is_empty() {
            return Err(anyhow!("base_topic must not be empty"));
        }
        if self.base_topic.contains(['+', '#']) {
            return Err(anyhow!(
                "base_topic must not contain MQTT wildcards: {}",
                self.base_topic
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }
        Ok(())
    }
}

fn canvas_from(size: Option<SizeConfigFile>, width: u32, height: u32) -> CanvasSpec {
    let size = size.unwrap_or_default();
    CanvasSpec::new(size.width.unwrap_or(width), size.height.unwrap_or(height))
}

fn read_config_file(path: &Path) -> Result<FeedConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be a boolean, got '{}'", key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(mode: AcquisitionMode, fps: u32) -> CaptureConfig {
        CaptureConfig {
            mode,
            device_path: DEFAULT_DEVICE_PATH.to_string(),
            fps,
            native_width: 640,
            native_height: 360,
            upside_down: false,
        }
    }

    #[test]
    fn tick_period_uses_mode_margin() {
        assert_eq!(
            capture(AcquisitionMode::Local, 20).tick_period(),
            Duration::from_millis(45)
        );
        assert_eq!(
            capture(AcquisitionMode::Network, 20).tick_period(),
            Duration::from_millis(33)
        );
    }

    #[test]
    fn tick_period_never_zero() {
        assert_eq!(
            capture(AcquisitionMode::Network, 5000).tick_period(),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn letterbox_only_for_network() {
        assert!(AcquisitionMode::Network.letterbox());
        assert!(!AcquisitionMode::Local.letterbox());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = OpenRetryPolicy {
            retries: 10,
            initial_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4000));
        assert_eq!(policy.backoff(10), MAX_OPEN_BACKOFF);
        assert_eq!(policy.backoff(64), MAX_OPEN_BACKOFF);
    }

    #[test]
    fn defaults_match_camera_node() -> Result<()> {
        let cfg = FeedConfig::from_file(FeedConfigFile::default())?;
        assert_eq!(cfg.capture.mode, AcquisitionMode::Local);
        assert_eq!(cfg.capture.device_path, "/dev/video0");
        assert_eq!(cfg.capture.fps, 20);
        assert!(!cfg.capture.upside_down);
        assert_eq!(cfg.large, CanvasSpec::new(640, 360));
        assert_eq!(cfg.small, CanvasSpec::new(256, 144));
        assert_eq!((cfg.capture.native_width, cfg.capture.native_height), (640, 360));
        assert_eq!(cfg.base_topic, "cameras/main_navigation");
        assert_eq!(cfg.initial_output, OutputSelection::Small);
        assert_eq!(cfg.publish_policy, PublishPolicy::Exclusive);
        assert_eq!(cfg.open_retry, OpenRetryPolicy::no_retry());
        Ok(())
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = FeedConfig::from_file(FeedConfigFile::default()).expect("defaults");
        cfg.capture.fps = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = FeedConfig::from_file(FeedConfigFile::default()).expect("defaults");
        cfg.base_topic = "cameras/#".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = FeedConfig::from_file(FeedConfigFile::default()).expect("defaults");
        cfg.small = CanvasSpec::new(0, 144);
        assert!(cfg.validate().is_err());

        let file = FeedConfigFile {
            mode: Some("satellite".to_string()),
            ..FeedConfigFile::default()
        };
        assert!(FeedConfig::from_file(file).is_err());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("X", "yes").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
