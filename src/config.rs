use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::frame::{PixelLayout, DEFAULT_RING_DEPTH};
use crate::ingest::SourceConfig;
use crate::retry::RetryPolicy;

const DEFAULT_HUB_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_TOPIC_PREFIX: &str = "kiosk";
const DEFAULT_LIDAR_DEVICE: &str = "/dev/ttyAMA0";
const DEFAULT_LIDAR_BAUD: u32 = 115_200;
const DEFAULT_THRESHOLD_CM: u32 = 50;
const DEFAULT_HARD_LOCK_SECS: f64 = 15.0;
const DEFAULT_AWAY_REARM_SECS: f64 = 2.0;
const DEFAULT_STILL_WIDTH: u32 = 320;
const DEFAULT_STILL_HEIGHT: u32 = 240;
const DEFAULT_STILL_FPS: u32 = 15;
const DEFAULT_DOWNSCALE: u32 = 2;
const DEFAULT_ROI_RATIO: f64 = 0.6;
const DEFAULT_WARMUP_FRAMES: u32 = 8;
const DEFAULT_ENTER_GRACE_MS: u64 = 800;
const DEFAULT_STABLE_MS: u64 = 1000;
const DEFAULT_DIFF_THRESHOLD: f64 = 80.0;
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 80;
const DEFAULT_STILL_STALE_MS: u64 = 1000;
const DEFAULT_FALLBACK_START_SECS: f64 = 3.0;
const DEFAULT_VISION_WIDTH: u32 = 640;
const DEFAULT_VISION_HEIGHT: u32 = 480;
const DEFAULT_VISION_FPS: u32 = 25;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_PRIMARY_CONF: f32 = 0.12;
const DEFAULT_IOU_THRESHOLD: f32 = 0.6;
const DEFAULT_CONF_THRESHOLD: f32 = 0.15;
const DEFAULT_DETECTION_THRESHOLD: u32 = 1;
const DEFAULT_VISION_STALE_MS: u64 = 1200;
const DEFAULT_LOOP_SLEEP_MS: u64 = 20;
const DEFAULT_CAPTURE_DIR: &str = "kiosk_captures";
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_CAPTURE_QUEUE: usize = 8;
const DEFAULT_HEARTBEAT_SECS: f64 = 1.0;
const DEFAULT_MISS_LIMIT: u32 = 20;
const DEFAULT_MISS_POLL_MS: u64 = 15;
const DEFAULT_RECONNECT_MS: u64 = 1000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

/// Raw-video producer invocation; `{width}`, `{height}` and `{fps}` are
/// substituted from the camera section.
const DEFAULT_CAMERA_COMMAND: &[&str] = &[
    "rpicam-vid",
    "-t",
    "0",
    "-n",
    "--width",
    "{width}",
    "--height",
    "{height}",
    "--framerate",
    "{fps}",
    "--codec",
    "yuv420",
    "-o",
    "-",
];

#[derive(Debug, Deserialize, Default)]
struct KioskConfigFile {
    ring_depth: Option<usize>,
    exit_on_stop: Option<bool>,
    hub: Option<HubConfigFile>,
    proximity: Option<ProximityConfigFile>,
    stillness: Option<StillnessConfigFile>,
    vision: Option<VisionConfigFile>,
    heartbeat: Option<HeartbeatConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct HubConfigFile {
    addr: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    allow_remote: Option<bool>,
    username: Option<String>,
    password: Option<String>,
    ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
    reconnect_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ProximityConfigFile {
    device: Option<PathBuf>,
    baud: Option<u32>,
    threshold_cm: Option<u32>,
    hard_lock_secs: Option<f64>,
    away_rearm_secs: Option<f64>,
    offline_fallback: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    command: Option<Vec<String>>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    miss_limit: Option<u32>,
    miss_poll_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StillnessConfigFile {
    camera: Option<CameraConfigFile>,
    downscale: Option<u32>,
    roi_ratio: Option<f64>,
    use_roi: Option<bool>,
    blur: Option<bool>,
    warmup_frames: Option<u32>,
    enter_grace_ms: Option<u64>,
    stable_ms: Option<u64>,
    diff_threshold: Option<f64>,
    sample_interval_ms: Option<u64>,
    stale_gap_ms: Option<u64>,
    auto_start: Option<bool>,
    fallback_start_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct VisionConfigFile {
    camera: Option<CameraConfigFile>,
    backend: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_size: Option<u32>,
    primary_conf: Option<f32>,
    iou_threshold: Option<f32>,
    conf_threshold: Option<f32>,
    detection_threshold: Option<u32>,
    stale_gap_ms: Option<u64>,
    loop_sleep_ms: Option<u64>,
    auto_start: Option<bool>,
    save_images: Option<bool>,
    capture_dir: Option<PathBuf>,
    jpeg_quality: Option<u8>,
    capture_queue: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct HeartbeatConfigFile {
    period_secs: Option<f64>,
    publish: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct KioskConfig {
    pub ring_depth: usize,
    /// Exit the agent on `stopVision` after releasing its resources.
    pub exit_on_stop: bool,
    pub hub: HubSettings,
    pub proximity: ProximitySettings,
    pub stillness: StillnessSettings,
    pub vision: VisionSettings,
    pub heartbeat: HeartbeatSettings,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub addr: String,
    pub topic_prefix: String,
    /// Falls back to a per-agent id when unset.
    pub client_id: Option<String>,
    pub allow_remote: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub reconnect: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct ProximitySettings {
    pub device: PathBuf,
    pub baud: u32,
    pub threshold_cm: u32,
    pub hard_lock: Duration,
    pub away_rearm: Duration,
    pub offline_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub command: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub miss_limit: u32,
    pub miss_poll: Duration,
}

#[derive(Debug, Clone)]
pub struct StillnessSettings {
    pub camera: CameraSettings,
    pub downscale: u32,
    /// `None` analyses the whole frame.
    pub roi_ratio: Option<f64>,
    pub blur: bool,
    pub warmup_frames: u32,
    pub enter_grace: Duration,
    pub stable: Duration,
    pub diff_threshold: f64,
    pub sample_interval: Duration,
    pub stale_gap: Duration,
    pub auto_start: bool,
    /// `None` disables the self-started run.
    pub fallback_start: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub camera: CameraSettings,
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub input_size: u32,
    pub primary_conf: f32,
    pub iou_threshold: f32,
    pub conf_threshold: f32,
    pub detection_threshold: u32,
    pub stale_gap: Duration,
    pub loop_sleep: Duration,
    pub auto_start: bool,
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub jpeg_quality: u8,
    pub queue: usize,
}

#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub period: Duration,
    /// Also publish heartbeats to the hub (they are always logged).
    pub publish: bool,
}

impl KioskConfig {
    /// Load from `KIOSK_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("KIOSK_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from an explicit file (CLI `--config`), then apply env overrides.
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

    fn from_file(file: KioskConfigFile) -> Result<Self> {
        let hub_file = file.hub.unwrap_or_default();
        let reconnect_ms = hub_file.reconnect_ms.unwrap_or(DEFAULT_RECONNECT_MS);
        let hub = HubSettings {
            addr: hub_file
                .addr
                .unwrap_or_else(|| DEFAULT_HUB_ADDR.to_string()),
            topic_prefix: hub_file
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            client_id: hub_file.client_id,
            allow_remote: hub_file.allow_remote.unwrap_or(false),
            username: hub_file.username,
            password: hub_file.password,
            ca_path: hub_file.ca_path,
            client_cert_path: hub_file.client_cert_path,
            client_key_path: hub_file.client_key_path,
            reconnect: RetryPolicy::exponential(
                Duration::from_millis(reconnect_ms),
                Duration::from_millis(
                    hub_file.reconnect_max_ms.unwrap_or(DEFAULT_RECONNECT_MAX_MS),
                ),
            )
            .with_jitter(0.1),
        };

        let prox_file = file.proximity.unwrap_or_default();
        let proximity = ProximitySettings {
            device: prox_file
                .device
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LIDAR_DEVICE)),
            baud: prox_file.baud.unwrap_or(DEFAULT_LIDAR_BAUD),
            threshold_cm: prox_file.threshold_cm.unwrap_or(DEFAULT_THRESHOLD_CM),
            hard_lock: secs(prox_file.hard_lock_secs.unwrap_or(DEFAULT_HARD_LOCK_SECS))?,
            away_rearm: secs(prox_file.away_rearm_secs.unwrap_or(DEFAULT_AWAY_REARM_SECS))?,
            offline_fallback: prox_file.offline_fallback.unwrap_or(true),
        };

        let still_file = file.stillness.unwrap_or_default();
        let fallback_secs = still_file
            .fallback_start_secs
            .unwrap_or(DEFAULT_FALLBACK_START_SECS);
        let stillness = StillnessSettings {
            camera: CameraSettings::from_file(
                still_file.camera,
                DEFAULT_STILL_WIDTH,
                DEFAULT_STILL_HEIGHT,
                DEFAULT_STILL_FPS,
            ),
            downscale: still_file.downscale.unwrap_or(DEFAULT_DOWNSCALE),
            roi_ratio: if still_file.use_roi.unwrap_or(true) {
                Some(still_file.roi_ratio.unwrap_or(DEFAULT_ROI_RATIO))
            } else {
                None
            },
            blur: still_file.blur.unwrap_or(true),
            warmup_frames: still_file.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
            enter_grace: Duration::from_millis(
                still_file.enter_grace_ms.unwrap_or(DEFAULT_ENTER_GRACE_MS),
            ),
            stable: Duration::from_millis(still_file.stable_ms.unwrap_or(DEFAULT_STABLE_MS)),
            diff_threshold: still_file.diff_threshold.unwrap_or(DEFAULT_DIFF_THRESHOLD),
            sample_interval: Duration::from_millis(
                still_file
                    .sample_interval_ms
                    .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS),
            ),
            stale_gap: Duration::from_millis(
                still_file.stale_gap_ms.unwrap_or(DEFAULT_STILL_STALE_MS),
            ),
            auto_start: still_file.auto_start.unwrap_or(true),
            fallback_start: optional_secs(fallback_secs)?,
        };

        let vision_file = file.vision.unwrap_or_default();
        let vision = VisionSettings {
            camera: CameraSettings::from_file(
                vision_file.camera,
                DEFAULT_VISION_WIDTH,
                DEFAULT_VISION_HEIGHT,
                DEFAULT_VISION_FPS,
            ),
            backend: vision_file
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            model_path: vision_file.model_path,
            labels_path: vision_file.labels_path,
            input_size: vision_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            primary_conf: vision_file.primary_conf.unwrap_or(DEFAULT_PRIMARY_CONF),
            iou_threshold: vision_file.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            conf_threshold: vision_file.conf_threshold.unwrap_or(DEFAULT_CONF_THRESHOLD),
            detection_threshold: vision_file
                .detection_threshold
                .unwrap_or(DEFAULT_DETECTION_THRESHOLD),
            stale_gap: Duration::from_millis(
                vision_file.stale_gap_ms.unwrap_or(DEFAULT_VISION_STALE_MS),
            ),
            loop_sleep: Duration::from_millis(
                vision_file.loop_sleep_ms.unwrap_or(DEFAULT_LOOP_SLEEP_MS),
            ),
            auto_start: vision_file.auto_start.unwrap_or(true),
            capture: CaptureSettings {
                enabled: vision_file.save_images.unwrap_or(true),
                dir: vision_file
                    .capture_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CAPTURE_DIR)),
                jpeg_quality: vision_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                queue: vision_file.capture_queue.unwrap_or(DEFAULT_CAPTURE_QUEUE),
            },
        };

        let hb_file = file.heartbeat.unwrap_or_default();
        let heartbeat = HeartbeatSettings {
            period: secs(hb_file.period_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS))?,
            publish: hb_file.publish.unwrap_or(false),
        };

        Ok(Self {
            ring_depth: file.ring_depth.unwrap_or(DEFAULT_RING_DEPTH),
            exit_on_stop: file.exit_on_stop.unwrap_or(true),
            hub,
            proximity,
            stillness,
            vision,
            heartbeat,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("KIOSK_HUB_ADDR") {
            self.hub.addr = addr;
        }
        if let Some(prefix) = env_value("KIOSK_HUB_PREFIX") {
            self.hub.topic_prefix = prefix;
        }
        if let Some(allow) = parse_env_bool("KIOSK_ALLOW_REMOTE")? {
            self.hub.allow_remote = allow;
        }
        if let Some(command) = env_value("KIOSK_CAMERA_CMD") {
            let parsed: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            self.stillness.camera.command = parsed.clone();
            self.vision.camera.command = parsed;
        }

        if let Some(port) = env_value("LIDAR_PORT") {
            self.proximity.device = PathBuf::from(port);
        }
        if let Some(baud) = parse_env("LIDAR_BAUD", "an integer baud rate")? {
            self.proximity.baud = baud;
        }
        if let Some(cm) = parse_env("LIDAR_THRESH_CM", "an integer distance in cm")? {
            self.proximity.threshold_cm = cm;
        }
        if let Some(lock) = parse_env::<f64>("LIDAR_ACTIVE_LOCK", "a number of seconds")? {
            self.proximity.hard_lock = secs(lock)?;
        }
        if let Some(rearm) = parse_env::<f64>("LIDAR_AWAY_REARM", "a number of seconds")? {
            self.proximity.away_rearm = secs(rearm)?;
        }
        if let Some(fallback) = parse_env_bool("LIDAR_OFFLINE_FALLBACK")? {
            self.proximity.offline_fallback = fallback;
        }

        if let Some(diff) = parse_env("DIFF_THRESHOLD", "a number")? {
            self.stillness.diff_threshold = diff;
        }
        if let Some(ms) = parse_env("STABLE_MS", "an integer number of milliseconds")? {
            self.stillness.stable = Duration::from_millis(ms);
        }
        if let Some(frames) = parse_env("WARMUP_FRAMES", "an integer frame count")? {
            self.stillness.warmup_frames = frames;
        }
        if let Some(ms) = parse_env("ENTER_GRACE_MS", "an integer number of milliseconds")? {
            self.stillness.enter_grace = Duration::from_millis(ms);
        }

        if let Some(conf) = parse_env("CONF_THRESHOLD", "a number in [0, 1]")? {
            self.vision.conf_threshold = conf;
        }
        if let Some(iou) = parse_env("IOU_THRESHOLD", "a number in [0, 1]")? {
            self.vision.iou_threshold = iou;
        }
        if let Some(ticks) = parse_env("DETECTION_THRESHOLD", "an integer tick count")? {
            self.vision.detection_threshold = ticks;
        }
        if let Some(dir) = env_value("KIOSK_CAPTURE_DIR") {
            self.vision.capture.dir = PathBuf::from(dir);
        }

        if let Some(period) = parse_env::<f64>("HB_PERIOD_S", "a number of seconds")? {
            self.heartbeat.period = secs(period)?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.ring_depth == 0 {
            return Err(anyhow!("ring_depth must be greater than zero"));
        }
        if self.hub.addr.trim().is_empty() {
            return Err(anyhow!("hub.addr must not be empty"));
        }
        self.hub.topic_prefix = self.hub.topic_prefix.trim_matches('/').to_string();
        if self.hub.topic_prefix.is_empty() || self.hub.topic_prefix.contains(['#', '+']) {
            return Err(anyhow!(
                "hub.topic_prefix must be a non-empty topic without wildcards"
            ));
        }
        if self.hub.client_cert_path.is_some() != self.hub.client_key_path.is_some() {
            return Err(anyhow!(
                "hub.client_cert_path and hub.client_key_path must be set together"
            ));
        }

        if self.proximity.hard_lock.is_zero() {
            return Err(anyhow!("proximity hard lock must be greater than zero"));
        }
        if self.proximity.threshold_cm == 0 {
            return Err(anyhow!("proximity threshold must be greater than zero"));
        }

        self.stillness.camera.validate("stillness")?;
        if self.stillness.downscale == 0 {
            return Err(anyhow!("stillness.downscale must be greater than zero"));
        }
        if let Some(ratio) = self.stillness.roi_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(anyhow!("stillness.roi_ratio must be in (0, 1]"));
            }
        }
        if self.stillness.diff_threshold.is_nan() || self.stillness.diff_threshold < 0.0 {
            return Err(anyhow!("stillness.diff_threshold must be non-negative"));
        }
        if self.stillness.stable.is_zero() {
            return Err(anyhow!("stillness.stable_ms must be greater than zero"));
        }

        self.vision.camera.validate("vision")?;
        for (name, value) in [
            ("vision.primary_conf", self.vision.primary_conf),
            ("vision.iou_threshold", self.vision.iou_threshold),
            ("vision.conf_threshold", self.vision.conf_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be in [0, 1]", name));
            }
        }
        if self.vision.detection_threshold == 0 {
            return Err(anyhow!("vision.detection_threshold must be at least 1"));
        }
        if self.vision.input_size == 0 {
            return Err(anyhow!("vision.input_size must be greater than zero"));
        }
        if !(1..=100).contains(&self.vision.capture.jpeg_quality) {
            return Err(anyhow!("vision.jpeg_quality must be in 1..=100"));
        }
        if self.vision.capture.queue == 0 {
            return Err(anyhow!("vision.capture_queue must be greater than zero"));
        }

        if self.heartbeat.period.is_zero() {
            return Err(anyhow!("heartbeat period must be greater than zero"));
        }
        Ok(())
    }
}

impl CameraSettings {
    fn from_file(file: Option<CameraConfigFile>, width: u32, height: u32, fps: u32) -> Self {
        let file = file.unwrap_or_default();
        Self {
            command: file.command.unwrap_or_else(|| {
                DEFAULT_CAMERA_COMMAND
                    .iter()
                    .map(|arg| arg.to_string())
                    .collect()
            }),
            width: file.width.unwrap_or(width),
            height: file.height.unwrap_or(height),
            fps: file.fps.unwrap_or(fps),
            miss_limit: file.miss_limit.unwrap_or(DEFAULT_MISS_LIMIT),
            miss_poll: Duration::from_millis(file.miss_poll_ms.unwrap_or(DEFAULT_MISS_POLL_MS)),
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.command.is_empty() {
            return Err(anyhow!("{}.camera.command must not be empty", section));
        }
        if self.width == 0 || self.height == 0 || self.fps == 0 {
            return Err(anyhow!(
                "{}.camera width, height and fps must be greater than zero",
                section
            ));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(anyhow!(
                "{}.camera dimensions must be even for 4:2:0 frames",
                section
            ));
        }
        if self.miss_limit == 0 {
            return Err(anyhow!("{}.camera.miss_limit must be at least 1", section));
        }
        Ok(())
    }

    /// Producer settings with placeholders expanded.
    pub fn source_config(&self, restart: RetryPolicy) -> SourceConfig {
        let command = self
            .command
            .iter()
            .map(|arg| {
                arg.replace("{width}", &self.width.to_string())
                    .replace("{height}", &self.height.to_string())
                    .replace("{fps}", &self.fps.to_string())
            })
            .collect();
        SourceConfig {
            command,
            width: self.width,
            height: self.height,
            fps: self.fps,
            layout: PixelLayout::I420,
            miss_limit: self.miss_limit,
            miss_poll: self.miss_poll,
            restart,
        }
    }
}

fn read_config_file(path: &Path) -> Result<KioskConfigFile> {
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

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T: FromStr>(name: &str, expected: &str) -> Result<Option<T>> {
    match env_value(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", name, expected)),
        None => Ok(None),
    }
}

fn parse_env_bool(name: &str) -> Result<Option<bool>> {
    match env_value(name).as_deref() {
        None => Ok(None),
        Some("1") | Some("true") | Some("on") | Some("yes") => Ok(Some(true)),
        Some("0") | Some("false") | Some("off") | Some("no") => Ok(Some(false)),
        Some(_) => Err(anyhow!("{} must be 1/0 or true/false", name)),
    }
}

fn secs(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("invalid duration of {} seconds", value))
}

fn optional_secs(value: f64) -> Result<Option<Duration>> {
    let duration = secs(value)?;
    Ok((!duration.is_zero()).then_some(duration))
}
