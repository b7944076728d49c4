use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::annotate::AnnotationStyle;
use crate::error::StartupError;
use crate::{DEFAULT_APP_NAME, DEFAULT_TARGET_LABEL};

const DEFAULT_DB_PATH: &str = "motorcycles.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8798";
const DEFAULT_SAMPLE_INTERVAL: u64 = 10;
const DEFAULT_SEGMENT_SECONDS: u64 = 200;
const DEFAULT_CONFIDENCE: f32 = 0.4;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_YTDLP: &str = "yt-dlp";

/// Class names of the 80-class COCO label set, in model output order.
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

#[derive(Debug, Deserialize, Default)]
struct AppConfigFile {
    db_path: Option<String>,
    work_dir: Option<PathBuf>,
    detector: Option<DetectorConfigFile>,
    sampling: Option<SamplingConfigFile>,
    segment: Option<SegmentConfigFile>,
    annotation: Option<AnnotationConfigFile>,
    youtube: Option<YoutubeConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    api_url: Option<String>,
    api_key: Option<String>,
    model_id: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    labels: Option<Vec<String>>,
    target_label: Option<String>,
    confidence_threshold: Option<f32>,
    timeout_ms: Option<u64>,
    stub_detections: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    interval: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SegmentConfigFile {
    max_segment_seconds: Option<u64>,
    max_source_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotationConfigFile {
    app_name: Option<String>,
    font_path: Option<PathBuf>,
    box_color: Option<[u8; 3]>,
    thickness: Option<u32>,
    font_scale: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct YoutubeConfigFile {
    api_key: Option<String>,
    ytdlp_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorKind {
    Stub,
    Http,
    Tract,
}

impl DetectorKind {
    pub fn parse(value: &str) -> Result<Self, StartupError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(DetectorKind::Stub),
            "http" | "hosted" => Ok(DetectorKind::Http),
            "tract" | "onnx" => Ok(DetectorKind::Tract),
            other => Err(StartupError::Config(format!(
                "unknown detector backend '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub kind: DetectorKind,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model_id: Option<String>,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub labels: Vec<String>,
    pub target_label: String,
    pub confidence_threshold: f32,
    pub timeout: Duration,
    /// Boxes returned per call by the stub backend.
    pub stub_detections: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Stub,
            api_url: None,
            api_key: None,
            model_id: None,
            model_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            labels: COCO_LABELS.iter().map(|l| l.to_string()).collect(),
            target_label: DEFAULT_TARGET_LABEL.to_string(),
            confidence_threshold: DEFAULT_CONFIDENCE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stub_detections: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentSettings {
    pub max_segment_seconds: u64,
    /// Sources larger than this are segmented even when short.
    pub max_source_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct YoutubeSettings {
    pub api_key: Option<String>,
    pub ytdlp_path: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub work_dir: Option<PathBuf>,
    pub detector: DetectorSettings,
    pub sample_interval: u64,
    pub segment: SegmentSettings,
    pub annotation: AnnotationStyle,
    pub youtube: YoutubeSettings,
    pub api_addr: String,
}

impl AppConfig {
    /// Load from `MOTO_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self, StartupError> {
        let config_path = std::env::var("MOTO_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (if any), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self, StartupError> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => AppConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Result<Self, StartupError> {
        let defaults = DetectorSettings::default();
        let det = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            kind: match det.backend.as_deref() {
                Some(name) => DetectorKind::parse(name)?,
                None => defaults.kind,
            },
            api_url: det.api_url,
            api_key: det.api_key,
            model_id: det.model_id,
            model_path: det.model_path,
            input_size: det.input_size.unwrap_or(defaults.input_size),
            labels: det.labels.unwrap_or(defaults.labels),
            target_label: det.target_label.unwrap_or(defaults.target_label),
            confidence_threshold: det
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            timeout: det
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            stub_detections: det.stub_detections.unwrap_or(defaults.stub_detections),
        };

        let segment = file.segment.unwrap_or_default();
        let annotation_file = file.annotation.unwrap_or_default();
        let style_defaults = AnnotationStyle::default();
        let annotation = AnnotationStyle {
            app_name: annotation_file
                .app_name
                .unwrap_or_else(|| DEFAULT_APP_NAME.to_string()),
            font_path: annotation_file.font_path,
            box_color: annotation_file.box_color.unwrap_or(style_defaults.box_color),
            thickness: annotation_file.thickness.unwrap_or(style_defaults.thickness),
            font_scale: annotation_file.font_scale.unwrap_or(style_defaults.font_scale),
        };
        let youtube = file.youtube.unwrap_or_default();

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            work_dir: file.work_dir,
            detector,
            sample_interval: file
                .sampling
                .and_then(|s| s.interval)
                .unwrap_or(DEFAULT_SAMPLE_INTERVAL),
            segment: SegmentSettings {
                max_segment_seconds: segment
                    .max_segment_seconds
                    .unwrap_or(DEFAULT_SEGMENT_SECONDS),
                max_source_bytes: segment.max_source_bytes,
            },
            annotation,
            youtube: YoutubeSettings {
                api_key: youtube.api_key,
                ytdlp_path: youtube
                    .ytdlp_path
                    .unwrap_or_else(|| DEFAULT_YTDLP.to_string()),
            },
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
        })
    }

    fn apply_env(&mut self) -> Result<(), StartupError> {
        if let Some(path) = env_nonempty("MOTO_DB_PATH") {
            self.db_path = path;
        }
        if let Some(backend) = env_nonempty("MOTO_DETECTOR_BACKEND") {
            self.detector.kind = DetectorKind::parse(&backend)?;
        }
        if let Some(url) = env_nonempty("MOTO_DETECTOR_URL") {
            self.detector.api_url = Some(url);
        }
        if let Some(key) = env_nonempty("MOTO_DETECTOR_API_KEY") {
            self.detector.api_key = Some(key);
        }
        if let Some(model) = env_nonempty("MOTO_MODEL_ID") {
            self.detector.model_id = Some(model);
        }
        if let Some(path) = env_nonempty("MOTO_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = env_nonempty("MOTO_DETECTOR_TIMEOUT_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                StartupError::Config("MOTO_DETECTOR_TIMEOUT_MS must be an integer".into())
            })?;
            self.detector.timeout = Duration::from_millis(ms);
        }
        if let Some(interval) = env_nonempty("MOTO_SAMPLE_INTERVAL") {
            self.sample_interval = interval.parse().map_err(|_| {
                StartupError::Config("MOTO_SAMPLE_INTERVAL must be a positive integer".into())
            })?;
        }
        if let Some(seconds) = env_nonempty("MOTO_SEGMENT_SECONDS") {
            self.segment.max_segment_seconds = seconds.parse().map_err(|_| {
                StartupError::Config("MOTO_SEGMENT_SECONDS must be an integer".into())
            })?;
        }
        if let Some(key) = env_nonempty("MOTO_YOUTUBE_API_KEY") {
            self.youtube.api_key = Some(key);
        }
        if let Some(addr) = env_nonempty("MOTO_API_ADDR") {
            self.api_addr = addr;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), StartupError> {
        if self.sample_interval == 0 {
            return Err(StartupError::Config(
                "sampling interval must be >= 1".into(),
            ));
        }
        if self.segment.max_segment_seconds == 0 {
            return Err(StartupError::Config(
                "max_segment_seconds must be greater than zero".into(),
            ));
        }
        if self.detector.timeout.is_zero() {
            return Err(StartupError::Config(
                "detector timeout must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(StartupError::Config(
                "confidence_threshold must be within [0, 1]".into(),
            ));
        }
        if self.detector.target_label.trim().is_empty() {
            return Err(StartupError::Config("target_label must not be empty".into()));
        }
        match self.detector.kind {
            DetectorKind::Http => {
                for (key, value) in [
                    ("api_url", &self.detector.api_url),
                    ("api_key", &self.detector.api_key),
                    ("model_id", &self.detector.model_id),
                ] {
                    if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                        return Err(StartupError::Config(format!(
                            "detector.{} is required for the http backend",
                            key
                        )));
                    }
                }
            }
            DetectorKind::Tract => {
                if self.detector.model_path.is_none() {
                    return Err(StartupError::Config(
                        "detector.model_path is required for the tract backend".into(),
                    ));
                }
            }
            DetectorKind::Stub => {}
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<AppConfigFile, StartupError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        StartupError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&raw)
        .map_err(|e| StartupError::Config(format!("invalid config file {}: {}", path.display(), e)))
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::from_file(AppConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.sample_interval, DEFAULT_SAMPLE_INTERVAL);
        assert_eq!(cfg.segment.max_segment_seconds, 200);
        assert_eq!(cfg.detector.kind, DetectorKind::Stub);
        assert_eq!(cfg.detector.labels[3], "motorcycle");
        assert_eq!(cfg.annotation.app_name, DEFAULT_APP_NAME);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let file: AppConfigFile = toml::from_str("[sampling]\ninterval = 0\n").unwrap();
        let cfg = AppConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn http_backend_requires_credentials() {
        let file: AppConfigFile =
            toml::from_str("[detector]\nbackend = \"http\"\napi_url = \"https://x\"\n").unwrap();
        let cfg = AppConfig::from_file(file).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("api_key"), "{}", err);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(DetectorKind::parse("opencv").is_err());
        assert_eq!(DetectorKind::parse(" ONNX ").unwrap(), DetectorKind::Tract);
    }
}
