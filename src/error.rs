use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fatal errors for a single run. The message always starts with the stage
/// that failed so it can be shown to the operator as-is.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("open: cannot read media '{uri}': {reason}")]
    MediaOpen { uri: String, reason: String },

    #[error("open: invalid media '{uri}': {reason}")]
    InvalidMedia { uri: String, reason: String },

    #[error("decode: {0}")]
    Decode(String),

    #[error("encode: {0}")]
    Encode(String),

    #[error("download: segment {index}: {reason}")]
    SegmentDownload { index: usize, reason: String },

    #[error("scratch: {0}")]
    Scratch(String),

    #[error("encode: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn media_open(uri: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::MediaOpen {
            uri: uri.into(),
            reason: err.to_string(),
        }
    }

    pub fn invalid_media(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMedia {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Stage label used in user-facing messages.
    pub fn stage(&self) -> &'static str {
        match self {
            ProcessError::MediaOpen { .. } | ProcessError::InvalidMedia { .. } => "open",
            ProcessError::Decode(_) => "decode",
            ProcessError::Encode(_) | ProcessError::Io(_) => "encode",
            ProcessError::SegmentDownload { .. } => "download",
            ProcessError::Scratch(_) => "scratch",
        }
    }
}

/// Per-frame detector failure. The sampler records a zero count and moves on.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectError {
    #[error("detector timed out after {0:?}")]
    Timeout(Duration),

    #[error("detector failed: {0}")]
    Failed(String),
}

impl DetectError {
    pub fn failed(err: impl fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Errors raised while wiring the application together.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("config: {0}")]
    Config(String),

    #[error("detector '{backend}': {reason}")]
    Detector { backend: String, reason: String },

    #[error("store '{path}': {reason}")]
    Store { path: String, reason: String },
}

/// Recoverable condition surfaced at the end of a run.
#[derive(Clone, Debug, PartialEq)]
pub enum RunWarning {
    DetectorSkipped {
        frame_index: u64,
        timed_out: bool,
        reason: String,
    },
    SegmentFailed {
        index: usize,
        reason: String,
    },
    PersistenceFailed {
        reason: String,
    },
    JoinFailed {
        reason: String,
    },
}

impl RunWarning {
    /// One line per distinct warning class, e.g. "2 frame(s) skipped by the detector".
    pub fn summary(warnings: &[RunWarning]) -> Vec<String> {
        let skipped = warnings
            .iter()
            .filter(|w| matches!(w, RunWarning::DetectorSkipped { .. }))
            .count();
        let timed_out = warnings
            .iter()
            .filter(|w| matches!(w, RunWarning::DetectorSkipped { timed_out: true, .. }))
            .count();

        let mut lines = Vec::new();
        if skipped > 0 {
            lines.push(format!(
                "{} frame(s) skipped by the detector ({} timed out)",
                skipped, timed_out
            ));
        }
        for warning in warnings {
            match warning {
                RunWarning::SegmentFailed { index, reason } => {
                    lines.push(format!("segment {} failed: {}", index, reason));
                }
                RunWarning::PersistenceFailed { reason } => {
                    lines.push(format!("result not stored: {}", reason));
                }
                RunWarning::JoinFailed { reason } => {
                    lines.push(format!("annotated segments not joined: {}", reason));
                }
                RunWarning::DetectorSkipped { .. } => {}
            }
        }
        lines
    }
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::DetectorSkipped {
                frame_index,
                reason,
                ..
            } => write!(f, "detect: frame {} skipped: {}", frame_index, reason),
            RunWarning::SegmentFailed { index, reason } => {
                write!(f, "segment {} failed: {}", index, reason)
            }
            RunWarning::PersistenceFailed { reason } => write!(f, "store: {}", reason),
            RunWarning::JoinFailed { reason } => write!(f, "join: {}", reason),
        }
    }
}
