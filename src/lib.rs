//! Motorcycle counter
//!
//! This crate counts motorcycles in uploaded images, local videos and YouTube
//! videos, writes an annotated copy of the media, and persists per-frame counts
//! so that they can be charted per hour, day or month.
//!
//! # Architecture
//!
//! - `detect`: detector adapter (hosted HTTP API, local ONNX weights, stub)
//! - `ingest`: frame sources (local files, YouTube downloads, synthetic `stub://`)
//! - `sampler`: the frame sampling loop (infer every Nth frame, annotate every frame)
//! - `segment`: splits long videos into contiguous time windows
//! - `pipeline`: composition root tying detector, sampler, segmenter and store together
//! - `storage` / `stats`: append-only result store and time-bucketed aggregates
//! - `api`: read-only JSON API consumed by the dashboard
//!
//! The pipeline is single-threaded and blocking. Only the result store is
//! shared across threads (the API reads while a run writes).

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod sampler;
pub mod segment;
pub mod stats;
pub mod storage;
pub mod ui;

pub use annotate::{AnnotationStyle, Annotator};
pub use config::AppConfig;
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectorBackend, StubBackend};
pub use error::{DetectError, ProcessError, RunWarning, StartupError};
pub use frame::{MediaInfo, VideoFrame};
pub use ingest::{TimeWindow, VideoSource};
pub use output::{OutputArtifact, VideoSink};
pub use pipeline::{Processor, ProcessorSettings, RunReport};
pub use sampler::{FrameSampler, ProgressEvent, SampleOutcome, SamplerConfig};
pub use segment::{plan_segments, Segment, VideoSegmenter};
pub use stats::{query_stats, BucketKey, Granularity, StatBucket, StatsSummary, TimeFilter};
pub use storage::{InMemoryResultStore, ResultStore, SqliteResultStore};

/// Caption shown on every output frame.
pub const DEFAULT_APP_NAME: &str = "IAMotorCycle CrossCounter";
/// Detector label counted by default.
pub const DEFAULT_TARGET_LABEL: &str = "motorcycle";

// -------------------- Runs --------------------

/// Unique identifier for one end-to-end processing run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Timestamp prefix plus 64 random bits; two calls never collide in practice.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(format!(
            "run-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            hex::encode(bytes)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunKind {
    Image,
    Video,
    VideoSegment,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Image => "image",
            RunKind::Video => "video",
            RunKind::VideoSegment => "video-segment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(RunKind::Image),
            "video" => Some(RunKind::Video),
            "video-segment" => Some(RunKind::VideoSegment),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Complete,
    /// At least one segment failed; counts of the completed segments are kept.
    PartiallyFailed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Complete => "complete",
            RunStatus::PartiallyFailed => "partially_failed",
        }
    }
}

/// Target-class detections in one sampled frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameResult {
    pub timestamp: DateTime<Utc>,
    pub count: u32,
}

impl FrameResult {
    pub fn now(count: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            count,
        }
    }
}

/// One processed upload.
///
/// `total_count` is always the sum of `frame_results`; there is no separate
/// accumulator that could drift from the per-frame records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceRun {
    pub run_id: RunId,
    pub kind: RunKind,
    pub total_count: u64,
    pub frame_results: Vec<FrameResult>,
    pub output_artifact: Option<PathBuf>,
    pub status: RunStatus,
}

impl InferenceRun {
    pub fn from_frames(
        run_id: RunId,
        kind: RunKind,
        frame_results: Vec<FrameResult>,
        output_artifact: Option<PathBuf>,
    ) -> Self {
        let total_count = sum_counts(&frame_results);
        Self {
            run_id,
            kind,
            total_count,
            frame_results,
            output_artifact,
            status: RunStatus::Complete,
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_consistent(&self) -> bool {
        self.total_count == sum_counts(&self.frame_results)
    }
}

pub(crate) fn sum_counts(frames: &[FrameResult]) -> u64 {
    frames.iter().map(|f| u64::from(f.count)).sum()
}
