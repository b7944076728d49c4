//! Media ingestion.
//!
//! - Local video files and `stub://` synthetic clips (`file`)
//! - Local files decoded with FFmpeg (feature: media-ffmpeg)
//! - YouTube metadata and downloads through yt-dlp (`youtube`)
//!
//! Every source yields frames strictly in order and never skips frames on
//! its own; decimation is the sampler's job.

pub mod file;
#[cfg(feature = "media-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod youtube;

pub use file::{is_synthetic, FrameSource, TimeWindow, VideoSource, STUB_SCHEME};
pub use youtube::{parse_iso8601_duration, VideoMetadata, YoutubeClient, YoutubeUrl, YtDlp};
