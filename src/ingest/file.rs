//! Local video source.
//!
//! `VideoSource` reads frames sequentially from a local file, optionally
//! restricted to a time window. Paths starting with `stub://` produce a
//! deterministic synthetic clip instead:
//!
//! `stub://name?frames=100&fps=10&width=64&height=48`
//!
//! Extra synthetic knobs: `fail_at=K` makes decoding fail on absolute frame
//! `K`, `unreadable=1` makes opening fail.

use image::{Rgb, RgbImage};
use url::Url;

#[cfg(feature = "media-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use crate::error::ProcessError;
use crate::frame::{MediaInfo, VideoFrame};

pub const STUB_SCHEME: &str = "stub://";

/// Half-open time range `[start_ms, end_ms)` of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeWindow {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn start_seconds(&self) -> f64 {
        self.start_ms as f64 / 1000.0
    }

    pub fn end_seconds(&self) -> f64 {
        self.end_ms as f64 / 1000.0
    }

    pub fn contains_seconds(&self, t: f64) -> bool {
        t >= self.start_seconds() && t < self.end_seconds()
    }
}

/// Sequential frame reader.
pub trait FrameSource {
    fn uri(&self) -> &str;

    fn info(&self) -> &MediaInfo;

    /// Next frame in order, `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, ProcessError>;
}

pub struct VideoSource {
    uri: String,
    backend: SourceBackend,
}

enum SourceBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "media-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl VideoSource {
    /// Open `uri` for sequential reading.
    ///
    /// Fails with `MediaOpen` when the source cannot be decoded and with
    /// `InvalidMedia` when it reports a non-positive frame rate.
    pub fn open(uri: &str, window: Option<TimeWindow>) -> Result<Self, ProcessError> {
        if uri.trim().is_empty() {
            return Err(ProcessError::media_open(uri, "empty path"));
        }
        let backend = if is_synthetic(uri) {
            SourceBackend::Synthetic(SyntheticSource::new(uri, window)?)
        } else {
            if uri.contains("://") {
                return Err(ProcessError::media_open(
                    uri,
                    "only local paths are read directly; download remote media first",
                ));
            }
            #[cfg(feature = "media-ffmpeg")]
            {
                SourceBackend::Ffmpeg(
                    FfmpegFileSource::open(uri, window)
                        .map_err(|e| ProcessError::media_open(uri, format!("{:#}", e)))?,
                )
            }
            #[cfg(not(feature = "media-ffmpeg"))]
            {
                let _ = window;
                return Err(ProcessError::media_open(
                    uri,
                    "video decoding requires the media-ffmpeg feature",
                ));
            }
        };

        let source = Self {
            uri: uri.to_string(),
            backend,
        };
        let info = source.info();
        if !info.has_valid_rate() {
            return Err(ProcessError::invalid_media(
                uri,
                format!("frame rate must be positive, got {}", info.fps),
            ));
        }
        log::debug!(
            "opened {} ({}x{} @ {:.2} fps, {:.1}s)",
            uri,
            info.width,
            info.height,
            info.fps,
            info.duration_seconds
        );
        Ok(source)
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self.backend, SourceBackend::Synthetic(_))
    }
}

impl FrameSource for VideoSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn info(&self) -> &MediaInfo {
        match &self.backend {
            SourceBackend::Synthetic(source) => &source.info,
            #[cfg(feature = "media-ffmpeg")]
            SourceBackend::Ffmpeg(source) => source.info(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<VideoFrame>, ProcessError> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "media-ffmpeg")]
            SourceBackend::Ffmpeg(source) => source
                .next_frame()
                .map_err(|e| ProcessError::Decode(format!("{}: {:#}", self.uri, e))),
        }
    }
}

pub fn is_synthetic(uri: &str) -> bool {
    uri.starts_with(STUB_SCHEME)
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticSource {
    info: MediaInfo,
    total_frames: u64,
    /// Absolute index of the next frame to emit.
    cursor: u64,
    /// Absolute index one past the last frame to emit.
    stop: u64,
    first: u64,
    fail_at: Option<u64>,
}

impl SyntheticSource {
    fn new(uri: &str, window: Option<TimeWindow>) -> Result<Self, ProcessError> {
        let url = Url::parse(uri).map_err(|e| ProcessError::media_open(uri, e))?;
        let mut frames = 100u64;
        let mut fps = 10.0f64;
        let mut width = 64u32;
        let mut height = 48u32;
        let mut fail_at = None;
        for (key, value) in url.query_pairs() {
            let bad = || ProcessError::media_open(uri, format!("bad value for '{}'", key));
            match key.as_ref() {
                "frames" => frames = value.parse().map_err(|_| bad())?,
                "fps" => fps = value.parse().map_err(|_| bad())?,
                "width" => width = value.parse().map_err(|_| bad())?,
                "height" => height = value.parse().map_err(|_| bad())?,
                "fail_at" => fail_at = Some(value.parse().map_err(|_| bad())?),
                "unreadable" if value == "1" => {
                    return Err(ProcessError::media_open(uri, "synthetic source is unreadable"));
                }
                _ => {}
            }
        }
        if width == 0 || height == 0 {
            return Err(ProcessError::media_open(uri, "frame size must be non-zero"));
        }

        let duration = if fps > 0.0 { frames as f64 / fps } else { 0.0 };
        let (first, stop) = match window {
            Some(w) if fps > 0.0 => {
                let first = ((w.start_seconds() * fps).ceil() as u64).min(frames);
                let stop = ((w.end_seconds() * fps).ceil() as u64).min(frames);
                (first, stop.max(first))
            }
            _ => (0, frames),
        };
        let window_duration = match window {
            Some(w) => (w.end_seconds().min(duration) - w.start_seconds()).max(0.0),
            None => duration,
        };

        Ok(Self {
            info: MediaInfo {
                fps,
                width,
                height,
                frame_count: Some(stop - first),
                duration_seconds: window_duration,
            },
            total_frames: frames,
            cursor: first,
            stop,
            first,
            fail_at,
        })
    }

    fn next_frame(&mut self) -> Result<Option<VideoFrame>, ProcessError> {
        if self.cursor >= self.stop || self.cursor >= self.total_frames {
            return Ok(None);
        }
        if self.fail_at == Some(self.cursor) {
            return Err(ProcessError::Decode(format!(
                "synthetic decode failure at frame {}",
                self.cursor
            )));
        }
        let absolute = self.cursor;
        self.cursor += 1;

        let index = absolute - self.first;
        let pts = index as f64 / self.info.fps;
        Ok(Some(VideoFrame::new(
            synthetic_image(self.info.width, self.info.height, absolute),
            index,
            pts,
        )))
    }
}

fn synthetic_image(width: u32, height: u32, frame: u64) -> RgbImage {
    let shift = (frame % 256) as u32;
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            ((x + shift) % 256) as u8,
            ((y + shift) % 256) as u8,
            ((x + y + shift) % 256) as u8,
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(source: &mut VideoSource) -> Vec<VideoFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn synthetic_source_yields_requested_frames() {
        let mut source = VideoSource::open("stub://clip?frames=12&fps=4&width=8&height=6", None)
            .unwrap();
        assert!(source.is_synthetic());
        assert_eq!(source.info().duration_seconds, 3.0);
        let frames = drain(&mut source);
        assert_eq!(frames.len(), 12);
        assert_eq!(frames[11].index, 11);
        assert_eq!(frames[0].width(), 8);
    }

    #[test]
    fn window_selects_contiguous_frames() {
        let uri = "stub://clip?frames=100&fps=10";
        let a = drain(&mut VideoSource::open(uri, Some(TimeWindow::new(0, 4_000))).unwrap());
        let b = drain(&mut VideoSource::open(uri, Some(TimeWindow::new(4_000, 10_000))).unwrap());
        assert_eq!(a.len(), 40);
        assert_eq!(b.len(), 60);
        assert_eq!(b[0].index, 0);
        assert_eq!(b[0].pts_seconds, 0.0);
    }

    #[test]
    fn zero_fps_is_invalid_media() {
        let err = VideoSource::open("stub://clip?fps=0", None).err().unwrap();
        assert!(matches!(err, ProcessError::InvalidMedia { .. }));
    }

    #[test]
    fn unreadable_and_remote_sources_fail_to_open() {
        let err = VideoSource::open("stub://clip?unreadable=1", None).err().unwrap();
        assert!(matches!(err, ProcessError::MediaOpen { .. }));
        let err = VideoSource::open("https://example.com/a.mp4", None).err().unwrap();
        assert!(matches!(err, ProcessError::MediaOpen { .. }));
    }

    #[test]
    fn fail_at_surfaces_decode_error() {
        let mut source = VideoSource::open("stub://clip?frames=5&fail_at=2", None).unwrap();
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(matches!(source.next_frame(), Err(ProcessError::Decode(_))));
    }
}
