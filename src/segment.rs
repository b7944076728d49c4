//! Splitting long videos into contiguous segments.
//!
//! Segments are planned in whole milliseconds so that `end(i) == start(i+1)`
//! holds exactly. Each segment is sampled on its own and the results are
//! folded together in segment order. A segment that cannot be opened,
//! downloaded or sampled is recorded as a warning; the others still run.
//! If the segment outputs cannot be joined the counts are still returned,
//! without an annotated output.

use std::path::{Path, PathBuf};

use crate::annotate::Annotator;
use crate::detect::DetectorBackend;
use crate::error::{ProcessError, RunWarning};
use crate::ingest::{FrameSource, TimeWindow, VideoSource, YoutubeUrl, YtDlp};
use crate::output::{concat_outputs, VideoSink};
use crate::sampler::{FrameSampler, ProgressEvent, SamplerConfig};
use crate::{sum_counts, FrameResult, RunStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub window: TimeWindow,
}

impl Segment {
    pub fn duration_ms(&self) -> u64 {
        self.window.end_ms - self.window.start_ms
    }
}

/// `ceil(duration / max)` contiguous segments covering `[0, duration)`.
///
/// A zero duration yields no segments; a zero maximum is treated as one.
pub fn plan_segments(duration_ms: u64, max_segment_ms: u64) -> Vec<Segment> {
    let max = max_segment_ms.max(1);
    let count = duration_ms.div_ceil(max);
    (0..count)
        .map(|i| Segment {
            index: i as usize,
            window: TimeWindow::new(i * max, ((i + 1) * max).min(duration_ms)),
        })
        .collect()
}

/// Seconds to whole milliseconds, rounding to the nearest.
pub fn seconds_to_ms(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    }
}

/// Opens the frames of one segment.
pub trait SegmentProvider {
    type Source: FrameSource;

    fn open_segment(&mut self, segment: &Segment) -> Result<Self::Source, ProcessError>;

    /// Whether segment sources are synthetic (`stub://`) clips.
    fn synthetic(&self) -> bool;
}

/// Time windows of one local file.
pub struct LocalSegments {
    uri: String,
}

impl LocalSegments {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl SegmentProvider for LocalSegments {
    type Source = VideoSource;

    fn open_segment(&mut self, segment: &Segment) -> Result<VideoSource, ProcessError> {
        VideoSource::open(&self.uri, Some(segment.window))
    }

    fn synthetic(&self) -> bool {
        crate::ingest::is_synthetic(&self.uri)
    }
}

/// Sections of a YouTube video, downloaded one at a time with yt-dlp.
pub struct YoutubeSegments<'a> {
    ytdlp: &'a YtDlp,
    video: YoutubeUrl,
    dest_dir: PathBuf,
}

impl<'a> YoutubeSegments<'a> {
    pub fn new(ytdlp: &'a YtDlp, video: YoutubeUrl, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            ytdlp,
            video,
            dest_dir: dest_dir.into(),
        }
    }
}

impl SegmentProvider for YoutubeSegments<'_> {
    type Source = VideoSource;

    fn open_segment(&mut self, segment: &Segment) -> Result<VideoSource, ProcessError> {
        let path = self.ytdlp.download_section(
            &self.video,
            segment.window,
            segment.index,
            &self.dest_dir,
        )?;
        VideoSource::open(&path.to_string_lossy(), None)
    }

    fn synthetic(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentProgress {
    pub segment: usize,
    pub segments: usize,
    pub event: ProgressEvent,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SegmentedOutcome {
    pub frame_results: Vec<FrameResult>,
    pub total_count: u64,
    pub frames_read: u64,
    pub segments_completed: usize,
    pub segments_failed: usize,
    /// Whether the segment outputs were joined into the run output.
    pub joined: bool,
    pub status: RunStatus,
    pub warnings: Vec<RunWarning>,
}

pub struct VideoSegmenter {
    max_segment_ms: u64,
}

impl VideoSegmenter {
    pub fn new(max_segment_seconds: u64) -> Self {
        Self {
            max_segment_ms: max_segment_seconds.saturating_mul(1000),
        }
    }

    pub fn plan(&self, duration_seconds: f64) -> Vec<Segment> {
        plan_segments(seconds_to_ms(duration_seconds), self.max_segment_ms)
    }

    /// Sample every planned segment and join the outputs into `output`.
    ///
    /// Segment outputs are written next to `output` as `part_NNN.mp4`.
    /// Fails only when no segment completes. A failed join is a warning and
    /// leaves `joined` false.
    #[allow(clippy::too_many_arguments)]
    pub fn run<P: SegmentProvider>(
        &self,
        provider: &mut P,
        duration_seconds: f64,
        detector: &mut dyn DetectorBackend,
        annotator: &Annotator,
        config: &SamplerConfig,
        output: &Path,
        on_progress: &mut dyn FnMut(SegmentProgress),
    ) -> Result<SegmentedOutcome, ProcessError> {
        let plan = self.plan(duration_seconds);
        if plan.is_empty() {
            return Err(ProcessError::invalid_media(
                output.display().to_string(),
                "nothing to segment: duration is zero",
            ));
        }
        let scratch = output.parent().unwrap_or_else(|| Path::new("."));
        log::info!("processing {} segment(s)", plan.len());

        let mut parts = Vec::new();
        let mut frame_results = Vec::new();
        let mut frames_read = 0;
        let mut warnings = Vec::new();
        let mut first_error = None;

        for segment in &plan {
            let part = scratch.join(format!("part_{:03}.mp4", segment.index));
            let attempt = self.run_segment(
                provider,
                segment,
                plan.len(),
                &mut *detector,
                annotator,
                config,
                &part,
                on_progress,
            );
            match attempt {
                Ok(outcome) => {
                    frames_read += outcome.frames_read;
                    frame_results.extend(outcome.frame_results);
                    warnings.extend(outcome.warnings);
                    parts.push(part);
                }
                Err(err) => {
                    log::warn!("segment {} failed: {}", segment.index, err);
                    warnings.push(RunWarning::SegmentFailed {
                        index: segment.index,
                        reason: err.to_string(),
                    });
                    first_error.get_or_insert(err);
                }
            }
        }

        if parts.is_empty() {
            return Err(first_error.unwrap_or_else(|| {
                ProcessError::Encode("no segment produced output".into())
            }));
        }
        let joined = match concat_outputs(&parts, output) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("joining {} segment output(s) failed: {}", parts.len(), err);
                warnings.push(RunWarning::JoinFailed {
                    reason: err.to_string(),
                });
                false
            }
        };

        let segments_failed = plan.len() - parts.len();
        Ok(SegmentedOutcome {
            total_count: sum_counts(&frame_results),
            frame_results,
            frames_read,
            segments_completed: parts.len(),
            segments_failed,
            joined,
            status: if segments_failed > 0 || !joined {
                RunStatus::PartiallyFailed
            } else {
                RunStatus::Complete
            },
            warnings,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_segment<P: SegmentProvider>(
        &self,
        provider: &mut P,
        segment: &Segment,
        segments: usize,
        detector: &mut dyn DetectorBackend,
        annotator: &Annotator,
        config: &SamplerConfig,
        part: &Path,
        on_progress: &mut dyn FnMut(SegmentProgress),
    ) -> Result<crate::sampler::SampleOutcome, ProcessError> {
        let source = provider.open_segment(segment)?;
        let sink = VideoSink::for_source(part, source.info(), provider.synthetic())?;
        let mut pass = FrameSampler::new(detector, annotator, config.clone()).start(source, sink);
        for event in pass.by_ref() {
            on_progress(SegmentProgress {
                segment: segment.index,
                segments,
                event: event?,
            });
        }
        pass.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::AnnotationStyle;
    use crate::detect::StubBackend;
    use std::num::NonZeroU64;

    #[test]
    fn plan_covers_duration_contiguously() {
        let plan = plan_segments(450_000, 200_000);
        let windows: Vec<_> = plan.iter().map(|s| (s.window.start_ms, s.window.end_ms)).collect();
        assert_eq!(
            windows,
            vec![(0, 200_000), (200_000, 400_000), (400_000, 450_000)]
        );
    }

    #[test]
    fn plan_has_ceil_segments_without_gaps() {
        for (duration, max) in [(1u64, 1u64), (999, 1000), (1000, 1000), (1001, 1000), (7, 3), (12_345, 17)] {
            let plan = plan_segments(duration, max);
            assert_eq!(plan.len() as u64, duration.div_ceil(max));
            assert_eq!(plan[0].window.start_ms, 0);
            assert_eq!(plan.last().unwrap().window.end_ms, duration);
            for pair in plan.windows(2) {
                assert_eq!(pair[0].window.end_ms, pair[1].window.start_ms);
            }
            assert!(plan.iter().all(|s| s.duration_ms() > 0 && s.duration_ms() <= max));
        }
    }

    #[test]
    fn zero_duration_has_no_segments() {
        assert!(plan_segments(0, 200_000).is_empty());
        assert!(VideoSegmenter::new(200).plan(f64::NAN).is_empty());
    }

    #[test]
    fn seconds_round_to_milliseconds() {
        assert_eq!(seconds_to_ms(450.0), 450_000);
        assert_eq!(seconds_to_ms(0.0004), 0);
        assert_eq!(seconds_to_ms(-3.0), 0);
    }

    #[test]
    fn join_failure_keeps_the_counts() {
        let scratch = tempfile::tempdir().unwrap();
        // A directory in the way of the joined output.
        let output = scratch.path().join("annotated.mp4");
        std::fs::create_dir(&output).unwrap();

        let mut provider = LocalSegments::new("stub://clip?frames=60&fps=2");
        let mut detector = StubBackend::repeating("motorcycle", 1);
        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();
        let config = SamplerConfig::new(NonZeroU64::new(10).unwrap());
        let outcome = VideoSegmenter::new(10)
            .run(
                &mut provider,
                30.0,
                &mut detector,
                &annotator,
                &config,
                &output,
                &mut |_| {},
            )
            .unwrap();

        assert_eq!(outcome.segments_completed, 3);
        assert_eq!(outcome.segments_failed, 0);
        assert_eq!(outcome.frames_read, 60);
        assert_eq!(outcome.total_count, 6);
        assert!(!outcome.joined);
        assert_eq!(outcome.status, RunStatus::PartiallyFailed);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| matches!(w, RunWarning::JoinFailed { .. })));
    }
}
