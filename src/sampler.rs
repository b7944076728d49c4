//! Frame sampling loop.
//!
//! Every frame of the source is read in order and written to the sink. Frames
//! whose index is a multiple of the sampling interval go through the detector
//! first; matching detections are boxed on that frame and counted. Every
//! frame gets the running-total caption.
//!
//! The loop is exposed as an iterator of [`ProgressEvent`]s so a presentation
//! layer can follow along without the sampler knowing about it.

use std::num::NonZeroU64;

use image::RgbImage;

use crate::annotate::Annotator;
use crate::detect::{Detection, DetectorBackend};
use crate::error::{DetectError, ProcessError, RunWarning};
use crate::ingest::FrameSource;
use crate::output::FrameSink;
use crate::{sum_counts, FrameResult, DEFAULT_TARGET_LABEL};

#[derive(Clone, Debug)]
pub struct SamplerConfig {
    /// Run the detector on frames `0, N, 2N, ...`.
    pub interval: NonZeroU64,
    pub target_label: String,
    /// Detections below this confidence are ignored.
    pub min_confidence: f32,
    /// Draw boxes and the caption. Counting is unaffected.
    pub annotate: bool,
}

impl SamplerConfig {
    pub fn new(interval: NonZeroU64) -> Self {
        Self {
            interval,
            target_label: DEFAULT_TARGET_LABEL.to_string(),
            min_confidence: 0.0,
            annotate: true,
        }
    }

    pub fn with_target_label(mut self, label: impl Into<String>) -> Self {
        self.target_label = label.into();
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn is_sampled(&self, frame_index: u64) -> bool {
        frame_index % self.interval.get() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressEvent {
    pub frames_done: u64,
    pub expected_total: Option<u64>,
    /// `frames_done / expected_total` clamped to [0, 1]; `None` when the
    /// total is unknown or zero.
    pub fraction: Option<f32>,
    pub running_total: u64,
}

impl ProgressEvent {
    fn new(frames_done: u64, expected_total: Option<u64>, running_total: u64) -> Self {
        let fraction = expected_total
            .filter(|total| *total > 0)
            .map(|total| (frames_done as f64 / total as f64).clamp(0.0, 1.0) as f32);
        Self {
            frames_done,
            expected_total,
            fraction,
            running_total,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SampleOutcome {
    pub frame_results: Vec<FrameResult>,
    /// Sum of `frame_results` counts.
    pub total_count: u64,
    pub frames_read: u64,
    pub frames_sampled: u64,
    pub warnings: Vec<RunWarning>,
}

pub struct FrameSampler<'a> {
    detector: &'a mut dyn DetectorBackend,
    annotator: &'a Annotator,
    config: SamplerConfig,
}

impl<'a> FrameSampler<'a> {
    pub fn new(
        detector: &'a mut dyn DetectorBackend,
        annotator: &'a Annotator,
        config: SamplerConfig,
    ) -> Self {
        Self {
            detector,
            annotator,
            config,
        }
    }

    /// Begin a pass over `source`. Nothing is read until the pass is iterated
    /// or finished.
    pub fn start<S, K>(self, source: S, sink: K) -> SamplingPass<'a, S, K>
    where
        S: FrameSource,
        K: FrameSink,
    {
        let expected_total = source.info().expected_frames();
        SamplingPass {
            sampler: self,
            source,
            sink,
            expected_total,
            frame_index: 0,
            frames_sampled: 0,
            running_total: 0,
            frame_results: Vec::new(),
            warnings: Vec::new(),
            done: false,
        }
    }

    /// Run a whole pass without observing progress.
    pub fn run<S, K>(self, source: S, sink: K) -> Result<SampleOutcome, ProcessError>
    where
        S: FrameSource,
        K: FrameSink,
    {
        self.start(source, sink).finish()
    }

    /// Detect, annotate and caption a single still image.
    pub fn process_still(mut self, mut image: RgbImage) -> (RgbImage, FrameResult, Vec<RunWarning>) {
        let mut warnings = Vec::new();
        let matched = self.infer(&image, 0, &mut warnings);
        let count = match_count(&matched);
        if self.config.annotate {
            self.annotator.annotate(&mut image, &matched, u64::from(count));
        }
        (image, FrameResult::now(count), warnings)
    }

    /// Target detections on one frame. Detector errors are recorded as
    /// warnings and yield no detections.
    fn infer(&mut self, image: &RgbImage, frame_index: u64, warnings: &mut Vec<RunWarning>) -> Vec<Detection> {
        match self.detector.detect(image) {
            Ok(detections) => {
                let matched: Vec<Detection> = detections
                    .into_iter()
                    .filter(|d| {
                        d.is_label(&self.config.target_label)
                            && d.confidence >= self.config.min_confidence
                    })
                    .collect();
                log::debug!("frame {}: {} match(es)", frame_index, matched.len());
                matched
            }
            Err(err) => {
                log::warn!("frame {} skipped: {}", frame_index, err);
                warnings.push(RunWarning::DetectorSkipped {
                    frame_index,
                    timed_out: matches!(err, DetectError::Timeout(_)),
                    reason: err.to_string(),
                });
                Vec::new()
            }
        }
    }
}

fn match_count(matched: &[Detection]) -> u32 {
    u32::try_from(matched.len()).unwrap_or(u32::MAX)
}

/// One in-progress sampling pass. Iterating drives the loop one frame at a
/// time; `finish` drains whatever is left and closes the sink.
pub struct SamplingPass<'a, S, K> {
    sampler: FrameSampler<'a>,
    source: S,
    sink: K,
    expected_total: Option<u64>,
    frame_index: u64,
    frames_sampled: u64,
    running_total: u64,
    frame_results: Vec<FrameResult>,
    warnings: Vec<RunWarning>,
    done: bool,
}

impl<'a, S, K> SamplingPass<'a, S, K>
where
    S: FrameSource,
    K: FrameSink,
{
    pub fn expected_total(&self) -> Option<u64> {
        self.expected_total
    }

    fn step(&mut self) -> Result<Option<ProgressEvent>, ProcessError> {
        let Some(frame) = self.source.next_frame()? else {
            return Ok(None);
        };
        let mut image = frame.image;

        let mut matched = Vec::new();
        if self.sampler.config.is_sampled(self.frame_index) {
            self.frames_sampled += 1;
            matched = self
                .sampler
                .infer(&image, self.frame_index, &mut self.warnings);
            let count = match_count(&matched);
            self.frame_results.push(FrameResult::now(count));
            self.running_total += u64::from(count);
        }

        if self.sampler.config.annotate {
            self.sampler
                .annotator
                .annotate(&mut image, &matched, self.running_total);
        }
        self.sink.write_frame(&image)?;
        self.frame_index += 1;

        Ok(Some(ProgressEvent::new(
            self.frame_index,
            self.expected_total,
            self.running_total,
        )))
    }

    /// Process any remaining frames, close the sink and return the counts.
    pub fn finish(mut self) -> Result<SampleOutcome, ProcessError> {
        while !self.done {
            if let Some(result) = self.next() {
                result?;
            }
        }
        self.sink.finish()?;
        if self.sink.frames_written() != self.frame_index {
            return Err(ProcessError::Encode(format!(
                "{}: {} frame(s) read but {} written",
                self.source.uri(),
                self.frame_index,
                self.sink.frames_written()
            )));
        }

        let total_count = sum_counts(&self.frame_results);
        debug_assert_eq!(total_count, self.running_total);
        log::info!(
            "{}: {} frame(s) read, {} sampled, total {}",
            self.source.uri(),
            self.frame_index,
            self.frames_sampled,
            total_count
        );
        Ok(SampleOutcome {
            frame_results: self.frame_results,
            total_count,
            frames_read: self.frame_index,
            frames_sampled: self.frames_sampled,
            warnings: self.warnings,
        })
    }
}

impl<'a, S, K> Iterator for SamplingPass<'a, S, K>
where
    S: FrameSource,
    K: FrameSink,
{
    type Item = Result<ProgressEvent, ProcessError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::AnnotationStyle;
    use crate::detect::StubBackend;
    use crate::frame::{MediaInfo, VideoFrame};

    struct Clip {
        info: MediaInfo,
        remaining: u64,
        next: u64,
    }

    impl Clip {
        fn new(frames: u64, frame_count: Option<u64>) -> Self {
            Self {
                info: MediaInfo {
                    fps: 10.0,
                    width: 16,
                    height: 16,
                    frame_count,
                    duration_seconds: 0.0,
                },
                remaining: frames,
                next: 0,
            }
        }
    }

    impl FrameSource for Clip {
        fn uri(&self) -> &str {
            "clip"
        }

        fn info(&self) -> &MediaInfo {
            &self.info
        }

        fn next_frame(&mut self) -> Result<Option<VideoFrame>, ProcessError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            let index = self.next;
            self.next += 1;
            Ok(Some(VideoFrame::new(RgbImage::new(16, 16), index, index as f64 / 10.0)))
        }
    }

    #[derive(Default)]
    struct CountingSink {
        frames: u64,
        finished: bool,
    }

    impl FrameSink for CountingSink {
        fn write_frame(&mut self, _image: &RgbImage) -> Result<(), ProcessError> {
            self.frames += 1;
            Ok(())
        }

        fn frames_written(&self) -> u64 {
            self.frames
        }

        fn finish(&mut self) -> Result<(), ProcessError> {
            self.finished = true;
            Ok(())
        }
    }

    fn config(interval: u64) -> SamplerConfig {
        SamplerConfig::new(NonZeroU64::new(interval).unwrap())
    }

    #[test]
    fn detector_sees_every_nth_frame() {
        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();
        for (frames, interval) in [(0u64, 1u64), (1, 5), (10, 3), (11, 11), (25, 4), (7, 100)] {
            let mut detector = StubBackend::new();
            let mut sink = CountingSink::default();
            let outcome = FrameSampler::new(&mut detector, &annotator, config(interval))
                .run(Clip::new(frames, None), &mut sink)
                .unwrap();
            let expected = (frames + interval - 1) / interval;
            assert_eq!(detector.calls(), expected, "F={} N={}", frames, interval);
            assert_eq!(outcome.frames_sampled, expected);
            assert_eq!(sink.frames, frames);
            assert!(sink.finished);
        }
    }

    #[test]
    fn progress_is_clamped_and_optional() {
        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();
        let mut detector = StubBackend::new();
        let mut sink = CountingSink::default();
        let events: Vec<_> = FrameSampler::new(&mut detector, &annotator, config(2))
            .start(Clip::new(4, Some(2)), &mut sink)
            .map(Result::unwrap)
            .collect();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].fraction, Some(0.5));
        assert_eq!(events[3].fraction, Some(1.0));

        let mut sink = CountingSink::default();
        let mut detector = StubBackend::new();
        let mut pass = FrameSampler::new(&mut detector, &annotator, config(2))
            .start(Clip::new(3, None), &mut sink);
        assert_eq!(pass.expected_total(), None);
        assert_eq!(pass.next().unwrap().unwrap().fraction, None);
    }

    #[test]
    fn only_target_label_above_threshold_counts() {
        use crate::detect::BoundingBox;
        let bbox = BoundingBox::from_corners(1.0, 1.0, 8.0, 8.0);
        let mut detector = StubBackend::with_detections(vec![
            Detection::new("Motorcycle", 0.9, bbox),
            Detection::new("car", 0.9, bbox),
            Detection::new("motorcycle", 0.1, bbox),
        ]);
        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();
        let mut sink = CountingSink::default();
        let outcome = FrameSampler::new(&mut detector, &annotator, config(1).with_min_confidence(0.4))
            .run(Clip::new(3, None), &mut sink)
            .unwrap();
        assert_eq!(outcome.total_count, 3);
        assert!(outcome.frame_results.iter().all(|r| r.count == 1));
    }

    #[test]
    fn still_image_counts_once() {
        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();
        let mut detector = StubBackend::repeating("motorcycle", 2);
        let (image, result, warnings) = FrameSampler::new(&mut detector, &annotator, config(1))
            .process_still(RgbImage::new(32, 32));
        assert_eq!(image.dimensions(), (32, 32));
        assert_eq!(result.count, 2);
        assert!(warnings.is_empty());
    }

    #[derive(Default)]
    struct KeepingSink {
        frames: Vec<RgbImage>,
    }

    impl FrameSink for KeepingSink {
        fn write_frame(&mut self, image: &RgbImage) -> Result<(), ProcessError> {
            self.frames.push(image.clone());
            Ok(())
        }

        fn frames_written(&self) -> u64 {
            self.frames.len() as u64
        }

        fn finish(&mut self) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    #[test]
    fn boxes_near_the_top_are_not_covered_by_the_caption() {
        use crate::detect::BoundingBox;
        let box_color = image::Rgb([0, 255, 0]);
        let mut detector = StubBackend::with_detections(vec![Detection::new(
            "motorcycle",
            0.9,
            BoundingBox::from_corners(5.0, 5.0, 30.0, 20.0),
        )]);
        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();
        let source =
            crate::ingest::VideoSource::open("stub://top?frames=2&width=64&height=48", None).unwrap();
        let mut sink = KeepingSink::default();
        FrameSampler::new(&mut detector, &annotator, config(2))
            .run(source, &mut sink)
            .unwrap();

        assert_eq!(sink.frames.len(), 2);
        // Sampled frame keeps its box inside the banner rows.
        assert_eq!(*sink.frames[0].get_pixel(5, 5), box_color);
        assert_eq!(*sink.frames[0].get_pixel(29, 12), box_color);
        // The next frame is not sampled and only carries the caption.
        assert_ne!(*sink.frames[1].get_pixel(5, 5), box_color);
    }

    #[test]
    fn sink_that_drops_frames_is_an_encode_error() {
        struct LossySink(u64);
        impl FrameSink for LossySink {
            fn write_frame(&mut self, _image: &RgbImage) -> Result<(), ProcessError> {
                self.0 += 1;
                Ok(())
            }
            fn frames_written(&self) -> u64 {
                self.0 / 2
            }
            fn finish(&mut self) -> Result<(), ProcessError> {
                Ok(())
            }
        }

        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();
        let mut detector = StubBackend::new();
        let err = FrameSampler::new(&mut detector, &annotator, config(1))
            .run(Clip::new(4, None), LossySink(0))
            .unwrap_err();
        assert!(matches!(err, ProcessError::Encode(_)));
    }

    #[test]
    fn decode_error_stops_the_pass() {
        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();
        let mut detector = StubBackend::new();
        let source = crate::ingest::VideoSource::open("stub://x?frames=10&fail_at=4", None).unwrap();
        let mut sink = CountingSink::default();
        let err = FrameSampler::new(&mut detector, &annotator, config(2))
            .run(source, &mut sink)
            .unwrap_err();
        assert!(matches!(err, ProcessError::Decode(_)));
        assert_eq!(sink.frames, 4);
        assert!(!sink.finished);
    }
}
