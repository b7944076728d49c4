//! Processing pipeline.
//!
//! `Processor` is built once by the composition root with an explicit
//! detector and result store. Each `process_*` call is one run: it samples
//! the media (directly or segment by segment), writes the annotated output
//! into a run-scoped `OutputArtifact`, and then stores the result. A storage
//! failure downgrades to a warning; the counts and the artifact are still
//! returned. A segmented run whose outputs could not be joined is stored
//! without an artifact.

use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::annotate::Annotator;
use crate::config::{AppConfig, SegmentSettings, YoutubeSettings};
use crate::detect::{BackendRegistry, DetectorBackend};
use crate::error::{ProcessError, RunWarning, StartupError};
use crate::ingest::{FrameSource, VideoSource, YoutubeClient, YoutubeUrl, YtDlp};
use crate::output::{OutputArtifact, VideoSink};
use crate::sampler::{FrameSampler, SampleOutcome, SamplerConfig};
use crate::segment::{LocalSegments, SegmentProgress, SegmentedOutcome, VideoSegmenter, YoutubeSegments};
use crate::storage::ResultStore;
use crate::{InferenceRun, RunId, RunKind, RunStatus};

#[derive(Clone, Debug)]
pub struct ProcessorSettings {
    pub sampler: SamplerConfig,
    pub segment: SegmentSettings,
    pub youtube: YoutubeSettings,
    /// Parent of the per-run scratch directories; system temp dir if unset.
    pub work_dir: Option<PathBuf>,
}

impl ProcessorSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let interval = NonZeroU64::new(config.sample_interval)
            .ok_or_else(|| StartupError::Config("sampling interval must be >= 1".into()))?;
        Ok(Self {
            sampler: SamplerConfig::new(interval)
                .with_target_label(config.detector.target_label.clone())
                .with_min_confidence(config.detector.confidence_threshold),
            segment: config.segment.clone(),
            youtube: config.youtube.clone(),
            work_dir: config.work_dir.clone(),
        })
    }
}

/// Outcome of one run.
#[derive(Debug)]
pub struct RunReport {
    pub run: InferenceRun,
    pub warnings: Vec<RunWarning>,
    /// Annotated output. Dropping it deletes the file.
    pub artifact: Option<OutputArtifact>,
    pub frames_read: u64,
    pub stored: bool,
}

impl RunReport {
    pub fn warning_summary(&self) -> Vec<String> {
        RunWarning::summary(&self.warnings)
    }
}

pub struct Processor {
    detector: Box<dyn DetectorBackend>,
    store: Arc<dyn ResultStore>,
    annotator: Annotator,
    settings: ProcessorSettings,
}

impl Processor {
    pub fn new(
        detector: Box<dyn DetectorBackend>,
        store: Arc<dyn ResultStore>,
        annotator: Annotator,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            detector,
            store,
            annotator,
            settings,
        }
    }

    /// Wire detector, annotator and settings from configuration.
    pub fn from_config(config: &AppConfig, store: Arc<dyn ResultStore>) -> Result<Self, StartupError> {
        let detector = BackendRegistry::from_settings(&config.detector)?.take_default()?;
        let annotator = Annotator::new(config.annotation.clone())?;
        let settings = ProcessorSettings::from_config(config)?;
        Ok(Self::new(detector, store, annotator, settings))
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    pub fn process_image(&mut self, path: &Path) -> Result<RunReport, ProcessError> {
        let uri = path.display().to_string();
        let image = image::open(path)
            .map_err(|e| ProcessError::media_open(&uri, e))?
            .to_rgb8();

        let artifact = OutputArtifact::create(self.settings.work_dir.as_deref(), "annotated.png")?;
        let sampler = FrameSampler::new(
            &mut *self.detector,
            &self.annotator,
            self.settings.sampler.clone(),
        );
        let (annotated, result, warnings) = sampler.process_still(image);
        annotated
            .save(artifact.path())
            .map_err(|e| ProcessError::Encode(format!("{}: {}", artifact.path().display(), e)))?;

        let run = InferenceRun::from_frames(
            RunId::generate(),
            RunKind::Image,
            vec![result],
            Some(artifact.path().to_path_buf()),
        );
        Ok(self.finalize(run, warnings, Some(artifact), 1))
    }

    pub fn process_video(
        &mut self,
        uri: &str,
        on_progress: &mut dyn FnMut(SegmentProgress),
    ) -> Result<RunReport, ProcessError> {
        let source = VideoSource::open(uri, None)?;
        let info = source.info().clone();
        let size = if source.is_synthetic() {
            None
        } else {
            let metadata = std::fs::metadata(uri).map_err(|e| ProcessError::media_open(uri, e))?;
            Some(metadata.len())
        };
        let artifact = OutputArtifact::create(self.settings.work_dir.as_deref(), "annotated.mp4")?;

        if !self.needs_segmenting(info.duration_seconds, size) {
            let outcome = self.sample_direct(source, artifact.path(), on_progress)?;
            return Ok(self.finish_direct(outcome, artifact));
        }
        drop(source);

        log::info!(
            "{} is {:.1}s long; splitting into {}s segments",
            uri,
            info.duration_seconds,
            self.settings.segment.max_segment_seconds
        );
        let mut provider = LocalSegments::new(uri);
        let outcome = VideoSegmenter::new(self.settings.segment.max_segment_seconds).run(
            &mut provider,
            info.duration_seconds,
            &mut *self.detector,
            &self.annotator,
            &self.settings.sampler,
            artifact.path(),
            on_progress,
        )?;
        Ok(self.finish_segmented(outcome, artifact))
    }

    pub fn process_youtube(
        &mut self,
        url: &str,
        on_progress: &mut dyn FnMut(SegmentProgress),
    ) -> Result<RunReport, ProcessError> {
        let video = YoutubeUrl::parse(url).map_err(|e| ProcessError::media_open(url, format!("{:#}", e)))?;
        let ytdlp = YtDlp::new(self.settings.youtube.ytdlp_path.clone());
        let duration_seconds = match &self.settings.youtube.api_key {
            Some(key) => {
                let metadata = YoutubeClient::new(key.clone())
                    .metadata(&video)
                    .map_err(|e| ProcessError::media_open(url, format!("{:#}", e)))?;
                log::info!("'{}' ({:.0}s)", metadata.title, metadata.duration_seconds);
                metadata.duration_seconds
            }
            None => ytdlp
                .duration(&video)
                .map_err(|e| ProcessError::media_open(url, format!("{:#}", e)))?,
        };

        let artifact = OutputArtifact::create(self.settings.work_dir.as_deref(), "annotated.mp4")?;
        if !self.needs_segmenting(duration_seconds, None) {
            let downloaded = ytdlp.download(&video, artifact.scratch_dir())?;
            let source = VideoSource::open(&downloaded.to_string_lossy(), None)?;
            let outcome = self.sample_direct(source, artifact.path(), on_progress)?;
            return Ok(self.finish_direct(outcome, artifact));
        }

        let mut provider = YoutubeSegments::new(&ytdlp, video, artifact.scratch_dir());
        let outcome = VideoSegmenter::new(self.settings.segment.max_segment_seconds).run(
            &mut provider,
            duration_seconds,
            &mut *self.detector,
            &self.annotator,
            &self.settings.sampler,
            artifact.path(),
            on_progress,
        )?;
        Ok(self.finish_segmented(outcome, artifact))
    }

    fn needs_segmenting(&self, duration_seconds: f64, size_bytes: Option<u64>) -> bool {
        let too_long = duration_seconds > self.settings.segment.max_segment_seconds as f64;
        let too_big = matches!(
            (size_bytes, self.settings.segment.max_source_bytes),
            (Some(size), Some(max)) if size > max
        );
        too_long || too_big
    }

    fn sample_direct(
        &mut self,
        source: VideoSource,
        output: &Path,
        on_progress: &mut dyn FnMut(SegmentProgress),
    ) -> Result<SampleOutcome, ProcessError> {
        let sink = VideoSink::for_source(output, source.info(), source.is_synthetic())?;
        let mut pass = FrameSampler::new(
            &mut *self.detector,
            &self.annotator,
            self.settings.sampler.clone(),
        )
        .start(source, sink);
        for event in pass.by_ref() {
            on_progress(SegmentProgress {
                segment: 0,
                segments: 1,
                event: event?,
            });
        }
        pass.finish()
    }

    fn finish_direct(&self, outcome: SampleOutcome, artifact: OutputArtifact) -> RunReport {
        let run = InferenceRun::from_frames(
            RunId::generate(),
            RunKind::Video,
            outcome.frame_results,
            Some(artifact.path().to_path_buf()),
        );
        self.finalize(run, outcome.warnings, Some(artifact), outcome.frames_read)
    }

    fn finish_segmented(&self, outcome: SegmentedOutcome, artifact: OutputArtifact) -> RunReport {
        // Dropping an unjoined artifact removes the segment parts with it.
        let artifact = outcome.joined.then_some(artifact);
        let run = InferenceRun::from_frames(
            RunId::generate(),
            RunKind::VideoSegment,
            outcome.frame_results,
            artifact.as_ref().map(|a| a.path().to_path_buf()),
        )
        .with_status(outcome.status);
        self.finalize(run, outcome.warnings, artifact, outcome.frames_read)
    }

    fn finalize(
        &self,
        run: InferenceRun,
        mut warnings: Vec<RunWarning>,
        artifact: Option<OutputArtifact>,
        frames_read: u64,
    ) -> RunReport {
        let stored = match self.store.save_run(&run) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("run {} not stored: {:#}", run.run_id, err);
                warnings.push(RunWarning::PersistenceFailed {
                    reason: format!("{:#}", err),
                });
                false
            }
        };
        if run.status == RunStatus::PartiallyFailed {
            log::warn!("run {} completed with failed segments or no joined output", run.run_id);
        }
        log::info!(
            "run {} ({}): total {} over {} sampled frame(s)",
            run.run_id,
            run.kind.as_str(),
            run.total_count,
            run.frame_results.len()
        );
        RunReport {
            run,
            warnings,
            artifact,
            frames_read,
            stored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::AnnotationStyle;
    use crate::detect::StubBackend;
    use crate::error::DetectError;
    use crate::output::read_manifest;
    use crate::segment::SegmentedOutcome;
    use crate::storage::{FrameRecord, InMemoryResultStore, RunSummary, TimeRange};
    use crate::FrameResult;

    /// Store whose writes always fail.
    struct FailingStore;

    impl ResultStore for FailingStore {
        fn save_run(&self, _run: &InferenceRun) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk full"))
        }

        fn frame_records(&self, _range: Option<TimeRange>) -> anyhow::Result<Vec<FrameRecord>> {
            Ok(Vec::new())
        }

        fn recent_runs(&self, _limit: usize) -> anyhow::Result<Vec<RunSummary>> {
            Ok(Vec::new())
        }
    }

    fn settings(interval: u64, max_segment_seconds: u64, work_dir: &Path) -> ProcessorSettings {
        ProcessorSettings {
            sampler: SamplerConfig::new(NonZeroU64::new(interval).unwrap()),
            segment: SegmentSettings {
                max_segment_seconds,
                max_source_bytes: None,
            },
            youtube: YoutubeSettings {
                api_key: None,
                ytdlp_path: "yt-dlp".into(),
            },
            work_dir: Some(work_dir.to_path_buf()),
        }
    }

    fn processor(detector: StubBackend, store: Arc<dyn ResultStore>, settings: ProcessorSettings) -> Processor {
        Processor::new(
            Box::new(detector),
            store,
            Annotator::new(AnnotationStyle::default()).unwrap(),
            settings,
        )
    }

    #[test]
    fn short_video_is_sampled_directly() {
        let work = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryResultStore::new());
        let mut p = processor(
            StubBackend::repeating("motorcycle", 1),
            store.clone(),
            settings(10, 200, work.path()),
        );
        let mut events = 0;
        let report = p
            .process_video("stub://clip?frames=100&fps=10", &mut |_| events += 1)
            .unwrap();

        assert_eq!(events, 100);
        assert_eq!(report.run.kind, RunKind::Video);
        assert_eq!(report.run.total_count, 10);
        assert!(report.run.is_consistent());
        assert!(report.stored);
        let artifact = report.artifact.as_ref().unwrap();
        assert_eq!(read_manifest(artifact.path()).unwrap().frame_count, Some(100));
        assert_eq!(store.recent_runs(5).unwrap().len(), 1);
    }

    #[test]
    fn long_video_is_segmented_and_partial_failures_are_kept() {
        let work = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryResultStore::new());
        let mut p = processor(
            StubBackend::repeating("motorcycle", 2),
            store,
            settings(5, 20, work.path()),
        );
        // 45s at 2 fps: segments [0,20) [20,40) [40,45); frame 50 sits in the second.
        let report = p
            .process_video("stub://clip?frames=90&fps=2&fail_at=50", &mut |_| {})
            .unwrap();

        assert_eq!(report.run.kind, RunKind::VideoSegment);
        assert_eq!(report.run.status, RunStatus::PartiallyFailed);
        // First segment: 40 frames -> 8 sampled; last: 10 frames -> 2 sampled.
        assert_eq!(report.run.frame_results.len(), 10);
        assert_eq!(report.run.total_count, 20);
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, RunWarning::SegmentFailed { index: 1, .. })));
        let artifact = report.artifact.as_ref().unwrap();
        assert_eq!(read_manifest(artifact.path()).unwrap().frame_count, Some(50));
    }

    #[test]
    fn detector_timeout_is_recovered() {
        let work = tempfile::tempdir().unwrap();
        let detector = StubBackend::repeating("motorcycle", 1)
            .fail_on_call(2, DetectError::Timeout(std::time::Duration::from_secs(1)));
        let mut p = processor(
            detector,
            Arc::new(InMemoryResultStore::new()),
            settings(10, 200, work.path()),
        );
        let report = p
            .process_video("stub://clip?frames=50&fps=10", &mut |_| {})
            .unwrap();
        assert_eq!(report.run.total_count, 4);
        assert_eq!(report.warning_summary(), vec!["1 frame(s) skipped by the detector (1 timed out)"]);
    }

    #[test]
    fn open_errors_name_the_stage() {
        let work = tempfile::tempdir().unwrap();
        let mut p = processor(
            StubBackend::new(),
            Arc::new(InMemoryResultStore::new()),
            settings(10, 200, work.path()),
        );
        let err = p
            .process_video("stub://clip?fps=0", &mut |_| {})
            .unwrap_err();
        assert_eq!(err.stage(), "open");
        assert!(err.to_string().starts_with("open:"));
        let err = p.process_image(&work.path().join("missing.png")).unwrap_err();
        assert!(matches!(err, ProcessError::MediaOpen { .. }));
    }

    #[test]
    fn store_failure_keeps_counts_and_artifact() {
        let work = tempfile::tempdir().unwrap();
        let mut p = processor(
            StubBackend::repeating("motorcycle", 1),
            Arc::new(FailingStore),
            settings(10, 200, work.path()),
        );
        let report = p
            .process_video("stub://clip?frames=100&fps=10", &mut |_| {})
            .unwrap();

        assert!(!report.stored);
        assert_eq!(report.run.total_count, 10);
        assert_eq!(report.run.frame_results.len(), 10);
        assert_eq!(report.frames_read, 100);
        let artifact = report.artifact.as_ref().unwrap();
        assert_eq!(read_manifest(artifact.path()).unwrap().frame_count, Some(100));
        assert!(report.warnings.iter().any(
            |w| matches!(w, RunWarning::PersistenceFailed { reason } if reason.contains("disk full"))
        ));
        assert_eq!(report.warning_summary(), vec!["result not stored: disk full"]);
    }

    #[test]
    fn unjoined_segments_are_stored_without_artifact() {
        let work = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryResultStore::new());
        let p = processor(StubBackend::new(), store.clone(), settings(10, 200, work.path()));
        let artifact = OutputArtifact::create(Some(work.path()), "annotated.mp4").unwrap();
        let scratch = artifact.scratch_dir().to_path_buf();
        let frame_results = vec![FrameResult::now(2), FrameResult::now(1)];
        let outcome = SegmentedOutcome {
            total_count: 3,
            frame_results,
            frames_read: 20,
            segments_completed: 2,
            segments_failed: 0,
            joined: false,
            status: RunStatus::PartiallyFailed,
            warnings: vec![RunWarning::JoinFailed {
                reason: "encode: concat failed".into(),
            }],
        };

        let report = p.finish_segmented(outcome, artifact);

        assert!(report.artifact.is_none());
        assert!(report.run.output_artifact.is_none());
        assert!(!scratch.exists());
        assert!(report.stored);
        assert_eq!(report.run.total_count, 3);
        assert_eq!(report.run.status, RunStatus::PartiallyFailed);
        assert_eq!(store.recent_runs(1).unwrap()[0].total_count, 3);
        assert_eq!(
            report.warning_summary(),
            vec!["annotated segments not joined: encode: concat failed"]
        );
    }

    #[test]
    fn missing_local_file_is_an_open_error() {
        let work = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryResultStore::new());
        let mut p = processor(StubBackend::new(), store, settings(10, 200, work.path()));
        let err = p
            .process_video(&work.path().join("gone.mp4").display().to_string(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.stage(), "open");
    }
}
