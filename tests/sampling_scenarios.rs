use std::num::NonZeroU64;
use std::sync::Arc;

use moto_counter::error::DetectError;
use moto_counter::ingest::{FrameSource, VideoSource};
use moto_counter::output::{read_manifest, VideoSink};
use moto_counter::pipeline::{Processor, ProcessorSettings};
use moto_counter::storage::{InMemoryResultStore, ResultStore};
use moto_counter::config::{SegmentSettings, YoutubeSettings};
use moto_counter::{
    AnnotationStyle, Annotator, FrameSampler, RunKind, RunStatus, RunWarning, SamplerConfig,
    StubBackend,
};

fn sampler_config(interval: u64) -> SamplerConfig {
    SamplerConfig::new(NonZeroU64::new(interval).unwrap())
}

fn annotator() -> Annotator {
    Annotator::new(AnnotationStyle::default()).unwrap()
}

#[test]
fn hundred_frames_every_tenth_sampled() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("annotated.mp4");
    let source = VideoSource::open("stub://clip?frames=100&fps=10", None).unwrap();
    let sink = VideoSink::manifest(&out, source.info()).unwrap();
    let mut detector = StubBackend::repeating("motorcycle", 1);
    let annotator = annotator();

    let outcome = FrameSampler::new(&mut detector, &annotator, sampler_config(10))
        .run(source, sink)
        .unwrap();

    assert_eq!(outcome.total_count, 10);
    assert_eq!(outcome.frame_results.len(), 10);
    assert_eq!(outcome.frames_read, 100);
    assert!(outcome.warnings.is_empty());
    assert_eq!(read_manifest(&out).unwrap().frame_count, Some(100));
}

#[test]
fn detector_failure_on_frame_thirty_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("annotated.mp4");
    let source = VideoSource::open("stub://clip?frames=100&fps=10", None).unwrap();
    let sink = VideoSink::manifest(&out, source.info()).unwrap();
    // Frame 30 is the fourth detector call with N = 10.
    let mut detector = StubBackend::repeating("motorcycle", 1)
        .fail_on_call(3, DetectError::Failed("model crashed".into()));
    let annotator = annotator();

    let outcome = FrameSampler::new(&mut detector, &annotator, sampler_config(10))
        .run(source, sink)
        .unwrap();

    assert_eq!(outcome.total_count, 9);
    assert_eq!(
        outcome.frame_results.iter().map(|r| u64::from(r.count)).sum::<u64>(),
        outcome.total_count
    );
    assert_eq!(outcome.warnings.len(), 1);
    match &outcome.warnings[0] {
        RunWarning::DetectorSkipped {
            frame_index,
            timed_out,
            ..
        } => {
            assert_eq!(*frame_index, 30);
            assert!(!timed_out);
        }
        other => panic!("unexpected warning {:?}", other),
    }
    assert_eq!(read_manifest(&out).unwrap().frame_count, Some(100));
}

#[test]
fn detector_calls_are_ceil_of_frames_over_interval() {
    let annotator = annotator();
    let dir = tempfile::tempdir().unwrap();
    for frames in [1u64, 9, 10, 11, 37, 103] {
        for interval in [1u64, 2, 9, 10, 103] {
            let uri = format!("stub://clip?frames={}&fps=25&width=8&height=8", frames);
            let source = VideoSource::open(&uri, None).unwrap();
            let sink = VideoSink::manifest(&dir.path().join("out.mp4"), source.info()).unwrap();
            let mut detector = StubBackend::new();
            FrameSampler::new(&mut detector, &annotator, sampler_config(interval))
                .run(source, sink)
                .unwrap();
            assert_eq!(
                detector.calls(),
                frames.div_ceil(interval),
                "F={} N={}",
                frames,
                interval
            );
        }
    }
}

#[test]
fn segmented_run_covers_every_frame_once() {
    let work = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryResultStore::new());
    let settings = ProcessorSettings {
        sampler: sampler_config(10),
        segment: SegmentSettings {
            max_segment_seconds: 200,
            max_source_bytes: None,
        },
        youtube: YoutubeSettings {
            api_key: None,
            ytdlp_path: "yt-dlp".into(),
        },
        work_dir: Some(work.path().to_path_buf()),
    };
    let mut processor = Processor::new(
        Box::new(StubBackend::repeating("motorcycle", 1)),
        store.clone(),
        annotator(),
        settings,
    );

    // 450 s at 1 fps: segments of 200, 200 and 50 frames.
    let mut segments_seen = Vec::new();
    let report = processor
        .process_video("stub://long?frames=450&fps=1&width=8&height=8", &mut |p| {
            if segments_seen.last() != Some(&p.segment) {
                segments_seen.push(p.segment);
            }
        })
        .unwrap();

    assert_eq!(segments_seen, vec![0, 1, 2]);
    assert_eq!(report.run.kind, RunKind::VideoSegment);
    assert_eq!(report.run.status, RunStatus::Complete);
    assert_eq!(report.frames_read, 450);
    assert_eq!(report.run.frame_results.len(), 20 + 20 + 5);
    assert_eq!(report.run.total_count, 45);
    let artifact = report.artifact.as_ref().unwrap();
    assert_eq!(read_manifest(artifact.path()).unwrap().frame_count, Some(450));

    let stored = store.recent_runs(1).unwrap();
    assert_eq!(stored[0].total_count, 45);
}

#[test]
fn artifact_is_removed_when_report_is_dropped() {
    let work = tempfile::tempdir().unwrap();
    let settings = ProcessorSettings {
        sampler: sampler_config(5),
        segment: SegmentSettings {
            max_segment_seconds: 200,
            max_source_bytes: None,
        },
        youtube: YoutubeSettings {
            api_key: None,
            ytdlp_path: "yt-dlp".into(),
        },
        work_dir: Some(work.path().to_path_buf()),
    };
    let mut processor = Processor::new(
        Box::new(StubBackend::new()),
        Arc::new(InMemoryResultStore::new()),
        annotator(),
        settings,
    );
    let report = processor
        .process_video("stub://clip?frames=20&fps=10", &mut |_| {})
        .unwrap();
    let path = report.artifact.as_ref().unwrap().path().to_path_buf();
    assert!(path.exists());
    drop(report);
    assert!(!path.exists());
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);

    // Failed runs leave nothing behind either.
    assert!(processor
        .process_video("stub://clip?frames=20&fps=10&fail_at=3", &mut |_| {})
        .is_err());
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}
