//! Annotated video output.
//!
//! `VideoSink` writes frames either through an FFmpeg mp4 encoder (feature
//! `media-ffmpeg`) or, for synthetic `stub://` sources, into a small text
//! manifest that records the stream geometry and the number of frames
//! written. `OutputArtifact` owns the run's scratch directory and removes it
//! on drop unless the caller copied the result out first.

#[cfg(feature = "media-ffmpeg")]
mod ffmpeg;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use image::RgbImage;
use tempfile::TempDir;

use crate::error::ProcessError;
use crate::frame::MediaInfo;

const MANIFEST_HEADER: &str = "# moto-counter synthetic video";

/// Ordered frame writer.
pub trait FrameSink {
    fn write_frame(&mut self, image: &RgbImage) -> Result<(), ProcessError>;

    fn frames_written(&self) -> u64;

    /// Flush and close the output. Further writes are an error.
    fn finish(&mut self) -> Result<(), ProcessError>;
}

impl<K: FrameSink + ?Sized> FrameSink for &mut K {
    fn write_frame(&mut self, image: &RgbImage) -> Result<(), ProcessError> {
        (**self).write_frame(image)
    }

    fn frames_written(&self) -> u64 {
        (**self).frames_written()
    }

    fn finish(&mut self) -> Result<(), ProcessError> {
        (**self).finish()
    }
}

pub struct VideoSink {
    path: PathBuf,
    frames: u64,
    finished: bool,
    backend: SinkBackend,
}

enum SinkBackend {
    Manifest(MediaInfo),
    #[cfg(feature = "media-ffmpeg")]
    Ffmpeg(ffmpeg::FfmpegEncoder),
}

impl VideoSink {
    /// mp4 encoder for `path` matching the source geometry and rate.
    pub fn create(path: &Path, info: &MediaInfo) -> Result<Self, ProcessError> {
        #[cfg(feature = "media-ffmpeg")]
        {
            let encoder = ffmpeg::FfmpegEncoder::open(path, info)
                .map_err(|e| ProcessError::Encode(format!("{}: {:#}", path.display(), e)))?;
            Ok(Self::with_backend(path, SinkBackend::Ffmpeg(encoder)))
        }
        #[cfg(not(feature = "media-ffmpeg"))]
        {
            let _ = info;
            Err(ProcessError::Encode(format!(
                "{}: video encoding requires the media-ffmpeg feature",
                path.display()
            )))
        }
    }

    /// Manifest sink used for synthetic sources.
    pub fn manifest(path: &Path, info: &MediaInfo) -> Result<Self, ProcessError> {
        fs::File::create(path)?;
        Ok(Self::with_backend(path, SinkBackend::Manifest(info.clone())))
    }

    /// Picks the manifest sink for synthetic sources and the encoder otherwise.
    pub fn for_source(path: &Path, info: &MediaInfo, synthetic: bool) -> Result<Self, ProcessError> {
        if synthetic {
            Self::manifest(path, info)
        } else {
            Self::create(path, info)
        }
    }

    fn with_backend(path: &Path, backend: SinkBackend) -> Self {
        Self {
            path: path.to_path_buf(),
            frames: 0,
            finished: false,
            backend,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSink for VideoSink {
    fn write_frame(&mut self, image: &RgbImage) -> Result<(), ProcessError> {
        if self.finished {
            return Err(ProcessError::Encode(format!(
                "{}: write after finish",
                self.path.display()
            )));
        }
        match &mut self.backend {
            SinkBackend::Manifest(info) => {
                if image.dimensions() != (info.width, info.height) {
                    return Err(ProcessError::Encode(format!(
                        "frame is {}x{}, stream is {}x{}",
                        image.width(),
                        image.height(),
                        info.width,
                        info.height
                    )));
                }
            }
            #[cfg(feature = "media-ffmpeg")]
            SinkBackend::Ffmpeg(encoder) => encoder
                .write(image)
                .map_err(|e| ProcessError::Encode(format!("{:#}", e)))?,
        }
        self.frames += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finish(&mut self) -> Result<(), ProcessError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        match &mut self.backend {
            SinkBackend::Manifest(info) => write_manifest(&self.path, info, self.frames),
            #[cfg(feature = "media-ffmpeg")]
            SinkBackend::Ffmpeg(encoder) => encoder
                .finish()
                .map_err(|e| ProcessError::Encode(format!("{:#}", e))),
        }
    }
}

fn write_manifest(path: &Path, info: &MediaInfo, frames: u64) -> Result<(), ProcessError> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "{}", MANIFEST_HEADER)?;
    writeln!(file, "width={}", info.width)?;
    writeln!(file, "height={}", info.height)?;
    writeln!(file, "fps={}", info.fps)?;
    writeln!(file, "frames={}", frames)?;
    Ok(())
}

/// Reads a manifest written by a synthetic sink.
pub fn read_manifest(path: &Path) -> Result<MediaInfo, ProcessError> {
    let raw = fs::read_to_string(path)?;
    let mut lines = raw.lines();
    if lines.next() != Some(MANIFEST_HEADER) {
        return Err(ProcessError::invalid_media(
            path.display().to_string(),
            "not a synthetic video manifest",
        ));
    }
    let mut info = MediaInfo {
        fps: 0.0,
        width: 0,
        height: 0,
        frame_count: Some(0),
        duration_seconds: 0.0,
    };
    for line in lines {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let bad = || ProcessError::invalid_media(path.display().to_string(), format!("bad {}", key));
        match key {
            "width" => info.width = value.parse().map_err(|_| bad())?,
            "height" => info.height = value.parse().map_err(|_| bad())?,
            "fps" => info.fps = value.parse().map_err(|_| bad())?,
            "frames" => info.frame_count = Some(value.parse().map_err(|_| bad())?),
            _ => {}
        }
    }
    if info.has_valid_rate() {
        info.duration_seconds = info.frame_count.unwrap_or(0) as f64 / info.fps;
    }
    Ok(info)
}

fn is_manifest(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|raw| raw.starts_with(MANIFEST_HEADER))
        .unwrap_or(false)
}

/// Joins segment outputs, in order, into `out`.
pub fn concat_outputs(parts: &[PathBuf], out: &Path) -> Result<(), ProcessError> {
    if parts.is_empty() {
        return Err(ProcessError::Encode("no segment outputs to join".into()));
    }
    if parts.iter().all(|p| is_manifest(p)) {
        let mut frames = 0u64;
        let mut first: Option<MediaInfo> = None;
        for part in parts {
            let info = read_manifest(part)?;
            frames += info.frame_count.unwrap_or(0);
            first.get_or_insert(info);
        }
        let info = first.ok_or_else(|| ProcessError::Encode("no segment outputs to join".into()))?;
        return write_manifest(out, &info, frames);
    }

    #[cfg(feature = "media-ffmpeg")]
    {
        ffmpeg::concat(parts, out).map_err(|e| ProcessError::Encode(format!("concat: {:#}", e)))
    }
    #[cfg(not(feature = "media-ffmpeg"))]
    {
        Err(ProcessError::Encode(
            "joining encoded segments requires the media-ffmpeg feature".into(),
        ))
    }
}

/// Scratch directory of one run plus the path of its annotated output.
///
/// Dropping the artifact deletes the directory and everything in it.
pub struct OutputArtifact {
    dir: TempDir,
    path: PathBuf,
}

impl OutputArtifact {
    /// Creates a fresh `moto-run-*` directory under `work_dir` (or the
    /// system temp dir) with the output named `file_name` inside it.
    pub fn create(work_dir: Option<&Path>, file_name: &str) -> Result<Self, ProcessError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("moto-run-");
        let dir = match work_dir {
            Some(parent) => fs::create_dir_all(parent)
                .and_then(|_| builder.tempdir_in(parent))
                .map_err(|e| ProcessError::Scratch(format!("{}: {}", parent.display(), e)))?,
            None => builder
                .tempdir()
                .map_err(|e| ProcessError::Scratch(format!("system temp dir: {}", e)))?,
        };
        let path = dir.path().join(file_name);
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory for intermediate files of the same run.
    pub fn scratch_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Copies the output to `dest`; the scratch directory is still removed
    /// when the artifact is dropped.
    pub fn persist_to(&self, dest: &Path) -> Result<u64, ProcessError> {
        let copy = || {
            if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&self.path, dest)
        };
        copy().map_err(|e| ProcessError::Scratch(format!("copy to {}: {}", dest.display(), e)))
    }
}

impl std::fmt::Debug for OutputArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputArtifact")
            .field("path", &self.path)
            .finish()
    }
}
