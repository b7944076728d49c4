//! YouTube ingestion.
//!
//! Metadata comes from the YouTube Data API when a key is configured, and
//! from `yt-dlp --print duration` otherwise. Media is always fetched with the
//! external `yt-dlp` executable into a caller-owned directory, either whole or
//! one time section at a time.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use url::Url;

use super::file::TimeWindow;
use crate::error::ProcessError;

const DATA_API_URL: &str = "https://www.googleapis.com/youtube/v3/videos";
const VIDEO_FORMAT: &str = "mp4/bestvideo[ext=mp4]/best";

/// A validated YouTube video reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct YoutubeUrl {
    pub video_id: String,
}

impl YoutubeUrl {
    /// Accepts `watch?v=`, `youtu.be/`, `shorts/` and `embed/` links.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim()).with_context(|| format!("'{}' is not a URL", raw))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("URL has no host"))?
            .trim_start_matches("www.")
            .trim_start_matches("m.");

        let candidate = match host {
            "youtu.be" => url
                .path_segments()
                .and_then(|mut segments| segments.next())
                .map(str::to_string),
            "youtube.com" | "music.youtube.com" => {
                let mut segments = url.path_segments().into_iter().flatten();
                match segments.next() {
                    Some("watch") => url
                        .query_pairs()
                        .find(|(k, _)| k == "v")
                        .map(|(_, v)| v.into_owned()),
                    Some("shorts") | Some("embed") | Some("live") => {
                        segments.next().map(str::to_string)
                    }
                    _ => None,
                }
            }
            other => return Err(anyhow!("'{}' is not a YouTube host", other)),
        };

        let video_id = candidate.ok_or_else(|| anyhow!("URL does not contain a video id"))?;
        if !is_video_id(&video_id) {
            return Err(anyhow!("'{}' is not a valid video id", video_id));
        }
        Ok(Self { video_id })
    }

    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.video_id)
    }
}

fn is_video_id(id: &str) -> bool {
    id.len() == 11
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Clone, Debug, PartialEq)]
pub struct VideoMetadata {
    pub video_id: String,
    pub title: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    snippet: Snippet,
    #[serde(rename = "contentDetails")]
    content_details: ContentDetails,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ContentDetails {
    duration: String,
}

/// YouTube Data API v3 client.
pub struct YoutubeClient {
    agent: ureq::Agent,
    api_key: String,
}

impl YoutubeClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(15))
                .build(),
            api_key: api_key.into(),
        }
    }

    pub fn metadata(&self, video: &YoutubeUrl) -> Result<VideoMetadata> {
        let response: VideoListResponse = self
            .agent
            .get(DATA_API_URL)
            .query("part", "snippet,contentDetails")
            .query("id", &video.video_id)
            .query("key", &self.api_key)
            .call()
            .context("YouTube Data API request failed")?
            .into_json()
            .context("invalid YouTube Data API response")?;
        let item = response
            .items
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("video {} was not found", video.video_id))?;
        let duration_seconds = parse_iso8601_duration(&item.content_details.duration)
            .ok_or_else(|| anyhow!("unparseable duration '{}'", item.content_details.duration))?;
        Ok(VideoMetadata {
            video_id: video.video_id.clone(),
            title: item.snippet.title,
            duration_seconds,
        })
    }
}

/// Parses ISO-8601 durations of the form `P[nD]T[nH][nM][n[.n]S]`.
pub fn parse_iso8601_duration(value: &str) -> Option<f64> {
    let rest = value.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    if date_part.is_empty() && time_part.map_or(true, str::is_empty) {
        return None;
    }

    let mut total = 0.0;
    for (amount, unit) in duration_fields(date_part)? {
        total += amount
            * match unit {
                'W' => 7.0 * 86_400.0,
                'D' => 86_400.0,
                _ => return None,
            };
    }
    if let Some(time_part) = time_part {
        for (amount, unit) in duration_fields(time_part)? {
            total += amount
                * match unit {
                    'H' => 3_600.0,
                    'M' => 60.0,
                    'S' => 1.0,
                    _ => return None,
                };
        }
    }
    Some(total)
}

fn duration_fields(part: &str) -> Option<Vec<(f64, char)>> {
    let mut fields = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else {
            let amount: f64 = number.parse().ok()?;
            fields.push((amount, c));
            number.clear();
        }
    }
    if number.is_empty() {
        Some(fields)
    } else {
        None
    }
}

/// Wrapper around the `yt-dlp` executable.
pub struct YtDlp {
    program: String,
}

impl YtDlp {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Duration reported by yt-dlp without downloading.
    pub fn duration(&self, video: &YoutubeUrl) -> Result<f64> {
        let output = Command::new(&self.program)
            .args(["--no-playlist", "--skip-download", "--print", "duration"])
            .arg(video.watch_url())
            .output()
            .with_context(|| format!("failed to run {}", self.program))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse::<f64>()
            .with_context(|| format!("unexpected duration output '{}'", text.trim()))
    }

    /// Download the whole video to `dest_dir/source.mp4`.
    pub fn download(&self, video: &YoutubeUrl, dest_dir: &Path) -> Result<PathBuf, ProcessError> {
        let target = dest_dir.join("source.mp4");
        self.run_download(video, &target, None)
            .map_err(|e| ProcessError::media_open(video.watch_url(), format!("{:#}", e)))?;
        Ok(target)
    }

    /// Download one time section to `dest_dir/segment_NNN.mp4`.
    pub fn download_section(
        &self,
        video: &YoutubeUrl,
        window: TimeWindow,
        index: usize,
        dest_dir: &Path,
    ) -> Result<PathBuf, ProcessError> {
        let target = dest_dir.join(format!("segment_{:03}.mp4", index));
        self.run_download(video, &target, Some(window))
            .map_err(|e| ProcessError::SegmentDownload {
                index,
                reason: format!("{:#}", e),
            })?;
        Ok(target)
    }

    fn run_download(&self, video: &YoutubeUrl, target: &Path, window: Option<TimeWindow>) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--no-playlist", "--quiet", "--no-progress", "-f", VIDEO_FORMAT])
            .arg("-o")
            .arg(target);
        if let Some(window) = window {
            cmd.arg("--download-sections")
                .arg(section_spec(window))
                .arg("--force-keyframes-at-cuts");
        }
        cmd.arg(video.watch_url());

        log::info!("downloading {} -> {}", video.watch_url(), target.display());
        let output = cmd
            .output()
            .with_context(|| format!("failed to run {}", self.program))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        if !target.exists() {
            return Err(anyhow!("{} did not produce {}", self.program, target.display()));
        }
        Ok(())
    }
}

fn section_spec(window: TimeWindow) -> String {
    format!("*{:.3}-{:.3}", window.start_seconds(), window.end_seconds())
}
