//! Local file frame source using FFmpeg.
//!
//! Decodes the best video stream of a container to RGB24, optionally seeking
//! to the start of a time window and stopping at its end.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::file::TimeWindow;
use crate::frame::{MediaInfo, VideoFrame};

pub(crate) struct FfmpegFileSource {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: f64,
    stream_start: f64,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    window: Option<TimeWindow>,
    info: MediaInfo,
    frame_count: u64,
    eof_sent: bool,
    finished: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &str, window: Option<TimeWindow>) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let mut input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open '{}' with ffmpeg", path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let time_base = f64::from(input_stream.time_base());
        let stream_start = match input_stream.start_time() {
            ts if ts == ffmpeg::ffi::AV_NOPTS_VALUE => 0.0,
            ts => ts as f64 * time_base,
        };
        let rate = input_stream.avg_frame_rate();
        let fps = if rate.denominator() == 0 {
            0.0
        } else {
            f64::from(rate)
        };
        let stream_frames = input_stream.frames();
        let stream_duration = input_stream.duration();

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let container_duration = if input.duration() > 0 {
            input.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
        } else if stream_duration > 0 {
            stream_duration as f64 * time_base
        } else {
            0.0
        };

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let (duration_seconds, frame_count) = match window {
            Some(w) => {
                let end = w.end_seconds().min(container_duration);
                let span = (end - w.start_seconds()).max(0.0);
                (span, None)
            }
            None => (
                container_duration,
                (stream_frames > 0).then_some(stream_frames as u64),
            ),
        };

        if let Some(w) = window {
            if w.start_ms > 0 {
                let ts = (w.start_ms as i64) * i64::from(ffmpeg::ffi::AV_TIME_BASE) / 1000;
                input
                    .seek(ts, ..ts)
                    .with_context(|| format!("seek to {:.3}s", w.start_seconds()))?;
            }
        }

        let info = MediaInfo {
            fps,
            width: decoder.width(),
            height: decoder.height(),
            frame_count,
            duration_seconds,
        };

        Ok(Self {
            input,
            stream_index,
            time_base,
            stream_start,
            decoder,
            scaler,
            window,
            info,
            frame_count: 0,
            eof_sent: false,
            finished: false,
        })
    }

    pub(crate) fn info(&self) -> &MediaInfo {
        &self.info
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.finished {
                return Ok(None);
            }

            if self.decoder.receive_frame(&mut decoded).is_ok() {
                if let Some(frame) = self.accept(&decoded)? {
                    return Ok(Some(frame));
                }
                continue;
            }

            if self.eof_sent {
                self.finished = true;
                return Ok(None);
            }

            let mut sent = false;
            while let Some((stream, packet)) = self.input.packets().next() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                sent = true;
                break;
            }
            if !sent {
                self.decoder.send_eof().context("flush ffmpeg decoder")?;
                self.eof_sent = true;
            }
        }
    }

    /// Converts a decoded frame, or returns `None` when it falls before the
    /// window start. Frames at or past the window end finish the stream.
    fn accept(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Option<VideoFrame>> {
        let pts = decoded
            .timestamp()
            .map(|ts| ts as f64 * self.time_base - self.stream_start)
            .unwrap_or(self.frame_count as f64 / self.info.fps);

        let offset = match self.window {
            Some(w) => {
                if pts < w.start_seconds() {
                    return Ok(None);
                }
                if pts >= w.end_seconds() {
                    self.finished = true;
                    return Ok(None);
                }
                w.start_seconds()
            }
            None => 0.0,
        };

        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("decoded frame buffer has unexpected size"))?;

        let index = self.frame_count;
        self.frame_count += 1;
        Ok(Some(VideoFrame::new(image, index, pts - offset)))
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
