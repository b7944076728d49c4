//! FFmpeg mp4 encoding and stream-copy concatenation.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::util::format::pixel::Pixel;
use ffmpeg::Rational;
use image::RgbImage;

use crate::frame::MediaInfo;

pub(crate) struct FfmpegEncoder {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::codec::encoder::video::Encoder,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    source_width: u32,
    source_height: u32,
    next_pts: i64,
}

impl FfmpegEncoder {
    pub(crate) fn open(path: &Path, info: &MediaInfo) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let mut output = ffmpeg::format::output(&path)
            .with_context(|| format!("create output {}", path.display()))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::H264)
            .or_else(|| ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4))
            .ok_or_else(|| anyhow!("no H.264 or MPEG-4 encoder available"))?;

        // yuv420p needs even dimensions.
        let width = (info.width & !1).max(2);
        let height = (info.height & !1).max(2);
        let frame_rate = Rational::from(info.fps);
        let encoder_time_base = frame_rate.invert();

        let mut stream = output.add_stream(codec).context("add video stream")?;
        let stream_index = stream.index();

        let mut video = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create video encoder")?;
        video.set_width(width);
        video.set_height(height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(encoder_time_base);
        video.set_frame_rate(Some(frame_rate));
        if global_header {
            video.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = video.open_as(codec).context("open video encoder")?;
        stream.set_parameters(&encoder);
        stream.set_time_base(encoder_time_base);

        output.write_header().context("write container header")?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow!("output stream disappeared"))?;

        let scaler = ffmpeg::software::scaling::Context::get(
            Pixel::RGB24,
            info.width,
            info.height,
            Pixel::YUV420P,
            width,
            height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base,
            stream_time_base,
            source_width: info.width,
            source_height: info.height,
            next_pts: 0,
        })
    }

    pub(crate) fn write(&mut self, image: &RgbImage) -> Result<()> {
        if image.dimensions() != (self.source_width, self.source_height) {
            return Err(anyhow!(
                "frame is {}x{}, stream is {}x{}",
                image.width(),
                image.height(),
                self.source_width,
                self.source_height
            ));
        }
        let mut rgb = ffmpeg::frame::Video::new(Pixel::RGB24, image.width(), image.height());
        let row_bytes = image.width() as usize * 3;
        let stride = rgb.stride(0);
        let data = rgb.data_mut(0);
        for (row, chunk) in image.as_raw().chunks_exact(row_bytes).enumerate() {
            data[row * stride..row * stride + row_bytes].copy_from_slice(chunk);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler.run(&rgb, &mut yuv).context("convert frame to yuv420p")?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder.send_frame(&yuv).context("send frame to encoder")?;
        self.drain()
    }

    pub(crate) fn finish(&mut self) -> Result<()> {
        self.encoder.send_eof().context("flush encoder")?;
        self.drain()?;
        self.output.write_trailer().context("write container trailer")?;
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .context("write packet")?;
        }
        Ok(())
    }
}

/// Stream-copies the video track of each part into `out`, shifting
/// timestamps so the parts play back to back.
pub(crate) fn concat(parts: &[PathBuf], out: &Path) -> Result<()> {
    ffmpeg::init().context("initialize ffmpeg")?;
    let first = parts.first().ok_or_else(|| anyhow!("no parts"))?;

    let mut output = ffmpeg::format::output(&out)
        .with_context(|| format!("create output {}", out.display()))?;
    {
        let input = ffmpeg::format::input(first)
            .with_context(|| format!("open {}", first.display()))?;
        let ist = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", first.display()))?;
        let mut ost = output
            .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
            .context("add output stream")?;
        ost.set_parameters(ist.parameters());
        ost.set_time_base(ist.time_base());
    }
    output.write_header().context("write container header")?;
    let out_time_base = output
        .stream(0)
        .map(|s| s.time_base())
        .ok_or_else(|| anyhow!("output stream disappeared"))?;

    let mut offset = 0i64;
    for part in parts {
        let mut input = ffmpeg::format::input(part)
            .with_context(|| format!("open {}", part.display()))?;
        let (index, in_time_base) = {
            let ist = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| anyhow!("{} has no video track", part.display()))?;
            (ist.index(), ist.time_base())
        };

        let mut part_end = offset;
        for (stream, mut packet) in input.packets() {
            if stream.index() != index {
                continue;
            }
            packet.rescale_ts(in_time_base, out_time_base);
            let pts = packet.pts().map(|p| p + offset);
            let dts = packet.dts().map(|d| d + offset);
            packet.set_pts(pts);
            packet.set_dts(dts);
            packet.set_position(-1);
            packet.set_stream(0);
            if let Some(pts) = pts {
                part_end = part_end.max(pts + packet.duration().max(1));
            }
            packet
                .write_interleaved(&mut output)
                .with_context(|| format!("copy packet from {}", part.display()))?;
        }
        offset = part_end;
    }

    output.write_trailer().context("write container trailer")?;
    Ok(())
}
