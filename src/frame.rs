//! Decoded frames and stream metadata.

use image::RgbImage;
use serde::Serialize;

/// One decoded RGB frame.
pub struct VideoFrame {
    pub image: RgbImage,
    /// Position in the stream being read, starting at 0.
    pub index: u64,
    /// Presentation time relative to the start of the stream being read.
    pub pts_seconds: f64,
}

impl VideoFrame {
    pub fn new(image: RgbImage, index: u64, pts_seconds: f64) -> Self {
        Self {
            image,
            index,
            pts_seconds,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Stream properties reported by a source.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MediaInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Container estimate; only used for progress reporting.
    pub frame_count: Option<u64>,
    pub duration_seconds: f64,
}

impl MediaInfo {
    /// Expected number of frames, from the container or from duration * fps.
    pub fn expected_frames(&self) -> Option<u64> {
        match self.frame_count {
            Some(n) if n > 0 => Some(n),
            _ => {
                let estimate = (self.duration_seconds * self.fps).round();
                if estimate.is_finite() && estimate > 0.0 {
                    Some(estimate as u64)
                } else {
                    None
                }
            }
        }
    }

    pub fn has_valid_rate(&self) -> bool {
        self.fps.is_finite() && self.fps > 0.0
    }
}
