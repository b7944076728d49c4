//! Frame annotation: detection boxes on sampled frames and a running-total
//! caption on every frame.
//!
//! Text uses the bundled DejaVu Sans Mono unless `font_path` points at
//! another TrueType/OpenType file.

use std::path::PathBuf;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::error::StartupError;
use crate::DEFAULT_APP_NAME;

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BANNER_COLOR: Rgb<u8> = Rgb([20, 20, 20]);
const BUNDLED_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

#[derive(Clone, Debug, PartialEq)]
pub struct AnnotationStyle {
    /// Shown in the caption banner of every frame.
    pub app_name: String,
    /// Overrides the bundled font.
    pub font_path: Option<PathBuf>,
    pub box_color: [u8; 3],
    pub thickness: u32,
    /// Text height in pixels.
    pub font_scale: f32,
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            font_path: None,
            box_color: [0, 255, 0],
            thickness: 2,
            font_scale: 20.0,
        }
    }
}

pub struct Annotator {
    style: AnnotationStyle,
    font: FontArc,
}

impl Annotator {
    pub fn new(style: AnnotationStyle) -> Result<Self, StartupError> {
        let font = match &style.font_path {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    StartupError::Config(format!("cannot read font {}: {}", path.display(), e))
                })?;
                FontArc::try_from_vec(bytes).map_err(|_| {
                    StartupError::Config(format!("{} is not a usable font", path.display()))
                })?
            }
            None => FontArc::try_from_slice(BUNDLED_FONT)
                .map_err(|_| StartupError::Config("bundled font is unreadable".into()))?,
        };
        Ok(Self { style, font })
    }

    /// Caption first, then boxes, so the banner never hides a detection.
    pub fn annotate(&self, image: &mut RgbImage, detections: &[Detection], running_total: u64) {
        self.draw_caption(image, running_total);
        self.draw_detections(image, detections);
    }

    pub fn caption(&self, running_total: u64) -> String {
        format!("{} | total: {}", self.style.app_name, running_total)
    }

    /// Draw a box and a `label 0.87` tag for each detection.
    pub fn draw_detections(&self, image: &mut RgbImage, detections: &[Detection]) {
        let color = Rgb(self.style.box_color);
        let (width, height) = image.dimensions();
        for detection in detections {
            let bbox = detection.bbox.clamp_to(width, height);
            let x = bbox.xmin.floor() as i32;
            let y = bbox.ymin.floor() as i32;
            let w = bbox.width().round() as u32;
            let h = bbox.height().round() as u32;

            for t in 0..self.style.thickness {
                let inner_w = w.saturating_sub(2 * t);
                let inner_h = h.saturating_sub(2 * t);
                if inner_w == 0 || inner_h == 0 {
                    break;
                }
                let rect = Rect::at(x + t as i32, y + t as i32).of_size(inner_w, inner_h);
                draw_hollow_rect_mut(image, rect, color);
            }

            let text = format!("{} {:.2}", detection.label, detection.confidence);
            let scale = self.style.font_scale * 0.75;
            let text_y = if y as f32 >= scale { y - scale as i32 } else { y + h as i32 };
            draw_text_mut(image, color, x, text_y, PxScale::from(scale), &self.font, &text);
        }
    }

    /// Banner across the top of the frame with the application name and
    /// the running total.
    pub fn draw_caption(&self, image: &mut RgbImage, running_total: u64) {
        let (width, height) = image.dimensions();
        let banner_height = ((self.style.font_scale * 1.4).ceil() as u32).clamp(1, height);
        draw_filled_rect_mut(
            image,
            Rect::at(0, 0).of_size(width, banner_height),
            BANNER_COLOR,
        );
        let pad = ((banner_height as f32 - self.style.font_scale) / 2.0).max(0.0) as i32;
        draw_text_mut(
            image,
            TEXT_COLOR,
            pad + 2,
            pad,
            PxScale::from(self.style.font_scale),
            &self.font,
            &self.caption(running_total),
        );
    }
}
