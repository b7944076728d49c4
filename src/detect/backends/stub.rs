use std::collections::HashMap;

use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::error::DetectError;

/// Scripted backend for tests and offline runs.
///
/// Every call returns the same detections unless a failure was scheduled for
/// that call number (0-based).
#[derive(Default)]
pub struct StubBackend {
    detections: Vec<Detection>,
    repeating: Option<(String, u32)>,
    failures: HashMap<u64, DetectError>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `detections` on every call.
    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            ..Self::default()
        }
    }

    /// Returns `count` boxes labelled `label`, laid out across the frame.
    pub fn repeating(label: &str, count: u32) -> Self {
        Self {
            repeating: Some((label.to_string(), count)),
            ..Self::default()
        }
    }

    /// Fail call number `call` with `error`.
    pub fn fail_on_call(mut self, call: u64, error: DetectError) -> Self {
        self.failures.insert(call, error);
        self
    }

    /// Number of `detect` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectError> {
        let call = self.calls;
        self.calls += 1;

        if let Some(err) = self.failures.get(&call) {
            return Err(err.clone());
        }

        if let Some((label, count)) = &self.repeating {
            return Ok(layout_boxes(label, *count, image.width(), image.height()));
        }

        Ok(self.detections.clone())
    }
}

fn layout_boxes(label: &str, count: u32, width: u32, height: u32) -> Vec<Detection> {
    if count == 0 {
        return Vec::new();
    }
    let cell = width as f32 / count as f32;
    (0..count)
        .map(|i| {
            let x = i as f32 * cell;
            Detection::new(
                label,
                0.9,
                BoundingBox::from_corners(
                    x + cell * 0.1,
                    height as f32 * 0.25,
                    x + cell * 0.9,
                    height as f32 * 0.75,
                ),
            )
        })
        .collect()
}
