#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::error::DetectError;

const IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for local YOLO weights exported to ONNX.
///
/// Expects the single-output layout `[1, 4 + classes, anchors]` with boxes as
/// centre/size in model input pixels. Frames are resized to the square model
/// input and boxes are scaled back to frame pixels.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    labels: Vec<String>,
    confidence_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, labels: Vec<String>) -> Result<Self> {
        let model_path = model_path.as_ref();
        if labels.is_empty() {
            return Err(anyhow!("label list must not be empty"));
        }
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            labels,
            confidence_threshold: 0.25,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let size = self.input_size;
        let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
        let size = size as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, frame_w: u32, frame_h: u32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }
        let classes = shape[1] - 4;
        let anchors = shape[2];
        let sx = frame_w as f32 / self.input_size as f32;
        let sy = frame_h as f32 / self.input_size as f32;

        let mut candidates = Vec::new();
        for j in 0..anchors {
            let (class, score) = (0..classes)
                .map(|c| (c, view[[0, 4 + c, j]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if score < self.confidence_threshold {
                continue;
            }
            let bbox = BoundingBox::from_center(
                view[[0, 0, j]] * sx,
                view[[0, 1, j]] * sy,
                view[[0, 2, j]] * sx,
                view[[0, 3, j]] * sy,
            );
            let label = self
                .labels
                .get(class)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", class));
            candidates.push(Detection::new(label, score, bbox));
        }

        Ok(non_max_suppression(candidates, IOU_THRESHOLD))
    }
}

/// Greedy per-label NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let overlaps = kept.iter().any(|k| {
            k.label == candidate.label && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectError> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectError::Failed(format!("ONNX inference failed: {:#}", e)))?;
        self.decode(outputs, image.width(), image.height())
            .map_err(|e| DetectError::Failed(format!("{:#}", e)))
    }
}
