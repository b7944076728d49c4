use serde::{Deserialize, Serialize};

/// Axis-aligned box in absolute pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    /// Builds a box from two corners, in any order.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            xmin: x1.min(x2),
            ymin: y1.min(y2),
            xmax: x1.max(x2),
            ymax: y1.max(y2),
        }
    }

    /// Builds a box from its centre and size.
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        let half_w = width.abs() / 2.0;
        let half_h = height.abs() / 2.0;
        Self {
            xmin: cx - half_w,
            ymin: cy - half_h,
            xmax: cx + half_w,
            ymax: cy + half_h,
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.xmax.min(other.xmax) - self.xmin.max(other.xmin)).max(0.0);
        let iy = (self.ymax.min(other.ymax) - self.ymin.max(other.ymin)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamps the box into a `width` x `height` image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        Self {
            xmin: self.xmin.clamp(0.0, max_x),
            ymin: self.ymin.clamp(0.0, max_y),
            xmax: self.xmax.clamp(0.0, max_x),
            ymax: self.ymax.clamp(0.0, max_y),
        }
    }
}

/// A single detected object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// In [0, 1].
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence: clamp_confidence(confidence),
            bbox,
        }
    }

    pub fn is_label(&self, label: &str) -> bool {
        self.label.eq_ignore_ascii_case(label)
    }
}

/// Wire shapes returned by detector services.
///
/// Some models answer with corner coordinates keyed by `name`, others with a
/// centre point plus size keyed by `class`. Both become a `Detection`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum RawPrediction {
    Corners {
        #[serde(alias = "class")]
        name: String,
        confidence: f32,
        xmin: f32,
        ymin: f32,
        xmax: f32,
        ymax: f32,
    },
    Center {
        #[serde(alias = "name")]
        class: String,
        confidence: f32,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
}

impl RawPrediction {
    pub fn normalize(self) -> Detection {
        match self {
            RawPrediction::Corners {
                name,
                confidence,
                xmin,
                ymin,
                xmax,
                ymax,
            } => Detection::new(
                name,
                confidence,
                BoundingBox::from_corners(xmin, ymin, xmax, ymax),
            ),
            RawPrediction::Center {
                class,
                confidence,
                x,
                y,
                width,
                height,
            } => Detection::new(
                class,
                confidence,
                BoundingBox::from_center(x, y, width, height),
            ),
        }
    }
}

impl From<RawPrediction> for Detection {
    fn from(raw: RawPrediction) -> Self {
        raw.normalize()
    }
}

fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corner_and_center_shapes_normalize_to_same_box() {
        let corners: RawPrediction = serde_json::from_str(
            r#"{"name":"motorcycle","confidence":0.91,"xmin":10,"ymin":20,"xmax":50,"ymax":80}"#,
        )
        .unwrap();
        let center: RawPrediction = serde_json::from_str(
            r#"{"class":"motorcycle","confidence":0.91,"x":30,"y":50,"width":40,"height":60,"detection_id":"abc"}"#,
        )
        .unwrap();

        let a = corners.normalize();
        let b = center.normalize();
        assert_eq!(a.label, "motorcycle");
        assert_eq!(a.bbox, b.bbox);
        assert_eq!(a.bbox, BoundingBox::from_corners(10.0, 20.0, 50.0, 80.0));
    }

    #[test]
    fn confidence_is_clamped_into_unit_range() {
        let d = Detection::new("car", 1.7, BoundingBox::from_corners(0.0, 0.0, 1.0, 1.0));
        assert_eq!(d.confidence, 1.0);
        let d = Detection::new("car", f32::NAN, BoundingBox::from_corners(0.0, 0.0, 1.0, 1.0));
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BoundingBox::from_corners(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::from_corners(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }
}
