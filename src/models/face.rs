use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel units of the probed frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Landmark groups used by black-bar redaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FaceLandmarks {
    #[serde(default)]
    pub left_eye: Vec<Point>,
    #[serde(default)]
    pub right_eye: Vec<Point>,
    #[serde(default)]
    pub nose: Vec<Point>,
}

impl FaceLandmarks {
    pub fn eyes_and_nose(&self) -> impl Iterator<Item = &Point> {
        self.left_eye
            .iter()
            .chain(self.right_eye.iter())
            .chain(self.nose.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.left_eye.is_empty() && self.right_eye.is_empty() && self.nose.is_empty()
    }
}

/// One face returned by the detector adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedFace {
    /// 1-based ordinal in detection output order.
    pub index: u32,
    pub bounding_box: BoundingBox,
    pub landmarks: FaceLandmarks,
    pub confidence: f32,
}

/// Persisted face detection row, keyed by (video id, face index).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaceRecord {
    pub face_index: i32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f64,
}

impl From<&DetectedFace> for FaceRecord {
    fn from(face: &DetectedFace) -> Self {
        let bbox = face.bounding_box;
        Self {
            face_index: face.index as i32,
            x: bbox.x.round() as i32,
            y: bbox.y.round() as i32,
            width: bbox.width.round() as i32,
            height: bbox.height.round() as i32,
            confidence: f64::from(face.confidence),
        }
    }
}
