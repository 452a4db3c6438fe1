//! Sample detections and videos shared by the pipeline tests.

#![allow(dead_code)]

use face_redact_pipeline::models::face::{BoundingBox, FaceLandmarks, Point};
use face_redact_pipeline::services::detector::RawFace;

fn points(coords: &[(f32, f32)]) -> Vec<Point> {
    coords.iter().map(|&(x, y)| Point { x, y }).collect()
}

/// Frontal face with eyes and nose landmarks.
pub fn frontal_face() -> RawFace {
    RawFace {
        bounding_box: BoundingBox::new(200.0, 120.0, 160.0, 200.0),
        landmarks: FaceLandmarks {
            left_eye: points(&[(240.0, 180.0), (260.0, 178.0)]),
            right_eye: points(&[(300.0, 178.0), (320.0, 180.0)]),
            nose: points(&[(280.0, 200.0), (280.0, 230.0)]),
        },
        confidence: 0.97,
    }
}

/// Face in profile; the model reported no landmarks.
pub fn profile_face() -> RawFace {
    RawFace {
        bounding_box: BoundingBox::new(800.0, 300.0, 120.0, 150.0),
        landmarks: FaceLandmarks::default(),
        confidence: 0.81,
    }
}

/// Below the 0.5 threshold; never reported.
pub fn weak_face() -> RawFace {
    RawFace {
        bounding_box: BoundingBox::new(20.0, 20.0, 40.0, 40.0),
        landmarks: FaceLandmarks::default(),
        confidence: 0.31,
    }
}

pub const SAMPLE_INPUT: &str = "uploads/videos/interview.mp4";
pub const SAMPLE_FILENAME: &str = "interview.mp4";
pub const CALLBACK_URL: &str = "https://subscriber.test/hooks/video";
