use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, Rgba, RgbaImage};

use crate::models::face::{BoundingBox, DetectedFace};
use crate::models::video::RedactionMode;

/// Padding added around the eye/nose landmarks on every side.
pub const BAR_PADDING: f32 = 15.0;
/// Minimum height of a black bar.
pub const MIN_BAR_HEIGHT: f32 = 30.0;

const JPEG_QUALITY: u8 = 90;
const BAR_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Pixel rectangle already clipped to an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// Clip a floating-point rectangle to a `width`×`height` image.
    /// Returns `None` when nothing of it is inside the image.
    fn clipped(x0: f32, y0: f32, x1: f32, y1: f32, width: u32, height: u32) -> Option<Self> {
        if ![x0, y0, x1, y1].iter().all(|v| v.is_finite()) {
            return None;
        }
        let left = x0.floor().max(0.0) as u32;
        let top = y0.floor().max(0.0) as u32;
        let right = (x1.ceil().max(0.0) as u32).min(width);
        let bottom = (y1.ceil().max(0.0) as u32).min(height);
        if right <= left || bottom <= top {
            return None;
        }
        Some(Self {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
        })
    }

    fn from_box(b: &BoundingBox, width: u32, height: u32) -> Option<Self> {
        Self::clipped(b.x, b.y, b.x + b.width, b.y + b.height, width, height)
    }
}

/// Obscure every face in `image` and return the result. `image` itself is
/// never modified.
pub fn redact(
    image: &DynamicImage,
    faces: &[DetectedFace],
    mode: RedactionMode,
    intensity: u32,
) -> DynamicImage {
    let mut canvas = image.to_rgba8();
    let (width, height) = canvas.dimensions();

    for face in faces {
        match mode {
            RedactionMode::Blur => {
                if let Some(region) = Region::from_box(&face.bounding_box, width, height) {
                    blur_region(&mut canvas, region, intensity as f32);
                }
            }
            RedactionMode::BlackBar => {
                if let Some(region) = black_bar_region(face, width, height) {
                    fill_region(&mut canvas, region, BAR_COLOR);
                }
            }
        }
    }

    DynamicImage::ImageRgba8(canvas)
}

/// Gaussian blur with sigma `intensity`, confined to `region`.
fn blur_region(canvas: &mut RgbaImage, region: Region, intensity: f32) {
    if intensity <= 0.0 {
        return;
    }
    let patch = imageops::crop_imm(canvas, region.x, region.y, region.width, region.height).to_image();
    let blurred = imageops::blur(&patch, intensity);
    imageops::replace(canvas, &blurred, i64::from(region.x), i64::from(region.y));
}

/// Bar spanning the eye and nose landmarks, padded and clipped to the frame.
/// Faces without landmarks are covered over their whole bounding box.
pub fn black_bar_region(face: &DetectedFace, width: u32, height: u32) -> Option<Region> {
    if face.landmarks.is_empty() {
        return Region::from_box(&face.bounding_box, width, height);
    }

    let (mut min_x, mut min_y) = (f32::INFINITY, f32::INFINITY);
    let (mut max_x, mut max_y) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
    for p in face.landmarks.eyes_and_nose() {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }

    let bar_height = (max_y - min_y + 2.0 * BAR_PADDING).max(MIN_BAR_HEIGHT);
    let top = min_y - BAR_PADDING;
    Region::clipped(
        min_x - BAR_PADDING,
        top,
        max_x + BAR_PADDING,
        top + bar_height,
        width,
        height,
    )
}

fn fill_region(canvas: &mut RgbaImage, region: Region, color: Rgba<u8>) {
    for y in region.y..region.y + region.height {
        for x in region.x..region.x + region.width {
            canvas.put_pixel(x, y, color);
        }
    }
}

/// Encode a redacted frame for publishing.
pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, RedactionError> {
    let rgb = image.to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(RedactionError::Encode)?;
    Ok(buffer.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum RedactionError {
    #[error("Failed to encode redacted frame: {0}")]
    Encode(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::face::{FaceLandmarks, Point};

    /// 1-pixel checkerboard so any blur visibly changes pixels.
    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        });
        DynamicImage::ImageRgba8(img)
    }

    fn face(x: f32, y: f32, w: f32, h: f32, landmarks: FaceLandmarks) -> DetectedFace {
        DetectedFace {
            index: 1,
            bounding_box: BoundingBox::new(x, y, w, h),
            landmarks,
            confidence: 0.9,
        }
    }

    fn landmarks(eyes_y: f32, nose_y: f32) -> FaceLandmarks {
        FaceLandmarks {
            left_eye: vec![Point { x: 40.0, y: eyes_y }, Point { x: 50.0, y: eyes_y }],
            right_eye: vec![Point { x: 70.0, y: eyes_y }, Point { x: 80.0, y: eyes_y }],
            nose: vec![Point { x: 60.0, y: nose_y }],
        }
    }

    fn inside(region: Region, x: u32, y: u32) -> bool {
        x >= region.x && x < region.x + region.width && y >= region.y && y < region.y + region.height
    }

    #[test]
    fn test_blur_only_touches_face_box() {
        let original = checkerboard(64, 48);
        let snapshot = original.clone();
        let faces = [face(10.0, 8.0, 20.0, 16.0, FaceLandmarks::default())];

        let out = redact(&original, &faces, RedactionMode::Blur, 25).to_rgba8();
        let src = original.to_rgba8();
        let region = Region { x: 10, y: 8, width: 20, height: 16 };

        let mut changed_inside = 0;
        for (x, y, px) in out.enumerate_pixels() {
            if inside(region, x, y) {
                if px != src.get_pixel(x, y) {
                    changed_inside += 1;
                }
            } else {
                assert_eq!(px, src.get_pixel(x, y), "pixel ({x},{y}) outside the box changed");
            }
        }
        assert!(changed_inside > 0);
        assert_eq!(original, snapshot, "input buffer must not be mutated");
    }

    #[test]
    fn test_reblurring_is_well_formed() {
        let faces = [
            face(5.0, 5.0, 30.0, 30.0, FaceLandmarks::default()),
            face(20.0, 20.0, 30.0, 30.0, FaceLandmarks::default()),
        ];
        let once = redact(&checkerboard(64, 64), &faces, RedactionMode::Blur, 25);
        let twice = redact(&once, &faces, RedactionMode::Blur, 25);
        assert_eq!(twice.width(), 64);
        assert_eq!(twice.height(), 64);
    }

    #[test]
    fn test_redaction_is_deterministic() {
        let img = checkerboard(64, 64);
        let faces = [face(4.0, 4.0, 40.0, 40.0, landmarks(20.0, 30.0))];
        for mode in [RedactionMode::Blur, RedactionMode::BlackBar] {
            assert_eq!(redact(&img, &faces, mode, 10), redact(&img, &faces, mode, 10));
        }
    }

    #[test]
    fn test_black_bar_spans_landmarks_with_padding() {
        let f = face(30.0, 10.0, 60.0, 80.0, landmarks(40.0, 60.0));
        let region = black_bar_region(&f, 200, 200).unwrap();
        // x: 40-15 .. 80+15, y: 40-15 .. 25 + (20 + 30)
        assert_eq!(region, Region { x: 25, y: 25, width: 70, height: 50 });
    }

    #[test]
    fn test_black_bar_has_minimum_height() {
        let f = face(30.0, 10.0, 60.0, 80.0, landmarks(40.0, 40.0));
        let region = black_bar_region(&f, 200, 200).unwrap();
        assert_eq!(region.height, 30);
        assert_eq!(region.y, 25);
    }

    #[test]
    fn test_black_bar_is_clipped_to_frame() {
        let f = face(30.0, 0.0, 60.0, 30.0, landmarks(5.0, 10.0));
        let region = black_bar_region(&f, 90, 200).unwrap();
        assert_eq!(region.y, 0);
        assert_eq!(region.x + region.width, 90);
    }

    #[test]
    fn test_black_bar_falls_back_to_bounding_box() {
        let f = face(10.0, 12.0, 20.0, 22.0, FaceLandmarks::default());
        assert_eq!(
            black_bar_region(&f, 100, 100),
            Some(Region { x: 10, y: 12, width: 20, height: 22 })
        );
    }

    #[test]
    fn test_black_bar_paints_opaque_region_only() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(120, 120, Rgba([200, 100, 50, 255])));
        let f = face(30.0, 10.0, 60.0, 80.0, landmarks(40.0, 60.0));
        let out = redact(&img, &[f], RedactionMode::BlackBar, 25).to_rgba8();
        let bar = Region { x: 25, y: 25, width: 70, height: 50 };

        for (x, y, px) in out.enumerate_pixels() {
            if inside(bar, x, y) {
                assert_eq!(*px, BAR_COLOR);
            } else {
                assert_eq!(*px, Rgba([200, 100, 50, 255]));
            }
        }
    }

    #[test]
    fn test_faces_outside_frame_are_ignored() {
        let img = checkerboard(32, 32);
        let faces = [face(100.0, 100.0, 10.0, 10.0, FaceLandmarks::default())];
        assert_eq!(redact(&img, &faces, RedactionMode::Blur, 25).to_rgba8(), img.to_rgba8());
        assert_eq!(redact(&img, &faces, RedactionMode::BlackBar, 25).to_rgba8(), img.to_rgba8());
    }

    #[test]
    fn test_jpeg_encoding_keeps_dimensions() {
        let bytes = encode_jpeg(&checkerboard(40, 30)).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
    }
}
