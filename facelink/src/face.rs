//! Per-face geometry carried in a frame record.
//!
//! Detection rectangles are stored normalized to the frame size so they
//! survive a resolution change between stages; landmarks and alignment
//! transforms are in frame pixels.

use crate::error::{StageError, StageResult};
use serde::{Deserialize, Serialize};

/// A point `(x, y)`
pub type Point = (f32, f32);

/// Possibly rotated face rectangle.
///
/// Corners are normalized to the frame (0 to 1 on both axes) and run
/// top-left, top-right, bottom-right, bottom-left as seen upright on the
/// face, so a turned head gives a turned rectangle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct FaceRect {
    /// Corners, normalized
    pub corners: [Point; 4],
    /// Detector confidence, 0 to 1
    pub confidence: f32,
}

impl FaceRect {
    /// Upright rectangle given in pixels of a `frame` sized image
    pub fn from_pixels(x: f32, y: f32, width: f32, height: f32, frame: (u32, u32), confidence: f32) -> Self {
        let (fw, fh) = frame_size(frame);
        let (l, t) = (x / fw, y / fh);
        let (r, b) = ((x + width) / fw, (y + height) / fh);
        Self {
            corners: [(l, t), (r, t), (r, b), (l, b)],
            confidence,
        }
    }

    /// Rectangle of `size` pixels centred on `center`, turned clockwise by
    /// `angle` radians
    pub fn from_center(center: Point, size: (f32, f32), angle: f32, frame: (u32, u32), confidence: f32) -> Self {
        let (fw, fh) = frame_size(frame);
        let (sin, cos) = angle.sin_cos();
        let (hw, hh) = (size.0 / 2.0, size.1 / 2.0);
        let corner = |dx: f32, dy: f32| {
            let x = center.0 + dx * cos - dy * sin;
            let y = center.1 + dx * sin + dy * cos;
            (x / fw, y / fh)
        };
        Self {
            corners: [corner(-hw, -hh), corner(hw, -hh), corner(hw, hh), corner(-hw, hh)],
            confidence,
        }
    }

    /// Corners in pixels of a `frame` sized image
    pub fn to_pixels(&self, frame: (u32, u32)) -> [Point; 4] {
        let (fw, fh) = frame_size(frame);
        self.corners.map(|(x, y)| (x * fw, y * fh))
    }

    /// Centre in pixels
    pub fn center_px(&self, frame: (u32, u32)) -> Point {
        let c = self.to_pixels(frame);
        (
            (c[0].0 + c[1].0 + c[2].0 + c[3].0) / 4.0,
            (c[0].1 + c[1].1 + c[2].1 + c[3].1) / 4.0,
        )
    }

    /// Edge lengths in pixels, `(width, height)`
    pub fn size_px(&self, frame: (u32, u32)) -> (f32, f32) {
        let c = self.to_pixels(frame);
        (distance(c[0], c[1]), distance(c[1], c[2]))
    }

    /// Clockwise rotation of the top edge in radians, measured in pixels
    pub fn angle(&self, frame: (u32, u32)) -> f32 {
        let c = self.to_pixels(frame);
        (c[1].1 - c[0].1).atan2(c[1].0 - c[0].0)
    }
}

/// Head orientation in degrees
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct HeadPose {
    /// Nodding, positive looking down
    pub pitch: f32,
    /// Turning, positive towards the image right
    pub yaw: f32,
    /// Tilting, positive clockwise in the image
    pub roll: f32,
}

/// Which points a landmark set holds, and in which order
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkScheme {
    /// Eyes, nose tip, mouth corners
    FivePoint,
    /// The 68-point jaw, brow, eye, nose and lip contour
    Face68,
    /// Dense 468-point face mesh
    Mesh468,
}

impl LandmarkScheme {
    /// Number of points in a set of this scheme
    pub fn point_count(self) -> usize {
        match self {
            LandmarkScheme::FivePoint => 5,
            LandmarkScheme::Face68 => 68,
            LandmarkScheme::Mesh468 => 468,
        }
    }
}

/// Landmark set in frame pixels
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Landmarks {
    scheme: LandmarkScheme,
    points: Vec<Point>,
}

impl Landmarks {
    /// Wrap `points`, checking the count matches `scheme`
    pub fn new(scheme: LandmarkScheme, points: Vec<Point>) -> StageResult<Self> {
        if points.len() != scheme.point_count() {
            return Err(StageError::LandmarkCount {
                scheme,
                len: points.len(),
            });
        }
        Ok(Self { scheme, points })
    }

    /// Point scheme
    pub fn scheme(&self) -> LandmarkScheme {
        self.scheme
    }

    /// Points, in scheme order
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Take the points
    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    /// Head pose from the five-point layout; `None` for other schemes.
    ///
    /// Roll follows the eye line. Yaw and pitch come from how far the nose
    /// tip sits off the centre of the eye/mouth frame, where a frontal face
    /// puts it halfway between the eyes and halfway down to the mouth.
    pub fn estimate_pose(&self) -> Option<HeadPose> {
        let [left_eye, right_eye, nose, left_mouth, right_mouth] = self.points.as_slice() else {
            return None;
        };
        let roll = (right_eye.1 - left_eye.1).atan2(right_eye.0 - left_eye.0);
        let eyes = midpoint(*left_eye, *right_eye);
        let mouth = midpoint(*left_mouth, *right_mouth);

        // Undo the roll so the eye line is horizontal
        let upright = |p: Point| rotate_about(p, eyes, -roll);
        let nose = upright(*nose);
        let mouth = upright(mouth);
        let half_eyes = distance(*left_eye, *right_eye) / 2.0;
        let eye_to_mouth = mouth.1 - eyes.1;
        if half_eyes <= f32::EPSILON || eye_to_mouth <= f32::EPSILON {
            return None;
        }

        let yaw = ((nose.0 - eyes.0) / half_eyes).clamp(-1.0, 1.0).asin();
        let pitch = (((nose.1 - eyes.1) / eye_to_mouth - 0.5) * 2.0).clamp(-1.0, 1.0).asin();
        Some(HeadPose {
            pitch: pitch.to_degrees(),
            yaw: yaw.to_degrees(),
            roll: roll.to_degrees(),
        })
    }
}

/// 2x3 affine transform `[a, b, tx, c, d, ty]`:
///
/// ```text
/// x' = a*x + b*y + tx
/// y' = c*x + d*y + ty
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Affine2 {
    /// Row-major coefficients
    pub m: [f32; 6],
}

impl Affine2 {
    /// Transform leaving every point in place
    pub const IDENTITY: Affine2 = Affine2 {
        m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    };

    /// Map `center` to `target`, undoing a clockwise `angle` (radians) and
    /// scaling by `scale`
    pub fn similarity(center: Point, angle: f32, scale: f32, target: Point) -> Self {
        let (sin, cos) = angle.sin_cos();
        let (a, b) = (scale * cos, scale * sin);
        let (c, d) = (-scale * sin, scale * cos);
        Self {
            m: [
                a,
                b,
                target.0 - a * center.0 - b * center.1,
                c,
                d,
                target.1 - c * center.0 - d * center.1,
            ],
        }
    }

    /// Transform `p`
    pub fn apply(&self, p: Point) -> Point {
        let [a, b, tx, c, d, ty] = self.m;
        (a * p.0 + b * p.1 + tx, c * p.0 + d * p.1 + ty)
    }

    /// Inverse transform; `None` when the transform collapses the plane
    pub fn invert(&self) -> Option<Self> {
        let [a, b, tx, c, d, ty] = self.m;
        let det = a * d - b * c;
        if det.abs() < 1e-12 {
            return None;
        }
        Some(Self {
            m: [
                d / det,
                -b / det,
                (b * ty - d * tx) / det,
                -c / det,
                a / det,
                (c * tx - a * ty) / det,
            ],
        })
    }
}

/// Where an aligned face crop came from
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AlignedFace {
    /// Frame pixels to aligned crop pixels
    pub transform: Affine2,
    /// Side of the square crop in pixels
    pub size: u32,
}

impl AlignedFace {
    /// Aligned crop pixels back to frame pixels
    pub fn to_frame(&self) -> Option<Affine2> {
        self.transform.invert()
    }
}

/// Everything known about one face. Its images (aligned crop, masks,
/// generated face) sit in the frame record's image table under the keys
/// from [`crate::frame`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FaceRecord {
    /// Detected rectangle
    pub rect: FaceRect,
    /// Estimated head orientation
    pub pose: Option<HeadPose>,
    /// Landmark set
    pub landmarks: Option<Landmarks>,
    /// Alignment of the face crop
    pub aligned: Option<AlignedFace>,
}

impl FaceRecord {
    /// Face with only its detection filled in
    pub fn detected(rect: FaceRect) -> Self {
        Self {
            rect,
            pose: None,
            landmarks: None,
            aligned: None,
        }
    }
}

fn frame_size(frame: (u32, u32)) -> (f32, f32) {
    (frame.0.max(1) as f32, frame.1.max(1) as f32)
}

fn distance(a: Point, b: Point) -> f32 {
    (b.0 - a.0).hypot(b.1 - a.1)
}

fn midpoint(a: Point, b: Point) -> Point {
    ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0)
}

fn rotate_about(p: Point, origin: Point, angle: f32) -> Point {
    let (sin, cos) = angle.sin_cos();
    let (dx, dy) = (p.0 - origin.0, p.1 - origin.1);
    (origin.0 + dx * cos - dy * sin, origin.1 + dx * sin + dy * cos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_6;

    fn close(a: Point, b: Point) -> bool {
        (a.0 - b.0).abs() < 1e-3 && (a.1 - b.1).abs() < 1e-3
    }

    #[test]
    fn test_rect_is_normalized_to_frame() {
        let rect = FaceRect::from_pixels(20.0, 10.0, 40.0, 20.0, (200, 100), 0.8);
        assert!(close(rect.corners[0], (0.1, 0.1)));
        assert!(close(rect.corners[2], (0.3, 0.3)));
        // Same face on a frame twice the size
        assert!(close(rect.center_px((400, 200)), (80.0, 40.0)));
        assert!(close(rect.size_px((200, 100)), (40.0, 20.0)));
        assert!(rect.angle((200, 100)).abs() < 1e-6);
    }

    #[test]
    fn test_rotated_rect_keeps_size_and_angle() {
        let frame = (640, 480);
        let rect = FaceRect::from_center((320.0, 240.0), (80.0, 100.0), FRAC_PI_6, frame, 1.0);
        let (w, h) = rect.size_px(frame);
        assert!((w - 80.0).abs() < 1e-3 && (h - 100.0).abs() < 1e-3);
        assert!((rect.angle(frame) - FRAC_PI_6).abs() < 1e-4);
        assert!(close(rect.center_px(frame), (320.0, 240.0)));
    }

    #[test]
    fn test_landmark_count_is_checked() {
        assert!(Landmarks::new(LandmarkScheme::FivePoint, vec![(0.0, 0.0); 5]).is_ok());
        assert!(matches!(
            Landmarks::new(LandmarkScheme::Face68, vec![(0.0, 0.0); 5]),
            Err(StageError::LandmarkCount { len: 5, .. })
        ));
    }

    #[test]
    fn test_frontal_face_has_neutral_pose() {
        let points = vec![(30.0, 35.0), (70.0, 35.0), (50.0, 55.0), (35.0, 75.0), (65.0, 75.0)];
        let pose = Landmarks::new(LandmarkScheme::FivePoint, points)
            .unwrap()
            .estimate_pose()
            .unwrap();
        assert!(pose.pitch.abs() < 1e-3 && pose.yaw.abs() < 1e-3 && pose.roll.abs() < 1e-3);
    }

    #[test]
    fn test_pose_follows_tilt_and_turn() {
        // Right eye lower than the left: tilted clockwise
        let tilted = vec![(30.0, 30.0), (70.0, 40.0), (50.0, 55.0), (35.0, 75.0), (65.0, 75.0)];
        let pose = Landmarks::new(LandmarkScheme::FivePoint, tilted).unwrap().estimate_pose().unwrap();
        assert!(pose.roll > 10.0);

        // Nose shifted towards the right eye
        let turned = vec![(30.0, 35.0), (70.0, 35.0), (60.0, 55.0), (35.0, 75.0), (65.0, 75.0)];
        let pose = Landmarks::new(LandmarkScheme::FivePoint, turned).unwrap().estimate_pose().unwrap();
        assert!((pose.yaw - 30.0).abs() < 1e-2);

        let dense = Landmarks::new(LandmarkScheme::Face68, vec![(0.0, 0.0); 68]).unwrap();
        assert_eq!(dense.estimate_pose(), None);
    }

    #[test]
    fn test_similarity_maps_center_and_inverts() {
        let t = Affine2::similarity((100.0, 50.0), FRAC_PI_6, 2.0, (64.0, 64.0));
        assert!(close(t.apply((100.0, 50.0)), (64.0, 64.0)));

        let back = t.invert().unwrap();
        for p in [(0.0, 0.0), (120.0, 80.0), (-5.0, 33.0)] {
            assert!(close(back.apply(t.apply(p)), p));
        }

        // A point along the rotated top edge lands on the aligned horizontal
        let (sin, cos) = FRAC_PI_6.sin_cos();
        let along = t.apply((100.0 + 10.0 * cos, 50.0 + 10.0 * sin));
        assert!(close(along, (84.0, 64.0)));

        let flat = Affine2 { m: [0.0; 6] };
        assert_eq!(flat.invert(), None);
        assert_eq!(Affine2::IDENTITY.apply((3.0, 4.0)), (3.0, 4.0));
    }
}
