//! Capture and inference collaborators.
//!
//! Stages only see the traits; the simulation implementations here are
//! deterministic so the whole pipeline runs without cameras or models.
//! Device enumeration goes through a [`DeviceRegistry`] built once per
//! process and handed to each stage.

use crate::error::StageResult;
use crate::face::{FaceRect, LandmarkScheme, Landmarks};
use crate::image::Image;
use facelink_control::controls::Choice;
use serde::{Deserialize, Serialize};

/// Kind of compute device
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Host CPU
    Cpu,
    /// Accelerator
    Gpu,
}

/// A device an inference backend can run on
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Index among devices of the same kind
    pub index: u32,
    /// Kind
    pub kind: DeviceKind,
    /// Human-readable name
    pub name: String,
}

impl DeviceInfo {
    /// The host CPU
    pub fn cpu() -> Self {
        Self {
            index: 0,
            kind: DeviceKind::Cpu,
            name: "CPU".to_string(),
        }
    }
}

impl Choice for DeviceInfo {
    fn display_name(&self) -> String {
        match self.kind {
            DeviceKind::Cpu => self.name.clone(),
            DeviceKind::Gpu => format!("[{}] {}", self.index, self.name),
        }
    }
}

/// Devices visible to this process
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<DeviceInfo>,
}

impl DeviceRegistry {
    /// Registry over an explicit device list
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }

    /// CPU plus one simulated accelerator
    pub fn simulated() -> Self {
        Self::new(vec![
            DeviceInfo::cpu(),
            DeviceInfo {
                index: 0,
                kind: DeviceKind::Gpu,
                name: "Simulated accelerator".to_string(),
            },
        ])
    }

    /// Every known device
    pub fn available_devices(&self) -> &[DeviceInfo] {
        &self.devices
    }
}

/// Produces source frames
pub trait FrameSource: Send {
    /// Capture the next frame at the given size
    fn read(&mut self, width: u32, height: u32) -> StageResult<Image>;

    /// Total number of frames, for sources that end; live sources have none
    fn frame_count(&self) -> Option<u64> {
        None
    }
}

/// Finds faces in a frame
pub trait FaceDetector: Send {
    /// Faces at or above `threshold` confidence, at most `max_faces`
    fn extract(&mut self, image: &Image, threshold: f32, max_faces: usize) -> StageResult<Vec<FaceRect>>;
}

/// Places landmarks on a detected face
pub trait FaceMarker: Send {
    /// Landmarks in frame pixels
    fn extract(&mut self, image: &Image, rect: &FaceRect) -> StageResult<Landmarks>;
}

/// Output of a [`FaceSwapper`]
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedFace {
    /// Replacement face, the size of the aligned crop
    pub face: Image,
    /// Single-channel coverage of `face`, 255 where it fully applies
    pub mask: Image,
}

/// Generates a replacement face
pub trait FaceSwapper: Send {
    /// New face and its mask for an aligned crop
    fn generate(&mut self, face: &Image) -> StageResult<GeneratedFace>;
}

/// Brightness level the test pattern draws faces at
const FACE_LEVEL: u8 = 220;
/// Threshold the simulated detector looks for
const DETECT_LEVEL: u8 = 200;

/// Gradient background with bright squares drifting sideways as faces.
#[derive(Debug, Clone)]
pub struct TestPatternSource {
    faces: usize,
    frame: u64,
    length: Option<u64>,
}

impl TestPatternSource {
    /// Endless pattern with `faces` squares
    pub fn new(faces: usize) -> Self {
        Self {
            faces,
            frame: 0,
            length: None,
        }
    }

    /// Report `length` frames in total, like a clip would
    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }
}

impl FrameSource for TestPatternSource {
    fn frame_count(&self) -> Option<u64> {
        self.length
    }

    fn read(&mut self, width: u32, height: u32) -> StageResult<Image> {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height as u64 {
            for x in 0..width as u64 {
                let v = ((x + y + self.frame) % 128) as u8;
                data.extend_from_slice(&[v, v / 2, 127 - v]);
            }
        }
        let mut image = Image::new(width, height, 3, data)?;

        if self.faces > 0 {
            let band = width / self.faces as u32;
            let side = (height / 3).min(band.saturating_sub(2)).max(1);
            let travel = band.saturating_sub(side).max(1) as u64;
            for i in 0..self.faces as u32 {
                let x = i * band + (self.frame % travel) as u32;
                let y = (height - side) / 2;
                let face = Image::filled(side, side, 3, FACE_LEVEL);
                image.blend(&face, x, y, 1.0);
            }
        }
        self.frame += 1;
        Ok(image)
    }
}

/// Reports every horizontal run of columns holding bright pixels as a face.
#[derive(Debug, Clone, Default)]
pub struct BrightRegionDetector;

impl FaceDetector for BrightRegionDetector {
    fn extract(&mut self, image: &Image, threshold: f32, max_faces: usize) -> StageResult<Vec<FaceRect>> {
        let bright = |x: u32, y: u32| image.pixel(x, y)[0] >= DETECT_LEVEL;
        let column_hit = |x: u32| (0..image.height()).any(|y| bright(x, y));

        let mut runs = Vec::new();
        let mut start = None;
        for x in 0..=image.width() {
            let hit = x < image.width() && column_hit(x);
            match (hit, start) {
                (true, None) => start = Some(x),
                (false, Some(s)) => {
                    runs.push((s, x));
                    start = None;
                }
                _ => {}
            }
        }

        let mut faces = Vec::new();
        for (x0, x1) in runs {
            let rows: Vec<u32> = (0..image.height())
                .filter(|&y| (x0..x1).any(|x| bright(x, y)))
                .collect();
            let (Some(&y0), Some(&y1)) = (rows.first(), rows.last()) else {
                continue;
            };
            let (w, h) = (x1 - x0, y1 + 1 - y0);
            let hits = (y0..=y1)
                .flat_map(|y| (x0..x1).map(move |x| (x, y)))
                .filter(|&(x, y)| bright(x, y))
                .count();
            let confidence = hits as f32 / (w * h) as f32;
            if confidence >= threshold {
                faces.push(FaceRect::from_pixels(
                    x0 as f32,
                    y0 as f32,
                    w as f32,
                    h as f32,
                    (image.width(), image.height()),
                    confidence,
                ));
            }
        }
        faces.truncate(max_faces);
        Ok(faces)
    }
}

/// Five-point landmarks at fixed proportions of the face rectangle:
/// eyes, nose tip, mouth corners. Follows the rectangle's rotation.
#[derive(Debug, Clone, Default)]
pub struct ProportionalMarker;

const FIVE_POINTS: [(f32, f32); 5] = [(0.3, 0.35), (0.7, 0.35), (0.5, 0.55), (0.35, 0.75), (0.65, 0.75)];

impl FaceMarker for ProportionalMarker {
    fn extract(&mut self, image: &Image, rect: &FaceRect) -> StageResult<Landmarks> {
        let [tl, tr, _, bl] = rect.to_pixels((image.width(), image.height()));
        let points = FIVE_POINTS
            .iter()
            .map(|&(fx, fy)| {
                (
                    tl.0 + fx * (tr.0 - tl.0) + fy * (bl.0 - tl.0),
                    tl.1 + fx * (tr.1 - tl.1) + fy * (bl.1 - tl.1),
                )
            })
            .collect();
        Landmarks::new(LandmarkScheme::FivePoint, points)
    }
}

/// Colour-inverting face generator with a full mask
#[derive(Debug, Clone, Default)]
pub struct InvertingSwapper;

impl FaceSwapper for InvertingSwapper {
    fn generate(&mut self, face: &Image) -> StageResult<GeneratedFace> {
        let mut out = face.clone();
        out.invert();
        Ok(GeneratedFace {
            mask: Image::filled(face.width(), face.height(), 1, 255),
            face: out,
        })
    }
}

/// Build the detector for `device`
pub fn detector_for(device: &DeviceInfo) -> Box<dyn FaceDetector> {
    tracing::debug!(device = %device.display_name(), "Loading detector");
    Box::new(BrightRegionDetector)
}

/// Build the swapper for `device`
pub fn swapper_for(device: &DeviceInfo) -> Box<dyn FaceSwapper> {
    tracing::debug!(device = %device.display_name(), "Loading swapper");
    Box::new(InvertingSwapper)
}
