//! Aligner stage: warps an upright square crop around every face at a fixed
//! output size, and masks the landmark area inside it.

use super::{StageLinks, open_links, recall, remember};
use crate::face::{Affine2, AlignedFace, FaceRecord};
use crate::frame::{IMAGE_FRAME, aligned_key, landmarks_mask_key};
use crate::image::Image;
use facelink_control::controls::{ControlState, Number, NumberConfig};
use facelink_control::{BoxError, StageWorker, WorkerContext, control_sheet};
use tracing::warn;

const DEFAULT_COVERAGE: f64 = 1.6;
const DEFAULT_RESOLUTION: f64 = 224.0;
/// Landmark mask radius relative to the landmark spread
const MASK_SPREAD: f32 = 1.4;

control_sheet! {
    /// Controls of the aligner stage
    pub struct AlignerControls {
        /// Crop side relative to the face rectangle
        coverage: Number,
        /// Side of the aligned crop in pixels
        resolution: Number,
    }
}

/// Frame-to-crop transform for `face`: centred on the face, turned upright by
/// its head roll (or the rectangle's own angle without landmarks) and scaled
/// so `coverage` times the longer face side fills `resolution` pixels
pub fn align(face: &FaceRecord, frame: (u32, u32), coverage: f32, resolution: u32) -> AlignedFace {
    let center = face.rect.center_px(frame);
    let angle = face
        .pose
        .map_or_else(|| face.rect.angle(frame), |pose| pose.roll.to_radians());
    let (w, h) = face.rect.size_px(frame);
    let side = (w.max(h) * coverage.max(0.1)).max(1.0);
    let half = resolution as f32 / 2.0;
    AlignedFace {
        transform: Affine2::similarity(center, angle, resolution as f32 / side, (half, half)),
        size: resolution,
    }
}

/// Ellipse over the landmarks in crop pixels; the whole crop without landmarks
pub fn landmarks_mask(face: &FaceRecord, aligned: &AlignedFace) -> Image {
    let size = aligned.size;
    let Some(landmarks) = &face.landmarks else {
        return Image::filled(size, size, 1, 255);
    };
    let points: Vec<_> = landmarks.points().iter().map(|&p| aligned.transform.apply(p)).collect();
    let (mut lo, mut hi) = ((f32::INFINITY, f32::INFINITY), (f32::NEG_INFINITY, f32::NEG_INFINITY));
    for &(x, y) in &points {
        lo = (lo.0.min(x), lo.1.min(y));
        hi = (hi.0.max(x), hi.1.max(y));
    }
    let center = ((lo.0 + hi.0) / 2.0, (lo.1 + hi.1) / 2.0);
    let radii = ((hi.0 - lo.0) / 2.0 * MASK_SPREAD, (hi.1 - lo.1) / 2.0 * MASK_SPREAD);
    Image::ellipse_mask(size, size, center, radii)
}

/// Aligner stage worker
#[derive(Default)]
pub struct AlignerStage {
    links: Option<StageLinks>,
    coverage: f32,
    resolution: u32,
}

impl StageWorker for AlignerStage {
    type Sheet = AlignerControls;

    fn on_start(&mut self, ctx: &mut WorkerContext<AlignerControls>) -> Result<(), BoxError> {
        self.links = Some(open_links(ctx)?);
        let coverage = recall(ctx.state(), "coverage", DEFAULT_COVERAGE);
        let resolution = recall(ctx.state(), "resolution", DEFAULT_RESOLUTION);

        let c = &mut ctx.controls;
        c.coverage.set_config(NumberConfig::new(1.0, 3.0, 0.1).with_decimals(1));
        c.coverage.set_number(Some(coverage));
        c.coverage.set_state(ControlState::Enabled);
        c.resolution.set_config(NumberConfig::new(64.0, 512.0, 32.0));
        c.resolution.set_number(Some(resolution));
        c.resolution.set_state(ControlState::Enabled);

        self.coverage = c.coverage.get_number().unwrap_or(coverage) as f32;
        self.resolution = c.resolution.get_number().unwrap_or(resolution) as u32;
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<AlignerControls>) -> Result<(), BoxError> {
        if let Some(Some(coverage)) = ctx.controls.coverage.take_change() {
            self.coverage = coverage as f32;
            remember(ctx, "coverage", &coverage)?;
        }
        if let Some(Some(resolution)) = ctx.controls.resolution.take_change() {
            self.resolution = resolution as u32;
            remember(ctx, "resolution", &resolution)?;
        }

        let Some(links) = &self.links else {
            return Ok(());
        };
        if !links.downstream_ready() {
            return Ok(());
        }
        let Some(mut record) = links.read_input() else {
            return Ok(());
        };

        if let Some(frame) = record.image(&links.heap, IMAGE_FRAME) {
            let size = (frame.width(), frame.height());
            let mut crops = Vec::with_capacity(record.faces.len());
            for (i, face) in record.faces.iter_mut().enumerate() {
                let aligned = align(face, size, self.coverage, self.resolution);
                let Some(to_frame) = aligned.to_frame() else {
                    continue;
                };
                let crop = frame.warp_affine(&to_frame, aligned.size, aligned.size);
                let mask = landmarks_mask(face, &aligned);
                face.aligned = Some(aligned);
                crops.push((i, crop, mask));
            }
            for (i, crop, mask) in crops {
                let stored = record
                    .put_image(&links.heap, &aligned_key(i), &crop)
                    .and_then(|_| record.put_image(&links.heap, &landmarks_mask_key(i), &mask));
                if let Err(e) = stored {
                    warn!(frame = record.frame_num, face = i, error = %e, "Aligned face dropped");
                }
            }
        }
        links.publish(&record)?;
        Ok(())
    }
}
