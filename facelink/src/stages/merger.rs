//! Merger stage: warps the generated faces back into the frame through the
//! inverse of their alignment.

use super::{StageLinks, open_links, recall, remember};
use crate::face::FaceRecord;
use crate::frame::{FrameRecord, IMAGE_FRAME, IMAGE_MERGED, landmarks_mask_key, swapped_key, swapped_mask_key};
use crate::image::Image;
use facelink_shm::WeakHeap;
use facelink_control::controls::{ControlState, Number, NumberConfig};
use facelink_control::{BoxError, StageWorker, WorkerContext, control_sheet};
use tracing::{debug, warn};

const DEFAULT_OPACITY: f64 = 1.0;

control_sheet! {
    /// Controls of the merger stage
    pub struct MergerControls {
        /// Weight of the generated face over the original
        opacity: Number,
    }
}

/// Paste generated face `index` onto `frame`.
///
/// The face goes through its generator mask and, when present, the landmark
/// mask. Returns false when the face has no alignment or generated image.
pub fn merge_face(
    frame: &mut Image,
    heap: &WeakHeap,
    record: &FrameRecord,
    index: usize,
    face: &FaceRecord,
    opacity: f32,
) -> bool {
    let Some(aligned) = face.aligned else {
        return false;
    };
    let Some(swapped) = record.image(heap, &swapped_key(index)) else {
        return false;
    };
    let side = swapped.width().max(1);
    // Generated faces may come back at another size than the crop
    let scale = side as f32 / aligned.size.max(1) as f32;
    let mut to_face = aligned.transform;
    for c in &mut to_face.m {
        *c *= scale;
    }

    let mut mask = record
        .image(heap, &swapped_mask_key(index))
        .map(|m| m.resize(swapped.width(), swapped.height()))
        .unwrap_or_else(|| Image::filled(swapped.width(), swapped.height(), 1, 255));
    if let Some(landmarks) = record.image(heap, &landmarks_mask_key(index)) {
        mask.multiply_mask(&landmarks.resize(swapped.width(), swapped.height()));
    }
    frame.composite(&swapped, Some(&mask), &to_face, opacity);
    true
}

/// Merger stage worker
pub struct MergerStage {
    links: Option<StageLinks>,
    opacity: f32,
}

impl Default for MergerStage {
    fn default() -> Self {
        Self {
            links: None,
            opacity: DEFAULT_OPACITY as f32,
        }
    }
}

impl StageWorker for MergerStage {
    type Sheet = MergerControls;

    fn on_start(&mut self, ctx: &mut WorkerContext<MergerControls>) -> Result<(), BoxError> {
        self.links = Some(open_links(ctx)?);
        let opacity = recall(ctx.state(), "opacity", DEFAULT_OPACITY);

        let c = &mut ctx.controls.opacity;
        c.set_config(NumberConfig::new(0.0, 1.0, 0.05).with_decimals(2));
        c.set_number(Some(opacity));
        c.set_state(ControlState::Enabled);
        self.opacity = c.get_number().unwrap_or(opacity) as f32;
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<MergerControls>) -> Result<(), BoxError> {
        if let Some(Some(opacity)) = ctx.controls.opacity.take_change() {
            self.opacity = opacity as f32;
            remember(ctx, "opacity", &opacity)?;
            // Show the new blend even while the source is paused
            if let Some(links) = &self.links {
                links.reemit.request()?;
            }
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

        if let Some(mut frame) = record.image(&links.heap, IMAGE_FRAME) {
            let mut merged = 0;
            for (i, face) in record.faces.iter().enumerate() {
                if merge_face(&mut frame, &links.heap, &record, i, face, self.opacity) {
                    merged += 1;
                }
            }
            debug!(frame = record.frame_num, merged, "Faces merged");
            if let Err(e) = record.put_image(&links.heap, IMAGE_MERGED, &frame) {
                warn!(frame = record.frame_num, error = %e, "Merged frame dropped");
            }
        }
        links.publish(&record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::{Affine2, AlignedFace, FaceRect};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn heap() -> WeakHeap {
        static CTR: AtomicU32 = AtomicU32::new(0);
        let name = format!("ut_merge_{}_{}", std::process::id(), CTR.fetch_add(1, Ordering::Relaxed));
        WeakHeap::create(&name, 64 * 1024).unwrap()
    }

    fn aligned_face() -> FaceRecord {
        let mut face = FaceRecord::detected(FaceRect::from_pixels(8.0, 8.0, 8.0, 8.0, (32, 32), 1.0));
        // Frame (8..16, 8..16) onto a 16 pixel crop
        face.aligned = Some(AlignedFace {
            transform: Affine2::similarity((12.0, 12.0), 0.0, 2.0, (8.0, 8.0)),
            size: 16,
        });
        face
    }

    #[test]
    fn test_generated_face_lands_on_its_region() {
        let heap = heap();
        let mut record = FrameRecord::new(0, 0, 25.0);
        record.faces.push(aligned_face());
        // Generated at half the crop size
        record.put_image(&heap, &swapped_key(0), &Image::filled(8, 8, 3, 200)).unwrap();

        let mut frame = Image::filled(32, 32, 3, 0);
        assert!(merge_face(&mut frame, &heap, &record, 0, &record.faces[0], 1.0));
        assert_eq!(frame.pixel(12, 12), &[200, 200, 200]);
        assert_eq!(frame.pixel(8, 8), &[200, 200, 200]);
        assert_eq!(frame.pixel(16, 16), &[0, 0, 0]);
        assert_eq!(frame.pixel(4, 12), &[0, 0, 0]);
    }

    #[test]
    fn test_masks_limit_the_paste() {
        let heap = heap();
        let mut record = FrameRecord::new(0, 0, 25.0);
        record.faces.push(aligned_face());
        record.put_image(&heap, &swapped_key(0), &Image::filled(16, 16, 1, 100)).unwrap();
        record.put_image(&heap, &swapped_mask_key(0), &Image::filled(16, 16, 1, 255)).unwrap();
        // Landmark mask covering only the left half of the crop
        let mut half = Image::filled(16, 16, 1, 0);
        half.blend(&Image::filled(8, 16, 1, 255), 0, 0, 1.0);
        record.put_image(&heap, &landmarks_mask_key(0), &half).unwrap();

        let mut frame = Image::filled(32, 32, 1, 0);
        assert!(merge_face(&mut frame, &heap, &record, 0, &record.faces[0], 1.0));
        assert_eq!(frame.pixel(9, 12), &[100]);
        assert_eq!(frame.pixel(14, 12), &[0]);
    }

    #[test]
    fn test_unaligned_face_is_skipped() {
        let heap = heap();
        let mut record = FrameRecord::new(0, 0, 25.0);
        record.faces.push(FaceRecord::detected(FaceRect::from_pixels(0.0, 0.0, 4.0, 4.0, (8, 8), 1.0)));
        let mut frame = Image::filled(8, 8, 3, 0);
        assert!(!merge_face(&mut frame, &heap, &record, 0, &record.faces[0], 1.0));
    }
}
