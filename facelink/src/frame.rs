//! Frame record: the per-frame payload flowing stage to stage.
//!
//! A record is one format version byte followed by the bincode encoding of
//! [`FrameRecord`]. Pixel data never travels in the record itself; images
//! live in the shared [`WeakHeap`] and the record names them in its
//! `images` table.

use crate::error::{StageError, StageResult};
use crate::face::FaceRecord;
use crate::image::Image;
use facelink_shm::{DataRef, Fetched, WeakHeap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Layout version written in front of every encoded record
pub const FRAME_FORMAT_VERSION: u8 = 2;

/// Image table key of the source frame
pub const IMAGE_FRAME: &str = "frame";

/// Image table key of the merged output frame
pub const IMAGE_MERGED: &str = "merged";

/// Image table key of a face crop after alignment
pub fn aligned_key(face: usize) -> String {
    format!("face_{}_aligned", face)
}

/// Image table key of the landmark mask over an aligned face
pub fn landmarks_mask_key(face: usize) -> String {
    format!("face_{}_landmarks_mask", face)
}

/// Image table key of a generated face
pub fn swapped_key(face: usize) -> String {
    format!("face_{}_swapped", face)
}

/// Image table key of the mask the generator produced with its face
pub fn swapped_mask_key(face: usize) -> String {
    format!("face_{}_swapped_mask", face)
}

/// An image stored in the weak heap
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRef {
    /// Heap reference of the pixel data
    pub data: DataRef,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Channels per pixel
    pub channels: u8,
}

impl ImageRef {
    /// Copy `image` into the heap
    pub fn store(heap: &WeakHeap, image: &Image) -> StageResult<Self> {
        Ok(Self {
            data: heap.add_data(image.data())?,
            width: image.width(),
            height: image.height(),
            channels: image.channels(),
        })
    }

    /// Copy the image back out; stale once the heap reused its block
    pub fn load(&self, heap: &WeakHeap) -> Fetched<Image> {
        match heap.get_data(&self.data) {
            Fetched::Fresh(bytes) => match Image::new(self.width, self.height, self.channels, bytes) {
                Ok(image) => Fetched::Fresh(image),
                Err(_) => Fetched::Stale,
            },
            Fetched::Stale => Fetched::Stale,
        }
    }
}

/// Everything known about one frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// Unique per emission, reemissions included
    pub uid: Uuid,
    /// Source frame counter
    pub frame_num: u64,
    /// Total frames the source will produce; `None` for live sources
    pub frame_count: Option<u64>,
    /// Capture time, milliseconds since the source started
    pub timestamp_ms: u64,
    /// Source frame rate at capture
    pub fps: f64,
    /// True when the source resent an earlier frame
    pub is_reemitted: bool,
    /// Images by key
    pub images: BTreeMap<String, ImageRef>,
    /// Faces in detection order
    pub faces: Vec<FaceRecord>,
}

impl FrameRecord {
    /// Record of a freshly captured frame
    pub fn new(frame_num: u64, timestamp_ms: u64, fps: f64) -> Self {
        Self {
            uid: Uuid::new_v4(),
            frame_num,
            frame_count: None,
            timestamp_ms,
            fps,
            is_reemitted: false,
            images: BTreeMap::new(),
            faces: Vec::new(),
        }
    }

    /// The same frame marked as resent, under a new uid
    pub fn reemitted(&self) -> Self {
        Self {
            uid: Uuid::new_v4(),
            is_reemitted: true,
            ..self.clone()
        }
    }

    /// Store `image` in the heap under `key`
    pub fn put_image(&mut self, heap: &WeakHeap, key: &str, image: &Image) -> StageResult<()> {
        let image_ref = ImageRef::store(heap, image)?;
        self.images.insert(key.to_string(), image_ref);
        Ok(())
    }

    /// Load the image under `key`; `None` when absent or stale
    pub fn image(&self, heap: &WeakHeap, key: &str) -> Option<Image> {
        let image_ref = self.images.get(key)?;
        match image_ref.load(heap) {
            Fetched::Fresh(image) => Some(image),
            Fetched::Stale => {
                tracing::debug!(frame = self.frame_num, key, "Stale image dropped");
                None
            }
        }
    }

    /// Version byte plus bincode
    pub fn encode(&self) -> StageResult<Vec<u8>> {
        let mut out = vec![FRAME_FORMAT_VERSION];
        bincode::serialize_into(&mut out, self)?;
        Ok(out)
    }

    /// Decode a record written by [`encode`](Self::encode)
    pub fn decode(bytes: &[u8]) -> StageResult<Self> {
        match bytes.split_first() {
            Some((&FRAME_FORMAT_VERSION, body)) => Ok(bincode::deserialize(body)?),
            Some((&version, _)) => Err(StageError::FrameVersion(version)),
            None => Err(StageError::FrameVersion(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::{Affine2, AlignedFace, FaceRect, LandmarkScheme, Landmarks};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn heap(size: usize) -> WeakHeap {
        static CTR: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "ut_frame_{}_{}",
            std::process::id(),
            CTR.fetch_add(1, Ordering::Relaxed)
        );
        WeakHeap::create(&name, size).unwrap()
    }

    #[test]
    fn test_record_carries_images_by_reference() {
        let heap = heap(64 * 1024);
        let image = Image::filled(16, 16, 3, 42);
        let mut record = FrameRecord::new(3, 120, 25.0);
        record.put_image(&heap, IMAGE_FRAME, &image).unwrap();
        record.faces.push(FaceRecord::detected(FaceRect::from_pixels(
            1.0,
            1.0,
            4.0,
            4.0,
            (16, 16),
            0.9,
        )));

        let bytes = record.encode().unwrap();
        assert_eq!(bytes[0], FRAME_FORMAT_VERSION);
        // Pixel data stays in the heap
        assert!(bytes.len() < image.data().len());

        let decoded = FrameRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.image(&heap, IMAGE_FRAME), Some(image));
        assert_eq!(decoded.image(&heap, IMAGE_MERGED), None);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut bytes = FrameRecord::new(0, 0, 25.0).encode().unwrap();
        bytes[0] = 9;
        assert!(matches!(FrameRecord::decode(&bytes), Err(StageError::FrameVersion(9))));
        assert!(FrameRecord::decode(&[]).is_err());
    }

    #[test]
    fn test_reemitted_copy_gets_new_uid() {
        let record = FrameRecord::new(7, 280, 25.0);
        let again = record.reemitted();
        assert!(again.is_reemitted);
        assert_ne!(again.uid, record.uid);
        assert_eq!(again.frame_num, 7);
    }

    #[test]
    fn test_overwritten_image_reads_as_missing() {
        let heap = heap(4096);
        let mut record = FrameRecord::new(0, 0, 25.0);
        record.put_image(&heap, IMAGE_FRAME, &Image::filled(16, 16, 3, 1)).unwrap();
        for _ in 0..8 {
            heap.add_data(&[0u8; 700]).unwrap();
        }
        assert_eq!(record.image(&heap, IMAGE_FRAME), None);
    }

    #[test]
    fn test_full_face_entry_survives_encoding() {
        let heap = heap(64 * 1024);
        let frame = (64, 48);
        let mut record = FrameRecord::new(11, 440, 25.0);
        record.frame_count = Some(300);

        let rect = FaceRect::from_center((32.0, 24.0), (20.0, 24.0), 0.3, frame, 0.95);
        let points = vec![(27.0, 20.0), (37.0, 21.0), (32.0, 25.0), (28.0, 30.0), (36.0, 31.0)];
        let landmarks = Landmarks::new(LandmarkScheme::FivePoint, points).unwrap();
        let mut face = FaceRecord::detected(rect);
        face.pose = landmarks.estimate_pose();
        face.landmarks = Some(landmarks);
        face.aligned = Some(AlignedFace {
            transform: Affine2::similarity((32.0, 24.0), 0.3, 4.0, (64.0, 64.0)),
            size: 128,
        });
        record.faces.push(face);
        for key in [
            aligned_key(0),
            landmarks_mask_key(0),
            swapped_key(0),
            swapped_mask_key(0),
        ] {
            record.put_image(&heap, &key, &Image::filled(8, 8, 1, 9)).unwrap();
        }

        let decoded = FrameRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.frame_count, Some(300));
        let face = &decoded.faces[0];
        assert!(face.pose.is_some());
        assert_eq!(face.landmarks.as_ref().map(Landmarks::scheme), Some(LandmarkScheme::FivePoint));
        assert!((face.rect.angle(frame) - 0.3).abs() < 1e-4);
        let back = face.aligned.and_then(|a| a.to_frame()).unwrap();
        let (x, y) = back.apply((64.0, 64.0));
        assert!((x - 32.0).abs() < 1e-3 && (y - 24.0).abs() < 1e-3);
        assert_eq!(decoded.image(&heap, &swapped_mask_key(0)), Some(Image::filled(8, 8, 1, 9)));
    }
}
