//! Marker stage: places landmarks on every detected face, smooths them
//! across frames and estimates the head pose from them.

use super::{StageLinks, open_links, recall, remember};
use crate::backends::{FaceMarker, ProportionalMarker};
use crate::face::{Landmarks, Point};
use crate::frame::IMAGE_FRAME;
use facelink_control::controls::{ControlState, Number, NumberConfig};
use facelink_control::{BoxError, StageWorker, WorkerContext, control_sheet};

const DEFAULT_SMOOTHING: f64 = 0.5;

type Points = Vec<Point>;

/// Exponential moving average over per-face landmark sets.
///
/// The history is matched to faces by position in the frame's face list, so
/// it restarts whenever the number of faces changes. Reemitted frames are
/// smoothed against the history without advancing it.
#[derive(Debug, Clone, Default)]
pub struct LandmarkSmoother {
    factor: f32,
    history: Vec<Points>,
}

impl LandmarkSmoother {
    /// Smoother keeping `factor` of the previous position each frame.
    /// Zero disables smoothing.
    pub fn new(factor: f32) -> Self {
        Self {
            factor: factor.clamp(0.0, 0.99),
            history: Vec::new(),
        }
    }

    /// Current factor
    pub fn factor(&self) -> f32 {
        self.factor
    }

    /// Change the factor; the history is kept
    pub fn set_factor(&mut self, factor: f32) {
        self.factor = factor.clamp(0.0, 0.99);
    }

    /// Forget every face
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Smooth the landmarks of one frame, one entry per face
    pub fn apply(&mut self, faces: Vec<Points>, reemitted: bool) -> Vec<Points> {
        if faces.len() != self.history.len() {
            if reemitted {
                return faces;
            }
            self.history = faces.clone();
            return faces;
        }

        let smoothed: Vec<Points> = faces
            .into_iter()
            .zip(&self.history)
            .map(|(current, previous)| self.blend(current, previous))
            .collect();
        if !reemitted {
            self.history = smoothed.clone();
        }
        smoothed
    }

    fn blend(&self, current: Points, previous: &[Point]) -> Points {
        if current.len() != previous.len() {
            return current;
        }
        let keep = self.factor;
        current
            .into_iter()
            .zip(previous)
            .map(|((x, y), (px, py))| (px * keep + x * (1.0 - keep), py * keep + y * (1.0 - keep)))
            .collect()
    }
}

control_sheet! {
    /// Controls of the marker stage
    pub struct MarkerControls {
        /// Share of the previous landmark position kept each frame
        smoothing: Number,
    }
}

/// Marker stage worker
pub struct MarkerStage {
    marker: Box<dyn FaceMarker>,
    smoother: LandmarkSmoother,
    links: Option<StageLinks>,
}

impl Default for MarkerStage {
    fn default() -> Self {
        Self {
            marker: Box::new(ProportionalMarker),
            smoother: LandmarkSmoother::new(DEFAULT_SMOOTHING as f32),
            links: None,
        }
    }
}

impl StageWorker for MarkerStage {
    type Sheet = MarkerControls;

    fn on_start(&mut self, ctx: &mut WorkerContext<MarkerControls>) -> Result<(), BoxError> {
        self.links = Some(open_links(ctx)?);
        let smoothing = recall(ctx.state(), "smoothing", DEFAULT_SMOOTHING);

        let c = &mut ctx.controls.smoothing;
        c.set_config(NumberConfig::new(0.0, 0.95, 0.05).with_decimals(2));
        c.set_number(Some(smoothing));
        c.set_state(ControlState::Enabled);
        self.smoother.set_factor(c.get_number().unwrap_or(smoothing) as f32);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<MarkerControls>) -> Result<(), BoxError> {
        if let Some(Some(smoothing)) = ctx.controls.smoothing.take_change() {
            self.smoother.set_factor(smoothing as f32);
            remember(ctx, "smoothing", &smoothing)?;
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
            let mut schemes = Vec::with_capacity(record.faces.len());
            let mut raw = Vec::with_capacity(record.faces.len());
            for face in &record.faces {
                let landmarks = self.marker.extract(&frame, &face.rect)?;
                schemes.push(landmarks.scheme());
                raw.push(landmarks.into_points());
            }
            let smoothed = self.smoother.apply(raw, record.is_reemitted);
            for ((face, scheme), points) in record.faces.iter_mut().zip(schemes).zip(smoothed) {
                let landmarks = Landmarks::new(scheme, points)?;
                face.pose = landmarks.estimate_pose();
                face.landmarks = Some(landmarks);
            }
        }
        links.publish(&record)?;
        Ok(())
    }
}
