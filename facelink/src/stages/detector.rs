//! Detector stage: finds face rectangles in each source frame.

use super::{StageLinks, open_links, recall, remember};
use crate::backends::{DeviceInfo, DeviceRegistry, FaceDetector, detector_for};
use crate::face::FaceRecord;
use crate::frame::IMAGE_FRAME;
use facelink_control::controls::{ControlState, DynamicSingleSwitch, Number, NumberConfig};
use facelink_control::{BoxError, StageWorker, WorkerContext, control_sheet};
use tracing::{debug, info};

const DEFAULT_THRESHOLD: f64 = 0.5;
const DEFAULT_MAX_FACES: f64 = 3.0;

control_sheet! {
    /// Controls of the detector stage
    pub struct DetectorControls {
        /// Device running the detector
        device: DynamicSingleSwitch<DeviceInfo>,
        /// Minimum detection confidence
        threshold: Number,
        /// Most faces kept per frame
        max_faces: Number,
    }
}

/// Detector stage worker
pub struct DetectorStage {
    devices: DeviceRegistry,
    detector: Option<Box<dyn FaceDetector>>,
    links: Option<StageLinks>,
    threshold: f32,
    max_faces: usize,
}

impl DetectorStage {
    /// Stage choosing its device from `devices`
    pub fn new(devices: DeviceRegistry) -> Self {
        Self {
            devices,
            detector: None,
            links: None,
            threshold: DEFAULT_THRESHOLD as f32,
            max_faces: DEFAULT_MAX_FACES as usize,
        }
    }

    fn use_device(&mut self, device: &DeviceInfo) {
        info!(device = %device.name, "Detector device selected");
        self.detector = Some(detector_for(device));
    }
}

impl StageWorker for DetectorStage {
    type Sheet = DetectorControls;

    fn on_start(&mut self, ctx: &mut WorkerContext<DetectorControls>) -> Result<(), BoxError> {
        self.links = Some(open_links(ctx)?);

        let available = self.devices.available_devices().to_vec();
        let device = recall(ctx.state(), "device", DeviceInfo::cpu());
        let threshold = recall(ctx.state(), "threshold", DEFAULT_THRESHOLD);
        let max_faces = recall(ctx.state(), "max_faces", DEFAULT_MAX_FACES);

        let c = &mut ctx.controls;
        c.device.set_choices(available, None);
        if !c.device.select_choice(&device) {
            c.device.select(Some(0));
        }
        c.device.set_state(ControlState::Enabled);
        c.threshold.set_config(NumberConfig::new(0.0, 1.0, 0.05).with_decimals(2));
        c.threshold.set_number(Some(threshold));
        c.threshold.set_state(ControlState::Enabled);
        c.max_faces.set_config(NumberConfig::new(1.0, 10.0, 1.0));
        c.max_faces.set_number(Some(max_faces));
        c.max_faces.set_state(ControlState::Enabled);

        self.threshold = c.threshold.get_number().unwrap_or(threshold) as f32;
        self.max_faces = c.max_faces.get_number().unwrap_or(max_faces) as usize;
        let selected = c.device.selected().cloned().unwrap_or_else(DeviceInfo::cpu);
        self.use_device(&selected);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<DetectorControls>) -> Result<(), BoxError> {
        if let Some(Some(device)) = ctx.controls.device.take_change() {
            self.use_device(&device);
            remember(ctx, "device", &device)?;
        }
        if let Some(Some(threshold)) = ctx.controls.threshold.take_change() {
            self.threshold = threshold as f32;
            remember(ctx, "threshold", &threshold)?;
        }
        if let Some(Some(max_faces)) = ctx.controls.max_faces.take_change() {
            self.max_faces = max_faces as usize;
            remember(ctx, "max_faces", &max_faces)?;
        }

        let (Some(links), Some(detector)) = (&self.links, self.detector.as_mut()) else {
            return Ok(());
        };
        if !links.downstream_ready() {
            return Ok(());
        }
        let Some(mut record) = links.read_input() else {
            return Ok(());
        };

        record.faces.clear();
        if let Some(frame) = record.image(&links.heap, IMAGE_FRAME) {
            let rects = detector.extract(&frame, self.threshold, self.max_faces)?;
            record.faces = rects.into_iter().map(FaceRecord::detected).collect();
        }
        debug!(frame = record.frame_num, faces = record.faces.len(), "Faces detected");
        links.publish(&record)?;
        Ok(())
    }
}
