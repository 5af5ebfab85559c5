//! Swapper stage: generates a replacement for every aligned face.

use super::{StageLinks, open_links, recall, remember};
use crate::backends::{DeviceInfo, DeviceRegistry, FaceSwapper, swapper_for};
use crate::frame::{aligned_key, swapped_key, swapped_mask_key};
use facelink_control::controls::{ControlState, DynamicSingleSwitch, Flag};
use facelink_control::{BoxError, StageWorker, WorkerContext, control_sheet};
use tracing::{info, warn};

control_sheet! {
    /// Controls of the swapper stage
    pub struct SwapperControls {
        /// Device running the generator
        device: DynamicSingleSwitch<DeviceInfo>,
        /// Generate faces; when off, frames pass through untouched
        enabled: Flag,
    }
}

/// Swapper stage worker
pub struct SwapperStage {
    devices: DeviceRegistry,
    swapper: Option<Box<dyn FaceSwapper>>,
    links: Option<StageLinks>,
    enabled: bool,
}

impl SwapperStage {
    /// Stage choosing its device from `devices`
    pub fn new(devices: DeviceRegistry) -> Self {
        Self {
            devices,
            swapper: None,
            links: None,
            enabled: true,
        }
    }
}

impl StageWorker for SwapperStage {
    type Sheet = SwapperControls;

    fn on_start(&mut self, ctx: &mut WorkerContext<SwapperControls>) -> Result<(), BoxError> {
        self.links = Some(open_links(ctx)?);
        let device = recall(ctx.state(), "device", DeviceInfo::cpu());
        self.enabled = recall(ctx.state(), "enabled", true);

        let c = &mut ctx.controls;
        c.device.set_choices(self.devices.available_devices().to_vec(), None);
        if !c.device.select_choice(&device) {
            c.device.select(Some(0));
        }
        c.device.set_state(ControlState::Enabled);
        c.enabled.set_flag(Some(self.enabled));
        c.enabled.set_state(ControlState::Enabled);

        let selected = c.device.selected().cloned().unwrap_or_else(DeviceInfo::cpu);
        info!(device = %selected.name, "Swapper device selected");
        self.swapper = Some(swapper_for(&selected));
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<SwapperControls>) -> Result<(), BoxError> {
        if let Some(Some(device)) = ctx.controls.device.take_change() {
            info!(device = %device.name, "Swapper device selected");
            self.swapper = Some(swapper_for(&device));
            remember(ctx, "device", &device)?;
        }
        if let Some(enabled) = ctx.controls.enabled.take_change() {
            self.enabled = enabled.unwrap_or(false);
            remember(ctx, "enabled", &self.enabled)?;
        }

        let (Some(links), Some(swapper)) = (&self.links, self.swapper.as_mut()) else {
            return Ok(());
        };
        if !links.downstream_ready() {
            return Ok(());
        }
        let Some(mut record) = links.read_input() else {
            return Ok(());
        };

        if self.enabled {
            for i in 0..record.faces.len() {
                let Some(aligned) = record.image(&links.heap, &aligned_key(i)) else {
                    continue;
                };
                let generated = swapper.generate(&aligned)?;
                let stored = record
                    .put_image(&links.heap, &swapped_key(i), &generated.face)
                    .and_then(|_| record.put_image(&links.heap, &swapped_mask_key(i), &generated.mask));
                if let Err(e) = stored {
                    warn!(frame = record.frame_num, face = i, error = %e, "Swapped face dropped");
                }
            }
        }
        links.publish(&record)?;
        Ok(())
    }
}
