//! Source stage: captures frames, stores them in the image heap and
//! publishes the first record of each frame. Also answers reemit requests.

use super::{StageLinks, recall, remember, stage_args};
use crate::backends::FrameSource;
use crate::frame::{FrameRecord, IMAGE_FRAME};
use facelink_control::controls::{Choice, ControlState, DynamicSingleSwitch, ErrorLabel, Flag, Number, NumberConfig};
use facelink_control::{BoxError, StageWorker, WorkerContext, control_sheet};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Capture size
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Choice for Resolution {
    fn display_name(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

const STANDARD_RESOLUTIONS: [Resolution; 3] = [
    Resolution { width: 320, height: 240 },
    Resolution { width: 640, height: 480 },
    Resolution { width: 1280, height: 720 },
];

control_sheet! {
    /// Controls of the source stage
    pub struct SourceControls {
        /// Stop capturing without stopping the stage
        is_paused: Flag,
        /// Capture rate
        fps: Number,
        /// Capture size
        resolution: DynamicSingleSwitch<Resolution>,
        /// Last capture failure
        error: ErrorLabel,
    }
}

/// Source stage worker
pub struct SourceStage {
    source: Box<dyn FrameSource>,
    links: Option<StageLinks>,
    resolution: Resolution,
    fps: f64,
    paused: bool,
    frame_num: u64,
    started: Instant,
    last_emit: Option<Instant>,
    last_record: Option<FrameRecord>,
}

impl SourceStage {
    /// Stage capturing from `source`
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source,
            links: None,
            resolution: STANDARD_RESOLUTIONS[1],
            fps: 25.0,
            paused: false,
            frame_num: 0,
            started: Instant::now(),
            last_emit: None,
            last_record: None,
        }
    }

    fn apply_changes(&mut self, ctx: &mut WorkerContext<SourceControls>) -> Result<(), BoxError> {
        if let Some(paused) = ctx.controls.is_paused.take_change() {
            self.paused = paused.unwrap_or(false);
            info!(paused = self.paused, "Source pause toggled");
            remember(ctx, "is_paused", &self.paused)?;
        }
        if let Some(Some(fps)) = ctx.controls.fps.take_change() {
            self.fps = fps;
            remember(ctx, "fps", &fps)?;
        }
        if let Some(Some(resolution)) = ctx.controls.resolution.take_change() {
            self.resolution = resolution;
            remember(ctx, "resolution", &resolution)?;
        }
        Ok(())
    }

    fn reemit(&self, links: &StageLinks) -> Result<(), BoxError> {
        if !links.reemit.take() {
            return Ok(());
        }
        if let Some(last) = &self.last_record {
            let again = last.reemitted();
            links.publish(&again)?;
            debug!(frame = again.frame_num, "Frame reemitted");
        }
        Ok(())
    }

    fn capture(&mut self, ctx: &mut WorkerContext<SourceControls>) -> Result<(), BoxError> {
        let Some(links) = &self.links else {
            return Ok(());
        };
        let image = match self.source.read(self.resolution.width, self.resolution.height) {
            Ok(image) => {
                ctx.controls.error.set_error(None);
                image
            }
            Err(e) => {
                warn!(error = %e, "Capture failed");
                ctx.controls.error.set_error(Some(e.to_string()));
                return Ok(());
            }
        };

        let timestamp_ms = self.started.elapsed().as_millis() as u64;
        let mut record = FrameRecord::new(self.frame_num, timestamp_ms, self.fps);
        record.frame_count = self.source.frame_count();
        if let Err(e) = record.put_image(&links.heap, IMAGE_FRAME, &image) {
            warn!(frame = self.frame_num, error = %e, "Frame skipped");
            return Ok(());
        }
        links.publish(&record)?;
        self.last_record = Some(record);
        self.frame_num += 1;
        Ok(())
    }
}

impl StageWorker for SourceStage {
    type Sheet = SourceControls;

    fn on_start(&mut self, ctx: &mut WorkerContext<SourceControls>) -> Result<(), BoxError> {
        let args = stage_args(ctx)?;
        self.links = Some(StageLinks::open(&args)?);

        let configured = Resolution {
            width: args.source.width,
            height: args.source.height,
        };
        self.fps = recall(ctx.state(), "fps", args.source.fps);
        self.paused = recall(ctx.state(), "is_paused", false);
        self.resolution = recall(ctx.state(), "resolution", configured);

        let mut choices = STANDARD_RESOLUTIONS.to_vec();
        for extra in [configured, self.resolution] {
            if !choices.contains(&extra) {
                choices.push(extra);
            }
        }

        let c = &mut ctx.controls;
        c.fps.set_config(NumberConfig::new(1.0, 60.0, 1.0));
        c.fps.set_number(Some(self.fps));
        c.fps.set_state(ControlState::Enabled);
        c.is_paused.set_flag(Some(self.paused));
        c.is_paused.set_state(ControlState::Enabled);
        c.resolution.set_choices(choices, None);
        c.resolution.select_choice(&self.resolution);
        c.resolution.set_state(ControlState::Enabled);
        self.fps = c.fps.get_number().unwrap_or(self.fps);

        info!(resolution = %self.resolution.display_name(), fps = self.fps, "Source ready");
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<SourceControls>) -> Result<(), BoxError> {
        self.apply_changes(ctx)?;
        let Some(links) = &self.links else {
            return Ok(());
        };
        self.reemit(links)?;

        if self.paused || !links.downstream_ready() {
            return Ok(());
        }
        let period = Duration::from_secs_f64(1.0 / self.fps.max(1.0));
        let now = Instant::now();
        if self.last_emit.is_some_and(|last| now.duration_since(last) < period) {
            return Ok(());
        }
        self.last_emit = Some(now);
        self.capture(ctx)
    }
}
