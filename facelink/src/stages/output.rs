//! Output stage: counts and measures the final frames, optionally saves them,
//! and republishes each record on the preview ring for the host.

use super::{StageLinks, open_links, recall, remember};
use crate::frame::{FrameRecord, IMAGE_FRAME, IMAGE_MERGED};
use crate::image::Image;
use facelink_control::controls::{
    ControlState, ErrorLabel, InfoLabel, PathKind, Paths, PathsConfig, Progress, Signal, Text,
};
use facelink_control::{BoxError, StageWorker, WorkerContext, control_sheet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const FPS_WINDOW: Duration = Duration::from_secs(1);

control_sheet! {
    /// Controls of the output stage
    pub struct OutputControls {
        /// Measured output rate
        fps_info: InfoLabel,
        /// Frames shown since the last counter reset
        frames: Progress,
        /// Zero the frame counter
        reset_counter: Signal,
        /// Directory every output frame is written to
        save_dir: Paths,
        /// Free-form session note
        note: Text,
        /// Why the last frame could not be saved
        error: ErrorLabel,
    }
}

/// Output stage worker
pub struct OutputStage {
    links: Option<StageLinks>,
    save_dir: Option<PathBuf>,
    frames: u64,
    window_start: Instant,
    window_frames: u32,
}

impl Default for OutputStage {
    fn default() -> Self {
        Self {
            links: None,
            save_dir: None,
            frames: 0,
            window_start: Instant::now(),
            window_frames: 0,
        }
    }
}

impl OutputStage {
    fn apply_changes(&mut self, ctx: &mut WorkerContext<OutputControls>) -> Result<(), BoxError> {
        if ctx.controls.reset_counter.take_fired() {
            info!(frames = self.frames, "Frame counter reset");
            self.frames = 0;
            self.show_count(ctx);
        }
        if let Some(dir) = ctx.controls.save_dir.take_change() {
            match &dir {
                Some(d) => info!(dir = %d.display(), "Saving output frames"),
                None => info!("Output frame saving off"),
            }
            self.save_dir = dir;
            ctx.controls.error.set_error(None);
            remember(ctx, "save_dir", &self.save_dir)?;
        }
        if let Some(note) = ctx.controls.note.take_change() {
            remember(ctx, "note", &note)?;
        }
        Ok(())
    }

    fn show_count(&self, ctx: &mut WorkerContext<OutputControls>) {
        let c = &mut ctx.controls.frames;
        c.set_progress(Some((self.frames % 100) as u8));
        c.set_title(Some(format!("{} frames", self.frames)));
    }

    fn measure(&mut self, ctx: &mut WorkerContext<OutputControls>, record: &FrameRecord) {
        self.window_frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed < FPS_WINDOW {
            return;
        }
        let fps = f64::from(self.window_frames) / elapsed.as_secs_f64();
        ctx.controls.fps_info.set_info(vec![
            format!("Output: {fps:.1} fps"),
            format!("Source: {:.1} fps", record.fps),
            format!("Faces: {}", record.faces.len()),
        ]);
        self.window_start = Instant::now();
        self.window_frames = 0;
    }
}

/// Write `image` as `frame_NNNNNN.pnm` under `dir`.
///
/// Returns the written path, or `None` when there was nothing to write.
fn save_frame(dir: &Path, image: Option<&Image>, frame_num: u64) -> std::io::Result<Option<PathBuf>> {
    let Some(bytes) = image.and_then(Image::to_pnm) else {
        return Ok(None);
    };
    let path = dir.join(format!("frame_{frame_num:06}.pnm"));
    std::fs::write(&path, bytes)?;
    Ok(Some(path))
}

/// Mirror the outcome of a save on the error label
fn report_save(error: &mut ErrorLabel, dir: &Path, outcome: std::io::Result<Option<PathBuf>>) {
    match outcome {
        Ok(_) => error.set_error(None),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Could not save frame");
            error.set_error(Some(format!("Cannot save to {}: {}", dir.display(), e)));
        }
    }
}

impl StageWorker for OutputStage {
    type Sheet = OutputControls;

    fn on_start(&mut self, ctx: &mut WorkerContext<OutputControls>) -> Result<(), BoxError> {
        self.links = Some(open_links(ctx)?);
        self.save_dir = recall(ctx.state(), "save_dir", None);
        let note: Option<String> = recall(ctx.state(), "note", None);

        let c = &mut ctx.controls;
        c.fps_info.set_state(ControlState::Enabled);
        c.frames.set_state(ControlState::Enabled);
        c.reset_counter.set_state(ControlState::Enabled);
        c.save_dir.set_config(PathsConfig {
            kind: PathKind::Directory,
            caption: Some("Save frames to".to_string()),
            filter: None,
        });
        c.save_dir.set_path(self.save_dir.clone());
        c.save_dir.set_state(ControlState::Enabled);
        c.note.set_text(note);
        c.note.set_state(ControlState::Enabled);
        self.show_count(ctx);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<OutputControls>) -> Result<(), BoxError> {
        self.apply_changes(ctx)?;

        let Some(links) = &self.links else {
            return Ok(());
        };
        let Some(record) = links.read_input() else {
            return Ok(());
        };
        links.publish(&record)?;
        if let (false, Some(dir)) = (record.is_reemitted, &self.save_dir) {
            let image = record
                .image(&links.heap, IMAGE_MERGED)
                .or_else(|| record.image(&links.heap, IMAGE_FRAME));
            let outcome = save_frame(dir, image.as_ref(), record.frame_num);
            report_save(&mut ctx.controls.error, dir, outcome);
        }
        debug!(frame = record.frame_num, reemitted = record.is_reemitted, "Frame out");

        self.frames += 1;
        self.show_count(ctx);
        self.measure(ctx, &record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facelink_control::controls::{ControlEndpoint, Side};

    #[test]
    fn test_saved_frame_is_named_by_number() {
        let dir = tempfile::tempdir().unwrap();
        let image = Image::filled(4, 2, 3, 200);
        let path = save_frame(dir.path(), Some(&image), 42).unwrap().unwrap();
        assert_eq!(path, dir.path().join("frame_000042.pnm"));
        assert!(std::fs::read(&path).unwrap().starts_with(b"P6"));

        assert!(save_frame(dir.path(), None, 43).unwrap().is_none());
    }

    #[test]
    fn test_unwritable_directory_shows_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file standing where the directory should be
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"").unwrap();

        let mut error = ErrorLabel::new("error", Side::Host);
        let image = Image::filled(2, 2, 3, 0);
        report_save(&mut error, &blocker, save_frame(&blocker, Some(&image), 1));
        assert_eq!(error.state(), ControlState::Enabled);
        assert!(error.get_error().unwrap_or_default().contains("not_a_dir"));

        report_save(&mut error, dir.path(), save_frame(dir.path(), Some(&image), 1));
        assert_eq!(error.get_error(), None);
        assert_eq!(error.state(), ControlState::Disabled);
    }
}
