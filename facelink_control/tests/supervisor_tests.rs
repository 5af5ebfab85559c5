//! Supervisor lifecycle tests against workers running on threads

mod common;

use common::{ThreadLauncher, memory_store, pump_until};
use facelink_control::controls::{ControlEndpoint, ControlState, Flag, Number, NumberConfig};
use facelink_control::{
    BoxError, ControlResult, EmptySheet, Lifecycle, MessagePipe, StageWorker, Supervisor,
    WorkerContext, WorkerLauncher, WorkerProcess, control_sheet, state_key,
};
use std::sync::atomic::Ordering;
use std::time::Duration;

control_sheet! {
    pub struct PlayerControls {
        is_paused: Flag,
        fps: Number,
    }
}

/// Publishes its controls on start and persists accepted fps proposals
struct Player;

impl StageWorker for Player {
    type Sheet = PlayerControls;

    fn on_start(&mut self, ctx: &mut WorkerContext<PlayerControls>) -> Result<(), BoxError> {
        let fps = ctx.state().get::<f64>("fps").unwrap_or(5.0);
        let c = &mut ctx.controls;
        c.fps.set_config(NumberConfig::new(0.0, 10.0, 1.0));
        c.fps.set_number(Some(fps));
        c.fps.set_state(ControlState::Enabled);
        c.is_paused.set_flag(Some(false));
        c.is_paused.set_state(ControlState::Enabled);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<PlayerControls>) -> Result<(), BoxError> {
        if let Some(Some(fps)) = ctx.controls.fps.take_change() {
            ctx.state_mut().set("fps", &fps)?;
            ctx.save_state();
        }
        if let Some(paused) = ctx.controls.is_paused.take_change() {
            ctx.set_busy(paused == Some(true));
        }
        Ok(())
    }
}

/// Counts its boots in the persisted state and restarts until it reached
/// the count given as start argument
struct BootCounter;

impl StageWorker for BootCounter {
    type Sheet = EmptySheet;

    fn on_start(&mut self, ctx: &mut WorkerContext<EmptySheet>) -> Result<(), BoxError> {
        let boots = ctx.state().get::<u32>("boots").unwrap_or(0) + 1;
        ctx.state_mut().set("boots", &boots)?;
        ctx.save_state();
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<EmptySheet>) -> Result<(), BoxError> {
        let target = ctx.args::<u32>().unwrap_or(0);
        if ctx.state().get::<u32>("boots").unwrap_or(0) < target {
            ctx.restart();
        }
        Ok(())
    }
}

/// Saves some state, then fails
struct Faulty;

impl StageWorker for Faulty {
    type Sheet = EmptySheet;

    fn on_start(&mut self, ctx: &mut WorkerContext<EmptySheet>) -> Result<(), BoxError> {
        ctx.state_mut().set("poisoned", &true)?;
        ctx.save_state();
        Ok(())
    }

    fn on_tick(&mut self, _ctx: &mut WorkerContext<EmptySheet>) -> Result<(), BoxError> {
        Err("camera unplugged".into())
    }
}

/// Panics on its first tick
struct Panicky;

impl StageWorker for Panicky {
    type Sheet = EmptySheet;

    fn on_start(&mut self, _ctx: &mut WorkerContext<EmptySheet>) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_tick(&mut self, _ctx: &mut WorkerContext<EmptySheet>) -> Result<(), BoxError> {
        panic!("index out of range");
    }
}

fn player() -> Supervisor<PlayerControls> {
    let (launcher, _) = ThreadLauncher::new(|| Player);
    Supervisor::new("player", Box::new(launcher), memory_store())
}

#[test]
fn test_start_mirrors_worker_controls() {
    let mut sup = player();
    assert_eq!(sup.lifecycle(), Lifecycle::Stopped);

    sup.start().unwrap();
    assert!(sup.is_starting());
    pump_until(&mut sup, "controls", |s| {
        s.is_started() && s.controls().fps.get_number() == Some(5.0)
    });
    assert_eq!(sup.controls().fps.state(), ControlState::Enabled);
    assert_eq!(sup.controls().fps.config().max, 10.0);
    assert_eq!(sup.controls().is_paused.get_flag(), Some(false));

    sup.stop(false);
    assert!(sup.is_stopping());
    pump_until(&mut sup, "stop", |s| s.is_stopped());
}

#[test]
fn test_client_proposal_is_clamped() {
    let mut sup = player();
    sup.start().unwrap();
    pump_until(&mut sup, "enabled", |s| s.controls().fps.state() == ControlState::Enabled);

    assert!(sup.controls_mut().fps.set_number(Some(15.0)));
    pump_until(&mut sup, "persisted fps", |s| {
        s.persisted_state().get::<f64>("fps") == Some(10.0)
    });
    assert_eq!(sup.controls().fps.get_number(), Some(10.0));
    sup.stop(true);
}

#[test]
fn test_controls_reset_across_restart() {
    let mut sup = player();
    sup.start().unwrap();
    pump_until(&mut sup, "controls", |s| s.controls().is_paused.get_flag() == Some(false));

    sup.stop(false);
    pump_until(&mut sup, "stop", |s| s.is_stopped());
    assert_eq!(sup.controls().fps.get_number(), None);
    assert_eq!(sup.controls().is_paused.get_flag(), None);
    assert_eq!(sup.controls().fps.state(), ControlState::Disabled);

    sup.start().unwrap();
    assert_eq!(sup.controls().fps.get_number(), None);
    pump_until(&mut sup, "resent", |s| s.controls().fps.get_number() == Some(5.0));
    sup.stop(true);
}

#[test]
fn test_forced_stop_before_started() {
    let mut sup = player();
    sup.start().unwrap();
    sup.stop(true);
    assert!(sup.is_stopped());
    assert!(!sup.is_busy());

    // A graceful stop issued while starting also settles
    sup.start().unwrap();
    sup.stop(false);
    pump_until(&mut sup, "stop", |s| s.is_stopped());
}

#[test]
fn test_busy_follows_worker_and_clears_on_stop() {
    let mut sup = player();
    sup.start().unwrap();
    pump_until(&mut sup, "enabled", |s| s.controls().is_paused.state() == ControlState::Enabled);

    sup.controls_mut().is_paused.set_flag(Some(true));
    pump_until(&mut sup, "busy", |s| s.is_busy());

    sup.stop(false);
    assert!(!sup.is_busy());
    pump_until(&mut sup, "stop", |s| s.is_stopped());
}

#[test]
fn test_worker_requested_restart() {
    let (launcher, launches) = ThreadLauncher::new(|| BootCounter);
    let mut sup = Supervisor::<EmptySheet>::new("counter", Box::new(launcher), memory_store())
        .with_args(&2u32)
        .unwrap();
    sup.start().unwrap();
    pump_until(&mut sup, "second boot", |s| {
        s.is_started() && s.persisted_state().get::<u32>("boots") == Some(2)
    });
    assert_eq!(launches.load(Ordering::SeqCst), 2);
    sup.stop(true);
}

#[test]
fn test_reset_state_deferred_until_stop() {
    let store = memory_store();
    let mut initial = facelink_control::WorkerState::default();
    initial.set("boots", &7u32).unwrap();
    store.lock().set(&state_key("counter"), &initial).unwrap();

    let (launcher, launches) = ThreadLauncher::new(|| BootCounter);
    let mut sup = Supervisor::<EmptySheet>::new("counter", Box::new(launcher), store);
    sup.start().unwrap();
    pump_until(&mut sup, "eighth boot", |s| {
        s.is_started() && s.persisted_state().get::<u32>("boots") == Some(8)
    });

    sup.reset_state().unwrap();
    assert!(sup.is_stopping());
    pump_until(&mut sup, "fresh boot", |s| {
        s.is_started() && s.persisted_state().get::<u32>("boots") == Some(1)
    });
    assert_eq!(launches.load(Ordering::SeqCst), 2);

    sup.stop(false);
    pump_until(&mut sup, "stop", |s| s.is_stopped());
    sup.reset_state().unwrap();
    assert!(sup.persisted_state().is_empty());
}

#[test]
fn test_worker_error_discards_state() {
    let (launcher, _) = ThreadLauncher::new(|| Faulty);
    let store = memory_store();
    let mut sup = Supervisor::<EmptySheet>::new("faulty", Box::new(launcher), store.clone());
    sup.start().unwrap();
    pump_until(&mut sup, "failure", |s| s.is_stopped());

    assert_eq!(sup.last_error(), Some("camera unplugged"));
    assert!(!store.lock().contains(&state_key("faulty")));
}

#[test]
fn test_worker_panic_is_reported() {
    let (launcher, _) = ThreadLauncher::new(|| Panicky);
    let mut sup = Supervisor::<EmptySheet>::new("panicky", Box::new(launcher), memory_store());
    sup.start().unwrap();
    pump_until(&mut sup, "failure", |s| s.is_stopped());
    let error = sup.last_error().unwrap_or_default();
    assert!(error.contains("index out of range"), "{}", error);
}

/// Launcher whose worker reads the boot frame and vanishes
struct VanishingLauncher;

impl WorkerLauncher for VanishingLauncher {
    fn launch(&mut self, _stage: &str) -> ControlResult<(Box<dyn WorkerProcess>, MessagePipe)> {
        let (host, mut worker_end) = MessagePipe::pair()?;
        let handle = std::thread::spawn(move || {
            let _ = worker_end.recv_timeout::<facelink_control::Envelope>(Duration::from_secs(1));
        });
        Ok((Box::new(common::ThreadWorker { handle: Some(handle) }), host))
    }
}

#[test]
fn test_vanished_worker_is_finalized() {
    let mut sup = Supervisor::<EmptySheet>::new("ghost", Box::new(VanishingLauncher), memory_store());
    sup.start().unwrap();
    pump_until(&mut sup, "finalize", |s| s.is_stopped());
    assert_eq!(sup.last_error(), None);
}

#[test]
fn test_enabled_flag_is_remembered() {
    let sup = player();
    assert!(sup.was_enabled());
    sup.set_enabled(false).unwrap();
    assert!(!sup.was_enabled());
    sup.set_enabled(true).unwrap();
    assert!(sup.was_enabled());
}

/// Launcher whose worker fails right after boot and closes its end
struct FailingLauncher;

impl WorkerLauncher for FailingLauncher {
    fn launch(&mut self, _stage: &str) -> ControlResult<(Box<dyn WorkerProcess>, MessagePipe)> {
        let (host, mut worker_end) = MessagePipe::pair()?;
        let handle = std::thread::spawn(move || {
            let _ = worker_end.recv_timeout::<facelink_control::Envelope>(Duration::from_secs(1));
            let _ = worker_end.send(&facelink_control::Envelope::Stop {
                error: Some("camera unplugged".into()),
                restart: false,
            });
        });
        Ok((Box::new(common::ThreadWorker { handle: Some(handle) }), host))
    }
}

#[test]
fn test_final_stop_survives_closed_pipe() {
    let mut sup = Supervisor::<EmptySheet>::new("closer", Box::new(FailingLauncher), memory_store());
    sup.start().unwrap();
    // Let the worker send its stop and exit before the first pump
    std::thread::sleep(Duration::from_millis(50));
    pump_until(&mut sup, "finalize", |s| s.is_stopped());
    assert_eq!(sup.last_error(), Some("camera unplugged"));
}
