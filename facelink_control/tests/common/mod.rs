//! In-process worker launcher and pumping helpers for supervisor tests

#![allow(dead_code)]

use facelink_control::{
    ControlResult, ControlSheet, KvStore, MessagePipe, StageWorker, Supervisor, WorkerLauncher,
    WorkerProcess, run_worker,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Runs each worker on a thread over a socket pair
pub struct ThreadLauncher<F> {
    factory: F,
    launches: Arc<AtomicUsize>,
}

impl<F, W> ThreadLauncher<F>
where
    F: FnMut() -> W + Send,
    W: StageWorker,
{
    pub fn new(factory: F) -> (Self, Arc<AtomicUsize>) {
        let launches = Arc::new(AtomicUsize::new(0));
        (
            Self {
                factory,
                launches: launches.clone(),
            },
            launches,
        )
    }
}

impl<F, W> WorkerLauncher for ThreadLauncher<F>
where
    F: FnMut() -> W + Send,
    W: StageWorker,
{
    fn launch(&mut self, _stage: &str) -> ControlResult<(Box<dyn WorkerProcess>, MessagePipe)> {
        let (host, worker_end) = MessagePipe::pair()?;
        let worker = (self.factory)();
        let handle = std::thread::spawn(move || {
            let _ = run_worker(worker, worker_end, Duration::from_millis(1));
        });
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok((Box::new(ThreadWorker { handle: Some(handle) }), host))
    }
}

/// Worker thread handle
pub struct ThreadWorker {
    pub handle: Option<JoinHandle<()>>,
}

impl WorkerProcess for ThreadWorker {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn terminate(&mut self) {}

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn memory_store() -> Arc<Mutex<KvStore>> {
    Arc::new(Mutex::new(KvStore::in_memory()))
}

/// Pump `sup` until `done` holds, panicking after five seconds
pub fn pump_until<S, P>(sup: &mut Supervisor<S>, what: &str, mut done: P)
where
    S: ControlSheet,
    P: FnMut(&Supervisor<S>) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        sup.process_messages().unwrap();
        if done(sup) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}
