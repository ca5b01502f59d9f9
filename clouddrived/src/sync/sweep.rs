use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::task::JoinHandle;
use tracing::debug;

/// Launches a background task of one kind at most once at a time.
///
/// A trigger that arrives while a run is active is dropped rather than
/// queued; the next trigger after completion starts a fresh run.
#[derive(Debug, Clone)]
pub struct UniqueWorker {
    name: &'static str,
    running: Arc<AtomicBool>,
}

impl UniqueWorker {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn run<F>(&self, task: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(worker = self.name, "already running, trigger dropped");
            return None;
        }

        let guard = RunningGuard(self.running.clone());
        Some(tokio::spawn(async move {
            let _guard = guard;
            task.await;
        }))
    }
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
