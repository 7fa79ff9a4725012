use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Stopped,
}

struct StopInner {
    stopping: AtomicBool,
    // Dropping the sender disconnects `wake`, which releases every sleeper at once.
    wake_tx: Mutex<Option<Sender<()>>>,
    wake: Receiver<()>,
}

/// Cooperative stop flag shared between a poller and whoever owns it.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (wake_tx, wake) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(StopInner {
                stopping: AtomicBool::new(false),
                wake_tx: Mutex::new(Some(wake_tx)),
                wake,
            }),
        }
    }

    /// Requests a stop. Safe to call repeatedly and from any thread.
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let sender = self
            .inner
            .wake_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Never yields a message; disconnects once a stop is requested, so it can
    /// be raced against other channels in `select!`.
    pub fn wake_channel(&self) -> &Receiver<()> {
        &self.inner.wake
    }

    /// Sleeps for `duration` unless a stop arrives first.
    pub fn sleep(&self, duration: Duration) -> SleepOutcome {
        if self.is_stopping() {
            return SleepOutcome::Stopped;
        }
        match self.inner.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) if !self.is_stopping() => SleepOutcome::Elapsed,
            _ => SleepOutcome::Stopped,
        }
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
