use crate::daemon::stop::StopSignal;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use std::time::Duration;
use wmipoll_core::Event;

// Upper bound on how long a full queue can hide a stop request.
const PUSH_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Stop was requested while waiting for queue capacity; the event was dropped.
    Stopped,
    /// Every consumer is gone.
    Closed,
}

/// Destination for translated events, shared by every poller.
pub trait EventSink: Send + Sync {
    fn push(&self, event: Event, stop: &StopSignal) -> PushOutcome;
}

/// Bounded multi-producer queue feeding the output stage.
#[derive(Clone)]
pub struct QueueSink {
    tx: Sender<Event>,
}

impl QueueSink {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for QueueSink {
    fn push(&self, event: Event, stop: &StopSignal) -> PushOutcome {
        let mut pending = event;
        loop {
            match self.tx.send_timeout(pending, PUSH_SLICE) {
                Ok(()) => return PushOutcome::Delivered,
                Err(SendTimeoutError::Disconnected(_)) => return PushOutcome::Closed,
                Err(SendTimeoutError::Timeout(event)) => {
                    if stop.is_stopping() {
                        return PushOutcome::Stopped;
                    }
                    pending = event;
                }
            }
        }
    }
}

pub fn event_queue(capacity: usize) -> (QueueSink, Receiver<Event>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (QueueSink::new(tx), rx)
}
