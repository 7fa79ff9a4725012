use crate::daemon::connector::{Connector, Endpoint};
use crate::daemon::poller::{PollState, Poller, PollerSettings, PollerStats, StatsSnapshot};
use crate::daemon::sink::EventSink;
use crate::daemon::stop::{SleepOutcome, StopSignal};
use crate::util::config::InputConfig;
use crate::util::logging::{error, info, warn};
use crate::util::threading::{ThreadHandle, ThreadRegistry};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wmipoll_core::FieldDecorator;

// How often `wait` looks for pollers that exited on their own.
const FINISH_CHECK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    ShutdownRequested,
    InputsFinished,
    StatusDue,
}

struct RunningInput {
    name: String,
    stop: StopSignal,
    stats: Arc<PollerStats>,
    handle: Option<ThreadHandle>,
}

/// Owns one poller thread per configured input.
pub struct InputCoordinator {
    threads: ThreadRegistry,
    connector: Connector,
    sink: Arc<dyn EventSink>,
    inputs: Vec<RunningInput>,
}

impl InputCoordinator {
    pub fn new(threads: ThreadRegistry, connector: Connector, sink: Arc<dyn EventSink>) -> Self {
        Self {
            threads,
            connector,
            sink,
            inputs: Vec::new(),
        }
    }

    pub fn thread_registry(&self) -> ThreadRegistry {
        self.threads.clone()
    }

    pub fn start_all(&mut self, inputs: &[InputConfig]) -> Result<()> {
        for (index, input) in inputs.iter().enumerate() {
            self.start_input(index, input)?;
        }
        Ok(())
    }

    /// Builds the poller for `input` and runs it on a `poller-<name>` thread.
    pub fn start_input(&mut self, index: usize, input: &InputConfig) -> Result<()> {
        let name = input.display_name(index);
        let interval = Duration::try_from_secs_f64(input.interval)
            .with_context(|| format!("input '{name}': invalid interval {}", input.interval))?;

        info!(
            "Registering wmi input '{}' with query '{}' (interval: {:?}, host: {})",
            name, input.query, interval, input.host
        );

        let decorator = FieldDecorator::new()
            .with_type(input.event_type.clone())
            .with_tags(input.tags.iter().cloned())
            .with_fields(input.add_field.clone());
        let stop = StopSignal::new();
        let mut poller = Poller::new(
            PollerSettings::new(name.clone(), input.query.clone(), interval),
            Endpoint::from(input),
            self.connector.clone(),
            Arc::new(decorator),
            Arc::clone(&self.sink),
            stop.clone(),
        );
        let stats = poller.stats();

        let handle = self
            .threads
            .spawn(format!("poller-{name}"), move || poller.run())
            .with_context(|| format!("failed to start poller for input '{name}'"))?;

        self.inputs.push(RunningInput {
            name,
            stop,
            stats,
            handle: Some(handle),
        });
        Ok(())
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|input| input.name.as_str()).collect()
    }

    pub fn stats(&self) -> Vec<(String, StatsSnapshot)> {
        self.inputs
            .iter()
            .map(|input| (input.name.clone(), input.stats.snapshot()))
            .collect()
    }

    /// True once every poller thread has returned (stopped or lost its sink).
    pub fn all_finished(&self) -> bool {
        self.inputs.iter().all(|input| {
            input.handle.as_ref().is_none_or(ThreadHandle::is_finished)
                || input.stats.state() == PollState::Stopped
        })
    }

    /// Blocks until `shutdown` fires, every poller has exited, or `status_every` elapses.
    pub fn wait(&self, shutdown: &StopSignal, status_every: Duration) -> WaitOutcome {
        let deadline = Instant::now() + status_every;
        loop {
            if shutdown.is_stopping() {
                return WaitOutcome::ShutdownRequested;
            }
            if self.all_finished() {
                return WaitOutcome::InputsFinished;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::StatusDue;
            }
            if shutdown.sleep(remaining.min(FINISH_CHECK)) == SleepOutcome::Stopped {
                return WaitOutcome::ShutdownRequested;
            }
        }
    }

    /// Signals every poller, then joins them.
    pub fn stop_all(&mut self) {
        for input in &self.inputs {
            input.stop.stop();
        }
        for input in &mut self.inputs {
            let Some(handle) = input.handle.take() else {
                continue;
            };
            if let Err(e) = handle.join() {
                error!("Poller '{}' panicked: {:?}", input.name, e);
            }
        }
        let stragglers = self.threads.active_thread_names();
        if stragglers.iter().any(|name| name.starts_with("poller-")) {
            warn!("Poller threads still registered after stop: {:?}", stragglers);
        }
        info!("Stopped {} wmi input(s)", self.inputs.len());
    }
}

impl Drop for InputCoordinator {
    fn drop(&mut self) {
        if self.inputs.iter().any(|input| input.handle.is_some()) {
            self.stop_all();
        }
    }
}
