//! The per-input polling loop.
//!
//! A poller owns one session and runs `Connecting -> Executing -> Translating
//! -> Emitting -> Idle` forever. Any failure in a cycle is reported, followed by
//! a sleep of exactly one interval, and the cycle is retried. The only way out
//! is the stop signal, which is checked at the start of every cycle, after every
//! emitted event, and while sleeping. Sessions also watch it, so a connect or
//! query that never answers is abandoned as soon as a stop arrives.

use crate::daemon::connector::{Connection, Connector, Endpoint};
use crate::daemon::sink::{EventSink, PushOutcome};
use crate::daemon::stop::{SleepOutcome, StopSignal};
use crate::util::logging::{debug, error, info, warn};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wmipoll_core::{Decorate, PollError, translate};

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub name: String,
    pub query: String,
    pub interval: Duration,
}

impl PollerSettings {
    pub fn new(name: impl Into<String>, query: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PollState {
    Connecting = 0,
    Executing = 1,
    Translating = 2,
    Emitting = 3,
    Idle = 4,
    Error = 5,
    Stopped = 6,
}

impl PollState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PollState::Connecting,
            1 => PollState::Executing,
            2 => PollState::Translating,
            3 => PollState::Emitting,
            4 => PollState::Idle,
            5 => PollState::Error,
            _ => PollState::Stopped,
        }
    }
}

/// Counters a poller publishes for whoever supervises it.
#[derive(Debug)]
pub struct PollerStats {
    state: AtomicU8,
    cycles: AtomicU64,
    events: AtomicU64,
    errors: AtomicU64,
    skipped_records: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_cycle_at: Mutex<Option<DateTime<Utc>>>,
}

impl Default for PollerStats {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(PollState::Connecting as u8),
            cycles: AtomicU64::new(0),
            events: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            skipped_records: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_cycle_at: Mutex::new(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub state: PollState,
    pub cycles: u64,
    pub events: u64,
    pub errors: u64,
    pub skipped_records: u64,
    pub last_error: Option<String>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl PollerStats {
    pub fn state(&self) -> PollState {
        PollState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            state: self.state(),
            cycles: self.cycles.load(Ordering::SeqCst),
            events: self.events.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            skipped_records: self.skipped_records.load(Ordering::SeqCst),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
            last_cycle_at: self.last_cycle_at.lock().ok().and_then(|t| *t),
        }
    }

    fn set_state(&self, state: PollState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn record_error(&self, err: &PollError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.chain());
        }
    }

    fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut at) = self.last_cycle_at.lock() {
            *at = Some(Utc::now());
        }
    }
}

enum CycleEnd {
    Completed,
    Stopped,
    SinkClosed,
}

pub struct Poller {
    settings: PollerSettings,
    endpoint: Endpoint,
    connector: Connector,
    decorator: Arc<dyn Decorate>,
    sink: Arc<dyn EventSink>,
    stop: StopSignal,
    stats: Arc<PollerStats>,
    connection: Option<Connection>,
}

impl Poller {
    pub fn new(
        settings: PollerSettings,
        endpoint: Endpoint,
        connector: Connector,
        decorator: Arc<dyn Decorate>,
        sink: Arc<dyn EventSink>,
        stop: StopSignal,
    ) -> Self {
        Self {
            settings,
            endpoint,
            connector,
            decorator,
            sink,
            stop,
            stats: Arc::new(PollerStats::default()),
            connection: None,
        }
    }

    pub fn stats(&self) -> Arc<PollerStats> {
        Arc::clone(&self.stats)
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Runs until the stop signal is raised or every sink consumer is gone.
    pub fn run(&mut self) {
        info!(
            "[{}] Poller started (query: '{}', interval: {:?}, host: {})",
            self.settings.name, self.settings.query, self.settings.interval, self.endpoint.host
        );

        while !self.stop.is_stopping() {
            if self.connection.is_none() {
                self.stats.set_state(PollState::Connecting);
                match self.connector.connect(&self.endpoint, &self.stop) {
                    Ok(connection) => self.connection = Some(connection),
                    Err(_) if self.stop.is_stopping() => break,
                    Err(e) => {
                        self.report(&e);
                        if self.backoff() == SleepOutcome::Stopped {
                            break;
                        }
                        continue;
                    }
                }
            }

            match self.run_cycle() {
                Ok(CycleEnd::Completed) => {
                    self.stats.record_cycle();
                    self.stats.set_state(PollState::Idle);
                    if self.stop.sleep(self.settings.interval) == SleepOutcome::Stopped {
                        break;
                    }
                }
                Ok(CycleEnd::Stopped) => break,
                Ok(CycleEnd::SinkClosed) => {
                    warn!(
                        "[{}] Event queue closed; poller exiting",
                        self.settings.name
                    );
                    break;
                }
                Err(_) if self.stop.is_stopping() => break,
                Err(e) => {
                    if e.invalidates_session() {
                        self.connection = None;
                    }
                    self.report(&e);
                    if self.backoff() == SleepOutcome::Stopped {
                        break;
                    }
                }
            }
        }

        self.connection = None;
        self.stats.set_state(PollState::Stopped);
        info!("[{}] Poller stopped", self.settings.name);
    }

    /// One execute-translate-emit pass over the current result set.
    fn run_cycle(&mut self) -> Result<CycleEnd, PollError> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(CycleEnd::Completed);
        };
        let name = self.settings.name.as_str();
        let stats = self.stats.as_ref();

        stats.set_state(PollState::Executing);
        debug!("[{}] Executing query '{}'", name, self.settings.query);
        let rows = connection
            .session
            .exec_query(&self.settings.query, &self.stop)?;

        for row in rows {
            let record = match row {
                Ok(record) => record,
                Err(e) if e.affects_single_record() => {
                    stats.skipped_records.fetch_add(1, Ordering::SeqCst);
                    stats.record_error(&e);
                    error!("[{}] Skipping row: {}", name, e.chain());
                    continue;
                }
                Err(e) => return Err(e),
            };

            stats.set_state(PollState::Translating);
            let event = match translate(
                &record,
                &connection.resolved_host,
                self.decorator.as_ref(),
            ) {
                Ok(event) => event,
                Err(e) => {
                    stats.skipped_records.fetch_add(1, Ordering::SeqCst);
                    stats.record_error(&e);
                    error!("[{}] Skipping record: {}", name, e.chain());
                    continue;
                }
            };

            stats.set_state(PollState::Emitting);
            match self.sink.push(event, &self.stop) {
                PushOutcome::Delivered => {
                    stats.events.fetch_add(1, Ordering::SeqCst);
                }
                PushOutcome::Stopped => return Ok(CycleEnd::Stopped),
                PushOutcome::Closed => return Ok(CycleEnd::SinkClosed),
            }
            if self.stop.is_stopping() {
                debug!("[{}] Stop requested mid-cycle; dropping remaining rows", name);
                return Ok(CycleEnd::Stopped);
            }
            stats.set_state(PollState::Executing);
        }

        // A session ends its row stream early when stopped.
        if self.stop.is_stopping() {
            return Ok(CycleEnd::Stopped);
        }
        Ok(CycleEnd::Completed)
    }

    fn report(&self, err: &PollError) {
        self.stats.set_state(PollState::Error);
        self.stats.record_error(err);
        error!(
            "[{}] WMI {} error: {}",
            self.settings.name,
            err.kind(),
            err.chain()
        );
    }

    // Flat retry: always exactly one interval, regardless of the error kind.
    fn backoff(&self) -> SleepOutcome {
        self.stop.sleep(self.settings.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testing::{CollectingSink, Reply, ScriptedTransport, StaticResolver};
    use serde_json::json;
    use std::thread;
    use std::time::Instant;
    use wmipoll_core::{NoDecoration, Record};

    fn poller(
        transport: &ScriptedTransport,
        endpoint: Endpoint,
        sink: Arc<dyn EventSink>,
        stop: StopSignal,
        interval: Duration,
    ) -> Poller {
        let resolver = StaticResolver::new("WKS-01").with_alias("srv", "srv.corp.example");
        let connector = Connector::new(Arc::new(transport.clone()), Arc::new(resolver));
        Poller::new(
            PollerSettings::new("test", "select * from Foo", interval),
            endpoint,
            connector,
            Arc::new(NoDecoration),
            sink,
            stop,
        )
    }

    #[test]
    fn emits_one_event_per_record_in_order() {
        let transport = ScriptedTransport::new(vec![Reply::Rows(vec![
            Record::new().with("Name", "a").with("Value", 1i64),
            Record::new().with("Name", "b").with("Value", 2i64),
        ])]);
        let stop = StopSignal::new();
        let sink = Arc::new(CollectingSink::new().stop_after(2, stop.clone()));
        let mut poller = poller(
            &transport,
            Endpoint::default(),
            sink.clone(),
            stop,
            Duration::from_secs(1),
        );

        poller.run();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        for (event, (name, value)) in events.iter().zip([("a", 1), ("b", 2)]) {
            assert_eq!(event.host(), Some("WKS-01"));
            assert_eq!(event.get("Name"), Some(&json!(name)));
            assert_eq!(event.get("Value"), Some(&json!(value)));
            assert_eq!(event.len(), 3);
        }
        assert_eq!(transport.queries(), vec!["select * from Foo".to_string()]);
        assert_eq!(poller.stats().state(), PollState::Stopped);
    }

    #[test]
    fn stop_after_an_emission_drops_the_rest_of_the_cycle() {
        let rows: Vec<Record> = (0..10i64).map(|i| Record::new().with("Id", i)).collect();
        let transport = ScriptedTransport::new(vec![Reply::Rows(rows)]);
        let stop = StopSignal::new();
        let sink = Arc::new(CollectingSink::new().stop_after(3, stop.clone()));
        let mut poller = poller(
            &transport,
            Endpoint::default(),
            sink.clone(),
            stop,
            Duration::from_secs(60),
        );

        poller.run();

        assert_eq!(sink.len(), 3);
        assert_eq!(transport.rows_pulled(), 3, "rows must be pulled lazily");
        assert_eq!(transport.executions(), 1);
    }

    #[test]
    fn query_failure_is_retried_after_one_interval() {
        let transport = ScriptedTransport::new(vec![
            Reply::Fail("invalid query".into()),
            Reply::Rows(vec![Record::new().with("Name", "only")]),
        ]);
        let stop = StopSignal::new();
        let sink = Arc::new(CollectingSink::new().stop_after(1, stop.clone()));
        let interval = Duration::from_millis(80);
        let mut poller = poller(&transport, Endpoint::default(), sink.clone(), stop, interval);

        poller.run();

        assert_eq!(sink.len(), 1);
        let times = transport.execution_times();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= interval);

        let stats = poller.stats().snapshot();
        assert_eq!(stats.errors, 1);
        assert!(
            stats
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("invalid query"))
        );
        // One connection serves both cycles.
        assert_eq!(transport.opened().len(), 1);
    }

    #[test]
    fn failure_mid_enumeration_keeps_events_already_emitted() {
        let transport = ScriptedTransport::new(vec![
            Reply::FailAfter(vec![Record::new().with("Id", 1i64)], "RPC server unavailable".into()),
            Reply::Rows(vec![Record::new().with("Id", 2i64)]),
        ]);
        let stop = StopSignal::new();
        let sink = Arc::new(CollectingSink::new().stop_after(2, stop.clone()));
        let mut poller = poller(
            &transport,
            Endpoint::default(),
            sink.clone(),
            stop,
            Duration::from_millis(10),
        );

        poller.run();

        let ids: Vec<_> = sink.events().iter().map(|e| e.get("Id").cloned()).collect();
        assert_eq!(ids, vec![Some(json!(1)), Some(json!(2))]);
        let stats = poller.stats().snapshot();
        assert_eq!(stats.errors, 1);
        assert!(stats.last_error.unwrap().contains("RPC server unavailable"));
    }

    #[test]
    fn malformed_record_is_skipped_without_aborting_the_cycle() {
        let transport = ScriptedTransport::new(vec![Reply::Rows(vec![
            Record::new().with("Load", f64::NAN),
            Record::new().with("Load", 0.5f64),
        ])]);
        let stop = StopSignal::new();
        let sink = Arc::new(CollectingSink::new().stop_after(1, stop.clone()));
        let mut poller = poller(
            &transport,
            Endpoint::default(),
            sink.clone(),
            stop,
            Duration::from_secs(60),
        );

        poller.run();

        assert_eq!(sink.events()[0].get("Load"), Some(&json!(0.5)));
        let stats = poller.stats().snapshot();
        assert_eq!(stats.skipped_records, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn empty_result_goes_straight_to_idle() {
        let transport = ScriptedTransport::new(vec![Reply::Rows(Vec::new())]);
        let stop = StopSignal::new();
        let sink = Arc::new(CollectingSink::new());
        let mut poller = poller(
            &transport,
            Endpoint::default(),
            sink.clone(),
            stop.clone(),
            Duration::from_secs(60),
        );
        let stats = poller.stats();

        let handle = thread::spawn(move || poller.run());
        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.state() != PollState::Idle && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stats.state(), PollState::Idle);
        assert_eq!(stats.snapshot().cycles, 1);
        assert!(sink.is_empty());

        stop.stop();
        handle.join().unwrap();
        assert_eq!(transport.executions(), 1);
    }

    #[test]
    fn unresolvable_host_is_retried_until_stopped() {
        let transport = ScriptedTransport::new(Vec::new());
        let stop = StopSignal::new();
        let sink = Arc::new(CollectingSink::new());
        let mut poller = poller(
            &transport,
            Endpoint::remote("ghost"),
            sink,
            stop.clone(),
            Duration::from_millis(10),
        );
        let stats = poller.stats();

        let handle = thread::spawn(move || poller.run());
        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.snapshot().errors < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        stop.stop();
        handle.join().unwrap();

        let snapshot = stats.snapshot();
        assert!(snapshot.errors >= 3);
        assert!(snapshot.last_error.unwrap().contains("ghost"));
        assert_eq!(transport.executions(), 0);
    }

    #[test]
    fn rejected_connection_is_retried_with_the_same_endpoint() {
        let transport = ScriptedTransport::new(vec![Reply::Rows(vec![
            Record::new().with("Caption", "Microsoft Windows Server"),
        ])])
        .refuse_connections(2);
        let stop = StopSignal::new();
        let sink = Arc::new(CollectingSink::new().stop_after(1, stop.clone()));
        let endpoint = Endpoint::remote("srv").with_credentials("admin", "pw");
        let mut poller = poller(
            &transport,
            endpoint,
            sink.clone(),
            stop,
            Duration::from_millis(10),
        );

        poller.run();

        assert_eq!(transport.opened().len(), 3);
        assert_eq!(sink.events()[0].host(), Some("srv.corp.example"));
        assert_eq!(poller.stats().snapshot().errors, 2);
    }

    #[test]
    fn undecodable_rows_are_skipped_and_the_cycle_completes() {
        let transport = ScriptedTransport::new(vec![Reply::WithMalformed(vec![
            Some(Record::new().with("Id", 1i64)),
            None,
            Some(Record::new().with("Id", 3i64)),
        ])]);
        let stop = StopSignal::new();
        let sink = Arc::new(CollectingSink::new().stop_after(2, stop.clone()));
        let mut poller = poller(
            &transport,
            Endpoint::default(),
            sink.clone(),
            stop,
            Duration::from_secs(60),
        );

        poller.run();

        let ids: Vec<_> = sink.events().iter().map(|e| e.get("Id").cloned()).collect();
        assert_eq!(ids, vec![Some(json!(1)), Some(json!(3))]);
        assert_eq!(transport.executions(), 1);
        let stats = poller.stats().snapshot();
        assert_eq!(stats.skipped_records, 1);
        assert_eq!(stats.errors, 1);
        assert!(stats.last_error.unwrap().contains("row 1"));
    }

    #[test]
    fn stop_releases_a_query_that_never_answers() {
        let transport = ScriptedTransport::new(vec![Reply::Stall]);
        let stop = StopSignal::new();
        let sink = Arc::new(CollectingSink::new());
        let mut poller = poller(
            &transport,
            Endpoint::default(),
            sink.clone(),
            stop.clone(),
            Duration::from_secs(60),
        );
        let stats = poller.stats();

        let handle = thread::spawn(move || poller.run());
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.executions() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(stats.state(), PollState::Executing);

        let started = Instant::now();
        stop.stop();
        handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.state, PollState::Stopped);
        assert_eq!(snapshot.cycles, 0, "an interrupted cycle is not a completed one");
        assert_eq!(snapshot.errors, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn stop_releases_a_connect_that_never_answers() {
        let transport = ScriptedTransport::new(Vec::new()).hang_remote_opens();
        let stop = StopSignal::new();
        let mut poller = poller(
            &transport,
            Endpoint::remote("srv"),
            Arc::new(CollectingSink::new()),
            stop.clone(),
            Duration::from_secs(60),
        );
        let stats = poller.stats();

        let handle = thread::spawn(move || poller.run());
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.opened().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stats.state(), PollState::Connecting);

        let started = Instant::now();
        stop.stop();
        handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.snapshot().errors, 0);
        assert_eq!(transport.executions(), 0);
    }
}
