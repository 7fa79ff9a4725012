//! In-memory transport, resolver and sink used by the unit and integration tests.

use crate::daemon::connector::{Endpoint, HostResolver, Rows, Session, Transport};
use crate::daemon::sink::{EventSink, PushOutcome};
use crate::daemon::stop::StopSignal;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use wmipoll_core::{Event, PollError, PollResult, Record};

/// What the scripted session answers to one query execution.
#[derive(Debug, Clone)]
pub enum Reply {
    Rows(Vec<Record>),
    /// The query is rejected before any row is produced.
    Fail(String),
    /// Rows are produced, then the transport fails.
    FailAfter(Vec<Record>, String),
    /// `None` entries come back as rows that cannot be decoded.
    WithMalformed(Vec<Option<Record>>),
    /// The provider never answers; the row stream only ends on stop.
    Stall,
}

#[derive(Default)]
struct ScriptState {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Option<Reply>>,
    executions: Mutex<Vec<Instant>>,
    queries: Mutex<Vec<String>>,
    rows_pulled: AtomicUsize,
    opened: Mutex<Vec<String>>,
    refusals_left: AtomicUsize,
    hang_remote_opens: AtomicBool,
}

impl ScriptState {
    fn next_reply(&self) -> Reply {
        let scripted = self.replies.lock().expect("script poisoned").pop_front();
        scripted
            .or_else(|| self.fallback.lock().expect("script poisoned").clone())
            .unwrap_or(Reply::Rows(Vec::new()))
    }

    fn refuse(&self) -> bool {
        self.refusals_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// Transport whose sessions replay a fixed list of replies, shared across reconnects.
#[derive(Clone)]
pub struct ScriptedTransport {
    state: Arc<ScriptState>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Self {
        let state = ScriptState::default();
        *state.replies.lock().expect("script poisoned") = replies.into();
        Self {
            state: Arc::new(state),
        }
    }

    /// Reply used once the script runs out (default: zero rows).
    pub fn otherwise(self, reply: Reply) -> Self {
        *self.state.fallback.lock().expect("script poisoned") = Some(reply);
        self
    }

    /// The next `count` session opens fail with a connection error.
    pub fn refuse_connections(self, count: usize) -> Self {
        self.state.refusals_left.store(count, Ordering::SeqCst);
        self
    }

    /// Remote opens block until stopped, like an unreachable host that never answers.
    pub fn hang_remote_opens(self) -> Self {
        self.state.hang_remote_opens.store(true, Ordering::SeqCst);
        self
    }

    pub fn executions(&self) -> usize {
        self.state.executions.lock().expect("script poisoned").len()
    }

    pub fn execution_times(&self) -> Vec<Instant> {
        self.state.executions.lock().expect("script poisoned").clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.queries.lock().expect("script poisoned").clone()
    }

    pub fn rows_pulled(&self) -> usize {
        self.state.rows_pulled.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.opened.lock().expect("script poisoned").clone()
    }

    fn open(&self, label: String, host: &str, namespace: &str) -> PollResult<Box<dyn Session>> {
        self.state.opened.lock().expect("script poisoned").push(label);
        if self.state.refuse() {
            return Err(PollError::connection(host, namespace, "access denied"));
        }
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
        }))
    }
}

impl Transport for ScriptedTransport {
    fn open_local(&self, namespace: &str) -> PollResult<Box<dyn Session>> {
        self.open(format!("local:{namespace}"), "localhost", namespace)
    }

    fn open_remote(
        &self,
        host: &str,
        endpoint: &Endpoint,
        stop: &StopSignal,
    ) -> PollResult<Box<dyn Session>> {
        let label = format!(
            "remote:{host}:{}:{}",
            endpoint.namespace,
            endpoint.user.as_deref().unwrap_or("")
        );
        if self.state.hang_remote_opens.load(Ordering::SeqCst) {
            self.state.opened.lock().expect("script poisoned").push(label);
            let _ = stop.wake_channel().recv();
            return Err(PollError::connection(host, &endpoint.namespace, "cancelled"));
        }
        self.open(label, host, &endpoint.namespace)
    }
}

struct ScriptedSession {
    state: Arc<ScriptState>,
}

impl Session for ScriptedSession {
    fn exec_query(&mut self, query: &str, stop: &StopSignal) -> PollResult<Rows<'_>> {
        self.state
            .executions
            .lock()
            .expect("script poisoned")
            .push(Instant::now());
        self.state
            .queries
            .lock()
            .expect("script poisoned")
            .push(query.to_string());

        let reply = self.state.next_reply();
        let (rows, failure): (Vec<Option<Record>>, Option<String>) = match reply {
            Reply::Rows(rows) => (rows.into_iter().map(Some).collect(), None),
            Reply::Fail(message) => return Err(PollError::query(query, message)),
            Reply::FailAfter(rows, message) => {
                (rows.into_iter().map(Some).collect(), Some(message))
            }
            Reply::WithMalformed(rows) => (rows, None),
            Reply::Stall => {
                let stop = stop.clone();
                return Ok(Box::new(std::iter::from_fn(move || {
                    let _ = stop.wake_channel().recv();
                    None::<PollResult<Record>>
                })));
            }
        };

        let state = Arc::clone(&self.state);
        let query = query.to_string();
        let rows = rows.into_iter().enumerate().map(|(index, row)| {
            row.ok_or_else(|| PollError::MalformedRow {
                index,
                reason: "expected a JSON object".to_string(),
            })
        });
        let rows = rows.chain(
            failure.map(move |message| {
                Err(PollError::query_with_source(
                    query,
                    "enumeration aborted",
                    io::Error::new(io::ErrorKind::ConnectionReset, message),
                ))
            }),
        );
        Ok(Box::new(rows.inspect(move |_| {
            state.rows_pulled.fetch_add(1, Ordering::SeqCst);
        })))
    }
}

/// Resolver with a fixed local name and an alias table for remote hosts.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    local: String,
    aliases: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            aliases: HashMap::new(),
        }
    }

    pub fn with_alias(mut self, host: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.aliases.insert(host.into(), canonical.into());
        self
    }
}

impl HostResolver for StaticResolver {
    fn local_hostname(&self) -> String {
        self.local.clone()
    }

    fn canonical_name(&self, host: &str) -> PollResult<String> {
        self.aliases
            .get(host)
            .cloned()
            .ok_or_else(|| PollError::Resolution {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "unknown host"),
            })
    }
}

/// Sink that keeps everything it is given; can request a stop after N events.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
    stop_after: Mutex<Option<(usize, StopSignal)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_after(self, count: usize, stop: StopSignal) -> Self {
        *self.stop_after.lock().expect("sink poisoned") = Some((count, stop));
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("sink poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for CollectingSink {
    fn push(&self, event: Event, _stop: &StopSignal) -> PushOutcome {
        let count = {
            let mut events = self.events.lock().expect("sink poisoned");
            events.push(event);
            events.len()
        };
        if let Some((limit, stop)) = &*self.stop_after.lock().expect("sink poisoned") {
            if count >= *limit {
                stop.stop();
            }
        }
        PushOutcome::Delivered
    }
}
