//! CIM transport driven through a PowerShell child process.
//!
//! Each query execution starts `Get-CimInstance` and reads one compact JSON
//! object per row from its stdout, so rows reach the poller as they are
//! produced. Query text, namespace and credentials travel in the child's
//! environment; the script itself is passed with `-EncodedCommand`.
//!
//! Every execution is a fresh process, and a remote execution opens its own
//! `New-CimSession` inside it. The `CimSession` value only carries the target;
//! reachability and credentials are checked once by `open_remote`. A stop
//! kills whatever child is running, whether it is streaming rows or still
//! silent.

use crate::daemon::connector::{Endpoint, Rows, Session, Transport};
use crate::daemon::stop::{SleepOutcome, StopSignal};
use crate::util::logging::{debug, trace};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crossbeam_channel::{Receiver, select};
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use wmipoll_core::{PollError, PollResult, PropertyValue, Record};

// Rows buffered ahead of the poller before the reader thread waits.
const ROW_BUFFER: usize = 64;
const EXIT_POLL: Duration = Duration::from_millis(20);

const ENV_QUERY: &str = "CIMQ_QUERY";
const ENV_NAMESPACE: &str = "CIMQ_NAMESPACE";
const ENV_HOST: &str = "CIMQ_HOST";
const ENV_USER: &str = "CIMQ_USER";
const ENV_PASSWORD: &str = "CIMQ_PASSWORD";

const PREAMBLE: &str = "$ErrorActionPreference = 'Stop'\n\
[Console]::OutputEncoding = [System.Text.Encoding]::UTF8\n";

const OPEN_REMOTE_SESSION: &str = "$opts = @{ ComputerName = $env:CIMQ_HOST }\n\
if ($env:CIMQ_USER) {\n\
  $secret = ConvertTo-SecureString $env:CIMQ_PASSWORD -AsPlainText -Force\n\
  $opts.Credential = New-Object System.Management.Automation.PSCredential($env:CIMQ_USER, $secret)\n\
}\n\
$session = New-CimSession @opts\n";

const EMIT_ROWS: &str = "| ForEach-Object {\n\
  $row = [ordered]@{}\n\
  foreach ($p in $_.CimInstanceProperties) { $row[$p.Name] = $p.Value }\n\
  $row | ConvertTo-Json -Compress -Depth 8\n\
}\n";

#[derive(Debug, Clone)]
struct RemoteTarget {
    host: String,
    user: Option<String>,
    password: Option<String>,
}

/// Opens sessions by spawning `program` (`powershell` or `pwsh`).
#[derive(Debug, Clone)]
pub struct CimTransport {
    program: String,
}

impl CimTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for CimTransport {
    fn default() -> Self {
        Self::new("powershell")
    }
}

impl Transport for CimTransport {
    fn open_local(&self, namespace: &str) -> PollResult<Box<dyn Session>> {
        Ok(Box::new(CimSession {
            program: self.program.clone(),
            namespace: namespace.to_string(),
            remote: None,
        }))
    }

    fn open_remote(
        &self,
        host: &str,
        endpoint: &Endpoint,
        stop: &StopSignal,
    ) -> PollResult<Box<dyn Session>> {
        let session = CimSession {
            program: self.program.clone(),
            namespace: endpoint.namespace.clone(),
            remote: Some(RemoteTarget {
                host: host.to_string(),
                user: endpoint.user.clone(),
                password: endpoint.password.clone(),
            }),
        };
        session.check_reachable(stop)?;
        Ok(Box::new(session))
    }
}

struct CimSession {
    program: String,
    namespace: String,
    remote: Option<RemoteTarget>,
}

impl CimSession {
    fn host(&self) -> &str {
        self.remote.as_ref().map_or("localhost", |r| r.host.as_str())
    }

    fn command(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "-NoLogo",
            "-NoProfile",
            "-NonInteractive",
            "-EncodedCommand",
            &encode_script(script),
        ])
        .env(ENV_NAMESPACE, &self.namespace)
        .stdin(Stdio::null());
        if let Some(remote) = &self.remote {
            cmd.env(ENV_HOST, &remote.host);
            match &remote.user {
                Some(user) => {
                    cmd.env(ENV_USER, user)
                        .env(ENV_PASSWORD, remote.password.as_deref().unwrap_or(""));
                }
                None => {
                    cmd.env_remove(ENV_USER).env_remove(ENV_PASSWORD);
                }
            }
        }
        cmd
    }

    /// Establishes and discards a remote session to surface auth and reachability errors.
    fn check_reachable(&self, stop: &StopSignal) -> PollResult<()> {
        let script = format!("{PREAMBLE}{OPEN_REMOTE_SESSION}Remove-CimSession $session\n");
        let start_failed = |e: io::Error| PollError::Connection {
            host: self.host().to_string(),
            namespace: self.namespace.clone(),
            message: format!("failed to start {}", self.program),
            source: Some(Box::new(e)),
        };
        let mut child = self
            .command(&script)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(start_failed)?;
        let stderr = child.stderr.take().map(drain_stderr);

        let status = match wait_or_kill(&mut child, stop) {
            Ok(Some(status)) => status,
            Ok(None) => {
                return Err(PollError::connection(
                    self.host(),
                    &self.namespace,
                    "cancelled while connecting",
                ));
            }
            Err(e) => {
                return Err(PollError::Connection {
                    host: self.host().to_string(),
                    namespace: self.namespace.clone(),
                    message: "failed to collect session check".to_string(),
                    source: Some(Box::new(e)),
                });
            }
        };
        if status.success() {
            debug!("CIM session check against {} succeeded", self.host());
            return Ok(());
        }
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Err(PollError::connection(
            self.host(),
            &self.namespace,
            failure_message(&stderr, status.code()),
        ))
    }

    fn query_script(&self) -> String {
        match self.remote {
            Some(_) => format!(
                "{PREAMBLE}{OPEN_REMOTE_SESSION}\
                 Get-CimInstance -CimSession $session -Namespace $env:CIMQ_NAMESPACE -Query $env:CIMQ_QUERY {EMIT_ROWS}\
                 Remove-CimSession $session\n"
            ),
            None => format!(
                "{PREAMBLE}Get-CimInstance -Namespace $env:CIMQ_NAMESPACE -Query $env:CIMQ_QUERY {EMIT_ROWS}"
            ),
        }
    }
}

impl Session for CimSession {
    fn exec_query(&mut self, query: &str, stop: &StopSignal) -> PollResult<Rows<'_>> {
        let mut child = self
            .command(&self.query_script())
            .env(ENV_QUERY, query)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                PollError::query_with_source(query, format!("failed to start {}", self.program), e)
            })?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PollError::query(query, "child process has no stdout"));
        };
        let stderr = child.stderr.take().map(drain_stderr);
        let lines = read_lines(stdout);

        Ok(Box::new(CimRows {
            query: query.to_string(),
            child: Some(child),
            lines,
            stderr,
            stop: stop.clone(),
            index: 0,
        }))
    }
}

/// Row iterator over a running query; dropping it kills the child.
struct CimRows {
    query: String,
    child: Option<Child>,
    lines: Receiver<io::Result<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    stop: StopSignal,
    index: usize,
}

enum Next {
    Line(Vec<u8>),
    ReadFailed(io::Error),
    Eof,
    Stopped,
}

impl CimRows {
    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn next_line(&self) -> Next {
        select! {
            recv(self.lines) -> msg => match msg {
                Ok(Ok(line)) => Next::Line(line),
                Ok(Err(e)) => Next::ReadFailed(e),
                Err(_) => Next::Eof,
            },
            recv(self.stop.wake_channel()) -> _ => Next::Stopped,
        }
    }

    fn finish(&mut self) -> Option<PollResult<Record>> {
        let mut child = self.child.take()?;
        let status = match wait_or_kill(&mut child, &self.stop) {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                return Some(Err(PollError::query_with_source(
                    &self.query,
                    "failed to collect query process",
                    e,
                )));
            }
        };
        if status.success() {
            trace!("Query process exited cleanly after {} row(s)", self.index);
            return None;
        }
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Some(Err(PollError::query(
            &self.query,
            failure_message(&stderr, status.code()),
        )))
    }
}

impl Iterator for CimRows {
    type Item = PollResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.child.as_ref()?;
        loop {
            match self.next_line() {
                Next::Line(line) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let index = self.index;
                    self.index += 1;
                    return Some(parse_row(index, text));
                }
                Next::ReadFailed(e) => {
                    self.kill();
                    return Some(Err(PollError::query_with_source(
                        &self.query,
                        "failed to read query output",
                        e,
                    )));
                }
                Next::Eof => return self.finish(),
                Next::Stopped => {
                    debug!("Stop requested; killing query process");
                    self.kill();
                    return None;
                }
            }
        }
    }
}

impl Drop for CimRows {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Feeds stdout lines into a bounded channel from a helper thread.
///
/// The thread ends at EOF, on a read error, or once the receiver is gone.
fn read_lines(stdout: ChildStdout) -> Receiver<io::Result<Vec<u8>>> {
    let (tx, rx) = crossbeam_channel::bounded(ROW_BUFFER);
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => return,
                Ok(_) => {
                    if tx.send(Ok(line)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            }
        }
    });
    rx
}

fn drain_stderr<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// Waits for `child` to exit. Returns `None` after killing it if `stop` fires first.
fn wait_or_kill(child: &mut Child, stop: &StopSignal) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if stop.sleep(EXIT_POLL) == SleepOutcome::Stopped {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
    }
}

fn parse_row(index: usize, line: &str) -> PollResult<Record> {
    let malformed = |reason: String| PollError::MalformedRow { index, reason };
    let value: Value = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(name, value)| (name, PropertyValue::from_json(value)))
            .collect()),
        other => Err(malformed(format!("expected a JSON object, got {other}"))),
    }
}

fn failure_message(stderr: &[u8], code: Option<i32>) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    match (text.is_empty(), code) {
        (false, _) => text.to_string(),
        (true, Some(code)) => format!("process exited with status {code}"),
        (true, None) => "process terminated by signal".to_string(),
    }
}

/// PowerShell's `-EncodedCommand` takes base64 over UTF-16LE.
fn encode_script(script: &str) -> String {
    let bytes: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    STANDARD.encode(bytes)
}
