use crate::daemon::stop::StopSignal;
use crate::util::config::{DEFAULT_HOST, DEFAULT_NAMESPACE, InputConfig};
use crate::util::logging::{debug, info};
use dns_lookup::{AddrInfoHints, getaddrinfo};
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use wmipoll_core::{PollError, PollResult, Record};

/// Where to connect: host, management namespace and optional credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub namespace: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            user: None,
            password: None,
        }
    }
}

impl Endpoint {
    pub fn remote(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Local aliases are served by the local provider without credentials.
    pub fn is_local(&self) -> bool {
        let host = self.host.trim();
        host.is_empty()
            || host == "."
            || host.eq_ignore_ascii_case("localhost")
            || host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }
}

impl From<&InputConfig> for Endpoint {
    fn from(input: &InputConfig) -> Self {
        Self {
            host: input.host.clone(),
            namespace: input.namespace.clone(),
            user: input.user.clone(),
            password: input.password.clone(),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("namespace", &self.namespace)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Rows of one query execution, produced lazily.
pub type Rows<'a> = Box<dyn Iterator<Item = PollResult<Record>> + 'a>;

/// An open connection to a management namespace.
pub trait Session: Send {
    /// Starts `query`. Implementations must end the row stream promptly once
    /// `stop` fires, even while the provider is still silent.
    fn exec_query(&mut self, query: &str, stop: &StopSignal) -> PollResult<Rows<'_>>;
}

/// Opens sessions against a local or remote management provider.
pub trait Transport: Send + Sync {
    fn open_local(&self, namespace: &str) -> PollResult<Box<dyn Session>>;

    /// `host` is the already resolved canonical name. A stop while the
    /// endpoint is being reached fails the open.
    fn open_remote(
        &self,
        host: &str,
        endpoint: &Endpoint,
        stop: &StopSignal,
    ) -> PollResult<Box<dyn Session>>;
}

pub trait HostResolver: Send + Sync {
    fn local_hostname(&self) -> String;
    fn canonical_name(&self, host: &str) -> PollResult<String>;
}

// AI_CANONNAME has the same value in glibc, the BSDs and Winsock.
const AI_CANONNAME: i32 = 0x0002;

/// Uses the operating system's resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn local_hostname(&self) -> String {
        sysinfo::System::host_name().unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    fn canonical_name(&self, host: &str) -> PollResult<String> {
        let host = host.trim().trim_end_matches('.');
        if host.parse::<IpAddr>().is_ok() {
            return Ok(host.to_string());
        }
        let hints = AddrInfoHints {
            flags: AI_CANONNAME,
            ..AddrInfoHints::default()
        };
        let entries = getaddrinfo(Some(host), None, Some(hints)).map_err(|e| {
            PollError::Resolution {
                host: host.to_string(),
                source: io::Error::from(e),
            }
        })?;

        let mut resolved = false;
        let mut canonical = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PollError::Resolution {
                host: host.to_string(),
                source,
            })?;
            resolved = true;
            if let Some(name) = entry.canonname {
                canonical.push(name);
            }
        }
        if !resolved {
            return Err(PollError::Resolution {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
            });
        }
        let name = pick_canonical(host, canonical);
        debug!("Resolved '{}' to canonical name '{}'", host, name);
        Ok(name)
    }
}

/// First non-empty canonical name the resolver reported, else `requested`.
fn pick_canonical(requested: &str, candidates: impl IntoIterator<Item = String>) -> String {
    candidates
        .into_iter()
        .map(|name| name.trim().trim_end_matches('.').to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| requested.to_string())
}

pub struct Connection {
    pub session: Box<dyn Session>,
    pub resolved_host: String,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("resolved_host", &self.resolved_host)
            .finish_non_exhaustive()
    }
}

/// Establishes sessions. Never retries; the poll loop owns the retry policy.
#[derive(Clone)]
pub struct Connector {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn HostResolver>,
}

impl Connector {
    pub fn new(transport: Arc<dyn Transport>, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            transport,
            resolver,
        }
    }

    pub fn connect(&self, endpoint: &Endpoint, stop: &StopSignal) -> PollResult<Connection> {
        if endpoint.is_local() {
            let resolved_host = self.resolver.local_hostname();
            let session = self.transport.open_local(&endpoint.namespace)?;
            info!(
                "Connected to local provider {} as {}",
                endpoint.namespace, resolved_host
            );
            return Ok(Connection {
                session,
                resolved_host,
            });
        }

        let resolved_host = self.resolver.canonical_name(&endpoint.host)?;
        let session = self.transport.open_remote(&resolved_host, endpoint, stop)?;
        info!(
            "Connected to {} on {} (user: {})",
            endpoint.namespace,
            resolved_host,
            endpoint.user.as_deref().unwrap_or("<current>")
        );
        Ok(Connection {
            session,
            resolved_host,
        })
    }
}
