use std::error::Error as StdError;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync>;

pub type PollResult<T> = std::result::Result<T, PollError>;

/// Failures surfaced while connecting, querying or translating rows.
///
/// Every variant is recovered by the poll loop at cycle granularity; the
/// variants only differ in how they are reported.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("cannot resolve host '{host}'")]
    Resolution {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot connect to {namespace} on '{host}': {message}")]
    Connection {
        host: String,
        namespace: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("query '{query}' failed: {message}")]
    QueryExecution {
        query: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("cannot translate property '{property}': {reason}")]
    Translation { property: String, reason: String },

    /// A single row the provider produced could not be decoded into a record.
    #[error("cannot decode row {index}: {reason}")]
    MalformedRow { index: usize, reason: String },
}

impl PollError {
    pub fn connection(
        host: impl Into<String>,
        namespace: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        PollError::Connection {
            host: host.into(),
            namespace: namespace.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn query(query: impl Into<String>, message: impl Into<String>) -> Self {
        PollError::QueryExecution {
            query: query.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn query_with_source(
        query: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        PollError::QueryExecution {
            query: query.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Stable label used in logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::Resolution { .. } => "resolution",
            PollError::Connection { .. } => "connection",
            PollError::QueryExecution { .. } => "query_execution",
            PollError::Translation { .. } | PollError::MalformedRow { .. } => "translation",
        }
    }

    /// The session is unusable after this error and must be re-established.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            PollError::Resolution { .. } | PollError::Connection { .. }
        )
    }

    /// Only the offending record is lost; the rest of the cycle can proceed.
    pub fn affects_single_record(&self) -> bool {
        matches!(
            self,
            PollError::Translation { .. } | PollError::MalformedRow { .. }
        )
    }

    /// Message followed by every cause, joined with `: `.
    pub fn chain(&self) -> String {
        error_chain(self)
    }
}

pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
