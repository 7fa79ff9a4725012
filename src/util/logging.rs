//! Run-id tagged logging on top of the `log` facade, plus the subscriber setup
//! used by the daemon binary.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
const LOG_FILE_PREFIX: &str = "wmipolld";
const MAX_LOG_FILES: usize = 7;

static RUN_ID: OnceCell<String> = OnceCell::new();

/// First call wins; later calls are ignored.
pub fn set_run_id(run_id: impl Into<String>) {
    let _ = RUN_ID.set(run_id.into());
}

pub fn run_id() -> Option<&'static str> {
    RUN_ID.get().map(String::as_str)
}

#[doc(hidden)]
pub fn run_id_tag() -> &'static str {
    run_id().unwrap_or("-")
}

#[macro_export]
macro_rules! log_with_run_id {
    ($level:expr, $($arg:tt)+) => {{
        if log::log_enabled!($level) {
            log::log!(
                $level,
                "[{}] {}",
                $crate::util::logging::run_id_tag(),
                format_args!($($arg)+)
            );
        }
    }};
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => {
        $crate::log_with_run_id!(log::Level::Error, $($arg)+)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => {
        $crate::log_with_run_id!(log::Level::Warn, $($arg)+)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => {
        $crate::log_with_run_id!(log::Level::Info, $($arg)+)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => {
        $crate::log_with_run_id!(log::Level::Debug, $($arg)+)
    };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => {
        $crate::log_with_run_id!(log::Level::Trace, $($arg)+)
    };
}

pub use crate::{debug, error, info, trace, warn};

/// Filter directive for `-v` repetitions when `RUST_LOG` is unset.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber: stderr always, plus a daily rolling file
/// under `log_dir` when one is given.
pub fn init_subscriber(default_directive: &str, log_dir: Option<&Path>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix("log")
                .max_log_files(MAX_LOG_FILES)
                .build(dir)
                .context("failed to create log file appender")?;
            Some(
                fmt::layer()
                    .with_writer(appender)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_ansi(false)
                    .with_timer(fmt::time::ChronoUtc::new(TIMESTAMP_FORMAT.to_string())),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_timer(fmt::time::ChronoUtc::new(TIMESTAMP_FORMAT.to_string())),
        )
        .with(file_layer)
        .with(env_filter)
        .try_init()
        .context("failed to install log subscriber")
}
