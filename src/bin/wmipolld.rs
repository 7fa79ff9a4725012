use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use wmipoll::daemon::cim::CimTransport;
use wmipoll::daemon::connector::{Connector, SystemResolver};
use wmipoll::daemon::coordinator::{InputCoordinator, WaitOutcome};
use wmipoll::daemon::output::spawn_output_stage;
use wmipoll::daemon::sink::event_queue;
use wmipoll::daemon::stop::StopSignal;
use wmipoll::util::config::AppConfig;
use wmipoll::util::logging;
use wmipoll::util::threading::ThreadRegistry;
use wmipoll::util::{paths, run_id};
use wmipoll::{debug, error, info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "wmipolld",
    version,
    about = "Polls WMI/CIM queries and writes each row as a JSON line"
)]
struct Cli {
    /// Config file to load instead of <workspace>/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Reuse a run id handed down by a supervisor
    #[arg(long, value_name = "ID")]
    run_id: Option<String>,
}

fn load_app_config(cli: &Cli) -> Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => AppConfig::load().context("failed to load configuration")?,
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn ensure_workspace_dir(workspace_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(workspace_dir).with_context(|| {
        format!(
            "failed to create workspace directory {}",
            workspace_dir.display()
        )
    })
}

fn is_process_running(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

fn write_pid_file(pid_file: &Path) -> Result<()> {
    if pid_file.exists() {
        match std::fs::read_to_string(pid_file) {
            Ok(content) => {
                if let Ok(existing_pid) = content.trim().parse::<u32>() {
                    if existing_pid != std::process::id() && is_process_running(existing_pid) {
                        anyhow::bail!("wmipolld is already running (PID: {existing_pid})");
                    }
                    info!(
                        "Removing stale PID file (process {} no longer exists)",
                        existing_pid
                    );
                }
            }
            Err(_) => info!("Removing unreadable PID file"),
        }
        let _ = std::fs::remove_file(pid_file);
    }

    std::fs::write(pid_file, std::process::id().to_string())
        .with_context(|| format!("failed to write PID file {}", pid_file.display()))
}

fn verify_pid_file(pid_file: &Path) -> Result<()> {
    let current_pid = std::process::id();
    let content = std::fs::read_to_string(pid_file)
        .context("failed to read PID file for verification")?;
    let file_pid: u32 = content
        .trim()
        .parse()
        .with_context(|| format!("PID file contains invalid PID format: {content}"))?;
    if file_pid != current_pid {
        anyhow::bail!("PID file verification failed: expected {current_pid}, found {file_pid}");
    }
    info!("PID file verification successful (PID: {})", current_pid);
    Ok(())
}

fn cleanup_pid_file(pid_file: &Path) {
    let current_pid = std::process::id();
    match std::fs::read_to_string(pid_file) {
        Ok(content) => match content.trim().parse::<u32>() {
            Ok(file_pid) if file_pid == current_pid => {
                if let Err(e) = std::fs::remove_file(pid_file) {
                    error!("Failed to remove PID file: {}", e);
                } else {
                    info!("Cleaned up PID file");
                }
            }
            Ok(file_pid) => error!(
                "PID file contains different PID ({}) than current process ({}); leaving it",
                file_pid, current_pid
            ),
            Err(e) => error!("PID file contains invalid PID: {}. Error: {}", content, e),
        },
        Err(e) => error!("Failed to read PID file for cleanup: {}", e),
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_app_config(&cli)?;
    ensure_workspace_dir(&config.workspace_dir)?;

    let log_dir = paths::log_dir(&config.workspace_dir);
    logging::init_subscriber(
        logging::default_directive(cli.verbose),
        config.log_to_file.then_some(log_dir.as_path()),
    )?;

    let run_id = match cli.run_id.as_deref() {
        Some(id) => run_id::parse_run_id(id)?,
        None => run_id::generate(),
    };
    logging::set_run_id(run_id);

    let pid_file = paths::pid_file(&config.workspace_dir);
    write_pid_file(&pid_file)?;
    verify_pid_file(&pid_file)?;

    let result = serve(&config);
    cleanup_pid_file(&pid_file);
    result
}

fn serve(config: &AppConfig) -> Result<()> {
    info!(
        "Starting wmipolld with {} input(s), queue capacity {}",
        config.inputs.len(),
        config.queue_capacity
    );
    if config.inputs.is_empty() {
        warn!("No inputs configured; nothing will be polled");
    }

    let threads = ThreadRegistry::new();
    let (sink, rx) = event_queue(config.queue_capacity);
    let output = spawn_output_stage(&threads, rx, std::io::stdout())?;

    let connector = Connector::new(
        Arc::new(CimTransport::new(config.powershell.clone())),
        Arc::new(SystemResolver),
    );
    let mut coordinator = InputCoordinator::new(threads.clone(), connector, Arc::new(sink));

    let shutdown = StopSignal::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received, stopping inputs");
            shutdown.stop();
        })
        .context("failed to install Ctrl+C handler")?;
    }

    if let Err(e) = coordinator.start_all(&config.inputs) {
        coordinator.stop_all();
        return Err(e);
    }

    loop {
        match coordinator.wait(&shutdown, STATUS_INTERVAL) {
            WaitOutcome::ShutdownRequested => break,
            WaitOutcome::InputsFinished => {
                warn!("Every input has stopped; shutting down");
                break;
            }
            WaitOutcome::StatusDue => {
                for (name, stats) in coordinator.stats() {
                    debug!(
                        "[{}] state={:?} cycles={} events={} errors={}",
                        name,
                        stats.state,
                        stats.cycles,
                        stats.events,
                        stats.errors
                    );
                }
            }
        }
    }

    coordinator.stop_all();
    let summary = coordinator.stats();
    // The coordinator holds the last queue sender; the output stage drains and exits once it is gone.
    drop(coordinator);
    if let Err(e) = output.join() {
        error!("Output stage panicked: {:?}", e);
    }

    for (name, stats) in summary {
        info!(
            "Input '{}': {} cycle(s), {} event(s), {} error(s), {} skipped record(s)",
            name,
            stats.cycles,
            stats.events,
            stats.errors,
            stats.skipped_records
        );
    }
    let leftover = threads.active_thread_names();
    if !leftover.is_empty() {
        warn!("Threads still registered at exit: {:?}", leftover);
    }
    info!("wmipolld shutdown complete");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("wmipolld failed: {:#}", e);
        eprintln!("wmipolld: {e:#}");
        std::process::exit(1);
    }
}
