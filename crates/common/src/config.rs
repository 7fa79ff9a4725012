use anyhow::{Result, bail};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_NAMESPACE: &str = "root\\cimv2";
pub const DEFAULT_INTERVAL_SECS: f64 = 10.0;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_interval() -> f64 {
    DEFAULT_INTERVAL_SECS
}

/// One configured query. Each input gets its own poller thread.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InputConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub query: String,
    // Seconds between cycles; also the retry delay after a failed cycle.
    #[serde(default = "default_interval")]
    pub interval: f64,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub add_field: BTreeMap<String, String>,
}

impl InputConfig {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            name: None,
            query: query.into(),
            interval: DEFAULT_INTERVAL_SECS,
            host: default_host(),
            user: None,
            password: None,
            namespace: default_namespace(),
            event_type: None,
            tags: Vec::new(),
            add_field: BTreeMap::new(),
        }
    }

    /// Display name, falling back to the input's position in the config.
    pub fn display_name(&self, index: usize) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("input-{index}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub workspace_dir: PathBuf,
    pub queue_capacity: usize,
    pub log_to_file: bool,
    // Program used to drive the CIM cmdlets.
    pub powershell: String,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let base_dir = dirs::home_dir()
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            workspace_dir: base_dir.join(".wmipoll"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            log_to_file: false,
            powershell: "powershell".to_string(),
            inputs: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Loads `<workspace>/config.toml` if present, then `WMIPOLL_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = crate::paths::config_file(&Self::default().workspace_dir);
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let defaults = Self::default();

        let mut builder = Config::builder()
            .set_default(
                "workspace_dir",
                defaults.workspace_dir.to_string_lossy().as_ref(),
            )?
            .set_default("queue_capacity", DEFAULT_QUEUE_CAPACITY as u64)?
            .set_default("log_to_file", false)?
            .set_default("powershell", defaults.powershell.as_str())?;

        if config_path.exists() {
            builder = builder.add_source(File::from(config_path.to_path_buf()));
        }

        builder = builder.add_source(
            Environment::with_prefix("WMIPOLL")
                .prefix_separator("_")
                .separator("__"),
        );

        let config = builder.build()?;
        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }

    /// Rejects settings the pollers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be greater than zero");
        }
        for (index, input) in self.inputs.iter().enumerate() {
            let name = input.display_name(index);
            if input.query.trim().is_empty() {
                bail!("input '{name}': query must not be empty");
            }
            if !input.interval.is_finite() || input.interval <= 0.0 {
                bail!(
                    "input '{name}': interval must be a positive number of seconds, got {}",
                    input.interval
                );
            }
            if input.host.trim().is_empty() {
                bail!("input '{name}': host must not be empty");
            }
        }
        Ok(())
    }
}
