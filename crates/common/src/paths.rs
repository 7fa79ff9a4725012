use std::path::{Path, PathBuf};

const PID_FILE_NAME: &str = "wmipolld.pid";
const CONFIG_FILE_NAME: &str = "config.toml";
const LOG_DIR_NAME: &str = "logs";

pub fn pid_file(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(PID_FILE_NAME)
}

pub fn config_file(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(CONFIG_FILE_NAME)
}

pub fn log_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(LOG_DIR_NAME)
}
