//! Configuration module
//!
//! Engine settings persisted as TOML in the platform config directory

mod settings;

pub use settings::{
    CommandSettings, ConfigError, EngineConfig, LoggingSettings, ReconnectSettings,
    SerialSettings, StreamSettings,
};

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "yostlabs", "threespace")
}

/// Get the configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the data directory
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// Get the traffic capture directory
pub fn capture_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("captures"))
}

/// Create the directories above
pub fn init_directories() -> std::io::Result<()> {
    for dir in [config_dir(), data_dir(), log_dir(), capture_dir()]
        .into_iter()
        .flatten()
    {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
