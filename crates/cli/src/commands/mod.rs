//! Subcommand implementations.

pub mod chat;
pub mod doctor;
pub mod scan;
pub mod serve;
pub mod topics;
pub mod validate;

use std::path::{Path, PathBuf};

use dialoguard_config::{AppConfig, ConfigError};

/// Load the config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
}

/// Where the config is read from, for messages.
pub fn config_location(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}
