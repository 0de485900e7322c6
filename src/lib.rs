pub mod config;
pub mod logging;
pub mod mcp_client;

use std::path::PathBuf;

/// Platform data directory for logs.
///
/// Falls back to `~/.mcop` if the platform data dir is unavailable.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcop");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcop")
}

/// Platform config directory holding `config.json`.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = dirs::config_dir() {
        return dir.join("mcop");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcop")
}
