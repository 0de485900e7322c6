//! Application configuration: the server list plus display preferences.
//!
//! Stored as pretty JSON (or YAML for `.yaml`/`.yml` paths). A missing file
//! yields [`AppConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{validate_descriptors, ServerDescriptor};

/// Env var overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "MCOP_CONFIG";

/// Env var supplying a URL for servers configured without one.
pub const DEFAULT_URL_ENV: &str = "DEFAULT_MCP_URL";

const DEFAULT_REFRESH_SECS: u64 = 5;

fn default_refresh_rate() -> u64 {
    DEFAULT_REFRESH_SECS
}

fn default_true() -> bool {
    true
}

fn default_theme() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    #[serde(default = "default_true")]
    pub auto_refresh: bool,
    #[serde(rename = "refresh_rate", default = "default_refresh_rate")]
    pub refresh_rate_secs: u64,
    #[serde(default = "default_theme")]
    pub default_theme: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut github = ServerDescriptor::new(
            "github-server",
            "GitHub Integration Server",
            "stdio://npx @modelcontextprotocol/server-github",
        );
        github.description = "MCP server for GitHub operations".into();
        github.tools = vec![
            "get_repo_info".into(),
            "create_issue".into(),
            "search_issues".into(),
        ];

        Self {
            servers: vec![github],
            auto_refresh: true,
            refresh_rate_secs: DEFAULT_REFRESH_SECS,
            default_theme: default_theme(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Format::Yaml
            }
            _ => Format::Json,
        }
    }
}

fn config_error(reason: String) -> McpError {
    McpError::Config { reason }
}

impl AppConfig {
    /// Config file location: `explicit`, else `$MCOP_CONFIG`, else the
    /// platform config directory.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        crate::config_dir().join("config.json")
    }

    /// Load from `path`, or return the default config if it does not exist.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
        let mut config: AppConfig = match Format::for_path(path) {
            Format::Yaml => serde_yaml::from_str(&content)
                .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))?,
            Format::Json => serde_json::from_str(&content)
                .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))?,
        };

        config.normalize(std::env::var(DEFAULT_URL_ENV).ok().as_deref());
        tracing::debug!(
            path = %path.display(),
            servers = config.servers.len(),
            "loaded config"
        );
        Ok(config)
    }

    /// Write to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), McpError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                config_error(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let content = match Format::for_path(path) {
            Format::Yaml => serde_yaml::to_string(self)
                .map_err(|e| config_error(format!("failed to serialize config: {e}")))?,
            Format::Json => serde_json::to_string_pretty(self)
                .map_err(|e| config_error(format!("failed to serialize config: {e}")))?,
        };

        std::fs::write(path, content)
            .map_err(|e| config_error(format!("failed to write {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "saved config");
        Ok(())
    }

    /// Fix up values that would otherwise be unusable.
    fn normalize(&mut self, default_url: Option<&str>) {
        if self.refresh_rate_secs == 0 {
            self.refresh_rate_secs = DEFAULT_REFRESH_SECS;
        }
        if let Some(url) = default_url.filter(|u| !u.trim().is_empty()) {
            for server in self.servers.iter_mut().filter(|s| s.url.trim().is_empty()) {
                server.url = url.to_string();
            }
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_rate_secs.max(1))
    }

    /// Add a server, replacing any existing entry with the same id.
    pub fn add_server(&mut self, server: ServerDescriptor) {
        match self.servers.iter_mut().find(|s| s.id == server.id) {
            Some(existing) => *existing = server,
            None => self.servers.push(server),
        }
    }

    /// Remove a server by id. Returns whether it was present.
    pub fn remove_server(&mut self, id: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.id != id);
        self.servers.len() != before
    }

    pub fn get_server(&self, id: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Every server has a non-empty id, a usable URL and a unique id.
    pub fn validate(&self) -> Result<(), McpError> {
        validate_descriptors(&self.servers)
    }
}

/// Derive a server id from a display name: ASCII alphanumerics, `-` and `_`
/// are kept, anything else becomes `-`.
pub fn generate_id(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
