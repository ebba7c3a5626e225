use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::lsp::servers::{builtin_servers, ServerConfig};

pub const DEFAULT_MODEL: &str = "x-ai/grok-4-fast:free";
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Runtime configuration, built once and injected into every component
#[derive(Debug, Clone)]
pub struct Config {
    pub working_dir: PathBuf,
    pub data_dir: PathBuf,
    pub provider: ProviderConfig,
    /// language id -> server command
    pub lsp_servers: HashMap<String, ServerConfig>,
    pub lsp_enabled: bool,
    pub lsp_shutdown_timeout: Duration,
    pub supervisor_shutdown_timeout: Duration,
    pub bus_buffer: usize,
    pub glob_limit: usize,
    pub max_tool_output: usize,
    /// Skip the permission prompt for every session
    pub auto_approve: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub referer: Option<String>,
    pub title: Option<String>,
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            referer: None,
            title: Some("kite".to_string()),
            max_tokens: 4096,
        }
    }
}

impl Config {
    /// Defaults rooted at `working_dir`, with data under `<working_dir>/.kite`
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let working_dir = working_dir.into();
        Self {
            data_dir: working_dir.join(".kite"),
            working_dir,
            provider: ProviderConfig::default(),
            lsp_servers: builtin_servers(),
            lsp_enabled: true,
            lsp_shutdown_timeout: Duration::from_secs(5),
            supervisor_shutdown_timeout: Duration::from_secs(5),
            bus_buffer: 256,
            glob_limit: 100,
            max_tool_output: 1024 * 1024,
            auto_approve: false,
        }
    }

    /// Read configuration from the process environment.
    ///
    /// Recognized: `OPENROUTER_API_KEY`, `OPENROUTER_MODEL`, `KITE_BASE_URL`,
    /// `KITE_WORKING_DIR`, `KITE_DATA_DIR`, `KITE_AUTO_APPROVE`, `KITE_DISABLE_LSP`.
    pub fn from_env() -> anyhow::Result<Self> {
        let working_dir = match std::env::var("KITE_WORKING_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_dir()?,
        };
        let mut config = Self::new(working_dir);

        config.data_dir = match std::env::var("KITE_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::home_dir()
                .map(|home| home.join(".kite"))
                .unwrap_or_else(|| config.working_dir.join(".kite")),
        };

        config.provider.api_key = std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());
        if let Ok(model) = std::env::var("OPENROUTER_MODEL") {
            config.provider.model = model;
        }
        if let Ok(url) = std::env::var("KITE_BASE_URL") {
            config.provider.base_url = url.trim_end_matches('/').to_string();
        }
        config.provider.referer = std::env::var("OPENROUTER_REFERER").ok();

        config.auto_approve = env_flag("KITE_AUTO_APPROVE");
        config.lsp_enabled = !env_flag("KITE_DISABLE_LSP");

        Ok(config)
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("/repo");
        assert_eq!(config.working_dir, PathBuf::from("/repo"));
        assert_eq!(config.data_dir, PathBuf::from("/repo/.kite"));
        assert_eq!(config.glob_limit, 100);
        assert_eq!(config.lsp_shutdown_timeout, Duration::from_secs(5));
        assert!(config.lsp_servers.contains_key("rust"));
        assert!(config.provider.api_key.is_none());
    }
}
