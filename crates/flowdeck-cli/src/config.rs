use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8000/";

/// Local operator preferences. Plain key/value persistence with no
/// consistency ties to session state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub default_provider: Option<String>,
}

impl ConsoleConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Precedence: command-line flag, then `FLOWDECK_SERVER`, then the
    /// config file, then the local default.
    pub fn resolve_server(&self, flag: Option<&str>, env: Option<&str>) -> String {
        flag.map(str::to_string)
            .or_else(|| env.map(str::to_string))
            .or_else(|| self.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string())
    }

    pub fn resolve_provider(&self, flag: Option<&str>) -> Option<String> {
        flag.map(str::to_string)
            .or_else(|| self.default_provider.clone())
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FLOWDECK_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flowdeck")
        .join("config.toml")
}
