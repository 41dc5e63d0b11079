//! Application configuration.
//!
//! Read from a TOML file (`miru.toml` by default). A missing file means
//! defaults; command-line flags are applied on top by the caller.
//!
//! ```toml
//! [runtime]
//! extension_dir = "extensions"
//! fetch_timeout_ms = 15000
//! eager_init = false
//!
//! [log]
//! filter = "miru=info,miru_js_runtime=debug"
//! json = false
//! ```

use std::path::{Path, PathBuf};

use miru_js_runtime::RuntimeConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const DEFAULT_LOG_FILTER: &str = "miru=info,miru_js_runtime=info";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML in {path}: {source}")]
    TomlParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load from `path`. Relative directories in the file are resolved
    /// against the file's own directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            let mut config = Self::default();
            config.resolve_paths(&current_dir());
            return Ok(config);
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content).map_err(|source| ConfigError::TomlParseError {
            path: path.to_path_buf(),
            source,
        })?;

        let base = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => absolute(parent, &current_dir()),
            _ => current_dir(),
        };
        config.resolve_paths(&base);
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Make the extension and module directories absolute.
    pub fn resolve_paths(&mut self, base: &Path) {
        self.runtime.extension_dir = absolute(&self.runtime.extension_dir, base);
        if let Some(modules) = self.runtime.modules_dir.take() {
            self.runtime.modules_dir = Some(absolute(&modules, base));
        }
    }
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn absolute(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
