//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// An auxiliary module required into every context before the extension
/// program runs. `bind` names the global the export is exposed as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadModule {
    pub path: String,
    pub bind: String,
}

impl PreloadModule {
    pub fn new(path: impl Into<String>, bind: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bind: bind.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory scanned for `<package>.js` files.
    pub extension_dir: PathBuf,
    /// Root for `require`; defaults to `<extension_dir>/root`.
    pub modules_dir: Option<PathBuf>,
    pub preload: Vec<PreloadModule>,
    /// Fallback timeout for script fetches, in milliseconds.
    pub fetch_timeout_ms: u64,
    pub user_agent: String,
    /// Quiet period before a changed file is reloaded.
    pub watch_debounce_ms: u64,
    /// Start every healthy package's loop during the scan instead of on
    /// first call.
    pub eager_init: bool,
    /// Stop a loop that has been idle this long with no outstanding native
    /// work. `None` keeps loops alive until reload or shutdown.
    pub idle_timeout_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            extension_dir: PathBuf::from("extensions"),
            modules_dir: None,
            preload: vec![
                PreloadModule::new("linkedom/worker.js", "parseHTML"),
                PreloadModule::new("crypto-js/aes.js", "AES"),
            ],
            fetch_timeout_ms: 30_000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            watch_debounce_ms: 200,
            eager_init: false,
            idle_timeout_ms: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new(extension_dir: impl AsRef<Path>) -> Self {
        Self {
            extension_dir: extension_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.modules_dir
            .clone()
            .unwrap_or_else(|| self.extension_dir.join("root"))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modules_dir_defaults_under_extension_dir() {
        let config = RuntimeConfig::new("/srv/ext");
        assert_eq!(config.modules_dir(), PathBuf::from("/srv/ext/root"));
        assert_eq!(config.preload.len(), 2);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: RuntimeConfig = serde_json::from_str(r#"{ "extension_dir": "x", "eager_init": true }"#).unwrap();
        assert!(config.eager_init);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.idle_timeout(), None);
    }
}
