//! Collaborators reachable from extension scripts.
//!
//! The runtime never owns persistence or downloads; it talks to them through
//! these traits. In-memory implementations are provided for tools and tests.

use std::sync::Arc;

use dashmap::DashMap;
use reqwest::cookie::{CookieStore as _, Jar};
use reqwest::Url;

use crate::error::BridgeError;

/// Services that can be accessed from JavaScript.
#[derive(Clone)]
pub struct RuntimeServices {
    /// Per-package settings backing `getSetting`/`setSetting`/`registerSetting`
    pub settings: Arc<dyn SettingsStore>,
    /// Cookie jar shared with the HTTP client
    pub cookies: Arc<dyn CookieStore>,
    /// Receives magnet/torrent watch results, if configured
    pub torrent: Option<Arc<dyn TorrentClient>>,
}

impl RuntimeServices {
    /// In-memory settings, the given jar for cookies, no torrent client.
    pub fn in_memory(jar: Arc<Jar>) -> Self {
        Self {
            settings: Arc::new(MemorySettingsStore::default()),
            cookies: Arc::new(JarCookieStore::new(jar)),
            torrent: None,
        }
    }

    pub fn with_torrent(mut self, torrent: Arc<dyn TorrentClient>) -> Self {
        self.torrent = Some(torrent);
        self
    }

    pub fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = settings;
        self
    }
}

/// Trait for per-package setting storage.
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    /// Read a setting; `None` when the key was never set or registered.
    async fn get(&self, package: &str, key: &str) -> Result<Option<String>, BridgeError>;
    /// Write a setting value.
    async fn set(&self, package: &str, key: &str, value: String) -> Result<(), BridgeError>;
    /// Declare a setting. The schema carries at least `key`, and optionally
    /// `title`, `type`, `defaultValue`, `description`, `options`.
    async fn register(&self, package: &str, schema: serde_json::Value) -> Result<(), BridgeError>;
}

/// Trait for cookie access by URL.
#[async_trait::async_trait]
pub trait CookieStore: Send + Sync + 'static {
    /// Cookies applicable to `url`, each as `name=value`.
    async fn get(&self, url: &str) -> Result<Vec<String>, BridgeError>;
    /// Store `Set-Cookie` style strings for `url`.
    async fn set(&self, url: &str, cookies: Vec<String>) -> Result<(), BridgeError>;
}

/// Trait for the external torrent engine.
#[async_trait::async_trait]
pub trait TorrentClient: Send + Sync + 'static {
    async fn add_magnet(&self, link: &str, title: &str, package: &str) -> Result<serde_json::Value, String>;
    async fn add_torrent(&self, link: &str, title: &str, package: &str) -> Result<serde_json::Value, String>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory settings
// ─────────────────────────────────────────────────────────────────────────────

/// Settings kept in a concurrent map keyed by `(package, key)`.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: DashMap<(String, String), String>,
    schemas: DashMap<(String, String), serde_json::Value>,
}

impl MemorySettingsStore {
    pub fn schema(&self, package: &str, key: &str) -> Option<serde_json::Value> {
        self.schemas
            .get(&(package.to_string(), key.to_string()))
            .map(|s| s.value().clone())
    }
}

#[async_trait::async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, package: &str, key: &str) -> Result<Option<String>, BridgeError> {
        Ok(self
            .values
            .get(&(package.to_string(), key.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn set(&self, package: &str, key: &str, value: String) -> Result<(), BridgeError> {
        self.values.insert((package.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn register(&self, package: &str, schema: serde_json::Value) -> Result<(), BridgeError> {
        let key = schema
            .get("key")
            .and_then(|k| k.as_str())
            .ok_or_else(|| BridgeError::Settings("invalid setting object: missing key".to_string()))?
            .to_string();

        let default = match schema.get("defaultValue") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        let slot = (package.to_string(), key);
        if let Some(default) = default {
            self.values.entry(slot.clone()).or_insert(default);
        }
        self.schemas.insert(slot, schema);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cookies over the HTTP client's jar
// ─────────────────────────────────────────────────────────────────────────────

/// Cookie store sharing its jar with the fetch client, so cookies set from
/// scripts ride along on later requests.
#[derive(Debug, Clone)]
pub struct JarCookieStore {
    jar: Arc<Jar>,
}

impl JarCookieStore {
    pub fn new(jar: Arc<Jar>) -> Self {
        Self { jar }
    }

    fn parse_url(url: &str) -> Result<Url, BridgeError> {
        Url::parse(url).map_err(|e| BridgeError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl CookieStore for JarCookieStore {
    async fn get(&self, url: &str) -> Result<Vec<String>, BridgeError> {
        let url = Self::parse_url(url)?;
        let Some(header) = self.jar.cookies(&url) else {
            return Ok(Vec::new());
        };
        let header = header
            .to_str()
            .map_err(|e| BridgeError::Cookies(e.to_string()))?;
        Ok(header
            .split("; ")
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn set(&self, url: &str, cookies: Vec<String>) -> Result<(), BridgeError> {
        let url = Self::parse_url(url)?;
        for cookie in &cookies {
            self.jar.add_cookie_str(cookie, &url);
        }
        Ok(())
    }
}
