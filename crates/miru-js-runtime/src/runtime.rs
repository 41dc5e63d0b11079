//! The extension runtime facade.
//!
//! Owns the registry, the shared native services and the dispatcher, and is
//! what the application layer talks to.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use reqwest::cookie::Jar;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::bridge::ModuleSource;
use crate::config::RuntimeConfig;
use crate::descriptor::{file_name_of, ExtensionInfo};
use crate::dispatcher::Dispatcher;
use crate::error::{RuntimeError, RuntimeResult};
use crate::fetch::HttpClient;
use crate::loader::{LoadOutcome, Loader};
use crate::registry::{PackageRegistry, RegistryEvent};
use crate::run_loop::LoopEnv;
use crate::services::RuntimeServices;
use crate::types::{Detail, Filter, ListItem, WatchResult};
use crate::watcher::ExtensionWatcher;

/// Runs every extension found in one directory.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = ExtensionRuntime::in_memory(RuntimeConfig::new("./extensions"))?;
/// runtime.scan().await?;
/// let items = runtime.latest("demo.pkg", 1).await?;
/// ```
#[derive(Clone)]
pub struct ExtensionRuntime {
    config: Arc<RuntimeConfig>,
    registry: Arc<PackageRegistry>,
    dispatcher: Dispatcher,
    loader: Loader,
}

impl ExtensionRuntime {
    /// Must be called inside a tokio runtime; native bridge work runs on it.
    /// `jar` backs both the HTTP client and, usually, `services.cookies`.
    pub fn new(config: RuntimeConfig, services: RuntimeServices, jar: Arc<Jar>) -> RuntimeResult<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| RuntimeError::NoAsyncRuntime)?;
        let http = HttpClient::new(jar, &config)?;

        let env = LoopEnv {
            services,
            http,
            handle,
            modules: Arc::new(ModuleSource::new(config.modules_dir())),
            preload: config.preload.clone(),
            idle_timeout: config.idle_timeout(),
        };

        let registry = Arc::new(PackageRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone(), env);
        let loader = Loader::new(registry.clone(), dispatcher.clone(), config.eager_init);

        Ok(Self {
            config: Arc::new(config),
            registry,
            dispatcher,
            loader,
        })
    }

    /// In-memory settings and cookies, no torrent client.
    pub fn in_memory(config: RuntimeConfig) -> RuntimeResult<Self> {
        let jar = Arc::new(Jar::default());
        Self::new(config, RuntimeServices::in_memory(jar.clone()), jar)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PackageRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Load every extension in the configured directory.
    pub async fn scan(&self) -> RuntimeResult<Vec<LoadOutcome>> {
        Ok(self.loader.scan(&self.config.extension_dir).await?)
    }

    /// (Re)load a single extension file.
    pub async fn load_file(&self, path: impl AsRef<Path>) -> LoadOutcome {
        self.loader.load_file(path.as_ref()).await
    }

    /// Drop every package registered from `path`.
    pub fn remove_file(&self, path: impl AsRef<Path>) -> Vec<String> {
        match file_name_of(path.as_ref()) {
            Some(file_name) => self.loader.remove_file(&file_name),
            None => Vec::new(),
        }
    }

    /// Watch the extension directory; drive it with [`ExtensionWatcher::run`].
    pub fn watch_directory(&self) -> RuntimeResult<ExtensionWatcher> {
        std::fs::create_dir_all(&self.config.extension_dir)?;
        Ok(ExtensionWatcher::new(
            &self.config.extension_dir,
            self.loader.clone(),
            self.config.watch_debounce(),
        )?)
    }

    pub fn list_extensions(&self) -> Vec<ExtensionInfo> {
        self.registry.get_all()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub async fn latest(&self, package: &str, page: i64) -> RuntimeResult<Vec<ListItem>> {
        self.dispatcher.latest(package, page).await
    }

    pub async fn search(
        &self,
        package: &str,
        page: i64,
        keyword: &str,
        filter: Option<Value>,
    ) -> RuntimeResult<Vec<ListItem>> {
        self.dispatcher.search(package, page, keyword, filter).await
    }

    pub async fn detail(&self, package: &str, url: &str) -> RuntimeResult<Detail> {
        self.dispatcher.detail(package, url).await
    }

    pub async fn watch(&self, package: &str, url: &str) -> RuntimeResult<WatchResult> {
        self.dispatcher.watch(package, url).await
    }

    pub async fn create_filter(
        &self,
        package: &str,
        filter: Option<Value>,
    ) -> RuntimeResult<HashMap<String, Filter>> {
        self.dispatcher.create_filter(package, filter).await
    }

    pub async fn check_update(&self, package: &str, url: &str) -> RuntimeResult<String> {
        self.dispatcher.check_update(package, url).await
    }
}
