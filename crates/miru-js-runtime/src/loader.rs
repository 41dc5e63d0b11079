//! Directory scan and per-file (re)loading.
//!
//! Every outcome lands in the registry: healthy entries, unhealthy entries
//! carrying the metadata/compile/init error, or removal when the file is
//! gone. Nothing here fails the scan as a whole.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compiler;
use crate::descriptor::{file_name_of, file_stem_of, is_extension_file, ExtensionDescriptor};
use crate::dispatcher::Dispatcher;
use crate::registry::{PackageEntry, PackageRegistry};

/// What loading one file did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Healthy(String),
    Unhealthy { package: String, error: String },
    /// The file no longer exists; these keys were dropped.
    Removed(Vec<String>),
    /// Not an extension file.
    Ignored,
}

impl LoadOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy(_))
    }
}

#[derive(Clone)]
pub(crate) struct Loader {
    registry: Arc<PackageRegistry>,
    dispatcher: Dispatcher,
    eager_init: bool,
}

impl Loader {
    pub fn new(registry: Arc<PackageRegistry>, dispatcher: Dispatcher, eager_init: bool) -> Self {
        Self {
            registry,
            dispatcher,
            eager_init,
        }
    }

    /// Load every `*.js` file directly inside `dir`, creating it if missing.
    pub async fn scan(&self, dir: &Path) -> std::io::Result<Vec<LoadOutcome>> {
        tokio::fs::create_dir_all(dir).await?;

        let mut paths: Vec<PathBuf> = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && is_extension_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            outcomes.push(self.load_file(&path).await);
        }

        let healthy = outcomes.iter().filter(|o| o.is_healthy()).count();
        tracing::info!(
            dir = %dir.display(),
            loaded = outcomes.len(),
            healthy,
            "extension directory scanned"
        );
        Ok(outcomes)
    }

    /// (Re)load one file, replacing whatever the registry held for it.
    pub async fn load_file(&self, path: &Path) -> LoadOutcome {
        let Some(file_name) = file_name_of(path).filter(|_| is_extension_file(path)) else {
            return LoadOutcome::Ignored;
        };

        let source = match tokio::fs::read_to_string(path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return LoadOutcome::Removed(self.remove_file(&file_name));
            }
            Err(e) => {
                let package = file_stem_of(&file_name).to_string();
                let error = format!("failed to read {}: {}", file_name, e);
                self.store_rejected(&package, None, &file_name, error.clone());
                return LoadOutcome::Unhealthy { package, error };
            }
        };

        let descriptor = match ExtensionDescriptor::parse(&source, &file_name) {
            Ok(descriptor) => Arc::new(descriptor),
            Err(e) => {
                let package = file_stem_of(&file_name).to_string();
                let declared = ExtensionDescriptor::declared_package(&source);
                let error = e.to_string();
                tracing::warn!(file = %file_name, error = %error, "extension metadata rejected");
                self.store_rejected(&package, declared.as_deref(), &file_name, error.clone());
                return LoadOutcome::Unhealthy { package, error };
            }
        };

        let package = descriptor.package_id.clone();
        self.drop_stale_keys(&file_name, &[package.as_str()]);

        let entry = match compiler::compile(descriptor.clone()) {
            Ok(compiled) => PackageEntry::healthy(compiled),
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(package = %package, error = %error, "extension failed to compile");
                self.registry.store(PackageEntry::unhealthy(descriptor, error.clone()));
                return LoadOutcome::Unhealthy { package, error };
            }
        };

        let entry = Arc::new(entry);
        self.registry.store_as(package.clone(), entry.clone());

        if self.eager_init {
            if let Err(e) = self.dispatcher.ensure_started(&entry).await {
                return LoadOutcome::Unhealthy {
                    package,
                    error: e.to_string(),
                };
            }
        }

        tracing::info!(
            package = %package,
            name = %descriptor.name,
            version = %descriptor.version,
            api = %descriptor.api,
            "extension loaded"
        );
        LoadOutcome::Healthy(package)
    }

    pub fn remove_file(&self, file_name: &str) -> Vec<String> {
        let removed = self.registry.remove_file(file_name);
        if !removed.is_empty() {
            tracing::info!(file = %file_name, packages = ?removed, "extension removed");
        }
        removed
    }

    /// Register a file that never got a descriptor under its stem and, when
    /// nobody else owns it, under the package id it declares.
    fn store_rejected(&self, stem: &str, declared: Option<&str>, file_name: &str, error: String) {
        let mut keys = vec![stem];
        keys.extend(declared.filter(|d| *d != stem));
        self.drop_stale_keys(file_name, &keys);

        let entry = Arc::new(PackageEntry::unhealthy(
            Arc::new(ExtensionDescriptor::placeholder(stem, file_name)),
            error,
        ));
        self.registry.store_as(stem.to_string(), entry.clone());
        if let Some(declared) = declared.filter(|d| *d != stem) {
            if !self.registry.store_if_unclaimed(declared.to_string(), entry) {
                tracing::debug!(file = %file_name, package = %declared, "declared package owned by another file");
            }
        }
    }

    /// Drop keys this file registered under before that it no longer uses.
    fn drop_stale_keys(&self, file_name: &str, keep: &[&str]) {
        for key in self.registry.keys_for_file(file_name) {
            if !keep.contains(&key.as_str()) {
                self.registry.remove(&key);
            }
        }
    }
}
