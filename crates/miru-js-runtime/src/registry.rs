//! Package registry.
//!
//! Concurrent map from package id to its entry. Every call looks its package
//! up here, the watcher replaces and removes entries, and listings take
//! point-in-time snapshots. Mutations are broadcast to subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::compiler::CompiledPackage;
use crate::descriptor::{ExtensionDescriptor, ExtensionInfo};
use crate::run_loop::RunLoopHandle;

const EVENT_CAPACITY: usize = 64;

/// Registry change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RegistryEvent {
    /// An entry was inserted or replaced.
    Stored { package: String, error: String },
    /// An entry's error changed in place (set or cleared).
    ErrorChanged { package: String, error: String },
    Removed { package: String },
}

/// One registered package.
pub struct PackageEntry {
    pub descriptor: Arc<ExtensionDescriptor>,
    /// `None` when the file never got past metadata or compilation.
    pub compiled: Option<CompiledPackage>,
    error: RwLock<String>,
    /// Lazily started loop. Holding this lock is what serializes calls.
    pub(crate) run_loop: tokio::sync::Mutex<Option<RunLoopHandle>>,
    pub loaded_at: DateTime<Utc>,
}

impl PackageEntry {
    /// A compiled, callable entry.
    pub fn healthy(compiled: CompiledPackage) -> Self {
        Self {
            descriptor: compiled.descriptor.clone(),
            compiled: Some(compiled),
            error: RwLock::new(String::new()),
            run_loop: tokio::sync::Mutex::new(None),
            loaded_at: Utc::now(),
        }
    }

    /// An entry that answers every call with `error`.
    pub fn unhealthy(descriptor: Arc<ExtensionDescriptor>, error: impl Into<String>) -> Self {
        Self {
            descriptor,
            compiled: None,
            error: RwLock::new(error.into()),
            run_loop: tokio::sync::Mutex::new(None),
            loaded_at: Utc::now(),
        }
    }

    pub fn package_id(&self) -> &str {
        &self.descriptor.package_id
    }

    /// Stored error, `None` when healthy.
    pub fn error(&self) -> Option<String> {
        let error = self.error.read();
        if error.is_empty() {
            None
        } else {
            Some(error.clone())
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.error.read().is_empty()
    }

    /// Native calls outstanding on the package loop; `None` while a call
    /// holds the loop or before it has started.
    pub fn outstanding_jobs(&self) -> Option<usize> {
        let slot = self.run_loop.try_lock().ok()?;
        slot.as_ref().map(|handle| handle.outstanding_jobs())
    }

    pub fn info(&self) -> ExtensionInfo {
        ExtensionInfo {
            descriptor: (*self.descriptor).clone(),
            error: self.error.read().clone(),
            loaded_at: self.loaded_at,
        }
    }

    /// Swap the error; returns whether it changed.
    fn replace_error(&self, error: String) -> bool {
        let mut current = self.error.write();
        if *current == error {
            return false;
        }
        *current = error;
        true
    }
}

impl std::fmt::Debug for PackageEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageEntry")
            .field("package", &self.descriptor.package_id)
            .field("file", &self.descriptor.file_name)
            .field("compiled", &self.compiled.is_some())
            .field("error", &*self.error.read())
            .finish()
    }
}

/// Concurrent package map with change notifications.
pub struct PackageRegistry {
    entries: DashMap<String, Arc<PackageEntry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for PackageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    /// Receive every subsequent mutation. Slow receivers may lag.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: RegistryEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Insert or replace the entry under its package id. The replaced entry,
    /// if any, is returned; its loop stops once the last call holding it ends.
    pub fn store(&self, entry: PackageEntry) -> Option<Arc<PackageEntry>> {
        let package = entry.package_id().to_string();
        self.store_as(package, Arc::new(entry))
    }

    /// Insert or replace the entry under an explicit key.
    pub fn store_as(&self, key: String, entry: Arc<PackageEntry>) -> Option<Arc<PackageEntry>> {
        let error = entry.error.read().clone();
        let previous = self.entries.insert(key.clone(), entry);
        tracing::debug!(package = %key, healthy = error.is_empty(), "registry entry stored");
        self.notify(RegistryEvent::Stored { package: key, error });
        previous
    }

    /// Insert under `key` unless another file already owns it. An existing
    /// entry from the same file is replaced. Returns whether it was stored.
    pub fn store_if_unclaimed(&self, key: String, entry: Arc<PackageEntry>) -> bool {
        let error = entry.error.read().clone();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().descriptor.file_name != entry.descriptor.file_name {
                    return false;
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        self.notify(RegistryEvent::Stored { package: key, error });
        true
    }

    pub fn load(&self, package: &str) -> Option<Arc<PackageEntry>> {
        self.entries.get(package).map(|e| e.value().clone())
    }

    /// Record (or with an empty message, clear) the error of a package.
    /// Returns `false` when the package is not registered.
    pub fn set_error(&self, package: &str, error: impl Into<String>) -> bool {
        let Some(entry) = self.load(package) else {
            return false;
        };
        self.set_entry_error(&entry, error);
        true
    }

    pub fn clear_error(&self, package: &str) -> bool {
        self.set_error(package, String::new())
    }

    /// Record an error on a specific entry, even one already replaced.
    pub(crate) fn set_entry_error(&self, entry: &PackageEntry, error: impl Into<String>) {
        let error = error.into();
        if entry.replace_error(error.clone()) {
            if error.is_empty() {
                tracing::info!(package = %entry.package_id(), "extension healthy again");
            } else {
                tracing::warn!(package = %entry.package_id(), error = %error, "extension marked unhealthy");
            }
            self.notify(RegistryEvent::ErrorChanged {
                package: entry.package_id().to_string(),
                error,
            });
        }
    }

    pub fn remove(&self, package: &str) -> Option<Arc<PackageEntry>> {
        let removed = self.entries.remove(package).map(|(_, entry)| entry);
        if removed.is_some() {
            tracing::debug!(package = %package, "registry entry removed");
            self.notify(RegistryEvent::Removed {
                package: package.to_string(),
            });
        }
        removed
    }

    /// Keys whose entries were read from `file_name`.
    pub fn keys_for_file(&self, file_name: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.value().descriptor.file_name == file_name)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Remove every key whose entry was read from `file_name`.
    pub fn remove_file(&self, file_name: &str) -> Vec<String> {
        self.keys_for_file(file_name)
            .into_iter()
            .filter(|key| {
                let removed = self
                    .entries
                    .remove_if(key, |_, entry| entry.descriptor.file_name == file_name)
                    .is_some();
                if removed {
                    self.notify(RegistryEvent::Removed { package: key.clone() });
                }
                removed
            })
            .collect()
    }

    /// Snapshot of every registered package, sorted by key.
    pub fn get_all(&self) -> Vec<ExtensionInfo> {
        let mut entries: Vec<(String, Arc<PackageEntry>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
            .into_iter()
            .map(|(key, entry)| {
                let mut info = entry.info();
                info.descriptor.package_id = key;
                info
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholder(package: &str, file: &str, error: &str) -> PackageEntry {
        PackageEntry::unhealthy(Arc::new(ExtensionDescriptor::placeholder(package, file)), error)
    }

    #[test]
    fn store_load_remove() {
        let registry = PackageRegistry::new();
        assert!(registry.store(placeholder("a.b", "a.b.js", "")).is_none());
        assert!(registry.load("a.b").is_some());
        assert!(registry.store(placeholder("a.b", "a.b.js", "")).is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("a.b").is_some());
        assert!(registry.load("a.b").is_none());
        assert!(registry.remove("a.b").is_none());
    }

    #[test]
    fn set_error_notifies_only_on_change() {
        let registry = PackageRegistry::new();
        registry.store(placeholder("a.b", "a.b.js", ""));
        let mut events = registry.subscribe();

        assert!(registry.set_error("a.b", "boom"));
        assert!(registry.set_error("a.b", "boom"));
        assert!(registry.clear_error("a.b"));
        assert!(!registry.set_error("missing", "boom"));

        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::ErrorChanged {
                package: "a.b".into(),
                error: "boom".into()
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::ErrorChanged {
                package: "a.b".into(),
                error: String::new()
            }
        );
        assert!(events.try_recv().is_err());
        assert!(registry.load("a.b").unwrap().is_healthy());
    }

    #[test]
    fn unclaimed_alias_respects_other_files() {
        let registry = PackageRegistry::new();
        registry.store(placeholder("demo.pkg", "demo.pkg.js", ""));

        let wrong = Arc::new(placeholder("wrong", "wrong.js", "mismatch"));
        assert!(!registry.store_if_unclaimed("demo.pkg".into(), wrong.clone()));
        assert!(registry.store_if_unclaimed("demo.pkg2".into(), wrong.clone()));
        assert!(registry.store_if_unclaimed("demo.pkg2".into(), wrong));
        assert!(registry.load("demo.pkg").unwrap().is_healthy());
    }

    #[test]
    fn remove_file_drops_every_alias() {
        let registry = PackageRegistry::new();
        let wrong = Arc::new(placeholder("wrong", "wrong.js", "mismatch"));
        registry.store_as("wrong".into(), wrong.clone());
        registry.store_if_unclaimed("demo.pkg2".into(), wrong);
        registry.store(placeholder("other", "other.js", ""));

        let mut removed = registry.remove_file("wrong.js");
        removed.sort();
        assert_eq!(removed, vec!["demo.pkg2".to_string(), "wrong".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_all_is_sorted_and_keyed() {
        let registry = PackageRegistry::new();
        let wrong = Arc::new(placeholder("wrong", "wrong.js", "mismatch"));
        registry.store_as("wrong".into(), wrong.clone());
        registry.store_if_unclaimed("demo.pkg2".into(), wrong);
        registry.store(placeholder("alpha", "alpha.js", ""));

        let all = registry.get_all();
        let ids: Vec<_> = all.iter().map(|i| i.descriptor.package_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "demo.pkg2", "wrong"]);
        assert!(all[0].is_healthy());
        assert_eq!(all[1].error, "mismatch");
    }
}
