//! Call dispatcher.
//!
//! Turns a logical operation into an expression for the package's API
//! version, runs it on the package loop under the entry lock and decodes the
//! fulfilled value into the typed result.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::descriptor::{ApiVersion, ContentKind, ExtensionDescriptor};
use crate::error::RuntimeError;
use crate::registry::{PackageEntry, PackageRegistry};
use crate::run_loop::{spawn_run_loop, LoopEnv};
use crate::types::{BangumiWatch, Detail, Filter, ListItem, WatchResult};

/// A logical extension operation with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Latest { page: i64 },
    Search { page: i64, keyword: String, filter: Option<Value> },
    Detail { url: String },
    Watch { url: String },
    CreateFilter { filter: Option<Value> },
    CheckUpdate { url: String },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Latest { .. } => "latest",
            Self::Search { .. } => "search",
            Self::Detail { .. } => "detail",
            Self::Watch { .. } => "watch",
            Self::CreateFilter { .. } => "createFilter",
            Self::CheckUpdate { .. } => "checkUpdate",
        }
    }

    /// Expression evaluated in the package context. Version 1 calls methods
    /// on the constructed `ext` object; version 2 calls top-level functions.
    pub fn expression(&self, api: ApiVersion) -> String {
        let args = match self {
            Self::Latest { page } => page.to_string(),
            Self::Search { page, keyword, filter } => {
                format!("{}, {}, {}", js_string(keyword), page, js_value(filter.as_ref()))
            }
            Self::Detail { url } | Self::Watch { url } | Self::CheckUpdate { url } => js_string(url),
            Self::CreateFilter { filter } => js_value(filter.as_ref()),
        };
        match api {
            ApiVersion::V1 => format!("ext.{}({})", self.name(), args),
            ApiVersion::V2 => format!("{}({})", self.name(), args),
        }
    }
}

fn js_string(s: &str) -> String {
    Value::from(s).to_string()
}

fn js_value(value: Option<&Value>) -> String {
    value.map_or_else(|| "null".to_string(), Value::to_string)
}

/// Routes operations to package loops.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<PackageRegistry>,
    env: LoopEnv,
}

impl Dispatcher {
    pub(crate) fn new(registry: Arc<PackageRegistry>, env: LoopEnv) -> Self {
        Self { registry, env }
    }

    pub async fn latest(&self, package: &str, page: i64) -> Result<Vec<ListItem>, RuntimeError> {
        self.call_as(package, Operation::Latest { page }).await
    }

    pub async fn search(
        &self,
        package: &str,
        page: i64,
        keyword: &str,
        filter: Option<Value>,
    ) -> Result<Vec<ListItem>, RuntimeError> {
        self.call_as(
            package,
            Operation::Search {
                page,
                keyword: keyword.to_string(),
                filter,
            },
        )
        .await
    }

    pub async fn detail(&self, package: &str, url: &str) -> Result<Detail, RuntimeError> {
        self.call_as(package, Operation::Detail { url: url.to_string() }).await
    }

    pub async fn create_filter(
        &self,
        package: &str,
        filter: Option<Value>,
    ) -> Result<HashMap<String, Filter>, RuntimeError> {
        self.call_as(package, Operation::CreateFilter { filter }).await
    }

    pub async fn check_update(&self, package: &str, url: &str) -> Result<String, RuntimeError> {
        let value = self.call(package, Operation::CheckUpdate { url: url.to_string() }).await?.1;
        Ok(match value {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    /// Watch result shaped by the package's content kind. Magnet and torrent
    /// results of bangumi packages are handed to the torrent client.
    pub async fn watch(&self, package: &str, url: &str) -> Result<WatchResult, RuntimeError> {
        let (entry, value) = self.call(package, Operation::Watch { url: url.to_string() }).await?;
        let descriptor = &entry.descriptor;

        Ok(match descriptor.kind {
            ContentKind::Manga => WatchResult::Manga(serde_json::from_value(value)?),
            ContentKind::Fikushon => WatchResult::Fikushon(serde_json::from_value(value)?),
            ContentKind::Other => WatchResult::Other(value),
            ContentKind::Bangumi => {
                let mut watch: BangumiWatch = serde_json::from_value(value)?;
                if watch.is_torrent_like() {
                    watch.torrent = self.hand_off(descriptor, &watch, url).await?;
                }
                WatchResult::Bangumi(watch)
            }
        })
    }

    async fn hand_off(
        &self,
        descriptor: &ExtensionDescriptor,
        watch: &BangumiWatch,
        title: &str,
    ) -> Result<Option<Value>, RuntimeError> {
        let Some(client) = self.env.services.torrent.as_ref() else {
            tracing::warn!(
                package = %descriptor.package_id,
                kind = %watch.kind,
                "no torrent client configured, returning watch result without a handle"
            );
            return Ok(None);
        };

        let package = &descriptor.package_id;
        let handle = if watch.kind == "magnet" {
            client.add_magnet(&watch.url, title, package).await
        } else {
            let link = resolve_link(&descriptor.website, &watch.url)?;
            client.add_torrent(&link, title, package).await
        };

        handle.map(Some).map_err(RuntimeError::Torrent)
    }

    async fn call_as<T: DeserializeOwned>(&self, package: &str, op: Operation) -> Result<T, RuntimeError> {
        let (_, value) = self.call(package, op).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run one operation, starting the package loop first if needed.
    pub async fn call(&self, package: &str, op: Operation) -> Result<(Arc<PackageEntry>, Value), RuntimeError> {
        let entry = self
            .registry
            .load(package)
            .ok_or_else(|| RuntimeError::NotFound(package.to_string()))?;
        if let Some(error) = entry.error() {
            return Err(RuntimeError::Unhealthy(error));
        }
        let expr = op.expression(entry.descriptor.api);

        let mut slot = entry.run_loop.lock().await;
        tracing::debug!(package = %package, op = op.name(), "dispatching");
        let mut result = Err(RuntimeError::Terminated);
        for _ in 0..2 {
            if slot.as_ref().map_or(true, |handle| handle.is_terminated()) {
                *slot = Some(self.start(&entry).await?);
            }
            let Some(handle) = slot.as_ref() else {
                break;
            };
            result = handle.call(expr.as_str()).await;
            // A loop that idled out between the check and the send is
            // restarted once.
            match &result {
                Err(RuntimeError::Terminated | RuntimeError::ChannelClosed) if handle.is_terminated() => continue,
                _ => break,
            }
        }
        drop(slot);

        match &result {
            Ok(_) => tracing::debug!(package = %package, op = op.name(), "call fulfilled"),
            Err(e) => tracing::debug!(package = %package, op = op.name(), error = %e, "call failed"),
        }
        result.map(|value| (entry, value))
    }

    /// Start the loop for an entry, recording an initialization failure as
    /// the entry's error.
    async fn start(&self, entry: &PackageEntry) -> Result<crate::run_loop::RunLoopHandle, RuntimeError> {
        let compiled = entry.compiled.clone().ok_or_else(|| {
            RuntimeError::Unhealthy(format!("extension {} has no compiled program", entry.package_id()))
        })?;

        match spawn_run_loop(compiled, self.env.clone()).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.registry.set_entry_error(entry, e.to_string());
                Err(e)
            }
        }
    }

    /// Start the loop now instead of on the first call.
    pub async fn ensure_started(&self, entry: &PackageEntry) -> Result<(), RuntimeError> {
        if !entry.is_healthy() {
            return Ok(());
        }
        let mut slot = entry.run_loop.lock().await;
        if slot.as_ref().map_or(true, |handle| handle.is_terminated()) {
            *slot = Some(self.start(entry).await?);
        }
        Ok(())
    }
}

/// Absolute links pass through; relative ones are appended below the
/// website's path, `..` and `.` segments cleaned.
fn resolve_link(website: &str, link: &str) -> Result<String, RuntimeError> {
    if let Ok(url) = Url::parse(link) {
        return Ok(url.to_string());
    }
    let mut base =
        Url::parse(website).map_err(|e| RuntimeError::Torrent(format!("invalid website {}: {}", website, e)))?;
    let path = join_path(base.path(), link);
    base.set_path(&path);
    Ok(base.to_string())
}

fn join_path(base: &str, link: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for part in base.split('/').chain(link.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expressions_per_api_version() {
        let latest = Operation::Latest { page: 2 };
        assert_eq!(latest.expression(ApiVersion::V1), "ext.latest(2)");
        assert_eq!(latest.expression(ApiVersion::V2), "latest(2)");

        let search = Operation::Search {
            page: 1,
            keyword: "a \"quoted\" kw".into(),
            filter: Some(json!({ "sort": ["new"] })),
        };
        assert_eq!(
            search.expression(ApiVersion::V2),
            r#"search("a \"quoted\" kw", 1, {"sort":["new"]})"#
        );

        let watch = Operation::Watch { url: "/ep/1".into() };
        assert_eq!(watch.expression(ApiVersion::V1), r#"ext.watch("/ep/1")"#);

        let filter = Operation::CreateFilter { filter: None };
        assert_eq!(filter.expression(ApiVersion::V2), "createFilter(null)");
    }

    #[test]
    fn relative_torrent_links_resolve_against_website() {
        assert_eq!(
            resolve_link("https://site.example/base/", "/files/a.torrent").unwrap(),
            "https://site.example/base/files/a.torrent"
        );
        assert_eq!(
            resolve_link("https://site.example/base", "files/a.torrent").unwrap(),
            "https://site.example/base/files/a.torrent"
        );
        assert_eq!(
            resolve_link("https://site.example/a/b", "../c/./d.torrent").unwrap(),
            "https://site.example/a/c/d.torrent"
        );
        assert_eq!(
            resolve_link("https://site.example", "/files/ep1.torrent").unwrap(),
            "https://site.example/files/ep1.torrent"
        );
        assert_eq!(
            resolve_link("https://site.example", "https://cdn.example/b.torrent").unwrap(),
            "https://cdn.example/b.torrent"
        );
        assert!(resolve_link("not a url", "/a.torrent").is_err());
    }
}
