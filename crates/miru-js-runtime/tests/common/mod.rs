#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miru_js_runtime::{ExtensionRuntime, Jar, RuntimeConfig, RuntimeServices};
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub runtime: ExtensionRuntime,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(|_| {}, RuntimeServices::in_memory)
    }

    pub fn with(
        configure: impl FnOnce(&mut RuntimeConfig),
        services: impl FnOnce(Arc<Jar>) -> RuntimeServices,
    ) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("miru_js_runtime=debug")
            .with_test_writer()
            .try_init();

        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::new(dir.path());
        config.preload.clear();
        configure(&mut config);

        let jar = Arc::new(Jar::default());
        let runtime = ExtensionRuntime::new(config, services(jar.clone()), jar).unwrap();
        Self { dir, runtime }
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.path().join(file_name)
    }

    pub fn write(&self, file_name: &str, source: &str) -> PathBuf {
        let path = self.path(file_name);
        std::fs::write(&path, source).unwrap();
        path
    }
}

/// A v2 extension file with the given package id and body.
pub fn v2(package: &str, body: &str) -> String {
    format!(
        "// ==MiruExtension==\n// @name {package}\n// @version v0.0.1\n// @package {package}\n// @type bangumi\n// @api 2\n// @webSite https://site.example\n// ==/MiruExtension==\n{body}\n"
    )
}

pub const DEMO: &str = r#"
async function latest(page) {
  return [{ title: "A", url: "/a", cover: "", update: "" }];
}
async function detail(url) {
  throw new Error("not found");
}
"#;

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
