//! Reloading, self-healing and the directory watcher.

mod common;

use std::time::Duration;

use common::{eventually, v2, Fixture, DEMO};
use miru_js_runtime::{LoadOutcome, RegistryEvent, RuntimeError, RuntimeServices};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reloading_unchanged_source_is_idempotent() {
    let fx = Fixture::new();
    let path = fx.write("demo.pkg.js", &v2("demo.pkg", DEMO));
    fx.runtime.scan().await.unwrap();
    fx.runtime.latest("demo.pkg", 1).await.unwrap();
    let before = fx.runtime.list_extensions();

    assert_eq!(
        fx.runtime.load_file(&path).await,
        LoadOutcome::Healthy("demo.pkg".to_string())
    );
    let after = fx.runtime.list_extensions();

    assert_eq!(before.len(), after.len());
    assert_eq!(before[0].descriptor, after[0].descriptor);
    assert!(after[0].is_healthy());
    assert_eq!(fx.runtime.latest("demo.pkg", 1).await.unwrap()[0].title, "A");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broken_package_heals_on_rewrite() {
    let fx = Fixture::new();
    let path = fx.write("demo.pkg.js", &v2("demo.pkg", "async function latest(page { return []; }"));
    fx.write("other.pkg.js", &v2("other.pkg", DEMO));
    fx.runtime.scan().await.unwrap();

    let err = fx.runtime.latest("demo.pkg", 1).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Unhealthy(_)));
    assert!(err.to_string().contains("compile error"));
    let listed = fx.runtime.list_extensions();
    assert!(!listed[0].error.is_empty());
    assert!(listed[1].is_healthy());

    let mut events = fx.runtime.subscribe();
    std::fs::write(&path, v2("demo.pkg", DEMO)).unwrap();
    assert!(fx.runtime.load_file(&path).await.is_healthy());

    assert_eq!(fx.runtime.latest("demo.pkg", 1).await.unwrap()[0].title, "A");
    assert!(fx.runtime.list_extensions()[0].is_healthy());
    assert_eq!(
        events.try_recv().unwrap(),
        RegistryEvent::Stored {
            package: "demo.pkg".to_string(),
            error: String::new()
        }
    );
    assert_eq!(fx.runtime.latest("other.pkg", 1).await.unwrap()[0].title, "A");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_reload_replaces_a_working_package() {
    let fx = Fixture::new();
    let path = fx.write("demo.pkg.js", &v2("demo.pkg", DEMO));
    fx.runtime.scan().await.unwrap();
    assert!(fx.runtime.latest("demo.pkg", 1).await.is_ok());

    std::fs::write(&path, v2("demo.pkg", "function (")).unwrap();
    assert!(!fx.runtime.load_file(&path).await.is_healthy());
    assert!(matches!(
        fx.runtime.latest("demo.pkg", 1).await,
        Err(RuntimeError::Unhealthy(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fixing_a_mismatch_drops_the_stale_aliases() {
    let fx = Fixture::new();
    let path = fx.write("demo.pkg.js", &v2("demo.other", DEMO));
    fx.runtime.scan().await.unwrap();
    assert_eq!(fx.runtime.list_extensions().len(), 2);

    std::fs::write(&path, v2("demo.pkg", DEMO)).unwrap();
    assert!(fx.runtime.load_file(&path).await.is_healthy());

    let listed = fx.runtime.list_extensions();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].descriptor.package_id, "demo.pkg");
    assert!(matches!(
        fx.runtime.latest("demo.other", 1).await,
        Err(RuntimeError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleted_file_is_removed() {
    let fx = Fixture::new();
    let path = fx.write("demo.pkg.js", &v2("demo.pkg", DEMO));
    fx.runtime.scan().await.unwrap();

    std::fs::remove_file(&path).unwrap();
    assert_eq!(
        fx.runtime.load_file(&path).await,
        LoadOutcome::Removed(vec!["demo.pkg".to_string()])
    );
    assert!(matches!(
        fx.runtime.latest("demo.pkg", 1).await,
        Err(RuntimeError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watcher_follows_the_directory() {
    let fx = Fixture::with(|c| c.watch_debounce_ms = 50, RuntimeServices::in_memory);
    fx.runtime.scan().await.unwrap();
    let watcher = fx.runtime.watch_directory().unwrap();
    tokio::spawn(watcher.run());

    let path = fx.write("demo.pkg.js", &v2("demo.pkg", DEMO));
    let runtime = fx.runtime.clone();
    assert!(
        eventually(Duration::from_secs(10), || {
            let runtime = runtime.clone();
            async move { runtime.latest("demo.pkg", 1).await.is_ok() }
        })
        .await,
        "new file was never loaded"
    );

    let body = r#"async function latest(page) { return [{ title: "B", url: "/b" }]; }"#;
    std::fs::write(&path, v2("demo.pkg", body)).unwrap();
    assert!(
        eventually(Duration::from_secs(10), || {
            let runtime = runtime.clone();
            async move {
                matches!(runtime.latest("demo.pkg", 1).await, Ok(items) if items[0].title == "B")
            }
        })
        .await,
        "rewrite was never picked up"
    );

    std::fs::remove_file(&path).unwrap();
    assert!(
        eventually(Duration::from_secs(10), || {
            let runtime = runtime.clone();
            async move { matches!(runtime.latest("demo.pkg", 1).await, Err(RuntimeError::NotFound(_))) }
        })
        .await,
        "deleted file was never removed"
    );

    // Files below the extension directory are not extensions.
    std::fs::create_dir_all(fx.path("root")).unwrap();
    std::fs::write(fx.path("root/helper.js"), "module.exports = 1;").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fx.runtime.list_extensions().is_empty());
}
