//! Miru JavaScript Extension Runtime
//!
//! Runs site-specific scraping extensions written in JavaScript. Each
//! extension is one `<package>.js` file; the runtime parses its metadata,
//! compiles it against the bootstrap for its API version and answers
//! `latest`/`search`/`detail`/`watch` calls by evaluating it.
//!
//! # Architecture
//!
//! - Each package runs in a dedicated thread with its own QuickJS runtime and
//!   a current-thread tokio runtime; nothing else ever touches its context
//! - Host functions return promises; the native work (HTTP, settings,
//!   cookies, timers) runs on the shared tokio runtime and its completion is
//!   sent back to the package thread, which settles the promise
//! - A per-package job counter keeps the loop alive while native work is
//!   outstanding
//! - Calls to one package are serialized by a per-entry lock; different
//!   packages never wait on each other
//! - The registry is the single source of truth; the watcher replaces or
//!   removes entries as files change

mod bridge;
mod engine;
mod job;
mod loader;
mod run_loop;

pub mod compiler;
pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod fetch;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod types;
pub mod watcher;

pub use bridge::RANDOM_BYTES_QUOTA;
pub use compiler::{compile, CompiledPackage, Program};
pub use config::{PreloadModule, RuntimeConfig, DEFAULT_USER_AGENT};
pub use descriptor::{ApiVersion, ContentKind, ExtensionDescriptor, ExtensionInfo};
pub use dispatcher::{Dispatcher, Operation};
pub use error::{BridgeError, MetadataError, RuntimeError, RuntimeResult};
pub use fetch::{FetchOptions, FetchResponse, HttpClient};
pub use loader::LoadOutcome;
pub use registry::{PackageEntry, PackageRegistry, RegistryEvent};
pub use run_loop::RunLoopHandle;
pub use runtime::ExtensionRuntime;
pub use services::{CookieStore, JarCookieStore, MemorySettingsStore, RuntimeServices, SettingsStore, TorrentClient};
pub use types::{
    BangumiWatch, Detail, Episode, EpisodeGroup, FikushonWatch, Filter, ListItem, MangaWatch, Subtitle, WatchResult,
};
pub use watcher::ExtensionWatcher;

/// Re-exported so callers can share one cookie jar with the runtime.
pub use reqwest::cookie::Jar;
