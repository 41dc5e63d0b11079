//! Async native bridge.
//!
//! Script code calls `__native.spawn(request)` through the prelude's
//! `__bridge(kind, payload)`, which wraps the returned job id in a promise.
//! The native work runs on the shared tokio runtime, never on the loop
//! thread, and exactly one [`Completion`] per job is sent back to the loop,
//! which settles the promise and marks the job done.
//!
//! The web-standard helpers (`btoa`, `atob`, random bytes, UUIDs, logging,
//! module source reads for `require`) are plain synchronous functions.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use rquickjs::{Ctx, Exception, Function, Object};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::descriptor::ExtensionDescriptor;
use crate::error::BridgeError;
use crate::fetch::{FetchOptions, HttpClient};
use crate::job::Job;
use crate::services::RuntimeServices;

/// Largest buffer `crypto.getRandomValues` will fill.
pub const RANDOM_BYTES_QUOTA: usize = 65_536;

/// Result of one native job, delivered back to the owning loop.
#[derive(Debug)]
pub(crate) struct Completion {
    pub id: u32,
    pub outcome: Result<serde_json::Value, String>,
}

/// A decoded `__native.spawn` request.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
pub(crate) enum NativeCall {
    #[serde(rename = "fetch")]
    Fetch {
        url: String,
        #[serde(default)]
        options: FetchOptions,
    },
    /// `jsRequest`: like fetch but resolves to the body text.
    #[serde(rename = "request")]
    Request {
        url: String,
        #[serde(default)]
        options: FetchOptions,
    },
    #[serde(rename = "settings.get")]
    GetSetting { key: String },
    #[serde(rename = "settings.set")]
    SetSetting { key: String, value: serde_json::Value },
    #[serde(rename = "settings.register")]
    RegisterSetting { schema: serde_json::Value },
    #[serde(rename = "cookies.get")]
    GetCookies { url: String },
    #[serde(rename = "cookies.set")]
    SetCookies { url: String, cookies: Vec<String> },
    #[serde(rename = "json")]
    ParseJson { body: String },
    #[serde(rename = "text")]
    Text { body: String },
    #[serde(rename = "sleep")]
    Sleep { ms: u64 },
}

impl NativeCall {
    pub fn parse(request: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(request).map_err(|e| {
            let call = serde_json::from_str::<serde_json::Value>(request)
                .ok()
                .and_then(|v| v.get("kind").and_then(|k| k.as_str()).map(str::to_string))
                .unwrap_or_else(|| "<unknown>".to_string());
            BridgeError::InvalidArguments {
                call,
                message: e.to_string(),
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::Request { .. } => "request",
            Self::GetSetting { .. } => "settings.get",
            Self::SetSetting { .. } => "settings.set",
            Self::RegisterSetting { .. } => "settings.register",
            Self::GetCookies { .. } => "cookies.get",
            Self::SetCookies { .. } => "cookies.set",
            Self::ParseJson { .. } => "json",
            Self::Text { .. } => "text",
            Self::Sleep { .. } => "sleep",
        }
    }

    /// Perform the call. Runs on a native worker.
    pub async fn run(self, ctx: Arc<BridgeContext>) -> Result<serde_json::Value, BridgeError> {
        use serde_json::Value;

        match self {
            Self::Fetch { url, options } => {
                let response = ctx.http.fetch(&url, &options).await?;
                serde_json::to_value(response).map_err(|e| BridgeError::Json(e.to_string()))
            }
            Self::Request { url, options } => {
                let url = url.replace("&amp;", "&");
                let response = ctx.http.fetch(&url, &options).await?;
                Ok(Value::String(response.body))
            }
            Self::GetSetting { key } => Ok(ctx
                .services
                .settings
                .get(&ctx.package, &key)
                .await?
                .map(Value::String)
                .unwrap_or(Value::Null)),
            Self::SetSetting { key, value } => {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                ctx.services.settings.set(&ctx.package, &key, value).await?;
                Ok(Value::Null)
            }
            Self::RegisterSetting { schema } => {
                if !schema.is_object() {
                    return Err(BridgeError::Settings("invalid setting object, expected a map".to_string()));
                }
                ctx.services.settings.register(&ctx.package, schema).await?;
                Ok(Value::Null)
            }
            Self::GetCookies { url } => {
                let cookies = ctx.services.cookies.get(&url).await?;
                Ok(Value::from(cookies))
            }
            Self::SetCookies { url, cookies } => {
                ctx.services.cookies.set(&url, cookies).await?;
                Ok(Value::Null)
            }
            Self::ParseJson { body } => serde_json::from_str(&body).map_err(|e| BridgeError::Json(e.to_string())),
            Self::Text { body } => Ok(Value::String(body)),
            Self::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::Null)
            }
        }
    }
}

/// What native workers need; shared, immutable, `Send`.
pub(crate) struct BridgeContext {
    pub package: String,
    pub services: RuntimeServices,
    pub http: HttpClient,
}

/// Per-loop bridge state. Lives on the loop thread and inside the host
/// functions installed into that loop's context.
pub(crate) struct Bridge {
    ctx: Arc<BridgeContext>,
    handle: tokio::runtime::Handle,
    job: Arc<Job>,
    next_id: AtomicU32,
    completions: mpsc::UnboundedSender<Completion>,
    /// Dispatched calls still awaited by the loop, with their outcome once
    /// `__dispatch` reports it through `__native.settleCall`.
    calls: Mutex<HashMap<u32, Option<Result<String, String>>>>,
    modules: Arc<ModuleSource>,
}

impl Bridge {
    pub fn new(
        ctx: Arc<BridgeContext>,
        handle: tokio::runtime::Handle,
        job: Arc<Job>,
        completions: mpsc::UnboundedSender<Completion>,
        modules: Arc<ModuleSource>,
    ) -> Self {
        Self {
            ctx,
            handle,
            job,
            next_id: AtomicU32::new(1),
            completions,
            calls: Mutex::new(HashMap::new()),
            modules,
        }
    }

    pub fn package(&self) -> &str {
        &self.ctx.package
    }

    pub fn next_call_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start native work and return its job id. Always produces exactly one
    /// completion for the id, even for malformed requests or panics.
    pub fn spawn(&self, request: &str) -> u32 {
        let id = self.next_call_id();
        self.job.add();

        let call = match NativeCall::parse(request) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(package = %self.ctx.package, "rejecting native call: {}", e);
                let _ = self.completions.send(Completion {
                    id,
                    outcome: Err(e.to_string()),
                });
                return id;
            }
        };

        tracing::trace!(package = %self.ctx.package, id, call = call.name(), "native call");
        let task = self.handle.spawn(call.run(self.ctx.clone()));
        let completions = self.completions.clone();
        self.handle.spawn(async move {
            let outcome = match task.await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) if e.is_panic() => Err(BridgeError::Panic(panic_message(e.into_panic())).to_string()),
                Err(e) => Err(e.to_string()),
            };
            // The loop may already be gone; nothing to settle then.
            let _ = completions.send(Completion { id, outcome });
        });
        id
    }

    /// Allocate an id for a dispatched call and start awaiting it.
    pub fn begin_call(&self) -> u32 {
        let id = self.next_call_id();
        self.calls.lock().insert(id, None);
        id
    }

    /// Outcomes for calls nobody awaits any more are dropped.
    pub fn settle_call(&self, id: u32, ok: bool, payload: String) {
        let outcome = if ok { Ok(payload) } else { Err(payload) };
        match self.calls.lock().get_mut(&id) {
            Some(slot) => *slot = Some(outcome),
            None => tracing::trace!(package = %self.ctx.package, id, "dropping outcome of abandoned call"),
        }
    }

    pub fn take_settled(&self, id: u32) -> Option<Result<String, String>> {
        let mut calls = self.calls.lock();
        match calls.get(&id) {
            Some(Some(_)) => calls.remove(&id).flatten(),
            _ => None,
        }
    }

    /// Stop awaiting `id`; a later settlement is discarded.
    pub fn abandon(&self, id: u32) {
        self.calls.lock().remove(&id);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auxiliary module sources
// ─────────────────────────────────────────────────────────────────────────────

/// Reads `require`d files from the module root, caching sources for the
/// life of the process so each file is read from disk once.
#[derive(Debug)]
pub(crate) struct ModuleSource {
    root: PathBuf,
    cache: DashMap<PathBuf, Option<Arc<str>>>,
}

impl ModuleSource {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            cache: DashMap::new(),
        }
    }

    /// Source of `relative`, or `None` when missing or outside the root.
    pub fn read(&self, relative: &str) -> Option<Arc<str>> {
        let path = self.resolve(relative)?;
        if let Some(cached) = self.cache.get(&path) {
            return cached.value().clone();
        }
        let source = std::fs::read_to_string(&path).ok().map(Arc::<str>::from);
        self.cache.insert(path, source.clone());
        source
    }

    fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(relative.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host functions
// ─────────────────────────────────────────────────────────────────────────────

/// Install `__extension` metadata and the `__native` host object.
pub(crate) fn install(ctx: &Ctx<'_>, bridge: Arc<Bridge>, descriptor: &ExtensionDescriptor) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let extension = Object::new(ctx.clone())?;
    extension.set("pkg", descriptor.package_id.as_str())?;
    extension.set("name", descriptor.name.as_str())?;
    extension.set("website", descriptor.website.as_str())?;
    extension.set("api", descriptor.api.as_str())?;
    globals.set("__extension", extension)?;

    let native = Object::new(ctx.clone())?;

    let b = bridge.clone();
    native.set("spawn", Function::new(ctx.clone(), move |request: String| b.spawn(&request))?)?;

    let b = bridge.clone();
    native.set(
        "settleCall",
        Function::new(ctx.clone(), move |id: u32, ok: bool, payload: String| {
            b.settle_call(id, ok, payload)
        })?,
    )?;

    let package = bridge.package().to_string();
    native.set(
        "log",
        Function::new(ctx.clone(), move |level: String, message: String| {
            log_from_script(&package, &level, &message)
        })?,
    )?;

    native.set(
        "btoa",
        Function::new(ctx.clone(), |ctx: Ctx, input: String| -> rquickjs::Result<String> {
            encode_base64(&input).map_err(|message| Exception::throw_message(&ctx, &message))
        })?,
    )?;

    native.set(
        "atob",
        Function::new(ctx.clone(), |ctx: Ctx, input: String| -> rquickjs::Result<String> {
            decode_base64(&input).map_err(|message| Exception::throw_message(&ctx, &message))
        })?,
    )?;

    native.set(
        "randomBytes",
        Function::new(ctx.clone(), |ctx: Ctx, len: u32| -> rquickjs::Result<Vec<u8>> {
            random_bytes(len as usize).map_err(|message| Exception::throw_message(&ctx, &message))
        })?,
    )?;

    native.set(
        "uuid",
        Function::new(ctx.clone(), || uuid::Uuid::new_v4().to_string())?,
    )?;

    let modules = bridge.modules.clone();
    native.set(
        "readModule",
        Function::new(ctx.clone(), move |path: String| modules.read(&path).map(|s| s.to_string()))?,
    )?;

    globals.set("__native", native)?;
    Ok(())
}

fn log_from_script(package: &str, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: "miru.js", package = %package, "{}", message),
        "warn" => tracing::warn!(target: "miru.js", package = %package, "{}", message),
        "debug" => tracing::debug!(target: "miru.js", package = %package, "{}", message),
        _ => tracing::info!(target: "miru.js", package = %package, "{}", message),
    }
}

/// `btoa`: the input is a binary string, one byte per char.
pub(crate) fn encode_base64(input: &str) -> Result<String, String> {
    let bytes = input
        .chars()
        .map(|c| u8::try_from(u32::from(c)))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| "InvalidCharacterError: string contains characters outside of the Latin1 range".to_string())?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// `atob`: standard alphabet, padding optional. Returns a binary string,
/// one char per decoded byte.
pub(crate) fn decode_base64(input: &str) -> Result<String, String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};

    let trimmed: String = input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(&trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed.trim_end_matches('=')))
        .map_err(|e| format!("InvalidCharacterError: {}", e))?;
    Ok(bytes.into_iter().map(char::from).collect())
}

pub(crate) fn random_bytes(len: usize) -> Result<Vec<u8>, String> {
    if len > RANDOM_BYTES_QUOTA {
        return Err(format!(
            "QuotaExceededError: requested {} bytes, the limit is {}",
            len, RANDOM_BYTES_QUOTA
        ));
    }
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    Ok(bytes)
}
