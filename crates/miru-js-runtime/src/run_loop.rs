//! Per-package run loop.
//!
//! Each package gets a dedicated OS thread running a current-thread tokio
//! runtime. That thread owns the QuickJS runtime and context; nothing else
//! ever touches them. Calls arrive as commands, native completions arrive
//! on a second channel, and both are handled one at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rquickjs::{Context, Function, Runtime};
use tokio::sync::{mpsc, oneshot, watch};

use crate::bridge::{self, Bridge, BridgeContext, Completion, ModuleSource};
use crate::compiler::{CompiledPackage, BRIDGE_PRELUDE};
use crate::config::PreloadModule;
use crate::engine;
use crate::error::RuntimeError;
use crate::fetch::HttpClient;
use crate::job::Job;
use crate::services::RuntimeServices;

/// Shared, package-independent ingredients for starting loops.
#[derive(Clone)]
pub struct LoopEnv {
    pub services: RuntimeServices,
    pub http: HttpClient,
    /// Where native work runs; never the loop thread.
    pub handle: tokio::runtime::Handle,
    pub(crate) modules: Arc<ModuleSource>,
    pub preload: Vec<PreloadModule>,
    pub idle_timeout: Option<Duration>,
}

/// Commands sent to the loop thread.
pub(crate) enum LoopCommand {
    /// Evaluate an expression, await the promise it yields, reply with the
    /// fulfilled value as JSON.
    Call {
        expr: String,
        reply: oneshot::Sender<Result<serde_json::Value, RuntimeError>>,
    },
}

/// Handle to a running package loop.
pub struct RunLoopHandle {
    package: String,
    cmd_tx: mpsc::Sender<LoopCommand>,
    shutdown_tx: watch::Sender<bool>,
    terminated: Arc<AtomicBool>,
    job: Arc<Job>,
    thread_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RunLoopHandle {
    /// Submit one expression and wait for its promise to settle.
    pub async fn call(&self, expr: impl Into<String>) -> Result<serde_json::Value, RuntimeError> {
        if self.is_terminated() {
            return Err(RuntimeError::Terminated);
        }

        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(LoopCommand::Call {
                expr: expr.into(),
                reply,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;

        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    /// Native calls currently outstanding on this loop.
    pub fn outstanding_jobs(&self) -> usize {
        self.job.outstanding()
    }

    /// Signal the loop to stop after the command it is processing.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Block until the loop thread exits. Only call off the async runtime.
    pub fn join(self) {
        self.terminate();
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RunLoopHandle {
    fn drop(&mut self) {
        // Not joined: a runaway script would block the dropping thread.
        self.terminate();
    }
}

/// Start a loop for `compiled` and wait for initialization to finish.
///
/// Initialization installs the host functions, runs the bridge prelude, the
/// auxiliary modules, the base program and the extension program, then the
/// construction expression, and finally awaits the extension's `load()`.
pub async fn spawn_run_loop(compiled: CompiledPackage, env: LoopEnv) -> Result<RunLoopHandle, RuntimeError> {
    let package = compiled.descriptor.package_id.clone();
    tracing::debug!(package = %package, "starting run loop");

    let terminated = Arc::new(AtomicBool::new(false));
    let job = Arc::new(Job::new());
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (init_tx, init_rx) = oneshot::channel::<Result<(), RuntimeError>>();

    let thread_terminated = terminated.clone();
    let thread_job = job.clone();
    let thread_package = package.clone();
    let thread_handle = thread::Builder::new()
        .name(format!("miru-ext:{}", package))
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    thread_terminated.store(true, Ordering::SeqCst);
                    let _ = init_tx.send(Err(RuntimeError::SpawnFailed(e)));
                    return;
                }
            };

            rt.block_on(run_loop(
                compiled,
                env,
                thread_job,
                thread_terminated,
                cmd_rx,
                shutdown_rx,
                init_tx,
            ));

            rt.shutdown_background();
            tracing::debug!(package = %thread_package, "run loop thread exiting");
        })
        .map_err(RuntimeError::SpawnFailed)?;

    init_rx.await.map_err(|_| RuntimeError::ChannelClosed)??;
    tracing::debug!(package = %package, "run loop ready");

    Ok(RunLoopHandle {
        package,
        cmd_tx,
        shutdown_tx,
        terminated,
        job,
        thread_handle: Mutex::new(Some(thread_handle)),
    })
}

async fn run_loop(
    compiled: CompiledPackage,
    env: LoopEnv,
    job: Arc<Job>,
    terminated: Arc<AtomicBool>,
    mut cmd_rx: mpsc::Receiver<LoopCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
    init_tx: oneshot::Sender<Result<(), RuntimeError>>,
) {
    let package = compiled.descriptor.package_id.clone();

    let mut state = match LoopState::new(&package, &env, job.clone()) {
        Ok(state) => state,
        Err(e) => {
            terminated.store(true, Ordering::SeqCst);
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = state.initialize(&compiled, &env.preload).await {
        tracing::warn!(package = %package, "initialization failed: {}", e);
        terminated.store(true, Ordering::SeqCst);
        let _ = init_tx.send(Err(e));
        return;
    }
    let _ = init_tx.send(Ok(()));

    loop {
        if *shutdown_rx.borrow() || terminated.load(Ordering::SeqCst) {
            tracing::debug!(package = %package, "shutdown signal received");
            break;
        }

        // Armed only while no native work is outstanding.
        let idle_timeout = env.idle_timeout.filter(|_| !job.is_kept_alive());
        let idle = async move {
            match idle_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            completion = state.completions.recv() => {
                match completion {
                    Some(completion) => state.complete(completion),
                    None => break,
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(LoopCommand::Call { expr, reply }) => {
                        let result = state.call(&expr).await;
                        let _ = reply.send(result);
                    }
                    None => {
                        tracing::debug!(package = %package, "command channel closed");
                        break;
                    }
                }
            }

            _ = idle => {
                tracing::debug!(package = %package, "run loop idle, stopping");
                break;
            }
        }
    }

    terminated.store(true, Ordering::SeqCst);
}

/// Everything owned by the loop thread.
struct LoopState {
    package: String,
    runtime: Runtime,
    context: Context,
    bridge: Arc<Bridge>,
    job: Arc<Job>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

impl LoopState {
    fn new(package: &str, env: &LoopEnv, job: Arc<Job>) -> Result<Self, RuntimeError> {
        let (runtime, context) = engine::new_engine()?;
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let bridge_ctx = Arc::new(BridgeContext {
            package: package.to_string(),
            services: env.services.clone(),
            http: env.http.clone(),
        });
        let bridge = Arc::new(Bridge::new(
            bridge_ctx,
            env.handle.clone(),
            job.clone(),
            completion_tx,
            env.modules.clone(),
        ));
        Ok(Self {
            package: package.to_string(),
            runtime,
            context,
            bridge,
            job,
            completions,
        })
    }

    async fn initialize(&mut self, compiled: &CompiledPackage, preload: &[PreloadModule]) -> Result<(), RuntimeError> {
        let bridge = self.bridge.clone();
        let package = self.package.clone();

        self.context.with(|ctx| -> Result<(), RuntimeError> {
            bridge::install(&ctx, bridge, &compiled.descriptor).map_err(|e| {
                RuntimeError::Init(format!(
                    "failed to install host functions: {}",
                    engine::format_exception(&ctx, &e)
                ))
            })?;
            engine::eval_script(&ctx, "bridge.js", BRIDGE_PRELUDE).map_err(RuntimeError::Init)?;

            for module in preload {
                let script = format!(
                    "__preload({}, {});",
                    serde_json::to_string(&module.path)?,
                    serde_json::to_string(&module.bind)?
                );
                if let Err(e) = engine::eval_script(&ctx, &module.path, &script) {
                    tracing::warn!(package = %package, module = %module.path, "auxiliary module not loaded: {}", e);
                }
            }

            engine::eval_script(&ctx, &compiled.base.name, &compiled.base.source).map_err(RuntimeError::Init)?;
            engine::eval_script(&ctx, &compiled.extension.name, &compiled.extension.source)
                .map_err(RuntimeError::Init)?;
            if let Some(construct) = &compiled.construct {
                engine::eval_script(&ctx, "<construct>", construct).map_err(RuntimeError::Init)?;
            }
            Ok(())
        })?;

        self.call(&compiled.load)
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Init(e.to_string()))
    }

    /// Evaluate `expr` through `__dispatch` and pump until it settles.
    async fn call(&mut self, expr: &str) -> Result<serde_json::Value, RuntimeError> {
        let id = self.bridge.begin_call();
        let script = format!("__dispatch({}, () => ({}));", id, expr);
        let result = match self.context.with(|ctx| engine::eval_script(&ctx, "<call>", &script)) {
            Ok(()) => self.pump(id).await,
            Err(e) => Err(RuntimeError::JavaScript(e)),
        };
        if result.is_err() {
            self.bridge.abandon(id);
        }
        result
    }

    async fn pump(&mut self, id: u32) -> Result<serde_json::Value, RuntimeError> {
        loop {
            engine::drain_jobs(&self.runtime);

            if let Some(outcome) = self.bridge.take_settled(id) {
                return decode_outcome(outcome);
            }

            // Nothing queued in the engine and nothing outstanding natively:
            // the promise can never settle.
            if self.job.outstanding() == 0 {
                return Err(RuntimeError::Unsettled);
            }

            match self.completions.recv().await {
                Some(completion) => self.complete(completion),
                None => return Err(RuntimeError::ChannelClosed),
            }
        }
    }

    /// Settle a native job's promise on this thread.
    fn complete(&mut self, completion: Completion) {
        let id = completion.id;
        let (ok, payload) = match completion.outcome {
            Ok(value) => (true, value.to_string()),
            Err(message) => (false, message),
        };

        let result = self.context.with(|ctx| -> Result<(), String> {
            let settle: Function = ctx.globals().get("__settle").map_err(|e| e.to_string())?;
            settle
                .call::<_, ()>((id, ok, payload))
                .map_err(|e| engine::format_exception(&ctx, &e))
        });
        self.job.done();

        if let Err(e) = result {
            tracing::warn!(package = %self.package, id, "failed to settle native job: {}", e);
        }
        engine::drain_jobs(&self.runtime);
    }
}

/// Turn what `__dispatch` reported into a value or a descriptive error.
fn decode_outcome(outcome: Result<String, String>) -> Result<serde_json::Value, RuntimeError> {
    match outcome {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(json) => {
            let described: serde_json::Value =
                serde_json::from_str(&json).unwrap_or(serde_json::Value::String(json));
            let pairs = match described {
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .filter_map(|item| match item {
                        serde_json::Value::Array(pair) if pair.len() == 2 => {
                            let key = pair[0].as_str()?.to_string();
                            let value = match &pair[1] {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            Some((key, value))
                        }
                        _ => None,
                    })
                    .collect(),
                serde_json::Value::String(s) => vec![("error".to_string(), s)],
                other => vec![("error".to_string(), other.to_string())],
            };
            Err(RuntimeError::Rejected(pairs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::config::RuntimeConfig;
    use crate::descriptor::ExtensionDescriptor;
    use reqwest::cookie::Jar;

    fn env(preload: Vec<PreloadModule>, modules_root: std::path::PathBuf) -> LoopEnv {
        let jar = Arc::new(Jar::default());
        LoopEnv {
            services: RuntimeServices::in_memory(jar.clone()),
            http: HttpClient::new(jar, &RuntimeConfig::default()).unwrap(),
            handle: tokio::runtime::Handle::current(),
            modules: Arc::new(ModuleSource::new(modules_root)),
            preload,
            idle_timeout: None,
        }
    }

    fn package(source: &str, file_name: &str) -> CompiledPackage {
        let descriptor = ExtensionDescriptor::parse(source, file_name).unwrap();
        compiler::compile(Arc::new(descriptor)).unwrap()
    }

    const V2: &str = r#"// @package loop.test
// @api 2
// @webSite https://example.com
var counter = 0;
async function latest(page) {
  counter += 1;
  return [{ title: "item " + page, url: "/" + page, cover: "", update: "" }];
}
async function detail(url) { throw new Error("not found: " + url); }
function watch(url) { return new Promise(() => {}); }
var parked;
function park() { return new Promise((resolve) => { parked = resolve; }); }
function unpark() { parked("late"); return "released"; }
async function search(kw, page, filter) {
  await new Promise((resolve) => setTimeout(resolve, 20));
  return { kw, page, filter, counter, website: Miru.website };
}
"#;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_returns_fulfilled_value() {
        let handle = spawn_run_loop(package(V2, "loop.test.js"), env(vec![], "/nonexistent".into()))
            .await
            .unwrap();
        let value = handle.call("latest(3)").await.unwrap();
        assert_eq!(value[0]["title"], "item 3");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejection_carries_error_properties() {
        let handle = spawn_run_loop(package(V2, "loop.test.js"), env(vec![], "/nonexistent".into()))
            .await
            .unwrap();
        let err = handle.call("detail(\"/missing\")").await.unwrap_err();
        let RuntimeError::Rejected(pairs) = &err else {
            panic!("unexpected error: {err}");
        };
        assert!(pairs.iter().any(|(k, v)| k == "message" && v == "not found: /missing"));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn never_settling_promise_is_reported() {
        let handle = spawn_run_loop(package(V2, "loop.test.js"), env(vec![], "/nonexistent".into()))
            .await
            .unwrap();
        let err = handle.call("watch(\"/x\")").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unsettled));
        // The loop is still usable afterwards.
        assert!(handle.call("latest(1)").await.is_ok());

        // A given-up call that settles later does not leak into the next one.
        assert!(matches!(handle.call("park()").await, Err(RuntimeError::Unsettled)));
        assert_eq!(handle.call("unpark()").await.unwrap(), "released");
        assert_eq!(handle.call("latest(2)").await.unwrap()[0]["title"], "item 2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timers_keep_the_call_alive_and_state_persists() {
        let handle = spawn_run_loop(package(V2, "loop.test.js"), env(vec![], "/nonexistent".into()))
            .await
            .unwrap();
        handle.call("latest(1)").await.unwrap();
        let value = handle.call("search(\"kw\", 2, { sort: \"new\" })").await.unwrap();
        assert_eq!(value["kw"], "kw");
        assert_eq!(value["filter"]["sort"], "new");
        assert_eq!(value["counter"], 1);
        assert_eq!(value["website"], "https://example.com");
        assert_eq!(handle.outstanding_jobs(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn synchronous_throw_and_syntax_errors() {
        let handle = spawn_run_loop(package(V2, "loop.test.js"), env(vec![], "/nonexistent".into()))
            .await
            .unwrap();
        let err = handle
            .call("(() => { throw new Error(\"boom\"); })()")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        let err = handle.call("latest(").await.unwrap_err();
        assert!(matches!(err, RuntimeError::JavaScript(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_load_is_an_init_error() {
        let src = "// @package bad.load\n// @api 2\nasync function load() { throw new Error('no config'); }\n";
        let err = spawn_run_loop(package(src, "bad.load.js"), env(vec![], "/nonexistent".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Init(_)));
        assert!(err.to_string().contains("no config"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn script_only_syntax_errors_fail_initialization() {
        let src = "// @package top.return\n// @api 2\nreturn 1;\n";
        let err = spawn_run_loop(package(src, "top.return.js"), env(vec![], "/nonexistent".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Init(_)));
        assert!(err.to_string().contains("SyntaxError"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn v1_class_is_constructed() {
        let src = r#"// @package v1.demo
// @webSite https://v1.example
class Demo extends Extension {
  async latest(page) { return [{ title: this.webSite, url: String(page) }]; }
}
"#;
        let handle = spawn_run_loop(package(src, "v1.demo.js"), env(vec![], "/nonexistent".into()))
            .await
            .unwrap();
        let value = handle.call("ext.latest(7)").await.unwrap();
        assert_eq!(value[0]["title"], "https://v1.example");
        assert_eq!(value[0]["url"], "7");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn preloaded_modules_are_bound_globally() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("util")).unwrap();
        std::fs::write(dir.path().join("util/helper.js"), "exports.twice = (n) => n * 2;").unwrap();
        std::fs::write(
            dir.path().join("util/index.js"),
            "const h = require('./helper'); module.exports = { twice: h.twice, name: 'util' };",
        )
        .unwrap();

        let src = "// @package pre.load\n// @api 2\nasync function latest(page) { return twice(page); }\n";
        let preload = vec![
            PreloadModule::new("util/index.js", "twice"),
            PreloadModule::new("missing/module.js", "Missing"),
        ];
        let handle = spawn_run_loop(package(src, "pre.load.js"), env(preload, dir.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(handle.call("latest(21)").await.unwrap(), serde_json::json!(42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminated_loop_rejects_calls() {
        let handle = spawn_run_loop(package(V2, "loop.test.js"), env(vec![], "/nonexistent".into()))
            .await
            .unwrap();
        assert_eq!(handle.package(), "loop.test");
        handle.terminate();
        assert!(handle.is_terminated());
        assert!(matches!(handle.call("latest(1)").await, Err(RuntimeError::Terminated)));
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap();
    }

    #[test]
    fn decode_outcome_shapes() {
        assert_eq!(decode_outcome(Ok("[1,2]".to_string())).unwrap(), serde_json::json!([1, 2]));

        let err = decode_outcome(Err(r#"[["name","Error"],["message","x"]]"#.to_string())).unwrap_err();
        assert!(matches!(err, RuntimeError::Rejected(ref p) if p.len() == 2));

        let err = decode_outcome(Err(r#""plain""#.to_string())).unwrap_err();
        assert_eq!(err.to_string(), "Js exception:\nerror : plain");
    }
}
