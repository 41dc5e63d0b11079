//! Thin helpers over the QuickJS engine.

use rquickjs::context::EvalOptions;
use rquickjs::{Context, Ctx, Runtime, Value};

use crate::error::RuntimeError;

/// Create a fresh engine instance with a full standard library.
pub(crate) fn new_engine() -> Result<(Runtime, Context), RuntimeError> {
    let runtime = Runtime::new().map_err(|e| RuntimeError::EngineCreation(e.to_string()))?;
    let context = Context::full(&runtime).map_err(|e| RuntimeError::EngineCreation(e.to_string()))?;
    Ok((runtime, context))
}

/// Evaluate a script in global scope. Extension code is sloppy-mode, so the
/// script is not forced into strict mode.
pub(crate) fn eval_script(ctx: &Ctx<'_>, name: &str, source: &str) -> Result<(), String> {
    let mut options = EvalOptions::default();
    options.global = true;
    options.strict = false;
    options.backtrace_barrier = true;

    ctx.eval_with_options::<Value, _>(source, options)
        .map(|_| ())
        .map_err(|e| format!("{}: {}", name, format_exception(ctx, &e)))
}

/// Render the pending exception as `Name: message` plus its stack.
pub(crate) fn format_exception(ctx: &Ctx<'_>, error: &rquickjs::Error) -> String {
    if !matches!(error, rquickjs::Error::Exception) {
        return error.to_string();
    }

    let exception = ctx.catch();
    if let Some(obj) = exception.as_object() {
        let name = string_prop(obj, "name").unwrap_or_else(|| "Error".to_string());
        let message = string_prop(obj, "message").unwrap_or_default();
        let mut out = if message.is_empty() {
            name
        } else {
            format!("{}: {}", name, message)
        };
        if let Some(stack) = string_prop(obj, "stack").filter(|s| !s.trim().is_empty()) {
            out.push('\n');
            out.push_str(stack.trim_end());
        }
        return out;
    }

    if let Some(s) = exception.as_string() {
        if let Ok(s) = s.to_string() {
            return s;
        }
    }
    format!("{:?}", exception)
}

fn string_prop(obj: &rquickjs::Object<'_>, key: &str) -> Option<String> {
    let value: Value = obj.get(key).ok()?;
    value.as_string()?.to_string().ok()
}

/// Run queued promise reactions until the engine has none left.
pub(crate) fn drain_jobs(runtime: &Runtime) {
    while runtime.is_job_pending() {
        match runtime.execute_pending_job() {
            Ok(true) => {}
            Ok(false) => break,
            Err(_) => tracing::warn!("uncaught exception in script job"),
        }
    }
}
