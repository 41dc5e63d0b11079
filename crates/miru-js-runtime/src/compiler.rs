//! Program compiler.
//!
//! Turns an extension descriptor into a [`CompiledPackage`]: the shared
//! bootstrap for its API version plus the validated extension program and
//! the expressions used to construct and load it.
//!
//! QuickJS offers no script bytecode that can be shared between contexts,
//! so a [`Program`] is checked source text, parsed again by every context
//! that evaluates it.

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::descriptor::{ApiVersion, ExtensionDescriptor};
use crate::engine;
use crate::error::RuntimeError;

/// Prelude shared by every API version: promise bridge, timers, web shims.
pub(crate) const BRIDGE_PRELUDE: &str = include_str!("js/bridge.js");
const RUNTIME_V1: &str = include_str!("js/runtime_v1.js");
const RUNTIME_V2: &str = include_str!("js/runtime_v2.js");

/// Syntax-checked script text, evaluated from source in each context.
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub source: Arc<str>,
}

impl Program {
    /// Syntax-check `source` and wrap it.
    pub fn compile(name: impl Into<String>, source: impl Into<Arc<str>>) -> Result<Self, RuntimeError> {
        let name = name.into();
        let source = source.into();
        check_syntax(&name, &source)?;
        Ok(Self { name, source })
    }
}

/// Everything a run loop needs to bring one package to life.
#[derive(Debug, Clone)]
pub struct CompiledPackage {
    pub descriptor: Arc<ExtensionDescriptor>,
    pub base: Program,
    pub extension: Program,
    /// Evaluated once after both programs, e.g. `ext = new Ext(...)`.
    pub construct: Option<String>,
    /// Awaited after construction.
    pub load: String,
}

/// Compile a descriptor. Failures are returned, never panicked; the caller
/// records them on the registry entry.
pub fn compile(descriptor: Arc<ExtensionDescriptor>) -> Result<CompiledPackage, RuntimeError> {
    let base = base_program(descriptor.api)?;

    let (source, construct, load) = match descriptor.api {
        ApiVersion::V1 => {
            let (source, class_name) = normalize_legacy_class(&descriptor.source);
            let website = serde_json::to_string(&descriptor.website)?;
            let constructor = match class_name {
                Some(name) => format!("(globalThis.Ext || globalThis.{})", name),
                None => "globalThis.Ext".to_string(),
            };
            let construct = format!("ext = new {}({});", constructor, website);
            (source, Some(construct), "ext.load()".to_string())
        }
        ApiVersion::V2 => (descriptor.source.to_string(), None, "load()".to_string()),
    };

    let extension = Program::compile(descriptor.file_name.clone(), source)?;
    tracing::debug!(package = %descriptor.package_id, api = %descriptor.api, "compiled extension");

    Ok(CompiledPackage {
        descriptor,
        base: base.clone(),
        extension,
        construct,
        load,
    })
}

/// The bootstrap for `api`, validated once per process.
pub fn base_program(api: ApiVersion) -> Result<&'static Program, RuntimeError> {
    static V1: OnceLock<Result<Program, String>> = OnceLock::new();
    static V2: OnceLock<Result<Program, String>> = OnceLock::new();

    let (cell, name, source) = match api {
        ApiVersion::V1 => (&V1, "runtime_v1.js", RUNTIME_V1),
        ApiVersion::V2 => (&V2, "runtime_v2.js", RUNTIME_V2),
    };
    cell.get_or_init(|| Program::compile(name, source).map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|message| RuntimeError::Compile {
            name: name.to_string(),
            message: message.clone(),
        })
}

fn legacy_class_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^class\s+([A-Za-z_][A-Za-z0-9_]*)\s+extends\s+Extension\s*\{").expect("class regex")
    })
}

fn default_export_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^export\s+default\s+class\s+extends\s+Extension\s*\{").expect("export regex"))
}

/// Rewrite `class X extends Extension {` into a global assignment so the
/// class is reachable from the construction expression. Returns the first
/// class name found.
pub fn normalize_legacy_class(source: &str) -> (String, Option<String>) {
    let source = default_export_regex().replace_all(source, "Ext = class extends Extension {");
    let class_name = legacy_class_regex()
        .captures(&source)
        .map(|caps| caps[1].to_string())
        .or_else(|| source.contains("Ext = class extends Extension").then(|| "Ext".to_string()));
    let rewritten = legacy_class_regex().replace_all(&source, "$1 = class extends Extension {");
    (rewritten.into_owned(), class_name)
}

/// Parse without running: hand the source to the `Function` constructor in a
/// throwaway context. That is function-body grammar, so the few forms only
/// a script rejects (a top-level `return`) surface at initialization.
fn check_syntax(name: &str, source: &str) -> Result<(), RuntimeError> {
    let (_runtime, context) = engine::new_engine()?;
    context.with(|ctx| {
        let constructor: rquickjs::Function = ctx.globals().get("Function").map_err(|e| RuntimeError::Compile {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        constructor
            .call::<_, rquickjs::Value>((source,))
            .map(|_| ())
            .map_err(|e| RuntimeError::Compile {
                name: name.to_string(),
                message: engine::format_exception(&ctx, &e),
            })
    })
}
