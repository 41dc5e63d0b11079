//! Error types for the extension runtime.

/// Errors raised while reading an extension's metadata header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("package name does not match the file name (file name: {file_name}, package name: {package})")]
    FilenameMismatch { file_name: String, package: String },

    #[error("missing required metadata tag @{0}")]
    MissingTag(&'static str),

    #[error("unsupported api version: {0}")]
    UnsupportedApi(String),
}

/// Errors that can occur while running extensions.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("extension {0} not found")]
    NotFound(String),

    /// The package is registered but broken; carries its stored error.
    #[error("{0}")]
    Unhealthy(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("compile error in {name}: {message}")]
    Compile { name: String, message: String },

    #[error("failed to create script engine: {0}")]
    EngineCreation(String),

    #[error("initialization failed: {0}")]
    Init(String),

    /// The expression threw before a promise existed.
    #[error("JavaScript error: {0}")]
    JavaScript(String),

    /// The promise rejected; carries the rejection's own properties.
    #[error("{}", render_rejection(.0))]
    Rejected(Vec<(String, String)>),

    #[error("promise was never settled: no native work outstanding and no script jobs pending")]
    Unsettled,

    #[error("failed to decode extension result: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Runtime has terminated")]
    Terminated,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("torrent handoff failed: {0}")]
    Torrent(String),

    #[error("extension runtime must be created inside a tokio runtime")]
    NoAsyncRuntime,

    #[error("failed to watch extension directory: {0}")]
    Watch(#[from] notify::Error),
}

fn render_rejection(properties: &[(String, String)]) -> String {
    let mut out = String::from("Js exception:");
    for (key, value) in properties {
        out.push_str(&format!("\n{} : {}", key, value));
    }
    out
}

/// Failures inside a native bridge call. These never escape as faults; they
/// are turned into promise rejections on the script side.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid arguments for {call}: {message}")]
    InvalidArguments { call: String, message: String },

    #[error("request failed: {0}")]
    Http(String),

    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("settings store error: {0}")]
    Settings(String),

    #[error("cookie store error: {0}")]
    Cookies(String),

    #[error("invalid JSON body: {0}")]
    Json(String),

    #[error("native worker panicked: {0}")]
    Panic(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
