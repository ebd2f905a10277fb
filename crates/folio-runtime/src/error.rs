//! Error types for the plugin runtime.

/// Errors that can occur in the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to initialize script engine: {0}")]
    EngineInit(String),

    #[error("Script evaluation failed: {message}")]
    ScriptEvaluation {
        message: String,
        /// Stack trace reported by the interpreter, empty when unavailable.
        stack: String,
    },

    #[error("Failed to load plugin {plugin_id}: {message}")]
    PluginLoad {
        plugin_id: String,
        message: String,
        #[source]
        cause: Option<Box<RuntimeError>>,
    },

    #[error("Promise rejected: {message}")]
    PromiseRejected { message: String },

    #[error("Promise did not settle within {elapsed_ms}ms")]
    PromiseTimeout { elapsed_ms: u64 },

    #[error("Engine is not initialized")]
    EngineNotInitialized,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Runtime thread panicked")]
    ThreadPanic,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Interpreter error: {0}")]
    Js(String),
}

// Flattened to text so errors can cross the worker's reply channels.
impl From<rquickjs::Error> for RuntimeError {
    fn from(err: rquickjs::Error) -> Self {
        RuntimeError::Js(err.to_string())
    }
}

impl RuntimeError {
    /// Wrap an error raised while loading `plugin_id`.
    pub fn plugin_load(plugin_id: &str, stage: &str, cause: RuntimeError) -> Self {
        RuntimeError::PluginLoad {
            plugin_id: plugin_id.to_string(),
            message: format!("{}: {}", stage, cause),
            cause: Some(Box::new(cause)),
        }
    }

    /// True for failures that mean the plugin handle is no longer usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::EngineInit(_)
                | RuntimeError::EngineNotInitialized
                | RuntimeError::ChannelClosed
                | RuntimeError::ThreadPanic
        )
    }
}

/// Errors returned by a [`FetchBridgeService`](crate::services::FetchBridgeService).
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Request timed out")]
    TimedOut,

    #[error("No fetch bridge is configured")]
    Unavailable,
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
