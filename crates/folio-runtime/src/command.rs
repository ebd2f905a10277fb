//! Commands sent to a plugin worker.
//!
//! Every command runs to completion on the worker before the next one is
//! received, so each is kept short: long waits are split into steps driven
//! from the caller's task.

use tokio::sync::oneshot;

use crate::await_protocol::{PendingAwait, StepReport};
use crate::bridge::FetchOutcome;
use crate::engine::ScriptValue;
use crate::error::RuntimeError;
use crate::ops::RuntimeStats;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

pub(crate) enum PluginCommand {
    /// Evaluate source in the global scope and project the result.
    Evaluate {
        source: String,
        reply: Reply<ScriptValue>,
    },

    /// Start tracking an expression; replies with the await id.
    BeginAwait {
        expression: String,
        reply: Reply<u64>,
    },

    /// Pump the engine once and report on an await.
    StepAwait {
        id: u64,
        reply: Reply<StepReport>,
    },

    /// Settle relayed fetches inside the engine.
    DeliverFetches {
        outcomes: Vec<(u64, FetchOutcome)>,
        reply: Reply<()>,
    },

    /// Drop an await record, returning it if it still existed.
    CancelAwait {
        id: u64,
        reply: Reply<Option<PendingAwait>>,
    },

    /// Serialize the plugin's filter definitions.
    Filters { reply: Reply<String> },

    Stats { reply: Reply<RuntimeStats> },

    /// Release the engine. The worker exits after replying.
    Dispose { reply: oneshot::Sender<()> },
}

impl PluginCommand {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            PluginCommand::Evaluate { .. } => "evaluate",
            PluginCommand::BeginAwait { .. } => "begin_await",
            PluginCommand::StepAwait { .. } => "step_await",
            PluginCommand::DeliverFetches { .. } => "deliver_fetches",
            PluginCommand::CancelAwait { .. } => "cancel_await",
            PluginCommand::Filters { .. } => "filters",
            PluginCommand::Stats { .. } => "stats",
            PluginCommand::Dispose { .. } => "dispose",
        }
    }
}
