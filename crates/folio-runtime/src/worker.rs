//! Worker thread owning one plugin's engine.
//!
//! The worker loads the plugin, reports metadata through the init channel,
//! then serves [`PluginCommand`]s until disposed or shut down. The engine
//! and [`HostState`] never leave this thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::await_protocol::{self, AwaitProgress, AwaitStatus, PendingAwait, StepReport};
use crate::bridge::{FetchOutcome, FetchRequest};
use crate::command::PluginCommand;
use crate::config::RuntimeConfig;
use crate::engine::{Engine, EngineLimits, ScriptValue};
use crate::environment;
use crate::error::{RuntimeError, RuntimeResult};
use crate::ops::{self, HostState, RuntimeStats, SharedHostState};
use crate::services::ScriptModule;
use crate::types::LoadInfo;

/// Rounds of native-job and script-queue draining per pump.
const PUMP_ROUNDS: usize = 16;

/// Everything the worker needs to load a plugin.
pub(crate) struct LoadRequest {
    pub plugin_id: String,
    pub source: String,
    pub modules: Vec<ScriptModule>,
    pub config: RuntimeConfig,
}

/// The main loop that runs inside the spawned thread.
pub(crate) async fn run_worker(
    request: LoadRequest,
    terminated: Arc<AtomicBool>,
    mut cmd_rx: mpsc::Receiver<PluginCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
    init_tx: std::sync::mpsc::SyncSender<RuntimeResult<LoadInfo>>,
) -> RuntimeResult<()> {
    let name = request.plugin_id.clone();

    let mut worker = match PluginWorker::load(&request) {
        Ok((worker, info)) => {
            let _ = init_tx.send(Ok(info));
            worker
        }
        Err(err) => {
            tracing::debug!("[run_worker:{}] Load failed: {}", name, err);
            let _ = init_tx.send(Err(err));
            return Ok(());
        }
    };

    loop {
        if *shutdown_rx.borrow() || terminated.load(Ordering::SeqCst) {
            tracing::debug!("[run_worker:{}] Shutdown signal received", name);
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("[run_worker:{}] Received shutdown signal", name);
                    break;
                }
            }

            cmd = cmd_rx.recv() => {
                let cmd = match cmd {
                    Some(cmd) => cmd,
                    None => {
                        tracing::debug!("[run_worker:{}] Command channel closed", name);
                        break;
                    }
                };

                tracing::trace!("[run_worker:{}] {}", name, cmd.name());
                if let PluginCommand::Dispose { reply } = cmd {
                    worker.dispose();
                    let _ = reply.send(());
                    break;
                }
                worker.handle(cmd);
            }
        }
    }

    worker.dispose();
    tracing::debug!("[run_worker:{}] Worker finished", name);
    Ok(())
}

struct PluginWorker {
    plugin_id: String,
    engine: Engine,
    host: SharedHostState,
}

impl PluginWorker {
    fn load(request: &LoadRequest) -> RuntimeResult<(Self, LoadInfo)> {
        let id = request.plugin_id.as_str();

        let mut engine = Engine::new(id, EngineLimits::from(&request.config));
        engine.initialize().map_err(load_error(id, "creating engine"))?;

        let host = HostState::shared(request.config.max_pending_fetches);
        ops::register_host_ops(&engine, &host).map_err(load_error(id, "registering host ops"))?;
        environment::install(&engine, &request.config, &request.modules)
            .map_err(load_error(id, "installing environment"))?;

        let worker = Self {
            plugin_id: id.to_string(),
            engine,
            host,
        };

        let label = format!("plugin:{}", id);
        worker
            .engine
            .evaluate_script(&label, &request.source)
            .map_err(load_error(id, "evaluating plugin source"))?;
        // Let top-level promise chains settle before probing the export.
        if let Err(err) = worker.pump() {
            tracing::warn!("[load:{}] Initial pump failed: {}", id, err);
        }

        let install = format!("JSON.stringify(__folio.install({}))", serde_json::to_string(id)?);
        let info = match worker.engine.evaluate(&install).map_err(load_error(id, "wrapping plugin"))? {
            ScriptValue::String(json) => serde_json::from_str::<LoadInfo>(&json)
                .map_err(|e| RuntimeError::plugin_load(id, "reading plugin metadata", e.into()))?,
            other => {
                return Err(RuntimeError::PluginLoad {
                    plugin_id: id.to_string(),
                    message: format!("wrapping plugin: unexpected install result {:?}", other),
                    cause: None,
                });
            }
        };

        worker.harvest_console();
        tracing::debug!(
            "[load:{}] Loaded {} v{} ({:?})",
            id,
            info.metadata.name,
            info.metadata.version,
            info.capabilities
        );
        Ok((worker, info))
    }

    fn handle(&mut self, cmd: PluginCommand) {
        match cmd {
            PluginCommand::Evaluate { source, reply } => {
                let result = self.engine.evaluate(&source);
                self.harvest_console();
                let _ = reply.send(result);
            }
            PluginCommand::BeginAwait { expression, reply } => {
                let _ = reply.send(self.begin_await(&expression));
            }
            PluginCommand::StepAwait { id, reply } => {
                // A caller that went away can no longer relay what it was handed.
                if let Err(Ok(report)) = reply.send(self.step(id)) {
                    self.fail_fetches(report.fetches, "await cancelled");
                }
            }
            PluginCommand::DeliverFetches { outcomes, reply } => {
                let _ = reply.send(self.deliver(outcomes));
            }
            PluginCommand::CancelAwait { id, reply } => {
                let _ = reply.send(Ok(self.cancel(id)));
            }
            PluginCommand::Filters { reply } => {
                let _ = reply.send(self.filters());
            }
            PluginCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            PluginCommand::Dispose { reply } => {
                self.dispose();
                let _ = reply.send(());
            }
        }
    }

    /// Drain native jobs and the script task queue until both are quiet.
    fn pump(&self) -> RuntimeResult<usize> {
        let mut total = 0;
        for _ in 0..PUMP_ROUNDS {
            let native = self.engine.run_pending_jobs()?;
            let scripted = self
                .engine
                .evaluate("__folio.pump()")?
                .as_f64()
                .unwrap_or_default() as usize;
            total += native + scripted;
            if native == 0 && scripted == 0 {
                break;
            }
        }
        Ok(total)
    }

    fn begin_await(&self, expression: &str) -> RuntimeResult<u64> {
        let id = self.host.borrow_mut().begin_await();
        if let Err(err) = self.engine.evaluate(&await_protocol::track_source(id, expression)) {
            self.host.borrow_mut().take_await(id);
            return Err(err);
        }
        tracing::trace!("[await:{}] issued on {}", id, self.plugin_id);
        Ok(id)
    }

    fn step(&self, id: u64) -> RuntimeResult<StepReport> {
        let ran = self.pump();
        // A no-op evaluation flushes anything a drained job left pending.
        let idle = self.engine.evaluate("void 0");
        self.harvest_console();
        ran?;
        idle?;

        let status = self.host.borrow().await_status(id);
        let progress = match status {
            Some(AwaitStatus::Pending) => AwaitProgress::Pending,
            Some(_) => match self.host.borrow_mut().take_await(id) {
                Some(PendingAwait {
                    status: AwaitStatus::Resolved,
                    result,
                    ..
                }) => AwaitProgress::Resolved(result.unwrap_or_else(|| "null".to_string())),
                Some(record) => AwaitProgress::Rejected(record.error.unwrap_or_default()),
                None => AwaitProgress::Rejected(format!("await {} disappeared", id)),
            },
            None => AwaitProgress::Rejected(format!("await {} is not tracked", id)),
        };

        if progress != AwaitProgress::Pending {
            // Another live await relays leftovers; without one nobody would.
            if !self.host.borrow().has_awaits() {
                let orphans = self.host.borrow_mut().take_fetches();
                self.fail_fetches(orphans, "await already settled");
            }
            return Ok(StepReport { progress, fetches: Vec::new() });
        }
        let fetches = self.host.borrow_mut().take_fetches();
        Ok(StepReport { progress, fetches })
    }

    fn fail_fetches(&self, requests: Vec<FetchRequest>, reason: &str) {
        if requests.is_empty() {
            return;
        }
        tracing::debug!("[worker:{}] Failing {} unrelayed fetches: {}", self.plugin_id, requests.len(), reason);
        let outcomes = requests
            .into_iter()
            .map(|request| (request.id, FetchOutcome::Failed(reason.to_string())))
            .collect();
        if let Err(err) = self.deliver(outcomes) {
            tracing::warn!("[worker:{}] Failing fetches raised: {}", self.plugin_id, err);
        }
    }

    fn deliver(&self, outcomes: Vec<(u64, FetchOutcome)>) -> RuntimeResult<()> {
        for (id, outcome) in outcomes {
            self.host.borrow_mut().finish_fetch(id);
            let source = match outcome {
                FetchOutcome::Completed(response) => {
                    let payload = serde_json::to_string(&response)?;
                    format!("__folio.completeFetch({}, {})", id, serde_json::to_string(&payload)?)
                }
                FetchOutcome::Failed(message) => {
                    format!("__folio.failFetch({}, {})", id, serde_json::to_string(&message)?)
                }
            };
            self.engine.evaluate(&source)?;
        }
        Ok(())
    }

    fn cancel(&self, id: u64) -> Option<PendingAwait> {
        let record = self.host.borrow_mut().take_await(id);
        if record.is_some() {
            tracing::debug!("[await:{}] cancelled on {}", id, self.plugin_id);
        }
        if !self.host.borrow().has_awaits() {
            let orphans = self.host.borrow_mut().take_fetches();
            self.fail_fetches(orphans, "await cancelled");
        }
        record
    }

    fn filters(&self) -> RuntimeResult<String> {
        let value = self.engine.evaluate("JSON.stringify(__folio.adapter.getFilters())");
        self.harvest_console();
        match value? {
            ScriptValue::String(json) => Ok(json),
            _ => Ok("{}".to_string()),
        }
    }

    fn stats(&self) -> RuntimeResult<RuntimeStats> {
        let timers = self
            .engine
            .evaluate("__folio.pendingTimers()")?
            .as_f64()
            .unwrap_or_default() as usize;
        Ok(self.host.borrow().stats(timers))
    }

    fn harvest_console(&self) {
        let (lines, dropped) = self.host.borrow_mut().take_console();
        ops::emit_console(&self.plugin_id, lines, dropped);
    }

    fn dispose(&mut self) {
        self.engine.dispose();
    }
}

fn load_error<'a>(plugin_id: &'a str, stage: &'static str) -> impl FnOnce(RuntimeError) -> RuntimeError + 'a {
    move |err| RuntimeError::plugin_load(plugin_id, stage, err)
}
