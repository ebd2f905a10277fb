//! Await protocol: waiting on a script promise from host code.
//!
//! QuickJS has no event loop, so nothing settles unless the host drives it.
//! [`drive`] issues the expression, then alternates between relaying fetches
//! on the calling task and short pump steps on the worker until the promise
//! settles or the timeout elapses. The worker is only held for each step.

use std::time::Instant;

use tokio::sync::oneshot;

use crate::bridge::{self, FetchOutcome, FetchRequest};
use crate::command::PluginCommand;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::PluginHandle;

/// Settlement state of an awaited expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitStatus {
    Pending,
    Resolved,
    Rejected,
}

/// Host-side record for one in-flight await.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAwait {
    pub id: u64,
    pub status: AwaitStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub trace: Vec<String>,
}

impl PendingAwait {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            status: AwaitStatus::Pending,
            result: None,
            error: None,
            trace: Vec::new(),
        }
    }

    /// Record the script's report. Only the first report counts.
    pub(crate) fn settle(&mut self, ok: bool, payload: String) -> bool {
        if self.status != AwaitStatus::Pending {
            return false;
        }
        if ok {
            self.status = AwaitStatus::Resolved;
            self.result = Some(payload);
        } else {
            self.status = AwaitStatus::Rejected;
            self.error = Some(payload);
        }
        true
    }
}

/// Where an await stands after one worker step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AwaitProgress {
    Pending,
    Resolved(String),
    Rejected(String),
}

/// Reply to a step command.
#[derive(Debug, Clone)]
pub(crate) struct StepReport {
    pub progress: AwaitProgress,
    /// Requests queued by the script since the previous step.
    pub fetches: Vec<FetchRequest>,
}

/// Source evaluated on the worker to start tracking `expression`.
pub(crate) fn track_source(id: u64, expression: &str) -> String {
    format!("__folio.track({}, function () {{ return ({}\n); }});", id, expression)
}

/// Cleans up an await on every exit path, including a dropped future.
///
/// Holds the ids of fetches taken from the worker but not yet delivered, so
/// their in-flight slots are released along with the record.
struct AwaitGuard<'a> {
    handle: &'a PluginHandle,
    id: u64,
    inflight: Vec<u64>,
    armed: bool,
}

impl<'a> AwaitGuard<'a> {
    fn new(handle: &'a PluginHandle, id: u64) -> Self {
        Self {
            handle,
            id,
            inflight: Vec::new(),
            armed: true,
        }
    }

    /// The worker already dropped the record.
    fn settled(&mut self) {
        self.armed = false;
    }

    fn abandoned(&mut self, reason: &str) -> Vec<(u64, FetchOutcome)> {
        self.inflight
            .drain(..)
            .map(|id| (id, FetchOutcome::Failed(reason.to_string())))
            .collect()
    }

    /// Fail undelivered fetches and remove the record.
    async fn release(&mut self, reason: &str) -> RuntimeResult<Option<PendingAwait>> {
        self.armed = false;
        let abandoned = self.abandoned(reason);
        if !abandoned.is_empty() {
            let _ = self.handle.deliver_fetches(abandoned).await;
        }
        self.handle.cancel_await(self.id).await
    }

    /// Release after the deadline and build the timeout error.
    async fn expire(&mut self, started: Instant) -> RuntimeError {
        let trace = match self.release("await timed out").await {
            Ok(record) => record.map(|r| r.trace).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let elapsed = started.elapsed();
        tracing::warn!(
            "[await:{}] timed out after {}ms; trace: [{}]",
            self.id,
            elapsed.as_millis(),
            trace.join(" | ")
        );
        RuntimeError::PromiseTimeout {
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

impl Drop for AwaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!("[await:{}] dropped before settling, cancelling", self.id);

        let abandoned = self.abandoned("await cancelled");
        let mut posted = true;
        if !abandoned.is_empty() {
            let (reply, _) = oneshot::channel();
            posted &= self
                .handle
                .cmd_tx
                .try_send(PluginCommand::DeliverFetches { outcomes: abandoned, reply })
                .is_ok();
        }
        let (reply, _) = oneshot::channel();
        posted &= self
            .handle
            .cmd_tx
            .try_send(PluginCommand::CancelAwait { id: self.id, reply })
            .is_ok();
        if !posted {
            tracing::warn!("[await:{}] mailbox full, cleanup left to the next step", self.id);
        }
    }
}

/// Await `expression` and return its settled value as JSON text.
pub(crate) async fn drive(handle: &PluginHandle, expression: &str) -> RuntimeResult<String> {
    let config = handle.config();
    let timeout = config.await_timeout();
    let interval = config.poll_interval();

    let id = handle.begin_await(expression).await?;
    let started = Instant::now();
    let mut guard = AwaitGuard::new(handle, id);
    let mut fetches: Vec<FetchRequest> = Vec::new();

    loop {
        if !fetches.is_empty() {
            let remaining = timeout.saturating_sub(started.elapsed());
            let relay = bridge::perform_all(handle.services(), std::mem::take(&mut fetches));
            let outcomes = match tokio::time::timeout(remaining, relay).await {
                Ok(outcomes) => outcomes,
                Err(_) => return Err(guard.expire(started).await),
            };
            guard.inflight.clear();
            if let Err(err) = handle.deliver_fetches(outcomes).await {
                let _ = guard.release("await failed").await;
                return Err(err);
            }
        }

        let report = match handle.step_await(id).await {
            Ok(report) => report,
            Err(err) => {
                let _ = guard.release("await failed").await;
                return Err(err);
            }
        };

        match report.progress {
            AwaitProgress::Resolved(text) => {
                guard.settled();
                tracing::trace!("[await:{}] resolved after {:?}", id, started.elapsed());
                return Ok(text);
            }
            AwaitProgress::Rejected(message) => {
                guard.settled();
                tracing::debug!("[await:{}] rejected: {}", id, message);
                return Err(RuntimeError::PromiseRejected { message });
            }
            AwaitProgress::Pending => {}
        }
        fetches = report.fetches;
        guard.inflight = fetches.iter().map(|request| request.id).collect();

        if started.elapsed() >= timeout {
            return Err(guard.expire(started).await);
        }

        if fetches.is_empty() {
            tracing::trace!("[await:{}] pending, sleeping {:?}", id, interval);
            tokio::time::sleep(interval).await;
        }
    }
}
