//! Native host object exposed to scripts as `__folioHost`.
//!
//! These are the only native entry points the environment bundle calls.
//! Each reads or writes [`HostState`], which lives on the worker thread
//! next to the engine.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use rquickjs::{Function, Object};

use crate::await_protocol::{AwaitStatus, PendingAwait};
use crate::bridge::FetchRequest;
use crate::engine::Engine;
use crate::error::RuntimeResult;

/// Global name of the host object.
pub(crate) const HOST_GLOBAL: &str = "__folioHost";

/// Console lines kept between harvests; older lines are dropped first.
const CONSOLE_CAPACITY: usize = 1000;

pub(crate) type SharedHostState = Rc<RefCell<HostState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsoleLevel {
    Debug,
    Log,
    Warn,
    Error,
}

impl ConsoleLevel {
    fn parse(level: &str) -> Self {
        match level {
            "error" => ConsoleLevel::Error,
            "warn" => ConsoleLevel::Warn,
            "debug" | "trace" => ConsoleLevel::Debug,
            _ => ConsoleLevel::Log,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConsoleLine {
    pub level: ConsoleLevel,
    pub message: String,
}

/// Counters reported by [`PluginHandle::stats`](crate::PluginHandle::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub pending_awaits: usize,
    pub queued_fetches: usize,
    pub inflight_fetches: usize,
    pub pending_timers: usize,
}

#[derive(Debug)]
pub(crate) struct HostState {
    awaits: HashMap<u64, PendingAwait>,
    next_await_id: u64,
    fetch_queue: VecDeque<FetchRequest>,
    inflight: HashSet<u64>,
    next_fetch_id: u64,
    fetch_capacity: usize,
    console: VecDeque<ConsoleLine>,
    dropped_console: usize,
}

impl HostState {
    pub(crate) fn new(fetch_capacity: usize) -> Self {
        Self {
            awaits: HashMap::new(),
            next_await_id: 1,
            fetch_queue: VecDeque::new(),
            inflight: HashSet::new(),
            next_fetch_id: 1,
            fetch_capacity,
            console: VecDeque::new(),
            dropped_console: 0,
        }
    }

    pub(crate) fn shared(fetch_capacity: usize) -> SharedHostState {
        Rc::new(RefCell::new(Self::new(fetch_capacity)))
    }

    // ── Awaits ──────────────────────────────────────────────────────────────

    pub(crate) fn begin_await(&mut self) -> u64 {
        let id = self.next_await_id;
        self.next_await_id += 1;
        self.awaits.insert(id, PendingAwait::new(id));
        id
    }

    /// Unknown and already settled ids are ignored.
    pub(crate) fn settle(&mut self, id: u64, ok: bool, payload: String) -> bool {
        match self.awaits.get_mut(&id) {
            Some(record) => record.settle(ok, payload),
            None => false,
        }
    }

    pub(crate) fn trace(&mut self, id: u64, line: String) {
        if let Some(record) = self.awaits.get_mut(&id) {
            record.trace.push(line);
        }
    }

    pub(crate) fn await_status(&self, id: u64) -> Option<AwaitStatus> {
        self.awaits.get(&id).map(|record| record.status)
    }

    pub(crate) fn take_await(&mut self, id: u64) -> Option<PendingAwait> {
        self.awaits.remove(&id)
    }

    pub(crate) fn has_awaits(&self) -> bool {
        !self.awaits.is_empty()
    }

    // ── Fetches ─────────────────────────────────────────────────────────────

    /// Queue a request described by script JSON; returns its id, or -1 when
    /// the request is malformed or the relay is at capacity.
    pub(crate) fn enqueue_fetch(&mut self, request_json: &str) -> f64 {
        if self.fetch_queue.len() + self.inflight.len() >= self.fetch_capacity {
            tracing::warn!("[fetch] Relay at capacity ({}), rejecting request", self.fetch_capacity);
            return -1.0;
        }
        let mut request: FetchRequest = match serde_json::from_str(request_json) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!("[fetch] Malformed request from script: {}", err);
                return -1.0;
            }
        };
        request.id = self.next_fetch_id;
        self.next_fetch_id += 1;
        let id = request.id;
        self.fetch_queue.push_back(request);
        id as f64
    }

    /// Hand every queued request to the relay.
    pub(crate) fn take_fetches(&mut self) -> Vec<FetchRequest> {
        let taken: Vec<FetchRequest> = self.fetch_queue.drain(..).collect();
        self.inflight.extend(taken.iter().map(|request| request.id));
        taken
    }

    pub(crate) fn finish_fetch(&mut self, id: u64) {
        self.inflight.remove(&id);
    }

    // ── Console ─────────────────────────────────────────────────────────────

    pub(crate) fn push_console(&mut self, level: &str, message: String) {
        if self.console.len() >= CONSOLE_CAPACITY {
            self.console.pop_front();
            self.dropped_console += 1;
        }
        self.console.push_back(ConsoleLine {
            level: ConsoleLevel::parse(level),
            message,
        });
    }

    pub(crate) fn take_console(&mut self) -> (Vec<ConsoleLine>, usize) {
        let dropped = std::mem::take(&mut self.dropped_console);
        (self.console.drain(..).collect(), dropped)
    }

    pub(crate) fn stats(&self, pending_timers: usize) -> RuntimeStats {
        RuntimeStats {
            pending_awaits: self.awaits.len(),
            queued_fetches: self.fetch_queue.len(),
            inflight_fetches: self.inflight.len(),
            pending_timers,
        }
    }
}

/// Install `__folioHost` in the engine's global scope.
pub(crate) fn register_host_ops(engine: &Engine, state: &SharedHostState) -> RuntimeResult<()> {
    engine.with_context(|ctx| {
        let host = Object::new(ctx.clone())?;

        let s = state.clone();
        host.set(
            "settle",
            Function::new(ctx.clone(), move |id: f64, ok: bool, payload: String| -> bool {
                s.borrow_mut().settle(id as u64, ok, payload)
            })?,
        )?;

        let s = state.clone();
        host.set(
            "trace",
            Function::new(ctx.clone(), move |id: f64, line: String| {
                s.borrow_mut().trace(id as u64, line);
            })?,
        )?;

        let s = state.clone();
        host.set(
            "enqueueFetch",
            Function::new(ctx.clone(), move |request: String| -> f64 {
                s.borrow_mut().enqueue_fetch(&request)
            })?,
        )?;

        let s = state.clone();
        host.set(
            "console",
            Function::new(ctx.clone(), move |level: String, message: String| {
                s.borrow_mut().push_console(&level, message);
            })?,
        )?;

        ctx.globals().set(HOST_GLOBAL, host)?;
        Ok(())
    })
}

/// Forward harvested console lines to tracing.
pub(crate) fn emit_console(plugin_id: &str, lines: Vec<ConsoleLine>, dropped: usize) {
    if dropped > 0 {
        tracing::warn!(target: "folio.js.console", plugin = %plugin_id, "{} console lines dropped", dropped);
    }
    for line in lines {
        match line.level {
            ConsoleLevel::Error => {
                tracing::error!(target: "folio.js.console", plugin = %plugin_id, "{}", line.message)
            }
            ConsoleLevel::Warn => {
                tracing::warn!(target: "folio.js.console", plugin = %plugin_id, "{}", line.message)
            }
            ConsoleLevel::Log => {
                tracing::info!(target: "folio.js.console", plugin = %plugin_id, "{}", line.message)
            }
            ConsoleLevel::Debug => {
                tracing::debug!(target: "folio.js.console", plugin = %plugin_id, "{}", line.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineLimits, ScriptValue};

    #[test]
    fn test_settle_ignores_unknown_and_repeat_reports() {
        let mut state = HostState::new(4);
        let id = state.begin_await();

        assert!(!state.settle(id + 100, true, "1".to_string()));
        assert!(state.settle(id, true, "1".to_string()));
        assert!(!state.settle(id, false, "late".to_string()));
        assert_eq!(state.await_status(id), Some(AwaitStatus::Resolved));

        let record = state.take_await(id).unwrap();
        assert_eq!(record.result.as_deref(), Some("1"));
        assert_eq!(state.stats(0).pending_awaits, 0);
    }

    #[test]
    fn test_await_ids_are_not_reused() {
        let mut state = HostState::new(4);
        let first = state.begin_await();
        state.take_await(first);
        assert!(state.begin_await() > first);
    }

    #[test]
    fn test_fetch_queue_is_bounded() {
        let mut state = HostState::new(2);
        let request = r#"{"url":"https://a.test/","method":"GET","headers":{},"body":null}"#;

        assert_eq!(state.enqueue_fetch(request), 1.0);
        assert_eq!(state.enqueue_fetch(request), 2.0);
        assert_eq!(state.enqueue_fetch(request), -1.0);

        let taken = state.take_fetches();
        assert_eq!(taken.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        // Still in flight, so still counted.
        assert_eq!(state.enqueue_fetch(request), -1.0);

        state.finish_fetch(1);
        assert_eq!(state.enqueue_fetch(request), 3.0);
        assert_eq!(state.enqueue_fetch("not json"), -1.0);
    }

    #[test]
    fn test_console_buffer_drops_oldest() {
        let mut state = HostState::new(1);
        for i in 0..(CONSOLE_CAPACITY + 5) {
            state.push_console("log", format!("line {}", i));
        }
        let (lines, dropped) = state.take_console();

        assert_eq!(lines.len(), CONSOLE_CAPACITY);
        assert_eq!(dropped, 5);
        assert_eq!(lines[0].message, "line 5");
        assert!(state.take_console().0.is_empty());
    }

    #[test]
    fn test_host_object_reaches_state() {
        let mut engine = Engine::new("ops", EngineLimits::default());
        engine.initialize().unwrap();
        let state = HostState::shared(4);
        register_host_ops(&engine, &state).unwrap();

        let id = state.borrow_mut().begin_await();
        let reported = engine
            .evaluate(&format!(
                "__folioHost.trace({id}, 'step'); __folioHost.console('warn', 'careful'); __folioHost.settle({id}, true, '42')"
            ))
            .unwrap();

        assert_eq!(reported, ScriptValue::Bool(true));
        let record = state.borrow_mut().take_await(id).unwrap();
        assert_eq!(record.trace, vec!["step".to_string()]);
        assert_eq!(record.result.as_deref(), Some("42"));
        let (lines, _) = state.borrow_mut().take_console();
        assert_eq!(lines[0].level, ConsoleLevel::Warn);
    }
}
