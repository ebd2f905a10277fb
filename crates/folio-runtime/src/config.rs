//! Runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the script-visible `Promise` is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromiseMode {
    /// Replace `Promise` with the host-pumped implementation.
    #[default]
    Emulated,
    /// Keep the interpreter's own `Promise`; the host still drains its job queue.
    Native,
}

/// Tunables for a plugin runtime (`[runtime]` in folio.toml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_await_timeout_ms")]
    pub await_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_pending_fetches")]
    pub max_pending_fetches: usize,
    /// Timers with a longer delay are accepted but never fire.
    #[serde(default = "default_max_timer_delay_ms")]
    pub max_timer_delay_ms: u64,
    #[serde(default = "default_novel_cache_ttl_ms")]
    pub novel_cache_ttl_ms: u64,
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: usize,
    #[serde(default = "default_max_stack_size_bytes")]
    pub max_stack_size_bytes: usize,
    /// Upper bound on a single synchronous engine step.
    #[serde(default = "default_step_cpu_budget_ms")]
    pub step_cpu_budget_ms: u64,
    #[serde(default)]
    pub promise_mode: PromiseMode,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_await_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_max_pending_fetches() -> usize {
    16
}

fn default_max_timer_delay_ms() -> u64 {
    30_000
}

fn default_novel_cache_ttl_ms() -> u64 {
    60_000
}

fn default_memory_limit_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_stack_size_bytes() -> usize {
    1024 * 1024
}

fn default_step_cpu_budget_ms() -> u64 {
    5_000
}

fn default_mailbox_capacity() -> usize {
    32
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            await_timeout_ms: default_await_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_pending_fetches: default_max_pending_fetches(),
            max_timer_delay_ms: default_max_timer_delay_ms(),
            novel_cache_ttl_ms: default_novel_cache_ttl_ms(),
            memory_limit_bytes: default_memory_limit_bytes(),
            max_stack_size_bytes: default_max_stack_size_bytes(),
            step_cpu_budget_ms: default_step_cpu_budget_ms(),
            promise_mode: PromiseMode::default(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_pending_fetches(mut self, max: usize) -> Self {
        self.max_pending_fetches = max;
        self
    }

    pub fn with_max_timer_delay(mut self, delay: Duration) -> Self {
        self.max_timer_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_step_cpu_budget(mut self, budget: Duration) -> Self {
        self.step_cpu_budget_ms = budget.as_millis() as u64;
        self
    }

    pub fn with_promise_mode(mut self, mode: PromiseMode) -> Self {
        self.promise_mode = mode;
        self
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }

    /// Poll interval, never below one millisecond.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn step_cpu_budget(&self) -> Duration {
        Duration::from_millis(self.step_cpu_budget_ms)
    }

    /// Settings object handed to the script environment after injection.
    pub(crate) fn script_settings(&self) -> serde_json::Value {
        serde_json::json!({
            "maxTimerDelayMs": self.max_timer_delay_ms,
            "novelCacheTtlMs": self.novel_cache_ttl_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.await_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.max_pending_fetches, 16);
        assert_eq!(config.promise_mode, PromiseMode::Emulated);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            await_timeout_ms = 500
            promise_mode = "native"
            "#,
        )
        .unwrap();

        assert_eq!(config.await_timeout_ms, 500);
        assert_eq!(config.promise_mode, PromiseMode::Native);
        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.novel_cache_ttl_ms, 60_000);
    }

    #[test]
    fn test_builder_and_floor() {
        let config = RuntimeConfig::default()
            .with_await_timeout(Duration::from_millis(250))
            .with_poll_interval(Duration::ZERO);

        assert_eq!(config.await_timeout_ms, 250);
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.script_settings()["maxTimerDelayMs"], 30_000);
    }
}
