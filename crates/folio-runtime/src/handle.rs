//! Handle to a loaded plugin.
//!
//! All engine work happens on the plugin's worker; the handle only sends
//! commands and drives the await protocol from the caller's task. Listing
//! and content methods degrade to empty values when the script misbehaves,
//! so a broken plugin never takes its caller down with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};

use crate::await_protocol::{self, PendingAwait, StepReport};
use crate::bridge::FetchOutcome;
use crate::command::{PluginCommand, Reply};
use crate::config::RuntimeConfig;
use crate::engine::ScriptValue;
use crate::error::{RuntimeError, RuntimeResult};
use crate::filters::{self, FilterDefinitions, FilterValues};
use crate::ops::RuntimeStats;
use crate::services::RuntimeServices;
use crate::types::{Capabilities, ChapterPage, PluginChapter, PluginMetadata, PluginNovel, PluginNovelDetails};

pub struct PluginHandle {
    pub(crate) plugin_id: String,
    pub(crate) cmd_tx: mpsc::Sender<PluginCommand>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) terminated: Arc<AtomicBool>,
    pub(crate) thread_handle: parking_lot::Mutex<Option<thread::JoinHandle<RuntimeResult<()>>>>,
    pub(crate) metadata: PluginMetadata,
    pub(crate) capabilities: Capabilities,
    pub(crate) services: RuntimeServices,
    pub(crate) config: RuntimeConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// Plumbing
// ─────────────────────────────────────────────────────────────────────────────

impl PluginHandle {
    /// Send a command and wait for its reply.
    async fn send_command<T, F>(&self, make_cmd: F) -> RuntimeResult<T>
    where
        F: FnOnce(Reply<T>) -> PluginCommand,
    {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(RuntimeError::EngineNotInitialized);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;

        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Blocking variant of [`send_command`](Self::send_command) for callers
    /// outside any async runtime.
    fn send_command_blocking<T, F>(&self, make_cmd: F) -> RuntimeResult<T>
    where
        F: FnOnce(Reply<T>) -> PluginCommand,
    {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(RuntimeError::EngineNotInitialized);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .blocking_send(make_cmd(reply_tx))
            .map_err(|_| RuntimeError::ChannelClosed)?;

        reply_rx.blocking_recv().map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn services(&self) -> &RuntimeServices {
        &self.services
    }

    pub(crate) async fn begin_await(&self, expression: &str) -> RuntimeResult<u64> {
        let expression = expression.to_string();
        self.send_command(|reply| PluginCommand::BeginAwait { expression, reply })
            .await
    }

    pub(crate) async fn step_await(&self, id: u64) -> RuntimeResult<StepReport> {
        self.send_command(|reply| PluginCommand::StepAwait { id, reply }).await
    }

    pub(crate) async fn deliver_fetches(&self, outcomes: Vec<(u64, FetchOutcome)>) -> RuntimeResult<()> {
        self.send_command(|reply| PluginCommand::DeliverFetches { outcomes, reply })
            .await
    }

    pub(crate) async fn cancel_await(&self, id: u64) -> RuntimeResult<Option<PendingAwait>> {
        self.send_command(|reply| PluginCommand::CancelAwait { id, reply }).await
    }

    /// Await an adapter call and parse its JSON result.
    async fn call<T: DeserializeOwned>(&self, expression: String) -> RuntimeResult<T> {
        let text = await_protocol::drive(self, &expression).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Swallow non-fatal failures of a listing or content call.
    fn degrade<T: Default>(&self, operation: &str, result: RuntimeResult<T>) -> RuntimeResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::warn!("[plugin:{}] {} failed: {}", self.plugin_id, operation, err);
                Ok(T::default())
            }
        }
    }
}

fn js(text: &str) -> RuntimeResult<String> {
    Ok(serde_json::to_string(text)?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata
// ─────────────────────────────────────────────────────────────────────────────

impl PluginHandle {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn site(&self) -> &str {
        &self.metadata.site
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    pub fn lang(&self) -> &str {
        &self.metadata.lang
    }

    pub fn icon(&self) -> &str {
        &self.metadata.icon
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin contract
// ─────────────────────────────────────────────────────────────────────────────

impl PluginHandle {
    pub async fn search_novels(&self, query: &str, page: u32) -> RuntimeResult<Vec<PluginNovel>> {
        let expression = format!("__folio.adapter.searchNovels({}, {})", js(query)?, page);
        let result = self.call(expression).await;
        self.degrade("searchNovels", result)
    }

    /// Popular listing; with `filters`, the selections are encoded against
    /// the plugin's filter definitions first.
    pub async fn popular_novels(&self, page: u32, filters: Option<&FilterValues>) -> RuntimeResult<Vec<PluginNovel>> {
        let expression = match filters {
            Some(values) => {
                let definitions = self.filter_definitions().await?;
                let encoded = filters::encode_values(&definitions, values);
                format!("__folio.adapter.popularNovelsWithFilters({}, {})", page, encoded)
            }
            None => format!("__folio.adapter.popularNovels({})", page),
        };
        let result = self.call(expression).await;
        self.degrade("popularNovels", result)
    }

    pub async fn latest_novels(&self, page: u32) -> RuntimeResult<Vec<PluginNovel>> {
        let result = self.call(format!("__folio.adapter.latestNovels({})", page)).await;
        self.degrade("latestNovels", result)
    }

    /// Rejections propagate as [`RuntimeError::PromiseRejected`]; `None`
    /// means the call failed otherwise. A plugin without `parseNovel` yields
    /// empty details for `url`.
    pub async fn get_novel_details(&self, url: &str) -> RuntimeResult<Option<PluginNovelDetails>> {
        let expression = format!("__folio.adapter.getNovelDetails({})", js(url)?);
        match self.call::<Option<PluginNovelDetails>>(expression).await {
            Err(err @ RuntimeError::PromiseRejected { .. }) => Err(err),
            other => self.degrade("getNovelDetails", other),
        }
    }

    pub async fn get_chapters(&self, url: &str) -> RuntimeResult<Vec<PluginChapter>> {
        let result = self.call(format!("__folio.adapter.getChapters({})", js(url)?)).await;
        self.degrade("getChapters", result)
    }

    pub async fn get_chapters_page(&self, url: &str, page: u32) -> RuntimeResult<ChapterPage> {
        let expression = format!("__folio.adapter.getChaptersPage({}, {})", js(url)?, page);
        match self.call(expression).await {
            Ok(chapters) => Ok(chapters),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::warn!("[plugin:{}] getChaptersPage failed: {}", self.plugin_id, err);
                Ok(ChapterPage::empty(page))
            }
        }
    }

    pub async fn get_chapter_page_count(&self, url: &str) -> RuntimeResult<u32> {
        let result = self.call(format!("__folio.adapter.getChapterPageCount({})", js(url)?)).await;
        self.degrade("getChapterPageCount", result).map(|count: u32| count.max(1))
    }

    pub async fn get_chapter_content(&self, url: &str) -> RuntimeResult<String> {
        let result = self.call(format!("__folio.adapter.getChapterContent({})", js(url)?)).await;
        self.degrade("getChapterContent", result)
    }

    /// Filter definitions as the plugin declared them, in JSON.
    pub async fn get_filters(&self) -> RuntimeResult<String> {
        self.send_command(|reply| PluginCommand::Filters { reply }).await
    }

    /// [`get_filters`](Self::get_filters) for synchronous callers.
    ///
    /// Must not be called from inside an async runtime.
    pub fn get_filters_blocking(&self) -> RuntimeResult<String> {
        self.send_command_blocking(|reply| PluginCommand::Filters { reply })
    }

    pub async fn filter_definitions(&self) -> RuntimeResult<FilterDefinitions> {
        let json = self.get_filters().await?;
        let value: serde_json::Value = serde_json::from_str(&json)?;
        Ok(filters::convert_filters(&value))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Diagnostics & lifecycle
// ─────────────────────────────────────────────────────────────────────────────

impl PluginHandle {
    /// Evaluate source in the plugin's global scope.
    pub async fn evaluate(&self, source: &str) -> RuntimeResult<ScriptValue> {
        let source = source.to_string();
        self.send_command(|reply| PluginCommand::Evaluate { source, reply }).await
    }

    /// Await a script expression and return its settled value as JSON text.
    pub async fn await_expression(&self, expression: &str) -> RuntimeResult<String> {
        await_protocol::drive(self, expression).await
    }

    pub async fn stats(&self) -> RuntimeResult<RuntimeStats> {
        self.send_command(|reply| PluginCommand::Stats { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Dispose the engine and join the worker. Later calls do nothing.
    pub async fn close(&self) -> RuntimeResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("[plugin:{}] Closing", self.plugin_id);

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(PluginCommand::Dispose { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
        let _ = self.shutdown_tx.send(true);
        self.join()
    }

    fn join(&self) -> RuntimeResult<()> {
        if let Some(handle) = self.thread_handle.lock().take() {
            handle.join().map_err(|_| RuntimeError::ThreadPanic)??;
        }
        Ok(())
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("plugin_id", &self.plugin_id)
            .field("metadata", &self.metadata)
            .field("capabilities", &self.capabilities)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
