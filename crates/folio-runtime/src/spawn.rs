//! Plugin loading.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, watch};

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::PluginHandle;
use crate::services::RuntimeServices;
use crate::types::LoadInfo;
use crate::worker::{run_worker, LoadRequest};

/// Load a plugin on its own worker thread.
///
/// Blocks until the worker has evaluated the environment and the plugin
/// source and probed its export. Every failure surfaces as
/// [`RuntimeError::PluginLoad`].
pub fn load_plugin(
    source: impl Into<String>,
    plugin_id: impl Into<String>,
    services: RuntimeServices,
    config: RuntimeConfig,
) -> RuntimeResult<PluginHandle> {
    let plugin_id = plugin_id.into();
    tracing::debug!("[load_plugin] Starting {}", plugin_id);

    let terminated = Arc::new(AtomicBool::new(false));
    let terminated_clone = terminated.clone();

    let (cmd_tx, cmd_rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<RuntimeResult<LoadInfo>>(1);

    let request = LoadRequest {
        plugin_id: plugin_id.clone(),
        source: source.into(),
        modules: services.modules.clone(),
        config: config.clone(),
    };

    let thread_name = format!("folio-plugin-{}", plugin_id);
    let wrap = |err: RuntimeError| RuntimeError::plugin_load(&plugin_id, "starting worker", err);
    let thread_handle = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || -> RuntimeResult<()> {
            tracing::debug!("[load_plugin:{}] Thread started", thread_name);

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(RuntimeError::SpawnFailed)?;

            let result = rt.block_on(run_worker(request, terminated_clone, cmd_rx, shutdown_rx, init_tx));

            rt.shutdown_background();
            tracing::debug!("[load_plugin:{}] Thread exiting", thread_name);
            result
        })
        .map_err(|e| wrap(RuntimeError::SpawnFailed(e)))?;

    let info = match init_rx.recv() {
        Ok(Ok(info)) => info,
        Ok(Err(err)) => {
            let _ = thread_handle.join();
            return Err(err);
        }
        Err(_) => {
            // The worker died before reporting, most likely while building its runtime.
            let cause = match thread_handle.join() {
                Ok(Err(err)) => err,
                Ok(Ok(())) => RuntimeError::ChannelClosed,
                Err(_) => RuntimeError::ThreadPanic,
            };
            return Err(wrap(cause));
        }
    };

    tracing::debug!("[load_plugin] {} is ready", plugin_id);

    Ok(PluginHandle {
        plugin_id,
        cmd_tx,
        shutdown_tx,
        terminated,
        thread_handle: parking_lot::Mutex::new(Some(thread_handle)),
        metadata: info.metadata,
        capabilities: info.capabilities,
        services,
        config,
    })
}
