//! Owner of the currently active plugin.
//!
//! At most one plugin is live per host. Loading a new one fully closes the
//! previous plugin first, so two engines never run for the same slot.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::PluginHandle;
use crate::services::RuntimeServices;
use crate::spawn::load_plugin;
use crate::types::PluginMetadata;

pub struct PluginHost {
    current: Mutex<Option<Arc<PluginHandle>>>,
    services: RuntimeServices,
    config: RuntimeConfig,
}

impl PluginHost {
    pub fn new(services: RuntimeServices, config: RuntimeConfig) -> Self {
        Self {
            current: Mutex::new(None),
            services,
            config,
        }
    }

    /// Load `source` as the active plugin, closing any previous one.
    pub async fn load(&self, source: impl Into<String>, plugin_id: impl Into<String>) -> RuntimeResult<Arc<PluginHandle>> {
        let (handle, _) = self.replace(source, plugin_id).await?;
        Ok(handle)
    }

    /// Like [`load`](Self::load), also returning the metadata of the plugin
    /// that was replaced.
    pub async fn replace(
        &self,
        source: impl Into<String>,
        plugin_id: impl Into<String>,
    ) -> RuntimeResult<(Arc<PluginHandle>, Option<PluginMetadata>)> {
        let source = source.into();
        let plugin_id = plugin_id.into();
        let mut current = self.current.lock().await;

        let previous = match current.take() {
            Some(old) => {
                tracing::info!("[host] Replacing {} with {}", old.id(), plugin_id);
                if let Err(err) = old.close().await {
                    tracing::warn!("[host] Closing {} failed: {}", old.id(), err);
                }
                Some(old.metadata().clone())
            }
            None => None,
        };

        let services = self.services.clone();
        let config = self.config.clone();
        let handle = tokio::task::spawn_blocking(move || load_plugin(source, plugin_id, services, config))
            .await
            .map_err(|_| RuntimeError::ThreadPanic)??;

        let handle = Arc::new(handle);
        tracing::info!("[host] Loaded {} v{}", handle.name(), handle.version());
        *current = Some(handle.clone());
        Ok((handle, previous))
    }

    pub async fn current(&self) -> Option<Arc<PluginHandle>> {
        self.current.lock().await.clone()
    }

    /// Close the active plugin, if any.
    pub async fn close(&self) -> RuntimeResult<()> {
        match self.current.lock().await.take() {
            Some(handle) => handle.close().await,
            None => Ok(()),
        }
    }
}
