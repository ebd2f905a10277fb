//! Host services a plugin runtime can reach.
//!
//! Scripts never hold these directly: the await loop calls them on the
//! caller's task and marshals results back into the engine.

use std::fmt;
use std::sync::Arc;

use crate::bridge::{FetchOptions, FetchResponse};
use crate::error::FetchError;

/// Performs the network requests scripts queue through `fetch()`.
#[async_trait::async_trait]
pub trait FetchBridgeService: Send + Sync + 'static {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError>;
}

/// Extra CommonJS source made available through `require(name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptModule {
    pub name: String,
    pub source: String,
}

impl ScriptModule {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Services handed to [`load_plugin`](crate::load_plugin).
#[derive(Clone, Default)]
pub struct RuntimeServices {
    /// Without a bridge every script fetch rejects.
    pub fetch: Option<Arc<dyn FetchBridgeService>>,
    pub modules: Vec<ScriptModule>,
}

impl RuntimeServices {
    pub fn with_fetch(mut self, bridge: Arc<dyn FetchBridgeService>) -> Self {
        self.fetch = Some(bridge);
        self
    }

    pub fn with_module(mut self, module: ScriptModule) -> Self {
        self.modules.push(module);
        self
    }
}

impl fmt::Debug for RuntimeServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeServices")
            .field("fetch", &self.fetch.is_some())
            .field("modules", &self.modules.iter().map(|m| m.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}
