//! Folio Script Runtime
//!
//! Loads novel-source plugins written in JavaScript and exposes them through
//! a typed async API. Each plugin runs in its own QuickJS engine on a
//! dedicated thread with a current-thread tokio runtime.
//!
//! # Architecture
//!
//! - The engine, its host state and every script value stay on the worker thread
//! - Callers talk to the worker through [`PluginHandle`] commands
//! - Script promises are awaited by stepping the worker from the caller's task
//! - `fetch()` requests queue inside the engine and are relayed to a [`FetchBridgeService`]
//! - Plugins see a browser-like environment: DOM parser, URL, timers, `require()`

mod await_protocol;
mod bridge;
mod command;
mod config;
mod engine;
mod environment;
mod error;
mod filters;
mod handle;
mod host;
mod ops;
mod services;
mod spawn;
mod types;
mod worker;

pub use await_protocol::{AwaitStatus, PendingAwait};
pub use bridge::{FetchOptions, FetchRequest, FetchResponse};
pub use config::{PromiseMode, RuntimeConfig};
pub use engine::{Engine, EngineLimits, EngineState, ScriptValue};
pub use error::{FetchError, RuntimeError, RuntimeResult};
pub use filters::{
    convert_filters, encode_values, FilterDefinition, FilterDefinitions, FilterOption, FilterValue, FilterValues,
};
pub use handle::PluginHandle;
pub use host::PluginHost;
pub use ops::RuntimeStats;
pub use services::{FetchBridgeService, RuntimeServices, ScriptModule};
pub use spawn::load_plugin;
pub use types::{Capabilities, ChapterPage, PluginChapter, PluginMetadata, PluginNovel, PluginNovelDetails};
