//! Chimera Bridge Runtime
//!
//! Host-side bridge between a host application and a headless embedded
//! runtime. Each bridge module drives one engine from a dedicated OS thread
//! with a current-thread Tokio runtime (no work-stealing); callers talk to it
//! only through commands.
//!
//! # Architecture
//!
//! - Future calls: host → embedded, correlated by explicit ids, settled once
//! - Streams: embedded → host, acknowledged and fanned out to subscribers
//! - The engine object never leaves its confinement thread
//! - Teardown rejects in-flight calls with `TRANSPORT_ERROR`

mod channel;
mod client;
mod command;
mod config;
mod dispatcher;
mod engine;
mod error;
mod events;
mod headless;
mod messenger;
mod module;
mod worker;

pub use channel::ChannelStats;
pub use client::{BridgeClient, Unsubscribe};
pub use config::{BridgeConfig, ModuleInfo, RuntimeConfig};
pub use engine::{EmbeddedEngine, EngineFactory, EngineFuture, EngineState, HostContext};
pub use error::{BridgeError, ConfigError, EngineError, TransportError};
pub use events::{BridgeEvent, EventHub, EventSubscription};
pub use headless::{
    EmbeddedContext, HandlerSet, HeadlessEngine, HeadlessEngineFactory, MethodHandler, HANDLER_PANIC,
};
pub use messenger::{MessengerPort, Outbound};
pub use module::{BridgeModule, FutureMethod, ModuleState};

pub use chimera_types as types;
