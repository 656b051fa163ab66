//! Headless embedded engine.
//!
//! Runs a set of named async handlers on its own OS thread with a
//! current-thread Tokio runtime, speaking the bridge wire protocol over the
//! messenger it is given at entrypoint time. Handlers receive an
//! [`EmbeddedContext`] they can use to emit stream events or call back into
//! the host.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use chimera_types::{Envelope, EnvelopeKind, MethodCall, MethodResponse, Value};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::dispatcher::settle;
use crate::engine::{EmbeddedEngine, EngineFactory, EngineFuture, HostContext};
use crate::error::{BridgeError, EngineError, TransportError};
use crate::messenger::{MessengerPort, Outbound};

/// Code returned when a handler panics instead of answering
pub const HANDLER_PANIC: &str = "HANDLER_PANIC";

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Answers one named method on the embedded side.
#[async_trait::async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: EmbeddedContext, call: MethodCall) -> MethodResponse;
}

#[async_trait::async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(EmbeddedContext, MethodCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResponse> + Send + 'static,
{
    async fn handle(&self, ctx: EmbeddedContext, call: MethodCall) -> MethodResponse {
        (self)(ctx, call).await
    }
}

/// Method table of a headless engine
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for `name`
    pub fn on<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(EmbeddedContext, MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResponse> + Send + 'static,
    {
        self.on_handler(name, handler)
    }

    /// Register any [`MethodHandler`] for `name`, replacing an earlier one
    pub fn on_handler(mut self, name: impl Into<String>, handler: impl MethodHandler) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn MethodHandler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedded Context
// ─────────────────────────────────────────────────────────────────────────────

/// The engine's view of the channel back to the host.
///
/// Cloning is cheap; clones share the correlation counter and pending map.
#[derive(Clone)]
pub struct EmbeddedContext {
    namespace: Arc<str>,
    outbound: Outbound,
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<MethodResponse>>>>,
}

impl EmbeddedContext {
    fn new(namespace: &str, outbound: Outbound) -> Self {
        Self {
            namespace: Arc::from(namespace),
            outbound,
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Call a method on the host and wait for its single response.
    pub async fn invoke_host(
        &self,
        method: &str,
        arguments: impl Into<Value>,
    ) -> Result<MethodResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope::call(id, &MethodCall::new(method, arguments.into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.outbound.send(envelope) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| TransportError::Closed)
    }

    /// Emit one event on a declared stream.
    ///
    /// Fails with `NotImplemented` when the host declares no such stream.
    pub async fn emit(&self, stream: &str, payload: impl Into<Value>) -> Result<(), BridgeError> {
        let outcome = self.invoke_host(stream, payload).await;
        settle(stream, outcome).map(|_| ())
    }

    fn resolve(&self, envelope: Envelope) {
        let Some(tx) = self.pending.lock().remove(&envelope.id) else {
            tracing::warn!(
                "[engine:{}] Dropping reply for unknown correlation id {}",
                self.namespace,
                envelope.id
            );
            return;
        };

        let response = envelope
            .decode_reply()
            .unwrap_or_else(|e| MethodResponse::error("DECODE_ERROR", e.to_string()));
        let _ = tx.send(response);
    }

    /// Drop every waiter; their `invoke_host` calls fail with `Closed`.
    fn fail_pending(&self) {
        self.pending.lock().clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

type Entrypoint = Arc<dyn Fn(EmbeddedContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Builds [`HeadlessEngine`]s sharing one handler table.
#[derive(Clone)]
pub struct HeadlessEngineFactory {
    handlers: Arc<HandlerSet>,
    entrypoint: Option<Entrypoint>,
}

impl HeadlessEngineFactory {
    pub fn new(handlers: HandlerSet) -> Self {
        Self {
            handlers: Arc::new(handlers),
            entrypoint: None,
        }
    }

    /// Task spawned once when the engine's entrypoint runs.
    pub fn with_entrypoint<F, Fut>(mut self, entrypoint: F) -> Self
    where
        F: Fn(EmbeddedContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.entrypoint = Some(Arc::new(move |ctx: EmbeddedContext| -> BoxFuture<'static, ()> {
            Box::pin(entrypoint(ctx))
        }));
        self
    }
}

impl EngineFactory for HeadlessEngineFactory {
    fn create(&self, context: &HostContext) -> EngineFuture {
        let engine = HeadlessEngine {
            namespace: context.namespace.clone(),
            handlers: Arc::clone(&self.handlers),
            entrypoint: self.entrypoint.clone(),
            shutdown_tx: None,
            thread: None,
        };
        Box::pin(async move { Ok(Box::new(engine) as Box<dyn EmbeddedEngine>) })
    }
}

/// An engine serving a [`HandlerSet`] from its own thread.
pub struct HeadlessEngine {
    namespace: String,
    handlers: Arc<HandlerSet>,
    entrypoint: Option<Entrypoint>,
    shutdown_tx: Option<watch::Sender<bool>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EmbeddedEngine for HeadlessEngine {
    fn execute_entrypoint(&mut self, port: MessengerPort) -> Result<(), EngineError> {
        if self.thread.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let namespace = self.namespace.clone();
        let handlers = Arc::clone(&self.handlers);
        let entrypoint = self.entrypoint.clone();

        let handle = thread::Builder::new()
            .name(format!("chimera-engine:{}", self.namespace))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("[engine:{}] Failed to create runtime: {}", namespace, e);
                        return;
                    }
                };

                rt.block_on(serve(namespace, port, handlers, entrypoint, shutdown_rx));
                rt.shutdown_background();
            })?;

        self.shutdown_tx = Some(shutdown_tx);
        self.thread = Some(handle);
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::warn!("[engine:{}] Engine thread panicked", self.namespace);
            }
        }
    }
}

impl Drop for HeadlessEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn serve(
    namespace: String,
    port: MessengerPort,
    handlers: Arc<HandlerSet>,
    entrypoint: Option<Entrypoint>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (outbound, mut inbound) = port.into_parts();
    let ctx = EmbeddedContext::new(&namespace, outbound.clone());

    if let Some(entrypoint) = entrypoint {
        tokio::spawn(entrypoint(ctx.clone()));
    }

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            envelope = inbound.recv() => {
                let Some(envelope) = envelope else {
                    tracing::debug!("[engine:{}] Host closed the messenger", namespace);
                    break;
                };
                match envelope.kind {
                    EnvelopeKind::Reply => ctx.resolve(envelope),
                    EnvelopeKind::Call => {
                        tokio::spawn(answer(
                            ctx.clone(),
                            Arc::clone(&handlers),
                            outbound.clone(),
                            envelope,
                        ));
                    }
                }
            }
        }
    }

    ctx.fail_pending();
    tracing::debug!("[engine:{}] Serve loop finished", namespace);
}

async fn answer(
    ctx: EmbeddedContext,
    handlers: Arc<HandlerSet>,
    outbound: Outbound,
    envelope: Envelope,
) {
    let response = match envelope.decode_call() {
        Ok(call) => match handlers.get(&call.method_name) {
            Some(handler) => {
                let method = call.method_name.clone();
                match AssertUnwindSafe(handler.handle(ctx, call)).catch_unwind().await {
                    Ok(response) => response,
                    Err(_) => {
                        tracing::warn!("[engine] Handler {} panicked", method);
                        MethodResponse::error(HANDLER_PANIC, format!("Handler {method} panicked"))
                    }
                }
            }
            None => MethodResponse::NotImplemented,
        },
        Err(e) => MethodResponse::error("DECODE_ERROR", e.to_string()),
    };

    match Envelope::reply(envelope.id, &response) {
        Ok(reply) => {
            if outbound.send(reply).is_err() {
                tracing::debug!("[engine] Host gone before reply {}", envelope.id);
            }
        }
        Err(e) => tracing::warn!("[engine] Failed to encode reply {}: {}", envelope.id, e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
