//! Host-facing bridge module.
//!
//! A [`BridgeModule`] owns one confinement thread. Construction spawns the
//! thread and starts the engine in the background; callers never block on
//! startup. Future calls made before the engine is ready fail with
//! `INIT_ERROR`; [`BridgeModule::ready`] waits for startup to settle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use chimera_types::{DescriptorSet, MethodDescriptor, Parameter, ParamType};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::channel::ChannelStats;
use crate::command::BridgeCommand;
use crate::config::BridgeConfig;
use crate::dispatcher::FutureDispatcher;
use crate::engine::{EngineFactory, EngineLifecycle, HostContext};
use crate::error::BridgeError;
use crate::events::{EventForwarder, EventHub, EventSubscription};
use crate::worker::{run_worker, Worker};

// ─────────────────────────────────────────────────────────────────────────────
// Module State
// ─────────────────────────────────────────────────────────────────────────────

/// Host-observable lifecycle of a bridge module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Built, confinement thread not yet running
    Constructed,
    /// Engine is being created or its entrypoint is starting
    EngineStarting,
    /// Engine is running and the channel is bound
    Ready,
    /// Engine creation or entrypoint failed
    Failed,
    /// Torn down
    Destroyed,
}

impl ModuleState {
    /// True once startup has finished one way or the other
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ModuleState::Ready | ModuleState::Failed | ModuleState::Destroyed
        )
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleState::Constructed => write!(f, "constructed"),
            ModuleState::EngineStarting => write!(f, "engine-starting"),
            ModuleState::Ready => write!(f, "ready"),
            ModuleState::Failed => write!(f, "failed"),
            ModuleState::Destroyed => write!(f, "destroyed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge Module
// ─────────────────────────────────────────────────────────────────────────────

/// One host-side bridge module bound to one embedded engine.
///
/// All methods take `&self` and may be called from any thread. Dropping the
/// module tears it down and joins the confinement thread.
pub struct BridgeModule {
    name: String,
    channel_name: String,
    descriptors: DescriptorSet,
    dispatcher: FutureDispatcher,
    events: EventHub,
    cmd_tx: mpsc::Sender<BridgeCommand>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ModuleState>,
    destroyed: AtomicBool,
    thread_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BridgeModule {
    /// Validate `config`, spawn the confinement thread and begin engine
    /// startup. Returns as soon as the thread is running.
    pub fn new<F>(config: BridgeConfig, factory: F) -> Result<Self, BridgeError>
    where
        F: EngineFactory,
    {
        config.validate()?;

        let name = config.module.name.clone();
        let channel_name = config.channel_name();
        let thread_name = config.thread_name();

        let (cmd_tx, cmd_rx) = mpsc::channel(config.runtime.command_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ModuleState::Constructed);

        let events = EventHub::new(
            config.descriptors.stream_names(),
            config.runtime.event_capacity,
        );
        let dispatcher =
            FutureDispatcher::new(channel_name.as_str(), config.descriptors.futures.clone());
        let forwarder = EventForwarder::new(events.clone());
        let context = HostContext {
            module_name: name.clone(),
            namespace: channel_name.clone(),
        };

        let factory: Box<dyn EngineFactory> = Box::new(factory);
        let worker_dispatcher = dispatcher.clone();
        let worker_name = channel_name.clone();

        let thread_handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("[bridge:{}] Failed to create runtime: {}", worker_name, e);
                        state_tx.send_replace(ModuleState::Failed);
                        return;
                    }
                };

                let worker = Worker::new(
                    EngineLifecycle::new(factory, context),
                    worker_dispatcher,
                    forwarder,
                    state_tx,
                );
                rt.block_on(run_worker(worker, cmd_rx, shutdown_rx));
                rt.shutdown_background();
            })
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;

        tracing::info!("[bridge:{}] Module {} constructed", channel_name, name);

        Ok(Self {
            name,
            channel_name,
            descriptors: config.descriptors,
            dispatcher,
            events,
            cmd_tx,
            shutdown_tx,
            state_rx,
            destroyed: AtomicBool::new(false),
            thread_handle: Mutex::new(Some(thread_handle)),
        })
    }

    /// Host-visible module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel and engine namespace
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    /// Stream names the host may subscribe to
    pub fn supported_events(&self) -> Vec<String> {
        self.descriptors.stream_names()
    }

    pub fn state(&self) -> ModuleState {
        *self.state_rx.borrow()
    }

    /// Wait until engine startup has settled.
    ///
    /// Fails with `INIT_ERROR` if the engine failed to start or the module
    /// was destroyed first.
    pub async fn ready(&self) -> Result<(), BridgeError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BridgeError::Initialization);
        }

        let mut state_rx = self.state_rx.clone();
        let settled = state_rx
            .wait_for(ModuleState::is_settled)
            .await
            .map(|state| *state)
            .map_err(|_| BridgeError::Initialization)?;

        match settled {
            ModuleState::Ready => Ok(()),
            _ => Err(BridgeError::Initialization),
        }
    }

    /// Wait until teardown has finished on the confinement thread.
    pub async fn closed(&self) {
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx
            .wait_for(|state| *state == ModuleState::Destroyed)
            .await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Future Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Call a declared future method with positional arguments.
    ///
    /// Settles exactly once: with the handler's value, its error, or one of
    /// `INIT_ERROR`, `NOT_IMPLEMENTED`, `TRANSPORT_ERROR`.
    pub async fn invoke(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, BridgeError> {
        let call = self.dispatcher.prepare(method, args)?;

        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BridgeError::Initialization);
        }

        let (reply, outcome) = oneshot::channel();
        self.cmd_tx
            .send(BridgeCommand::Invoke { call, reply })
            .await
            .map_err(|_| BridgeError::Initialization)?;

        outcome
            .await
            .map_err(|_| BridgeError::Transport(format!("{method} was dropped before settling")))?
    }

    /// Look up a future method by name.
    pub fn method(&self, name: &str) -> Option<FutureMethod<'_>> {
        self.dispatcher
            .descriptor(name)
            .map(|descriptor| FutureMethod {
                module: self,
                descriptor,
            })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to a declared stream.
    pub fn subscribe(&self, stream: &str) -> Result<EventSubscription, BridgeError> {
        self.events
            .subscribe(stream)
            .ok_or_else(|| BridgeError::UnknownStream(stream.to_string()))
    }

    /// Listener bookkeeping for hosts that manage their own subscriptions.
    /// Never fails and never changes what gets forwarded.
    pub fn add_listener(&self, event_name: &str) {
        tracing::trace!("[bridge:{}] Listener added for {}", self.channel_name, event_name);
        self.events.add_listener();
    }

    /// Release `count` listeners. Never fails.
    pub fn remove_listeners(&self, count: usize) {
        self.events.remove_listeners(count);
    }

    pub fn has_listeners(&self) -> bool {
        self.events.has_listeners()
    }

    pub fn listener_count(&self) -> usize {
        self.events.listener_count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot of the channel counters. All zero before the engine is ready.
    pub async fn stats(&self) -> Result<ChannelStats, BridgeError> {
        let (reply, stats) = oneshot::channel();
        self.cmd_tx
            .send(BridgeCommand::Stats { reply })
            .await
            .map_err(|_| BridgeError::Initialization)?;
        stats.await.map_err(|_| BridgeError::Initialization)
    }

    /// Tear the module down. Idempotent and non-blocking.
    ///
    /// Pending calls settle with `TRANSPORT_ERROR`; later calls fail with
    /// `INIT_ERROR`. Dropping the module also joins the confinement thread.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("[bridge:{}] Destroying module", self.channel_name);
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for BridgeModule {
    fn drop(&mut self) {
        self.destroy();
        if let Some(handle) = self.thread_handle.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("[bridge:{}] Confinement thread panicked", self.channel_name);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Future Method
// ─────────────────────────────────────────────────────────────────────────────

/// A declared future method bound to its module
pub struct FutureMethod<'a> {
    module: &'a BridgeModule,
    descriptor: &'a MethodDescriptor,
}

impl FutureMethod<'_> {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.descriptor.parameters
    }

    pub fn returns(&self) -> ParamType {
        self.descriptor.returns
    }

    pub async fn call(&self, args: Vec<serde_json::Value>) -> Result<serde_json::Value, BridgeError> {
        self.module.invoke(&self.descriptor.name, args).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EmbeddedEngine, EngineFuture};
    use crate::error::EngineError;
    use crate::messenger::MessengerPort;
    use crate::headless::{EmbeddedContext, HandlerSet, HeadlessEngineFactory};
    use chimera_types::{MethodCall, MethodResponse, StreamDescriptor, Value};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn calculator_config() -> BridgeConfig {
        BridgeConfig::new("Calculator", "com.test")
            .future(
                MethodDescriptor::new("add")
                    .param("a", ParamType::Int)
                    .param("b", ParamType::Int)
                    .returns(ParamType::Int),
            )
            .future(MethodDescriptor::new("fail"))
            .future(MethodDescriptor::new("ghost"))
            .future(MethodDescriptor::new("start").param("steps", ParamType::Int))
            .future(MethodDescriptor::new("hang"))
            .stream(StreamDescriptor::new("progress", ParamType::Int))
    }

    fn calculator_handlers(started: Arc<Notify>) -> HandlerSet {
        HandlerSet::new()
            .on("add", |_ctx, call: MethodCall| async move {
                let a = call.arg("a").and_then(Value::as_i64).unwrap_or_default();
                let b = call.arg("b").and_then(Value::as_i64).unwrap_or_default();
                MethodResponse::success(a + b)
            })
            .on("fail", |_ctx, _call| async move {
                MethodResponse::error_with_details("E1", "boom", Value::from("why"))
            })
            .on("start", |ctx: EmbeddedContext, call: MethodCall| async move {
                let steps = call.arg("steps").and_then(Value::as_i64).unwrap_or_default();
                for step in 1..=steps {
                    if let Err(e) = ctx.emit("progress", step).await {
                        return MethodResponse::error("EMIT_FAILED", e.to_string());
                    }
                }
                MethodResponse::ack()
            })
            .on("hang", move |_ctx, _call| {
                let started = Arc::clone(&started);
                async move {
                    started.notify_one();
                    std::future::pending::<MethodResponse>().await
                }
            })
    }

    fn calculator() -> BridgeModule {
        let factory = HeadlessEngineFactory::new(calculator_handlers(Arc::new(Notify::new())));
        BridgeModule::new(calculator_config(), factory).unwrap()
    }

    /// Factory whose engine creation waits until the returned sender fires.
    fn gated_factory(handlers: HandlerSet) -> (oneshot::Sender<()>, impl EngineFactory) {
        let (open_tx, open_rx) = oneshot::channel::<()>();
        let gate = Mutex::new(Some(open_rx));
        let inner = HeadlessEngineFactory::new(handlers);

        let factory = move |context: &HostContext| -> EngineFuture {
            let gate = gate.lock().take();
            let creating = inner.create(context);
            Box::pin(async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                creating.await
            })
        };
        (open_tx, factory)
    }

    #[tokio::test]
    async fn test_success_settles_with_value() {
        let module = calculator();
        module.ready().await.unwrap();
        assert_eq!(module.state(), ModuleState::Ready);

        let sum = module.invoke("add", vec![json!(2), json!(3)]).await;
        assert_eq!(sum, Ok(json!(5)));
    }

    #[tokio::test]
    async fn test_calls_before_ready_are_init_errors() {
        let (open, factory) = gated_factory(calculator_handlers(Arc::new(Notify::new())));
        let module = BridgeModule::new(calculator_config(), factory).unwrap();

        let early = module.invoke("add", vec![json!(1), json!(2)]).await;
        assert_eq!(early, Err(BridgeError::Initialization));
        assert_eq!(module.stats().await.unwrap().calls_sent, 0);

        open.send(()).unwrap();
        module.ready().await.unwrap();
        assert_eq!(module.invoke("add", vec![json!(1), json!(2)]).await, Ok(json!(3)));
    }

    #[tokio::test]
    async fn test_startup_events_are_acknowledged_and_dropped() {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let factory = HeadlessEngineFactory::new(calculator_handlers(Arc::new(Notify::new())))
            .with_entrypoint(move |ctx| {
                let report_tx = report_tx.clone();
                async move {
                    let declared = ctx.emit("progress", 0).await;
                    let undeclared = ctx.emit("bogus", 0).await;
                    let _ = report_tx.send((declared, undeclared));
                }
            });
        let module = BridgeModule::new(calculator_config(), factory).unwrap();
        module.ready().await.unwrap();

        let (declared, undeclared) = report_rx.recv().await.unwrap();
        assert_eq!(declared, Ok(()));
        assert_eq!(undeclared, Err(BridgeError::NotImplemented("bogus".into())));

        // Subscribing later never replays the startup event
        let mut progress = module.subscribe("progress").unwrap();
        assert_eq!(module.invoke("start", vec![json!(1)]).await, Ok(json!(null)));
        assert_eq!(progress.recv().await, Some(json!(1)));
        assert_eq!(progress.try_recv(), None);
    }

    #[tokio::test]
    async fn test_events_fan_out_in_order() {
        let module = calculator();
        module.ready().await.unwrap();

        let mut first = module.subscribe("progress").unwrap();
        let mut second = module.subscribe("progress").unwrap();
        assert_eq!(module.listener_count(), 2);

        assert_eq!(module.invoke("start", vec![json!(3)]).await, Ok(json!(null)));

        for sub in [&mut first, &mut second] {
            for step in 1..=3 {
                assert_eq!(sub.recv().await, Some(json!(step)));
            }
        }
    }

    #[tokio::test]
    async fn test_handler_error_keeps_code_and_details() {
        let module = calculator();
        module.ready().await.unwrap();

        let err = module.invoke("fail", vec![]).await.unwrap_err();
        assert_eq!(err.code(), "E1");
        assert_eq!(err.message(), "boom");
        assert!(matches!(err, BridgeError::Remote { details: Some(ref d), .. } if d == "why"));
    }

    #[tokio::test]
    async fn test_unhandled_method_is_not_implemented() {
        let module = calculator();
        module.ready().await.unwrap();

        let err = module.invoke("ghost", vec![]).await.unwrap_err();
        assert_eq!(err.code(), BridgeError::NOT_IMPLEMENTED);
        assert!(err.message().contains("ghost"));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let module = calculator();
        module.ready().await.unwrap();

        module.destroy();
        module.destroy();

        assert_eq!(module.ready().await, Err(BridgeError::Initialization));
        module.closed().await;
        assert_eq!(module.state(), ModuleState::Destroyed);
        assert_eq!(
            module.invoke("add", vec![json!(1), json!(1)]).await,
            Err(BridgeError::Initialization)
        );
    }

    #[tokio::test]
    async fn test_destroy_before_ready() {
        let (_open, factory) = gated_factory(calculator_handlers(Arc::new(Notify::new())));
        let module = BridgeModule::new(calculator_config(), factory).unwrap();

        module.destroy();
        module.closed().await;
        assert_eq!(module.state(), ModuleState::Destroyed);
        assert_eq!(module.ready().await, Err(BridgeError::Initialization));
    }

    #[tokio::test]
    async fn test_in_flight_calls_fail_on_teardown() {
        let started = Arc::new(Notify::new());
        let factory = HeadlessEngineFactory::new(calculator_handlers(Arc::clone(&started)));
        let module = BridgeModule::new(calculator_config(), factory).unwrap();
        module.ready().await.unwrap();

        let call = module.invoke("hang", vec![]);
        let teardown = async {
            started.notified().await;
            module.destroy();
        };
        let (outcome, ()) = tokio::join!(call, teardown);

        assert_eq!(outcome.unwrap_err().code(), BridgeError::TRANSPORT_ERROR);
    }

    #[tokio::test]
    async fn test_concurrent_calls_settle_independently() {
        let module = calculator();
        module.ready().await.unwrap();

        let (sum, failed, missing) = tokio::join!(
            module.invoke("add", vec![json!(10), json!(20)]),
            module.invoke("fail", vec![]),
            module.invoke("ghost", vec![]),
        );
        assert_eq!(sum, Ok(json!(30)));
        assert_eq!(failed.unwrap_err().code(), "E1");
        assert_eq!(missing.unwrap_err().code(), BridgeError::NOT_IMPLEMENTED);

        let stats = module.stats().await.unwrap();
        assert_eq!(stats.calls_sent, 3);
        assert_eq!(stats.replies_matched, 3);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.replies_unmatched, 0);
    }

    #[tokio::test]
    async fn test_failed_startup() {
        let factory = |_: &HostContext| -> EngineFuture {
            Box::pin(async { Err(EngineError::CreateFailed("no engine".into())) })
        };
        let module = BridgeModule::new(calculator_config(), factory).unwrap();

        assert_eq!(module.ready().await, Err(BridgeError::Initialization));
        assert_eq!(module.state(), ModuleState::Failed);
        assert_eq!(
            module.invoke("add", vec![json!(1), json!(1)]).await,
            Err(BridgeError::Initialization)
        );
    }

    /// Engine that hangs up on the host as soon as it is launched.
    struct HangUpEngine {
        destroyed: Arc<AtomicBool>,
    }

    impl EmbeddedEngine for HangUpEngine {
        fn execute_entrypoint(&mut self, port: MessengerPort) -> Result<(), EngineError> {
            drop(port);
            Ok(())
        }

        fn destroy(&mut self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_messenger_close_fails_module() {
        let destroyed = Arc::new(AtomicBool::new(false));
        let engine_destroyed = Arc::clone(&destroyed);
        let factory = move |_: &HostContext| -> EngineFuture {
            let destroyed = Arc::clone(&engine_destroyed);
            Box::pin(async move {
                Ok(Box::new(HangUpEngine { destroyed }) as Box<dyn EmbeddedEngine>)
            })
        };
        let module = BridgeModule::new(calculator_config(), factory).unwrap();

        let mut state_rx = module.state_rx.clone();
        state_rx
            .wait_for(|state| *state == ModuleState::Failed)
            .await
            .unwrap();

        assert!(destroyed.load(Ordering::SeqCst));
        assert_eq!(module.ready().await, Err(BridgeError::Initialization));
        assert_eq!(
            module.invoke("add", vec![json!(1), json!(1)]).await,
            Err(BridgeError::Initialization)
        );
    }

    #[tokio::test]
    async fn test_descriptor_surface() {
        let module = calculator();
        assert_eq!(module.name(), "Calculator");
        assert_eq!(module.channel_name(), "com.test.calculator");
        assert_eq!(module.supported_events(), vec!["progress".to_string()]);

        let add = module.method("add").unwrap();
        assert_eq!(add.name(), "add");
        assert_eq!(add.parameters().len(), 2);
        assert_eq!(add.returns(), ParamType::Int);
        assert!(module.method("nope").is_none());

        assert_eq!(
            module.subscribe("nope").err(),
            Some(BridgeError::UnknownStream("nope".into()))
        );
        assert_eq!(
            module.invoke("add", vec![json!("x"), json!(1)]).await.unwrap_err().code(),
            "INVALID_ARGUMENTS"
        );

        module.ready().await.unwrap();
        assert_eq!(add.call(vec![json!(4), json!(4)]).await, Ok(json!(8)));
    }

    #[tokio::test]
    async fn test_listener_bookkeeping_never_fails() {
        let module = calculator();
        assert!(!module.has_listeners());

        module.add_listener("progress");
        module.add_listener("progress");
        module.remove_listeners(1);
        assert!(module.has_listeners());

        module.remove_listeners(10);
        assert!(!module.has_listeners());
    }

    #[tokio::test]
    async fn test_modules_are_independent() {
        let first = calculator();
        let second = calculator();
        first.ready().await.unwrap();
        second.ready().await.unwrap();

        first.destroy();
        assert_eq!(second.invoke("add", vec![json!(1), json!(1)]).await, Ok(json!(2)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = BridgeConfig::new("", "com.test");
        let factory = HeadlessEngineFactory::new(HandlerSet::new());
        assert_eq!(
            BridgeModule::new(config, factory).err().map(|e| e.code().to_string()),
            Some("CONFIG_ERROR".to_string())
        );
    }
}
