//! Embedded engine lifecycle.
//!
//! The engine object is created, started and destroyed on the confinement
//! thread only. Nothing here is `Send` except the factory that produces it,
//! which is moved onto that thread when the bridge module is built.

use futures::future::LocalBoxFuture;

use crate::error::EngineError;
use crate::messenger::{self, MessengerPort};

// ─────────────────────────────────────────────────────────────────────────────
// Engine State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of the embedded engine handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Starting,
    Ready,
    Destroyed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Uninitialized => write!(f, "uninitialized"),
            EngineState::Starting => write!(f, "starting"),
            EngineState::Ready => write!(f, "ready"),
            EngineState::Destroyed => write!(f, "destroyed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host Context
// ─────────────────────────────────────────────────────────────────────────────

/// Application-level context the engine is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    /// Host-visible module name (e.g. "ProgressBridge")
    pub module_name: String,
    /// Engine namespace, also used as the channel name
    /// (e.g. "com.example.progress_bridge")
    pub namespace: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Traits
// ─────────────────────────────────────────────────────────────────────────────

/// A headless secondary runtime driven by the bridge.
///
/// Implementations are only touched from the confinement thread, so they do
/// not need to be `Send`.
pub trait EmbeddedEngine {
    /// Run the default entrypoint. The engine talks to the host exclusively
    /// through `port`. Called once, after the host has installed its inbound
    /// handler on the other end.
    fn execute_entrypoint(&mut self, port: MessengerPort) -> Result<(), EngineError>;

    /// Release the engine. Must tolerate being called more than once.
    fn destroy(&mut self);
}

/// Future resolving to a freshly created engine
pub type EngineFuture = LocalBoxFuture<'static, Result<Box<dyn EmbeddedEngine>, EngineError>>;

/// Produces engine instances on the confinement thread.
pub trait EngineFactory: Send + 'static {
    fn create(&self, context: &HostContext) -> EngineFuture;
}

impl<F> EngineFactory for F
where
    F: Fn(&HostContext) -> EngineFuture + Send + 'static,
{
    fn create(&self, context: &HostContext) -> EngineFuture {
        (self)(context)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the engine handle and its state transitions.
pub(crate) struct EngineLifecycle {
    factory: Box<dyn EngineFactory>,
    context: HostContext,
    engine: Option<Box<dyn EmbeddedEngine>>,
    state: EngineState,
}

impl EngineLifecycle {
    pub fn new(factory: Box<dyn EngineFactory>, context: HostContext) -> Self {
        Self {
            factory,
            context,
            engine: None,
            state: EngineState::Uninitialized,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn context(&self) -> &HostContext {
        &self.context
    }

    /// Begin creating the engine. `Uninitialized → Starting`.
    pub fn start(&mut self) -> Result<EngineFuture, EngineError> {
        if self.state != EngineState::Uninitialized {
            return Err(EngineError::InvalidState(self.state));
        }
        tracing::debug!("[engine:{}] Creating engine", self.context.namespace);
        self.state = EngineState::Starting;
        Ok(self.factory.create(&self.context))
    }

    /// Finish startup with a created engine. `Starting → Ready`.
    ///
    /// `bind` receives the host end of the engine's messenger and must
    /// install the inbound handler before returning; the entrypoint only runs
    /// afterwards, so nothing the engine emits at startup can be lost.
    pub fn launch<B>(&mut self, mut engine: Box<dyn EmbeddedEngine>, bind: B) -> Result<(), EngineError>
    where
        B: FnOnce(MessengerPort),
    {
        if self.state != EngineState::Starting {
            engine.destroy();
            return Err(EngineError::InvalidState(self.state));
        }

        let (host, embedded) = messenger::pair();
        bind(host);

        tracing::debug!("[engine:{}] Executing entrypoint", self.context.namespace);
        if let Err(e) = engine.execute_entrypoint(embedded) {
            engine.destroy();
            self.state = EngineState::Destroyed;
            return Err(e);
        }

        self.engine = Some(engine);
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Record that engine creation failed. The handle becomes `Destroyed`.
    pub fn abort(&mut self) {
        self.engine = None;
        self.state = EngineState::Destroyed;
    }

    /// Release the engine. A no-op when `Uninitialized` or `Destroyed`.
    pub fn destroy(&mut self) {
        match self.state {
            EngineState::Uninitialized | EngineState::Destroyed => {}
            EngineState::Starting | EngineState::Ready => {
                if let Some(mut engine) = self.engine.take() {
                    engine.destroy();
                }
                self.state = EngineState::Destroyed;
                tracing::debug!("[engine:{}] Destroyed", self.context.namespace);
            }
        }
    }
}

impl Drop for EngineLifecycle {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records whether the host side had bound before the entrypoint ran.
    struct RecordingEngine {
        bound: Rc<RefCell<bool>>,
        bound_at_entry: Arc<AtomicBool>,
        destroyed: Arc<AtomicUsize>,
    }

    impl EmbeddedEngine for RecordingEngine {
        fn execute_entrypoint(&mut self, _port: MessengerPort) -> Result<(), EngineError> {
            self.bound_at_entry
                .store(*self.bound.borrow(), Ordering::SeqCst);
            Ok(())
        }

        fn destroy(&mut self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn context() -> HostContext {
        HostContext {
            module_name: "Recorder".into(),
            namespace: "test.recorder".into(),
        }
    }

    fn unused_factory() -> Box<dyn EngineFactory> {
        Box::new(|_: &HostContext| -> EngineFuture {
            Box::pin(async { Err(EngineError::CreateFailed("unused".into())) })
        })
    }

    #[test]
    fn test_bind_happens_before_entrypoint() {
        let bound = Rc::new(RefCell::new(false));
        let bound_at_entry = Arc::new(AtomicBool::new(false));
        let destroyed = Arc::new(AtomicUsize::new(0));

        let mut lifecycle = EngineLifecycle::new(unused_factory(), context());
        let _creating = lifecycle.start().unwrap();
        assert_eq!(lifecycle.state(), EngineState::Starting);

        let engine = Box::new(RecordingEngine {
            bound: Rc::clone(&bound),
            bound_at_entry: Arc::clone(&bound_at_entry),
            destroyed: Arc::clone(&destroyed),
        });
        let flag = Rc::clone(&bound);
        lifecycle
            .launch(engine, move |_host| *flag.borrow_mut() = true)
            .unwrap();

        assert!(bound_at_entry.load(Ordering::SeqCst));
        assert_eq!(lifecycle.state(), EngineState::Ready);

        lifecycle.destroy();
        lifecycle.destroy();
        assert_eq!(lifecycle.state(), EngineState::Destroyed);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destroy_uninitialized_is_noop() {
        let mut lifecycle = EngineLifecycle::new(unused_factory(), context());
        lifecycle.destroy();
        assert_eq!(lifecycle.state(), EngineState::Uninitialized);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut lifecycle = EngineLifecycle::new(unused_factory(), context());
        assert!(lifecycle.start().is_ok());
        assert!(matches!(
            lifecycle.start(),
            Err(EngineError::InvalidState(EngineState::Starting))
        ));
    }
}
