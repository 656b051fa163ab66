//! Confinement thread loop.
//!
//! Every bridge module owns one OS thread running a current-thread Tokio
//! runtime. The engine, the command channel and all channel I/O live here;
//! callers only reach them by posting [`BridgeCommand`]s.

use chimera_types::{Envelope, MethodCall};
use tokio::sync::{mpsc, watch};

use crate::channel::CommandChannel;
use crate::command::BridgeCommand;
use crate::dispatcher::FutureDispatcher;
use crate::engine::{EmbeddedEngine, EngineFuture, EngineLifecycle, EngineState};
use crate::error::{BridgeError, EngineError};
use crate::events::EventForwarder;
use crate::module::ModuleState;

pub(crate) struct Worker {
    lifecycle: EngineLifecycle,
    channel: Option<CommandChannel>,
    dispatcher: FutureDispatcher,
    forwarder: EventForwarder,
    state_tx: watch::Sender<ModuleState>,
}

impl Worker {
    pub fn new(
        lifecycle: EngineLifecycle,
        dispatcher: FutureDispatcher,
        forwarder: EventForwarder,
        state_tx: watch::Sender<ModuleState>,
    ) -> Self {
        Self {
            lifecycle,
            channel: None,
            dispatcher,
            forwarder,
            state_tx,
        }
    }

    fn name(&self) -> &str {
        &self.lifecycle.context().namespace
    }

    fn set_state(&self, state: ModuleState) {
        tracing::debug!("[bridge:{}] -> {}", self.name(), state);
        self.state_tx.send_replace(state);
    }

    /// Bind the channel, install the event forwarder, then run the entrypoint.
    fn launch(
        &mut self,
        created: Result<Box<dyn EmbeddedEngine>, EngineError>,
    ) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        let engine = match created {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!("[bridge:{}] Engine creation failed: {}", self.name(), e);
                self.lifecycle.abort();
                self.set_state(ModuleState::Failed);
                return None;
            }
        };

        let name = self.name().to_string();
        let forwarder = self.forwarder.clone();
        let mut bound = None;

        let launched = self.lifecycle.launch(engine, |port| {
            let (mut channel, inbound) = CommandChannel::bind(name, port);
            channel.on_receive(Box::new(move |call: MethodCall| forwarder.handle(call)));
            bound = Some((channel, inbound));
        });

        match (launched, bound) {
            (Ok(()), Some((channel, inbound))) => {
                self.channel = Some(channel);
                self.set_state(ModuleState::Ready);
                Some(inbound)
            }
            (Ok(()), None) => {
                self.lifecycle.destroy();
                self.set_state(ModuleState::Failed);
                None
            }
            (Err(e), _) => {
                tracing::error!("[bridge:{}] Engine failed to start: {}", self.name(), e);
                self.set_state(ModuleState::Failed);
                None
            }
        }
    }

    fn handle_command(&mut self, cmd: BridgeCommand) {
        match cmd {
            BridgeCommand::Invoke { call, reply } => {
                let channel = if self.lifecycle.state() == EngineState::Ready {
                    self.channel.as_mut()
                } else {
                    None
                };
                self.dispatcher.dispatch(channel, call, reply);
            }
            BridgeCommand::Stats { reply } => {
                let stats = self
                    .channel
                    .as_ref()
                    .map(CommandChannel::stats)
                    .unwrap_or_default();
                let _ = reply.send(stats);
            }
        }
    }

    /// Returns false once the engine side of the messenger is gone. The
    /// module is then `Failed`: pending calls get `TRANSPORT_ERROR` and
    /// later ones `INIT_ERROR`.
    fn handle_inbound(&mut self, envelope: Option<Envelope>) -> bool {
        let Some(channel) = self.channel.as_mut() else {
            return false;
        };

        match envelope {
            Some(envelope) => {
                if let Err(e) = channel.dispatch(envelope) {
                    tracing::debug!("[bridge:{}] Inbound message not handled: {}", self.name(), e);
                }
                true
            }
            None => {
                channel.close();
                tracing::warn!("[bridge:{}] Engine closed its messenger", self.name());
                self.lifecycle.destroy();
                self.set_state(ModuleState::Failed);
                false
            }
        }
    }

    /// Reject a command that arrived after teardown.
    fn reject(cmd: BridgeCommand) {
        match cmd {
            BridgeCommand::Invoke { reply, .. } => {
                let _ = reply.send(Err(BridgeError::Initialization));
            }
            BridgeCommand::Stats { reply } => {
                let _ = reply.send(Default::default());
            }
        }
    }

    /// Channel first, then engine.
    fn teardown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.lifecycle.destroy();
        self.set_state(ModuleState::Destroyed);
    }
}

async fn next_startup(
    startup: &mut Option<EngineFuture>,
) -> Result<Box<dyn EmbeddedEngine>, EngineError> {
    match startup {
        Some(creating) => creating.await,
        None => std::future::pending().await,
    }
}

async fn next_inbound(inbound: &mut Option<mpsc::UnboundedReceiver<Envelope>>) -> Option<Envelope> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The main loop that runs inside the confinement thread.
pub(crate) async fn run_worker(
    mut worker: Worker,
    mut cmd_rx: mpsc::Receiver<BridgeCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    worker.set_state(ModuleState::EngineStarting);
    let mut startup = match worker.lifecycle.start() {
        Ok(creating) => Some(creating),
        Err(e) => {
            tracing::error!("[bridge:{}] Cannot start engine: {}", worker.name(), e);
            worker.set_state(ModuleState::Failed);
            None
        }
    };
    let mut inbound: Option<mpsc::UnboundedReceiver<Envelope>> = None;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("[bridge:{}] Shutdown signal received", worker.name());
                    break;
                }
            }

            created = next_startup(&mut startup), if startup.is_some() => {
                startup = None;
                inbound = worker.launch(created);
            }

            envelope = next_inbound(&mut inbound), if inbound.is_some() => {
                if !worker.handle_inbound(envelope) {
                    inbound = None;
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => worker.handle_command(cmd),
                None => {
                    tracing::debug!("[bridge:{}] Command channel closed", worker.name());
                    break;
                }
            },
        }
    }

    drop(startup);
    worker.teardown();

    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        Worker::reject(cmd);
    }
    tracing::debug!("[bridge:{}] Worker finished", worker.name());
}
