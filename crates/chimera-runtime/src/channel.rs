//! The duplex command channel over an engine's messenger.
//!
//! Outbound calls get a monotonically increasing correlation ID and a
//! completion stored under it. Replies are matched by ID only; a reply for
//! an ID with no pending completion is dropped and counted, never used to
//! resolve some other call. The channel lives on the confinement thread, so
//! none of this needs locking.

use std::collections::HashMap;

use chimera_types::{Envelope, EnvelopeKind, MethodCall, MethodResponse};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::messenger::{MessengerPort, Outbound};

/// Continuation run on the confinement thread when a call settles
pub(crate) type Completion = Box<dyn FnOnce(Result<MethodResponse, TransportError>)>;

/// Handler for calls initiated by the embedded side
pub(crate) type InboundHandler = Box<dyn FnMut(MethodCall) -> MethodResponse>;

/// Counters describing channel traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Outbound calls handed to the transport
    pub calls_sent: u64,
    /// Outbound calls still waiting for a reply
    pub pending: usize,
    /// Replies that settled a pending call
    pub replies_matched: u64,
    /// Replies dropped because no call was waiting on their ID
    pub replies_unmatched: u64,
    /// Calls received from the embedded side
    pub inbound_calls: u64,
}

pub(crate) struct CommandChannel {
    name: String,
    outbound: Outbound,
    next_id: u64,
    pending: HashMap<u64, Completion>,
    handler: Option<InboundHandler>,
    closed: bool,
    stats: ChannelStats,
}

impl CommandChannel {
    /// Bind a channel to the host end of an engine's messenger.
    ///
    /// Returns the channel and the inbound stream the confinement loop must
    /// feed back into [`CommandChannel::dispatch`].
    pub fn bind(name: impl Into<String>, port: MessengerPort) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (outbound, inbound) = port.into_parts();
        let channel = Self {
            name: name.into(),
            outbound,
            next_id: 1,
            pending: HashMap::new(),
            handler: None,
            closed: false,
            stats: ChannelStats::default(),
        };
        (channel, inbound)
    }

    /// Install the handler for calls coming from the embedded side.
    ///
    /// Only one handler is active; installing another replaces it.
    pub fn on_receive(&mut self, handler: InboundHandler) {
        if self.handler.replace(handler).is_some() {
            tracing::debug!("[channel:{}] Replaced inbound handler", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            pending: self.pending.len(),
            ..self.stats
        }
    }

    /// Send a call to the embedded side.
    ///
    /// `completion` runs exactly once: with the reply, or with a transport
    /// error if the call cannot be delivered or the channel closes first.
    pub fn send(&mut self, call: MethodCall, completion: Completion) {
        if self.closed {
            completion(Err(TransportError::Closed));
            return;
        }

        let id = self.next_id;
        self.next_id += 1;

        let envelope = match Envelope::call(id, &call) {
            Ok(envelope) => envelope,
            Err(e) => {
                completion(Err(e.into()));
                return;
            }
        };

        if let Err(e) = self.outbound.send(envelope) {
            completion(Err(e));
            return;
        }

        tracing::trace!("[channel:{}] -> #{} {}", self.name, id, call.method_name);
        self.stats.calls_sent += 1;
        self.pending.insert(id, completion);
    }

    /// Process one envelope received from the embedded side.
    pub fn dispatch(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        match envelope.kind {
            EnvelopeKind::Reply => self.settle(envelope),
            EnvelopeKind::Call => self.answer(envelope),
        }
    }

    fn settle(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        let Some(completion) = self.pending.remove(&envelope.id) else {
            self.stats.replies_unmatched += 1;
            tracing::warn!(
                "[channel:{}] Dropping reply for unknown correlation id {}",
                self.name,
                envelope.id
            );
            return Err(TransportError::UnknownCorrelation(envelope.id));
        };

        self.stats.replies_matched += 1;
        completion(envelope.decode_reply().map_err(TransportError::from));
        Ok(())
    }

    fn answer(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        self.stats.inbound_calls += 1;

        let response = match envelope.decode_call() {
            Ok(call) => match self.handler.as_mut() {
                Some(handler) => handler(call),
                None => MethodResponse::NotImplemented,
            },
            Err(e) => MethodResponse::error("DECODE_ERROR", e.to_string()),
        };

        if self.closed {
            return Err(TransportError::Closed);
        }
        self.outbound.send(Envelope::reply(envelope.id, &response)?)
    }

    /// Close the channel and fail every outstanding call.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handler = None;

        let pending: Vec<_> = self.pending.drain().collect();
        if !pending.is_empty() {
            tracing::debug!(
                "[channel:{}] Failing {} in-flight call(s) on close",
                self.name,
                pending.len()
            );
        }
        for (_, completion) in pending {
            completion(Err(TransportError::Closed));
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
