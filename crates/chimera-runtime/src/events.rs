//! Embedded→host event forwarding.
//!
//! The embedded side pushes stream events as ordinary channel calls. The
//! [`EventForwarder`] recognizes the declared stream names, publishes the
//! payload on the module's [`EventHub`] and acknowledges the call.
//!
//! Delivery policy: every matched event is acknowledged and published,
//! whether or not anyone listens. The hub delivers it to the subscriptions
//! that exist at that moment; with no subscribers the event is dropped.
//! There is no replay buffer, so a subscriber never sees events published
//! before it subscribed.
//!
//! Each declared stream has its own broadcast buffer, so a busy stream can
//! only make its own subscribers lag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chimera_types::{MethodCall, MethodResponse};
use tokio::sync::broadcast;

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// One stream emission, converted to the host representation
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEvent {
    /// Stream name (e.g. "progress")
    pub name: String,
    /// Event payload
    pub payload: serde_json::Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Hub
// ─────────────────────────────────────────────────────────────────────────────

/// Host-side event subsystem of one bridge module.
///
/// Holds one broadcast sender per declared stream. Cloning is cheap; all
/// clones share the same senders and listener count.
#[derive(Clone)]
pub struct EventHub {
    channels: Arc<HashMap<String, broadcast::Sender<serde_json::Value>>>,
    listeners: Arc<AtomicUsize>,
}

impl EventHub {
    /// Create a hub for the given stream names, each buffering up to
    /// `capacity` undelivered payloads per subscriber.
    pub fn new<I>(streams: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let channels = streams
            .into_iter()
            .map(|name| {
                let (tx, _) = broadcast::channel(capacity.max(1));
                (name, tx)
            })
            .collect();
        Self {
            channels: Arc::new(channels),
            listeners: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Publish an event to every current subscriber of its stream.
    ///
    /// Returns the number of subscribers it was delivered to.
    pub fn publish(&self, event: BridgeEvent) -> usize {
        let Some(tx) = self.channels.get(&event.name) else {
            tracing::debug!("[events] No stream named {}, dropping", event.name);
            return 0;
        };
        match tx.send(event.payload) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!("[events] No subscribers, dropping {}", event.name);
                0
            }
        }
    }

    /// Subscribe to one stream. `None` if the stream was never declared.
    pub fn subscribe(&self, name: &str) -> Option<EventSubscription> {
        let rx = self.channels.get(name)?.subscribe();
        self.add_listener();
        Some(EventSubscription {
            name: name.to_string(),
            rx,
            listeners: Arc::clone(&self.listeners),
        })
    }

    /// Count one more listener. Never fails.
    pub fn add_listener(&self) {
        self.listeners.fetch_add(1, Ordering::SeqCst);
    }

    /// Release `count` listeners, saturating at zero. Never fails.
    pub fn remove_listeners(&self, count: usize) {
        release(&self.listeners, count);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    pub fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Subscription
// ─────────────────────────────────────────────────────────────────────────────

fn release(listeners: &AtomicUsize, count: usize) {
    let _ = listeners.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
        Some(n.saturating_sub(count))
    });
}

/// A listener for one stream.
///
/// Holds one listener reference on the hub, released on drop.
pub struct EventSubscription {
    name: String,
    rx: broadcast::Receiver<serde_json::Value>,
    listeners: Arc<AtomicUsize>,
}

impl EventSubscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lagged(&self, skipped: u64) {
        tracing::warn!(
            "[events] Subscriber for {} lagged, skipped {} event(s)",
            self.name,
            skipped
        );
    }

    /// Wait for the next payload on this stream.
    ///
    /// Returns `None` once every handle to the hub has been dropped.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next payload if one is already queued
    pub fn try_recv(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.rx.try_recv() {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(_) => return None,
            }
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        release(&self.listeners, 1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Forwarder
// ─────────────────────────────────────────────────────────────────────────────

/// Republishes inbound stream calls on the host event hub.
#[derive(Clone)]
pub(crate) struct EventForwarder {
    hub: EventHub,
}

impl EventForwarder {
    pub fn new(hub: EventHub) -> Self {
        Self { hub }
    }

    /// Handle one call from the embedded side.
    pub fn handle(&self, call: MethodCall) -> MethodResponse {
        if !self.hub.has_stream(&call.method_name) {
            tracing::debug!("[events] No stream named {}", call.method_name);
            return MethodResponse::NotImplemented;
        }

        let delivered = self.hub.publish(BridgeEvent {
            name: call.method_name,
            payload: call.arguments.into_host(),
        });
        tracing::trace!("[events] Delivered to {} subscriber(s)", delivered);
        MethodResponse::ack()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
