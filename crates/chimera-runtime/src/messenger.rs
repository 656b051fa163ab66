//! In-process binary messenger between the host and the embedded engine.
//!
//! A messenger is a pair of ports joined back to back: whatever one port
//! sends, the other receives. Both ends only ever see encoded [`Envelope`]s,
//! never each other's objects.

use chimera_types::Envelope;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Sending half of a port. Cheap to clone and usable from any thread.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbound {
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.tx.send(envelope).map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One end of a messenger
#[derive(Debug)]
pub struct MessengerPort {
    outbound: Outbound,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl MessengerPort {
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Wait for the next envelope from the other end.
    ///
    /// Returns `None` once the other end has been dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    pub fn into_parts(self) -> (Outbound, mpsc::UnboundedReceiver<Envelope>) {
        (self.outbound, self.inbound)
    }
}

/// Create a connected pair of ports: `(host, engine)`.
///
/// The transport is unbounded; the bridge has no backpressure policy.
pub fn pair() -> (MessengerPort, MessengerPort) {
    let (host_tx, engine_rx) = mpsc::unbounded_channel();
    let (engine_tx, host_rx) = mpsc::unbounded_channel();

    let host = MessengerPort {
        outbound: Outbound { tx: host_tx },
        inbound: host_rx,
    };
    let engine = MessengerPort {
        outbound: Outbound { tx: engine_tx },
        inbound: engine_rx,
    };
    (host, engine)
}
