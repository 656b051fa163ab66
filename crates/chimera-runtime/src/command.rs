//! Commands posted to the confinement thread.

use chimera_types::MethodCall;
use tokio::sync::oneshot;

use crate::channel::ChannelStats;
use crate::dispatcher::Reply;

/// Work a caller hands to the confinement thread.
///
/// Teardown is not a command: it travels on its own watch channel so it can
/// overtake queued calls.
pub(crate) enum BridgeCommand {
    /// Guard, send and eventually settle one future call.
    Invoke { call: MethodCall, reply: Reply },

    /// Snapshot the channel counters.
    Stats {
        reply: oneshot::Sender<ChannelStats>,
    },
}
