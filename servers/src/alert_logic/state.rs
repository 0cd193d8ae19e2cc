use std::sync::Arc;
use std::time::Duration;

use lib_relay::connections::RelayClient;
use lib_relay::core::BroadcastHub;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Shared handles for the HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub relay: RelayClient,
    /// Bound on one WebSocket write before the client is dropped.
    pub send_timeout: Duration,
    pub cancel: CancellationToken,
    /// Every upgraded WebSocket session task.
    pub sessions: TaskTracker,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub sessions: usize,
    pub relay: String,
    pub pending_accepted: usize,
    pub pending_ignored: usize,
    pub flushes: u64,
}

impl AppState {
    pub fn status(&self) -> StatusReport {
        let governor = self.hub.governor();
        let (pending_accepted, pending_ignored) = governor.pending_counts();
        StatusReport {
            sessions: self.hub.session_count(),
            relay: self.relay.state().to_string(),
            pending_accepted,
            pending_ignored,
            flushes: governor.flush_count(),
        }
    }
}
