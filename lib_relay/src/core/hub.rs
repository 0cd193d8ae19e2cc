//! # Broadcast Hub
//!
//! Owns the set of live WebSocket sessions and the per-frame pipeline:
//!
//! 1. Classify the frame (ping, history request, alert).
//! 2. Stamp the server timestamp and build a [`MessageRecord`].
//! 3. Check the session's ignore list. Ignored records are buffered for the
//!    ignored store and go nowhere else.
//! 4. Accepted records are handed to the relay, fanned out to every session
//!    (the sender included), buffered for the accepted store and announced
//!    through the notifier.
//!
//! ## Fan-out
//!
//! Each session owns a bounded queue drained by its own writer task. The hub
//! only ever `try_send`s into those queues, so a stalled client costs a
//! dropped frame for that client and never delays the others or the relay.
//! Sessions whose queue is closed are pruned during the same pass.
//!
//! ## Shutdown
//!
//! [`BroadcastHub::close`] stops the hub from taking new alerts. Pings and
//! history requests are still answered until the sessions end.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::batch_governor::BatchGovernor;
use super::ignore_filter::{should_ignore, IgnoreList};
use super::record::{ingest_timestamp, parse_frame, ClientFrame, MessageRecord, PONG};
use crate::connections::{RelayClient, SendOutcome};
use crate::loggers::{Notifier, NotifyLevel};

/// Text frame queued for one session's writer.
pub type OutboundText = Arc<str>;

/// Where accepted records go upstream.
pub trait RelaySink: Send + Sync {
    fn send(&self, record: &MessageRecord) -> SendOutcome;
}

impl RelaySink for RelayClient {
    fn send(&self, record: &MessageRecord) -> SendOutcome {
        match serde_json::to_string(record) {
            Ok(payload) => self.send_payload(payload),
            Err(e) => {
                log::error!("Failed to serialize record for relay: {}", e);
                SendOutcome::NotConnected
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each session's outbound queue.
    pub session_queue_capacity: usize,
    /// Zone for record timestamps.
    pub timezone: Tz,
    /// JSON ignore list read when a session opens.
    pub ignore_list_path: PathBuf,
}

/// What the hub did with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Answered a ping.
    Pong,
    /// Replied with this many history records.
    History(usize),
    /// The accepted store could not be read; nothing was sent.
    HistoryUnavailable,
    /// Accepted, relayed (or not, see the outcome) and broadcast.
    Accepted {
        relay: SendOutcome,
        delivered: usize,
    },
    /// Matched the session's ignore list.
    Ignored,
    /// No ticker; dropped.
    MissingTicker,
    /// Not a recognised frame; the session stays open.
    Malformed(String),
    /// The hub is closed to new alerts.
    ShuttingDown,
}

struct SessionHandle {
    label: String,
    sender: mpsc::Sender<OutboundText>,
    dropped: u64,
}

/// # Session
///
/// One WebSocket connection's view of the hub. Dropping it deregisters the
/// connection whatever path ended it.
pub struct Session {
    id: u64,
    label: String,
    ignore_list: IgnoreList,
    replies: mpsc::Sender<OutboundText>,
    hub: Arc<BroadcastHub>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ignore_list(&self) -> &IgnoreList {
        &self.ignore_list
    }

    /// Queues a reply for this session only. A full queue drops it, the
    /// same as a broadcast would.
    fn reply(&self, text: OutboundText) {
        match self.replies.try_send(text) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Session {} is lagging; dropped reply", self.label);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Session {} closed before its reply was queued", self.label);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.hub.remove_session(self.id);
    }
}

/// # Broadcast Hub
pub struct BroadcastHub {
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    relay: Arc<dyn RelaySink>,
    governor: Arc<BatchGovernor>,
    notifier: Arc<dyn Notifier>,
    config: HubConfig,
}

impl BroadcastHub {
    pub fn new(
        relay: Arc<dyn RelaySink>,
        governor: Arc<BatchGovernor>,
        notifier: Arc<dyn Notifier>,
        config: HubConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            relay,
            governor,
            notifier,
            config,
        }
    }

    pub fn governor(&self) -> &Arc<BatchGovernor> {
        &self.governor
    }

    /// Registers a connection and loads its ignore list.
    ///
    /// The receiver must be drained by the connection's writer task.
    pub async fn open_session(
        self: &Arc<Self>,
        label: &str,
    ) -> (Session, mpsc::Receiver<OutboundText>) {
        let ignore_list = match IgnoreList::load(&self.config.ignore_list_path).await {
            Ok(list) => list,
            Err(e) => {
                log::warn!("Ignore list unavailable for {}, ignoring nothing: {}", label, e);
                IgnoreList::default()
            }
        };

        let (tx, rx) = mpsc::channel(self.config.session_queue_capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let total = {
            let mut sessions = self.lock_sessions();
            sessions.insert(
                id,
                SessionHandle {
                    label: label.to_string(),
                    sender: tx.clone(),
                    dropped: 0,
                },
            );
            sessions.len()
        };
        log::info!(
            "Session {} ({}) opened with {} ignore rule(s); {} live",
            id,
            label,
            ignore_list.len(),
            total
        );

        let session = Session {
            id,
            label: label.to_string(),
            ignore_list,
            replies: tx,
            hub: Arc::clone(self),
        };
        (session, rx)
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Refuses every alert from now on.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::info!("Hub closed to new alerts");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Processes one inbound text frame from `session`.
    pub async fn handle_frame(&self, session: &Session, text: &str) -> FrameOutcome {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Malformed frame from {}: {}", session.label, e);
                return FrameOutcome::Malformed(e.to_string());
            }
        };

        match frame {
            ClientFrame::Ping => {
                session.reply(Arc::from(PONG));
                FrameOutcome::Pong
            }
            ClientFrame::HistoryRequest => self.reply_history(session).await,
            ClientFrame::Alert(inbound) => {
                if self.is_closed() {
                    log::warn!("Alert from {} refused: shutting down", session.label);
                    return FrameOutcome::ShuttingDown;
                }

                let timestamp = ingest_timestamp(self.config.timezone);
                let Some(record) = MessageRecord::from_frame(&inbound, timestamp) else {
                    log::warn!("Dropped frame without ticker from {}", session.label);
                    return FrameOutcome::MissingTicker;
                };

                if should_ignore(record.sender(), record.ticker(), &session.ignore_list) {
                    log::info!("Ignored {} from {}", record.ticker(), record.sender());
                    self.governor.enqueue_ignored(record);
                    return FrameOutcome::Ignored;
                }

                self.accept(record)
            }
        }
    }

    fn accept(&self, record: MessageRecord) -> FrameOutcome {
        let relay = self.relay.send(&record);
        if !relay.is_queued() {
            log::warn!(
                "Alert {} from {} not relayed: {:?}",
                record.ticker(),
                record.sender(),
                relay
            );
        }

        let delivered = match serde_json::to_string(&record) {
            Ok(json) => self.broadcast(Arc::from(json)),
            Err(e) => {
                log::error!("Failed to serialize record for broadcast: {}", e);
                0
            }
        };

        self.notifier.notify(&alert_summary(&record), NotifyLevel::Info);
        self.governor.enqueue_accepted(record);

        FrameOutcome::Accepted { relay, delivered }
    }

    /// Queues `payload` for every live session and returns how many took it.
    pub fn broadcast(&self, payload: OutboundText) -> usize {
        let mut delivered = 0;
        let mut sessions = self.lock_sessions();

        sessions.retain(|id, handle| match handle.sender.try_send(Arc::clone(&payload)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                handle.dropped += 1;
                log::warn!(
                    "Session {} ({}) is lagging; dropped broadcast ({} so far)",
                    id,
                    handle.label,
                    handle.dropped
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                log::info!("Session {} ({}) closed; pruning", id, handle.label);
                false
            }
        });

        delivered
    }

    async fn reply_history(&self, session: &Session) -> FrameOutcome {
        let records = match self.governor.accepted_store().load().await {
            Ok(records) => records,
            Err(e) => {
                log::error!("History unavailable for {}: {}", session.label, e);
                return FrameOutcome::HistoryUnavailable;
            }
        };

        let history: Vec<MessageRecord> = records.iter().map(MessageRecord::as_history).collect();
        match serde_json::to_string(&history) {
            Ok(json) => {
                session.reply(Arc::from(json));
                log::info!("Sent {} history record(s) to {}", history.len(), session.label);
                FrameOutcome::History(history.len())
            }
            Err(e) => {
                log::error!("Failed to serialize history: {}", e);
                FrameOutcome::HistoryUnavailable
            }
        }
    }

    fn remove_session(&self, id: u64) {
        let removed = self.lock_sessions().remove(&id);
        if let Some(handle) = removed {
            log::info!(
                "Session {} ({}) closed after {} dropped frame(s)",
                id,
                handle.label,
                handle.dropped
            );
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SessionHandle>> {
        self.sessions.lock().expect("Hub lock poisoned")
    }
}

fn alert_summary(record: &MessageRecord) -> String {
    let mut summary = format!(
        "{} {} alert from {}",
        record.ticker(),
        record.kind(),
        record.sender()
    );
    if let Some(target) = record.target() {
        summary.push_str(&format!(", target {}", target));
    }
    if let Some(shares) = record.shares() {
        summary.push_str(&format!(", shares {}", shares));
    }
    summary
}
