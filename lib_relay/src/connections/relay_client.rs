//! # Relay Client
//!
//! Keeps one best-effort connection to the encrypted upstream TCP peer.
//!
//! ## State machine
//!
//! `Disconnected → Connecting → Authenticating → Connected → Reconnecting`
//! and back to `Connecting`, finally `Closed` once the cancellation token fires.
//!
//! - **Connecting**: dial through a [`Connector`]. Failures wait
//!   `reconnect_delay` and retry forever, until cancelled.
//! - **Authenticating**: derive today's [`SessionKey`] and write the sealed
//!   username as the first frame.
//! - **Connected**: one task multiplexes the outbound queue, inbound frames
//!   and the heartbeat ticker. Any socket error, EOF or write timeout ends
//!   the session.
//! - **Reconnecting**: queued-but-unsent payloads are dropped (at-most-once
//!   delivery), then the backoff runs and dialing restarts.
//!
//! The key is bound to the UTC date (see [`RelayConfig::today`]). On every
//! heartbeat tick the session checks the date and, when it has rolled over,
//! reconnects at once so the peer sees a fresh authentication under the new
//! key.
//!
//! [`RelayClient::send_payload`] never blocks: it reports
//! [`SendOutcome::NotConnected`] or [`SendOutcome::QueueFull`] instead.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::relay_codec::EndDelimitedCodec;
use super::relay_crypto::SessionKey;

/// Payload sealed and written on every heartbeat tick.
pub const HEARTBEAT_PAYLOAD: &[u8] = b"heartbeat";

/// # Connector
///
/// Dials the upstream peer. The production implementation is
/// [`TcpConnector`]; tests substitute in-memory streams.
pub trait Connector: Send + Sync + 'static {
    /// The duplex byte stream produced by a successful dial.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a fresh connection.
    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Human-readable peer name for logs.
    fn describe(&self) -> String {
        "upstream".to_string()
    }
}

/// Plain TCP dialer with a bounded connect timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector for `host:port`.
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(result) => {
                let stream = result?;
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "connect to {} timed out after {}s",
                    self.addr,
                    self.connect_timeout.as_secs_f64()
                ),
            )),
        }
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

/// Relay session settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Sent sealed as the authentication frame.
    pub username: String,
    /// Hashed with the UTC date to form the session key.
    pub secret: String,
    /// Interval between heartbeat frames (and day-rollover checks).
    pub heartbeat_interval: Duration,
    /// Wait between a failure and the next dial.
    pub reconnect_delay: Duration,
    /// Upper bound for a single frame write.
    pub write_timeout: Duration,
    /// Capacity of the outbound queue.
    pub queue_capacity: usize,
    /// Source of the date the session key is bound to.
    pub today: fn() -> NaiveDate,
}

/// The current UTC calendar date.
pub fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}

impl RelayConfig {
    /// Settings with the workspace defaults for timings and queue size.
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            queue_capacity: 1024,
            today: utc_today,
        }
    }
}

/// Lifecycle of the relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Created, worker not yet running.
    Disconnected,
    /// Dialing the peer.
    Connecting,
    /// Writing the authentication frame.
    Authenticating,
    /// Session established; `send_payload` queues.
    Connected,
    /// Session lost; waiting to dial again.
    Reconnecting,
    /// Cancelled; the worker has exited.
    Closed,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Disconnected => "disconnected",
            RelayState::Connecting => "connecting",
            RelayState::Authenticating => "authenticating",
            RelayState::Connected => "connected",
            RelayState::Reconnecting => "reconnecting",
            RelayState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Result of a non-blocking [`RelayClient::send_payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted into the outbound queue.
    Queued,
    /// Dropped: the session is not in `Connected`.
    NotConnected,
    /// Dropped: the outbound queue is at capacity.
    QueueFull,
}

impl SendOutcome {
    /// True when the payload entered the queue.
    pub fn is_queued(&self) -> bool {
        matches!(self, SendOutcome::Queued)
    }
}

/// # Relay Client
///
/// Cheap to clone handle onto the background worker.
#[derive(Debug, Clone)]
pub struct RelayClient {
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<RelayState>,
}

impl RelayClient {
    /// Spawns the relay worker on the current tokio runtime.
    ///
    /// The worker runs until `cancel` fires and then reports `Closed`.
    pub fn start<C: Connector>(
        connector: C,
        config: RelayConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(RelayState::Disconnected);

        let worker = RelayWorker {
            connector,
            config,
            outbound: outbound_rx,
            state: state_tx,
            cancel,
        };
        let handle = tokio::spawn(worker.run());

        (
            Self {
                outbound: outbound_tx,
                state: state_rx,
            },
            handle,
        )
    }

    /// Current session state.
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// True while the session is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state() == RelayState::Connected
    }

    /// Queues a plaintext payload for sealing and delivery.
    pub fn send_payload(&self, payload: String) -> SendOutcome {
        if !self.is_connected() {
            log::debug!("Relay not connected ({}); payload dropped", self.state());
            return SendOutcome::NotConnected;
        }

        match self.outbound.try_send(payload) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Relay outbound queue full; payload dropped");
                SendOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::NotConnected,
        }
    }

    /// Waits until the session reaches `Connected`.
    ///
    /// Returns `false` if the worker exits first.
    pub async fn wait_connected(&self) -> bool {
        self.wait_for_state(RelayState::Connected).await
    }

    /// Waits until the session reaches `target`.
    pub async fn wait_for_state(&self, target: RelayState) -> bool {
        let mut state = self.state.clone();
        let reached = state.wait_for(|current| *current == target).await.is_ok();
        reached
    }
}

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    DayRollover,
    Failed(String),
}

struct RelayWorker<C: Connector> {
    connector: C,
    config: RelayConfig,
    outbound: mpsc::Receiver<String>,
    state: watch::Sender<RelayState>,
    cancel: CancellationToken,
}

impl<C: Connector> RelayWorker<C> {
    async fn run(mut self) {
        let peer = self.connector.describe();
        let mut attempt: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(RelayState::Connecting);
            attempt += 1;

            let dialed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            let stream = match dialed {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("Relay connect attempt {} to {} failed: {}", attempt, peer, e);
                    if !self.backoff().await {
                        break;
                    }
                    continue;
                }
            };
            attempt = 0;

            let end = self.run_session(stream).await;
            self.set_state(RelayState::Reconnecting);
            self.discard_queued();

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::DayRollover => {
                    log::info!("UTC date rolled over; re-authenticating with {}", peer);
                }
                SessionEnd::Failed(reason) => {
                    log::warn!("Relay session with {} lost: {}", peer, reason);
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        self.outbound.close();
        self.discard_queued();
        self.set_state(RelayState::Closed);
        log::info!("Relay client for {} closed", peer);
    }

    async fn run_session(&mut self, stream: C::Stream) -> SessionEnd {
        self.set_state(RelayState::Authenticating);

        let key = SessionKey::derive(&self.config.secret, (self.config.today)());
        let (reader, writer) = tokio::io::split(stream);
        let mut frames_in = FramedRead::new(reader, EndDelimitedCodec::default());
        let mut frames_out = FramedWrite::new(writer, EndDelimitedCodec::default());

        let auth = key.seal(self.config.username.as_bytes());
        if let Err(reason) = self.write_frame(&mut frames_out, auth).await {
            return SessionEnd::Failed(format!("authentication failed: {}", reason));
        }

        self.set_state(RelayState::Connected);
        log::info!(
            "Relay connected as '{}' (key {} for {})",
            self.config.username,
            key.fingerprint(),
            key.date()
        );

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    close_writer(&mut frames_out).await;
                    return SessionEnd::Cancelled;
                }
                queued = self.outbound.recv() => {
                    let Some(payload) = queued else {
                        return SessionEnd::Cancelled;
                    };
                    let frame = key.seal(payload.as_bytes());
                    if let Err(reason) = self.write_frame(&mut frames_out, frame).await {
                        return SessionEnd::Failed(reason);
                    }
                    log::trace!("Relayed {} bytes", payload.len());
                }
                inbound = frames_in.next() => match inbound {
                    Some(Ok(frame)) => log_inbound(&key, &frame),
                    Some(Err(e)) => return SessionEnd::Failed(format!("read error: {}", e)),
                    None => return SessionEnd::Failed("peer closed the connection".to_string()),
                },
                _ = heartbeat.tick() => {
                    if (self.config.today)() != key.date() {
                        close_writer(&mut frames_out).await;
                        return SessionEnd::DayRollover;
                    }
                    let frame = key.seal(HEARTBEAT_PAYLOAD);
                    if let Err(reason) = self.write_frame(&mut frames_out, frame).await {
                        return SessionEnd::Failed(format!("heartbeat: {}", reason));
                    }
                    log::trace!("Relay heartbeat sent");
                }
            }
        }
    }

    async fn write_frame(
        &self,
        frames_out: &mut FramedWrite<WriteHalf<C::Stream>, EndDelimitedCodec>,
        frame: Vec<u8>,
    ) -> Result<(), String> {
        match timeout(self.config.write_timeout, frames_out.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("write error: {}", e)),
            Err(_) => Err(format!(
                "write timed out after {}s",
                self.config.write_timeout.as_secs_f64()
            )),
        }
    }

    /// Sleeps for the reconnect delay. Returns `false` when cancelled.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(self.config.reconnect_delay) => true,
        }
    }

    fn discard_queued(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::warn!("Dropped {} queued relay payload(s) after session loss", dropped);
        }
    }

    fn set_state(&self, next: RelayState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::debug!("Relay state {} -> {}", previous, next);
        }
    }
}

async fn close_writer<W: AsyncWrite + Unpin>(frames_out: &mut FramedWrite<W, EndDelimitedCodec>) {
    if let Err(e) = SinkExt::<Vec<u8>>::close(frames_out).await {
        log::debug!("Relay writer close failed: {}", e);
    }
}

fn log_inbound(key: &SessionKey, frame: &[u8]) {
    match key.open_text(frame) {
        Ok(text) => log::info!("Relay inbound (decrypted): {}", text),
        Err(e) => log::info!(
            "Relay inbound (plaintext, {}): {}",
            e,
            String::from_utf8_lossy(frame)
        ),
    }
}
