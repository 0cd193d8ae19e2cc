//! Fixtures shared by the end-to-end tests and the smoke-test client.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lib_relay::connections::relay_client::HEARTBEAT_PAYLOAD;
use lib_relay::connections::{EndDelimitedCodec, SessionKey};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type AlertSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens a WebSocket to `url`.
pub async fn connect_client(url: &str) -> anyhow::Result<AlertSocket> {
    let (socket, _) = connect_async(url).await?;
    Ok(socket)
}

pub async fn send_text(socket: &mut AlertSocket, text: &str) -> anyhow::Result<()> {
    socket.send(Message::text(text)).await?;
    Ok(())
}

/// Next text frame within `wait`, skipping control frames.
pub async fn recv_text(socket: &mut AlertSocket, wait: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(left, socket.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text.to_string()),
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) | Err(_) => return None,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

/// A stand-in for the upstream relay peer.
///
/// Accepts any number of connections and decrypts every `<END>` delimited
/// frame with today's key. Frames that do not decrypt are reported as
/// lossy UTF-8.
pub struct FakeRelayPeer {
    addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<()>,
}

impl FakeRelayPeer {
    pub async fn bind(secret: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, frames) = mpsc::unbounded_channel();
        let secret = secret.to_string();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let secret = secret.clone();
                tokio::spawn(async move {
                    let mut frames = FramedRead::new(stream, EndDelimitedCodec::default());
                    while let Some(Ok(frame)) = frames.next().await {
                        let text = SessionKey::for_today(&secret)
                            .open_text(&frame)
                            .unwrap_or_else(|_| String::from_utf8_lossy(&frame).into_owned());
                        if tx.send(text).is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Ok(Self { addr, frames, task })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Next decrypted frame, heartbeats included.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<String> {
        tokio::time::timeout(wait, self.frames.recv()).await.ok().flatten()
    }

    /// Next decrypted frame that is not a heartbeat.
    pub async fn next_payload(&mut self, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = self.next_frame(left).await?;
            if frame.as_bytes() != HEARTBEAT_PAYLOAD {
                return Some(frame);
            }
        }
    }
}

impl Drop for FakeRelayPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
