use crate::alert_logic::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use lib_relay::core::OutboundText;
use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(app_state)
}

/// Serves the endpoint on `listener` until the state's cancel token fires.
pub async fn serve(listener: TcpListener, app_state: AppState) -> std::io::Result<()> {
    let cancel = app_state.cancel.clone();
    if let Ok(addr) = listener.local_addr() {
        info!("Downstream server listening on {}", addr);
    }

    axum::serve(
        listener,
        router(app_state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        cancel.cancelled().await;
        info!("Downstream server shutting down.");
    })
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| sessions.track_future(handle_socket(socket, peer, state)))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status())
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: AppState) {
    let label = peer.to_string();
    let (session, outbound) = state.hub.open_session(&label).await;
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound, state.send_timeout, label.clone()));

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => break,
            _ = &mut writer => {
                debug!("Writer for {} stopped", label);
                break;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.hub.handle_frame(&session, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Client {} read error: {}", label, e);
                    break;
                }
            }
        }
    }

    drop(session);
    writer.abort();
    info!("Client {} disconnected", label);
}

/// Drains one session's queue into its socket. A write that takes longer
/// than `send_timeout` closes the session; dropping the queue then lets the
/// hub prune it.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<OutboundText>,
    send_timeout: Duration,
    label: String,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(text) = outbound.recv().await {
        let frame = Message::Text(text.as_ref().into());
        match tokio::time::timeout(send_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Client {} write failed: {}", label, e);
                break;
            }
            Err(_) => {
                warn!("Client {} write timed out after {:?}; closing", label, send_timeout);
                break;
            }
        }
    }

    if tokio::time::timeout(send_timeout, sink.close()).await.is_err() {
        debug!("Client {} did not close in time", label);
    }
}
