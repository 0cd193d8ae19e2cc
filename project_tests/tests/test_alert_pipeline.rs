use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lib_relay::core::{FrameOutcome, JsonStore};
use lib_relay::loggers::LogNotifier;
use project_tests::{connect_client, recv_text, send_text, AlertSocket, FakeRelayPeer};
use serde_json::Value;
use servers::alert_logic::config::{resolve, Config, Settings};
use servers::alert_logic::downstream;
use servers::alert_logic::service::Pipeline;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "integration-secret";
const WAIT: Duration = Duration::from_secs(5);

struct Running {
    pipeline: Pipeline,
    server: JoinHandle<std::io::Result<()>>,
    cancel: CancellationToken,
    url: String,
    settings: Settings,
}

impl Running {
    async fn client(&self) -> AlertSocket {
        connect_client(&self.url).await.unwrap()
    }

    async fn stop(self) -> Settings {
        self.cancel.cancel();
        self.server.await.unwrap().unwrap();
        self.pipeline.join().await;
        self.settings
    }
}

fn settings(data_dir: &Path, relay_port: u16) -> Settings {
    resolve(Config {
        config_path: Some(data_dir.join("absent.conf")),
        relay_host: Some("127.0.0.1".to_string()),
        relay_port: Some(relay_port),
        relay_secret: Some(SECRET.to_string()),
        relay_username: Some("alerts".to_string()),
        save_delay_seconds: Some(1),
        reconnect_delay_seconds: Some(1),
        data_dir: Some(data_dir.to_path_buf()),
        backup_dir: Some(data_dir.join("backup")),
        ..Default::default()
    })
    .unwrap()
}

async fn start(data_dir: &Path, peer: &mut FakeRelayPeer) -> Running {
    let settings = settings(data_dir, peer.port());
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::start(&settings, Arc::new(LogNotifier), cancel.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let app_state = pipeline.app_state(&settings, cancel.clone());
    let server = tokio::spawn(downstream::serve(listener, app_state));

    assert!(tokio::time::timeout(WAIT, pipeline.relay.wait_connected()).await.unwrap());
    assert_eq!(peer.next_payload(WAIT).await.as_deref(), Some("alerts"));

    Running {
        pipeline,
        server,
        cancel,
        url,
        settings,
    }
}

async fn recv_json(socket: &mut AlertSocket) -> Value {
    let text = recv_text(socket, WAIT).await.expect("no frame received");
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_alert_is_broadcast_relayed_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakeRelayPeer::bind(SECRET).await.unwrap();
    let running = start(dir.path(), &mut peer).await;

    let mut alice = running.client().await;
    let mut bob = running.client().await;

    send_text(&mut alice, "[1").await.unwrap();
    assert_eq!(recv_text(&mut alice, WAIT).await.as_deref(), Some("[2"));

    send_text(
        &mut alice,
        r#"{"sender":"alice","name":"Alice","ticker":"AAPL","type":"buy","target":"190"}"#,
    )
    .await
    .unwrap();

    let to_alice = recv_json(&mut alice).await;
    let to_bob = recv_json(&mut bob).await;
    assert_eq!(to_alice, to_bob);
    assert_eq!(to_bob["ticker"], "AAPL");
    assert_eq!(to_bob["old_message"], false);

    let relayed: Value = serde_json::from_str(&peer.next_payload(WAIT).await.unwrap()).unwrap();
    assert_eq!(relayed, to_bob);

    let settings = running.stop().await;
    let stored = JsonStore::new(&settings.messages_path).load().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].ticker(), "AAPL");
}

#[tokio::test]
async fn test_ignored_sender_is_filtered_and_kept_apart() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ignore_list.json"), r#"{"bob": ["tsla"]}"#).unwrap();

    let mut peer = FakeRelayPeer::bind(SECRET).await.unwrap();
    let running = start(dir.path(), &mut peer).await;
    let mut bob = running.client().await;

    send_text(&mut bob, r#"{"sender":"bob","ticker":"TSLA","shares":150}"#).await.unwrap();
    send_text(&mut bob, r#"{"sender":"bob","ticker":"MSFT"}"#).await.unwrap();

    // Only the second alert comes back.
    assert_eq!(recv_json(&mut bob).await["ticker"], "MSFT");
    let relayed: Value = serde_json::from_str(&peer.next_payload(WAIT).await.unwrap()).unwrap();
    assert_eq!(relayed["ticker"], "MSFT");

    let settings = running.stop().await;
    let ignored = JsonStore::new(&settings.ignored_path).load().await.unwrap();
    assert_eq!(ignored.len(), 1);
    assert_eq!(ignored[0].shares(), Some("150"));
    assert_eq!(JsonStore::new(&settings.messages_path).load().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_history_request_replays_flushed_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakeRelayPeer::bind(SECRET).await.unwrap();
    let running = start(dir.path(), &mut peer).await;
    let mut client = running.client().await;

    send_text(&mut client, r#"{"sender":"amy","ticker":"NVDA"}"#).await.unwrap();
    recv_json(&mut client).await;
    running.pipeline.hub.governor().flush().await;

    send_text(&mut client, r#"{"request_old_messages": true}"#).await.unwrap();
    let history = recv_json(&mut client).await;
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["ticker"], "NVDA");
    assert_eq!(history[0]["old_message"], true);

    running.stop().await;
}

#[tokio::test]
async fn test_malformed_frames_keep_the_session_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakeRelayPeer::bind(SECRET).await.unwrap();
    let running = start(dir.path(), &mut peer).await;
    let mut client = running.client().await;

    send_text(&mut client, "this is not json").await.unwrap();
    send_text(&mut client, r#"{"sender":"amy"}"#).await.unwrap();
    send_text(&mut client, "[1").await.unwrap();
    assert_eq!(recv_text(&mut client, WAIT).await.as_deref(), Some("[2"));
    assert_eq!(running.pipeline.hub.session_count(), 1);

    running.stop().await;
}

#[tokio::test]
async fn test_alerts_flow_while_relay_is_down() {
    let dir = tempfile::tempdir().unwrap();
    // Reserve a port, then close it so every dial is refused.
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let settings = settings(dir.path(), closed_port);
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::start(&settings, Arc::new(LogNotifier), cancel.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let app_state = pipeline.app_state(&settings, cancel.clone());
    let server = tokio::spawn(downstream::serve(listener, app_state));

    let mut client = connect_client(&url).await.unwrap();
    send_text(&mut client, r#"{"sender":"amy","ticker":"AMD"}"#).await.unwrap();
    assert_eq!(recv_json(&mut client).await["ticker"], "AMD");
    assert!(!pipeline.relay.is_connected());

    cancel.cancel();
    server.await.unwrap().unwrap();
    pipeline.join().await;
    assert_eq!(JsonStore::new(&settings.messages_path).load().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_shutdown_persists_accepted_alerts_and_refuses_late_ones() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakeRelayPeer::bind(SECRET).await.unwrap();
    let running = start(dir.path(), &mut peer).await;
    let hub = running.pipeline.hub.clone();

    // The client stays connected through the shutdown.
    let mut client = running.client().await;
    send_text(&mut client, r#"{"sender":"amy","ticker":"AMD"}"#).await.unwrap();
    assert_eq!(recv_json(&mut client).await["ticker"], "AMD");

    let settings = running.stop().await;
    assert!(hub.is_closed());
    assert_eq!(hub.session_count(), 0);

    let (late, _outbound) = hub.open_session("late").await;
    assert_eq!(
        hub.handle_frame(&late, r#"{"sender":"amy","ticker":"TSLA"}"#).await,
        FrameOutcome::ShuttingDown
    );
    assert_eq!(hub.governor().pending_counts(), (0, 0));

    let stored = JsonStore::new(&settings.messages_path).load().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].ticker(), "AMD");
}
