use clap::Parser;
use project_tests::{connect_client, recv_text, send_text};
use serde_json::json;
use std::time::Duration;

/// Exercise a running server_alerts instance: ping, optionally publish one
/// alert, then print the history and anything broadcast afterwards.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// WebSocket URL of the server
    #[clap(short, long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    /// Sender name for the published alert
    #[clap(short, long, default_value = "smoke-test")]
    sender: String,

    /// Ticker to publish; nothing is published when absent
    #[clap(short, long)]
    ticker: Option<String>,

    /// Seconds to keep listening for broadcasts
    #[clap(short, long, default_value_t = 10)]
    listen_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("Connecting to {}...", args.url);
    let mut socket = connect_client(&args.url).await?;

    send_text(&mut socket, "[1").await?;
    match recv_text(&mut socket, Duration::from_secs(5)).await {
        Some(reply) => println!("Ping reply: {}", reply),
        None => println!("No ping reply within 5s"),
    }

    send_text(&mut socket, &json!({ "request_old_messages": true }).to_string()).await?;
    if let Some(history) = recv_text(&mut socket, Duration::from_secs(5)).await {
        let count = serde_json::from_str::<serde_json::Value>(&history)
            .ok()
            .and_then(|v| v.as_array().map(|a| a.len()))
            .unwrap_or(0);
        println!("History: {} record(s)", count);
    }

    if let Some(ticker) = &args.ticker {
        let alert = json!({
            "sender": args.sender,
            "name": args.sender,
            "ticker": ticker,
            "type": "test",
        });
        send_text(&mut socket, &alert.to_string()).await?;
        println!("Published {}", alert);
    }

    let listen = Duration::from_secs(args.listen_seconds);
    let deadline = tokio::time::Instant::now() + listen;
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        let Some(frame) = recv_text(&mut socket, left).await else {
            break;
        };
        println!("<- {}", frame);
    }

    println!("Done.");
    Ok(())
}
