//! # Operator Notifier
//!
//! Fire-and-forget alerts to an operator chat. `notify` never blocks and never
//! fails: delivery happens on a spawned task and errors are only logged.
//!
//! WARNING-level messages are not delivered one by one. Each distinct message
//! is counted, and a single "repeated" alert goes out when it reaches
//! [`WARNING_THRESHOLD`] occurrences inside [`WARNING_WINDOW`].
//!
//! A `429 Too Many Requests` answer is retried after the `retry_after`
//! seconds the Bot API asks for plus [`RETRY_PADDING`], at most
//! [`MAX_RATE_LIMIT_RETRIES`] times.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const WARNING_THRESHOLD: u32 = 9;
pub const WARNING_WINDOW: Duration = Duration::from_secs(300);
pub const MAX_MESSAGE_CHARS: usize = 300;
pub const RETRY_PADDING: Duration = Duration::from_secs(5);
pub const MAX_RATE_LIMIT_RETRIES: u32 = 3;
/// Wait used when a 429 answer carries no `retry_after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl NotifyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyLevel::Debug => "DEBUG",
            NotifyLevel::Info => "INFO",
            NotifyLevel::Warning => "WARNING",
            NotifyLevel::Error => "ERROR",
            NotifyLevel::Critical => "CRITICAL",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            NotifyLevel::Debug => "🔍",
            NotifyLevel::Info | NotifyLevel::Warning => "ℹ️",
            NotifyLevel::Error => "❌",
            NotifyLevel::Critical => "🔥",
        }
    }
}

impl fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `notify(message, level)` capability.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, level: NotifyLevel);
}

/// Writes notifications to the log only. Used when no chat is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str, level: NotifyLevel) {
        let message = trim_message(message);
        match level {
            NotifyLevel::Debug => log::debug!("[notify] {}", message),
            NotifyLevel::Info => log::info!("[notify] {}", message),
            NotifyLevel::Warning => log::warn!("[notify] {}", message),
            NotifyLevel::Error | NotifyLevel::Critical => {
                log::error!("[notify] {} {}", level, message)
            }
        }
    }
}

/// Cuts a multi-line message to its first line plus `..`, or a long one to
/// [`MAX_MESSAGE_CHARS`] plus `...`.
pub fn trim_message(message: &str) -> String {
    if let Some((first, _)) = message.split_once('\n') {
        return format!("{}..", first);
    }

    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Debug)]
struct ThrottleState {
    counts: HashMap<String, u32>,
    window_start: Instant,
}

/// Counts repeated warnings and reports when one reaches the threshold.
#[derive(Debug)]
pub struct WarningThrottle {
    threshold: u32,
    window: Duration,
    state: Mutex<ThrottleState>,
}

impl WarningThrottle {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            state: Mutex::new(ThrottleState {
                counts: HashMap::new(),
                window_start: Instant::now(),
            }),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Counts one occurrence of `message`. Returns `true` on the occurrence
    /// that reaches the threshold, after which the count starts over.
    pub fn record(&self, message: &str) -> bool {
        let mut state = self.state.lock().expect("Throttle lock poisoned");

        if state.window_start.elapsed() >= self.window {
            state.counts.clear();
            state.window_start = Instant::now();
        }

        let count = state.counts.entry(message.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            *count = 0;
            return true;
        }
        false
    }
}

impl Default for WarningThrottle {
    fn default() -> Self {
        Self::new(WARNING_THRESHOLD, WARNING_WINDOW)
    }
}

/// # Telegram Notifier
///
/// Sends HTML formatted messages through the Bot API `sendMessage` call.
pub struct TelegramNotifier {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
    app_name: String,
    timezone: Tz,
    api_base: String,
    throttle: WarningThrottle,
    retry_padding: Duration,
}

impl TelegramNotifier {
    pub fn new(
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        app_name: impl Into<String>,
        timezone: Tz,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            app_name: app_name.into(),
            timezone,
            api_base: TELEGRAM_API_BASE.to_string(),
            throttle: WarningThrottle::default(),
            retry_padding: RETRY_PADDING,
        }
    }

    /// Points the notifier at another Bot API host.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_throttle(mut self, throttle: WarningThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    /// Extra wait added to `retry_after` on a rate-limited send.
    pub fn with_retry_padding(mut self, padding: Duration) -> Self {
        self.retry_padding = padding;
        self
    }

    /// Builds the chat text, or `None` when the message is held back by the
    /// warning throttle.
    pub fn compose(&self, message: &str, level: NotifyLevel) -> Option<String> {
        let message = escape_html(&trim_message(message));
        let emoji = level.emoji();
        let time = Utc::now()
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d %H:%M:%S %Z");

        if level == NotifyLevel::Warning {
            if !self.throttle.record(&message) {
                return None;
            }
            return Some(format!(
                "{emoji} <b>{app} (Repeated) -  {level}</b> {emoji}\n\n\
                 <b>Time:</b> {time}\n\
                 <b>Message (repeated {n} times):</b> {message}\n",
                app = self.app_name,
                n = self.throttle.threshold(),
            ));
        }

        Some(format!(
            "{emoji} <b>{app} -  {level}</b> {emoji}\n\n\
             <b>Time:</b> {time}\n\
             <b>Message:</b> {message}\n",
            app = self.app_name,
        ))
    }

    /// Posts `text` to the chat, retrying rate-limited sends. Errors are
    /// logged.
    pub async fn deliver(&self, text: String) {
        self.delivery().send(text).await;
    }

    fn delivery(&self) -> Delivery {
        Delivery {
            client: self.client.clone(),
            url: format!("{}/bot{}/sendMessage", self.api_base, self.bot_token),
            chat_id: self.chat_id.clone(),
            retry_padding: self.retry_padding,
        }
    }
}

impl fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("chat_id", &self.chat_id)
            .field("app_name", &self.app_name)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, message: &str, level: NotifyLevel) {
        let Some(text) = self.compose(message, level) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.delivery().send(text));
            }
            Err(_) => log::warn!("No async runtime; dropped {} notification", level),
        }
    }
}

/// One `sendMessage` call, detached from the notifier.
struct Delivery {
    client: reqwest::Client,
    url: String,
    chat_id: String,
    retry_padding: Duration,
}

impl Delivery {
    async fn send(self, text: String) {
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        let mut retries = 0;
        loop {
            match self.client.post(&self.url).json(&payload).send().await {
                Ok(res) if res.status().is_success() => {
                    log::debug!("Notification delivered to chat {}", self.chat_id);
                    return;
                }
                Ok(res) if res.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    if retries >= MAX_RATE_LIMIT_RETRIES {
                        log::error!(
                            "Telegram rate limit hit {} times; notification dropped",
                            retries + 1
                        );
                        return;
                    }
                    retries += 1;
                    let retry_after = Duration::from_secs(retry_after_secs(res).await);
                    let wait = retry_after + self.retry_padding;
                    log::warn!("Telegram rate limit hit; retry {} in {:?}", retries, wait);
                    tokio::time::sleep(wait).await;
                }
                Ok(res) => {
                    log::error!("Failed to send Telegram message. Status: {}", res.status());
                    return;
                }
                Err(e) => {
                    log::error!("Network error sending Telegram message: {}", e);
                    return;
                }
            }
        }
    }
}

/// `parameters.retry_after` from a 429 body.
async fn retry_after_secs(res: reqwest::Response) -> u64 {
    res.json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body["parameters"]["retry_after"].as_u64())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};

    #[test]
    fn test_trim_message() {
        assert_eq!(trim_message("short"), "short");
        assert_eq!(trim_message("first\nsecond"), "first..");

        let long = "x".repeat(310);
        let trimmed = trim_message(&long);
        assert_eq!(trimmed.len(), 303);
        assert!(trimmed.ends_with("..."));

        assert_eq!(trim_message(&"y".repeat(300)), "y".repeat(300));
    }

    #[test]
    fn test_throttle_fires_on_ninth_and_resets() {
        let throttle = WarningThrottle::default();
        for _ in 0..8 {
            assert!(!throttle.record("disk slow"));
        }
        assert!(throttle.record("disk slow"));
        assert!(!throttle.record("disk slow"));
        assert!(!throttle.record("other"));
    }

    #[test]
    fn test_throttle_window_expiry_clears_counts() {
        let throttle = WarningThrottle::new(2, Duration::ZERO);
        assert!(!throttle.record("a"));
        assert!(!throttle.record("a"));
    }

    #[test]
    fn test_compose_formats_and_escapes() {
        let notifier =
            TelegramNotifier::new("token", "42", "server_alerts", chrono_tz::America::Chicago);
        let text = notifier.compose("AAPL <buy> alert", NotifyLevel::Error).unwrap();
        assert!(text.starts_with("❌ <b>server_alerts -  ERROR</b> ❌"), "{}", text);
        assert!(text.contains("<b>Message:</b> AAPL &lt;buy&gt; alert"), "{}", text);
    }

    #[test]
    fn test_compose_holds_back_warnings() {
        let notifier = TelegramNotifier::new("token", "42", "server_alerts", chrono_tz::UTC)
            .with_throttle(WarningThrottle::new(3, WARNING_WINDOW));
        assert!(notifier.compose("slow", NotifyLevel::Warning).is_none());
        assert!(notifier.compose("slow", NotifyLevel::Warning).is_none());
        let text = notifier.compose("slow", NotifyLevel::Warning).unwrap();
        assert!(text.contains("(Repeated)"));
        assert!(text.contains("repeated 3 times"));
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    /// Answers one request per entry of `responses`, in order, and returns
    /// the raw requests.
    fn mock_bot_api(responses: Vec<String>) -> (SocketAddr, std::thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = stream.read(&mut buf).unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let headers_done = request.windows(4).any(|w| w == b"\r\n\r\n");
                    if n == 0 || (headers_done && request.ends_with(b"}")) {
                        break;
                    }
                }
                stream.write_all(response.as_bytes()).unwrap();
                requests.push(String::from_utf8_lossy(&request).to_string());
            }
            requests
        });

        (addr, server)
    }

    #[tokio::test]
    async fn test_deliver_posts_send_message() {
        let (addr, server) = mock_bot_api(vec![http_response("200 OK", r#"{"ok":true}"#)]);

        let notifier = TelegramNotifier::new("abc", "42", "server_alerts", chrono_tz::UTC)
            .with_api_base(format!("http://{}", addr));
        notifier.deliver("hello".to_string()).await;

        let requests = server.join().unwrap();
        let request = &requests[0];
        assert!(request.starts_with("POST /botabc/sendMessage"), "{}", request);
        assert!(request.contains("\"chat_id\":\"42\""));
        assert!(request.contains("\"text\":\"hello\""));
    }

    #[tokio::test]
    async fn test_rate_limited_send_is_retried_after_retry_after() {
        let limited = r#"{"ok":false,"error_code":429,"parameters":{"retry_after":0}}"#;
        let (addr, server) = mock_bot_api(vec![
            http_response("429 Too Many Requests", limited),
            http_response("200 OK", r#"{"ok":true}"#),
        ]);

        let notifier = TelegramNotifier::new("abc", "42", "server_alerts", chrono_tz::UTC)
            .with_api_base(format!("http://{}", addr))
            .with_retry_padding(Duration::ZERO);
        tokio::time::timeout(Duration::from_secs(5), notifier.deliver("again".to_string()))
            .await
            .expect("retry did not finish");

        let requests = server.join().unwrap();
        assert_eq!(requests.len(), 2);
        for request in &requests {
            assert!(request.starts_with("POST /botabc/sendMessage"), "{}", request);
            assert!(request.contains("\"text\":\"again\""), "{}", request);
        }
    }
}
