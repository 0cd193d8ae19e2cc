//! # Message Records
//!
//! The unit of traffic and persistence, plus parsing of inbound WebSocket
//! frames.
//!
//! ## Serialization rule
//!
//! Keys are written in the order `sender`, `name`, `type`, `ticker`, then
//! `target` when present. A record with `shares` ends with `shares`; any
//! other record ends with `timestamp` and `old_message`. A record carrying
//! `shares` therefore never carries `timestamp` or `old_message` on the wire;
//! existing consumers rely on that asymmetry. The timestamp is still kept in
//! memory for logging.

use chrono::Utc;
use chrono_tz::Tz;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default for a missing `sender` or `name`.
pub const UNKNOWN: &str = "Unknown";
/// Default for a missing `type`.
pub const DEFAULT_KIND: &str = "default";
/// Liveness ping sent by clients.
pub const PING: &str = "[1";
/// Reply to [`PING`].
pub const PONG: &str = "[2";

/// # Message Record
///
/// Immutable once built; only the hub builds records from inbound frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageRecord {
    #[serde(default = "unknown")]
    sender: String,
    #[serde(default = "unknown")]
    name: String,
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    ticker: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default, deserialize_with = "scalar_as_string")]
    target: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    shares: Option<String>,
    #[serde(default)]
    old_message: bool,
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

fn default_kind() -> String {
    DEFAULT_KIND.to_string()
}

impl MessageRecord {
    /// Builds a live record from an inbound frame.
    ///
    /// Returns `None` when the frame has no usable ticker.
    pub fn from_frame(frame: &InboundFrame, timestamp: String) -> Option<Self> {
        let ticker = frame.ticker.as_deref()?;
        if ticker.trim().is_empty() {
            return None;
        }

        Some(Self {
            sender: frame.sender.clone().unwrap_or_else(unknown),
            name: frame.name.clone().unwrap_or_else(unknown),
            kind: frame.kind.clone().unwrap_or_else(default_kind),
            ticker: ticker.to_string(),
            timestamp,
            target: frame.target.clone(),
            shares: frame.shares.clone(),
            old_message: false,
        })
    }

    /// A copy tagged as replayed history.
    pub fn as_history(&self) -> Self {
        Self {
            old_message: true,
            ..self.clone()
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `type` field.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn shares(&self) -> Option<&str> {
        self.shares.as_deref()
    }

    pub fn is_old_message(&self) -> bool {
        self.old_message
    }
}

impl Serialize for MessageRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("sender", &self.sender)?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("type", &self.kind)?;
        map.serialize_entry("ticker", &self.ticker)?;
        if let Some(target) = &self.target {
            map.serialize_entry("target", target)?;
        }
        match &self.shares {
            Some(shares) => map.serialize_entry("shares", shares)?,
            None => {
                map.serialize_entry("timestamp", &self.timestamp)?;
                map.serialize_entry("old_message", &self.old_message)?;
            }
        }
        map.end()
    }
}

/// Accepts a JSON string or number (or null) and keeps it as a string.
fn scalar_as_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

/// # Inbound Frame
///
/// The JSON object a WebSocket client sends. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundFrame {
    pub sender: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub ticker: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub shares: Option<String>,
    #[serde(default)]
    pub request_old_messages: bool,
}

/// What an inbound text frame asks for.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    /// The liveness ping.
    Ping,
    /// Replay of the persisted accepted store.
    HistoryRequest,
    /// A ticker alert (possibly without a ticker).
    Alert(InboundFrame),
}

/// Classifies an inbound text frame.
///
/// The ping sentinel is recognised raw or as a JSON string; everything else
/// must be a JSON object.
pub fn parse_frame(text: &str) -> Result<ClientFrame, serde_json::Error> {
    if text.trim() == PING {
        return Ok(ClientFrame::Ping);
    }

    let value: Value = serde_json::from_str(text)?;
    if value.as_str() == Some(PING) {
        return Ok(ClientFrame::Ping);
    }

    let frame: InboundFrame = serde_json::from_value(value)?;
    if frame.request_old_messages {
        Ok(ClientFrame::HistoryRequest)
    } else {
        Ok(ClientFrame::Alert(frame))
    }
}

/// Server-side ingestion time in `tz`, ISO-8601 with microseconds and offset.
pub fn ingest_timestamp(tz: Tz) -> String {
    Utc::now()
        .with_timezone(&tz)
        .format("%Y-%m-%dT%H:%M:%S%.6f%:z")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> InboundFrame {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let record =
            MessageRecord::from_frame(&frame(json!({"ticker": "AAPL"})), "t".into()).unwrap();
        assert_eq!(record.sender(), UNKNOWN);
        assert_eq!(record.name(), UNKNOWN);
        assert_eq!(record.kind(), DEFAULT_KIND);
        assert!(!record.is_old_message());
    }

    #[test]
    fn test_empty_ticker_builds_nothing() {
        assert!(MessageRecord::from_frame(&frame(json!({"sender": "bob"})), "t".into()).is_none());
        assert!(MessageRecord::from_frame(&frame(json!({"ticker": ""})), "t".into()).is_none());
        assert!(MessageRecord::from_frame(&frame(json!({"ticker": "  "})), "t".into()).is_none());
    }

    #[test]
    fn test_live_record_serializes_old_message_false() {
        let record = MessageRecord::from_frame(
            &frame(json!({"sender": "bob", "ticker": "AAPL", "type": "buy", "target": 190})),
            "2024-03-09T10:00:00.000000-06:00".into(),
        )
        .unwrap();
        let text = serde_json::to_string(&record).unwrap();
        let expected = concat!(
            r#"{"sender":"bob","name":"Unknown","type":"buy","ticker":"AAPL","target":"190","#,
            r#""timestamp":"2024-03-09T10:00:00.000000-06:00","old_message":false}"#
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_shares_suppresses_timestamp_and_old_message() {
        let record = MessageRecord::from_frame(
            &frame(json!({"sender": "bob", "ticker": "TSLA", "shares": 150})),
            "2024-03-09T10:00:00.000000-06:00".into(),
        )
        .unwrap();
        assert_eq!(record.timestamp(), "2024-03-09T10:00:00.000000-06:00");

        for value in [
            serde_json::to_value(&record).unwrap(),
            serde_json::to_value(record.as_history()).unwrap(),
        ] {
            assert_eq!(value["shares"], json!("150"));
            assert!(value.get("timestamp").is_none(), "{}", value);
            assert!(value.get("old_message").is_none(), "{}", value);
        }
    }

    #[test]
    fn test_history_copy_round_trips_through_json() {
        let record = MessageRecord::from_frame(
            &frame(json!({"sender": "amy", "name": "Amy", "ticker": "NVDA", "type": "sell"})),
            "t".into(),
        )
        .unwrap();
        let stored = serde_json::to_string(&record).unwrap();
        let reloaded: MessageRecord = serde_json::from_str(&stored).unwrap();
        assert_eq!(reloaded, record);
        assert_eq!(reloaded.as_history(), MessageRecord { old_message: true, ..record });
    }

    #[test]
    fn test_parse_frame_variants() {
        assert!(matches!(parse_frame("[1").unwrap(), ClientFrame::Ping));
        assert!(matches!(parse_frame("\"[1\"").unwrap(), ClientFrame::Ping));
        assert!(matches!(
            parse_frame(r#"{"request_old_messages": true}"#).unwrap(),
            ClientFrame::HistoryRequest
        ));
        match parse_frame(r#"{"sender":"bob","ticker":"AAPL","shares":"10"}"#).unwrap() {
            ClientFrame::Alert(inbound) => {
                assert_eq!(inbound.ticker.as_deref(), Some("AAPL"));
                assert_eq!(inbound.shares.as_deref(), Some("10"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame("[1,2]").is_err());
    }

    #[test]
    fn test_ingest_timestamp_uses_zone_offset() {
        let stamp = ingest_timestamp(chrono_tz::UTC);
        assert!(stamp.ends_with("+00:00"), "{}", stamp);
        assert_eq!(stamp.len(), "2024-03-09T10:00:00.000000+00:00".len());
    }
}
