use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "server_alerts.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting `{0}`")]
    Missing(&'static str),

    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Parser, Deserialize, Serialize, Clone, Default)]
#[clap(about = "Ticker alert relay server", version)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[clap(long, env = "ALERTS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "WS_HOST", help = "Interface the WebSocket endpoint binds to.")]
    pub ws_host: Option<String>,

    #[clap(long, env = "WS_PORT", help = "Port the WebSocket endpoint listens on.")]
    pub ws_port: Option<u16>,

    #[clap(long, env = "RELAY_HOST", help = "Upstream relay peer host.")]
    pub relay_host: Option<String>,

    #[clap(long, env = "RELAY_PORT", help = "Upstream relay peer port.")]
    pub relay_port: Option<u16>,

    #[clap(long, env = "RELAY_SECRET", help = "Shared secret for the per-day relay key.")]
    pub relay_secret: Option<String>,

    #[clap(long, env = "RELAY_USERNAME", help = "Username announced to the relay peer.")]
    pub relay_username: Option<String>,

    #[clap(long, env = "ALERTS_SAVE_DELAY_SECONDS", help = "Quiet period before buffered records are written.")]
    pub save_delay_seconds: Option<u64>,

    #[clap(long, env = "ALERTS_HEARTBEAT_INTERVAL_SECONDS", help = "Interval between relay heartbeats.")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "ALERTS_RECONNECT_DELAY_SECONDS", help = "Wait between relay reconnect attempts.")]
    pub reconnect_delay_seconds: Option<u64>,

    #[clap(long, env = "ALERTS_CONNECT_TIMEOUT_SECONDS", help = "Timeout for one relay connect attempt.")]
    pub connect_timeout_seconds: Option<u64>,

    #[clap(long, env = "ALERTS_FANOUT_SEND_TIMEOUT_MS", help = "Per-client WebSocket write timeout in milliseconds.")]
    pub fanout_send_timeout_ms: Option<u64>,

    #[clap(long, env = "ALERTS_SESSION_QUEUE_CAPACITY", help = "Outbound frames buffered per WebSocket client.")]
    pub session_queue_capacity: Option<usize>,

    #[clap(long, env = "ALERTS_DATA_DIR", help = "Directory holding the JSON stores.")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, env = "ALERTS_MESSAGES_FILE", help = "Accepted records store, relative to the data directory.")]
    pub messages_file: Option<String>,

    #[clap(long, env = "ALERTS_IGNORED_FILE", help = "Ignored records store, relative to the data directory.")]
    pub ignored_file: Option<String>,

    #[clap(long, env = "ALERTS_IGNORE_LIST_FILE", help = "Ignore list, relative to the data directory.")]
    pub ignore_list_file: Option<String>,

    #[clap(long, env = "ALERTS_BACKUP_DIR", help = "Root directory for dated store copies.")]
    pub backup_dir: Option<PathBuf>,

    #[clap(long, env = "ALERTS_BACKUP_CRON", help = "Cron expression (UTC, with seconds) for the daily backup.")]
    pub backup_cron: Option<String>,

    #[clap(long, env = "ALERTS_TIMEZONE", help = "IANA zone for record timestamps.")]
    pub timezone: Option<String>,

    #[clap(long, env = "ERROR_NOTIFY_BOT_TOKEN", help = "Telegram bot token for operator notifications.")]
    pub telegram_bot_token: Option<String>,

    #[clap(long, env = "ERROR_NOTIFY_GRP", help = "Telegram chat id for operator notifications.")]
    pub telegram_chat_id: Option<String>,

    #[clap(long, env = "LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ALERTS_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            ws_host: other.ws_host.or(self.ws_host),
            ws_port: other.ws_port.or(self.ws_port),
            relay_host: other.relay_host.or(self.relay_host),
            relay_port: other.relay_port.or(self.relay_port),
            relay_secret: other.relay_secret.or(self.relay_secret),
            relay_username: other.relay_username.or(self.relay_username),
            save_delay_seconds: other.save_delay_seconds.or(self.save_delay_seconds),
            heartbeat_interval_seconds: other
                .heartbeat_interval_seconds
                .or(self.heartbeat_interval_seconds),
            reconnect_delay_seconds: other.reconnect_delay_seconds.or(self.reconnect_delay_seconds),
            connect_timeout_seconds: other.connect_timeout_seconds.or(self.connect_timeout_seconds),
            fanout_send_timeout_ms: other.fanout_send_timeout_ms.or(self.fanout_send_timeout_ms),
            session_queue_capacity: other.session_queue_capacity.or(self.session_queue_capacity),
            data_dir: other.data_dir.or(self.data_dir),
            messages_file: other.messages_file.or(self.messages_file),
            ignored_file: other.ignored_file.or(self.ignored_file),
            ignore_list_file: other.ignore_list_file.or(self.ignore_list_file),
            backup_dir: other.backup_dir.or(self.backup_dir),
            backup_cron: other.backup_cron.or(self.backup_cron),
            timezone: other.timezone.or(self.timezone),
            telegram_bot_token: other.telegram_bot_token.or(self.telegram_bot_token),
            telegram_chat_id: other.telegram_chat_id.or(self.telegram_chat_id),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    pub fn defaults() -> Config {
        Config {
            ws_host: Some("0.0.0.0".to_string()),
            ws_port: Some(8080),
            save_delay_seconds: Some(5),
            heartbeat_interval_seconds: Some(30),
            reconnect_delay_seconds: Some(5),
            connect_timeout_seconds: Some(10),
            fanout_send_timeout_ms: Some(2000),
            session_queue_capacity: Some(256),
            data_dir: Some(PathBuf::from("data")),
            messages_file: Some("websocket_messages.json".to_string()),
            ignored_file: Some("ignored_messages.json".to_string()),
            ignore_list_file: Some("ignore_list.json".to_string()),
            backup_dir: Some(PathBuf::from("backup")),
            backup_cron: Some("0 5 0 * * *".to_string()),
            timezone: Some("America/Chicago".to_string()),
            log_dir: Some(PathBuf::from("logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

/// Validated settings the server runs with.
#[derive(Clone)]
pub struct Settings {
    pub ws_host: String,
    pub ws_port: u16,
    pub relay_host: String,
    pub relay_port: u16,
    pub relay_secret: String,
    pub relay_username: String,
    pub save_delay: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub fanout_send_timeout: Duration,
    pub session_queue_capacity: usize,
    pub messages_path: PathBuf,
    pub ignored_path: PathBuf,
    pub ignore_list_path: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_cron: String,
    pub timezone: Tz,
    pub telegram: Option<TelegramSettings>,
    pub log_dir: PathBuf,
    pub log_level: String,
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::Missing(field))
}

fn non_zero(value: Option<u64>, field: &'static str) -> Result<u64, ConfigError> {
    match required(value, field)? {
        0 => Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        }),
        n => Ok(n),
    }
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    let value = required(value, field)?;
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(field));
    }
    Ok(value)
}

impl TryFrom<Config> for Settings {
    type Error = ConfigError;

    fn try_from(config: Config) -> Result<Self, ConfigError> {
        let timezone_name = required(config.timezone, "timezone")?;
        let timezone: Tz = timezone_name.parse().map_err(|_| ConfigError::Invalid {
            field: "timezone",
            reason: format!("unknown zone {:?}", timezone_name),
        })?;

        let session_queue_capacity =
            required(config.session_queue_capacity, "sessionQueueCapacity")?;
        if session_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "sessionQueueCapacity",
                reason: "must be greater than zero".to_string(),
            });
        }

        let data_dir = required(config.data_dir, "dataDir")?;
        let telegram = match (config.telegram_bot_token, config.telegram_chat_id) {
            (Some(bot_token), Some(chat_id)) if !bot_token.is_empty() && !chat_id.is_empty() => {
                Some(TelegramSettings { bot_token, chat_id })
            }
            _ => None,
        };

        Ok(Settings {
            ws_host: non_empty(config.ws_host, "wsHost")?,
            ws_port: required(config.ws_port, "wsPort")?,
            relay_host: non_empty(config.relay_host, "relayHost")?,
            relay_port: required(config.relay_port, "relayPort")?,
            relay_secret: non_empty(config.relay_secret, "relaySecret")?,
            relay_username: non_empty(config.relay_username, "relayUsername")?,
            save_delay: Duration::from_secs(non_zero(
                config.save_delay_seconds,
                "saveDelaySeconds",
            )?),
            heartbeat_interval: Duration::from_secs(non_zero(
                config.heartbeat_interval_seconds,
                "heartbeatIntervalSeconds",
            )?),
            reconnect_delay: Duration::from_secs(non_zero(
                config.reconnect_delay_seconds,
                "reconnectDelaySeconds",
            )?),
            connect_timeout: Duration::from_secs(non_zero(
                config.connect_timeout_seconds,
                "connectTimeoutSeconds",
            )?),
            fanout_send_timeout: Duration::from_millis(non_zero(
                config.fanout_send_timeout_ms,
                "fanoutSendTimeoutMs",
            )?),
            session_queue_capacity,
            messages_path: data_dir.join(required(config.messages_file, "messagesFile")?),
            ignored_path: data_dir.join(required(config.ignored_file, "ignoredFile")?),
            ignore_list_path: data_dir.join(required(config.ignore_list_file, "ignoreListFile")?),
            backup_dir: required(config.backup_dir, "backupDir")?,
            backup_cron: non_empty(config.backup_cron, "backupCron")?,
            timezone,
            telegram,
            log_dir: required(config.log_dir, "logDir")?,
            log_level: required(config.log_level, "logLevel")?,
        })
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("ws", &format_args!("{}:{}", self.ws_host, self.ws_port))
            .field(
                "relay",
                &format_args!("{}@{}:{}", self.relay_username, self.relay_host, self.relay_port),
            )
            .field("save_delay", &self.save_delay)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("messages_path", &self.messages_path)
            .field("ignored_path", &self.ignored_path)
            .field("ignore_list_path", &self.ignore_list_path)
            .field("backup_dir", &self.backup_dir)
            .field("backup_cron", &self.backup_cron)
            .field("timezone", &self.timezone)
            .field("telegram", &self.telegram.is_some())
            .finish_non_exhaustive()
    }
}

/// Resolves settings from defaults, then the JSON config file, then
/// `cli` (which already carries environment values).
pub fn resolve(cli: Config) -> Result<Settings, ConfigError> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        let config_str =
            fs::read_to_string(&config_file_path).map_err(|source| ConfigError::Read {
                path: config_file_path.clone(),
                source,
            })?;
        let file_config: Config =
            serde_json::from_str(&config_str).map_err(|source| ConfigError::Parse {
                path: config_file_path.clone(),
                source,
            })?;
        current_config = current_config.merge(file_config);
    }

    Settings::try_from(current_config.merge(cli))
}

pub fn load_config() -> Result<Settings, ConfigError> {
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_cli(config_path: PathBuf) -> Config {
        Config {
            config_path: Some(config_path),
            relay_host: Some("relay.local".to_string()),
            relay_port: Some(9000),
            relay_secret: Some("s3cret".to_string()),
            relay_username: Some("alerts".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_apply_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = resolve(relay_cli(dir.path().join("absent.conf"))).unwrap();

        assert_eq!(settings.ws_port, 8080);
        assert_eq!(settings.save_delay, Duration::from_secs(5));
        assert_eq!(settings.fanout_send_timeout, Duration::from_millis(2000));
        assert_eq!(settings.messages_path, PathBuf::from("data/websocket_messages.json"));
        assert_eq!(settings.timezone, chrono_tz::America::Chicago);
        assert!(settings.telegram.is_none());
    }

    #[test]
    fn test_file_sits_between_defaults_and_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_alerts.conf");
        fs::write(
            &path,
            concat!(
                r#"{"wsPort": 9100, "saveDelaySeconds": 2, "#,
                r#""relayHost": "from-file", "dataDir": "/srv/alerts"}"#
            ),
        )
        .unwrap();

        let settings = resolve(relay_cli(path)).unwrap();
        assert_eq!(settings.ws_port, 9100);
        assert_eq!(settings.save_delay, Duration::from_secs(2));
        assert_eq!(settings.relay_host, "relay.local");
        assert_eq!(settings.ignore_list_path, PathBuf::from("/srv/alerts/ignore_list.json"));
    }

    #[test]
    fn test_missing_relay_secret_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = relay_cli(dir.path().join("absent.conf"));
        cli.relay_secret = None;
        assert!(matches!(resolve(cli), Err(ConfigError::Missing("relaySecret"))));
    }

    #[test]
    fn test_zero_durations_and_bad_zone_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let mut cli = relay_cli(dir.path().join("absent.conf"));
        cli.save_delay_seconds = Some(0);
        assert!(matches!(
            resolve(cli),
            Err(ConfigError::Invalid { field: "saveDelaySeconds", .. })
        ));

        let mut cli = relay_cli(dir.path().join("absent.conf"));
        cli.timezone = Some("Mars/Olympus".to_string());
        assert!(matches!(resolve(cli), Err(ConfigError::Invalid { field: "timezone", .. })));
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_alerts.conf");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(resolve(relay_cli(path)), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_telegram_needs_both_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = relay_cli(dir.path().join("absent.conf"));
        cli.telegram_bot_token = Some("token".to_string());
        assert!(resolve(cli.clone()).unwrap().telegram.is_none());

        cli.telegram_chat_id = Some("-100".to_string());
        let settings = resolve(cli).unwrap();
        assert_eq!(settings.telegram.unwrap().chat_id, "-100");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let settings = resolve(relay_cli(dir.path().join("absent.conf"))).unwrap();
        assert!(!format!("{:?}", settings).contains("s3cret"));
    }
}
