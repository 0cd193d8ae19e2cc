//! # Loggers
//!
//! Operator notifications. Plain logging goes through the `log` facade; this
//! module carries the out-of-band `notify(message, level)` channel.

pub mod notifier;

pub use notifier::{
    trim_message, LogNotifier, Notifier, NotifyLevel, TelegramNotifier, WarningThrottle,
};
