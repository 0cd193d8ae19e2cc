//! # Core
//!
//! The alert pipeline between the WebSocket edge and disk.
//!
//! - **`record`**: the message record and inbound frame parsing.
//! - **`ignore_filter`**: per-sender ticker suppression.
//! - **`store`**: append-only JSON array files.
//! - **`batch_governor`**: quiet-period batching of store writes.
//! - **`hub`**: session registry, frame handling and fan-out.
//! - **`backup`**: daily dated copies of the stores.

pub mod backup;
pub mod batch_governor;
pub mod hub;
pub mod ignore_filter;
pub mod record;
pub mod store;

pub use backup::{BackupReport, BackupScheduler};
pub use batch_governor::{BatchGovernor, FlushReport};
pub use hub::{BroadcastHub, FrameOutcome, HubConfig, OutboundText, RelaySink, Session};
pub use ignore_filter::{should_ignore, IgnoreList};
pub use record::{ClientFrame, InboundFrame, MessageRecord};
pub use store::{JsonStore, StoreError};
