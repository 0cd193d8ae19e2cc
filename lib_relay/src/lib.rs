//! # lib_relay
//!
//! The delivery pipeline of the ticker alert relay. Alerts arrive from
//! WebSocket clients, are filtered per sender, fanned out to every live
//! session, forwarded to an encrypted TCP upstream and persisted in batches.
//!
//! Modules are gated by folder:
//!
//! - **`core`**: message records, ignore filter, JSON stores, the batch
//!   governor, the broadcast hub and the daily backup job.
//! - **`connections`**: the self-healing, encrypted relay client.
//! - **`loggers`**: the fire-and-forget notification capability.

#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "loggers")]
pub mod loggers;
