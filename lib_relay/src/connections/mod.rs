//! # Connections
//!
//! Outbound transport to the upstream relay peer.
//!
//! - **`relay_crypto`**: per-day AES-256-CBC session keys and frame sealing.
//! - **`relay_codec`**: the `<END>` delimited byte-stream codec.
//! - **`relay_client`**: the reconnecting client state machine with its
//!   send, receive and heartbeat loops.

/// Per-day session keys and frame encryption.
pub mod relay_crypto;
/// `payload || "<END>"` framing for the raw TCP stream.
pub mod relay_codec;
/// The reconnecting relay client.
pub mod relay_client;

pub use relay_client::{Connector, RelayClient, RelayConfig, RelayState, SendOutcome, TcpConnector};
pub use relay_codec::EndDelimitedCodec;
pub use relay_crypto::{CryptoError, SessionKey};
