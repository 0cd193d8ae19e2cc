//! Server binaries of the alert relay and the logic they share.

pub mod alert_logic;
