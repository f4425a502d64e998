#![forbid(unsafe_code)]

//! Networking: gossip protocol, transport seam, and peer registry.

pub mod gossip;
pub mod peer_registry;
pub mod transport;
