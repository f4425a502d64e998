#![forbid(unsafe_code)]

//! Key management for the node identity.

pub mod signer;
