#![forbid(unsafe_code)]

//! Consensus: witness selection and the continuity decision engine.

pub mod continuity;
pub mod witness;
