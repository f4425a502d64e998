#![forbid(unsafe_code)]

//! Observability: Prometheus metrics.

pub mod metrics;
