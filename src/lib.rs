// Copyright (c) 2026 Confluence
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Confluence - a Byzantine-fault-tolerant ledger consensus engine.
//!
//! Each node maintains an append-only DAG of signed events, gossips it
//! with peers, periodically folds received heads into a locally-signed
//! merge event, and runs a deterministic continuity algorithm over the
//! merged DAG to extract totally-ordered blocks.
//!
//! This crate provides:
//! - The content-addressed event DAG with its validation rules
//! - A peer registry with reputation, backoff, and idle accounting
//! - The pull-based gossip protocol over a pluggable transport
//! - The merge scheduler and the continuity consensus engine
//! - The per-ledger worker loop tying the cycle together
//! - Monitoring via Prometheus metrics and structured logging

/// Core protocol (events, store, merge, consensus, worker, node).
pub mod core;
/// Observability (metrics).
pub mod monitoring;
/// Networking (gossip protocol, transport, peer registry).
pub mod networking;
