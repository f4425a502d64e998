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

//! Prometheus metrics for the consensus engine.

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Events inserted from gossip.
    pub events_inserted_total: IntCounter,
    /// Duplicate events skipped.
    pub events_duplicate_total: IntCounter,
    /// Gossip pulls attempted.
    pub gossip_pulls_total: IntCounter,
    /// Gossip sessions that failed.
    pub gossip_failures_total: IntCounter,
    /// Merge events created locally.
    pub merge_events_created_total: IntCounter,
    /// Blocks committed.
    pub blocks_committed_total: IntCounter,
    /// Current committed block height.
    pub block_height: IntGauge,
    /// Known peers.
    pub peers: IntGauge,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let events_inserted_total = IntCounter::new(
            "confluence_events_inserted_total",
            "Events inserted from gossip",
        )
        .map_err(|_| MetricsError::Prom)?;
        let events_duplicate_total = IntCounter::new(
            "confluence_events_duplicate_total",
            "Duplicate events skipped",
        )
        .map_err(|_| MetricsError::Prom)?;
        let gossip_pulls_total =
            IntCounter::new("confluence_gossip_pulls_total", "Gossip pulls attempted")
                .map_err(|_| MetricsError::Prom)?;
        let gossip_failures_total = IntCounter::new(
            "confluence_gossip_failures_total",
            "Gossip sessions that failed",
        )
        .map_err(|_| MetricsError::Prom)?;
        let merge_events_created_total = IntCounter::new(
            "confluence_merge_events_created_total",
            "Merge events created locally",
        )
        .map_err(|_| MetricsError::Prom)?;
        let blocks_committed_total =
            IntCounter::new("confluence_blocks_committed_total", "Blocks committed")
                .map_err(|_| MetricsError::Prom)?;
        let block_height =
            IntGauge::new("confluence_block_height", "Current committed block height")
                .map_err(|_| MetricsError::Prom)?;
        let peers = IntGauge::new("confluence_peers", "Known peers")
            .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(events_inserted_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(events_duplicate_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(gossip_pulls_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(gossip_failures_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(merge_events_created_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(blocks_committed_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(block_height.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(peers.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            events_inserted_total,
            events_duplicate_total,
            gossip_pulls_total,
            gossip_failures_total,
            merge_events_created_total,
            blocks_committed_total,
            block_height,
            peers,
        })
    }
}
