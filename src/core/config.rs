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

//! Typed engine and node configuration.
//!
//! The engine knobs are an explicit enumeration; nothing is read from
//! ambient dynamic config objects. Thresholds accept either an absolute
//! count or one of the symbolic forms `"2f"`, `"f"`, `"1"` resolved
//! against the witness failure bound (`3f + 1 = |witnesses|`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Cannot read config file.
    #[error("read config")]
    Read,
    /// Config content is syntactically or semantically invalid.
    #[error("invalid config: {0}")]
    Syntax(String),
}

/// Symbolic merge threshold resolved against the witness failure bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolicThreshold {
    /// `2f` witnesses.
    #[serde(rename = "2f")]
    TwoF,
    /// `f` witnesses.
    #[serde(rename = "f")]
    F,
    /// A single peer.
    #[serde(rename = "1")]
    One,
}

/// Merge threshold: absolute or symbolic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    /// Absolute parent count.
    Count(u32),
    /// Symbolic count, see [`SymbolicThreshold`].
    Symbolic(SymbolicThreshold),
}

impl Threshold {
    /// Resolve against the failure bound `f` where `3f + 1 = |witnesses|`.
    pub fn resolve(self, f: u32) -> u32 {
        match self {
            Threshold::Count(n) => n,
            Threshold::Symbolic(SymbolicThreshold::TwoF) => 2 * f,
            Threshold::Symbolic(SymbolicThreshold::F) => f,
            Threshold::Symbolic(SymbolicThreshold::One) => 1,
        }
    }
}

/// Engine configuration for one ledger node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum failure backoff in ms.
    pub max_failure_ms: u64,
    /// Per-failure backoff step in ms.
    pub min_failure_ms: u64,
    /// Grace period before failure time starts costing reputation, ms.
    pub max_failure_grace_period_ms: u64,
    /// Maximum idle backoff in ms.
    pub max_idle_ms: u64,
    /// Per-point idle backoff step in ms.
    pub min_idle_ms: u64,
    /// Idle grace period over which a peer loses its full reputation, ms.
    pub max_idle_grace_period_ms: u64,
    /// Peers pulled per worker cycle.
    pub gossip_fanout: usize,
    /// Peer table capacity (trusted + untrusted).
    pub peer_capacity: usize,
    /// Witness non-tree parents a merge tries to reach.
    pub witness_target_threshold: Threshold,
    /// Witness non-tree parents a merge requires.
    pub witness_minimum_threshold: Threshold,
    /// Non-witness non-tree parents a merge requires.
    pub peer_minimum_threshold: Threshold,
    /// Probability of folding pending local operations into a merge.
    pub operation_ready_chance: f64,
    /// Maximum parents in one merge event.
    pub max_merge_parents: usize,
    /// Per-pull gossip timeout in ms.
    pub pull_timeout_ms: u64,
    /// Maximum events in one pull response.
    pub gossip_batch_limit: usize,
    /// Bound on recursive missing-parent fetches per pull.
    pub max_missing_depth: usize,
    /// Capacity of the local operation intake queue.
    pub operation_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_failure_ms: 300_000,
            min_failure_ms: 5_000,
            max_failure_grace_period_ms: 86_400_000,
            max_idle_ms: 600_000,
            min_idle_ms: 10_000,
            max_idle_grace_period_ms: 1_800_000,
            gossip_fanout: 1,
            peer_capacity: 110,
            witness_target_threshold: Threshold::Symbolic(SymbolicThreshold::TwoF),
            witness_minimum_threshold: Threshold::Symbolic(SymbolicThreshold::F),
            // All-witness deployments have no non-witness peers to merge.
            peer_minimum_threshold: Threshold::Count(0),
            operation_ready_chance: 1.0,
            max_merge_parents: 64,
            pull_timeout_ms: 30_000,
            gossip_batch_limit: 512,
            max_missing_depth: 8,
            operation_queue_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    /// Validate value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.operation_ready_chance) {
            return Err(ConfigError::Syntax(
                "operation_ready_chance must be in [0, 1]".into(),
            ));
        }
        if self.gossip_fanout == 0 {
            return Err(ConfigError::Syntax("gossip_fanout must be positive".into()));
        }
        if self.max_merge_parents < 2 {
            return Err(ConfigError::Syntax("max_merge_parents must be >= 2".into()));
        }
        Ok(())
    }
}

/// Node settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Human-readable name.
    pub name: String,
    /// Data directory (db + keys).
    pub data_dir: String,
}

/// Ledger settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Ledger id (multibase hash of the configuration event). Empty for a
    /// node that creates a new ledger.
    pub ledger_id: Option<String>,
    /// Ledger name used when creating a new ledger.
    pub ledger_name: String,
    /// Witness pool public keys (hex, 32 bytes each) used when creating a
    /// new ledger. The local node is always included.
    pub witness_pool_hex: Vec<String>,
}

/// Node configuration root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node settings.
    pub node: NodeSettings,
    /// Ledger settings.
    #[serde(default)]
    pub ledger: LedgerSettings,
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl NodeConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|_| ConfigError::Read)?;
        let cfg: NodeConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::Syntax(e.to_string()))?;
        cfg.engine.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_resolution() {
        assert_eq!(Threshold::Count(3).resolve(5), 3);
        assert_eq!(Threshold::Symbolic(SymbolicThreshold::TwoF).resolve(2), 4);
        assert_eq!(Threshold::Symbolic(SymbolicThreshold::F).resolve(2), 2);
        assert_eq!(Threshold::Symbolic(SymbolicThreshold::One).resolve(2), 1);
    }

    #[test]
    fn thresholds_parse_from_toml() {
        #[derive(Deserialize)]
        struct T {
            a: Threshold,
            b: Threshold,
            c: Threshold,
        }
        let t: T = toml::from_str("a = \"2f\"\nb = 4\nc = \"1\"\n").unwrap();
        assert_eq!(t.a, Threshold::Symbolic(SymbolicThreshold::TwoF));
        assert_eq!(t.b, Threshold::Count(4));
        assert_eq!(t.c, Threshold::Symbolic(SymbolicThreshold::One));
    }

    #[test]
    fn engine_defaults_validate() {
        EngineConfig::default().validate().unwrap();

        let mut bad = EngineConfig::default();
        bad.operation_ready_chance = 1.5;
        assert!(bad.validate().is_err());
    }
}
