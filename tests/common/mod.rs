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
#![allow(dead_code)]

//! Multi-node test harness over the in-process loopback network.

use confluence::core::config::EngineConfig;
use confluence::core::node::LedgerNode;
use confluence::core::security::signer::NodeSigner;
use confluence::core::types::CreatorId;
use confluence::core::validator::AcceptAllValidator;
use confluence::core::worker::Worker;
use confluence::monitoring::metrics::Metrics;
use confluence::networking::transport::LoopbackNetwork;
use std::sync::Arc;

/// One simulated node: its public handle, its worker, and its data dir.
pub struct TestNode {
    pub id: CreatorId,
    pub node: LedgerNode,
    pub worker: Worker,
    _dir: tempfile::TempDir,
}

/// A set of in-process nodes sharing one ledger and one loopback network.
pub struct TestNet {
    pub network: Arc<LoopbackNetwork>,
    pub nodes: Vec<TestNode>,
    pub ledger_id: String,
    cfg: EngineConfig,
    metrics: Arc<Metrics>,
}

/// Engine config tuned for fast tests: negligible backoffs, full fanout.
pub fn test_cfg(fanout: usize) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.gossip_fanout = fanout.max(1);
    cfg.min_failure_ms = 1;
    cfg.max_failure_ms = 5;
    cfg.min_idle_ms = 1;
    cfg.max_idle_ms = 5;
    cfg
}

impl TestNet {
    /// Build `n` nodes. Node 0 creates the ledger with every node in the
    /// witness pool; the rest join by ledger id. All nodes know each other.
    pub fn new(n: usize, cfg: EngineConfig) -> Self {
        assert!(n >= 1);
        let network = LoopbackNetwork::new();
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let validator = Arc::new(AcceptAllValidator);

        let dirs: Vec<tempfile::TempDir> =
            (0..n).map(|_| tempfile::tempdir().expect("tempdir")).collect();
        let ids: Vec<CreatorId> = dirs
            .iter()
            .map(|d| {
                NodeSigner::load_or_create(d.path())
                    .expect("signer")
                    .creator_id()
            })
            .collect();

        let mut nodes: Vec<TestNode> = Vec::with_capacity(n);
        let mut ledger_id = String::new();
        for (i, dir) in dirs.into_iter().enumerate() {
            let (node, worker) = if i == 0 {
                LedgerNode::create(
                    dir.path(),
                    "testnet",
                    ids.clone(),
                    cfg.clone(),
                    network.clone(),
                    validator.clone(),
                    metrics.clone(),
                )
                .expect("create")
            } else {
                LedgerNode::join(
                    dir.path(),
                    &ledger_id,
                    cfg.clone(),
                    network.clone(),
                    validator.clone(),
                    metrics.clone(),
                )
                .expect("join")
            };
            if i == 0 {
                ledger_id = node.ledger_id().to_string();
            }
            network.register(node.creator().clone(), node.gossip_server(), node.wake_handle());
            nodes.push(TestNode {
                id: ids[i].clone(),
                node,
                worker,
                _dir: dir,
            });
        }

        let mut net = Self {
            network,
            nodes,
            ledger_id,
            cfg,
            metrics,
        };
        net.mesh_peers();
        net
    }

    /// Every node registers every other node as a recommended peer.
    fn mesh_peers(&mut self) {
        let ids: Vec<CreatorId> = self.nodes.iter().map(|n| n.id.clone()).collect();
        for node in &mut self.nodes {
            for id in &ids {
                if *id != node.id {
                    node.worker.add_peer(id.clone(), true).expect("add_peer");
                }
            }
        }
    }

    /// Add a late joiner; returns its index.
    pub fn add_node(&mut self) -> usize {
        let dir = tempfile::tempdir().expect("tempdir");
        let validator = Arc::new(AcceptAllValidator);
        let (node, worker) = LedgerNode::join(
            dir.path(),
            &self.ledger_id,
            self.cfg.clone(),
            self.network.clone(),
            validator,
            self.metrics.clone(),
        )
        .expect("join");
        self.network
            .register(node.creator().clone(), node.gossip_server(), node.wake_handle());
        let id = node.creator().clone();
        self.nodes.push(TestNode {
            id,
            node,
            worker,
            _dir: dir,
        });
        self.mesh_peers();
        self.nodes.len() - 1
    }

    /// One worker cycle on every node, in index order.
    pub async fn cycle_all(&mut self) {
        for node in &mut self.nodes {
            node.worker.run_cycle().await.expect("cycle");
        }
    }

    /// Run `cycles` rounds, letting the millisecond-scale backoffs expire
    /// between rounds.
    pub async fn settle(&mut self, cycles: usize) {
        for _ in 0..cycles {
            self.cycle_all().await;
            tokio::time::sleep(std::time::Duration::from_millis(6)).await;
        }
    }

    /// Latest committed heights per node.
    pub fn heights(&self) -> Vec<Option<u64>> {
        self.nodes
            .iter()
            .map(|n| n.node.latest_block().expect("latest").map(|b| b.height()))
            .collect()
    }

    /// Assert every pair of nodes agrees on every height both have.
    pub fn assert_chains_agree(&self) {
        for a in &self.nodes {
            for b in &self.nodes {
                let ha = a.node.latest_block().expect("latest").map(|b| b.height());
                let hb = b.node.latest_block().expect("latest").map(|b| b.height());
                let (Some(ha), Some(hb)) = (ha, hb) else { continue };
                for h in 0..=ha.min(hb) {
                    let block_a = a.node.block(h).expect("block").expect("present");
                    let block_b = b.node.block(h).expect("block").expect("present");
                    assert_eq!(
                        block_a.hash, block_b.hash,
                        "block hash mismatch at height {h}"
                    );
                    assert_eq!(
                        block_a.body.event_hashes, block_b.body.event_hashes,
                        "event mismatch at height {h}"
                    );
                }
            }
        }
    }
}
