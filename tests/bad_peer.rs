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

//! A peer serving signature-invalid events is fatal: the session is marked
//! a protocol violation and the peer is deleted from the registry.

mod common;

use common::test_cfg;
use confluence::core::node::LedgerNode;
use confluence::core::security::signer::NodeSigner;
use confluence::core::types::CreatorId;
use confluence::core::validator::AcceptAllValidator;
use confluence::monitoring::metrics::Metrics;
use confluence::networking::gossip::{
    GossipError, Notify, PullRequest, PullResponse, Transport,
};
use confluence::networking::transport::LoopbackNetwork;
use std::sync::Arc;

/// Flips a signature bit in every pull response from `target`.
struct TamperingTransport {
    inner: Arc<LoopbackNetwork>,
    target: CreatorId,
}

#[async_trait::async_trait]
impl Transport for TamperingTransport {
    async fn pull(
        &self,
        remote: &CreatorId,
        request: PullRequest,
    ) -> Result<PullResponse, GossipError> {
        let mut response = self.inner.pull(remote, request).await?;
        if *remote == self.target {
            if let Some(envelope) = response.events.first_mut() {
                envelope.signature.0[0] ^= 0x01;
            }
        }
        Ok(response)
    }

    async fn notify(&self, remote: &CreatorId, notice: Notify) -> Result<(), GossipError> {
        self.inner.notify(remote, notice).await
    }
}

/// A transport-level failure is non-fatal in kind, but it still costs the
/// peer its last reputation point: a reputation-0 stranger is deleted,
/// while an operator-recommended peer is re-seeded on the next cycle.
#[tokio::test]
async fn offline_peer_is_dropped_then_reseeded() {
    let cfg = test_cfg(1);
    let network = LoopbackNetwork::new();
    let metrics_handle = Arc::new(Metrics::new().unwrap());
    let validator = Arc::new(AcceptAllValidator);

    let dir = tempfile::tempdir().unwrap();
    let id = NodeSigner::load_or_create(dir.path()).unwrap().creator_id();
    let (_node, mut worker) = LedgerNode::create(
        dir.path(),
        "offline-test",
        vec![id.clone()],
        cfg,
        network.clone(),
        validator,
        metrics_handle.clone(),
    )
    .unwrap();

    let phantom = CreatorId(vec![42u8; 32]);
    network.set_offline(&phantom, true);
    worker.add_peer(phantom.clone(), true).unwrap();

    // The pull fails with a network error; the newcomer's reputation goes
    // negative and it is removed.
    worker.run_cycle().await.unwrap();
    assert!(worker.registry().get(&phantom).is_none());
    assert_eq!(metrics_handle.gossip_failures_total.get(), 1);

    // The recommended peer is re-seeded at the next cycle and retried;
    // still offline, so it fails (and is dropped) again.
    worker.run_cycle().await.unwrap();
    assert_eq!(metrics_handle.gossip_failures_total.get(), 2);
    assert!(worker.registry().get(&phantom).is_none());
}

#[tokio::test]
async fn signature_invalid_peer_is_deleted() {
    let cfg = test_cfg(1);
    let network = LoopbackNetwork::new();
    let metrics = Arc::new(Metrics::new().unwrap());
    let validator = Arc::new(AcceptAllValidator);

    // The honest ledger creator.
    let dir_a = tempfile::tempdir().unwrap();
    let id_a = NodeSigner::load_or_create(dir_a.path()).unwrap().creator_id();
    let (node_a, mut worker_a) = LedgerNode::create(
        dir_a.path(),
        "bad-peer-test",
        vec![id_a.clone()],
        cfg.clone(),
        network.clone(),
        validator.clone(),
        metrics.clone(),
    )
    .unwrap();
    network.register(id_a.clone(), node_a.gossip_server(), node_a.wake_handle());

    // The victim pulls node A through a transport that corrupts signatures.
    let dir_b = tempfile::tempdir().unwrap();
    let tampering = Arc::new(TamperingTransport {
        inner: network.clone(),
        target: id_a.clone(),
    });
    let (node_b, mut worker_b) = LedgerNode::join(
        dir_b.path(),
        node_a.ledger_id(),
        cfg,
        tampering,
        validator,
        metrics,
    )
    .unwrap();
    network.register(
        node_b.creator().clone(),
        node_b.gossip_server(),
        node_b.wake_handle(),
    );

    // Seed node A as an ordinary (non-recommended) peer so deletion sticks.
    worker_a.run_cycle().await.unwrap();
    worker_b.add_peer(id_a.clone(), false).unwrap();
    assert_eq!(worker_b.registry().len(), 1);

    worker_b.run_cycle().await.unwrap();

    // Fatal session: peer gone, candidate list empty, nothing integrated.
    assert_eq!(worker_b.registry().len(), 0);
    assert!(worker_b
        .registry()
        .candidates(u64::MAX)
        .is_empty());
    assert!(node_b.latest_block().unwrap().is_none());
    assert_eq!(node_b.event_count().unwrap(), 0);
}
