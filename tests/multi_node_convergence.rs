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

mod common;

use common::{test_cfg, TestNet};

/// Four equal witnesses, one operation per node per round. Chains must
/// advance, stay within a small drift of each other, and agree exactly on
/// every common height.
#[tokio::test]
async fn four_node_multi_block_convergence() {
    let mut net = TestNet::new(4, test_cfg(3));
    net.settle(3).await;

    for round in 0..20u32 {
        for i in 0..4 {
            net.nodes[i]
                .node
                .submit_operation(format!("op-{round}-{i}").into_bytes())
                .unwrap();
        }
        net.settle(1).await;
    }
    // Drain: no new operations, keep gossiping and deciding.
    net.settle(15).await;

    let heights: Vec<u64> = net.heights().into_iter().map(|h| h.unwrap_or(0)).collect();
    let max = *heights.iter().max().unwrap();
    let min = *heights.iter().min().unwrap();
    assert!(min >= 1, "chains never advanced: {heights:?}");
    assert!(
        max - min <= 3,
        "chains drifted too far apart: {heights:?}"
    );

    // Identical block hashes and event sets at every common height.
    net.assert_chains_agree();
}

/// Every submitted operation eventually commits on every node.
#[tokio::test]
async fn operations_commit_everywhere() {
    let mut net = TestNet::new(4, test_cfg(3));
    net.settle(3).await;

    for i in 0..4 {
        net.nodes[i]
            .node
            .submit_operation(format!("only-{i}").into_bytes())
            .unwrap();
    }
    net.settle(20).await;

    // All nodes hold the same committed events over the common prefix and
    // at least 4 operations are in it (one per creator).
    net.assert_chains_agree();
    let min_height = net
        .heights()
        .into_iter()
        .map(|h| h.unwrap_or(0))
        .min()
        .unwrap();
    let mut committed_events = 0usize;
    for h in 1..=min_height {
        committed_events += net.nodes[0]
            .node
            .block(h)
            .unwrap()
            .unwrap()
            .body
            .event_hashes
            .len();
    }
    assert!(
        committed_events >= 4,
        "expected the four operations plus merges, got {committed_events}"
    );
}
