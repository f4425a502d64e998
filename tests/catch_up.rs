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

/// A node joining after the network has committed blocks replays the full
/// DAG through gossip and converges on the same chain.
#[tokio::test]
async fn late_joiner_catches_up() {
    let mut net = TestNet::new(3, test_cfg(2));
    net.settle(3).await;

    for round in 0..8u32 {
        for i in 0..3 {
            net.nodes[i]
                .node
                .submit_operation(format!("op-{round}-{i}").into_bytes())
                .unwrap();
        }
        net.settle(1).await;
    }
    net.settle(8).await;

    let established: u64 = net
        .heights()
        .into_iter()
        .map(|h| h.unwrap_or(0))
        .min()
        .unwrap();
    assert!(established >= 1, "network never advanced");

    let joiner = net.add_node();
    net.settle(12).await;

    let joiner_height = net.nodes[joiner]
        .node
        .latest_block()
        .unwrap()
        .expect("joiner committed nothing")
        .height();
    assert!(
        joiner_height >= established,
        "joiner at {joiner_height}, network was at {established}"
    );

    // The joiner's chain is byte-identical over the common prefix.
    net.assert_chains_agree();
}
