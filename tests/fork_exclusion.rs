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

//! An observer node that sees a creator fork its chain withholds that
//! creator: the fork sibling is rejected, the creator's support stops
//! counting, and consensus proceeds on the honest witnesses alone.

use confluence::core::consensus::continuity::{ConsensusInput, ContinuityEngine};
use confluence::core::consensus::witness::select_anchor;
use confluence::core::event::{genesis_pair, new_merge, new_regular, LedgerConfiguration};
use confluence::core::security::signer::NodeSigner;
use confluence::core::store::{EventOrigin, EventStore, StoreError};
use confluence::core::types::{now_ms, CreatorId, Hash256};
use std::collections::BTreeSet;

struct Observer {
    _dir: tempfile::TempDir,
    store: EventStore,
    signers: Vec<NodeSigner>,
    witnesses: BTreeSet<CreatorId>,
    genesis_merge: Hash256,
    genesis_block_hash: Hash256,
}

/// Four witnesses; the observer holds everyone's first merge.
fn observer() -> Observer {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let mut store = EventStore::open(&db).unwrap();

    let signers: Vec<NodeSigner> = (0..4).map(|_| NodeSigner::ephemeral().unwrap()).collect();
    let witnesses: BTreeSet<CreatorId> = signers.iter().map(|s| s.creator_id()).collect();

    let (config_event, genesis_merge) = genesis_pair(
        &signers[0],
        LedgerConfiguration {
            ledger_name: "fork-test".into(),
            witness_pool: witnesses.iter().cloned().collect(),
            procedure: "continuity-v1".into(),
        },
    )
    .unwrap();
    store.pin_ledger(config_event.hash).unwrap();
    store.insert(&config_event, EventOrigin::Peer).unwrap();
    store.insert(&genesis_merge, EventOrigin::Peer).unwrap();
    store
        .mark_consensus(&[config_event.hash, genesis_merge.hash], 0, now_ms())
        .unwrap();
    let genesis_block = confluence::core::block::Block::from_body(
        confluence::core::block::BlockBody {
            height: 0,
            previous_hash: Hash256::ZERO,
            event_hashes: vec![config_event.hash, genesis_merge.hash],
            consensus_proof: vec![genesis_merge.hash],
        },
    )
    .unwrap();

    let genesis_merge = genesis_merge.hash;
    let mut obs = Observer {
        _dir: dir,
        store,
        signers,
        witnesses,
        genesis_merge,
        genesis_block_hash: genesis_block.hash,
    };
    for i in 0..4 {
        let signer = &obs.signers[i];
        let op = new_regular(
            signer,
            format!("op-{i}").into_bytes(),
            obs.genesis_merge,
            0,
            0,
        )
        .unwrap();
        obs.store.insert(&op, EventOrigin::Peer).unwrap();
        let merge = new_merge(signer, (obs.genesis_merge, 0), &[(op.hash, 1)], 0).unwrap();
        obs.store.insert(&merge, EventOrigin::Peer).unwrap();
    }
    obs
}

#[tokio::test]
async fn forked_creator_is_withheld_and_consensus_survives() {
    let mut obs = observer();

    // Pick the anchor and two honest voters; the remaining witness forks.
    let anchor = select_anchor(
        &obs.genesis_block_hash,
        &obs.witnesses,
        &BTreeSet::new(),
    )
    .unwrap();
    let (anchor_x, anchor_x_height) = obs.store.local_branch_head(&anchor).unwrap();
    let others: Vec<CreatorId> = obs
        .witnesses
        .iter()
        .filter(|w| **w != anchor)
        .cloned()
        .collect();
    let (voters, byzantine) = (others[..2].to_vec(), others[2].clone());

    for voter in &voters {
        let (head, head_height) = obs.store.local_branch_head(voter).unwrap();
        let signer = obs
            .signers
            .iter()
            .find(|s| s.creator_id() == *voter)
            .unwrap();
        let merge = new_merge(signer, (head, head_height), &[(anchor_x, anchor_x_height)], 0)
            .unwrap();
        obs.store.insert(&merge, EventOrigin::Peer).unwrap();
    }

    // The byzantine witness forks its operation chain: a second regular
    // event with the tree parent its first one already used.
    let byz_signer = obs
        .signers
        .iter()
        .find(|s| s.creator_id() == byzantine)
        .unwrap();
    let sibling = new_regular(byz_signer, b"forked".to_vec(), obs.genesis_merge, 0, 0).unwrap();
    match obs.store.insert(&sibling, EventOrigin::Peer) {
        Err(StoreError::ProtocolViolation(_)) => {}
        other => panic!("fork sibling should be a protocol violation, got {other:?}"),
    }
    assert!(obs.store.forked_creators().contains(&byzantine));

    // Anything further from the forked creator is refused.
    let (byz_head, byz_height) = obs.store.local_branch_head(&byzantine).unwrap();
    let late = new_merge(
        byz_signer,
        (byz_head, byz_height),
        &[(anchor_x, anchor_x_height)],
        0,
    )
    .unwrap();
    assert!(matches!(
        obs.store.insert(&late, EventOrigin::Peer),
        Err(StoreError::ProtocolViolation(_))
    ));

    // Consensus still closes on the three honest witnesses: the anchor's
    // own vote plus the two voters meet the 2f+1 = 3 quorum, and the
    // byzantine creator contributes nothing to the proof.
    let slice = obs.store.recent_history().unwrap();
    let forked = obs.store.forked_creators().clone();
    let result = ContinuityEngine::new().evaluate(&ConsensusInput {
        slice: &slice,
        witnesses: &obs.witnesses,
        forked: &forked,
        previous_block_hash: obs.genesis_block_hash,
        block_height: 1,
    });
    assert!(result.consensus);
    assert_eq!(result.consensus_proof.len(), 3);

    let byz_events: Vec<Hash256> = slice
        .iter()
        .filter(|(_, node)| node.event.creator() == &byzantine)
        .map(|(h, _)| *h)
        .collect();
    for h in &result.consensus_proof {
        assert!(!byz_events.contains(h), "byzantine event in the proof");
    }

    // Deterministic output for the deterministic input.
    let again = ContinuityEngine::new().evaluate(&ConsensusInput {
        slice: &slice,
        witnesses: &obs.witnesses,
        forked: &forked,
        previous_block_hash: obs.genesis_block_hash,
        block_height: 1,
    });
    assert_eq!(result.block_events, again.block_events);
}
