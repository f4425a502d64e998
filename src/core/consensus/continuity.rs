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

//! The continuity decision engine.
//!
//! Operates on the uncommitted DAG slice. Per height, the witness ranked
//! highest by the previous block hash anchors the decision: its earliest
//! uncommitted merge event is the X-event the other witnesses vote on. A
//! witness votes by producing a merge event whose ancestry reaches the
//! X-event; its earliest such merge is its Y-event. When Y-events exist
//! from `2f + 1` distinct witnesses, the block is the X-event plus its
//! uncommitted ancestors, ordered by `(merge_height, hash)`, and the
//! Y-events form the consensus proof.
//!
//! The committed set is the ancestor closure of a single intrinsic event,
//! and the vote count only grows as knowledge grows, so nodes sharing a
//! chain prefix decide the same block no matter when their slices catch
//! up. Creators with a detected fork are excluded from anchor selection
//! and from voting; their events still commit when an anchor's ancestry
//! carries them, but they count for no one.

use crate::core::consensus::witness::{max_failures, select_anchor};
use crate::core::store::DagSlice;
use crate::core::types::{CreatorId, Hash256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Everything the engine reads for one evaluation.
pub struct ConsensusInput<'a> {
    /// The uncommitted slice from the store.
    pub slice: &'a DagSlice,
    /// Witness set for the height being decided.
    pub witnesses: &'a BTreeSet<CreatorId>,
    /// Creators withheld after a detected fork.
    pub forked: &'a BTreeSet<CreatorId>,
    /// Hash of the previous block.
    pub previous_block_hash: Hash256,
    /// Height being decided.
    pub block_height: u64,
}

/// What gossip should chase when the decision is still open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SupportHint {
    /// Witnesses whose vote is still missing.
    pub lagging_witnesses: Vec<CreatorId>,
    /// The X-event being voted on, when known.
    pub anchor_event: Option<Hash256>,
}

/// Engine output for one evaluation.
#[derive(Clone, Debug, Default)]
pub struct ConsensusResult {
    /// Whether a block was decided.
    pub consensus: bool,
    /// Height the result refers to.
    pub block_height: u64,
    /// Ordered block event hashes; empty unless decided.
    pub block_events: Vec<Hash256>,
    /// Y-events that closed the decision; empty unless decided.
    pub consensus_proof: Vec<Hash256>,
    /// Progress hint; present only when undecided.
    pub hint: Option<SupportHint>,
}

impl ConsensusResult {
    fn undecided(block_height: u64, hint: SupportHint) -> Self {
        Self {
            consensus: false,
            block_height,
            hint: Some(hint),
            ..Self::default()
        }
    }
}

/// Stateless continuity engine; all state is per-invocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContinuityEngine;

impl ContinuityEngine {
    /// New engine.
    pub fn new() -> Self {
        Self
    }

    /// Evaluate the slice for the next block.
    pub fn evaluate(&self, input: &ConsensusInput<'_>) -> ConsensusResult {
        let quorum = 2 * max_failures(input.witnesses.len()) + 1;
        let active: BTreeSet<&CreatorId> = input
            .witnesses
            .iter()
            .filter(|w| !input.forked.contains(*w))
            .collect();

        let Some(anchor_creator) =
            select_anchor(&input.previous_block_hash, input.witnesses, input.forked)
        else {
            return ConsensusResult::undecided(input.block_height, SupportHint::default());
        };

        // Earliest uncommitted merge event per active witness. Creator
        // chains are prefix-closed, so this is the same on every node that
        // shares the committed prefix.
        let mut earliest: BTreeMap<&CreatorId, (u64, Hash256)> = BTreeMap::new();
        for (hash, node) in input.slice.iter() {
            if !node.event.is_merge() {
                continue;
            }
            let creator = node.event.creator();
            if !active.contains(creator) {
                continue;
            }
            let key = (node.event.body.merge_height, *hash);
            match earliest.get(creator) {
                Some(existing) if *existing <= key => {}
                _ => {
                    earliest.insert(creator, key);
                }
            }
        }

        let Some(&(_, anchor_event)) = earliest.get(&anchor_creator) else {
            return ConsensusResult::undecided(
                input.block_height,
                SupportHint {
                    lagging_witnesses: vec![anchor_creator],
                    anchor_event: None,
                },
            );
        };

        // Y-event per witness: its earliest merge whose ancestry reaches
        // the anchor X-event. The anchor votes with the X-event itself.
        let mut y_events: BTreeMap<&CreatorId, (u64, Hash256)> = BTreeMap::new();
        for (hash, node) in input.slice.iter() {
            if !node.event.is_merge() {
                continue;
            }
            let creator = node.event.creator();
            if !active.contains(creator) {
                continue;
            }
            let endorses = *hash == anchor_event
                || input.slice.ancestors(hash).contains(&anchor_event);
            if !endorses {
                continue;
            }
            let key = (node.event.body.merge_height, *hash);
            match y_events.get(creator) {
                Some(existing) if *existing <= key => {}
                _ => {
                    y_events.insert(creator, key);
                }
            }
        }

        if y_events.len() < quorum {
            let lagging: Vec<CreatorId> = active
                .iter()
                .filter(|w| !y_events.contains_key(**w))
                .map(|w| (*w).clone())
                .collect();
            debug!(
                height = input.block_height,
                votes = y_events.len(),
                quorum,
                "consensus still open"
            );
            return ConsensusResult::undecided(
                input.block_height,
                SupportHint {
                    lagging_witnesses: lagging,
                    anchor_event: Some(anchor_event),
                },
            );
        }

        let mut block_set = input.slice.ancestors(&anchor_event);
        block_set.insert(anchor_event);

        let mut ordered: Vec<(u64, Hash256)> = block_set
            .iter()
            .filter_map(|h| {
                input
                    .slice
                    .get(h)
                    .map(|node| (node.event.body.merge_height, *h))
            })
            .collect();
        ordered.sort();

        let mut proof: Vec<(u64, Hash256)> = y_events.values().copied().collect();
        proof.sort();

        ConsensusResult {
            consensus: true,
            block_height: input.block_height,
            block_events: ordered.into_iter().map(|(_, h)| h).collect(),
            consensus_proof: proof.into_iter().map(|(_, h)| h).collect(),
            hint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{genesis_pair, new_merge, new_regular, LedgerConfiguration};
    use crate::core::security::signer::NodeSigner;
    use crate::core::store::{EventOrigin, EventStore};
    use crate::core::types::now_ms;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: EventStore,
        signers: Vec<NodeSigner>,
        witnesses: BTreeSet<CreatorId>,
        genesis_block_hash: Hash256,
        genesis_merge: Hash256,
    }

    /// Four witnesses, genesis committed as block 0, one regular event and
    /// one first merge per witness.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let mut store = EventStore::open(&db).unwrap();

        let signers: Vec<NodeSigner> =
            (0..4).map(|_| NodeSigner::ephemeral().unwrap()).collect();
        let witnesses: BTreeSet<CreatorId> =
            signers.iter().map(|s| s.creator_id()).collect();

        let config = LedgerConfiguration {
            ledger_name: "fixture".into(),
            witness_pool: witnesses.iter().cloned().collect(),
            procedure: "continuity-v1".into(),
        };
        let (config_event, genesis_merge) = genesis_pair(&signers[0], config).unwrap();
        store.pin_ledger(config_event.hash).unwrap();
        store.insert(&config_event, EventOrigin::Local).unwrap();
        store.insert(&genesis_merge, EventOrigin::Local).unwrap();
        store
            .mark_consensus(&[config_event.hash, genesis_merge.hash], 0, now_ms())
            .unwrap();

        let genesis_block =
            crate::core::block::Block::from_body(crate::core::block::BlockBody {
                height: 0,
                previous_hash: Hash256::ZERO,
                event_hashes: vec![config_event.hash, genesis_merge.hash],
                consensus_proof: vec![genesis_merge.hash],
            })
            .unwrap();

        let genesis_merge = genesis_merge.hash;
        let mut fx = Fixture {
            _dir: dir,
            store,
            signers,
            witnesses,
            genesis_block_hash: genesis_block.hash,
            genesis_merge,
        };

        // Every witness starts its chain: one operation, one first merge.
        for i in 0..4 {
            fx.first_merge(i);
        }
        fx
    }

    impl Fixture {
        fn signer_for(&self, id: &CreatorId) -> &NodeSigner {
            self.signers
                .iter()
                .find(|s| &s.creator_id() == id)
                .unwrap()
        }

        /// Operation + first merge for signer `i`; returns the merge hash.
        fn first_merge(&mut self, i: usize) -> Hash256 {
            let signer = &self.signers[i];
            let op = new_regular(
                signer,
                format!("op-{i}").into_bytes(),
                self.genesis_merge,
                0,
                0,
            )
            .unwrap();
            self.store.insert(&op, EventOrigin::Peer).unwrap();
            let merge =
                new_merge(signer, (self.genesis_merge, 0), &[(op.hash, 1)], 0).unwrap();
            self.store.insert(&merge, EventOrigin::Peer).unwrap();
            merge.hash
        }

        /// A merge by `id` folding in `other` (a merge by someone else).
        fn endorsing_merge(&mut self, id: &CreatorId, other: (Hash256, u64)) -> Hash256 {
            let (head, head_height) = self.store.local_branch_head(id).unwrap();
            let signer = self.signer_for(id);
            let merge = new_merge(signer, (head, head_height), &[other], 0).unwrap();
            self.store.insert(&merge, EventOrigin::Peer).unwrap();
            merge.hash
        }

        fn evaluate(&self, forked: &BTreeSet<CreatorId>) -> ConsensusResult {
            let slice = self.store.recent_history().unwrap();
            ContinuityEngine::new().evaluate(&ConsensusInput {
                slice: &slice,
                witnesses: &self.witnesses,
                forked,
                previous_block_hash: self.genesis_block_hash,
                block_height: 1,
            })
        }
    }

    #[test]
    fn undecided_without_quorum_support() {
        let fx = fixture();
        let result = fx.evaluate(&BTreeSet::new());
        // Only the anchor's own vote exists: 1 < 3.
        assert!(!result.consensus);
        let hint = result.hint.unwrap();
        assert!(hint.anchor_event.is_some());
        assert_eq!(hint.lagging_witnesses.len(), 3);
    }

    #[test]
    fn quorum_votes_decide_anchor_closure() {
        let mut fx = fixture();
        let anchor =
            select_anchor(&fx.genesis_block_hash, &fx.witnesses, &BTreeSet::new()).unwrap();
        let (anchor_x, anchor_x_height) = {
            // The anchor's first merge is its X-event.
            let (head, height) = fx.store.local_branch_head(&anchor).unwrap();
            (head, height)
        };

        // Two more witnesses endorse the X-event: quorum of 3 reached.
        let voters: Vec<CreatorId> = fx
            .witnesses
            .iter()
            .filter(|w| **w != anchor)
            .take(2)
            .cloned()
            .collect();
        for voter in &voters {
            fx.endorsing_merge(voter, (anchor_x, anchor_x_height));
        }

        let result = fx.evaluate(&BTreeSet::new());
        assert!(result.consensus);
        assert_eq!(result.block_height, 1);
        // The block is the anchor's X-event plus its uncommitted ancestry:
        // the anchor's operation and the merge itself.
        assert_eq!(result.block_events.len(), 2);
        assert_eq!(*result.block_events.last().unwrap(), anchor_x);
        // Proof: the X-event itself plus the two endorsing merges.
        assert_eq!(result.consensus_proof.len(), 3);
        assert!(result.consensus_proof.contains(&anchor_x));

        // Ordering is (merge_height, hash).
        let slice = fx.store.recent_history().unwrap();
        let heights: Vec<u64> = result
            .block_events
            .iter()
            .map(|h| slice.get(h).unwrap().event.body.merge_height)
            .collect();
        let mut sorted = heights.clone();
        sorted.sort();
        assert_eq!(heights, sorted);
    }

    #[test]
    fn forked_witness_votes_count_for_no_one() {
        let mut fx = fixture();
        let anchor =
            select_anchor(&fx.genesis_block_hash, &fx.witnesses, &BTreeSet::new()).unwrap();
        let (anchor_x, anchor_x_height) = fx.store.local_branch_head(&anchor).unwrap();

        let voters: Vec<CreatorId> = fx
            .witnesses
            .iter()
            .filter(|w| **w != anchor)
            .take(2)
            .cloned()
            .collect();
        for voter in &voters {
            fx.endorsing_merge(voter, (anchor_x, anchor_x_height));
        }

        // Withholding one of the two voters drops the count below quorum.
        let mut forked = BTreeSet::new();
        forked.insert(voters[0].clone());
        let result = fx.evaluate(&forked);
        assert!(!result.consensus);

        // Without the withholding the same slice decides.
        assert!(fx.evaluate(&BTreeSet::new()).consensus);
    }

    #[test]
    fn output_is_deterministic_for_identical_slices() {
        let mut fx = fixture();
        let anchor =
            select_anchor(&fx.genesis_block_hash, &fx.witnesses, &BTreeSet::new()).unwrap();
        let (anchor_x, anchor_x_height) = fx.store.local_branch_head(&anchor).unwrap();
        let voters: Vec<CreatorId> = fx
            .witnesses
            .iter()
            .filter(|w| **w != anchor)
            .take(2)
            .cloned()
            .collect();
        for voter in &voters {
            fx.endorsing_merge(voter, (anchor_x, anchor_x_height));
        }

        let a = fx.evaluate(&BTreeSet::new());
        let b = fx.evaluate(&BTreeSet::new());
        assert_eq!(a.block_events, b.block_events);
        assert_eq!(a.consensus_proof, b.consensus_proof);
    }
}
