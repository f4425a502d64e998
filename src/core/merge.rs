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

//! The merger: folds received heads and pending local operations into one
//! locally-signed merge event per cycle.
//!
//! The strategy is pure given its inputs: the node context, the store
//! snapshot, the witness set, the configuration, and the already-drawn
//! `[0, 1)` value gating operation inclusion. The worker owns the RNG.

use crate::core::config::EngineConfig;
use crate::core::consensus::witness::max_failures;
use crate::core::event::{new_merge, Event, EventError};
use crate::core::security::signer::NodeSigner;
use crate::core::store::{DagSlice, EventStore, StoreError};
use crate::core::types::{CreatorId, Hash256};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

/// Merge errors.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("event: {0}")]
    Event(#[from] EventError),
}

/// Explicit node context handed to the strategy; no ambient state.
#[derive(Clone, Debug)]
pub struct NodeContext {
    /// The local creator identity.
    pub creator: CreatorId,
    /// Committed block height visible to this node.
    pub basis_block_height: u64,
}

/// Produce at most one merge event for this cycle, or `None` when the
/// thresholds cannot be met or there is nothing new to merge.
pub fn create_merge(
    ctx: &NodeContext,
    signer: &NodeSigner,
    store: &EventStore,
    slice: &DagSlice,
    witnesses: &BTreeSet<CreatorId>,
    cfg: &EngineConfig,
    operation_draw: f64,
) -> Result<Option<Event>, MergeError> {
    let (tree_head, tree_height) = store.local_branch_head(&ctx.creator)?;
    let withheld = store.forked_creators();

    // Candidate non-tree parents: other creators' branch heads that our
    // own chain has not already absorbed.
    let mut witness_heads: Vec<(Hash256, u64)> = Vec::new();
    let mut peer_heads: Vec<(Hash256, u64)> = Vec::new();
    for (creator, (head, height)) in store.heads() {
        if *creator == ctx.creator || withheld.contains(creator) {
            continue;
        }
        if *head == tree_head || store.is_ancestor(head, &tree_head)? {
            continue;
        }
        if witnesses.contains(creator) {
            witness_heads.push((*head, *height));
        } else {
            peer_heads.push((*head, *height));
        }
    }
    witness_heads.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));
    peer_heads.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));

    // Pending local operations: our uncommitted regular events that the
    // current tree head has not merged yet.
    let merged_by_head = slice.ancestors(&tree_head);
    let mut pending_ops: Vec<(Hash256, u64)> = slice
        .iter()
        .filter(|(hash, node)| {
            node.event.is_regular()
                && node.event.creator() == &ctx.creator
                && !merged_by_head.contains(*hash)
        })
        .map(|(hash, node)| (*hash, node.event.body.merge_height))
        .collect();
    pending_ops.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));

    let include_ops = !pending_ops.is_empty() && operation_draw < cfg.operation_ready_chance;

    let f = max_failures(witnesses.len()) as u32;
    let witness_minimum = cfg.witness_minimum_threshold.resolve(f) as usize;
    let witness_target = cfg.witness_target_threshold.resolve(f) as usize;
    let peer_minimum = cfg.peer_minimum_threshold.resolve(f) as usize;

    if witness_heads.len() < witness_minimum || peer_heads.len() < peer_minimum {
        return Ok(None);
    }
    if witness_heads.len() < witness_target {
        debug!(
            have = witness_heads.len(),
            target = witness_target,
            "merging below witness target"
        );
    }

    // Parent budget: the threshold minimums are reserved for heads, and
    // operations fill the space above them. An operation backlog larger
    // than the budget is carried by prefix: `pending_ops` is ordered by
    // merge height, so every included operation's own ancestry is either
    // included or already merged, and the tail defers to later merges.
    let budget = cfg.max_merge_parents.saturating_sub(1);
    let reserved = witness_minimum.saturating_add(peer_minimum);
    if reserved > budget {
        // Unmeetable thresholds for this parent cap.
        return Ok(None);
    }

    let mut others: Vec<(Hash256, u64)> = Vec::new();
    if include_ops {
        let take_ops = pending_ops.len().min(budget - reserved);
        if take_ops < pending_ops.len() {
            debug!(
                pending = pending_ops.len(),
                included = take_ops,
                "operation backlog exceeds parent budget; deferring tail"
            );
        }
        others.extend(pending_ops.into_iter().take(take_ops));
    }

    let mut remaining = budget - others.len();
    let take_witness = witness_heads
        .len()
        .min(remaining.saturating_sub(peer_minimum));
    others.extend(witness_heads.into_iter().take(take_witness));
    remaining -= take_witness;
    let take_peers = peer_heads.len().min(remaining);
    others.extend(peer_heads.into_iter().take(take_peers));

    if others.is_empty() {
        // Nothing new this cycle.
        return Ok(None);
    }

    let event = new_merge(
        signer,
        (tree_head, tree_height),
        &others,
        ctx.basis_block_height,
    )?;
    Ok(Some(event))
}
