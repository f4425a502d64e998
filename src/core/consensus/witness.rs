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

//! Deterministic witness selection.
//!
//! Each block height draws its witness set from the configured pool using
//! only the previous block's hash: members are ranked by
//! `H(domain || previous_block_hash || creator)` and the top `3f + 1` are
//! selected, where `f` is the largest failure bound the pool can sustain.
//! Every node with the same chain derives the same set.

use crate::core::types::{content_hash, CreatorId, Hash256};
use std::collections::BTreeSet;

const WITNESS_RANK_DOMAIN: &[u8] = b"Confluence-Witness-Rank-v1";

/// Largest witness set size `3f + 1` a pool of `pool_size` can field.
pub fn witness_count(pool_size: usize) -> usize {
    if pool_size == 0 {
        return 0;
    }
    let f = (pool_size - 1) / 3;
    3 * f + 1
}

/// The failure bound `f` for a witness set of `witness_count` members.
pub fn max_failures(witness_count: usize) -> usize {
    if witness_count == 0 {
        return 0;
    }
    (witness_count - 1) / 3
}

fn rank(previous_block_hash: &Hash256, id: &CreatorId) -> Hash256 {
    let mut input =
        Vec::with_capacity(WITNESS_RANK_DOMAIN.len() + 32 + id.0.len());
    input.extend_from_slice(WITNESS_RANK_DOMAIN);
    input.extend_from_slice(previous_block_hash.as_bytes());
    input.extend_from_slice(&id.0);
    content_hash(&input)
}

/// Select the witness set for the block following `previous_block_hash`.
pub fn select_witnesses(
    previous_block_hash: &Hash256,
    pool: &BTreeSet<CreatorId>,
) -> BTreeSet<CreatorId> {
    let take = witness_count(pool.len());
    let mut ranked: Vec<(Hash256, &CreatorId)> = pool
        .iter()
        .map(|id| (rank(previous_block_hash, id), id))
        .collect();
    ranked.sort_by(|a, b| b.cmp(a));
    ranked
        .into_iter()
        .take(take)
        .map(|(_, id)| id.clone())
        .collect()
}

/// The anchor witness for a height: the highest-ranked witness not in
/// `skip` (creators withheld after a detected fork).
pub fn select_anchor(
    previous_block_hash: &Hash256,
    witnesses: &BTreeSet<CreatorId>,
    skip: &BTreeSet<CreatorId>,
) -> Option<CreatorId> {
    witnesses
        .iter()
        .filter(|id| !skip.contains(*id))
        .max_by_key(|id| rank(previous_block_hash, *id))
        .cloned()
}
