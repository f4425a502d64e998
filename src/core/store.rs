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

//! EventStore: the persistent event DAG.
//!
//! Events are kept in sled trees indexed by hash, by `(creator,
//! merge_height)`, and by `(block_height)` once committed. The store runs
//! the full validation ladder on insert (shape, signature, hash, ancestry,
//! tree-chain, merge height) and tracks per-creator branch heads, the
//! uncommitted slice, and forked creators in single-writer caches.
//!
//! Fork detection is per chain kind: two merge events by one creator
//! sharing a tree parent fork the merge chain; two regular events sharing
//! a tree parent fork the operation chain. A merge and a regular event
//! legitimately share the creator's previous merge as tree parent.

use crate::core::event::{Event, EventMeta, LedgerConfiguration, Payload, MAX_EVENT_BYTES};
use crate::core::types::{
    decode_canonical_limited, encode_canonical, now_ms, CanonicalMap, CreatorId, Hash256,
};
use serde::{Deserialize, Serialize};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

const TREE_EVENTS: &str = "events";
const TREE_CREATOR_IDX: &str = "creator_idx";
const TREE_TREE_IDX: &str = "tree_idx";
const TREE_CONSENSUS_IDX: &str = "consensus_idx";
const TREE_LEDGER: &str = "ledger";

const KEY_CONFIG_EVENT: &[u8] = b"config_event";
const KEY_GENESIS_MERGE: &[u8] = b"genesis_merge";
const FORKED_PREFIX: &[u8] = b"forked/";

const KIND_REGULAR: u8 = 0;
const KIND_MERGE: u8 = 1;
const KIND_CONFIG: u8 = 2;

// A stored record carries the event plus its meta.
const MAX_STORED_BYTES: usize = MAX_EVENT_BYTES + 4_096;

/// Where an inserted event came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOrigin {
    /// Created by this node.
    Local,
    /// Received through gossip.
    Peer,
}

/// Non-error insert outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored and indexed.
    Inserted,
    /// Already present; benign.
    Duplicate,
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("db io")]
    Db,
    #[error("codec")]
    Codec,
    /// Recoverable: the caller may fetch the named parents and retry.
    #[error("missing parents")]
    MissingParents { hashes: Vec<Hash256> },
    /// Malformed structure; fatal for the offending event.
    #[error("invalid event: {0}")]
    Validation(String),
    /// Byzantine behavior by the sender; fatal for the session.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// Genesis pair does not match the pinned ledger id.
    #[error("ledger mismatch")]
    LedgerMismatch,
    /// The ledger has no genesis yet.
    #[error("no genesis")]
    NoGenesis,
}

/// Stored record: event plus node-local meta.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredEvent {
    event: Event,
    meta: EventMeta,
}

/// Pinned genesis hashes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenesisPin {
    /// Configuration event hash; its multibase form is the ledger id.
    pub config_event: Hash256,
    /// Genesis merge event hash.
    pub genesis_merge: Hash256,
}

/// One node of the uncommitted DAG slice.
#[derive(Clone, Debug)]
pub struct SliceNode {
    /// The event.
    pub event: Event,
    /// Intra-slice parent keys.
    pub parents: BTreeSet<Hash256>,
    /// Intra-slice child keys.
    pub children: BTreeSet<Hash256>,
}

/// Arena of uncommitted events keyed by hash, with forward and backward
/// key sets instead of owning references.
#[derive(Clone, Debug, Default)]
pub struct DagSlice {
    nodes: BTreeMap<Hash256, SliceNode>,
}

impl DagSlice {
    /// Node lookup.
    pub fn get(&self, hash: &Hash256) -> Option<&SliceNode> {
        self.nodes.get(hash)
    }

    /// Membership.
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.nodes.contains_key(hash)
    }

    /// Iterate nodes in hash order.
    pub fn iter(&self) -> impl Iterator<Item = (&Hash256, &SliceNode)> {
        self.nodes.iter()
    }

    /// Number of events in the slice.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the slice is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Intra-slice ancestors of `hash` (excluding `hash` itself).
    pub fn ancestors(&self, hash: &Hash256) -> BTreeSet<Hash256> {
        let mut out = BTreeSet::new();
        let mut queue: VecDeque<Hash256> = match self.nodes.get(hash) {
            Some(node) => node.parents.iter().copied().collect(),
            None => return out,
        };
        while let Some(h) = queue.pop_front() {
            if out.insert(h) {
                if let Some(node) = self.nodes.get(&h) {
                    queue.extend(node.parents.iter().copied());
                }
            }
        }
        out
    }

    /// Whether `ancestor` is a strict intra-slice ancestor of `descendant`.
    pub fn is_ancestor(&self, ancestor: &Hash256, descendant: &Hash256) -> bool {
        self.ancestors(descendant).contains(ancestor)
    }
}

/// The persistent event DAG for one ledger.
pub struct EventStore {
    events: sled::Tree,
    creator_idx: sled::Tree,
    tree_idx: sled::Tree,
    consensus_idx: sled::Tree,
    ledger: sled::Tree,

    // Single-writer caches, rebuilt on open.
    heads: BTreeMap<CreatorId, (Hash256, u64)>,
    uncommitted: BTreeSet<Hash256>,
    forked: BTreeSet<CreatorId>,
    genesis: Option<GenesisPin>,
    expected_config_hash: Option<Hash256>,
    configuration: Option<LedgerConfiguration>,
}

fn creator_key(creator: &CreatorId, merge_height: u64, hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(creator.0.len() + 8 + 32);
    key.extend_from_slice(&creator.0);
    key.extend_from_slice(&merge_height.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

fn tree_key(creator: &CreatorId, kind: u8, tree: &Hash256, hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(creator.0.len() + 1 + 32 + 32);
    key.extend_from_slice(&creator.0);
    key.push(kind);
    key.extend_from_slice(tree.as_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

fn tree_prefix(creator: &CreatorId, kind: u8, tree: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(creator.0.len() + 1 + 32);
    key.extend_from_slice(&creator.0);
    key.push(kind);
    key.extend_from_slice(tree.as_bytes());
    key
}

fn consensus_key(block_height: u64, hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 32);
    key.extend_from_slice(&block_height.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

fn forked_key(creator: &CreatorId) -> Vec<u8> {
    let mut key = Vec::with_capacity(FORKED_PREFIX.len() + creator.0.len());
    key.extend_from_slice(FORKED_PREFIX);
    key.extend_from_slice(&creator.0);
    key
}

fn event_kind(event: &Event) -> u8 {
    if event.is_merge() {
        KIND_MERGE
    } else if event.is_config() {
        KIND_CONFIG
    } else {
        KIND_REGULAR
    }
}

impl EventStore {
    /// Open the event trees in an already-opened database and rebuild the
    /// single-writer caches.
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        let events = db.open_tree(TREE_EVENTS).map_err(|_| StoreError::Db)?;
        let creator_idx = db.open_tree(TREE_CREATOR_IDX).map_err(|_| StoreError::Db)?;
        let tree_idx = db.open_tree(TREE_TREE_IDX).map_err(|_| StoreError::Db)?;
        let consensus_idx = db
            .open_tree(TREE_CONSENSUS_IDX)
            .map_err(|_| StoreError::Db)?;
        let ledger = db.open_tree(TREE_LEDGER).map_err(|_| StoreError::Db)?;

        let mut store = Self {
            events,
            creator_idx,
            tree_idx,
            consensus_idx,
            ledger,
            heads: BTreeMap::new(),
            uncommitted: BTreeSet::new(),
            forked: BTreeSet::new(),
            genesis: None,
            expected_config_hash: None,
            configuration: None,
        };
        store.rebuild_caches()?;
        Ok(store)
    }

    fn rebuild_caches(&mut self) -> Result<(), StoreError> {
        let config_pin = self
            .ledger
            .get(KEY_CONFIG_EVENT)
            .map_err(|_| StoreError::Db)?
            .map(|b| decode_hash(&b))
            .transpose()?;
        let merge_pin = self
            .ledger
            .get(KEY_GENESIS_MERGE)
            .map_err(|_| StoreError::Db)?
            .map(|b| decode_hash(&b))
            .transpose()?;
        if let (Some(config_event), Some(genesis_merge)) = (config_pin, merge_pin) {
            self.genesis = Some(GenesisPin {
                config_event,
                genesis_merge,
            });
            self.expected_config_hash = Some(config_event);
        } else {
            self.expected_config_hash = config_pin;
        }

        for item in self.ledger.scan_prefix(FORKED_PREFIX) {
            let (key, _) = item.map_err(|_| StoreError::Db)?;
            self.forked
                .insert(CreatorId(key[FORKED_PREFIX.len()..].to_vec()));
        }

        for item in self.events.iter() {
            let (_, value) = item.map_err(|_| StoreError::Db)?;
            let stored: StoredEvent =
                decode_canonical_limited(&value, MAX_STORED_BYTES).map_err(|_| StoreError::Codec)?;
            if !stored.meta.consensus {
                self.uncommitted.insert(stored.event.hash);
            }
            if stored.event.is_merge() {
                self.bump_head(&stored.event);
            }
            if stored.event.is_config() {
                if let Payload::Config(cfg) = &stored.event.body.payload {
                    self.configuration = Some(cfg.clone());
                }
            }
        }
        Ok(())
    }

    fn bump_head(&mut self, event: &Event) {
        let entry = (event.hash, event.body.merge_height);
        match self.heads.get(event.creator()) {
            Some((h, height))
                if (*height, *h) >= (event.body.merge_height, event.hash) => {}
            _ => {
                self.heads
                    .insert(event.creator().clone(), (entry.0, entry.1));
            }
        }
    }

    /// Pin the expected ledger id before joining an existing ledger.
    pub fn pin_ledger(&mut self, config_event: Hash256) -> Result<(), StoreError> {
        self.ledger
            .insert(KEY_CONFIG_EVENT, config_event.as_bytes().to_vec())
            .map_err(|_| StoreError::Db)?;
        self.expected_config_hash = Some(config_event);
        Ok(())
    }

    /// Whether both genesis events are present.
    pub fn genesis_ready(&self) -> bool {
        self.genesis.is_some()
    }

    /// Pinned genesis hashes, if complete.
    pub fn genesis(&self) -> Option<GenesisPin> {
        self.genesis
    }

    /// The ledger configuration, if the configuration event has arrived.
    pub fn configuration(&self) -> Option<&LedgerConfiguration> {
        self.configuration.as_ref()
    }

    /// Ledger id: the multibase hash of the configuration event.
    pub fn ledger_id(&self) -> Option<String> {
        self.expected_config_hash.map(|h| h.to_multibase())
    }

    /// Whether an event is stored.
    pub fn exists(&self, hash: &Hash256) -> Result<bool, StoreError> {
        self.events
            .contains_key(hash.as_bytes())
            .map_err(|_| StoreError::Db)
    }

    /// Fetch an event.
    pub fn get(&self, hash: &Hash256) -> Result<Option<Event>, StoreError> {
        Ok(self.get_stored(hash)?.map(|s| s.event))
    }

    /// Fetch an event together with its meta record.
    pub fn get_with_meta(&self, hash: &Hash256) -> Result<Option<(Event, EventMeta)>, StoreError> {
        Ok(self.get_stored(hash)?.map(|s| (s.event, s.meta)))
    }

    fn get_stored(&self, hash: &Hash256) -> Result<Option<StoredEvent>, StoreError> {
        let Some(bytes) = self
            .events
            .get(hash.as_bytes())
            .map_err(|_| StoreError::Db)?
        else {
            return Ok(None);
        };
        decode_canonical_limited(&bytes, MAX_STORED_BYTES)
            .map(Some)
            .map_err(|_| StoreError::Codec)
    }

    /// Latest merge event by `creator` known locally; the genesis merge if
    /// none.
    pub fn local_branch_head(&self, creator: &CreatorId) -> Result<(Hash256, u64), StoreError> {
        if let Some((hash, height)) = self.heads.get(creator) {
            return Ok((*hash, *height));
        }
        let pin = self.genesis.ok_or(StoreError::NoGenesis)?;
        Ok((pin.genesis_merge, 0))
    }

    /// Per-creator branch heads (latest merge event each).
    pub fn heads(&self) -> &BTreeMap<CreatorId, (Hash256, u64)> {
        &self.heads
    }

    /// Creators with a detected fork.
    pub fn forked_creators(&self) -> &BTreeSet<CreatorId> {
        &self.forked
    }

    /// Per-creator merge watermarks (heights already held locally), used to
    /// build gossip cursors.
    pub fn merge_watermarks(&self) -> CanonicalMap<CreatorId, u64> {
        self.heads
            .iter()
            .map(|(c, (_, height))| (c.clone(), *height))
            .collect()
    }

    /// Number of uncommitted events.
    pub fn uncommitted_len(&self) -> usize {
        self.uncommitted.len()
    }

    /// Total stored events.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Insert one event after running the validation ladder.
    pub fn insert(
        &mut self,
        event: &Event,
        origin: EventOrigin,
    ) -> Result<InsertOutcome, StoreError> {
        // Duplicates are benign regardless of origin.
        if self.exists(&event.hash)? {
            return Ok(InsertOutcome::Duplicate);
        }

        // Shape.
        event
            .validate_shape()
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        // Signature, then hash-matches-content.
        event
            .verify_signature()
            .map_err(|_| StoreError::ProtocolViolation("signed payload mismatch"))?;
        let recomputed = crate::core::event::compute_event_hash(&event.body)
            .map_err(|_| StoreError::Codec)?;
        if recomputed != event.hash {
            return Err(StoreError::ProtocolViolation("hash mismatch"));
        }

        let encoded_len = encode_canonical(event).map_err(|_| StoreError::Codec)?.len();
        if encoded_len > MAX_EVENT_BYTES {
            return Err(StoreError::Validation("event too large".into()));
        }

        if self.forked.contains(event.creator()) {
            return Err(StoreError::ProtocolViolation("creator withheld after fork"));
        }

        if event.is_genesis() {
            return self.insert_genesis(event);
        }

        // Parents must exist before anything chains on them.
        let mut parents = Vec::with_capacity(event.body.parent_hash.len());
        let mut missing = Vec::new();
        for parent_hash in &event.body.parent_hash {
            match self.get(parent_hash)? {
                Some(parent) => parents.push(parent),
                None => missing.push(*parent_hash),
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::MissingParents { hashes: missing });
        }

        self.check_tree_rules(event, &parents)?;
        self.check_merge_height(event, &parents)?;

        self.persist(event)?;
        debug!(event = %event.hash, creator = %event.creator(), ?origin, "event inserted");
        Ok(InsertOutcome::Inserted)
    }

    fn insert_genesis(&mut self, event: &Event) -> Result<InsertOutcome, StoreError> {
        match &event.body.payload {
            Payload::Config(cfg) => {
                // A configuration event is only accepted when it matches the
                // pinned ledger id; a second one is byzantine.
                let expected = self.expected_config_hash.ok_or(StoreError::LedgerMismatch)?;
                if event.hash != expected {
                    return Err(StoreError::LedgerMismatch);
                }
                self.persist(event)?;
                self.configuration = Some(cfg.clone());
                Ok(InsertOutcome::Inserted)
            }
            Payload::Merge => {
                let expected = self.expected_config_hash.ok_or(StoreError::LedgerMismatch)?;
                let config = self
                    .get(&expected)?
                    .ok_or(StoreError::MissingParents { hashes: vec![expected] })?;
                if event.body.parent_hash != [expected] {
                    return Err(StoreError::ProtocolViolation("genesis merge parent"));
                }
                if event.creator() != config.creator() {
                    return Err(StoreError::ProtocolViolation("genesis merge creator"));
                }
                if self.genesis.is_some() {
                    return Err(StoreError::ProtocolViolation("second genesis merge"));
                }
                self.persist(event)?;
                self.ledger
                    .insert(KEY_GENESIS_MERGE, event.hash.as_bytes().to_vec())
                    .map_err(|_| StoreError::Db)?;
                self.genesis = Some(GenesisPin {
                    config_event: expected,
                    genesis_merge: event.hash,
                });
                Ok(InsertOutcome::Inserted)
            }
            Payload::Operation(_) => {
                Err(StoreError::Validation("operation event without tree parent".into()))
            }
        }
    }

    fn check_tree_rules(&mut self, event: &Event, parents: &[Event]) -> Result<(), StoreError> {
        let tree_hash = event
            .body
            .tree_hash
            .ok_or(StoreError::Validation("missing tree parent".into()))?;
        let tree_parent = parents
            .iter()
            .find(|p| p.hash == tree_hash)
            .ok_or(StoreError::Validation("tree parent not among parents".into()))?;
        let genesis = self.genesis.ok_or(StoreError::NoGenesis)?;

        if event.is_merge() {
            // Tree parent must be the creator's previous merge (or genesis).
            if !tree_parent.is_merge() {
                return Err(StoreError::ProtocolViolation("tree parent not a merge"));
            }
            if tree_parent.hash != genesis.genesis_merge
                && tree_parent.creator() != event.creator()
            {
                return Err(StoreError::ProtocolViolation("tree parent by wrong creator"));
            }
            let (head, _) = self.local_branch_head(event.creator())?;
            if tree_parent.hash != head {
                // A merge chaining off an older merge forks the chain.
                self.record_fork(event.creator())?;
                return Err(StoreError::ProtocolViolation("merge chain fork"));
            }

            // Non-tree parents: merge events by other creators (one each) or
            // the creator's own regular events; never the creator's own
            // non-tree merge.
            let mut merge_creators: BTreeSet<&CreatorId> = BTreeSet::new();
            for parent in parents.iter().filter(|p| p.hash != tree_hash) {
                if parent.is_merge() {
                    if parent.creator() == event.creator() {
                        return Err(StoreError::ProtocolViolation("own merge as non-tree parent"));
                    }
                    if !merge_creators.insert(parent.creator()) {
                        return Err(StoreError::ProtocolViolation(
                            "two merge parents by one creator",
                        ));
                    }
                } else if parent.is_regular() {
                    if parent.creator() != event.creator() {
                        return Err(StoreError::ProtocolViolation(
                            "foreign regular event as parent",
                        ));
                    }
                } else {
                    return Err(StoreError::ProtocolViolation("config event as merge parent"));
                }
            }
        } else {
            // Regular event: tree parent is the previous event in the
            // creator's own chain, or the genesis merge for a fresh chain.
            if tree_parent.creator() != event.creator() && tree_parent.hash != genesis.genesis_merge
            {
                return Err(StoreError::ProtocolViolation("tree parent by wrong creator"));
            }
            if tree_parent.is_config() {
                return Err(StoreError::ProtocolViolation("config event as tree parent"));
            }
        }

        // Sibling check: a second same-kind child of the tree parent by the
        // same creator is a fork.
        let kind = event_kind(event);
        let prefix = tree_prefix(event.creator(), kind, &tree_hash);
        for item in self.tree_idx.scan_prefix(&prefix) {
            let (key, _) = item.map_err(|_| StoreError::Db)?;
            if key.len() == prefix.len() + 32 && key[prefix.len()..] != *event.hash.as_bytes() {
                self.record_fork(event.creator())?;
                return Err(StoreError::ProtocolViolation("fork detected"));
            }
        }

        // Basis monotonicity along the creator's chain.
        if event.body.basis_block_height < tree_parent.body.basis_block_height {
            return Err(StoreError::ProtocolViolation("basis height regressed"));
        }
        Ok(())
    }

    fn check_merge_height(&self, event: &Event, parents: &[Event]) -> Result<(), StoreError> {
        let expected = parents
            .iter()
            .map(|p| p.body.merge_height)
            .max()
            .unwrap_or(0)
            .saturating_add(1);
        if event.body.merge_height != expected {
            return Err(StoreError::ProtocolViolation("impossible merge height"));
        }
        Ok(())
    }

    fn record_fork(&mut self, creator: &CreatorId) -> Result<(), StoreError> {
        if self.forked.insert(creator.clone()) {
            warn!(creator = %creator, "fork detected; creator withheld");
            self.ledger
                .insert(forked_key(creator), Vec::<u8>::new())
                .map_err(|_| StoreError::Db)?;
        }
        Ok(())
    }

    fn persist(&mut self, event: &Event) -> Result<(), StoreError> {
        let now = now_ms();
        let stored = StoredEvent {
            event: event.clone(),
            meta: EventMeta {
                consensus: false,
                consensus_date: None,
                block_height: None,
                creator: event.creator().clone(),
                created: now,
                updated: now,
            },
        };
        let value = encode_canonical(&stored).map_err(|_| StoreError::Codec)?;
        let ckey = creator_key(event.creator(), event.body.merge_height, &event.hash);
        let ctag = vec![event_kind(event)];
        let tkey = event
            .body
            .tree_hash
            .map(|tree| tree_key(event.creator(), event_kind(event), &tree, &event.hash));

        (&self.events, &self.creator_idx, &self.tree_idx)
            .transaction(|(ev, ci, ti)| {
                ev.insert(event.hash.as_bytes().to_vec(), value.clone())?;
                ci.insert(ckey.clone(), ctag.clone())?;
                if let Some(tkey) = &tkey {
                    ti.insert(tkey.clone(), Vec::<u8>::new())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|_| StoreError::Db)?;

        self.uncommitted.insert(event.hash);
        if event.is_merge() {
            self.bump_head(event);
        }
        Ok(())
    }

    /// All events not yet marked consensus, with forward and backward links
    /// populated.
    pub fn recent_history(&self) -> Result<DagSlice, StoreError> {
        let mut nodes: BTreeMap<Hash256, SliceNode> = BTreeMap::new();
        for hash in &self.uncommitted {
            let Some(event) = self.get(hash)? else {
                return Err(StoreError::Db);
            };
            nodes.insert(
                *hash,
                SliceNode {
                    event,
                    parents: BTreeSet::new(),
                    children: BTreeSet::new(),
                },
            );
        }

        let hashes: Vec<Hash256> = nodes.keys().copied().collect();
        for hash in &hashes {
            let parent_hashes = nodes[hash].event.body.parent_hash.clone();
            for parent in parent_hashes {
                if nodes.contains_key(&parent) {
                    if let Some(node) = nodes.get_mut(hash) {
                        node.parents.insert(parent);
                    }
                    if let Some(parent_node) = nodes.get_mut(&parent) {
                        parent_node.children.insert(*hash);
                    }
                }
            }
        }
        Ok(DagSlice { nodes })
    }

    /// Atomically mark events as committed at `block_height`; all or none.
    pub fn mark_consensus(
        &mut self,
        hashes: &[Hash256],
        block_height: u64,
        consensus_date: u64,
    ) -> Result<(), StoreError> {
        let mut updates = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let mut stored = self.get_stored(hash)?.ok_or(StoreError::Validation(
                "cannot mark unknown event".into(),
            ))?;
            if stored.meta.consensus {
                return Err(StoreError::Validation("event already committed".into()));
            }
            stored.meta.consensus = true;
            stored.meta.consensus_date = Some(consensus_date);
            stored.meta.block_height = Some(block_height);
            stored.meta.updated = consensus_date;
            let value = encode_canonical(&stored).map_err(|_| StoreError::Codec)?;
            updates.push((*hash, value));
        }

        (&self.events, &self.consensus_idx)
            .transaction(|(ev, cx)| {
                for (hash, value) in &updates {
                    ev.insert(hash.as_bytes().to_vec(), value.clone())?;
                    cx.insert(consensus_key(block_height, hash), Vec::<u8>::new())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|_| StoreError::Db)?;

        for hash in hashes {
            self.uncommitted.remove(hash);
        }
        Ok(())
    }

    /// Merge events above the per-creator watermarks, globally ordered by
    /// `(merge_height, hash)` and capped at `limit`.
    pub fn merge_events_after(
        &self,
        watermarks: &CanonicalMap<CreatorId, u64>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let mut out: Vec<Event> = Vec::new();
        for item in self.creator_idx.iter() {
            let (key, tag) = item.map_err(|_| StoreError::Db)?;
            if tag.first() != Some(&KIND_MERGE) {
                continue;
            }
            if key.len() < 8 + 32 {
                return Err(StoreError::Codec);
            }
            let creator = CreatorId(key[..key.len() - 40].to_vec());
            let mut height_raw = [0u8; 8];
            height_raw.copy_from_slice(&key[key.len() - 40..key.len() - 32]);
            let height = u64::from_be_bytes(height_raw);
            // The genesis merge (height 0) is wanted by empty cursors too.
            let wanted = match watermarks.get(&creator) {
                Some(wm) => height > *wm,
                None => true,
            };
            if !wanted {
                continue;
            }
            let hash = decode_hash(&key[key.len() - 32..])?;
            if let Some(event) = self.get(&hash)? {
                out.push(event);
            }
        }
        out.sort_by(|a, b| {
            (a.body.merge_height, a.hash).cmp(&(b.body.merge_height, b.hash))
        });
        out.truncate(limit);
        Ok(out)
    }

    /// Latest regular event by `creator`, the tail of its operation chain.
    pub fn latest_regular(
        &self,
        creator: &CreatorId,
    ) -> Result<Option<(Hash256, u64)>, StoreError> {
        let mut last = None;
        for item in self.creator_idx.scan_prefix(&creator.0) {
            let (key, tag) = item.map_err(|_| StoreError::Db)?;
            if tag.first() != Some(&KIND_REGULAR) {
                continue;
            }
            if key.len() < 8 + 32 {
                return Err(StoreError::Codec);
            }
            let mut height_raw = [0u8; 8];
            height_raw.copy_from_slice(&key[key.len() - 40..key.len() - 32]);
            let hash = decode_hash(&key[key.len() - 32..])?;
            last = Some((hash, u64::from_be_bytes(height_raw)));
        }
        Ok(last)
    }

    /// Fetch specific events by hash, skipping unknown ones.
    pub fn get_events(&self, hashes: &[Hash256]) -> Result<Vec<Event>, StoreError> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(event) = self.get(hash)? {
                out.push(event);
            }
        }
        Ok(out)
    }

    /// Whether `ancestor` is an ancestor of `descendant` in the full DAG.
    pub fn is_ancestor(
        &self,
        ancestor: &Hash256,
        descendant: &Hash256,
    ) -> Result<bool, StoreError> {
        if ancestor == descendant {
            return Ok(false);
        }
        let Some(anc) = self.get(ancestor)? else {
            return Ok(false);
        };
        let mut visited: BTreeSet<Hash256> = BTreeSet::new();
        let mut queue: VecDeque<Hash256> = VecDeque::new();
        queue.push_back(*descendant);
        while let Some(h) = queue.pop_front() {
            if !visited.insert(h) {
                continue;
            }
            let Some(event) = self.get(&h)? else {
                continue;
            };
            for parent in &event.body.parent_hash {
                if parent == ancestor {
                    return Ok(true);
                }
                if let Some(parent_event) = self.get(parent)? {
                    // Parents sit at strictly lower merge heights (the
                    // genesis pair aside), so prune below the target.
                    if parent_event.body.merge_height >= anc.body.merge_height {
                        queue.push_back(*parent);
                    }
                }
            }
        }
        Ok(false)
    }
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, StoreError> {
    if bytes.len() != 32 {
        return Err(StoreError::Codec);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(Hash256::from_bytes(out))
}
