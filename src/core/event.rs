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

//! The event envelope: the two DAG event variants, canonical hashing,
//! domain-separated signing, and structural validation.
//!
//! Every event is content-addressed: `hash = H(domain || canonical(body))`
//! with the signature excluded from the hash input. The signature covers a
//! distinct signing domain over the same canonical bytes, so a payload
//! cannot be replayed under the other domain.

use crate::core::security::signer::{verify_signature, NodeSigner, SignerError};
use crate::core::types::{content_hash, encode_canonical, CreatorId, Hash256, Signature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Hard cap on an encoded event envelope.
pub const MAX_EVENT_BYTES: usize = 1 << 20;
/// Cap on one opaque operation payload.
pub const MAX_OPERATION_BYTES: usize = 128 * 1024;

const EVENT_HASH_DOMAIN: &[u8] = b"Confluence-Event-Hash-v1";
const EVENT_SIG_DOMAIN: &[u8] = b"Confluence-Event-Sig-v1";

/// Event validation errors (structure and signature).
#[derive(Debug, Error)]
pub enum EventError {
    /// Creator is not a plausible public key.
    #[error("bad creator")]
    BadCreator,
    /// Parent structure violates the variant's shape rules.
    #[error("bad parents: {0}")]
    BadParents(&'static str),
    /// Merge height does not fit the variant.
    #[error("bad merge height")]
    BadMergeHeight,
    /// Payload exceeds size caps.
    #[error("payload too large")]
    PayloadTooLarge,
    /// Signature does not verify against the creator key.
    #[error("bad signature")]
    BadSignature,
    /// Canonical encoding failed.
    #[error("codec")]
    Codec,
}

impl From<SignerError> for EventError {
    fn from(_: SignerError) -> Self {
        EventError::BadSignature
    }
}

/// Ledger configuration carried by the genesis configuration event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfiguration {
    /// Human-readable ledger name.
    pub ledger_name: String,
    /// Creators eligible for witness selection.
    pub witness_pool: Vec<CreatorId>,
    /// Consensus procedure tag, e.g. `continuity-v1`.
    pub procedure: String,
}

/// Event payload variants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Ledger configuration (genesis only).
    Config(LedgerConfiguration),
    /// One opaque operation accepted from the local API.
    Operation(Vec<u8>),
    /// Merge events carry no payload.
    Merge,
}

/// The canonical (hashed and signed) portion of an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBody {
    /// Producing peer.
    pub creator: CreatorId,
    /// Payload variant.
    pub payload: Payload,
    /// Parent in the creator's own chain. `None` only for the genesis pair.
    pub tree_hash: Option<Hash256>,
    /// All parents; for regular events exactly `[tree_hash]`.
    pub parent_hash: Vec<Hash256>,
    /// Committing block height visible to the creator when emitted.
    pub basis_block_height: u64,
    /// `1 + max(parent merge heights)`; 0 for the genesis pair.
    pub merge_height: u64,
}

/// A validated event: content hash + body + detached signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Content-addressed id.
    pub hash: Hash256,
    /// Canonical body.
    pub body: EventBody,
    /// Ed25519 signature over the signing bytes.
    pub signature: Signature,
}

/// Wire form: canonical body plus detached signature; the hash is
/// recomputed on receipt and never trusted from the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Canonical body.
    pub body: EventBody,
    /// Detached signature.
    pub signature: Signature,
}

/// Node-local bookkeeping attached to a stored event. Never hashed or
/// gossiped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Whether the event reached consensus.
    pub consensus: bool,
    /// When consensus was recorded locally (ms).
    pub consensus_date: Option<u64>,
    /// Block height the event committed at.
    pub block_height: Option<u64>,
    /// Denormalized creator for index scans.
    pub creator: CreatorId,
    /// Local insert time (ms).
    pub created: u64,
    /// Last local update time (ms).
    pub updated: u64,
}

/// Hash input for a body.
fn hash_bytes(body: &EventBody) -> Result<Vec<u8>, EventError> {
    let canonical = encode_canonical(body).map_err(|_| EventError::Codec)?;
    let mut out = Vec::with_capacity(EVENT_HASH_DOMAIN.len() + canonical.len());
    out.extend_from_slice(EVENT_HASH_DOMAIN);
    out.extend_from_slice(&canonical);
    Ok(out)
}

/// Signing input for a body.
pub fn signing_bytes(body: &EventBody) -> Result<Vec<u8>, EventError> {
    let canonical = encode_canonical(body).map_err(|_| EventError::Codec)?;
    let mut out = Vec::with_capacity(EVENT_SIG_DOMAIN.len() + canonical.len());
    out.extend_from_slice(EVENT_SIG_DOMAIN);
    out.extend_from_slice(&canonical);
    Ok(out)
}

/// Content hash of a body.
pub fn compute_event_hash(body: &EventBody) -> Result<Hash256, EventError> {
    Ok(content_hash(&hash_bytes(body)?))
}

impl Event {
    /// Hash and sign a body.
    pub fn from_body(body: EventBody, signer: &NodeSigner) -> Result<Self, EventError> {
        let hash = compute_event_hash(&body)?;
        let signature = signer.sign(&signing_bytes(&body)?);
        Ok(Self { hash, body, signature })
    }

    /// The producing peer.
    pub fn creator(&self) -> &CreatorId {
        &self.body.creator
    }

    /// Whether this is a merge event.
    pub fn is_merge(&self) -> bool {
        matches!(self.body.payload, Payload::Merge)
    }

    /// Whether this is a regular (operation) event.
    pub fn is_regular(&self) -> bool {
        matches!(self.body.payload, Payload::Operation(_))
    }

    /// Whether this is the configuration event.
    pub fn is_config(&self) -> bool {
        matches!(self.body.payload, Payload::Config(_))
    }

    /// Whether this is one of the two genesis events.
    pub fn is_genesis(&self) -> bool {
        self.body.tree_hash.is_none()
    }

    /// Wire form.
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            body: self.body.clone(),
            signature: self.signature.clone(),
        }
    }

    /// Verify the detached signature against the creator key.
    pub fn verify_signature(&self) -> Result<(), EventError> {
        let msg = signing_bytes(&self.body)?;
        verify_signature(&self.body.creator, &msg, &self.signature)
            .map_err(|_| EventError::BadSignature)
    }

    /// Structural validation; cheap, no store access.
    pub fn validate_shape(&self) -> Result<(), EventError> {
        let body = &self.body;
        if body.creator.as_public_key_bytes().is_none() {
            return Err(EventError::BadCreator);
        }

        let unique: BTreeSet<&Hash256> = body.parent_hash.iter().collect();
        if unique.len() != body.parent_hash.len() {
            return Err(EventError::BadParents("duplicate parent"));
        }

        match &body.payload {
            Payload::Config(_) => {
                // Configuration event: root of the ledger, no parents.
                if body.tree_hash.is_some() || !body.parent_hash.is_empty() {
                    return Err(EventError::BadParents("config event must have no parents"));
                }
                if body.merge_height != 0 || body.basis_block_height != 0 {
                    return Err(EventError::BadMergeHeight);
                }
            }
            Payload::Operation(op) => {
                if op.len() > MAX_OPERATION_BYTES {
                    return Err(EventError::PayloadTooLarge);
                }
                let tree = body
                    .tree_hash
                    .ok_or(EventError::BadParents("regular event requires a tree parent"))?;
                if body.parent_hash.as_slice() != [tree] {
                    return Err(EventError::BadParents(
                        "regular event parents must equal [tree_hash]",
                    ));
                }
                if body.merge_height == 0 {
                    return Err(EventError::BadMergeHeight);
                }
            }
            Payload::Merge => match body.tree_hash {
                // Genesis merge: single parent (the configuration event).
                None => {
                    if body.parent_hash.len() != 1 {
                        return Err(EventError::BadParents(
                            "genesis merge must have exactly one parent",
                        ));
                    }
                    if body.merge_height != 0 || body.basis_block_height != 0 {
                        return Err(EventError::BadMergeHeight);
                    }
                }
                Some(tree) => {
                    if body.parent_hash.len() < 2 {
                        return Err(EventError::BadParents("merge requires >= 2 parents"));
                    }
                    if !body.parent_hash.contains(&tree) {
                        return Err(EventError::BadParents("tree parent missing from parents"));
                    }
                    if body.merge_height == 0 {
                        return Err(EventError::BadMergeHeight);
                    }
                }
            },
        }
        Ok(())
    }
}

impl EventEnvelope {
    /// Recompute the content hash and promote to an [`Event`].
    ///
    /// Only the hash is recomputed here; shape and signature checks run in
    /// the store's validation ladder.
    pub fn into_event(self) -> Result<Event, EventError> {
        let hash = compute_event_hash(&self.body)?;
        Ok(Event {
            hash,
            body: self.body,
            signature: self.signature,
        })
    }
}

/// Build the genesis pair: the configuration event and the genesis merge.
///
/// The ledger id is the multibase hash of the returned configuration event.
pub fn genesis_pair(
    signer: &NodeSigner,
    config: LedgerConfiguration,
) -> Result<(Event, Event), EventError> {
    let creator = signer.creator_id();

    let config_event = Event::from_body(
        EventBody {
            creator: creator.clone(),
            payload: Payload::Config(config),
            tree_hash: None,
            parent_hash: Vec::new(),
            basis_block_height: 0,
            merge_height: 0,
        },
        signer,
    )?;

    let genesis_merge = Event::from_body(
        EventBody {
            creator,
            payload: Payload::Merge,
            tree_hash: None,
            parent_hash: vec![config_event.hash],
            basis_block_height: 0,
            merge_height: 0,
        },
        signer,
    )?;

    Ok((config_event, genesis_merge))
}

/// Build a regular (operation) event chained onto the creator's own chain.
pub fn new_regular(
    signer: &NodeSigner,
    operation: Vec<u8>,
    tree_hash: Hash256,
    tree_merge_height: u64,
    basis_block_height: u64,
) -> Result<Event, EventError> {
    if operation.len() > MAX_OPERATION_BYTES {
        return Err(EventError::PayloadTooLarge);
    }
    Event::from_body(
        EventBody {
            creator: signer.creator_id(),
            payload: Payload::Operation(operation),
            tree_hash: Some(tree_hash),
            parent_hash: vec![tree_hash],
            basis_block_height,
            merge_height: tree_merge_height.saturating_add(1),
        },
        signer,
    )
}

/// Build a merge event joining the creator's tree head with other parents.
///
/// `others` are (hash, merge_height) pairs; parent ordering in the body is
/// deterministic (tree parent first, then ascending by hash).
pub fn new_merge(
    signer: &NodeSigner,
    tree: (Hash256, u64),
    others: &[(Hash256, u64)],
    basis_block_height: u64,
) -> Result<Event, EventError> {
    let (tree_hash, tree_height) = tree;
    let mut sorted: Vec<(Hash256, u64)> = others.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut parent_hash = Vec::with_capacity(1 + sorted.len());
    parent_hash.push(tree_hash);
    parent_hash.extend(sorted.iter().map(|(h, _)| *h));

    let max_parent_height = sorted
        .iter()
        .map(|(_, h)| *h)
        .fold(tree_height, u64::max);

    Event::from_body(
        EventBody {
            creator: signer.creator_id(),
            payload: Payload::Merge,
            tree_hash: Some(tree_hash),
            parent_hash,
            basis_block_height,
            merge_height: max_parent_height.saturating_add(1),
        },
        signer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(creator: &CreatorId) -> LedgerConfiguration {
        LedgerConfiguration {
            ledger_name: "test".into(),
            witness_pool: vec![creator.clone()],
            procedure: "continuity-v1".into(),
        }
    }

    #[test]
    fn genesis_pair_validates() {
        let signer = NodeSigner::ephemeral().unwrap();
        let (config, merge) = genesis_pair(&signer, test_config(&signer.creator_id())).unwrap();
        config.validate_shape().unwrap();
        merge.validate_shape().unwrap();
        config.verify_signature().unwrap();
        merge.verify_signature().unwrap();
        assert_eq!(merge.body.parent_hash, vec![config.hash]);
        assert!(merge.is_genesis() && merge.is_merge());
    }

    #[test]
    fn envelope_round_trip_preserves_hash() {
        let signer = NodeSigner::ephemeral().unwrap();
        let (_, merge) = genesis_pair(&signer, test_config(&signer.creator_id())).unwrap();
        let event = merge.envelope().into_event().unwrap();
        assert_eq!(event, merge);
    }

    #[test]
    fn regular_event_shape() {
        let signer = NodeSigner::ephemeral().unwrap();
        let tree = content_hash(b"tree");
        let ev = new_regular(&signer, b"op".to_vec(), tree, 0, 0).unwrap();
        ev.validate_shape().unwrap();
        assert_eq!(ev.body.merge_height, 1);
        assert_eq!(ev.body.parent_hash, vec![tree]);

        // Tampering with parents breaks the shape.
        let mut bad = ev.clone();
        bad.body.parent_hash.push(content_hash(b"other"));
        assert!(bad.validate_shape().is_err());
    }

    #[test]
    fn merge_event_shape_and_height() {
        let signer = NodeSigner::ephemeral().unwrap();
        let tree = (content_hash(b"tree"), 3u64);
        let others = vec![(content_hash(b"a"), 5u64), (content_hash(b"b"), 2u64)];
        let ev = new_merge(&signer, tree, &others, 1).unwrap();
        ev.validate_shape().unwrap();
        assert_eq!(ev.body.merge_height, 6);
        assert_eq!(ev.body.parent_hash.len(), 3);
        assert_eq!(ev.body.parent_hash[0], tree.0);

        let mut bad = ev.clone();
        bad.body.tree_hash = Some(content_hash(b"elsewhere"));
        assert!(matches!(bad.validate_shape(), Err(EventError::BadParents(_))));
    }

    #[test]
    fn signature_covers_body() {
        let signer = NodeSigner::ephemeral().unwrap();
        let tree = content_hash(b"tree");
        let ev = new_regular(&signer, b"op".to_vec(), tree, 0, 0).unwrap();
        ev.verify_signature().unwrap();

        let mut bad = ev;
        bad.body.basis_block_height = 9;
        assert!(bad.verify_signature().is_err());
    }
}
