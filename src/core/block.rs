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

//! Blocks and the sled-backed block store.
//!
//! A block is the ordered set of event hashes decided at one height plus
//! the consensus proof (the Y-events that closed the decision). The block
//! hash covers only deterministic content, so honest nodes at the same
//! height produce identical hashes.

use crate::core::types::{content_hash, decode_canonical_limited, encode_canonical, Hash256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BLOCK_HASH_DOMAIN: &[u8] = b"Confluence-Block-Hash-v1";
const MAX_BLOCK_BYTES: usize = 4 << 20;

const TREE_BLOCKS: &str = "blocks";
const KEY_LATEST: &[u8] = b"latest";

/// Block store errors.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("db io")]
    Db,
    #[error("codec")]
    Codec,
    #[error("block does not extend the chain")]
    ChainMismatch,
    #[error("block not found")]
    NotFound,
}

/// Deterministic block content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    /// Height in the chain; genesis is 0.
    pub height: u64,
    /// Hash of the previous block; zero for genesis.
    pub previous_hash: Hash256,
    /// Ordered consensus-committed event hashes.
    pub event_hashes: Vec<Hash256>,
    /// Merge events whose mutual support decided this block.
    pub consensus_proof: Vec<Hash256>,
}

/// A block: content hash + body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Content-addressed id.
    pub hash: Hash256,
    /// Deterministic body.
    pub body: BlockBody,
}

impl Block {
    /// Hash a body into a block.
    ///
    /// The hash covers height, parent, and the ordered event set. The
    /// consensus proof is excluded: it is this node's evidence for the
    /// decision, and honest nodes may hold different (equally valid) vote
    /// subsets for the same block.
    pub fn from_body(body: BlockBody) -> Result<Self, BlockError> {
        let canonical =
            encode_canonical(&(body.height, body.previous_hash, &body.event_hashes))
                .map_err(|_| BlockError::Codec)?;
        let mut input = Vec::with_capacity(BLOCK_HASH_DOMAIN.len() + canonical.len());
        input.extend_from_slice(BLOCK_HASH_DOMAIN);
        input.extend_from_slice(&canonical);
        Ok(Self {
            hash: content_hash(&input),
            body,
        })
    }

    /// Height accessor.
    pub fn height(&self) -> u64 {
        self.body.height
    }
}

/// sled-backed append-only block chain.
#[derive(Clone)]
pub struct BlockStore {
    tree: sled::Tree,
}

impl BlockStore {
    /// Open the block tree in an already-opened database.
    pub fn open(db: &sled::Db) -> Result<Self, BlockError> {
        let tree = db.open_tree(TREE_BLOCKS).map_err(|_| BlockError::Db)?;
        Ok(Self { tree })
    }

    fn height_key(height: u64) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = b'h';
        key[1..].copy_from_slice(&height.to_be_bytes());
        key
    }

    /// Append the genesis block. Fails if the chain already has blocks.
    pub fn append_genesis(
        &self,
        config_event: Hash256,
        genesis_merge: Hash256,
    ) -> Result<Block, BlockError> {
        if self.latest_height()?.is_some() {
            return Err(BlockError::ChainMismatch);
        }
        let block = Block::from_body(BlockBody {
            height: 0,
            previous_hash: Hash256::ZERO,
            event_hashes: vec![config_event, genesis_merge],
            consensus_proof: vec![genesis_merge],
        })?;
        self.put(&block)?;
        Ok(block)
    }

    /// Append a block; it must extend the current chain head.
    pub fn append(&self, block: &Block) -> Result<(), BlockError> {
        let latest = self.latest()?.ok_or(BlockError::ChainMismatch)?;
        if block.body.height != latest.body.height + 1
            || block.body.previous_hash != latest.hash
        {
            return Err(BlockError::ChainMismatch);
        }
        // Recompute the hash; never trust the caller's.
        let recomputed = Block::from_body(block.body.clone())?;
        if recomputed.hash != block.hash {
            return Err(BlockError::ChainMismatch);
        }
        self.put(block)
    }

    fn put(&self, block: &Block) -> Result<(), BlockError> {
        let bytes = encode_canonical(block).map_err(|_| BlockError::Codec)?;
        self.tree
            .insert(Self::height_key(block.body.height), bytes)
            .map_err(|_| BlockError::Db)?;
        self.tree
            .insert(KEY_LATEST, &block.body.height.to_be_bytes())
            .map_err(|_| BlockError::Db)?;
        Ok(())
    }

    /// Fetch a block by height.
    pub fn get(&self, height: u64) -> Result<Option<Block>, BlockError> {
        let Some(bytes) = self
            .tree
            .get(Self::height_key(height))
            .map_err(|_| BlockError::Db)?
        else {
            return Ok(None);
        };
        let block = decode_canonical_limited(&bytes, MAX_BLOCK_BYTES)
            .map_err(|_| BlockError::Codec)?;
        Ok(Some(block))
    }

    /// Height of the chain head, if any.
    pub fn latest_height(&self) -> Result<Option<u64>, BlockError> {
        let Some(bytes) = self.tree.get(KEY_LATEST).map_err(|_| BlockError::Db)? else {
            return Ok(None);
        };
        if bytes.len() != 8 {
            return Err(BlockError::Codec);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(Some(u64::from_be_bytes(raw)))
    }

    /// The chain head, if any.
    pub fn latest(&self) -> Result<Option<Block>, BlockError> {
        match self.latest_height()? {
            None => Ok(None),
            Some(h) => self.get(h)?.ok_or(BlockError::NotFound).map(Some),
        }
    }
}
