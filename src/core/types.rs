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

//! Deterministic core types and canonical encoding helpers.

use bincode::Options;
use ring::digest;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization")]
    Serialize,
    #[error("deserialization")]
    Deserialize,
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (deterministic).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules. Requires deterministic container ordering (use BTreeMap/BTreeSet).
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts()
        .serialize(v)
        .map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    // Fast-path cap on the raw wire payload.
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    // Cap inside the deserializer as well so container length prefixes cannot
    // request absurd allocations.
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// Multibase prefix for base58btc.
const MULTIBASE_BASE58BTC: char = 'z';
/// Multihash prefix for sha2-256 with a 32-byte digest.
const MULTIHASH_SHA2_256: [u8; 2] = [0x12, 0x20];
/// Multicodec prefix for an Ed25519 public key.
const MULTICODEC_ED25519_PUB: [u8; 2] = [0xed, 0x01];

/// 256-bit content hash (32 bytes), used for event and block hashes.
///
/// The canonical text rendering is multibase base58btc over the
/// multihash-prefixed digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// The all-zero hash, used as the previous hash of the genesis block.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Construct from raw bytes.
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    /// Return bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Multibase rendering with the sha2-256 multihash prefix.
    pub fn to_multibase(&self) -> String {
        let mut buf = Vec::with_capacity(2 + 32);
        buf.extend_from_slice(&MULTIHASH_SHA2_256);
        buf.extend_from_slice(&self.0);
        format!("{}{}", MULTIBASE_BASE58BTC, bs58::encode(buf).into_string())
    }

    /// Parse a multibase rendering produced by [`Hash256::to_multibase`].
    pub fn from_multibase(s: &str) -> Option<Self> {
        let rest = s.strip_prefix(MULTIBASE_BASE58BTC)?;
        let bytes = bs58::decode(rest).into_vec().ok()?;
        if bytes.len() != 34 || bytes[..2] != MULTIHASH_SHA2_256 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes[2..]);
        Some(Self(out))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_multibase())
    }
}

/// Creator/peer identity (Ed25519 public key bytes, expected 32).
///
/// The same identity names the producer of an event and the remote end of a
/// gossip session.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CreatorId(pub Vec<u8>);

impl CreatorId {
    /// Interpret as Ed25519 public key bytes if length is 32.
    pub fn as_public_key_bytes(&self) -> Option<[u8; 32]> {
        if self.0.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0);
        Some(out)
    }

    /// Multibase rendering with the ed25519-pub multicodec prefix.
    pub fn to_multibase(&self) -> String {
        let mut buf = Vec::with_capacity(2 + self.0.len());
        buf.extend_from_slice(&MULTICODEC_ED25519_PUB);
        buf.extend_from_slice(&self.0);
        format!("{}{}", MULTIBASE_BASE58BTC, bs58::encode(buf).into_string())
    }
}

impl fmt::Display for CreatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_multibase())
    }
}

/// Ed25519 signature bytes (expected 64).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

/// Canonical map type alias.
pub type CanonicalMap<K, V> = BTreeMap<K, V>;

/// SHA-256 content hash over already domain-tagged bytes.
pub fn content_hash(bytes: &[u8]) -> Hash256 {
    let d = digest::digest(&digest::SHA256, bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    Hash256::from_bytes(out)
}

/// Milliseconds since the UNIX epoch; 0 if the clock is unavailable.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_multibase_round_trip() {
        let h = content_hash(b"confluence");
        let s = h.to_multibase();
        assert!(s.starts_with('z'));
        assert_eq!(Hash256::from_multibase(&s), Some(h));
    }

    #[test]
    fn creator_multibase_is_stable() {
        let id = CreatorId(vec![7u8; 32]);
        assert_eq!(id.to_multibase(), id.to_multibase());
        assert_eq!(id.as_public_key_bytes(), Some([7u8; 32]));
        assert_eq!(CreatorId(vec![1, 2, 3]).as_public_key_bytes(), None);
    }

    #[test]
    fn canonical_codec_round_trip() {
        let m: CanonicalMap<String, u64> = [("a".to_string(), 1u64), ("b".to_string(), 2u64)]
            .into_iter()
            .collect();
        let bytes = encode_canonical(&m).unwrap();
        let back: CanonicalMap<String, u64> = decode_canonical_limited(&bytes, 1024).unwrap();
        assert_eq!(m, back);
        assert!(decode_canonical_limited::<CanonicalMap<String, u64>>(&bytes, 4).is_err());
    }
}
