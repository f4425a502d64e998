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

//! Node signer: file-backed Ed25519 keys.
//!
//! The key file is PKCS#8, written atomically (tmp + rename) with 0600
//! permissions. The public key doubles as the node's [`CreatorId`].

use crate::core::types::{CreatorId, Signature};
use ring::{
    rand::SystemRandom,
    signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519},
};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;

const KEY_FILE: &str = "node.key";

/// Signer errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("io")]
    Io,
    #[error("invalid key encoding")]
    InvalidKey,
    #[error("crypto")]
    Crypto,
    #[error("bad signature")]
    BadSignature,
}

/// Persist private key material: owner-only file created under a scratch
/// name, fsynced, then renamed over the final path so readers never see a
/// half-written key.
fn write_key_file(path: &Path, bytes: &[u8]) -> Result<(), SignerError> {
    let dir = path.parent().ok_or(SignerError::Io)?;
    fs::create_dir_all(dir).map_err(|_| SignerError::Io)?;

    let scratch = path.with_extension("partial");
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        // 0600 from the first byte; never readable by group/other.
        options.mode(0o600);
    }

    let mut file = options.open(&scratch).map_err(|_| SignerError::Io)?;
    file.write_all(bytes).map_err(|_| SignerError::Io)?;
    file.sync_all().map_err(|_| SignerError::Io)?;
    drop(file);

    fs::rename(&scratch, path).map_err(|_| SignerError::Io)
}

/// File-backed Ed25519 node signer.
pub struct NodeSigner {
    keypair: Ed25519KeyPair,
}

impl NodeSigner {
    /// Load an existing key from `data_dir/node.key`, or create and persist
    /// a new one.
    pub fn load_or_create(data_dir: impl AsRef<Path>) -> Result<Self, SignerError> {
        let path: PathBuf = data_dir.as_ref().join(KEY_FILE);

        if path.exists() {
            let bytes = fs::read(&path).map_err(|_| SignerError::Io)?;
            let keypair =
                Ed25519KeyPair::from_pkcs8(&bytes).map_err(|_| SignerError::InvalidKey)?;
            return Ok(Self { keypair });
        }

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| SignerError::Crypto)?;
        write_key_file(&path, pkcs8.as_ref())?;

        let keypair =
            Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| SignerError::InvalidKey)?;
        Ok(Self { keypair })
    }

    /// In-memory signer with a fresh random key. Nothing is persisted.
    pub fn ephemeral() -> Result<Self, SignerError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| SignerError::Crypto)?;
        let keypair =
            Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| SignerError::InvalidKey)?;
        Ok(Self { keypair })
    }

    /// Public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        let pk = self.keypair.public_key().as_ref();
        let mut out = [0u8; 32];
        out.copy_from_slice(pk);
        out
    }

    /// The node identity derived from the public key.
    pub fn creator_id(&self) -> CreatorId {
        CreatorId(self.public_key().to_vec())
    }

    /// Sign message bytes.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.keypair.sign(msg).as_ref().to_vec())
    }
}

/// Verify a detached signature against a creator identity.
pub fn verify_signature(
    creator: &CreatorId,
    msg: &[u8],
    sig: &Signature,
) -> Result<(), SignerError> {
    let pk_bytes = creator.as_public_key_bytes().ok_or(SignerError::InvalidKey)?;
    // ring requires signature length 64 for Ed25519.
    if sig.0.len() != 64 {
        return Err(SignerError::BadSignature);
    }
    let pk = UnparsedPublicKey::new(&ED25519, pk_bytes);
    pk.verify(msg, &sig.0).map_err(|_| SignerError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let signer = NodeSigner::ephemeral().unwrap();
        let sig = signer.sign(b"hello");
        verify_signature(&signer.creator_id(), b"hello", &sig).unwrap();
        assert!(verify_signature(&signer.creator_id(), b"tampered", &sig).is_err());
    }

    #[test]
    fn load_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = NodeSigner::load_or_create(dir.path()).unwrap();
        let b = NodeSigner::load_or_create(dir.path()).unwrap();
        assert_eq!(a.public_key(), b.public_key());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let _ = NodeSigner::load_or_create(dir.path()).unwrap();
        let meta = fs::metadata(dir.path().join("node.key")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
