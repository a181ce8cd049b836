/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Ed25519 keys as the library uses them: a [`Keypair`] wrapper around the signing key this
//! process signs its log with, and a [`PublicKeyStore`] mapping node ids to the verifying keys
//! used to check peers' signature chains.
//!
//! Key files are raw byte files: 32 bytes of signing-key seed for the private key, and one
//! `<node_id>.pub` file of 32 verifying-key bytes per node in the public-key directory.

use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use crate::types::basic::{NodeId, SignatureBytes};

/// The signing identity of this process.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Load a signing key from a raw 32-byte seed file.
    pub fn from_file(path: &Path) -> Result<Keypair, KeyLoadError> {
        let bytes = fs::read(path).map_err(|source| KeyLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyLoadError::MalformedKey {
                path: path.to_path_buf(),
            })?;
        Ok(Keypair(SigningKey::from_bytes(&seed)))
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        use ed25519_dalek::Signer;
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    /// Upper bound on the size of a signature produced by this keypair, in bytes.
    pub const fn max_signature_size(&self) -> usize {
        64
    }
}

/// Verifying keys of every node in the cluster, keyed by node id.
#[derive(Clone, Default)]
pub struct PublicKeyStore {
    keys: HashMap<NodeId, VerifyingKey>,
}

impl PublicKeyStore {
    pub fn new() -> PublicKeyStore {
        PublicKeyStore {
            keys: HashMap::new(),
        }
    }

    /// Load every `<node_id>.pub` file in `dir`. Files whose stem does not parse as a node id
    /// are rejected rather than skipped, since a missing key silently pins the verified
    /// watermark.
    pub fn from_dir(dir: &Path) -> Result<PublicKeyStore, KeyLoadError> {
        let mut store = PublicKeyStore::new();
        let entries = fs::read_dir(dir).map_err(|source| KeyLoadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| KeyLoadError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.extension().map(|ext| ext != "pub").unwrap_or(true) {
                continue;
            }
            let node_id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
                .map(NodeId::new)
                .ok_or_else(|| KeyLoadError::MalformedKey { path: path.clone() })?;
            let bytes = fs::read(&path).map_err(|source| KeyLoadError::Io {
                path: path.clone(),
                source,
            })?;
            let key_bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyLoadError::MalformedKey { path: path.clone() })?;
            let key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| KeyLoadError::MalformedKey { path })?;
            store.insert(node_id, key);
        }
        Ok(store)
    }

    pub fn insert(&mut self, node: NodeId, key: VerifyingKey) {
        self.keys.insert(node, key);
    }

    pub fn get(&self, node: NodeId) -> Option<&VerifyingKey> {
        self.keys.get(&node)
    }

    /// Verify `signature` over `message` against `node`'s key. An unknown node verifies as
    /// false.
    pub fn verify(&self, node: NodeId, message: &[u8], signature: &SignatureBytes) -> bool {
        match self.keys.get(&node) {
            Some(key) => {
                let signature = Signature::from_bytes(&signature.bytes());
                key.verify(message, &signature).is_ok()
            }
            None => false,
        }
    }
}

/// Why a key file could not be loaded.
#[derive(Debug)]
pub enum KeyLoadError {
    Io { path: PathBuf, source: io::Error },
    MalformedKey { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn signatures_verify_under_the_matching_key() {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng {}));
        let mut store = PublicKeyStore::new();
        store.insert(NodeId::new(1), keypair.verifying_key());

        let signature = keypair.sign(b"record bytes");
        assert!(store.verify(NodeId::new(1), b"record bytes", &signature));
        assert!(!store.verify(NodeId::new(1), b"other bytes", &signature));
        assert!(!store.verify(NodeId::new(2), b"record bytes", &signature));
    }
}
