//! Signing identities: per-name Ed25519 keys and signature checks.
//!
//! A [`KeyChain`] holds one signing key per identity name. Producers sign
//! under their producer prefix, the rendezvous service under its rendezvous
//! prefix. Key chains persist as JSON next to the rest of the node state.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SecurityError;
use crate::name::Name;
use crate::packet::{Response, SignatureInfo};

/// Produces signatures on behalf of named identities.
pub trait Signer: Send + Sync {
    /// Sign `data` under `identity`. Fails if the identity is unknown.
    fn sign(&self, data: &[u8], identity: &Name) -> Result<SignatureInfo, SecurityError>;
}

/// Ed25519 keys indexed by identity name.
#[derive(Default)]
pub struct KeyChain {
    keys: BTreeMap<Name, SigningKey>,
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    identity: Name,
    secret_key: String,
}

#[derive(Serialize, Deserialize)]
struct StoredKeyChain {
    keys: Vec<StoredKey>,
}

impl KeyChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a key for `identity` unless one exists. Returns its public key.
    pub fn create_identity(&mut self, identity: &Name) -> VerifyingKey {
        self.keys
            .entry(identity.clone())
            .or_insert_with(|| SigningKey::from_bytes(&rand::random::<[u8; 32]>()))
            .verifying_key()
    }

    /// Install an existing key, replacing any previous key for `identity`.
    pub fn insert(&mut self, identity: Name, key: SigningKey) {
        self.keys.insert(identity, key);
    }

    pub fn public_key(&self, identity: &Name) -> Option<VerifyingKey> {
        self.keys.get(identity).map(SigningKey::verifying_key)
    }

    pub fn public_key_hex(&self, identity: &Name) -> Option<String> {
        self.public_key(identity).map(|k| hex::encode(k.to_bytes()))
    }

    /// Short fingerprint used in logs.
    pub fn key_id(&self, identity: &Name) -> Option<String> {
        self.public_key(identity).map(|k| key_fingerprint(&k))
    }

    pub fn identities(&self) -> impl Iterator<Item = &Name> {
        self.keys.keys()
    }

    pub fn contains(&self, identity: &Name) -> bool {
        self.keys.contains_key(identity)
    }

    /// Save the key chain to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), SecurityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SecurityError::Storage(format!("Failed to create directory: {e}")))?;
        }
        let stored = StoredKeyChain {
            keys: self
                .keys
                .iter()
                .map(|(identity, key)| StoredKey {
                    identity: identity.clone(),
                    secret_key: hex::encode(key.to_bytes()),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| SecurityError::Storage(format!("Failed to serialize key chain: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| SecurityError::Storage(format!("Failed to write key chain: {e}")))
    }

    /// Load a key chain from a JSON file.
    pub fn load(path: &Path) -> Result<Self, SecurityError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            SecurityError::Storage(format!("Cannot read key chain {}: {e}", path.display()))
        })?;
        let stored: StoredKeyChain = serde_json::from_str(&data)
            .map_err(|e| SecurityError::Storage(format!("Corrupt key chain: {e}")))?;

        let mut chain = Self::new();
        for entry in stored.keys {
            let bytes: [u8; 32] = hex::decode(&entry.secret_key)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| SecurityError::InvalidKey {
                    identity: entry.identity.clone(),
                    reason: "expected 32 hex-encoded bytes".to_string(),
                })?;
            chain.insert(entry.identity, SigningKey::from_bytes(&bytes));
        }
        Ok(chain)
    }

    /// Load the key chain at `path` (or start empty if it does not exist),
    /// create any of `identities` that are missing, and persist the result
    /// when something was added.
    pub fn load_or_create(path: &Path, identities: &[Name]) -> Result<Self, SecurityError> {
        let mut chain = if path.exists() {
            Self::load(path)?
        } else {
            Self::new()
        };

        let mut created = false;
        for identity in identities {
            if !chain.contains(identity) {
                chain.create_identity(identity);
                tracing::info!("Created signing key for {identity}");
                created = true;
            }
        }
        if created {
            chain.save_to_file(path)?;
        }
        Ok(chain)
    }
}

impl Signer for KeyChain {
    fn sign(&self, data: &[u8], identity: &Name) -> Result<SignatureInfo, SecurityError> {
        use ed25519_dalek::Signer as _;

        let key = self
            .keys
            .get(identity)
            .ok_or_else(|| SecurityError::UnknownIdentity(identity.clone()))?;
        let signed_at = Utc::now();
        let bytes = SignatureInfo::signable_bytes(data, identity, signed_at);
        Ok(SignatureInfo {
            key_locator: identity.clone(),
            signed_at,
            value: key.sign(&bytes).to_bytes().to_vec(),
        })
    }
}

/// Parse a hex-encoded Ed25519 public key.
pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey, String> {
    let bytes: [u8; 32] = hex::decode(encoded.trim())
        .map_err(|e| format!("invalid hex: {e}"))?
        .try_into()
        .map_err(|_| "expected 32 bytes".to_string())?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| format!("invalid key: {e}"))
}

/// Short hex fingerprint of a public key.
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    hex::encode(&digest[..8])
}

/// Check `signature` over `portion` against `key`.
pub fn verify_signature(portion: &[u8], signature: &SignatureInfo, key: &VerifyingKey) -> bool {
    let Ok(sig) = Signature::from_slice(&signature.value) else {
        return false;
    };
    let bytes = SignatureInfo::signable_bytes(portion, &signature.key_locator, signature.signed_at);
    key.verify(&bytes, &sig).is_ok()
}

/// Check a response signature against `key`. Unsigned responses fail.
pub fn verify_response(response: &Response, key: &VerifyingKey) -> bool {
    match (&response.signature, response.signed_portion()) {
        (Some(signature), Ok(portion)) => verify_signature(&portion, signature, key),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
