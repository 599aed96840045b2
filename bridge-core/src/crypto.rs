//! Cryptographic operations for the bridge
//!
//! This module provides:
//! - The canonical leaf encoding and SHA-256 leaf digest
//! - The canonical (sorted) pair hash used by the Merkle tree
//! - The relay's Ed25519 identity used to authorize root registrations
//!
//! # Leaf encoding
//!
//! Seven 32-byte big-endian words, 224 bytes total:
//!
//! ```text
//! | sender | recipient | amount | nonce | source_ledger | dest_ledger | source_timestamp |
//! ```
//!
//! Addresses and integers are left-padded with zeros. Every producer and
//! consumer (both ledgers and the relay) must go through [`leaf_digest`].

use crate::types::{Address, Digest, LeafFields, LedgerId};
use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest as _, Sha256};

/// Width of one encoded word
pub const WORD_SIZE: usize = 32;

/// Width of the encoded leaf preimage
pub const LEAF_PREIMAGE_SIZE: usize = 7 * WORD_SIZE;

/// Domain tag for root-registration signatures
const ROOT_REGISTRATION_DOMAIN: &[u8] = b"bridge-root-registration";

fn address_word(addr: &Address) -> [u8; WORD_SIZE] {
    let mut word = [0u8; WORD_SIZE];
    word[WORD_SIZE - 20..].copy_from_slice(&addr.0);
    word
}

fn u128_word(value: u128) -> [u8; WORD_SIZE] {
    let mut word = [0u8; WORD_SIZE];
    word[WORD_SIZE - 16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn u64_word(value: u64) -> [u8; WORD_SIZE] {
    let mut word = [0u8; WORD_SIZE];
    word[WORD_SIZE - 8..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Encode the leaf preimage
pub fn encode_leaf(fields: &LeafFields) -> [u8; LEAF_PREIMAGE_SIZE] {
    let words = [
        address_word(&fields.sender),
        address_word(&fields.recipient),
        u128_word(fields.amount.0),
        u64_word(fields.nonce),
        u64_word(fields.source_ledger.0),
        u64_word(fields.dest_ledger.0),
        u64_word(fields.source_timestamp),
    ];

    let mut out = [0u8; LEAF_PREIMAGE_SIZE];
    for (i, word) in words.iter().enumerate() {
        out[i * WORD_SIZE..(i + 1) * WORD_SIZE].copy_from_slice(word);
    }
    out
}

/// Canonical leaf digest of a transfer
pub fn leaf_digest(fields: &LeafFields) -> Digest {
    hash_bytes(&encode_leaf(fields))
}

/// Hash two nodes after sorting them ascending
///
/// Sorting makes the proof position-free: `hash_pair(a, b) == hash_pair(b, a)`.
pub fn hash_pair(a: &Digest, b: &Digest) -> Digest {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    Digest(hasher.finalize().into())
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest(hasher.finalize().into())
}

/// Message signed to authorize a root registration
pub fn root_registration_message(ledger: LedgerId, root: &Digest, member_count: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ROOT_REGISTRATION_DOMAIN.len() + 8 + 32 + 8);
    msg.extend_from_slice(ROOT_REGISTRATION_DOMAIN);
    msg.extend_from_slice(&ledger.to_be_bytes());
    msg.extend_from_slice(root.as_bytes());
    msg.extend_from_slice(&member_count.to_be_bytes());
    msg
}

/// Ed25519 key pair of the relay
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from a hex-encoded seed
    pub fn from_hex_seed(seed_hex: &str) -> Result<Self> {
        let raw = seed_hex.strip_prefix("0x").unwrap_or(seed_hex);
        let bytes = hex::decode(raw)
            .map_err(|e| Error::Config(format!("relay key seed is not hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("relay key seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Public key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    /// Sign a root registration for `ledger`
    pub fn sign_root_registration(
        &self,
        ledger: LedgerId,
        root: &Digest,
        member_count: u64,
    ) -> [u8; 64] {
        let msg = root_registration_message(ledger, root, member_count);
        self.signing_key.sign(&msg).to_bytes()
    }
}

/// Verify a root-registration signature against the authorized relay key
pub fn verify_root_registration(
    relayer: &VerifyingKey,
    ledger: LedgerId,
    root: &Digest,
    member_count: u64,
    signature: &[u8; 64],
) -> Result<()> {
    let msg = root_registration_message(ledger, root, member_count);
    let sig = DalekSignature::from_bytes(signature);
    relayer
        .verify(&msg, &sig)
        .map_err(|e| Error::SignatureError(format!("root registration: {}", e)))
}
