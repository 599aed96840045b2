//! Merkle tree for cross-ledger inclusion proofs
//!
//! # Design
//!
//! - Binary Merkle tree with SHA-256 hashing
//! - Canonical pairing: the two children are sorted ascending before hashing,
//!   so a proof is just the ordered list of sibling digests (no left/right bits)
//! - Odd levels promote the unpaired last node unchanged to the next level;
//!   that level contributes no sibling to its proof
//! - A single-leaf tree has root == leaf and an empty proof
//! - An empty batch is an error, never a zero root
//!
//! Sorting means a proof does not bind the leaf's position, only membership.

use crate::crypto::hash_pair;
use crate::types::Digest;
use crate::{Error, Result};
use std::collections::HashMap;

/// Merkle tree over an ordered batch of leaf digests
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// All levels, leaves first; the last level holds only the root
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build tree from leaves
    pub fn build(leaves: &[Digest]) -> Result<Self> {
        if leaves.is_empty() {
            return Err(Error::EmptyTree);
        }

        let mut levels = vec![leaves.to_vec()];

        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let next: Vec<Digest> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    // Promote unpaired node
                    [single] => *single,
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next);
        }

        Ok(Self { levels })
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    /// Always false: an empty tree cannot be built
    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    /// Leaf digests in batch order
    pub fn leaves(&self) -> &[Digest] {
        &self.levels[0]
    }

    /// Merkle root
    pub fn root(&self) -> Digest {
        self.levels[self.levels.len() - 1][0]
    }

    /// Position of the first occurrence of `leaf`
    pub fn position(&self, leaf: &Digest) -> Option<usize> {
        self.levels[0].iter().position(|l| l == leaf)
    }

    /// Inclusion proof for the leaf at `index`, ordered leaf to root
    pub fn proof_at(&self, index: usize) -> Result<Vec<Digest>> {
        if index >= self.len() {
            return Err(Error::LeafNotFound(format!(
                "index {} out of bounds ({})",
                index,
                self.len()
            )));
        }

        let mut siblings = Vec::with_capacity(self.levels.len());
        let mut idx = index;

        // Walk up the tree, collecting siblings
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = idx ^ 1;
            if sibling < level.len() {
                siblings.push(level[sibling]);
            }
            idx /= 2;
        }

        Ok(siblings)
    }

    /// Inclusion proof for `leaf` (first occurrence)
    pub fn proof(&self, leaf: &Digest) -> Result<Vec<Digest>> {
        let index = self
            .position(leaf)
            .ok_or_else(|| Error::LeafNotFound(leaf.to_string()))?;
        self.proof_at(index)
    }
}

/// Root of a batch of leaves
pub fn build_root(leaves: &[Digest]) -> Result<Digest> {
    Ok(MerkleTree::build(leaves)?.root())
}

/// Inclusion proof of `leaf` within `leaves`
pub fn build_proof(leaves: &[Digest], leaf: &Digest) -> Result<Vec<Digest>> {
    MerkleTree::build(leaves)?.proof(leaf)
}

/// Fold `leaf` through `proof` with canonical pairing
pub fn compute_root(leaf: &Digest, proof: &[Digest]) -> Digest {
    proof
        .iter()
        .fold(*leaf, |current, sibling| hash_pair(&current, sibling))
}

/// Verify an inclusion proof against a root
pub fn verify(leaf: &Digest, proof: &[Digest], root: &Digest) -> bool {
    compute_root(leaf, proof) == *root
}

/// Verify many (leaf, proof) pairs against one root
///
/// Interior nodes shared between proofs are hashed once. The result for each
/// item is exactly what [`verify`] returns for it.
pub fn verify_batch(root: &Digest, items: &[(Digest, Vec<Digest>)]) -> Vec<bool> {
    let mut memo: HashMap<(Digest, Digest), Digest> = HashMap::new();

    items
        .iter()
        .map(|(leaf, proof)| {
            let mut current = *leaf;
            for sibling in proof {
                let key = if current <= *sibling {
                    (current, *sibling)
                } else {
                    (*sibling, current)
                };
                current = *memo
                    .entry(key)
                    .or_insert_with(|| hash_pair(&key.0, &key.1));
            }
            current == *root
        })
        .collect()
}

/// True iff every item verifies
pub fn verify_all(root: &Digest, items: &[(Digest, Vec<Digest>)]) -> bool {
    verify_batch(root, items).into_iter().all(|ok| ok)
}
