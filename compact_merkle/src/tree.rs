//! The [`MerkleTree`] type and its operations.

use std::collections::{BTreeMap, HashMap};

use ethereum_types::H256;
use log::trace;
use thiserror::Error;

use crate::{
    hashing::{leaf_hash, mix_in_count, pair_hash},
    proof::{peak_positions, tree_height, AppendProof, MultiProof, SizeProof},
};

/// Stores the result of tree operations. Returns a [`TreeError`] upon
/// failure.
pub type TreeResult<T> = Result<T, TreeError>;

/// An error type for tree operations.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum TreeError {
    /// The element at this index is not materialised in a partial tree.
    #[error("element {0} is not present in this (partial) tree")]
    MissingElement(u64),

    /// An index was past the end of the tree.
    #[error("index {index} is out of bounds for a tree of {count} elements")]
    IndexOutOfBounds {
        /// The offending index.
        index: u64,
        /// The tree's element count.
        count: u64,
    },

    /// A compact proof failed structural validation.
    #[error("malformed compact proof: {0}")]
    MalformedProof(&'static str),

    /// An append was requested with no elements.
    #[error("attempted to append zero elements")]
    EmptyAppend,
}

/// Number of nodes at `level` of a tree with `count` leaves. Level 0 is the
/// leaves; each level above halves, rounding up (the lone last node of an
/// odd level is promoted).
pub(crate) fn level_len(count: u64, level: u32) -> u64 {
    let mut len = count;
    for _ in 0..level {
        len = (len + 1) / 2;
    }
    len
}

/// An append-only, unbalanced Merkle tree over byte blobs.
///
/// Pairing is positional (unsorted) and a lone node at the end of a level
/// is promoted unchanged. The committed [`root`](Self::root) of a
/// non-empty tree is `keccak(count ‖ element_root)`; the empty tree's root
/// is all zeroes.
///
/// A tree is *partial* when it was rebuilt from an append proof: elements
/// preceding the append are carried only as the subtree hashes the proof
/// supplied. A partial tree derives the same root as its full counterpart
/// and supports appends and proofs over its materialised suffix.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MerkleTree {
    prefix: u8,
    count: u64,
    leaves: BTreeMap<u64, Vec<u8>>,
    /// Subtree roots covering the elements a partial tree does not hold,
    /// keyed by `(level, index)`.
    nodes: HashMap<(u32, u64), H256>,
}

impl MerkleTree {
    /// Creates an empty tree with the given one-byte element prefix.
    pub fn new(prefix: u8) -> Self {
        Self {
            prefix,
            ..Default::default()
        }
    }

    /// Builds a full tree over `elements`, in order.
    pub fn from_elements(prefix: u8, elements: Vec<Vec<u8>>) -> Self {
        let mut tree = Self::new(prefix);
        tree.count = elements.len() as u64;
        tree.leaves = elements
            .into_iter()
            .enumerate()
            .map(|(i, e)| (i as u64, e))
            .collect();
        tree
    }

    /// Rebuilds the tree that existed immediately after `blobs` were
    /// appended under `proof`. The result is partial unless the proof
    /// describes an append onto an empty tree.
    pub fn from_append_proof(
        prefix: u8,
        blobs: Vec<Vec<u8>>,
        proof: &AppendProof,
    ) -> TreeResult<Self> {
        let positions = peak_positions(proof.element_count);
        if positions.len() != proof.peaks.len() {
            return Err(TreeError::MalformedProof(
                "append proof peak count does not match element count",
            ));
        }
        let base = proof.element_count;
        Ok(Self {
            prefix,
            count: base + blobs.len() as u64,
            leaves: blobs
                .into_iter()
                .enumerate()
                .map(|(i, b)| (base + i as u64, b))
                .collect(),
            nodes: positions.into_iter().zip(proof.peaks.iter().copied()).collect(),
        })
    }

    /// The tree's one-byte element prefix.
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Total number of elements ever appended, including any a partial
    /// tree does not materialise.
    pub const fn len(&self) -> u64 {
        self.count
    }

    /// Returns `true` if no elements have been appended.
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns `true` if some elements are carried only as subtree hashes.
    pub fn is_partial(&self) -> bool {
        (self.leaves.len() as u64) < self.count
    }

    /// The element at `index`, if materialised.
    pub fn element(&self, index: u64) -> Option<&[u8]> {
        self.leaves.get(&index).map(Vec::as_slice)
    }

    /// All elements in order. Fails on a partial tree.
    pub fn elements(&self) -> TreeResult<Vec<Vec<u8>>> {
        (0..self.count)
            .map(|i| {
                self.leaves
                    .get(&i)
                    .cloned()
                    .ok_or(TreeError::MissingElement(i))
            })
            .collect()
    }

    /// The committed root: `keccak(count ‖ element_root)`, or all zeroes
    /// for an empty tree.
    pub fn root(&self) -> TreeResult<H256> {
        if self.count == 0 {
            return Ok(H256::zero());
        }
        Ok(mix_in_count(self.count, &self.element_root()?))
    }

    /// The root over the elements alone, before the count is mixed in.
    pub fn element_root(&self) -> TreeResult<H256> {
        if self.count == 0 {
            return Ok(H256::zero());
        }
        self.node_hash(tree_height(self.count), 0)
    }

    /// Appends a single element, returning the witness for the append.
    pub fn append_one(&mut self, blob: Vec<u8>) -> TreeResult<AppendProof> {
        self.append_many(vec![blob])
    }

    /// Appends elements in order under one consolidated witness.
    pub fn append_many(&mut self, blobs: Vec<Vec<u8>>) -> TreeResult<AppendProof> {
        if blobs.is_empty() {
            return Err(TreeError::EmptyAppend);
        }
        let proof = self.append_proof()?;
        trace!(
            "appending {} element(s) at {} (prefix {:#04x})",
            blobs.len(),
            self.count,
            self.prefix
        );
        for blob in blobs {
            self.leaves.insert(self.count, blob);
            self.count += 1;
        }
        Ok(proof)
    }

    /// The witness an append at the current size would carry: the element
    /// count plus the roots of the maximal complete subtrees.
    pub fn append_proof(&self) -> TreeResult<AppendProof> {
        let peaks = peak_positions(self.count)
            .into_iter()
            .map(|(level, index)| self.node_hash(level, index))
            .collect::<TreeResult<Vec<_>>>()?;
        Ok(AppendProof {
            element_count: self.count,
            peaks,
        })
    }

    /// Proves the elements at `indices` (deduplicated, any order).
    /// Returns the elements ascending by index alongside the proof.
    pub fn multi_proof(&self, indices: &[u64]) -> TreeResult<(Vec<Vec<u8>>, MultiProof)> {
        let mut sorted: Vec<u64> = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.is_empty() {
            return Err(TreeError::MalformedProof("empty index set"));
        }
        if let Some(&index) = sorted.iter().find(|i| **i >= self.count) {
            return Err(TreeError::IndexOutOfBounds {
                index,
                count: self.count,
            });
        }
        let elements = sorted
            .iter()
            .map(|i| {
                self.leaves
                    .get(i)
                    .cloned()
                    .ok_or(TreeError::MissingElement(*i))
            })
            .collect::<TreeResult<Vec<_>>>()?;

        let mut decommitments = Vec::new();
        let mut current = sorted.clone();
        let mut len = self.count;
        let mut level = 0;
        while len > 1 {
            let mut next = Vec::with_capacity(current.len());
            let mut k = 0;
            while k < current.len() {
                let i = current[k];
                let sibling = i ^ 1;
                if k + 1 < current.len() && current[k + 1] == sibling {
                    k += 2;
                } else {
                    if sibling < len {
                        decommitments.push(self.node_hash(level, sibling)?);
                    }
                    k += 1;
                }
                next.push(i / 2);
            }
            current = next;
            len = (len + 1) / 2;
            level += 1;
        }

        Ok((
            elements,
            MultiProof {
                element_count: self.count,
                indices: sorted,
                decommitments,
            },
        ))
    }

    /// Proves the single element at `index`.
    pub fn single_proof(&self, index: u64) -> TreeResult<(Vec<u8>, MultiProof)> {
        let (mut elements, proof) = self.multi_proof(&[index])?;
        Ok((elements.remove(0), proof))
    }

    /// Binds the element count to the committed root.
    pub fn size_proof(&self) -> TreeResult<SizeProof> {
        Ok(SizeProof {
            element_count: self.count,
            element_root: self.element_root()?,
        })
    }

    /// Hash of the node at `(level, index)`, preferring supplied subtree
    /// hashes over recomputation so partial trees resolve their pruned
    /// regions.
    fn node_hash(&self, level: u32, index: u64) -> TreeResult<H256> {
        if let Some(hash) = self.nodes.get(&(level, index)) {
            return Ok(*hash);
        }
        if level == 0 {
            return self
                .leaves
                .get(&index)
                .map(|blob| leaf_hash(self.prefix, blob))
                .ok_or(TreeError::MissingElement(index));
        }
        let below = level_len(self.count, level - 1);
        let left = self.node_hash(level - 1, 2 * index)?;
        if 2 * index + 1 < below {
            let right = self.node_hash(level - 1, 2 * index + 1)?;
            Ok(pair_hash(&left, &right))
        } else {
            Ok(left)
        }
    }
}
