//! Compact proof types produced by [`MerkleTree`](crate::tree::MerkleTree).
//!
//! Every proof serialises to a sequence of 32-byte words whose first word
//! is the element count of the producing tree, so a consumer can decode a
//! proof without the producer at hand.

use ethereum_types::H256;
use roll_in_common::{u256_be, u64_from_word};

use crate::{
    hashing::{leaf_hash, mix_in_count, pair_hash},
    tree::{TreeError, TreeResult},
};

/// Positions `(level, index)` of the roots of the maximal complete subtrees
/// of a tree with `count` leaves, leftmost first. These are the
/// decommitments an append proof carries.
pub(crate) fn peak_positions(count: u64) -> Vec<(u32, u64)> {
    let mut out = Vec::with_capacity(count.count_ones() as usize);
    let mut offset = 0u64;
    for bit in (0..u64::BITS).rev() {
        if count & (1 << bit) != 0 {
            out.push((bit, offset >> bit));
            offset += 1 << bit;
        }
    }
    out
}

/// Witness that a set of elements was appended at the end of a tree.
///
/// Carries the pre-append element count and the subtree roots covering all
/// pre-append elements; this is enough to recompute the pre-append root and
/// to derive every root the tree takes on as the new elements land.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppendProof {
    /// Element count of the tree *before* the append.
    pub element_count: u64,
    /// Roots of the maximal complete subtrees of the pre-append tree.
    pub peaks: Vec<H256>,
}

impl AppendProof {
    /// Serialises to compact words: `[count, peak_0, .., peak_n]`.
    pub fn to_words(&self) -> Vec<H256> {
        let mut words = Vec::with_capacity(1 + self.peaks.len());
        words.push(H256(u256_be(self.element_count)));
        words.extend_from_slice(&self.peaks);
        words
    }

    /// Parses compact words, checking the peak count against the
    /// self-described element count.
    pub fn from_words(words: &[H256]) -> TreeResult<Self> {
        let (count_word, peaks) = words
            .split_first()
            .ok_or(TreeError::MalformedProof("empty append proof"))?;
        let element_count = u64_from_word(&count_word.0)
            .ok_or(TreeError::MalformedProof("oversized element count"))?;
        if peaks.len() != element_count.count_ones() as usize {
            return Err(TreeError::MalformedProof(
                "append proof peak count does not match element count",
            ));
        }
        Ok(Self {
            element_count,
            peaks: peaks.to_vec(),
        })
    }
}

/// Witness for a set of elements at known indices.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MultiProof {
    /// Element count of the producing tree.
    pub element_count: u64,
    /// The proven indices, ascending.
    pub indices: Vec<u64>,
    /// Sibling hashes consumed by the ascending per-level sweep.
    pub decommitments: Vec<H256>,
}

impl MultiProof {
    /// Serialises to compact words:
    /// `[count, index_count, indices.., decommitments..]`.
    pub fn to_words(&self) -> Vec<H256> {
        let mut words = Vec::with_capacity(2 + self.indices.len() + self.decommitments.len());
        words.push(H256(u256_be(self.element_count)));
        words.push(H256(u256_be(self.indices.len() as u64)));
        words.extend(self.indices.iter().map(|i| H256(u256_be(*i))));
        words.extend_from_slice(&self.decommitments);
        words
    }

    /// Parses compact words produced by [`MultiProof::to_words`].
    pub fn from_words(words: &[H256]) -> TreeResult<Self> {
        if words.len() < 2 {
            return Err(TreeError::MalformedProof("truncated multi proof"));
        }
        let element_count = u64_from_word(&words[0].0)
            .ok_or(TreeError::MalformedProof("oversized element count"))?;
        let index_count = u64_from_word(&words[1].0)
            .ok_or(TreeError::MalformedProof("oversized index count"))?
            as usize;
        if words.len() < 2 + index_count {
            return Err(TreeError::MalformedProof("truncated multi proof indices"));
        }
        let indices = words[2..2 + index_count]
            .iter()
            .map(|w| u64_from_word(&w.0).ok_or(TreeError::MalformedProof("oversized index")))
            .collect::<TreeResult<Vec<_>>>()?;
        Ok(Self {
            element_count,
            indices,
            decommitments: words[2 + index_count..].to_vec(),
        })
    }

    /// Recomputes the committed root from `elements` (one per proven index,
    /// same order) and compares it against `root`.
    pub fn verify(&self, root: H256, prefix: u8, elements: &[Vec<u8>]) -> bool {
        if elements.len() != self.indices.len() || self.indices.is_empty() {
            return false;
        }
        let mut current: Vec<(u64, H256)> = self
            .indices
            .iter()
            .zip(elements)
            .map(|(i, blob)| (*i, leaf_hash(prefix, blob)))
            .collect();
        if current.windows(2).any(|w| w[0].0 >= w[1].0) {
            return false;
        }
        if current.iter().any(|(i, _)| *i >= self.element_count) {
            return false;
        }

        let mut decommitments = self.decommitments.iter();
        let mut len = self.element_count;
        while len > 1 {
            let mut next = Vec::with_capacity(current.len());
            let mut k = 0;
            while k < current.len() {
                let (i, h) = current[k];
                let sibling = i ^ 1;
                if k + 1 < current.len() && current[k + 1].0 == sibling {
                    next.push((i / 2, pair_hash(&h, &current[k + 1].1)));
                    k += 2;
                } else if sibling < len {
                    let d = match decommitments.next() {
                        Some(d) => d,
                        None => return false,
                    };
                    let parent = if i % 2 == 0 {
                        pair_hash(&h, d)
                    } else {
                        pair_hash(d, &h)
                    };
                    next.push((i / 2, parent));
                    k += 1;
                } else {
                    // Lone node at the end of the level is promoted.
                    next.push((i / 2, h));
                    k += 1;
                }
            }
            current = next;
            len = (len + 1) / 2;
        }

        decommitments.next().is_none()
            && mix_in_count(self.element_count, &current[0].1) == root
    }
}

/// Witness binding the element count to the committed root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SizeProof {
    /// The proven element count.
    pub element_count: u64,
    /// Root over the elements alone, before the count is mixed in.
    pub element_root: H256,
}

impl SizeProof {
    /// Serialises to compact words: `[count, element_root]`.
    pub fn to_words(&self) -> Vec<H256> {
        vec![H256(u256_be(self.element_count)), self.element_root]
    }

    /// Parses compact words produced by [`SizeProof::to_words`].
    pub fn from_words(words: &[H256]) -> TreeResult<Self> {
        match words {
            [count, element_root] => Ok(Self {
                element_count: u64_from_word(&count.0)
                    .ok_or(TreeError::MalformedProof("oversized element count"))?,
                element_root: *element_root,
            }),
            _ => Err(TreeError::MalformedProof("size proof must be two words")),
        }
    }

    /// Checks the witness against a committed root.
    pub fn verify(&self, root: H256) -> bool {
        if self.element_count == 0 {
            return root == H256::zero();
        }
        mix_in_count(self.element_count, &self.element_root) == root
    }
}

/// Number of levels between the leaves and the single element root.
pub(crate) fn tree_height(count: u64) -> u32 {
    let mut height = 0;
    let mut len = count;
    while len > 1 {
        len = (len + 1) / 2;
        height += 1;
    }
    height
}
