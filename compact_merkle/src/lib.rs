//! Append-only Merkle trees over variable-length byte blobs.
//!
//! General-purpose Merkle libraries are not a good fit for commitment
//! schemes where:
//! - elements are only ever appended, never keyed or deleted;
//! - an observer holds only a *suffix* of the elements (recovered from an
//!   append proof) yet must derive the same root as the full tree and keep
//!   appending to it;
//! - proofs must be compact `bytes32` words suitable for calldata.
//!
//! The core of this library is [`MerkleTree`][tree::MerkleTree], an
//! unbalanced, unsorted-pair tree: leaves are hashed with a one-byte
//! domain prefix, a lone node at the end of a level is promoted unchanged,
//! and the committed root mixes in the element count so that a size proof
//! is a single witness. A tree built from an append proof via
//! [`MerkleTree::from_append_proof`][tree::MerkleTree::from_append_proof]
//! is *partial*: the elements preceding the append survive only as subtree
//! hashes, mirroring how a trie node can be replaced by its hash without
//! changing the root.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

mod hashing;
pub mod proof;
pub mod tree;

pub use proof::{AppendProof, MultiProof, SizeProof};
pub use tree::{MerkleTree, TreeError, TreeResult};
