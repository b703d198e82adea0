use ethereum_types::H256;
use roll_in_common::{keccak_packed, u256_be};

/// Hashes a leaf blob under the tree's one-byte domain prefix.
pub(crate) fn leaf_hash(prefix: u8, blob: &[u8]) -> H256 {
    keccak_packed(&[&[prefix], blob])
}

/// Hashes an ordered (unsorted) node pair.
pub(crate) fn pair_hash(left: &H256, right: &H256) -> H256 {
    keccak_packed(&[left.as_bytes(), right.as_bytes()])
}

/// Folds the element count into an element root, producing the committed
/// root. The count prefix is what makes size proofs a single witness.
pub(crate) fn mix_in_count(count: u64, element_root: &H256) -> H256 {
    keccak_packed(&[&u256_be(count), element_root.as_bytes()])
}
