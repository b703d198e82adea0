//! Conversions between the engine's `alloy` primitives and the
//! `ethereum_types` primitives `compact_merkle` speaks.

use alloy::primitives::{B256, FixedBytes};
use ethereum_types::H256;

pub(crate) trait Compat<Out> {
    fn compat(self) -> Out;
}

impl Compat<H256> for B256 {
    fn compat(self) -> H256 {
        let FixedBytes(arr) = self;
        H256(arr)
    }
}

impl Compat<B256> for H256 {
    fn compat(self) -> B256 {
        let H256(arr) = self;
        FixedBytes(arr)
    }
}

pub(crate) fn to_b256_words(words: &[H256]) -> Vec<B256> {
    words.iter().map(|w| (*w).compat()).collect()
}

pub(crate) fn to_h256_words(words: &[B256]) -> Vec<H256> {
    words.iter().map(|w| (*w).compat()).collect()
}
