//! Engine configuration.

use alloy::primitives::{Address, U256};

/// Default gas ceiling for a queue flush.
const DEFAULT_GAS_CEILING: u64 = 6_000_000;

/// Per-account engine configuration.
///
/// Proof and tree parameters beyond [`element_prefix`](Self::element_prefix)
/// are fixed by the protocol (unbalanced tree, unsorted pairing, compact
/// proofs) and are not configurable.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// One-byte domain prefix for call-data tree leaves.
    pub element_prefix: u8,
    /// Length of the lock window in seconds. An optimistic account cannot
    /// exit to pessimistic mode before its latest commitment is this old.
    pub lock_time: u64,
    /// Bond the arbiter requires, in wei. Used as the default value for
    /// `bond` and `lock` submissions.
    pub required_bond: U256,
    /// Sender for submissions and calls. Defaults to the account's user.
    pub source_address: Option<Address>,
    /// Gas ceiling the queue batcher fits flushes under.
    pub gas_ceiling: u64,
}

impl Config {
    /// Creates a configuration with the two mandatory parameters, leaving
    /// the rest at their defaults.
    pub fn new(lock_time: u64, required_bond: U256) -> Self {
        Self {
            element_prefix: 0x00,
            lock_time,
            required_bond,
            source_address: None,
            gas_ceiling: DEFAULT_GAS_CEILING,
        }
    }
}
