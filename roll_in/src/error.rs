//! Error types surfaced by the engine.

use alloy::primitives::Address;
use compact_merkle::TreeError;
use thiserror::Error;

/// Stores the result of engine operations. Returns a [`RollInError`] upon
/// failure.
pub type RollInResult<T> = Result<T, RollInError>;

/// An error raised by the application's chain adapter, carried through
/// unchanged. The adapter owns retries and timeouts; by the time one of
/// these surfaces, the adapter has given up.
#[derive(Debug, Error)]
#[error("chain adapter error: {0}")]
pub struct ChainError(pub anyhow::Error);

impl From<anyhow::Error> for ChainError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl ChainError {
    /// Wraps a plain message.
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        Self(anyhow::anyhow!("{msg}"))
    }
}

/// An error type for engine operations.
#[derive(Debug, Error)]
pub enum RollInError {
    /// A caller invariant was violated (performing on another's account,
    /// initializing twice, flushing an empty queue, ...).
    #[error("precondition failed: {0}")]
    PreconditionFailed(&'static str),

    /// A declared prior tree root or last-time does not match the tracked
    /// value.
    #[error("declared prior root or last-time does not match the tracked account")]
    InvalidRoots,

    /// The first blob of an observed batch embeds a current state that
    /// differs from the tracked account's.
    #[error("embedded current state does not match the tracked account state")]
    StateMismatch,

    /// A single queued transition already exceeds the gas ceiling.
    #[error("a lone queued transition needs {0} gas, more than the ceiling allows")]
    BudgetExceeded(u64),

    /// A pessimistic action was attempted while the lock window is open.
    #[error("account is locked in optimistic mode for {0} more seconds")]
    StillInLock(u64),

    /// A fraud operation was attempted with no recorded fraudster.
    #[error("no fraud recorded for {0}")]
    NotFraudulent(Address),

    /// The chain adapter failed.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Malformed calldata, event, or exported blob.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A Merkle tree operation failed.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// A pure verifier panicked. Never escapes the transition verifier,
    /// which converts it into an invalid-transition verdict.
    #[error("pure verifier panicked")]
    Verifier,
}

impl From<alloy::sol_types::Error> for RollInError {
    fn from(e: alloy::sol_types::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<alloy::dyn_abi::Error> for RollInError {
    fn from(e: alloy::dyn_abi::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<rlp::DecoderError> for RollInError {
    fn from(e: rlp::DecoderError) -> Self {
        Self::Decode(e.to_string())
    }
}
