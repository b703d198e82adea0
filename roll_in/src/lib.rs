//! Client-side engine for an _optimistic roll-in_ protocol.
//!
//! Users commit off-chain computed state transitions to an on-chain
//! _arbiter_ contract, staking a bond instead of paying for execution;
//! other participants watch those commitments, re-execute them off-chain,
//! and disprove invalid ones with succinct Merkle fraud proofs.
//!
//! For every tracked account the engine maintains the commitment
//! structures the protocol runs on: a call-data Merkle tree (one leaf per
//! optimistic transition, held verbatim), the current 32-byte state, and
//! the timestamp of the latest optimistic commitment, folded into a single
//! account fingerprint the arbiter stores on chain. On top of that it
//! implements:
//!
//! - authoring new transitions, pessimistic (`perform`) or optimistic
//!   (`perform_optimistically`, plus a gas-bounded transition queue);
//! - watching third-party transactions ([`OptimisticRollIn::verify_transaction`]),
//!   rebuilding a suspect's tree from calldata alone as a *partial* tree,
//!   and tracking suspects as [`Fraudster`]s;
//! - building and submitting fraud proofs and rollback proofs.
//!
//! All chain access goes through the application-supplied
//! [`ChainAdapter`], which owns signing, timeouts and retries; the engine
//! performs no I/O of its own and surfaces adapter errors unchanged.
//!
//! # Non-goals
//! - Consensus, persistence, networking, key management.
//! - Application transition semantics — those live in the _logic_
//!   contract and the optional pure-verifier registry.

#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

pub mod account;
pub mod chain;
pub mod codec;
mod compat;
pub mod config;
pub mod error;
pub mod fraud;
mod observer;
pub mod operator;
pub mod queue;
pub mod verifier;

pub use account::Account;
pub use chain::{AlloyChain, CallRequest, ChainAdapter, LogRecord, TxReceipt, TxRecord};
pub use codec::{LogicCall, LogicCodec, OptimisticRecord};
pub use config::Config;
pub use error::{ChainError, RollInError, RollInResult};
pub use fraud::{FraudSubmission, Fraudster};
pub use observer::VerifyOutcome;
pub use operator::{CallOptions, OptimisticRollIn};
pub use queue::{QueuedTransition, TransitionQueue};
pub use verifier::{PureVerifier, TransitionVerifier};
