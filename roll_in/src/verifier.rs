//! The transition verifier: local pure verifiers with a chain fallback.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use alloy::primitives::{Address, B256, U256};
use tracing::warn;

use crate::{
    chain::{CallRequest, ChainAdapter},
    codec::{LogicCall, LogicCodec},
    error::{RollInError, RollInResult},
};

/// A locally-evaluated verifier for one logic function: given the decoded
/// call and the claimed new state, decide whether the transition is valid.
///
/// Verifiers must be deterministic and side-effect free, and must check
/// the embedded `user` themselves when it affects the transition.
pub type PureVerifier = Box<dyn Fn(&LogicCall, B256) -> bool + Send + Sync>;

/// Decides the validity of observed transitions, preferring registered
/// pure verifiers and falling back to an `eth_call` against the logic
/// contract.
///
/// This is the one place errors are deliberately swallowed: a decode
/// failure, adapter failure or verifier panic is reported as a tracing
/// event and yields an *invalid* verdict, never an `Err`.
pub struct TransitionVerifier {
    logic: Address,
    pure: HashMap<[u8; 4], PureVerifier>,
}

impl fmt::Debug for TransitionVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionVerifier")
            .field("logic", &self.logic)
            .field("pure_selectors", &self.pure.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TransitionVerifier {
    /// Creates a verifier delegating to the logic contract at `logic`.
    pub fn new(logic: Address) -> Self {
        Self {
            logic,
            pure: HashMap::new(),
        }
    }

    /// Registers a pure verifier for a logic selector, replacing any
    /// previous registration.
    pub fn register(&mut self, selector: [u8; 4], verifier: PureVerifier) {
        self.pure.insert(selector, verifier);
    }

    /// Whether `blob`, performed by `suspect`, produces `new_state`.
    pub async fn is_valid<C: ChainAdapter>(
        &self,
        chain: &C,
        codec: &LogicCodec,
        suspect: Address,
        blob: &[u8],
        new_state: B256,
    ) -> bool {
        match self.check(chain, codec, suspect, blob, new_state).await {
            Ok(valid) => valid,
            Err(error) => {
                warn!(
                    suspect = %suspect,
                    error = %error,
                    "transition verification errored; treating transition as invalid"
                );
                false
            }
        }
    }

    async fn check<C: ChainAdapter>(
        &self,
        chain: &C,
        codec: &LogicCodec,
        suspect: Address,
        blob: &[u8],
        new_state: B256,
    ) -> RollInResult<bool> {
        let call = codec.decode(blob)?;
        if call.user != suspect {
            return Ok(false);
        }
        if let Some(verifier) = self.pure.get(&call.selector) {
            return catch_unwind(AssertUnwindSafe(|| verifier(&call, new_state)))
                .map_err(|_| RollInError::Verifier);
        }
        let out = chain
            .call(&CallRequest {
                from: suspect,
                to: self.logic,
                value: U256::ZERO,
                data: blob.to_vec().into(),
                gas: None,
            })
            .await?;
        Ok(out.len() == 32 && B256::from_slice(&out) == new_state)
    }

    /// Verifies a batch against its declared intermediate states and the
    /// final state `final_state`. The state a transition must produce is
    /// the `current_state` embedded in the *next* blob (the final one must
    /// produce `final_state`). Returns the index of the first failing
    /// transition, or `None` when the whole batch holds.
    pub async fn first_invalid<C: ChainAdapter>(
        &self,
        chain: &C,
        codec: &LogicCodec,
        suspect: Address,
        blobs: &[Vec<u8>],
        final_state: B256,
    ) -> Option<usize> {
        for i in 0..blobs.len() {
            let next_state = if i + 1 == blobs.len() {
                final_state
            } else {
                match codec.decode(&blobs[i + 1]) {
                    Ok(next) => next.current_state,
                    // The successor is undecodable, so transition i has
                    // no checkable outcome.
                    Err(_) => return Some(i),
                }
            };
            if !self.is_valid(chain, codec, suspect, &blobs[i], next_state).await {
                return Some(i);
            }
        }
        None
    }
}
