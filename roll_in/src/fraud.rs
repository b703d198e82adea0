//! Tracking suspects and building fraud proofs.

use alloy::primitives::{Address, B256};
use compact_merkle::{MerkleTree, MultiProof};
use tracing::{debug, info};

use crate::{
    account::Account,
    codec::{LogicCodec, OptimisticRecord},
    compat::Compat as _,
    error::{RollInError, RollInResult},
};

/// Everything a fraud-proof submission carries to the arbiter.
#[derive(Clone, Debug)]
pub struct FraudSubmission {
    /// The accused user.
    pub suspect: Address,
    /// The fraudulent element and, when one exists, its successor.
    pub elements: Vec<Vec<u8>>,
    /// Multi-proof over those elements against the suspect's tree.
    pub proof: MultiProof,
    /// The suspect's committed tree root.
    pub call_data_root: B256,
    /// The suspect's declared current state.
    pub current_state: B256,
    /// The suspect's last commitment time.
    pub last_time: u64,
    /// Position of the invalid transition in the full tree.
    pub transition_index: u64,
}

/// A tracked suspect: an [`Account`] over a *partial* tree rebuilt from a
/// single observed append proof, with `fraud_index` marking the invalid
/// transition.
///
/// A fraudster tracks no fraud of its own; deletion from the owner's map
/// happens owner-side, after a successful proof submission or on request.
#[derive(Clone, Debug)]
pub struct Fraudster {
    account: Account,
}

impl Fraudster {
    /// Records a suspect from an observed invalid commitment: the partial
    /// tree is rebuilt from the transaction's blobs and append proof
    /// alone, with no access to the suspect's full tree.
    ///
    /// `local_index` is the failing position *within the observed batch*;
    /// the recorded fraud index is its position in the full tree.
    pub fn record(
        element_prefix: u8,
        suspect: Address,
        record: &OptimisticRecord,
        last_time: u64,
        local_index: u64,
    ) -> RollInResult<Self> {
        let tree =
            MerkleTree::from_append_proof(element_prefix, record.call_data.clone(), &record.proof)?;
        let fraud_index = tree.len() - record.call_data.len() as u64 + local_index;
        info!(
            suspect = %suspect,
            fraud_index,
            tree_size = tree.len(),
            "recording fraudster"
        );
        Ok(Self {
            account: Account::with_parts(
                suspect,
                tree,
                record.new_state,
                last_time,
                Some(fraud_index),
            ),
        })
    }

    /// The tracked account.
    pub const fn account(&self) -> &Account {
        &self.account
    }

    /// The tracked user.
    pub const fn user(&self) -> Address {
        self.account.user()
    }

    /// Position of the invalid transition, until a proof lands.
    pub const fn fraud_index(&self) -> Option<u64> {
        self.account.fraud_index()
    }

    /// Folds a later observed *valid* commitment by the same suspect into
    /// the partial tree, keeping the tracked fingerprint aligned with the
    /// chain.
    ///
    /// All preconditions are hard failures: the declared prior root and
    /// prior last-time must match the tracked values
    /// ([`RollInError::InvalidRoots`]) and the first blob must act on the
    /// tracked current state ([`RollInError::StateMismatch`]).
    pub fn apply(
        &mut self,
        codec: &LogicCodec,
        record: &OptimisticRecord,
        block_time: u64,
    ) -> RollInResult<()> {
        let tracked_root = self.account.call_data_root()?;
        let declared_root = record.prev_root.unwrap_or(B256::ZERO);
        if declared_root != tracked_root {
            return Err(RollInError::InvalidRoots);
        }
        if record.prev_last_time != self.account.last_time() {
            return Err(RollInError::InvalidRoots);
        }
        let first = record
            .call_data
            .first()
            .ok_or_else(|| RollInError::Decode("optimistic record carries no call data".into()))?;
        if codec.decode(first)?.current_state != self.account.current_state() {
            return Err(RollInError::StateMismatch);
        }

        self.account
            .tree_mut()
            .append_many(record.call_data.clone())?;
        self.account.set_state_and_time(record.new_state, block_time);
        debug!(
            suspect = %self.account.user(),
            tree_size = self.account.transition_count(),
            "extended fraudster tree"
        );
        Ok(())
    }

    /// Builds the arbiter submission proving the recorded fraud: a
    /// multi-proof over the invalid transition and its successor (the
    /// successor's embedded state is what exposes the lie; a fraud at the
    /// tree's end is checked against the declared current state instead).
    pub fn build_submission(&self) -> RollInResult<FraudSubmission> {
        let transition_index = self
            .account
            .fraud_index()
            .ok_or(RollInError::NotFraudulent(self.account.user()))?;
        let tree = self.account.tree();
        let indices: Vec<u64> = if transition_index + 1 < tree.len() {
            vec![transition_index, transition_index + 1]
        } else {
            vec![transition_index]
        };
        let (elements, proof) = tree.multi_proof(&indices)?;
        Ok(FraudSubmission {
            suspect: self.account.user(),
            elements,
            proof,
            call_data_root: tree.root()?.compat(),
            current_state: self.account.current_state(),
            last_time: self.account.last_time(),
            transition_index,
        })
    }

    /// Clears the fraud index after a successful submission, so a repeat
    /// attempt fails cleanly with [`RollInError::NotFraudulent`].
    pub fn clear_fraud_index(&mut self) {
        self.account.set_fraud_index(None);
    }
}
