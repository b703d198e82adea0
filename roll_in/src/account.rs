//! Per-account commitment state.

use alloy::primitives::{keccak256, Address, B256};
use compact_merkle::MerkleTree;
use rlp::{Rlp, RlpStream};
use roll_in_common::u256_be;

use crate::{
    compat::Compat as _,
    error::{RollInError, RollInResult},
};

/// A tracked account: the call-data tree, current state and last
/// commitment time that together fingerprint the account on chain, plus
/// the fraud index when the account is a tracked suspect.
///
/// `last_time == 0` exactly when the account is pessimistic; otherwise it
/// is the block timestamp of the latest optimistic commitment.
#[derive(Clone, Debug)]
pub struct Account {
    user: Address,
    call_data_tree: MerkleTree,
    current_state: B256,
    last_time: u64,
    fraud_index: Option<u64>,
}

impl Account {
    /// Creates a fresh account with a null tree, state and time.
    pub fn new(user: Address, element_prefix: u8) -> Self {
        Self {
            user,
            call_data_tree: MerkleTree::new(element_prefix),
            current_state: B256::ZERO,
            last_time: 0,
            fraud_index: None,
        }
    }

    pub(crate) fn with_parts(
        user: Address,
        call_data_tree: MerkleTree,
        current_state: B256,
        last_time: u64,
        fraud_index: Option<u64>,
    ) -> Self {
        Self {
            user,
            call_data_tree,
            current_state,
            last_time,
            fraud_index,
        }
    }

    /// The account's user address.
    pub const fn user(&self) -> Address {
        self.user
    }

    /// The call-data tree.
    pub const fn tree(&self) -> &MerkleTree {
        &self.call_data_tree
    }

    pub(crate) fn tree_mut(&mut self) -> &mut MerkleTree {
        &mut self.call_data_tree
    }

    /// The current 32-byte state.
    pub const fn current_state(&self) -> B256 {
        self.current_state
    }

    /// Timestamp of the latest optimistic commitment; 0 when pessimistic.
    pub const fn last_time(&self) -> u64 {
        self.last_time
    }

    /// The position of the first invalid transition, when this account
    /// tracks a suspect.
    pub const fn fraud_index(&self) -> Option<u64> {
        self.fraud_index
    }

    pub(crate) fn set_fraud_index(&mut self, fraud_index: Option<u64>) {
        self.fraud_index = fraud_index;
    }

    /// Number of optimistic transitions since the last pessimistic reset.
    pub const fn transition_count(&self) -> u64 {
        self.call_data_tree.len()
    }

    /// Whether the account is in optimistic mode.
    pub const fn is_optimistic(&self) -> bool {
        self.last_time != 0
    }

    /// The committed call-data tree root.
    pub fn call_data_root(&self) -> RollInResult<B256> {
        Ok(self.call_data_tree.root()?.compat())
    }

    /// The fingerprint the arbiter stores:
    /// `keccak(tree_root ‖ current_state ‖ u256(last_time))`.
    ///
    /// Recomputed on every call; caching it would go stale under the
    /// mutators below.
    pub fn fingerprint(&self) -> RollInResult<B256> {
        let root = self.call_data_tree.root()?;
        let mut buf = [0u8; 96];
        buf[..32].copy_from_slice(root.as_bytes());
        buf[32..64].copy_from_slice(self.current_state.as_slice());
        buf[64..].copy_from_slice(&u256_be(self.last_time));
        Ok(keccak256(buf))
    }

    /// Applies a pessimistic transition: the tree empties and the lock
    /// window closes.
    pub fn pessimistic_update(&mut self, new_state: B256) {
        self.call_data_tree = MerkleTree::new(self.call_data_tree.prefix());
        self.current_state = new_state;
        self.last_time = 0;
    }

    /// Applies an optimistic transition. `block_time` must advance
    /// strictly when the account was already optimistic.
    pub fn optimistic_update(
        &mut self,
        call_data_tree: MerkleTree,
        new_state: B256,
        block_time: u64,
    ) -> RollInResult<()> {
        if self.last_time != 0 && block_time <= self.last_time {
            return Err(RollInError::PreconditionFailed(
                "optimistic block time did not advance",
            ));
        }
        self.call_data_tree = call_data_tree;
        self.current_state = new_state;
        self.last_time = block_time;
        Ok(())
    }

    pub(crate) fn set_state_and_time(&mut self, new_state: B256, last_time: u64) {
        self.current_state = new_state;
        self.last_time = last_time;
    }

    /// Serialises the account to a self-contained blob. Requires a full
    /// tree; a partial (fraudster) account cannot round-trip its pruned
    /// elements.
    pub fn export(&self) -> RollInResult<Vec<u8>> {
        let elements = self.call_data_tree.elements()?;
        let mut stream = RlpStream::new_list(6);
        stream.append(&self.user.as_slice().to_vec());
        stream.begin_list(elements.len());
        for element in &elements {
            stream.append(element);
        }
        stream.append(&self.current_state.as_slice().to_vec());
        stream.append(&self.last_time);
        stream.append(&u8::from(self.fraud_index.is_some()));
        stream.append(&self.fraud_index.unwrap_or(0));
        Ok(stream.out().to_vec())
    }

    /// Rebuilds an account from an exported blob.
    pub fn import(element_prefix: u8, blob: &[u8]) -> RollInResult<Self> {
        let rlp = Rlp::new(blob);
        let user_bytes: Vec<u8> = rlp.val_at(0)?;
        if user_bytes.len() != 20 {
            return Err(RollInError::Decode("exported user is not 20 bytes".into()));
        }
        let elements: Vec<Vec<u8>> = rlp.list_at(1)?;
        let state_bytes: Vec<u8> = rlp.val_at(2)?;
        if state_bytes.len() != 32 {
            return Err(RollInError::Decode("exported state is not 32 bytes".into()));
        }
        let last_time: u64 = rlp.val_at(3)?;
        let has_fraud: u8 = rlp.val_at(4)?;
        let fraud_index: u64 = rlp.val_at(5)?;
        Ok(Self {
            user: Address::from_slice(&user_bytes),
            call_data_tree: MerkleTree::from_elements(element_prefix, elements),
            current_state: B256::from_slice(&state_bytes),
            last_time,
            fraud_index: (has_fraud != 0).then_some(fraud_index),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account() -> Account {
        let mut account = Account::new(Address::repeat_byte(0xaa), 0);
        account.pessimistic_update(B256::repeat_byte(1));
        let mut tree = account.tree().clone();
        tree.append_many(vec![vec![1, 2, 3], vec![4, 5]]).unwrap();
        account
            .optimistic_update(tree, B256::repeat_byte(2), 1_700_000_000)
            .unwrap();
        account
    }

    #[test]
    fn fingerprint_packs_root_state_and_time() {
        let account = sample_account();
        let root = account.tree().root().unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(root.as_bytes());
        buf.extend_from_slice(account.current_state().as_slice());
        buf.extend_from_slice(&u256_be(account.last_time()));
        assert_eq!(account.fingerprint().unwrap(), keccak256(&buf));
    }

    #[test]
    fn pessimistic_update_closes_the_lock_window() {
        let mut account = sample_account();
        account.pessimistic_update(B256::repeat_byte(9));
        assert_eq!(account.last_time(), 0);
        assert_eq!(account.transition_count(), 0);
        assert!(!account.is_optimistic());
        assert_eq!(account.current_state(), B256::repeat_byte(9));
    }

    #[test]
    fn optimistic_update_requires_advancing_time() {
        let mut account = sample_account();
        let tree = account.tree().clone();
        let res = account.optimistic_update(tree, B256::repeat_byte(3), account.last_time());
        assert!(matches!(res, Err(RollInError::PreconditionFailed(_))));
    }

    #[test]
    fn export_import_round_trips_the_fingerprint() {
        let mut account = sample_account();
        account.set_fraud_index(Some(1));
        let blob = account.export().unwrap();

        let imported = Account::import(0, &blob).unwrap();
        assert_eq!(imported.fingerprint().unwrap(), account.fingerprint().unwrap());
        assert_eq!(imported.user(), account.user());
        assert_eq!(imported.transition_count(), account.transition_count());
        assert_eq!(imported.last_time(), account.last_time());
        assert_eq!(imported.fraud_index(), Some(1));
    }

    #[test]
    fn export_refuses_partial_trees() {
        let mut donor = MerkleTree::new(0);
        donor.append_many(vec![vec![1], vec![2]]).unwrap();
        let append = donor.append_many(vec![vec![3]]).unwrap();
        let partial = MerkleTree::from_append_proof(0, vec![vec![3]], &append).unwrap();

        let account =
            Account::with_parts(Address::ZERO, partial, B256::ZERO, 1, Some(0));
        assert!(account.export().is_err());
    }
}
