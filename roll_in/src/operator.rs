//! The operator facade: every externally visible operation on a tracked
//! account.

use std::collections::HashMap;

use alloy::{
    json_abi::JsonAbi,
    primitives::{Address, B256, U256},
    sol_types::SolCall as _,
};
use compact_merkle::{AppendProof, MerkleTree};
use roll_in_common::u64_from_word;
use tracing::{debug, info};

use crate::{
    account::Account,
    chain::{CallRequest, ChainAdapter, LogRecord, TxReceipt},
    codec::{
        u256_to_u64, Arbiter, LogicCodec, NEW_OPTIMISTIC_STATES_TOPIC, NEW_OPTIMISTIC_STATE_TOPIC,
        NEW_STATE_TOPIC, ROLLED_BACK_TOPIC,
    },
    compat::{to_b256_words, Compat as _},
    config::Config,
    error::{ChainError, RollInError, RollInResult},
    fraud::Fraudster,
    queue::{self, QueuedTransition, TransitionQueue},
    verifier::{PureVerifier, TransitionVerifier},
};

/// Per-call submission options.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallOptions {
    /// Value to attach, overriding the operation's default.
    pub value: Option<U256>,
    /// Explicit gas limit.
    pub gas: Option<u64>,
    /// Gas ceiling override for queue flushes.
    pub gas_ceiling: Option<u64>,
}

/// A handle on one account of the optimistic roll-in protocol.
///
/// One handle serves both roles the protocol knows: *operator* for the
/// account it owns (authoring transitions, queueing, exiting), and
/// *observer* of everyone else (verifying third-party transactions,
/// tracking fraudsters, proving fraud). Handles are independent of each
/// other and must not be mutated concurrently; the only shared resource
/// is the chain adapter.
pub struct OptimisticRollIn<C> {
    pub(crate) chain: C,
    pub(crate) config: Config,
    pub(crate) arbiter: Address,
    pub(crate) codec: LogicCodec,
    pub(crate) verifier: TransitionVerifier,
    pub(crate) account: Account,
    pub(crate) queue: TransitionQueue,
    pub(crate) frauds: HashMap<Address, Fraudster>,
}

impl<C: ChainAdapter> OptimisticRollIn<C> {
    /// Creates a handle for `user`, against the arbiter and logic
    /// contracts at the given addresses.
    pub fn new(
        chain: C,
        user: Address,
        arbiter: Address,
        logic: Address,
        logic_abi: &JsonAbi,
        config: Config,
    ) -> RollInResult<Self> {
        Ok(Self {
            chain,
            account: Account::new(user, config.element_prefix),
            codec: LogicCodec::new(logic_abi)?,
            verifier: TransitionVerifier::new(logic),
            arbiter,
            config,
            queue: TransitionQueue::default(),
            frauds: HashMap::new(),
        })
    }

    /// Registers a pure verifier for the named logic function, evaluated
    /// locally instead of delegating verification to the chain.
    pub fn register_pure_verifier(
        &mut self,
        function: &str,
        verifier: PureVerifier,
    ) -> RollInResult<()> {
        let selector = self.codec.selector(function)?;
        self.verifier.register(selector, verifier);
        Ok(())
    }

    // ---------------------------------------------------------------- //
    // Local read-only queries.
    // ---------------------------------------------------------------- //

    /// The tracked account.
    pub const fn account(&self) -> &Account {
        &self.account
    }

    /// The account's current 32-byte state.
    pub const fn current_state(&self) -> B256 {
        self.account.current_state()
    }

    /// Timestamp of the latest optimistic commitment; 0 when pessimistic.
    pub const fn last_time(&self) -> u64 {
        self.account.last_time()
    }

    /// Number of optimistic transitions committed since the last
    /// pessimistic reset.
    pub const fn transition_count(&self) -> u64 {
        self.account.transition_count()
    }

    /// Number of transitions waiting in the queue.
    pub fn transitions_queued(&self) -> usize {
        self.queue.len()
    }

    /// The state the account will hold once the queue flushes, or the
    /// current state when nothing is queued.
    pub fn queued_state(&self) -> B256 {
        self.queue.queued_state(self.account.current_state())
    }

    /// Whether the account is in optimistic mode.
    pub const fn is_in_optimistic_state(&self) -> bool {
        self.account.is_optimistic()
    }

    /// The tracked fraudster for `user`, if fraud has been recorded.
    pub fn get_fraudster(&self, user: Address) -> Option<&Fraudster> {
        self.frauds.get(&user)
    }

    // ---------------------------------------------------------------- //
    // Chain read-only queries.
    // ---------------------------------------------------------------- //

    /// The arbiter's stored fingerprint for `user`.
    pub async fn account_state(&self, user: Address) -> RollInResult<B256> {
        let out = self
            .read_arbiter(Arbiter::accountStatesCall { user }.abi_encode())
            .await?;
        Ok(Arbiter::accountStatesCall::abi_decode_returns(&out, true)?._0)
    }

    /// The arbiter's bond balance for `user`.
    pub async fn balance(&self, user: Address) -> RollInResult<U256> {
        let out = self
            .read_arbiter(Arbiter::balancesCall { user }.abi_encode())
            .await?;
        Ok(Arbiter::balancesCall::abi_decode_returns(&out, true)?._0)
    }

    /// Whether this account holds a bond.
    pub async fn is_bonded(&self) -> RollInResult<bool> {
        Ok(!self.balance(self.account.user()).await?.is_zero())
    }

    /// Whether this account has been initialized on chain.
    pub async fn is_initialized(&self) -> RollInResult<bool> {
        Ok(self.account_state(self.account.user()).await? != B256::ZERO)
    }

    /// The address currently locking this account, if any.
    pub async fn get_locker(&self) -> RollInResult<Address> {
        let user = self.account.user();
        let out = self
            .read_arbiter(Arbiter::lockersCall { user }.abi_encode())
            .await?;
        Ok(Arbiter::lockersCall::abi_decode_returns(&out, true)?._0)
    }

    /// Timestamp at which this account was locked; 0 when unlocked.
    pub async fn get_lock_timestamp(&self) -> RollInResult<u64> {
        let user = self.account.user();
        let out = self
            .read_arbiter(Arbiter::lockedTimestampsCall { user }.abi_encode())
            .await?;
        u256_to_u64(Arbiter::lockedTimestampsCall::abi_decode_returns(&out, true)?._0)
    }

    /// The tree size this account must roll back to; meaningful only
    /// while a rollback is pending.
    pub async fn get_rollback_size(&self) -> RollInResult<u64> {
        let user = self.account.user();
        let out = self
            .read_arbiter(Arbiter::rollbackSizesCall { user }.abi_encode())
            .await?;
        u256_to_u64(Arbiter::rollbackSizesCall::abi_decode_returns(&out, true)?._0)
    }

    /// Seconds left until this account's lock can be lifted; 0 when not
    /// locked.
    pub async fn get_lock_time_remaining(&self) -> RollInResult<u64> {
        let locked_at = self.get_lock_timestamp().await?;
        if locked_at == 0 {
            return Ok(0);
        }
        let now = self.chain.latest_block_time().await?;
        Ok((locked_at + self.config.lock_time).saturating_sub(now))
    }

    // ---------------------------------------------------------------- //
    // Bonding and initialization.
    // ---------------------------------------------------------------- //

    /// Stakes the bond for this account. Defaults to the configured
    /// required bond when no value is given.
    pub async fn bond(&mut self, options: CallOptions) -> RollInResult<TxReceipt> {
        let value = options.value.unwrap_or(self.config.required_bond);
        let user = self.account.user();
        self.submit(
            Arbiter::bondCall { user }.abi_encode(),
            CallOptions {
                value: Some(value),
                ..options
            },
        )
        .await
    }

    /// Initializes the on-chain account, optionally attaching a deposit.
    /// Fails when the local account already carries state.
    pub async fn initialize(
        &mut self,
        deposit: U256,
        options: CallOptions,
    ) -> RollInResult<TxReceipt> {
        if self.account.current_state() != B256::ZERO || self.account.is_optimistic() {
            return Err(RollInError::PreconditionFailed(
                "account is already initialized",
            ));
        }
        let receipt = self
            .submit(
                Arbiter::initializeCall {}.abi_encode(),
                CallOptions {
                    value: Some(deposit),
                    ..options
                },
            )
            .await?;
        let new_state = new_state_from_receipt(&receipt)?;
        self.account.pessimistic_update(new_state);
        Ok(receipt)
    }

    /// Returns the staked bond to `destination`.
    pub async fn unbond(
        &mut self,
        destination: Address,
        options: CallOptions,
    ) -> RollInResult<TxReceipt> {
        self.submit(Arbiter::unbondCall { destination }.abi_encode(), options)
            .await
    }

    // ---------------------------------------------------------------- //
    // Performing transitions.
    // ---------------------------------------------------------------- //

    /// Performs a transition pessimistically, with on-chain execution.
    /// On an optimistic account this is the exit path and is gated by the
    /// lock window: it fails with [`RollInError::StillInLock`] until
    /// `last_time + lock_time` has passed.
    pub async fn perform(
        &mut self,
        function: &str,
        args: &[B256],
        options: CallOptions,
    ) -> RollInResult<TxReceipt> {
        let call_data = self.codec.encode(
            function,
            self.account.user(),
            self.account.current_state(),
            args,
        )?;
        let receipt = if self.account.is_optimistic() {
            let now = self.chain.latest_block_time().await?;
            let unlocks_at = self.account.last_time() + self.config.lock_time;
            if now < unlocks_at {
                return Err(RollInError::StillInLock(unlocks_at - now));
            }
            let data = Arbiter::performAndExitCall {
                callData: call_data.into(),
                callDataRoot: self.account.call_data_root()?,
                lastTime: U256::from(self.account.last_time()),
            }
            .abi_encode();
            self.submit(data, options).await?
        } else {
            let data = Arbiter::performCall {
                callData: call_data.into(),
            }
            .abi_encode();
            self.submit(data, options).await?
        };
        let new_state = new_state_from_receipt(&receipt)?;
        self.account.pessimistic_update(new_state);
        info!(user = %self.account.user(), "performed pessimistic transition");
        Ok(receipt)
    }

    /// Commits a transition optimistically: the calldata joins the tree,
    /// `new_state` is the predicted outcome, and no execution happens on
    /// chain. Only pure logic functions qualify.
    pub async fn perform_optimistically(
        &mut self,
        function: &str,
        args: &[B256],
        new_state: B256,
        options: CallOptions,
    ) -> RollInResult<TxReceipt> {
        self.require_pure(function)?;
        let call_data = self.codec.encode(
            function,
            self.account.user(),
            self.account.current_state(),
            args,
        )?;
        let prev_root = self.account.call_data_root()?;
        let prev_time = self.account.last_time();
        let mut tree = self.account.tree().clone();
        let proof = tree.append_one(call_data.clone())?;

        let data = flush_calldata(&[call_data], new_state, prev_root, &proof, prev_time);
        let receipt = self.submit(data, options).await?;
        let block_time = optimistic_time_from_receipt(&receipt)?;
        self.account.optimistic_update(tree, new_state, block_time)?;
        info!(
            user = %self.account.user(),
            transition_count = self.account.transition_count(),
            "committed optimistic transition"
        );
        Ok(receipt)
    }

    /// Queues a transition for a later batched flush. Only pure logic
    /// functions qualify. The calldata is finalised at flush time, when
    /// the chained prior state is known.
    pub fn queue_transition(
        &mut self,
        function: &str,
        args: &[B256],
        new_state: B256,
    ) -> RollInResult<()> {
        self.require_pure(function)?;
        self.queue.push(QueuedTransition {
            function: function.to_owned(),
            args: args.to_vec(),
            new_state,
        });
        Ok(())
    }

    /// Flushes the longest queue prefix that fits under the gas ceiling
    /// and drops the flushed entries; remaining entries stay queued for
    /// the next call.
    pub async fn send_queue(&mut self, options: CallOptions) -> RollInResult<TxReceipt> {
        if self.queue.is_empty() {
            return Err(RollInError::PreconditionFailed("no transitions queued"));
        }
        let user = self.account.user();
        let mut state = self.account.current_state();
        let mut blobs = Vec::with_capacity(self.queue.len());
        let mut predicted = Vec::with_capacity(self.queue.len());
        for item in self.queue.iter() {
            blobs.push(self.codec.encode(&item.function, user, state, &item.args)?);
            predicted.push(item.new_state);
            state = item.new_state;
        }

        let prev_root = self.account.call_data_root()?;
        let prev_time = self.account.last_time();
        let ceiling = options.gas_ceiling.unwrap_or(self.config.gas_ceiling);
        let build = |count: usize| -> RollInResult<CallRequest> {
            let mut tree = self.account.tree().clone();
            let proof = tree.append_many(blobs[..count].to_vec())?;
            let data = flush_calldata(
                &blobs[..count],
                predicted[count - 1],
                prev_root,
                &proof,
                prev_time,
            );
            Ok(self.request(data, options))
        };
        let count =
            queue::longest_affordable_prefix(&self.chain, ceiling, self.queue.len(), build).await?;

        let mut tree = self.account.tree().clone();
        let proof = tree.append_many(blobs[..count].to_vec())?;
        let data = flush_calldata(&blobs[..count], predicted[count - 1], prev_root, &proof, prev_time);
        let receipt = self.submit(data, options).await?;
        let block_time = optimistic_time_from_receipt(&receipt)?;
        self.account
            .optimistic_update(tree, predicted[count - 1], block_time)?;
        self.queue.drop_prefix(count);
        info!(
            user = %user,
            flushed = count,
            remaining = self.queue.len(),
            "flushed queued transitions"
        );
        Ok(receipt)
    }

    // ---------------------------------------------------------------- //
    // Locks, fraud and rollback.
    // ---------------------------------------------------------------- //

    /// Locks a suspect account, staking the accuser bond. Defaults to the
    /// configured required bond when no value is given.
    pub async fn lock(&mut self, suspect: Address, options: CallOptions) -> RollInResult<TxReceipt> {
        let value = options.value.unwrap_or(self.config.required_bond);
        self.submit(
            Arbiter::lockCall { suspect }.abi_encode(),
            CallOptions {
                value: Some(value),
                ..options
            },
        )
        .await
    }

    /// Unlocks this account by presenting its fingerprint witnesses.
    /// Submitted with zero value.
    pub async fn unlock(&mut self, options: CallOptions) -> RollInResult<TxReceipt> {
        let data = Arbiter::unlockCall {
            suspect: self.account.user(),
            currentState: self.account.current_state(),
            callDataRoot: self.account.call_data_root()?,
            lastTime: U256::from(self.account.last_time()),
        }
        .abi_encode();
        self.submit(
            data,
            CallOptions {
                value: None,
                ..options
            },
        )
        .await
    }

    /// Submits the fraud proof for a tracked suspect. On success the
    /// fraudster is dropped from the map, so a second call fails with
    /// [`RollInError::NotFraudulent`].
    pub async fn prove_fraud(
        &mut self,
        suspect: Address,
        options: CallOptions,
    ) -> RollInResult<TxReceipt> {
        let submission = self
            .frauds
            .get(&suspect)
            .ok_or(RollInError::NotFraudulent(suspect))?
            .build_submission()?;
        let data = Arbiter::proveFraudCall {
            suspect,
            elements: submission.elements.into_iter().map(Into::into).collect(),
            currentState: submission.current_state,
            callDataRoot: submission.call_data_root,
            proof: to_b256_words(&submission.proof.to_words()),
            lastTime: U256::from(submission.last_time),
        }
        .abi_encode();
        let receipt = self.submit(data, options).await?;
        if let Some(fraudster) = self.frauds.get_mut(&suspect) {
            fraudster.clear_fraud_index();
        }
        self.frauds.remove(&suspect);
        info!(
            suspect = %suspect,
            transition_index = submission.transition_index,
            "fraud proven"
        );
        Ok(receipt)
    }

    /// Drops a tracked fraudster without proving anything.
    pub fn delete_fraudster(&mut self, suspect: Address) -> RollInResult<()> {
        self.frauds
            .remove(&suspect)
            .map(|_| ())
            .ok_or(RollInError::NotFraudulent(suspect))
    }

    /// Rolls this account's tree back to the size the arbiter demands,
    /// proving the relation between the shortened and the current tree.
    /// The account stays optimistic, with the state the first rolled-back
    /// transition acted on.
    pub async fn rollback(&mut self, options: CallOptions) -> RollInResult<TxReceipt> {
        let target = self.get_rollback_size().await?;
        let current_len = self.account.transition_count();
        if target >= current_len {
            return Err(RollInError::PreconditionFailed(
                "no rollback pending for this account",
            ));
        }
        let elements = self.account.tree().elements()?;
        let rolled_back: Vec<Vec<u8>> = elements[target as usize..].to_vec();
        let new_tree = MerkleTree::from_elements(
            self.config.element_prefix,
            elements[..target as usize].to_vec(),
        );
        let append_proof = {
            let mut probe = new_tree.clone();
            probe.append_many(rolled_back.clone())?
        };
        let size_proof = self.account.tree().size_proof()?;

        let data = Arbiter::rollbackCall {
            oldRoot: new_tree.root()?.compat(),
            rolledBackCallData: rolled_back.iter().cloned().map(Into::into).collect(),
            appendProof: to_b256_words(&append_proof.to_words()),
            currentSize: U256::from(current_len),
            sizeProof: to_b256_words(&size_proof.to_words()),
            currentRoot: self.account.call_data_root()?,
            currentState: self.account.current_state(),
            lastTime: U256::from(self.account.last_time()),
        }
        .abi_encode();
        let receipt = self.submit(data, options).await?;
        let (_, block_time) = rolled_back_from_receipt(&receipt)?;
        let new_state = self.codec.decode(&rolled_back[0])?.current_state;
        self.account.optimistic_update(new_tree, new_state, block_time)?;
        info!(
            user = %self.account.user(),
            tree_size = target,
            "rolled back call-data tree"
        );
        Ok(receipt)
    }

    // ---------------------------------------------------------------- //
    // Export / import.
    // ---------------------------------------------------------------- //

    /// Serialises the tracked account to a self-contained blob.
    pub fn export_state(&self) -> RollInResult<Vec<u8>> {
        self.account.export()
    }

    /// Replaces the tracked account with one rebuilt from an exported
    /// blob.
    pub fn import_state(&mut self, blob: &[u8]) -> RollInResult<()> {
        self.account = Account::import(self.config.element_prefix, blob)?;
        Ok(())
    }

    // ---------------------------------------------------------------- //
    // Internals.
    // ---------------------------------------------------------------- //

    fn require_pure(&self, function: &str) -> RollInResult<()> {
        if !self.codec.is_pure(function)? {
            return Err(RollInError::PreconditionFailed(
                "only pure logic functions may be performed optimistically",
            ));
        }
        Ok(())
    }

    fn request(&self, data: Vec<u8>, options: CallOptions) -> CallRequest {
        CallRequest {
            from: self.config.source_address.unwrap_or(self.account.user()),
            to: self.arbiter,
            value: options.value.unwrap_or_default(),
            data: data.into(),
            gas: options.gas,
        }
    }

    async fn read_arbiter(&self, data: Vec<u8>) -> RollInResult<alloy::primitives::Bytes> {
        Ok(self
            .chain
            .call(&self.request(data, CallOptions::default()))
            .await?)
    }

    async fn submit(&self, data: Vec<u8>, options: CallOptions) -> RollInResult<TxReceipt> {
        let receipt = self.chain.send(self.request(data, options)).await?;
        debug!(tx = %receipt.tx_hash, block = receipt.block_number, "submission mined");
        if !receipt.success {
            return Err(RollInError::Chain(ChainError::msg(format!(
                "submission {} reverted",
                receipt.tx_hash
            ))));
        }
        Ok(receipt)
    }
}

/// Encodes the arbiter call for a batch of optimistic transitions,
/// choosing among the four commitment variants by batch size and mode.
fn flush_calldata(
    blobs: &[Vec<u8>],
    new_state: B256,
    prev_root: B256,
    proof: &AppendProof,
    prev_time: u64,
) -> Vec<u8> {
    let proof_words = to_b256_words(&proof.to_words());
    match blobs {
        [single] if prev_time == 0 => Arbiter::performOptimisticallyAndEnterCall {
            callData: single.clone().into(),
            newState: new_state,
            proof: proof_words,
        }
        .abi_encode(),
        [single] => Arbiter::performOptimisticallyCall {
            callData: single.clone().into(),
            newState: new_state,
            callDataRoot: prev_root,
            proof: proof_words,
            lastTime: U256::from(prev_time),
        }
        .abi_encode(),
        many if prev_time == 0 => Arbiter::performManyOptimisticallyAndEnterCall {
            callData: many.iter().cloned().map(Into::into).collect(),
            newState: new_state,
            proof: proof_words,
        }
        .abi_encode(),
        many => Arbiter::performManyOptimisticallyCall {
            callData: many.iter().cloned().map(Into::into).collect(),
            newState: new_state,
            callDataRoot: prev_root,
            proof: proof_words,
            lastTime: U256::from(prev_time),
        }
        .abi_encode(),
    }
}

fn log_with_topic<'r>(receipt: &'r TxReceipt, topic: B256) -> Option<&'r LogRecord> {
    receipt
        .logs
        .iter()
        .find(|log| log.topics.first() == Some(&topic))
}

/// Reads the new state out of a `NewState` event.
fn new_state_from_receipt(receipt: &TxReceipt) -> RollInResult<B256> {
    let log = log_with_topic(receipt, NEW_STATE_TOPIC)
        .ok_or_else(|| RollInError::Decode("no NewState event in receipt".into()))?;
    log.topics
        .get(2)
        .copied()
        .ok_or_else(|| RollInError::Decode("NewState event is missing its state topic".into()))
}

/// Reads the commitment block time out of a `NewOptimisticState(s)` event.
pub(crate) fn optimistic_time_from_receipt(receipt: &TxReceipt) -> RollInResult<u64> {
    let log = log_with_topic(receipt, NEW_OPTIMISTIC_STATE_TOPIC)
        .or_else(|| log_with_topic(receipt, NEW_OPTIMISTIC_STATES_TOPIC))
        .ok_or_else(|| RollInError::Decode("no NewOptimisticState event in receipt".into()))?;
    let word = log.topics.get(2).ok_or_else(|| {
        RollInError::Decode("NewOptimisticState event is missing its time topic".into())
    })?;
    u64_from_word(&word.0)
        .ok_or_else(|| RollInError::Decode("optimistic block time overflows u64".into()))
}

/// Reads `(tree_size, block_time)` out of a `RolledBack` event.
fn rolled_back_from_receipt(receipt: &TxReceipt) -> RollInResult<(u64, u64)> {
    let log = log_with_topic(receipt, ROLLED_BACK_TOPIC)
        .ok_or_else(|| RollInError::Decode("no RolledBack event in receipt".into()))?;
    let size = log
        .topics
        .get(2)
        .and_then(|w| u64_from_word(&w.0))
        .ok_or_else(|| RollInError::Decode("RolledBack event carries no tree size".into()))?;
    let time = log
        .topics
        .get(3)
        .and_then(|w| u64_from_word(&w.0))
        .ok_or_else(|| RollInError::Decode("RolledBack event carries no block time".into()))?;
    Ok((size, time))
}
