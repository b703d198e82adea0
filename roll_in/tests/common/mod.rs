//! In-memory chain with a faithful arbiter: shadow account state, event
//! logs with the protocol's topics, and a controllable clock. The logic
//! contract's two test functions are evaluated natively.

// Each integration test binary compiles its own copy of this module and
// uses a different subset of it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use alloy::{
    json_abi::JsonAbi,
    primitives::{keccak256, Address, B256, Bytes, U256},
    sol_types::SolCall as _,
};
use compact_merkle::{MerkleTree, MultiProof};
use ethereum_types::H256;
use roll_in::{
    codec::{
        Arbiter, LogicCall, LogicCodec, FRAUD_PROVEN_TOPIC, LOCKED_TOPIC,
        NEW_OPTIMISTIC_STATES_TOPIC, NEW_OPTIMISTIC_STATE_TOPIC, NEW_STATE_TOPIC,
        ROLLED_BACK_TOPIC, UNLOCKED_TOPIC,
    },
    CallRequest, ChainAdapter, ChainError, Config, LogRecord, TxReceipt, TxRecord,
};
use roll_in_common::u256_be;

pub const LOCK_TIME: u64 = 600;
pub const GENESIS_TIME: u64 = 1_700_000_000;

pub fn required_bond() -> U256 {
    U256::from(10).pow(U256::from(18))
}

pub fn test_config() -> Config {
    Config::new(LOCK_TIME, required_bond())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn word(v: u64) -> B256 {
    B256::new(u256_be(v))
}

pub fn address_word(a: Address) -> B256 {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(a.as_slice());
    B256::new(out)
}

/// The test logic contract's pure transition.
pub fn pure_transition(state: B256, arg: B256) -> B256 {
    keccak256([state.as_slice(), arg.as_slice()].concat())
}

/// The test logic contract's impure transition.
pub fn impure_transition(state: B256, arg: B256) -> B256 {
    keccak256([arg.as_slice(), state.as_slice()].concat())
}

pub fn logic_abi() -> JsonAbi {
    serde_json::from_str(
        r#"[
            {"type":"function","name":"some_pure_transition","stateMutability":"pure",
             "inputs":[{"name":"user","type":"address"},{"name":"currentState","type":"bytes32"},{"name":"someArg","type":"bytes32"}],
             "outputs":[{"name":"","type":"bytes32"}]},
            {"type":"function","name":"some_impure_transition","stateMutability":"nonpayable",
             "inputs":[{"name":"user","type":"address"},{"name":"currentState","type":"bytes32"},{"name":"someArg","type":"bytes32"}],
             "outputs":[{"name":"","type":"bytes32"}]}
        ]"#,
    )
    .unwrap()
}

#[derive(Clone, Default)]
struct UserShadow {
    initialized: bool,
    elements: Vec<Vec<u8>>,
    state: B256,
    last_time: u64,
    balance: U256,
    locker: Address,
    locked_at: u64,
    rollback_size: u64,
}

struct Inner {
    now: u64,
    block_number: u64,
    nonce: u64,
    txs: HashMap<B256, (TxRecord, TxReceipt)>,
    users: HashMap<Address, UserShadow>,
}

/// The mock chain: one arbiter, one logic contract, a 13-second block
/// cadence.
pub struct MockChain {
    pub arbiter: Address,
    pub logic: Address,
    lock_time: u64,
    codec: LogicCodec,
    inner: Mutex<Inner>,
}

fn err(msg: impl std::fmt::Display) -> ChainError {
    ChainError::msg(msg)
}

fn h256(b: B256) -> H256 {
    H256(b.0)
}

fn b256(h: H256) -> B256 {
    B256::new(h.0)
}

fn shadow_root(elements: &[Vec<u8>]) -> B256 {
    b256(
        MerkleTree::from_elements(0, elements.to_vec())
            .root()
            .expect("shadow tree is always full"),
    )
}

fn shadow_fingerprint(shadow: &UserShadow) -> B256 {
    let root = shadow_root(&shadow.elements);
    keccak256(
        [
            root.as_slice(),
            shadow.state.as_slice(),
            &u256_be(shadow.last_time),
        ]
        .concat(),
    )
}

impl MockChain {
    pub fn new(arbiter: Address, logic: Address) -> Self {
        Self {
            arbiter,
            logic,
            lock_time: LOCK_TIME,
            codec: LogicCodec::new(&logic_abi()).unwrap(),
            inner: Mutex::new(Inner {
                now: GENESIS_TIME,
                block_number: 1,
                nonce: 0,
                txs: HashMap::new(),
                users: HashMap::new(),
            }),
        }
    }

    pub fn advance_time(&self, seconds: u64) {
        self.inner.lock().unwrap().now += seconds;
    }

    pub fn now(&self) -> u64 {
        self.inner.lock().unwrap().now
    }

    fn execute_logic(&self, call: &LogicCall) -> Result<B256, ChainError> {
        let arg = match call.args.first() {
            Some(alloy::dyn_abi::DynSolValue::FixedBytes(w, 32)) => *w,
            _ => return Err(err("logic argument is not bytes32")),
        };
        match call.function.as_str() {
            "some_pure_transition" => Ok(pure_transition(call.current_state, arg)),
            "some_impure_transition" => Ok(impure_transition(call.current_state, arg)),
            other => Err(err(format!("unknown logic function {other}"))),
        }
    }

    fn apply_call(&self, request: &CallRequest) -> Result<Bytes, ChainError> {
        if request.to == self.logic {
            let call = self
                .codec
                .decode(&request.data)
                .map_err(|e| err(format!("logic decode failed: {e}")))?;
            return Ok(self.execute_logic(&call)?.as_slice().to_vec().into());
        }
        if request.to != self.arbiter {
            return Err(err("call to unknown contract"));
        }

        let inner = self.inner.lock().unwrap();
        let data = &request.data;
        if let Ok(call) = Arbiter::accountStatesCall::abi_decode(data, true) {
            let value = inner
                .users
                .get(&call.user)
                .filter(|s| s.initialized)
                .map(shadow_fingerprint)
                .unwrap_or_default();
            return Ok(value.as_slice().to_vec().into());
        }
        if let Ok(call) = Arbiter::balancesCall::abi_decode(data, true) {
            let value = inner.users.get(&call.user).map(|s| s.balance).unwrap_or_default();
            return Ok(value.to_be_bytes::<32>().to_vec().into());
        }
        if let Ok(call) = Arbiter::lockersCall::abi_decode(data, true) {
            let value = inner.users.get(&call.user).map(|s| s.locker).unwrap_or_default();
            return Ok(address_word(value).as_slice().to_vec().into());
        }
        if let Ok(call) = Arbiter::lockedTimestampsCall::abi_decode(data, true) {
            let value = inner.users.get(&call.user).map(|s| s.locked_at).unwrap_or_default();
            return Ok(word(value).as_slice().to_vec().into());
        }
        if let Ok(call) = Arbiter::rollbackSizesCall::abi_decode(data, true) {
            let value = inner
                .users
                .get(&call.user)
                .map(|s| s.rollback_size)
                .unwrap_or_default();
            return Ok(word(value).as_slice().to_vec().into());
        }
        Err(err("unknown arbiter read"))
    }

    fn apply_send(&self, request: CallRequest) -> Result<TxReceipt, ChainError> {
        if request.to != self.arbiter {
            return Err(err("submission to unknown contract"));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.block_number += 1;
        inner.now += 13;
        let now = inner.now;
        let block_number = inner.block_number;

        let logs = self.dispatch(&mut inner, &request, now)?;

        inner.nonce += 1;
        let tx_hash = keccak256(inner.nonce.to_be_bytes());
        let receipt = TxReceipt {
            tx_hash,
            block_number,
            block_time: now,
            success: true,
            logs,
        };
        inner.txs.insert(
            tx_hash,
            (
                TxRecord {
                    to: Some(request.to),
                    input: request.data.clone(),
                },
                receipt.clone(),
            ),
        );
        Ok(receipt)
    }

    fn dispatch(
        &self,
        inner: &mut Inner,
        request: &CallRequest,
        now: u64,
    ) -> Result<Vec<LogRecord>, ChainError> {
        let from = request.from;
        let data = &request.data;
        let arbiter = self.arbiter;
        let log = |topics: Vec<B256>, payload: Vec<u8>| LogRecord {
            address: arbiter,
            topics,
            data: payload.into(),
        };

        if let Ok(call) = Arbiter::bondCall::abi_decode(data, true) {
            inner.users.entry(call.user).or_default().balance += request.value;
            return Ok(vec![]);
        }

        if Arbiter::initializeCall::abi_decode(data, true).is_ok() {
            let shadow = inner.users.entry(from).or_default();
            if shadow.initialized {
                return Err(err("already initialized"));
            }
            shadow.initialized = true;
            shadow.state = keccak256(from.as_slice());
            let state = shadow.state;
            return Ok(vec![log(
                vec![NEW_STATE_TOPIC, address_word(from), state],
                vec![],
            )]);
        }

        if let Ok(call) = Arbiter::performCall::abi_decode(data, true) {
            let decoded = self.codec.decode(&call.callData).map_err(|e| err(e))?;
            if decoded.user != from {
                return Err(err("caller is not the embedded user"));
            }
            let new_state = self.execute_logic(&decoded)?;
            let shadow = inner.users.entry(from).or_default();
            if shadow.last_time != 0 {
                return Err(err("account is in optimistic mode"));
            }
            if decoded.current_state != shadow.state {
                return Err(err("stale current state"));
            }
            shadow.state = new_state;
            return Ok(vec![log(
                vec![NEW_STATE_TOPIC, address_word(from), new_state],
                vec![],
            )]);
        }

        if let Ok(call) = Arbiter::performAndExitCall::abi_decode(data, true) {
            let decoded = self.codec.decode(&call.callData).map_err(|e| err(e))?;
            if decoded.user != from {
                return Err(err("caller is not the embedded user"));
            }
            let new_state = self.execute_logic(&decoded)?;
            let lock_time = self.lock_time;
            let shadow = inner.users.entry(from).or_default();
            if shadow.last_time == 0 {
                return Err(err("account is not in optimistic mode"));
            }
            if now < shadow.last_time + lock_time {
                return Err(err("lock window still open"));
            }
            if call.callDataRoot != shadow_root(&shadow.elements)
                || call.lastTime != U256::from(shadow.last_time)
            {
                return Err(err("exit witnesses do not match"));
            }
            if decoded.current_state != shadow.state {
                return Err(err("stale current state"));
            }
            shadow.elements.clear();
            shadow.state = new_state;
            shadow.last_time = 0;
            return Ok(vec![log(
                vec![NEW_STATE_TOPIC, address_word(from), new_state],
                vec![],
            )]);
        }

        if let Some(outcome) = self.try_optimistic(inner, data, from, now)? {
            return Ok(outcome);
        }

        if let Ok(call) = Arbiter::lockCall::abi_decode(data, true) {
            if request.value < required_bond() {
                return Err(err("accuser bond too small"));
            }
            let shadow = inner.users.entry(call.suspect).or_default();
            if shadow.locker != Address::ZERO {
                return Err(err("suspect already locked"));
            }
            shadow.locker = from;
            shadow.locked_at = now;
            return Ok(vec![log(
                vec![LOCKED_TOPIC, address_word(call.suspect), address_word(from)],
                vec![],
            )]);
        }

        if let Ok(call) = Arbiter::unlockCall::abi_decode(data, true) {
            let lock_time = self.lock_time;
            let shadow = inner.users.entry(call.suspect).or_default();
            if shadow.locker == Address::ZERO {
                return Err(err("suspect is not locked"));
            }
            if now < shadow.locked_at + lock_time {
                return Err(err("accuser still has time to prove fraud"));
            }
            if call.callDataRoot != shadow_root(&shadow.elements)
                || call.currentState != shadow.state
                || call.lastTime != U256::from(shadow.last_time)
            {
                return Err(err("unlock witnesses do not match"));
            }
            let locker = shadow.locker;
            shadow.locker = Address::ZERO;
            shadow.locked_at = 0;
            return Ok(vec![log(
                vec![UNLOCKED_TOPIC, address_word(call.suspect), address_word(locker)],
                vec![],
            )]);
        }

        if let Ok(call) = Arbiter::proveFraudCall::abi_decode(data, true) {
            return self.prove_fraud(inner, &call, from, log);
        }

        if let Ok(call) = Arbiter::rollbackCall::abi_decode(data, true) {
            return self.rollback(inner, &call, from, now, log);
        }

        if let Ok(_call) = Arbiter::unbondCall::abi_decode(data, true) {
            let shadow = inner.users.entry(from).or_default();
            if shadow.locker != Address::ZERO {
                return Err(err("cannot unbond while locked"));
            }
            if shadow.last_time != 0 {
                return Err(err("cannot unbond in optimistic mode"));
            }
            shadow.balance = U256::ZERO;
            return Ok(vec![]);
        }

        Err(err("unknown arbiter submission"))
    }

    /// The four optimistic commitment variants share their checks: the
    /// witnesses must match the shadow account and every blob must embed
    /// the committing user.
    fn try_optimistic(
        &self,
        inner: &mut Inner,
        data: &[u8],
        from: Address,
        now: u64,
    ) -> Result<Option<Vec<LogRecord>>, ChainError> {
        let (blobs, new_state, declared_root, declared_time, proof_words, topic) =
            if let Ok(c) = Arbiter::performOptimisticallyAndEnterCall::abi_decode(data, true) {
                (
                    vec![c.callData.to_vec()],
                    c.newState,
                    None,
                    U256::ZERO,
                    c.proof,
                    NEW_OPTIMISTIC_STATE_TOPIC,
                )
            } else if let Ok(c) = Arbiter::performOptimisticallyCall::abi_decode(data, true) {
                (
                    vec![c.callData.to_vec()],
                    c.newState,
                    Some(c.callDataRoot),
                    c.lastTime,
                    c.proof,
                    NEW_OPTIMISTIC_STATE_TOPIC,
                )
            } else if let Ok(c) =
                Arbiter::performManyOptimisticallyAndEnterCall::abi_decode(data, true)
            {
                (
                    c.callData.iter().map(|b| b.to_vec()).collect(),
                    c.newState,
                    None,
                    U256::ZERO,
                    c.proof,
                    NEW_OPTIMISTIC_STATES_TOPIC,
                )
            } else if let Ok(c) = Arbiter::performManyOptimisticallyCall::abi_decode(data, true) {
                (
                    c.callData.iter().map(|b| b.to_vec()).collect(),
                    c.newState,
                    Some(c.callDataRoot),
                    c.lastTime,
                    c.proof,
                    NEW_OPTIMISTIC_STATES_TOPIC,
                )
            } else {
                return Ok(None);
            };

        for blob in &blobs {
            let decoded = self.codec.decode(blob).map_err(|e| err(e))?;
            if decoded.user != from {
                return Err(err("blob embeds a foreign user"));
            }
        }

        let shadow = inner.users.entry(from).or_default();
        if shadow.locker != Address::ZERO {
            return Err(err("account is locked"));
        }
        match declared_root {
            None => {
                if shadow.last_time != 0 {
                    return Err(err("account is already in optimistic mode"));
                }
            }
            Some(root) => {
                if root != shadow_root(&shadow.elements)
                    || declared_time != U256::from(shadow.last_time)
                {
                    return Err(err("optimistic witnesses do not match"));
                }
            }
        }
        // The append witness must describe the stored tree exactly.
        let expected_proof = MerkleTree::from_elements(0, shadow.elements.clone())
            .append_proof()
            .expect("shadow tree is always full");
        let expected_words: Vec<B256> =
            expected_proof.to_words().into_iter().map(b256).collect();
        if proof_words != expected_words {
            return Err(err("append proof does not match the stored tree"));
        }

        shadow.elements.extend(blobs);
        shadow.state = new_state;
        shadow.last_time = now;
        Ok(Some(vec![LogRecord {
            address: self.arbiter,
            topics: vec![topic, address_word(from), word(now)],
            data: Bytes::new(),
        }]))
    }

    fn prove_fraud(
        &self,
        inner: &mut Inner,
        call: &Arbiter::proveFraudCall,
        from: Address,
        log: impl Fn(Vec<B256>, Vec<u8>) -> LogRecord,
    ) -> Result<Vec<LogRecord>, ChainError> {
        let elements: Vec<Vec<u8>> = call.elements.iter().map(|b| b.to_vec()).collect();
        let proof = MultiProof::from_words(
            &call.proof.iter().map(|w| h256(*w)).collect::<Vec<_>>(),
        )
        .map_err(|e| err(e))?;

        let shadow = inner
            .users
            .get_mut(&call.suspect)
            .ok_or_else(|| err("unknown suspect"))?;
        if shadow.locker != from {
            return Err(err("only the locker may prove fraud"));
        }
        if call.callDataRoot != shadow_root(&shadow.elements)
            || call.currentState != shadow.state
            || call.lastTime != U256::from(shadow.last_time)
        {
            return Err(err("fraud witnesses do not match"));
        }
        if !proof.verify(h256(call.callDataRoot), 0, &elements) {
            return Err(err("fraud multi-proof does not verify"));
        }

        let decoded = self.codec.decode(&elements[0]).map_err(|e| err(e))?;
        let actual = self.execute_logic(&decoded)?;
        let claimed = match elements.get(1) {
            Some(next) => self.codec.decode(next).map_err(|e| err(e))?.current_state,
            None => call.currentState,
        };
        if actual == claimed && decoded.user == call.suspect {
            return Err(err("transition is not fraudulent"));
        }

        let transition_index = proof.indices[0];
        let amount = shadow.balance;
        shadow.balance = U256::ZERO;
        shadow.rollback_size = transition_index;
        let suspect = call.suspect;
        inner.users.entry(from).or_default().balance += amount;

        Ok(vec![log(
            vec![
                FRAUD_PROVEN_TOPIC,
                address_word(from),
                address_word(suspect),
                word(transition_index),
            ],
            amount.to_be_bytes::<32>().to_vec(),
        )])
    }

    fn rollback(
        &self,
        inner: &mut Inner,
        call: &Arbiter::rollbackCall,
        from: Address,
        now: u64,
        log: impl Fn(Vec<B256>, Vec<u8>) -> LogRecord,
    ) -> Result<Vec<LogRecord>, ChainError> {
        let shadow = inner
            .users
            .get_mut(&from)
            .ok_or_else(|| err("unknown account"))?;
        if call.currentRoot != shadow_root(&shadow.elements)
            || call.currentState != shadow.state
            || call.lastTime != U256::from(shadow.last_time)
        {
            return Err(err("rollback witnesses do not match"));
        }
        let target = shadow.rollback_size as usize;
        if target >= shadow.elements.len() {
            return Err(err("no rollback pending"));
        }
        if call.oldRoot != shadow_root(&shadow.elements[..target]) {
            return Err(err("old root does not match the rollback target"));
        }
        let rolled: Vec<Vec<u8>> = call.rolledBackCallData.iter().map(|b| b.to_vec()).collect();
        if rolled != shadow.elements[target..].to_vec() {
            return Err(err("rolled back call data does not match"));
        }
        // The append witness must reconnect the shortened tree to the
        // current root.
        let append = compact_merkle::AppendProof::from_words(
            &call.appendProof.iter().map(|w| h256(*w)).collect::<Vec<_>>(),
        )
        .map_err(|e| err(e))?;
        let rebuilt = MerkleTree::from_append_proof(0, rolled.clone(), &append)
            .map_err(|e| err(e))?;
        if b256(rebuilt.root().map_err(|e| err(e))?) != call.currentRoot {
            return Err(err("append proof does not reconnect the trees"));
        }

        let new_state = self.codec.decode(&rolled[0]).map_err(|e| err(e))?.current_state;
        shadow.elements.truncate(target);
        shadow.state = new_state;
        shadow.last_time = now;
        shadow.rollback_size = 0;
        shadow.locker = Address::ZERO;
        shadow.locked_at = 0;
        Ok(vec![log(
            vec![
                ROLLED_BACK_TOPIC,
                address_word(from),
                word(target as u64),
                word(now),
            ],
            vec![],
        )])
    }
}

impl ChainAdapter for MockChain {
    fn transaction(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxRecord, ChainError>> + Send {
        let result = self
            .inner
            .lock()
            .unwrap()
            .txs
            .get(&tx_hash)
            .map(|(tx, _)| tx.clone())
            .ok_or_else(|| err("transaction not found"));
        async move { result }
    }

    fn receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send {
        let result = self
            .inner
            .lock()
            .unwrap()
            .txs
            .get(&tx_hash)
            .map(|(_, receipt)| receipt.clone())
            .ok_or_else(|| err("receipt not found"));
        async move { result }
    }

    fn call(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<Bytes, ChainError>> + Send {
        let result = self.apply_call(request);
        async move { result }
    }

    fn send(
        &self,
        request: CallRequest,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send {
        let result = self.apply_send(request);
        async move { result }
    }

    fn estimate_gas(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send {
        let gas = 21_000 + 16 * request.data.len() as u64;
        async move { Ok(gas) }
    }

    fn latest_block_time(&self) -> impl Future<Output = Result<u64, ChainError>> + Send {
        let now = self.now();
        async move { Ok(now) }
    }
}
