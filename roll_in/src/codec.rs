//! Calldata codecs for the two consumed contracts.
//!
//! The arbiter's interface is fixed by the protocol and declared with
//! `sol!`, so selectors used for encoding and for classifying observed
//! transactions can never drift apart. The logic contract is application
//! defined; [`LogicCodec`] wraps its JSON interface description and
//! enforces the protocol's calling convention: every logic function's
//! first two parameters are the acting `user` and the account's
//! `current_state`, followed by function-specific arguments.

use std::collections::HashMap;

use alloy::{
    dyn_abi::{DynSolValue, JsonAbiExt as _, Specifier as _},
    json_abi::{Function, JsonAbi, StateMutability},
    primitives::{b256, Address, B256, U256},
    sol,
    sol_types::SolCall as _,
};
use compact_merkle::AppendProof;
use roll_in_common::{decode_hex, u256_be};

use crate::{
    compat::to_h256_words,
    error::{RollInError, RollInResult},
};

sol! {
    /// The on-chain arbiter enforcing bonds, locks, rollbacks and fraud
    /// adjudication.
    #[allow(missing_docs)]
    interface Arbiter {
        function bond(address user) external payable;
        function initialize() external payable;
        function perform(bytes callData) external payable;
        function performAndExit(bytes callData, bytes32 callDataRoot, uint256 lastTime) external;
        function performOptimisticallyAndEnter(bytes callData, bytes32 newState, bytes32[] proof) external;
        function performOptimistically(bytes callData, bytes32 newState, bytes32 callDataRoot, bytes32[] proof, uint256 lastTime) external;
        function performManyOptimisticallyAndEnter(bytes[] callData, bytes32 newState, bytes32[] proof) external;
        function performManyOptimistically(bytes[] callData, bytes32 newState, bytes32 callDataRoot, bytes32[] proof, uint256 lastTime) external;
        function lock(address suspect) external payable;
        function unlock(address suspect, bytes32 currentState, bytes32 callDataRoot, uint256 lastTime) external payable;
        function proveFraud(address suspect, bytes[] elements, bytes32 currentState, bytes32 callDataRoot, bytes32[] proof, uint256 lastTime) external;
        function rollback(bytes32 oldRoot, bytes[] rolledBackCallData, bytes32[] appendProof, uint256 currentSize, bytes32[] sizeProof, bytes32 currentRoot, bytes32 currentState, uint256 lastTime) external payable;
        function unbond(address destination) external;

        function accountStates(address user) external view returns (bytes32);
        function balances(address user) external view returns (uint256);
        function lockers(address user) external view returns (address);
        function lockedTimestamps(address user) external view returns (uint256);
        function rollbackSizes(address user) external view returns (uint256);
    }
}

/// Topic of `NewOptimisticState(user, blockTime)`.
pub const NEW_OPTIMISTIC_STATE_TOPIC: B256 =
    b256!("4779c4b07abff82b16061ec9a47d081e7f4981c29088395cdb7ff87e322cbbc6");
/// Topic of `NewOptimisticStates(user, blockTime)`.
pub const NEW_OPTIMISTIC_STATES_TOPIC: B256 =
    b256!("0b87b136840d19f5f25329273082c00833265a189b70137e06df6315ddc7839e");
/// Topic of `NewState(user, newState)`.
pub const NEW_STATE_TOPIC: B256 =
    b256!("0f5025cc4f20aa47a346d1b7d9da6ba8c68cc8e83b75e813da4b4490d55365ae");
/// Topic of `FraudProven(accuser, suspect, transitionIndex, amount)`.
pub const FRAUD_PROVEN_TOPIC: B256 =
    b256!("a66290bc21cee2ba1a3c6ba2cac21d24511cea1f9ed7efe453736f24fd894886");
/// Topic of `Locked(suspect, accuser)`.
pub const LOCKED_TOPIC: B256 =
    b256!("8773bde6581ad6ddd421210de867340039fb65ce3df41edba7b5de6d24ae7a51");
/// Topic of `Unlocked(suspect, accuser)`.
pub const UNLOCKED_TOPIC: B256 =
    b256!("524512344e535e9bda79e916c2ea8c7b9e5d23d83e1b95181d7622b4ac3d4293");
/// Topic of `RolledBack(user, treeSize, blockTime)`.
pub const ROLLED_BACK_TOPIC: B256 =
    b256!("4d7ed8c49e6b03daee23a18f4bd14bd7e4628e5ed54c57bf84407a693867eca9");

/// Converts a `uint256` field that the protocol bounds to 64 bits.
pub(crate) fn u256_to_u64(v: U256) -> RollInResult<u64> {
    u64::try_from(v).map_err(|_| RollInError::Decode("uint256 field overflows u64".into()))
}

/// An observed optimistic-mode commitment, decoded from arbiter calldata.
///
/// Covers all four optimistic sighashes; the single-transition variants
/// decode to a one-element `call_data`.
#[derive(Clone, Debug)]
pub struct OptimisticRecord {
    /// The committed call-data blobs, in execution order.
    pub call_data: Vec<Vec<u8>>,
    /// The declared state after the last transition.
    pub new_state: B256,
    /// The declared prior tree root; `None` for the enter variants, which
    /// assert an empty tree.
    pub prev_root: Option<B256>,
    /// The declared prior commitment time; 0 for the enter variants.
    pub prev_last_time: u64,
    /// The append witness accompanying the commitment.
    pub proof: AppendProof,
    /// Whether the batch sighash was used.
    pub batch: bool,
}

/// Decodes arbiter calldata into an [`OptimisticRecord`], or `None` when
/// the sighash is not one of the four optimistic commitments.
pub fn decode_optimistic_record(input: &[u8]) -> RollInResult<Option<OptimisticRecord>> {
    let selector: [u8; 4] = input
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| RollInError::Decode("calldata shorter than a selector".into()))?;

    let record = if selector == Arbiter::performOptimisticallyAndEnterCall::SELECTOR {
        let call = Arbiter::performOptimisticallyAndEnterCall::abi_decode(input, true)?;
        OptimisticRecord {
            call_data: vec![call.callData.to_vec()],
            new_state: call.newState,
            prev_root: None,
            prev_last_time: 0,
            proof: AppendProof::from_words(&to_h256_words(&call.proof))?,
            batch: false,
        }
    } else if selector == Arbiter::performOptimisticallyCall::SELECTOR {
        let call = Arbiter::performOptimisticallyCall::abi_decode(input, true)?;
        OptimisticRecord {
            call_data: vec![call.callData.to_vec()],
            new_state: call.newState,
            prev_root: Some(call.callDataRoot),
            prev_last_time: u256_to_u64(call.lastTime)?,
            proof: AppendProof::from_words(&to_h256_words(&call.proof))?,
            batch: false,
        }
    } else if selector == Arbiter::performManyOptimisticallyAndEnterCall::SELECTOR {
        let call = Arbiter::performManyOptimisticallyAndEnterCall::abi_decode(input, true)?;
        OptimisticRecord {
            call_data: call.callData.iter().map(|b| b.to_vec()).collect(),
            new_state: call.newState,
            prev_root: None,
            prev_last_time: 0,
            proof: AppendProof::from_words(&to_h256_words(&call.proof))?,
            batch: true,
        }
    } else if selector == Arbiter::performManyOptimisticallyCall::SELECTOR {
        let call = Arbiter::performManyOptimisticallyCall::abi_decode(input, true)?;
        OptimisticRecord {
            call_data: call.callData.iter().map(|b| b.to_vec()).collect(),
            new_state: call.newState,
            prev_root: Some(call.callDataRoot),
            prev_last_time: u256_to_u64(call.lastTime)?,
            proof: AppendProof::from_words(&to_h256_words(&call.proof))?,
            batch: true,
        }
    } else {
        return Ok(None);
    };

    Ok(Some(record))
}

/// A decoded logic-contract call.
#[derive(Clone, Debug)]
pub struct LogicCall {
    /// The 4-byte function selector.
    pub selector: [u8; 4],
    /// Resolved function name.
    pub function: String,
    /// The acting user embedded in the calldata.
    pub user: Address,
    /// The account state the call claims to act on.
    pub current_state: B256,
    /// Function-specific arguments, after the two mandatory fields.
    pub args: Vec<DynSolValue>,
}

/// Encoder/decoder for the application's logic contract.
#[derive(Clone, Debug)]
pub struct LogicCodec {
    functions: HashMap<String, Function>,
    by_selector: HashMap<[u8; 4], String>,
}

impl LogicCodec {
    /// Wraps an interface description, checking every function honors the
    /// `(user, current_state, ...)` calling convention.
    pub fn new(abi: &JsonAbi) -> RollInResult<Self> {
        let mut functions = HashMap::new();
        let mut by_selector = HashMap::new();
        for function in abi.functions() {
            let leading: Vec<&str> = function.inputs.iter().take(2).map(|p| p.ty.as_str()).collect();
            if leading != ["address", "bytes32"] {
                return Err(RollInError::Decode(format!(
                    "logic function {} must lead with (address user, bytes32 currentState)",
                    function.name
                )));
            }
            by_selector.insert(function.selector().0, function.name.clone());
            functions.insert(function.name.clone(), function.clone());
        }
        Ok(Self {
            functions,
            by_selector,
        })
    }

    fn function(&self, name: &str) -> RollInResult<&Function> {
        self.functions
            .get(name)
            .ok_or(RollInError::PreconditionFailed(
                "unknown logic function name",
            ))
    }

    /// Whether the named function is `pure`/`view` and thus eligible for
    /// optimistic execution and queueing.
    pub fn is_pure(&self, name: &str) -> RollInResult<bool> {
        Ok(matches!(
            self.function(name)?.state_mutability,
            StateMutability::Pure | StateMutability::View
        ))
    }

    /// The named function's selector.
    pub fn selector(&self, name: &str) -> RollInResult<[u8; 4]> {
        Ok(self.function(name)?.selector().0)
    }

    /// Encodes a call-data blob. `args` are 32-byte words, one per
    /// function-specific parameter, each reinterpreted under the
    /// parameter's declared type.
    pub fn encode(
        &self,
        name: &str,
        user: Address,
        current_state: B256,
        args: &[B256],
    ) -> RollInResult<Vec<u8>> {
        let function = self.function(name)?;
        if args.len() + 2 != function.inputs.len() {
            return Err(RollInError::PreconditionFailed(
                "logic argument count mismatch",
            ));
        }
        let mut values = Vec::with_capacity(function.inputs.len());
        values.push(DynSolValue::Address(user));
        values.push(DynSolValue::FixedBytes(current_state, 32));
        for (word, param) in args.iter().zip(function.inputs.iter().skip(2)) {
            let ty = param.resolve()?;
            values.push(ty.abi_decode(word.as_slice())?);
        }
        Ok(function.abi_encode_input(&values)?)
    }

    /// Decodes a call-data blob into its semantic record.
    pub fn decode(&self, blob: &[u8]) -> RollInResult<LogicCall> {
        let selector: [u8; 4] = blob
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| RollInError::Decode("call data shorter than a selector".into()))?;
        let name = self
            .by_selector
            .get(&selector)
            .ok_or_else(|| RollInError::Decode("unknown logic selector".into()))?;
        let function = &self.functions[name];
        let mut values = function.abi_decode_input(&blob[4..], true)?;
        if values.len() < 2 {
            return Err(RollInError::Decode(
                "logic call data is missing the mandatory fields".into(),
            ));
        }
        let args = values.split_off(2);
        let current_state = match values.pop() {
            Some(DynSolValue::FixedBytes(word, 32)) => word,
            _ => {
                return Err(RollInError::Decode(
                    "logic currentState field is not bytes32".into(),
                ))
            }
        };
        let user = match values.pop() {
            Some(DynSolValue::Address(address)) => address,
            _ => {
                return Err(RollInError::Decode(
                    "logic user field is not an address".into(),
                ))
            }
        };
        Ok(LogicCall {
            selector,
            function: name.clone(),
            user,
            current_state,
            args,
        })
    }
}

/// Normalises a `u64` scalar into a 32-byte argument word.
pub fn arg_word(v: u64) -> B256 {
    B256::new(u256_be(v))
}

/// Normalises a hex scalar (`0x`-prefixed or bare) into a left-padded
/// 32-byte argument word.
pub fn arg_word_from_hex(s: &str) -> RollInResult<B256> {
    let bytes = decode_hex(s).map_err(|e| RollInError::Decode(e.to_string()))?;
    if bytes.len() > 32 {
        return Err(RollInError::Decode("hex scalar longer than 32 bytes".into()));
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(B256::new(word))
}
