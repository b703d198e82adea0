//! The transition queue and its gas-bounded batching planner.

use std::collections::{HashMap, VecDeque};

use alloy::primitives::B256;
use tracing::debug;

use crate::{
    chain::{CallRequest, ChainAdapter},
    error::{RollInError, RollInResult},
};

/// A transition waiting to be flushed optimistically.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueuedTransition {
    /// Logic function name.
    pub function: String,
    /// Function-specific argument words.
    pub args: Vec<B256>,
    /// The state this transition is predicted to produce.
    pub new_state: B256,
}

/// An append-only, insertion-ordered queue of transitions. Order is
/// significant: each entry's calldata embeds the predicted state of its
/// predecessor.
#[derive(Debug, Default)]
pub struct TransitionQueue {
    items: VecDeque<QueuedTransition>,
}

impl TransitionQueue {
    /// Appends a transition.
    pub fn push(&mut self, transition: QueuedTransition) {
        self.items.push_back(transition);
    }

    /// Number of queued transitions.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates the queue front to back.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedTransition> {
        self.items.iter()
    }

    /// The state the account will hold once the queue fully flushes: the
    /// last queued prediction, or `fallback` when nothing is queued.
    pub fn queued_state(&self, fallback: B256) -> B256 {
        self.items.back().map_or(fallback, |t| t.new_state)
    }

    /// Drops the first `count` transitions after a successful flush.
    pub fn drop_prefix(&mut self, count: usize) {
        self.items.drain(..count.min(self.items.len()));
    }
}

/// Picks the longest queue prefix whose submission fits under `ceiling`
/// gas, by binary search over prefix lengths with memoised estimates.
///
/// `build` constructs the submission for a candidate prefix length; the
/// estimate comes from the chain adapter. The estimator is assumed
/// monotonic non-decreasing in prefix length; a violation degrades the
/// choice but never the correctness of what is submitted. Fails with
/// [`RollInError::BudgetExceeded`] when even a single transition does not
/// fit.
pub async fn longest_affordable_prefix<C, B>(
    chain: &C,
    ceiling: u64,
    len: usize,
    mut build: B,
) -> RollInResult<usize>
where
    C: ChainAdapter,
    B: FnMut(usize) -> RollInResult<CallRequest>,
{
    debug_assert!(len > 0);
    let mut memo: HashMap<usize, u64> = HashMap::new();

    let single = {
        let request = build(1)?;
        let gas = chain.estimate_gas(&request).await?;
        memo.insert(1, gas);
        gas
    };
    if single > ceiling {
        return Err(RollInError::BudgetExceeded(single));
    }

    let mut lo = 1;
    let mut hi = len;
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        let gas = match memo.get(&mid) {
            Some(gas) => *gas,
            None => {
                let request = build(mid)?;
                let gas = chain.estimate_gas(&request).await?;
                memo.insert(mid, gas);
                gas
            }
        };
        if gas <= ceiling {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    debug!(prefix = lo, queued = len, ceiling, "selected queue prefix");
    Ok(lo)
}
