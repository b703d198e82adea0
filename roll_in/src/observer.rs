//! Observing third-party transactions: decode, verify, accuse.

use alloy::primitives::{Address, B256};
use roll_in_common::u64_from_word;
use tracing::warn;

use crate::{
    chain::{ChainAdapter, TxReceipt},
    codec::{
        decode_optimistic_record, OptimisticRecord, NEW_OPTIMISTIC_STATES_TOPIC,
        NEW_OPTIMISTIC_STATE_TOPIC,
    },
    error::{RollInError, RollInResult},
    fraud::Fraudster,
    operator::OptimisticRollIn,
};

/// The semantic verdict on an observed transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VerifyOutcome {
    /// `false` only when an optimistic commitment failed verification.
    pub valid: bool,
    /// The committing user, when the transaction was an optimistic
    /// commitment at all.
    pub suspect: Option<Address>,
}

/// Locates the `NewOptimisticState(s)` log and extracts the committing
/// user and the commitment block time.
fn optimistic_state_log(receipt: &TxReceipt) -> RollInResult<Option<(Address, u64)>> {
    for log in &receipt.logs {
        let Some(first) = log.topics.first() else {
            continue;
        };
        if *first != NEW_OPTIMISTIC_STATE_TOPIC && *first != NEW_OPTIMISTIC_STATES_TOPIC {
            continue;
        }
        let user_word = log
            .topics
            .get(1)
            .ok_or_else(|| RollInError::Decode("optimistic event has no user topic".into()))?;
        let time_word = log
            .topics
            .get(2)
            .ok_or_else(|| RollInError::Decode("optimistic event has no time topic".into()))?;
        let suspect = Address::from_slice(&user_word.as_slice()[12..]);
        let last_time = u64_from_word(&time_word.0)
            .ok_or_else(|| RollInError::Decode("optimistic block time overflows u64".into()))?;
        return Ok(Some((suspect, last_time)));
    }
    Ok(None)
}

impl<C: ChainAdapter> OptimisticRollIn<C> {
    async fn fetch_optimistic_record(
        &self,
        tx_hash: B256,
    ) -> RollInResult<Option<(Address, u64, Option<OptimisticRecord>)>> {
        let tx = self.chain.transaction(tx_hash).await?;
        let receipt = self.chain.receipt(tx_hash).await?;
        let Some((suspect, last_time)) = optimistic_state_log(&receipt)? else {
            return Ok(None);
        };
        Ok(Some((
            suspect,
            last_time,
            decode_optimistic_record(&tx.input)?,
        )))
    }

    /// Verifies an observed transaction. Anything that is not an
    /// optimistic commitment is vacuously valid; a commitment is
    /// re-executed transition by transition, and on the first failure the
    /// suspect is recorded as a [`Fraudster`] rebuilt from the
    /// transaction's calldata and append proof alone.
    pub async fn verify_transaction(&mut self, tx_hash: B256) -> RollInResult<VerifyOutcome> {
        let Some((suspect, last_time, record)) = self.fetch_optimistic_record(tx_hash).await?
        else {
            return Ok(VerifyOutcome {
                valid: true,
                suspect: None,
            });
        };
        // An optimistic event without a recognised commitment sighash has
        // nothing to verify.
        let Some(record) = record else {
            return Ok(VerifyOutcome {
                valid: true,
                suspect: Some(suspect),
            });
        };

        let first_invalid = self
            .verifier
            .first_invalid(
                &self.chain,
                &self.codec,
                suspect,
                &record.call_data,
                record.new_state,
            )
            .await;
        match first_invalid {
            None => Ok(VerifyOutcome {
                valid: true,
                suspect: Some(suspect),
            }),
            Some(local_index) => {
                warn!(
                    suspect = %suspect,
                    local_index,
                    batch = record.batch,
                    "observed invalid optimistic transition"
                );
                let fraudster = Fraudster::record(
                    self.config.element_prefix,
                    suspect,
                    &record,
                    last_time,
                    local_index as u64,
                )?;
                self.frauds.insert(suspect, fraudster);
                Ok(VerifyOutcome {
                    valid: false,
                    suspect: Some(suspect),
                })
            }
        }
    }

    /// Folds a later observed transaction by an already-tracked suspect
    /// into its fraudster, keeping the partial tree aligned with the
    /// chain until the fraud proof is submitted.
    pub async fn update_fraudster(&mut self, tx_hash: B256) -> RollInResult<()> {
        let Some((suspect, last_time, record)) = self.fetch_optimistic_record(tx_hash).await?
        else {
            return Err(RollInError::PreconditionFailed(
                "transaction is not an optimistic commitment",
            ));
        };
        let record = record.ok_or(RollInError::PreconditionFailed(
            "transaction is not an optimistic commitment",
        ))?;
        let fraudster = self
            .frauds
            .get_mut(&suspect)
            .ok_or(RollInError::NotFraudulent(suspect))?;
        fraudster.apply(&self.codec, &record, last_time)
    }
}
