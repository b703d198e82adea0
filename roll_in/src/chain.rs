//! The chain seam: everything the engine suspends on.
//!
//! All chain I/O is driven through the application-supplied
//! [`ChainAdapter`], which is responsible for signing, timeouts and
//! retries. The engine never retries; adapter failures surface as
//! [`ChainError`]. Every adapter method is cancel-safe from the engine's
//! point of view: no local state is advanced until the returned future
//! resolves.

use std::future::Future;
use std::sync::Arc;

use alloy::{
    primitives::{Address, B256, Bytes, TxKind, U256},
    providers::Provider,
    rpc::types::{BlockId, BlockTransactionsKind, TransactionInput, TransactionRequest},
    transports::Transport,
};
use anyhow::{anyhow, Context as _};

use crate::error::ChainError;

/// A fully-specified call or submission. The engine never signs; the
/// adapter derives whatever it needs from `from`.
#[derive(Clone, Debug)]
pub struct CallRequest {
    /// Sender address.
    pub from: Address,
    /// Target contract.
    pub to: Address,
    /// Attached value in wei.
    pub value: U256,
    /// ABI-encoded calldata.
    pub data: Bytes,
    /// Explicit gas limit, if the caller wants one.
    pub gas: Option<u64>,
}

/// A raw transaction as fetched from the chain.
#[derive(Clone, Debug)]
pub struct TxRecord {
    /// Target of the transaction, absent for contract creations.
    pub to: Option<Address>,
    /// Raw input bytes.
    pub input: Bytes,
}

/// A single receipt log.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics, `topics[0]` being the event signature.
    pub topics: Vec<B256>,
    /// Unindexed payload.
    pub data: Bytes,
}

/// A mined transaction receipt, with the containing block's timestamp
/// already resolved.
#[derive(Clone, Debug)]
pub struct TxReceipt {
    /// Hash of the transaction.
    pub tx_hash: B256,
    /// Number of the containing block.
    pub block_number: u64,
    /// Timestamp of the containing block, in epoch seconds.
    pub block_time: u64,
    /// Whether execution succeeded.
    pub success: bool,
    /// Emitted logs.
    pub logs: Vec<LogRecord>,
}

/// The chain reads and writes the engine suspends on.
pub trait ChainAdapter: Send + Sync {
    /// Fetches a transaction's raw input.
    fn transaction(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxRecord, ChainError>> + Send;

    /// Fetches a mined transaction's receipt.
    fn receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send;

    /// Executes a read-only call.
    fn call(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<Bytes, ChainError>> + Send;

    /// Signs, submits, and waits for the receipt.
    fn send(
        &self,
        request: CallRequest,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send;

    /// Estimates the gas a submission would cost.
    fn estimate_gas(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Timestamp of the latest block, in epoch seconds.
    fn latest_block_time(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;
}

impl<C: ChainAdapter + Sync> ChainAdapter for &C {
    fn transaction(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxRecord, ChainError>> + Send {
        (**self).transaction(tx_hash)
    }

    fn receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send {
        (**self).receipt(tx_hash)
    }

    fn call(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<Bytes, ChainError>> + Send {
        (**self).call(request)
    }

    fn send(
        &self,
        request: CallRequest,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send {
        (**self).send(request)
    }

    fn estimate_gas(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send {
        (**self).estimate_gas(request)
    }

    fn latest_block_time(&self) -> impl Future<Output = Result<u64, ChainError>> + Send {
        (**self).latest_block_time()
    }
}

impl<C: ChainAdapter + Send + Sync> ChainAdapter for Arc<C> {
    fn transaction(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxRecord, ChainError>> + Send {
        (**self).transaction(tx_hash)
    }

    fn receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send {
        (**self).receipt(tx_hash)
    }

    fn call(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<Bytes, ChainError>> + Send {
        (**self).call(request)
    }

    fn send(
        &self,
        request: CallRequest,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send {
        (**self).send(request)
    }

    fn estimate_gas(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send {
        (**self).estimate_gas(request)
    }

    fn latest_block_time(&self) -> impl Future<Output = Result<u64, ChainError>> + Send {
        (**self).latest_block_time()
    }
}

/// [`ChainAdapter`] over an `alloy` provider.
///
/// Signing is whatever the provider is configured with (wallet filler,
/// remote signer); retries belong in the transport layer.
#[derive(Debug)]
pub struct AlloyChain<ProviderT, TransportT> {
    provider: ProviderT,
    _phantom: std::marker::PhantomData<TransportT>,
}

impl<ProviderT, TransportT> AlloyChain<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    /// Wraps a provider.
    pub fn new(provider: ProviderT) -> Self {
        Self {
            provider,
            _phantom: std::marker::PhantomData,
        }
    }

    fn to_tx_request(request: &CallRequest) -> TransactionRequest {
        let mut tx = TransactionRequest::default();
        tx.from = Some(request.from);
        tx.to = Some(TxKind::Call(request.to));
        tx.value = Some(request.value);
        tx.input = TransactionInput::new(request.data.clone());
        tx.gas = request.gas.map(u128::from);
        tx
    }

    async fn receipt_with_time(
        &self,
        receipt: alloy::rpc::types::TransactionReceipt,
    ) -> Result<TxReceipt, ChainError> {
        let block_number = receipt
            .block_number
            .ok_or_else(|| anyhow!("receipt for {} has no block number", receipt.transaction_hash))?;
        let block = self
            .provider
            .get_block(BlockId::from(block_number), BlockTransactionsKind::Hashes)
            .await
            .context("failed to fetch containing block")?
            .ok_or_else(|| anyhow!("block {block_number} not found"))?;
        let logs = receipt
            .inner
            .logs()
            .iter()
            .map(|log| LogRecord {
                address: log.inner.address,
                topics: log.inner.data.topics().to_vec(),
                data: log.inner.data.data.clone(),
            })
            .collect();
        Ok(TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_number,
            block_time: block.header.timestamp,
            success: receipt.status(),
            logs,
        })
    }
}

impl<ProviderT, TransportT> ChainAdapter for AlloyChain<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT> + Send + Sync,
    TransportT: Transport + Clone,
{
    fn transaction(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxRecord, ChainError>> + Send {
        async move {
            let tx = self
                .provider
                .get_transaction_by_hash(tx_hash)
                .await
                .context("failed to fetch transaction")?
                .ok_or_else(|| anyhow!("transaction {tx_hash} not found"))?;
            Ok(TxRecord {
                to: tx.to,
                input: tx.input,
            })
        }
    }

    fn receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send {
        async move {
            let receipt = self
                .provider
                .get_transaction_receipt(tx_hash)
                .await
                .context("failed to fetch receipt")?
                .ok_or_else(|| anyhow!("receipt for {tx_hash} not found"))?;
            self.receipt_with_time(receipt).await
        }
    }

    fn call(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<Bytes, ChainError>> + Send {
        let tx = Self::to_tx_request(request);
        async move {
            let out = self
                .provider
                .call(&tx)
                .await
                .context("eth_call failed")?;
            Ok(out)
        }
    }

    fn send(
        &self,
        request: CallRequest,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send {
        async move {
            let tx = Self::to_tx_request(&request);
            let receipt = self
                .provider
                .send_transaction(tx)
                .await
                .context("failed to submit transaction")?
                .get_receipt()
                .await
                .context("failed waiting for receipt")?;
            self.receipt_with_time(receipt).await
        }
    }

    fn estimate_gas(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send {
        let tx = Self::to_tx_request(request);
        async move {
            let gas = self
                .provider
                .estimate_gas(&tx)
                .await
                .context("gas estimation failed")?;
            Ok(u64::try_from(gas).unwrap_or(u64::MAX))
        }
    }

    fn latest_block_time(&self) -> impl Future<Output = Result<u64, ChainError>> + Send {
        async move {
            let block = self
                .provider
                .get_block(BlockId::latest(), BlockTransactionsKind::Hashes)
                .await
                .context("failed to fetch latest block")?
                .ok_or_else(|| anyhow!("no latest block"))?;
            Ok(block.header.timestamp)
        }
    }
}
