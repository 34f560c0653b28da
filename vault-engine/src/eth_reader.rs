// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_reader::{CallOutcome, ChainReader, ContractCall};
use crate::config::ReaderConfig;
use crate::error::ReadError;
use crate::metered_eth_provider::{new_metered_eth_provider, MeteredEthHttpProvider};
use crate::metrics::VaultEngineMetrics;
use crate::retry_with_max_elapsed_time;
use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, Middleware, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, Log, TransactionRequest, H256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tap::TapFallible;

/// `ChainReader` over an ethers provider. Every call is bounded by the call
/// timeout, and transient failures are retried within the retry budget.
pub struct EthChainReader<P> {
    provider: Provider<P>,
    call_timeout: Duration,
    max_retry_elapsed: Duration,
    metrics: Arc<VaultEngineMetrics>,
}

impl EthChainReader<MeteredEthHttpProvider> {
    pub async fn connect(
        provider_url: &str,
        expected_chain_id: Option<u64>,
        config: &ReaderConfig,
        metrics: Arc<VaultEngineMetrics>,
    ) -> anyhow::Result<Self> {
        let provider =
            new_metered_eth_provider(provider_url, metrics.clone(), config.max_concurrent_requests)?;
        let reader = Self::new(provider, config, metrics);
        reader.describe(expected_chain_id).await?;
        Ok(reader)
    }
}

impl<P> EthChainReader<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(provider: Provider<P>, config: &ReaderConfig, metrics: Arc<VaultEngineMetrics>) -> Self {
        Self {
            provider,
            call_timeout: config.call_timeout,
            max_retry_elapsed: config.max_retry_elapsed,
            metrics,
        }
    }

    pub async fn chain_id(&self) -> Result<u64, ReadError> {
        self.execute("chainId", || self.provider.get_chainid())
            .await
            .map(|id| id.as_u64())
    }

    // Validate chain identifier and log connection info
    pub async fn describe(&self, expected_chain_id: Option<u64>) -> anyhow::Result<()> {
        let chain_id = self.chain_id().await?;
        let block_number = self.latest_block().await?;
        match expected_chain_id {
            Some(expected) if expected != chain_id => Err(anyhow::anyhow!(
                "Chain ID mismatch: expected {}, got {}. This could indicate connecting to the wrong network!",
                expected,
                chain_id
            )),
            Some(_) => {
                tracing::info!(
                    "EthChainReader connected to chain {} (verified), current block: {}",
                    chain_id,
                    block_number
                );
                Ok(())
            }
            None => {
                tracing::warn!(
                    "EthChainReader connected to chain {} (NOT VERIFIED - no expected chain ID set), current block: {}",
                    chain_id,
                    block_number
                );
                Ok(())
            }
        }
    }

    async fn execute<T, F, Fut>(&self, label: &'static str, op: F) -> Result<T, ReadError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.metrics.chain_reads.with_label_values(&[label]).inc();
        let timer = self
            .metrics
            .chain_reads_latency
            .with_label_values(&[label])
            .start_timer();
        let result = retry_with_max_elapsed_time!(self.attempt(label, &op), self.max_retry_elapsed);
        timer.observe_duration();

        match &result {
            Ok(_) => self.metrics.eth_node_connected.set(1),
            Err(ReadError::Transport(_) | ReadError::Timeout { .. }) => {
                self.metrics.eth_node_connected.set(0)
            }
            Err(_) => {}
        }
        result.tap_err(|e| {
            self.metrics
                .eth_rpc_errors
                .with_label_values(&[e.error_type()])
                .inc();
            tracing::warn!("[EthChainReader] {} failed: {}", label, e);
        })
    }

    async fn attempt<T, F, Fut>(&self, label: &'static str, op: &F) -> Result<T, ReadError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.call_timeout, op()).await {
            Ok(result) => result.map_err(read_error_from_provider),
            Err(_) => Err(ReadError::Timeout {
                label: label.to_string(),
                after: self.call_timeout,
            }),
        }
    }
}

#[async_trait]
impl<P> ChainReader for EthChainReader<P>
where
    P: JsonRpcClient + 'static,
{
    async fn batch_read(&self, calls: &[ContractCall]) -> Result<Vec<CallOutcome>, ReadError> {
        let reads = calls.iter().map(|call| self.read_one(call));
        Ok(futures::future::join_all(reads).await)
    }

    async fn read_one(&self, call: &ContractCall) -> Result<Bytes, ReadError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(call.target)
            .data(call.calldata.clone())
            .into();
        self.execute(call.label, || self.provider.call(&tx, None))
            .await
    }

    // Note: query may fail if range is too big for the provider.
    async fn get_logs(
        &self,
        address: Address,
        event_signature: H256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ReadError> {
        let filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .address(address)
            .topic0(event_signature);
        let logs = self
            .execute("getLogs", || self.provider.get_logs(&filter))
            .await?;

        // Safeguard check that all events are emitted from requested contract address
        if let Some(log) = logs.iter().find(|log| log.address != address) {
            return Err(ReadError::Inconsistent(format!(
                "provider returned a log from {:?} when asked for {:?}",
                log.address, address
            )));
        }
        Ok(logs)
    }

    async fn latest_block(&self) -> Result<u64, ReadError> {
        self.execute("blockNumber", || self.provider.get_block_number())
            .await
            .map(|n| n.as_u64())
    }
}

pub(crate) fn read_error_from_provider(e: ProviderError) -> ReadError {
    if let Some(rpc) = e.as_error_response() {
        return ReadError::Rpc {
            code: rpc.code,
            message: rpc.message.clone(),
        };
    }
    if let Some(serde) = e.as_serde_error() {
        return ReadError::Decode(serde.to_string());
    }
    match e {
        ProviderError::HexError(e) => ReadError::Decode(e.to_string()),
        other => ReadError::Transport(other.to_string()),
    }
}
