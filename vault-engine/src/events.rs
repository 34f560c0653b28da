// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Replays a vault's event logs into typed records.
//!
//! The three streams (Deposit, WithdrawRequested, UpdateProcessed) are fetched
//! as independent range queries over `[start_block, latest]`. Collection is
//! all-or-nothing: one failing stream fails the whole call.

use crate::abi::{DepositFilter, UpdateProcessedFilter, WithdrawRequestedFilter};
use crate::chain_reader::ChainReader;
use crate::config::VaultMetadata;
use crate::error::{EngineError, EngineResult, ReadError};
use crate::format::{format_amount, SHARES_UNIT};
use crate::metrics::VaultEngineMetrics;
use crate::snapshot::{read_decimals, VaultDecimals};
use crate::types::{
    sort_chronologically, Chronological, CollectedEvents, DepositEvent, LogPosition,
    UpdateProcessedEvent, WithdrawRequestEvent,
};
use ethers::abi::RawLog;
use ethers::contract::{EthEvent, EthLogDecode};
use ethers::types::Log;
use std::sync::Arc;
use tap::TapFallible;
use tracing::{debug, info, warn};

const DEPOSIT_STREAM: &str = "Deposit";
const WITHDRAW_REQUESTED_STREAM: &str = "WithdrawRequested";
const UPDATE_PROCESSED_STREAM: &str = "UpdateProcessed";
const LATEST_BLOCK_STREAM: &str = "latestBlock";
const DECIMALS_STREAM: &str = "decimals";

// The history view cannot format any stream without decimals, so their
// failure is reported like a failed stream.
fn decimals_failure(vault_id: &str, error: EngineError) -> EngineError {
    let source = match error {
        EngineError::ChainRead { source, .. } => source,
        EngineError::DataIntegrity { reason, .. } => ReadError::Inconsistent(reason),
        other => return other,
    };
    EngineError::LogFetch {
        vault_id: vault_id.to_string(),
        stream: DECIMALS_STREAM,
        source,
    }
}

fn log_position(log: &Log) -> Result<LogPosition, ReadError> {
    let block_number = log
        .block_number
        .ok_or_else(|| ReadError::Decode("log without block number".to_string()))?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| ReadError::Decode("log without transaction hash".to_string()))?;
    Ok(LogPosition {
        block_number: block_number.as_u64(),
        tx_hash,
        log_index: log.log_index.map(|i| i.low_u64()).unwrap_or_default(),
    })
}

fn decode_log<E: EthLogDecode>(log: &Log) -> Result<E, ReadError> {
    E::decode_log(&RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    })
    .map_err(|e| ReadError::Decode(e.to_string()))
}

/// Conversion from a decoded log into its display record.
trait FromVaultLog: Chronological + Sized {
    type Raw: EthLogDecode + EthEvent;

    fn from_raw(
        raw: Self::Raw,
        position: LogPosition,
        vault: &VaultMetadata,
        decimals: VaultDecimals,
        precision: usize,
    ) -> Self;
}

impl FromVaultLog for DepositEvent {
    type Raw = DepositFilter;

    fn from_raw(
        raw: DepositFilter,
        position: LogPosition,
        vault: &VaultMetadata,
        decimals: VaultDecimals,
        precision: usize,
    ) -> Self {
        Self {
            sender: raw.sender,
            owner: raw.owner,
            formatted_assets: format_amount(
                raw.assets,
                decimals.token,
                precision,
                &vault.token_symbol,
            ),
            formatted_shares: format_amount(raw.shares, decimals.share, precision, SHARES_UNIT),
            assets: raw.assets,
            shares: raw.shares,
            position,
        }
    }
}

impl FromVaultLog for WithdrawRequestEvent {
    type Raw = WithdrawRequestedFilter;

    fn from_raw(
        raw: WithdrawRequestedFilter,
        position: LogPosition,
        _vault: &VaultMetadata,
        decimals: VaultDecimals,
        precision: usize,
    ) -> Self {
        Self {
            owner: raw.owner,
            receiver: raw.receiver,
            formatted_shares: format_amount(raw.shares, decimals.share, precision, SHARES_UNIT),
            shares: raw.shares,
            max_loss_bps: raw.max_loss_bps,
            solver_enabled: raw.solver_enabled,
            update_id: raw.update_id,
            position,
        }
    }
}

impl FromVaultLog for UpdateProcessedEvent {
    type Raw = UpdateProcessedFilter;

    fn from_raw(
        raw: UpdateProcessedFilter,
        position: LogPosition,
        _vault: &VaultMetadata,
        _decimals: VaultDecimals,
        _precision: usize,
    ) -> Self {
        Self {
            update_id: raw.update_id,
            withdraw_rate: raw.withdraw_rate,
            total_assets_to_withdraw: raw.total_assets_to_withdraw,
            position,
        }
    }
}

pub struct EventLogCollector {
    reader: Arc<dyn ChainReader>,
    display_precision: usize,
    metrics: Option<Arc<VaultEngineMetrics>>,
}

impl EventLogCollector {
    pub fn new(reader: Arc<dyn ChainReader>, display_precision: usize) -> Self {
        Self {
            reader,
            display_precision,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<VaultEngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Collects all three streams from the vault's start block up to the
    /// latest block.
    pub async fn collect(&self, vault: &VaultMetadata) -> EngineResult<CollectedEvents> {
        let decimals = self.read_decimals(vault).await?;
        self.collect_with_decimals(vault, decimals).await
    }

    /// Token and share decimals for formatting the streams.
    pub async fn read_decimals(&self, vault: &VaultMetadata) -> EngineResult<VaultDecimals> {
        read_decimals(self.reader.as_ref(), vault, self.metrics.as_deref())
            .await
            .map_err(|e| decimals_failure(&vault.id, e))
            .tap_err(|e| self.record_failure(vault, e))
    }

    fn record_failure(&self, vault: &VaultMetadata, e: &EngineError) {
        warn!(
            vault_id = %vault.id,
            "[EventLogCollector] collection failed: {}", e
        );
        if let Some(metrics) = &self.metrics {
            metrics
                .log_fetch_errors
                .with_label_values(&[vault.id.as_str(), e.error_type()])
                .inc();
        }
    }

    pub async fn collect_with_decimals(
        &self,
        vault: &VaultMetadata,
        decimals: VaultDecimals,
    ) -> EngineResult<CollectedEvents> {
        self.collect_inner(vault, decimals)
            .await
            .tap_err(|e| self.record_failure(vault, e))
    }

    async fn collect_inner(
        &self,
        vault: &VaultMetadata,
        decimals: VaultDecimals,
    ) -> EngineResult<CollectedEvents> {
        let to_block = self
            .reader
            .latest_block()
            .await
            .map_err(|source| EngineError::LogFetch {
                vault_id: vault.id.clone(),
                stream: LATEST_BLOCK_STREAM,
                source,
            })?;
        let from_block = vault.start_block;
        if from_block > to_block {
            info!(
                vault_id = %vault.id,
                "[EventLogCollector] start block {} is ahead of latest block {}",
                from_block,
                to_block
            );
            return Ok(CollectedEvents {
                from_block,
                to_block,
                ..Default::default()
            });
        }

        let (deposits, withdraw_requests, updates_processed) = futures::try_join!(
            self.fetch_stream::<DepositEvent>(vault, decimals, DEPOSIT_STREAM, from_block, to_block),
            self.fetch_stream::<WithdrawRequestEvent>(
                vault,
                decimals,
                WITHDRAW_REQUESTED_STREAM,
                from_block,
                to_block
            ),
            self.fetch_stream::<UpdateProcessedEvent>(
                vault,
                decimals,
                UPDATE_PROCESSED_STREAM,
                from_block,
                to_block
            ),
        )?;

        debug!(
            vault_id = %vault.id,
            "[EventLogCollector] blocks {}..={}: {} deposits, {} withdraw requests, {} updates",
            from_block,
            to_block,
            deposits.len(),
            withdraw_requests.len(),
            updates_processed.len()
        );
        Ok(CollectedEvents {
            from_block,
            to_block,
            deposits,
            withdraw_requests,
            updates_processed,
        })
    }

    async fn fetch_stream<T: FromVaultLog>(
        &self,
        vault: &VaultMetadata,
        decimals: VaultDecimals,
        stream: &'static str,
        from_block: u64,
        to_block: u64,
    ) -> EngineResult<Vec<T>> {
        let to_engine_error = |source| EngineError::LogFetch {
            vault_id: vault.id.clone(),
            stream,
            source,
        };
        let logs = self
            .reader
            .get_logs(
                vault.vault_proxy_address,
                T::Raw::signature(),
                from_block,
                to_block,
            )
            .await
            .map_err(to_engine_error)?;

        let mut records = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|log| log.removed != Some(true)) {
            let position = log_position(log).map_err(to_engine_error)?;
            let raw = decode_log::<T::Raw>(log).map_err(to_engine_error)?;
            records.push(T::from_raw(
                raw,
                position,
                vault,
                decimals,
                self.display_precision,
            ));
        }
        sort_chronologically(&mut records);
        Ok(records)
    }
}
