// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Joins withdraw requests with their settlement and the account's claim
//! record.
//!
//! The account's on-chain claim record is the only source of claim timing.
//! The settlement (`UpdateProcessed` event, or `updateInfos` as a fallback)
//! only supplies the rate shown to the user.

use crate::abi::{
    decode_account_withdraw_request, decode_update_info, AccountWithdrawRequest, UpdateInfo,
    VaultCalls,
};
use crate::chain_reader::{ChainReader, ContractCall};
use crate::clock::Clock;
use crate::config::VaultMetadata;
use crate::error::{EngineError, EngineResult};
use crate::format::{format_time_remaining, format_units_fixed};
use crate::types::{
    sort_chronologically, UpdateProcessedEvent, WithdrawRequestEvent, WithdrawalLifecycle,
    WithdrawalStage,
};
use ethers::types::{Address, Bytes};
use futures::future::try_join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Derives one lifecycle from already-fetched inputs.
pub fn derive_lifecycle(
    request: &WithdrawRequestEvent,
    processed: Option<&UpdateProcessedEvent>,
    update_info: &UpdateInfo,
    claim_record: Option<&AccountWithdrawRequest>,
    now_ms: u64,
    share_decimals: u8,
    precision: usize,
) -> WithdrawalLifecycle {
    let withdraw_rate = processed
        .map(|event| event.withdraw_rate)
        .unwrap_or(update_info.withdraw_rate);
    let settled = processed.is_some() || update_info.timestamp != 0;

    // A record for another update means the account has moved on.
    let claimable_at_timestamp = claim_record
        .filter(|record| record.update_id == request.update_id && record.claim_timestamp != 0)
        .map(|record| record.claim_timestamp.saturating_mul(1000));
    let is_claimable = claimable_at_timestamp.is_some_and(|at| now_ms >= at);
    let time_remaining = match claimable_at_timestamp {
        Some(at) if !is_claimable => Some(format_time_remaining(at - now_ms)),
        _ => None,
    };

    let stage = if is_claimable {
        WithdrawalStage::Claimable
    } else if settled {
        WithdrawalStage::Settled
    } else {
        WithdrawalStage::Requested
    };

    WithdrawalLifecycle {
        owner: request.owner,
        update_id: request.update_id,
        stage,
        withdraw_rate: format_units_fixed(withdraw_rate, share_decimals, precision),
        shares: request.formatted_shares.clone(),
        claimable_at_timestamp,
        time_remaining,
        is_claimable,
        position: request.position,
    }
}

pub struct WithdrawalLifecycleResolver {
    reader: Arc<dyn ChainReader>,
    clock: Arc<dyn Clock>,
    display_precision: usize,
}

impl WithdrawalLifecycleResolver {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        clock: Arc<dyn Clock>,
        display_precision: usize,
    ) -> Self {
        Self {
            reader,
            clock,
            display_precision,
        }
    }

    async fn read(&self, call: ContractCall) -> EngineResult<Bytes> {
        self.reader
            .read_one(&call)
            .await
            .map_err(|e| EngineError::chain_read(call.label, e))
    }

    async fn read_update_info(
        &self,
        vault: &VaultMetadata,
        update_id: u64,
    ) -> EngineResult<(u64, UpdateInfo)> {
        let data = self
            .read(VaultCalls::update_info(vault.vault_proxy_address, update_id))
            .await?;
        let info =
            decode_update_info(&data).map_err(|e| EngineError::chain_read("updateInfos", e))?;
        Ok((update_id, info))
    }

    async fn read_claim_record(
        &self,
        vault: &VaultMetadata,
        owner: Address,
    ) -> EngineResult<(Address, AccountWithdrawRequest)> {
        let data = self
            .read(VaultCalls::account_withdraw_request(
                vault.vault_proxy_address,
                owner,
            ))
            .await?;
        let record = decode_account_withdraw_request(&data)
            .map_err(|e| EngineError::chain_read("userWithdrawRequest", e))?;
        Ok((owner, record))
    }

    /// Resolves every request in one pass. Each distinct update id and each
    /// distinct owner is read once. Any failed read fails the pass.
    pub async fn resolve(
        &self,
        vault: &VaultMetadata,
        share_decimals: u8,
        requests: &[WithdrawRequestEvent],
        updates_processed: &[UpdateProcessedEvent],
    ) -> EngineResult<Vec<WithdrawalLifecycle>> {
        if requests.is_empty() {
            return Ok(vec![]);
        }
        let update_ids: BTreeSet<u64> = requests.iter().map(|r| r.update_id).collect();
        let owners: BTreeSet<Address> = requests.iter().map(|r| r.owner).collect();

        let (update_infos, claim_records) = futures::try_join!(
            try_join_all(update_ids.iter().map(|id| self.read_update_info(vault, *id))),
            try_join_all(owners.iter().map(|owner| self.read_claim_record(vault, *owner))),
        )?;
        let update_infos: HashMap<u64, UpdateInfo> = update_infos.into_iter().collect();
        let claim_records: HashMap<Address, AccountWithdrawRequest> =
            claim_records.into_iter().collect();

        // Later settlements for the same id win.
        let processed_by_id: HashMap<u64, &UpdateProcessedEvent> = updates_processed
            .iter()
            .map(|event| (event.update_id, event))
            .collect();

        let now_ms = self.clock.now_ms();
        let mut lifecycles = Vec::with_capacity(requests.len());
        for request in requests {
            let update_info = update_infos.get(&request.update_id).ok_or_else(|| {
                EngineError::data_integrity(
                    &vault.id,
                    format!("update {} missing after read", request.update_id),
                )
            })?;
            lifecycles.push(derive_lifecycle(
                request,
                processed_by_id.get(&request.update_id).copied(),
                update_info,
                claim_records.get(&request.owner),
                now_ms,
                share_decimals,
                self.display_precision,
            ));
        }
        sort_chronologically(&mut lifecycles);
        debug!(
            vault_id = %vault.id,
            "[WithdrawalLifecycleResolver] resolved {} withdrawals ({} updates, {} owners)",
            lifecycles.len(),
            update_ids.len(),
            owners.len()
        );
        Ok(lifecycles)
    }
}
