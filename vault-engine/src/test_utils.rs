// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::abi::{DepositFilter, UpdateProcessedFilter, VaultCalls, WithdrawRequestedFilter};
use crate::chain_reader::{CallOutcome, ChainReader, ContractCall};
use crate::config::{AprSource, VaultConfigSet, VaultMetadata, VaultMetadataRecord};
use crate::error::ReadError;
use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::contract::EthEvent;
use ethers::types::{Address, Bytes, Log, TxHash, H256, U256, U64};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A scripted `ChainReader`. Calls without a scripted response revert.
#[derive(Default)]
pub struct MockChainReader {
    responses: Mutex<HashMap<(Address, Bytes), CallOutcome>>,
    logs: Mutex<HashMap<(Address, H256), Result<Vec<Log>, ReadError>>>,
    truncated_batches: Mutex<HashSet<Address>>,
    latency: Mutex<Option<Duration>>,
    latest_block: AtomicU64,
    batch_calls: AtomicUsize,
    single_calls: AtomicUsize,
    log_calls: AtomicUsize,
    calls_by_label: Mutex<HashMap<&'static str, usize>>,
}

impl MockChainReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, call: &ContractCall, outcome: CallOutcome) {
        self.responses
            .lock()
            .unwrap()
            .insert((call.target, call.calldata.clone()), outcome);
    }

    pub fn add_u256(&self, call: &ContractCall, value: U256) {
        self.add_response(call, Ok(abi::encode(&[Token::Uint(value)]).into()));
    }

    pub fn add_logs(&self, address: Address, signature: H256, logs: Vec<Log>) {
        self.logs
            .lock()
            .unwrap()
            .insert((address, signature), Ok(logs));
    }

    pub fn fail_logs(&self, address: Address, signature: H256, error: ReadError) {
        self.logs
            .lock()
            .unwrap()
            .insert((address, signature), Err(error));
    }

    /// Makes every batch whose first call targets `target` come back one
    /// outcome short.
    pub fn drop_last_batch_result_for(&self, target: Address) {
        self.truncated_batches.lock().unwrap().insert(target);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn set_latest_block(&self, block: u64) {
        self.latest_block.store(block, Ordering::SeqCst);
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    /// Number of individual contract calls with this label, batched or not.
    pub fn calls_for(&self, label: &str) -> usize {
        self.calls_by_label
            .lock()
            .unwrap()
            .get(label)
            .copied()
            .unwrap_or_default()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn respond(&self, call: &ContractCall) -> CallOutcome {
        *self
            .calls_by_label
            .lock()
            .unwrap()
            .entry(call.label)
            .or_default() += 1;
        self.responses
            .lock()
            .unwrap()
            .get(&(call.target, call.calldata.clone()))
            .cloned()
            .unwrap_or_else(|| {
                Err(ReadError::Rpc {
                    code: 3,
                    message: format!("execution reverted: no mock response for {}", call.label),
                })
            })
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn batch_read(&self, calls: &[ContractCall]) -> Result<Vec<CallOutcome>, ReadError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut outcomes: Vec<_> = calls.iter().map(|call| self.respond(call)).collect();
        let truncate = calls
            .first()
            .map(|call| self.truncated_batches.lock().unwrap().contains(&call.target))
            .unwrap_or(false);
        if truncate {
            outcomes.pop();
        }
        Ok(outcomes)
    }

    async fn read_one(&self, call: &ContractCall) -> Result<Bytes, ReadError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.respond(call)
    }

    async fn get_logs(
        &self,
        address: Address,
        event_signature: H256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ReadError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let logs = self
            .logs
            .lock()
            .unwrap()
            .get(&(address, event_signature))
            .cloned()
            .unwrap_or_else(|| Ok(vec![]))?;
        Ok(logs
            .into_iter()
            .filter(|log| {
                let block = log.block_number.map(|b| b.as_u64()).unwrap_or_default();
                block >= from_block && block <= to_block
            })
            .collect())
    }

    async fn latest_block(&self) -> Result<u64, ReadError> {
        Ok(self.latest_block.load(Ordering::SeqCst))
    }
}

pub fn token_address(seed: u64) -> Address {
    Address::from_low_u64_be(0x1000 + seed)
}

pub fn vault_address(seed: u64) -> Address {
    Address::from_low_u64_be(0x2000 + seed)
}

pub fn vault_proxy_address(seed: u64) -> Address {
    Address::from_low_u64_be(0x3000 + seed)
}

/// A valid metadata record on chain 1 whose addresses are derived from `seed`.
pub fn vault_record(id: &str, seed: u64) -> VaultMetadataRecord {
    VaultMetadataRecord {
        chain_id: 1,
        id: id.to_string(),
        name: format!("{} vault", id.to_uppercase()),
        description: format!("Test vault {}", id),
        token_symbol: id.to_uppercase(),
        token_address: format!("{:?}", token_address(seed)),
        vault_address: format!("{:?}", vault_address(seed)),
        vault_proxy_address: format!("{:?}", vault_proxy_address(seed)),
        withdrawal_lockup_secs: 7 * 24 * 3600,
        confirmation_timeout_ms: 60_000,
        start_block: 10,
        apr_source: AprSource::None,
    }
}

pub fn vault_set(ids: &[(&str, u64)]) -> VaultConfigSet {
    VaultConfigSet::from_records(
        ids.iter()
            .map(|(id, seed)| vault_record(id, *seed))
            .collect(),
    )
    .unwrap()
}

pub fn vault_metadata(id: &str, seed: u64) -> Arc<VaultMetadata> {
    vault_set(&[(id, seed)]).get(id).unwrap().clone()
}

#[derive(Debug, Clone)]
pub struct VaultState {
    pub token_decimals: u8,
    pub share_decimals: u8,
    pub total_assets: U256,
    pub total_supply: U256,
    pub redemption_rate: U256,
}

impl Default for VaultState {
    fn default() -> Self {
        Self {
            token_decimals: 6,
            share_decimals: 6,
            total_assets: U256::from(5_000_000_000u64),
            total_supply: U256::from(4_000_000_000u64),
            redemption_rate: U256::from(1_250_000u64),
        }
    }
}

/// Scripts every read of the snapshot batch for `vault`.
pub fn mock_vault_state(mock: &MockChainReader, vault: &VaultMetadata, state: &VaultState) {
    mock.add_u256(
        &VaultCalls::decimals(vault.token_address),
        U256::from(state.token_decimals),
    );
    mock.add_u256(
        &VaultCalls::decimals(vault.vault_address),
        U256::from(state.share_decimals),
    );
    mock.add_u256(&VaultCalls::total_assets(vault.vault_address), state.total_assets);
    mock.add_u256(&VaultCalls::total_supply(vault.vault_address), state.total_supply);
    mock.add_u256(
        &VaultCalls::redemption_rate(vault.vault_address),
        state.redemption_rate,
    );
}

pub fn mock_owner_position(
    mock: &MockChainReader,
    vault: &VaultMetadata,
    owner: Address,
    shares: U256,
    assets: U256,
) {
    mock.add_u256(&VaultCalls::balance_of(vault.vault_address, owner), shares);
    mock.add_u256(
        &VaultCalls::convert_to_assets(vault.vault_address, shares),
        assets,
    );
}

pub fn mock_update_info(
    mock: &MockChainReader,
    vault: &VaultMetadata,
    update_id: u64,
    withdraw_rate: U256,
    timestamp_secs: u64,
) {
    mock.add_response(
        &VaultCalls::update_info(vault.vault_proxy_address, update_id),
        Ok(abi::encode(&[
            Token::Uint(withdraw_rate),
            Token::Uint(U256::from(timestamp_secs)),
            Token::Uint(U256::zero()),
        ])
        .into()),
    );
}

pub fn mock_account_request(
    mock: &MockChainReader,
    vault: &VaultMetadata,
    owner: Address,
    update_id: u64,
    claim_timestamp_secs: u64,
    shares: U256,
) {
    mock.add_response(
        &VaultCalls::account_withdraw_request(vault.vault_proxy_address, owner),
        Ok(abi::encode(&[
            Token::Uint(U256::from(update_id)),
            Token::Uint(U256::from(claim_timestamp_secs)),
            Token::Uint(shares),
            Token::String("receiver-on-remote-chain".to_string()),
        ])
        .into()),
    );
}

fn raw_log(
    address: Address,
    topics: Vec<H256>,
    data: Vec<u8>,
    block_number: u64,
    tx_hash: TxHash,
    log_index: u64,
) -> Log {
    Log {
        address,
        topics,
        data: data.into(),
        block_number: Some(U64::from(block_number)),
        transaction_hash: Some(tx_hash),
        log_index: Some(U256::from(log_index)),
        ..Default::default()
    }
}

fn address_topic(address: Address) -> H256 {
    H256::from(address)
}

pub fn deposit_log(
    vault: Address,
    sender: Address,
    owner: Address,
    assets: U256,
    shares: U256,
    block_number: u64,
    tx_hash: TxHash,
) -> Log {
    raw_log(
        vault,
        vec![
            DepositFilter::signature(),
            address_topic(sender),
            address_topic(owner),
        ],
        abi::encode(&[Token::Uint(assets), Token::Uint(shares)]),
        block_number,
        tx_hash,
        0,
    )
}

pub fn withdraw_requested_log(
    vault: Address,
    owner: Address,
    shares: U256,
    update_id: u64,
    block_number: u64,
    tx_hash: TxHash,
) -> Log {
    raw_log(
        vault,
        vec![
            WithdrawRequestedFilter::signature(),
            address_topic(owner),
            H256::from_low_u64_be(update_id),
        ],
        abi::encode(&[
            Token::String("receiver-on-remote-chain".to_string()),
            Token::Uint(shares),
            Token::Uint(U256::from(50u64)),
            Token::Bool(true),
        ]),
        block_number,
        tx_hash,
        1,
    )
}

pub fn update_processed_log(
    vault: Address,
    update_id: u64,
    withdraw_rate: U256,
    total_assets_to_withdraw: U256,
    block_number: u64,
    tx_hash: TxHash,
) -> Log {
    raw_log(
        vault,
        vec![
            UpdateProcessedFilter::signature(),
            H256::from_low_u64_be(update_id),
        ],
        abi::encode(&[
            Token::Uint(withdraw_rate),
            Token::Uint(total_assets_to_withdraw),
        ]),
        block_number,
        tx_hash,
        2,
    )
}
