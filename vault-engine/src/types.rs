// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::types::{Address, TxHash, U256};
use serde::{Deserialize, Serialize};

/// Serializes `U256` as a decimal string. Hex is ethers' default, and plain
/// JSON numbers lose precision past 2^53.
pub mod u256_dec {
    use ethers::types::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_dec_str(&raw).map_err(|e| D::Error::custom(format!("{:?}", e)))
    }

    pub mod option {
        use ethers::types::U256;
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<U256>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => serializer.serialize_some(&value.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<U256>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| U256::from_dec_str(&raw).map_err(|e| D::Error::custom(format!("{:?}", e))))
                .transpose()
        }
    }
}

/// Point-in-time aggregate of a vault's numeric state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub vault_id: String,
    pub owner: Option<Address>,
    pub token_decimals: u8,
    pub share_decimals: u8,
    /// Set when at least one decimals read fell back to the default.
    pub decimals_defaulted: bool,
    #[serde(with = "u256_dec")]
    pub total_assets: U256,
    #[serde(with = "u256_dec")]
    pub total_shares: U256,
    #[serde(with = "u256_dec")]
    pub redemption_rate: U256,
    #[serde(with = "u256_dec::option")]
    pub user_shares: Option<U256>,
    #[serde(with = "u256_dec::option")]
    pub user_position: Option<U256>,
    pub formatted: FormattedSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedSnapshot {
    pub total_assets: String,
    pub total_shares: String,
    pub redemption_rate: String,
    pub user_shares: Option<String>,
    pub user_position: Option<String>,
}

/// Where a decoded record sits on chain. Ordering is block number, then
/// transaction hash, then log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub block_number: u64,
    pub tx_hash: TxHash,
    pub log_index: u64,
}

pub trait Chronological {
    fn position(&self) -> LogPosition;
}

/// Sorts ascending by block number with a deterministic tie-break.
pub fn sort_chronologically<T: Chronological>(items: &mut [T]) {
    items.sort_by_key(|item| item.position());
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub sender: Address,
    pub owner: Address,
    #[serde(with = "u256_dec")]
    pub assets: U256,
    #[serde(with = "u256_dec")]
    pub shares: U256,
    pub formatted_assets: String,
    pub formatted_shares: String,
    #[serde(flatten)]
    pub position: LogPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequestEvent {
    pub owner: Address,
    /// Destination on the settlement chain; not necessarily an EVM address.
    pub receiver: String,
    #[serde(with = "u256_dec")]
    pub shares: U256,
    pub formatted_shares: String,
    pub max_loss_bps: u32,
    pub solver_enabled: bool,
    pub update_id: u64,
    #[serde(flatten)]
    pub position: LogPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProcessedEvent {
    pub update_id: u64,
    #[serde(with = "u256_dec")]
    pub withdraw_rate: U256,
    #[serde(with = "u256_dec")]
    pub total_assets_to_withdraw: U256,
    #[serde(flatten)]
    pub position: LogPosition,
}

/// The closed set of vault events the engine decodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum VaultEvent {
    Deposit(DepositEvent),
    WithdrawRequested(WithdrawRequestEvent),
    UpdateProcessed(UpdateProcessedEvent),
}

impl Chronological for DepositEvent {
    fn position(&self) -> LogPosition {
        self.position
    }
}

impl Chronological for WithdrawRequestEvent {
    fn position(&self) -> LogPosition {
        self.position
    }
}

impl Chronological for UpdateProcessedEvent {
    fn position(&self) -> LogPosition {
        self.position
    }
}

impl Chronological for VaultEvent {
    fn position(&self) -> LogPosition {
        match self {
            VaultEvent::Deposit(e) => e.position,
            VaultEvent::WithdrawRequested(e) => e.position,
            VaultEvent::UpdateProcessed(e) => e.position,
        }
    }
}

/// The three event streams of one vault over `[from_block, to_block]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedEvents {
    pub from_block: u64,
    pub to_block: u64,
    pub deposits: Vec<DepositEvent>,
    pub withdraw_requests: Vec<WithdrawRequestEvent>,
    pub updates_processed: Vec<UpdateProcessedEvent>,
}

impl CollectedEvents {
    /// All events merged into one chronological timeline.
    pub fn timeline(&self) -> Vec<VaultEvent> {
        let mut events: Vec<VaultEvent> = self
            .deposits
            .iter()
            .cloned()
            .map(VaultEvent::Deposit)
            .chain(
                self.withdraw_requests
                    .iter()
                    .cloned()
                    .map(VaultEvent::WithdrawRequested),
            )
            .chain(
                self.updates_processed
                    .iter()
                    .cloned()
                    .map(VaultEvent::UpdateProcessed),
            )
            .collect();
        sort_chronologically(&mut events);
        events
    }

    /// Keeps only the records that concern `owner`. Settlements are global and
    /// are kept as-is.
    pub fn for_owner(&self, owner: Address) -> Self {
        Self {
            from_block: self.from_block,
            to_block: self.to_block,
            deposits: self
                .deposits
                .iter()
                .filter(|d| d.owner == owner || d.sender == owner)
                .cloned()
                .collect(),
            withdraw_requests: self
                .withdraw_requests
                .iter()
                .filter(|w| w.owner == owner)
                .cloned()
                .collect(),
            updates_processed: self.updates_processed.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStage {
    Requested,
    Settled,
    Claimable,
}

/// Resolved per-request withdrawal state. Superseded, never mutated, on
/// every resolution pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalLifecycle {
    pub owner: Address,
    pub update_id: u64,
    pub stage: WithdrawalStage,
    pub withdraw_rate: String,
    pub shares: String,
    /// Epoch milliseconds, known only once the account's claim record was read.
    pub claimable_at_timestamp: Option<u64>,
    pub time_remaining: Option<String>,
    pub is_claimable: bool,
    #[serde(flatten)]
    pub position: LogPosition,
}

impl Chronological for WithdrawalLifecycle {
    fn position(&self) -> LogPosition {
        self.position
    }
}

/// Everything the history view of a vault needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHistory {
    pub vault_id: String,
    pub owner: Option<Address>,
    pub events: CollectedEvents,
    pub withdrawals: Vec<WithdrawalLifecycle>,
}
