// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Aggregates one poll's worth of vault reads into a `VaultSnapshot`.

use crate::abi::{decode_u256, VaultCalls};
use crate::chain_reader::{CallOutcome, ChainReader};
use crate::config::VaultMetadata;
use crate::error::{EngineError, EngineResult};
use crate::format::{format_amount, FALLBACK_DECIMALS, SHARES_UNIT};
use crate::metrics::VaultEngineMetrics;
use crate::types::{FormattedSnapshot, VaultSnapshot};
use ethers::types::{Address, U256};
use futures::future::join_all;
use std::sync::Arc;
use tap::TapFallible;
use tracing::{debug, warn};

// 10^77 is the largest power of ten a uint256 can hold.
const MAX_DECIMALS: u64 = 77;

/// Token and share decimals of a vault, with the fallback flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultDecimals {
    pub token: u8,
    pub share: u8,
    pub defaulted: bool,
}

/// Turns a `decimals()` outcome into a decimal count. Anything unusable falls
/// back to 18 and is reported, never raised.
pub(crate) fn resolve_decimals(
    vault_id: &str,
    which: &str,
    outcome: Option<&CallOutcome>,
    metrics: Option<&VaultEngineMetrics>,
) -> (u8, bool) {
    let problem = match outcome {
        Some(Ok(data)) => match decode_u256(data) {
            Ok(value) if value <= U256::from(MAX_DECIMALS) => return (value.as_u32() as u8, false),
            Ok(value) => format!("value {} out of range", value),
            Err(e) => e.to_string(),
        },
        Some(Err(e)) => e.to_string(),
        None => "no result".to_string(),
    };
    warn!(
        vault_id,
        which,
        "[VaultSnapshotAggregator] {} decimals unresolved ({}), defaulting to {}",
        which,
        problem,
        FALLBACK_DECIMALS
    );
    if let Some(metrics) = metrics {
        metrics.decimals_defaulted.with_label_values(&[vault_id]).inc();
    }
    (FALLBACK_DECIMALS, true)
}

/// Reads only the two decimals values, as one batch.
pub async fn read_decimals(
    reader: &dyn ChainReader,
    vault: &VaultMetadata,
    metrics: Option<&VaultEngineMetrics>,
) -> EngineResult<VaultDecimals> {
    let calls = [
        VaultCalls::decimals(vault.token_address),
        VaultCalls::decimals(vault.vault_address),
    ];
    let outcomes = reader
        .batch_read(&calls)
        .await
        .map_err(|e| EngineError::chain_read("decimals", e))?;
    if outcomes.len() != calls.len() {
        return Err(EngineError::data_integrity(
            &vault.id,
            format!(
                "expected {} decimals results, got {}",
                calls.len(),
                outcomes.len()
            ),
        ));
    }
    let (token, token_defaulted) = resolve_decimals(&vault.id, "token", outcomes.first(), metrics);
    let (share, share_defaulted) = resolve_decimals(&vault.id, "share", outcomes.get(1), metrics);
    Ok(VaultDecimals {
        token,
        share,
        defaulted: token_defaulted || share_defaulted,
    })
}

fn required_u256(vault_id: &str, label: &str, outcome: Option<CallOutcome>) -> EngineResult<U256> {
    match outcome {
        Some(Ok(data)) => decode_u256(&data).map_err(|e| {
            EngineError::data_integrity(vault_id, format!("{} undecodable: {}", label, e))
        }),
        Some(Err(e)) => Err(EngineError::data_integrity(
            vault_id,
            format!("{} read failed: {}", label, e),
        )),
        None => Err(EngineError::data_integrity(
            vault_id,
            format!("{} missing from batch", label),
        )),
    }
}

pub struct VaultSnapshotAggregator {
    reader: Arc<dyn ChainReader>,
    display_precision: usize,
    metrics: Option<Arc<VaultEngineMetrics>>,
}

impl VaultSnapshotAggregator {
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

    /// One batched read of the vault totals (plus the owner's balance when
    /// given), then the owner's asset equivalent.
    pub async fn snapshot(
        &self,
        vault: &VaultMetadata,
        owner: Option<Address>,
    ) -> EngineResult<VaultSnapshot> {
        self.snapshot_inner(vault, owner).await.tap_err(|e| {
            warn!(
                vault_id = %vault.id,
                "[VaultSnapshotAggregator] snapshot failed: {}", e
            );
            if let Some(metrics) = &self.metrics {
                metrics
                    .snapshot_errors
                    .with_label_values(&[vault.id.as_str(), e.error_type()])
                    .inc();
            }
        })
    }

    async fn snapshot_inner(
        &self,
        vault: &VaultMetadata,
        owner: Option<Address>,
    ) -> EngineResult<VaultSnapshot> {
        let mut calls = vec![
            VaultCalls::decimals(vault.token_address),
            VaultCalls::decimals(vault.vault_address),
            VaultCalls::total_assets(vault.vault_address),
            VaultCalls::total_supply(vault.vault_address),
            VaultCalls::redemption_rate(vault.vault_address),
        ];
        if let Some(owner) = owner {
            calls.push(VaultCalls::balance_of(vault.vault_address, owner));
        }

        let outcomes = self
            .reader
            .batch_read(&calls)
            .await
            .map_err(|e| EngineError::chain_read("snapshot batch", e))?;
        if outcomes.len() != calls.len() {
            return Err(EngineError::data_integrity(
                &vault.id,
                format!(
                    "expected {} batch results, got {}",
                    calls.len(),
                    outcomes.len()
                ),
            ));
        }

        let metrics = self.metrics.as_deref();
        let (token_decimals, token_defaulted) =
            resolve_decimals(&vault.id, "token", outcomes.first(), metrics);
        let (share_decimals, share_defaulted) =
            resolve_decimals(&vault.id, "share", outcomes.get(1), metrics);

        let mut rest = outcomes.into_iter().skip(2);
        let total_assets = required_u256(&vault.id, "totalAssets", rest.next())?;
        let total_shares = required_u256(&vault.id, "totalSupply", rest.next())?;
        let redemption_rate = required_u256(&vault.id, "redemptionRate", rest.next())?;
        let user_shares = match owner {
            Some(_) => Some(required_u256(&vault.id, "balanceOf", rest.next())?),
            None => None,
        };

        // Depends on the balance above, so it cannot join the batch.
        let user_position = match user_shares {
            Some(shares) => {
                let call = VaultCalls::convert_to_assets(vault.vault_address, shares);
                let data = self
                    .reader
                    .read_one(&call)
                    .await
                    .map_err(|e| EngineError::chain_read(call.label, e))?;
                Some(decode_u256(&data).map_err(|e| EngineError::chain_read(call.label, e))?)
            }
            None => None,
        };

        let precision = self.display_precision;
        let symbol = vault.token_symbol.as_str();
        let formatted = FormattedSnapshot {
            total_assets: format_amount(total_assets, token_decimals, precision, symbol),
            total_shares: format_amount(total_shares, share_decimals, precision, SHARES_UNIT),
            redemption_rate: format_amount(redemption_rate, token_decimals, precision, symbol),
            user_shares: user_shares
                .map(|v| format_amount(v, share_decimals, precision, SHARES_UNIT)),
            user_position: user_position.map(|v| format_amount(v, token_decimals, precision, symbol)),
        };
        debug!(
            vault_id = %vault.id,
            ?owner,
            "[VaultSnapshotAggregator] snapshot total assets {}",
            formatted.total_assets
        );

        Ok(VaultSnapshot {
            vault_id: vault.id.clone(),
            owner,
            token_decimals,
            share_decimals,
            decimals_defaulted: token_defaulted || share_defaulted,
            total_assets,
            total_shares,
            redemption_rate,
            user_shares,
            user_position,
            formatted,
        })
    }

    /// Snapshots every vault concurrently. A failure is confined to its own
    /// vault's entry.
    pub async fn snapshot_all<'a>(
        &self,
        vaults: impl IntoIterator<Item = &'a Arc<VaultMetadata>>,
        owner: Option<Address>,
    ) -> Vec<(String, EngineResult<VaultSnapshot>)> {
        join_all(vaults.into_iter().map(|vault| async move {
            (vault.id.clone(), self.snapshot(vault, owner).await)
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReadError;
    use crate::test_utils::{
        mock_owner_position, mock_vault_state, vault_metadata, vault_set, MockChainReader,
        VaultState,
    };

    fn aggregator(mock: &Arc<MockChainReader>) -> VaultSnapshotAggregator {
        VaultSnapshotAggregator::new(mock.clone(), 2)
            .with_metrics(Arc::new(VaultEngineMetrics::new_for_testing()))
    }

    #[tokio::test]
    async fn test_snapshot_without_owner() {
        let mock = Arc::new(MockChainReader::new());
        let vault = vault_metadata("usdc", 1);
        mock_vault_state(&mock, &vault, &VaultState::default());

        let snapshot = aggregator(&mock).snapshot(&vault, None).await.unwrap();
        assert_eq!(mock.batch_calls(), 1);
        assert_eq!(mock.single_calls(), 0);
        assert_eq!(snapshot.token_decimals, 6);
        assert!(!snapshot.decimals_defaulted);
        assert_eq!(snapshot.formatted.total_assets, "5000.00 USDC");
        assert_eq!(snapshot.formatted.total_shares, "4000.00 shares");
        assert_eq!(snapshot.formatted.redemption_rate, "1.25 USDC");
        assert_eq!(snapshot.user_shares, None);
        assert_eq!(snapshot.formatted.user_position, None);
    }

    #[tokio::test]
    async fn test_owner_shares_format_at_share_decimals() {
        let mock = Arc::new(MockChainReader::new());
        let vault = vault_metadata("usdc", 1);
        let owner = Address::repeat_byte(0xab);
        mock_vault_state(&mock, &vault, &VaultState::default());
        mock_owner_position(
            &mock,
            &vault,
            owner,
            U256::from(1_000_000u64),
            U256::from(1_250_000u64),
        );

        let snapshot = aggregator(&mock).snapshot(&vault, Some(owner)).await.unwrap();
        assert_eq!(mock.batch_calls(), 1);
        assert_eq!(mock.single_calls(), 1);
        assert_eq!(snapshot.user_shares, Some(U256::from(1_000_000u64)));
        assert_eq!(snapshot.formatted.user_shares.as_deref(), Some("1.00 shares"));
        assert_eq!(snapshot.formatted.user_position.as_deref(), Some("1.25 USDC"));
    }

    #[tokio::test]
    async fn test_decimals_fall_back_and_are_flagged() {
        let mock = Arc::new(MockChainReader::new());
        let vault = vault_metadata("eth", 2);
        mock_vault_state(
            &mock,
            &vault,
            &VaultState {
                total_assets: U256::exp10(18),
                ..Default::default()
            },
        );
        mock.add_response(
            &VaultCalls::decimals(vault.token_address),
            Err(ReadError::Rpc {
                code: 3,
                message: "execution reverted".into(),
            }),
        );
        let metrics = Arc::new(VaultEngineMetrics::new_for_testing());
        let snapshot = VaultSnapshotAggregator::new(mock.clone(), 2)
            .with_metrics(metrics.clone())
            .snapshot(&vault, None)
            .await
            .unwrap();
        assert_eq!(snapshot.token_decimals, 18);
        assert_eq!(snapshot.share_decimals, 6);
        assert!(snapshot.decimals_defaulted);
        assert_eq!(snapshot.formatted.total_assets, "1.00 ETH");
        assert_eq!(
            metrics.decimals_defaulted.with_label_values(&["eth"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_zero_decimals_is_not_a_fallback() {
        let mock = Arc::new(MockChainReader::new());
        let vault = vault_metadata("pts", 3);
        mock_vault_state(
            &mock,
            &vault,
            &VaultState {
                token_decimals: 0,
                share_decimals: 0,
                total_assets: U256::from(42u64),
                ..Default::default()
            },
        );
        let snapshot = aggregator(&mock).snapshot(&vault, None).await.unwrap();
        assert_eq!(snapshot.token_decimals, 0);
        assert!(!snapshot.decimals_defaulted);
        assert_eq!(snapshot.formatted.total_assets, "42.00 PTS");
    }

    #[tokio::test]
    async fn test_failed_required_field_is_data_integrity() {
        let mock = Arc::new(MockChainReader::new());
        let vault = vault_metadata("usdc", 1);
        mock_vault_state(&mock, &vault, &VaultState::default());
        mock.add_response(&VaultCalls::total_supply(vault.vault_address), Ok(vec![1u8].into()));

        let err = aggregator(&mock).snapshot(&vault, None).await.unwrap_err();
        assert_eq!(err.error_type(), "data_integrity");
        assert!(err.to_string().contains("totalSupply"), "{}", err);
    }

    #[tokio::test]
    async fn test_short_batch_fails_only_that_vault() {
        let mock = Arc::new(MockChainReader::new());
        let vaults = vault_set(&[("usdc", 1), ("eth", 2)]);
        for vault in vaults.iter() {
            mock_vault_state(&mock, vault, &VaultState::default());
        }
        let usdc = vaults.get("usdc").unwrap();
        mock.drop_last_batch_result_for(usdc.token_address);

        let metrics = Arc::new(VaultEngineMetrics::new_for_testing());
        let results = VaultSnapshotAggregator::new(mock.clone(), 2)
            .with_metrics(metrics.clone())
            .snapshot_all(vaults.iter(), None)
            .await;

        assert_eq!(results.len(), 2);
        let (id, usdc_result) = &results[0];
        assert_eq!(id, "usdc");
        assert!(matches!(
            usdc_result,
            Err(EngineError::DataIntegrity { reason, .. }) if reason == "expected 5 batch results, got 4"
        ));
        let (id, eth_result) = &results[1];
        assert_eq!(id, "eth");
        assert_eq!(eth_result.as_ref().unwrap().vault_id, "eth");
        assert_eq!(
            metrics
                .snapshot_errors
                .with_label_values(&["usdc", "data_integrity"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_read_decimals() {
        let mock = Arc::new(MockChainReader::new());
        let vault = vault_metadata("usdc", 1);
        mock_vault_state(
            &mock,
            &vault,
            &VaultState {
                share_decimals: 9,
                ..Default::default()
            },
        );
        let decimals = read_decimals(mock.as_ref(), &vault, None).await.unwrap();
        assert_eq!(
            decimals,
            VaultDecimals {
                token: 6,
                share: 9,
                defaulted: false
            }
        );
    }
}
