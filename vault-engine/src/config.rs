// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{EngineError, EngineResult};
use crate::format::DEFAULT_DISPLAY_PRECISION;
use crate::metered_eth_provider::DEFAULT_MAX_CONCURRENT_REQUESTS;
use anyhow::{anyhow, Context};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;
use vault_engine_config::Config;

#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    // Rpc url for the Eth fullnode all vault reads go through.
    pub eth_rpc_url: String,
    // When set, the node's chain id must match, and so must every vault's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_chain_id: Option<u64>,
    // The port that the read API listens on.
    #[serde(default = "default_server_listen_port")]
    pub server_listen_port: u16,
    // The port for the metrics server.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    // A YAML or JSON file holding an array of vault metadata records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vaults_path: Option<PathBuf>,
    // Vault metadata records given inline. Merged with `vaults-path`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vaults: Vec<VaultMetadataRecord>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    // Fractional digits in formatted amounts.
    #[serde(default = "default_display_precision")]
    pub display_precision: usize,
}

impl Config for EngineConfig {}

fn default_server_listen_port() -> u16 {
    9191
}

fn default_metrics_port() -> u16 {
    9184
}

fn default_display_precision() -> usize {
    DEFAULT_DISPLAY_PRECISION
}

/// Refresh cadence of the read model cache.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PollingConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_snapshot_period")]
    pub snapshot_period: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_logs_period")]
    pub logs_period: Duration,
    /// How long a cached value is served to `get` callers without a refetch.
    /// Defaults to the polling period of the value's kind.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after: Option<Duration>,
    /// Keys nobody subscribes to, polls or fetches are dropped after this
    /// long without a read.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_evict_after")]
    pub evict_after: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            snapshot_period: default_snapshot_period(),
            logs_period: default_logs_period(),
            stale_after: None,
            evict_after: default_evict_after(),
        }
    }
}

fn default_snapshot_period() -> Duration {
    Duration::from_secs(30)
}

fn default_logs_period() -> Duration {
    Duration::from_secs(15)
}

fn default_evict_after() -> Duration {
    Duration::from_secs(600)
}

/// Timeout and retry budget of the chain transport.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReaderConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_call_timeout", rename = "call-timeout-ms")]
    pub call_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_max_retry_elapsed", rename = "max-retry-elapsed-ms")]
    pub max_retry_elapsed: Duration,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
            max_retry_elapsed: default_max_retry_elapsed(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retry_elapsed() -> Duration {
    Duration::from_secs(5)
}

fn default_max_concurrent_requests() -> usize {
    DEFAULT_MAX_CONCURRENT_REQUESTS
}

impl EngineConfig {
    /// Loads the vault metadata file (if any), merges it with the inline
    /// records and validates the whole set.
    pub fn load_vaults(&self) -> anyhow::Result<VaultConfigSet> {
        let mut records = Vec::new();
        if let Some(path) = &self.vaults_path {
            let from_file = Vec::<VaultMetadataRecord>::load(path)
                .with_context(|| format!("failed to load vault metadata from {:?}", path))?;
            info!(
                "Loaded {} vault metadata records from {:?}",
                from_file.len(),
                path
            );
            records.extend(from_file);
        }
        records.extend(self.vaults.iter().cloned());
        if records.is_empty() {
            return Err(anyhow!(
                "no vaults configured: set `vaults-path` or `vaults`"
            ));
        }

        let set = VaultConfigSet::from_records(records)?;
        if let Some(expected) = self.expected_chain_id {
            let mismatched: Vec<_> = set
                .iter()
                .filter(|vault| vault.chain_id != expected)
                .map(|vault| format!("{} (chain id {})", vault.id, vault.chain_id))
                .collect();
            if !mismatched.is_empty() {
                return Err(EngineError::ConfigValidation(format!(
                    "vaults not on expected chain {}: {}",
                    expected,
                    mismatched.join(", ")
                ))
                .into());
            }
        }
        Ok(set)
    }
}

/// Where a vault's displayed APR comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AprSource {
    #[default]
    None,
    Fixed {
        #[serde(rename = "apr-bps")]
        apr_bps: u32,
    },
    Url {
        url: String,
    },
}

/// A vault metadata record as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VaultMetadataRecord {
    pub chain_id: u64,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub token_symbol: String,
    pub token_address: String,
    pub vault_address: String,
    pub vault_proxy_address: String,
    #[serde(default)]
    pub withdrawal_lockup_secs: u64,
    pub confirmation_timeout_ms: u64,
    pub start_block: u64,
    #[serde(default)]
    pub apr_source: AprSource,
}

/// Validated, immutable vault metadata.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultMetadata {
    pub id: String,
    pub chain_id: u64,
    pub name: String,
    pub description: String,
    pub token_symbol: String,
    /// The underlying asset; source of the token decimals.
    pub token_address: Address,
    /// Share accounting: totals, balances and conversions are read here.
    pub vault_address: Address,
    /// Emits the event streams and holds the withdrawal records.
    pub vault_proxy_address: Address,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub withdrawal_lockup: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub confirmation_timeout: Duration,
    pub start_block: u64,
    pub apr_source: AprSource,
}

fn parse_address(field: &str, raw: &str, problems: &mut Vec<String>) -> Option<Address> {
    let hex = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"));
    match hex {
        Some(hex) if hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()) => {
            match Address::from_str(hex) {
                Ok(address) if address.is_zero() => {
                    problems.push(format!("{}: must not be the zero address", field));
                    None
                }
                Ok(address) => Some(address),
                Err(e) => {
                    problems.push(format!("{}: {}", field, e));
                    None
                }
            }
        }
        _ => {
            problems.push(format!(
                "{}: {:?} is not a 0x-prefixed 20-byte hex address",
                field, raw
            ));
            None
        }
    }
}

// Token, vault and proxy play different roles and must be different contracts.
fn check_distinct(addresses: &[(&str, Option<Address>)], problems: &mut Vec<String>) {
    for (index, (field, address)) in addresses.iter().enumerate() {
        let Some(address) = address else { continue };
        for (other_field, other) in &addresses[index + 1..] {
            if other.as_ref() == Some(address) {
                problems.push(format!("{}: same address as {}", other_field, field));
            }
        }
    }
}

impl VaultMetadataRecord {
    fn validate(&self) -> Result<VaultMetadata, Vec<String>> {
        let mut problems = Vec::new();
        if self.id.trim().is_empty() {
            problems.push("id: must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            problems.push("name: must not be empty".to_string());
        }
        if self.token_symbol.trim().is_empty() {
            problems.push("token-symbol: must not be empty".to_string());
        }
        if self.chain_id == 0 {
            problems.push("chain-id: must be positive".to_string());
        }
        if self.confirmation_timeout_ms == 0 {
            problems.push("confirmation-timeout-ms: must be positive".to_string());
        }
        let token_address = parse_address("token-address", &self.token_address, &mut problems);
        let vault_address = parse_address("vault-address", &self.vault_address, &mut problems);
        let vault_proxy_address = parse_address(
            "vault-proxy-address",
            &self.vault_proxy_address,
            &mut problems,
        );
        check_distinct(
            &[
                ("token-address", token_address),
                ("vault-address", vault_address),
                ("vault-proxy-address", vault_proxy_address),
            ],
            &mut problems,
        );
        match &self.apr_source {
            AprSource::None => {}
            AprSource::Fixed { apr_bps } => {
                // 1000% is already far outside anything a vault reports.
                if *apr_bps > 100_000 {
                    problems.push(format!("apr-source.apr-bps: {} is out of range", apr_bps));
                }
            }
            AprSource::Url { url } => match Url::parse(url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(parsed) => problems.push(format!(
                    "apr-source.url: unsupported scheme {:?}",
                    parsed.scheme()
                )),
                Err(e) => problems.push(format!("apr-source.url: {}", e)),
            },
        }

        if !problems.is_empty() {
            return Err(problems);
        }
        Ok(VaultMetadata {
            id: self.id.clone(),
            chain_id: self.chain_id,
            name: self.name.clone(),
            description: self.description.clone(),
            token_symbol: self.token_symbol.clone(),
            token_address: token_address.unwrap_or_default(),
            vault_address: vault_address.unwrap_or_default(),
            vault_proxy_address: vault_proxy_address.unwrap_or_default(),
            withdrawal_lockup: Duration::from_secs(self.withdrawal_lockup_secs),
            confirmation_timeout: Duration::from_millis(self.confirmation_timeout_ms),
            start_block: self.start_block,
            apr_source: self.apr_source.clone(),
        })
    }
}

/// The validated set of configured vaults, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct VaultConfigSet {
    vaults: Vec<Arc<VaultMetadata>>,
    by_id: BTreeMap<String, usize>,
}

impl VaultConfigSet {
    /// Validates every record. Any problem in any record rejects the whole set.
    pub fn from_records(records: Vec<VaultMetadataRecord>) -> EngineResult<Self> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();
        let mut vaults = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            if !seen.insert(record.id.clone()) {
                problems.push(format!("vaults[{}] ({}): duplicate id", index, record.id));
            }
            match record.validate() {
                Ok(metadata) => vaults.push(Arc::new(metadata)),
                Err(errors) => problems.extend(
                    errors
                        .into_iter()
                        .map(|e| format!("vaults[{}] ({}): {}", index, record.id, e)),
                ),
            }
        }
        // One provider serves every vault.
        let chain_ids: BTreeSet<u64> = records.iter().map(|record| record.chain_id).collect();
        if chain_ids.len() > 1 {
            problems.push(format!(
                "vaults span several chains {:?}; all vaults must share one chain id",
                chain_ids
            ));
        }
        if !problems.is_empty() {
            return Err(EngineError::ConfigValidation(problems.join("; ")));
        }
        let by_id = vaults
            .iter()
            .enumerate()
            .map(|(index, vault)| (vault.id.clone(), index))
            .collect();
        Ok(Self { vaults, by_id })
    }

    pub fn get(&self, vault_id: &str) -> EngineResult<&Arc<VaultMetadata>> {
        self.by_id
            .get(vault_id)
            .map(|index| &self.vaults[*index])
            .ok_or_else(|| EngineError::UnknownVault(vault_id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<VaultMetadata>> {
        self.vaults.iter()
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::vault_record;
    use std::io::Write;

    #[test]
    fn test_valid_records() {
        let set =
            VaultConfigSet::from_records(vec![vault_record("usdc", 1), vault_record("eth", 2)])
                .unwrap();
        assert_eq!(set.len(), 2);
        let usdc = set.get("usdc").unwrap();
        assert_eq!(usdc.vault_address, Address::from_low_u64_be(0x2001));
        assert_eq!(usdc.vault_proxy_address, Address::from_low_u64_be(0x3001));
        assert_eq!(usdc.confirmation_timeout, Duration::from_millis(60_000));
        assert_eq!(
            set.iter().map(|v| v.id.as_str()).collect::<Vec<_>>(),
            vec!["usdc", "eth"]
        );
        assert!(matches!(
            set.get("dai"),
            Err(EngineError::UnknownVault(id)) if id == "dai"
        ));
    }

    #[test]
    fn test_one_bad_record_rejects_the_whole_set() {
        let mut bad = vault_record("eth", 2);
        bad.vault_address = "0x1234".to_string();
        bad.apr_source = AprSource::Url {
            url: "ftp://apr.example".to_string(),
        };
        let err = VaultConfigSet::from_records(vec![vault_record("usdc", 1), bad]).unwrap_err();
        let EngineError::ConfigValidation(message) = err else {
            panic!("unexpected error {:?}", err);
        };
        assert!(message.contains("vaults[1] (eth): vault-address"), "{}", message);
        assert!(message.contains("unsupported scheme"), "{}", message);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = VaultConfigSet::from_records(vec![vault_record("usdc", 1), vault_record("usdc", 2)])
            .unwrap_err();
        assert_eq!(err.error_type(), "config_validation");
        assert!(err.to_string().contains("duplicate id"));
    }

    #[test]
    fn test_address_without_prefix_rejected() {
        let mut record = vault_record("usdc", 1);
        record.token_address = "11".repeat(20);
        assert!(VaultConfigSet::from_records(vec![record]).is_err());
    }

    #[test]
    fn test_zero_and_shared_addresses_rejected() {
        let mut record = vault_record("usdc", 1);
        record.token_address = format!("0x{}", "0".repeat(40));
        record.vault_proxy_address = record.vault_address.clone();
        let err = VaultConfigSet::from_records(vec![record]).unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("token-address: must not be the zero address"),
            "{}",
            message
        );
        assert!(
            message.contains("vault-proxy-address: same address as vault-address"),
            "{}",
            message
        );
    }

    #[test]
    fn test_vaults_on_different_chains_rejected() {
        let mut other = vault_record("weth", 2);
        other.chain_id = 5;
        let err = VaultConfigSet::from_records(vec![vault_record("usdc", 1), other]).unwrap_err();
        assert_eq!(err.error_type(), "config_validation");
        assert!(err.to_string().contains("several chains"), "{}", err);
    }

    #[test]
    fn test_engine_config_defaults_and_durations() {
        let yaml = r#"
eth-rpc-url: http://localhost:8545
expected-chain-id: 1
polling:
  snapshot-period: 60
reader:
  call-timeout-ms: 2500
vaults:
  - chain-id: 1
    id: usdc
    name: USDC Vault
    token-symbol: USDC
    token-address: "0x2222222222222222222222222222222222222222"
    vault-address: "0x1111111111111111111111111111111111111111"
    vault-proxy-address: "0x3333333333333333333333333333333333333333"
    confirmation-timeout-ms: 60000
    start-block: 100
    apr-source:
      type: fixed
      apr-bps: 450
"#;
        let config = EngineConfig::parse(yaml, true).unwrap();
        assert_eq!(config.polling.snapshot_period, Duration::from_secs(60));
        assert_eq!(config.polling.logs_period, Duration::from_secs(15));
        assert_eq!(config.polling.evict_after, Duration::from_secs(600));
        assert_eq!(config.reader.call_timeout, Duration::from_millis(2500));
        assert_eq!(config.reader.max_retry_elapsed, Duration::from_secs(5));
        assert_eq!(config.display_precision, 2);
        assert_eq!(config.server_listen_port, 9191);

        let vaults = config.load_vaults().unwrap();
        let usdc = vaults.get("usdc").unwrap();
        assert_eq!(usdc.apr_source, AprSource::Fixed { apr_bps: 450 });
        assert_eq!(usdc.start_block, 100);
    }

    #[test]
    fn test_load_vaults_from_file_and_chain_check() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        let records = vec![vault_record("usdc", 1), vault_record("eth", 2)];
        write!(file, "{}", serde_json::to_string(&records).unwrap()).unwrap();

        let mut config = EngineConfig::parse(r#"{"eth-rpc-url": "http://localhost:8545"}"#, false)
            .unwrap();
        config.vaults_path = Some(file.path().to_path_buf());
        assert_eq!(config.load_vaults().unwrap().len(), 2);

        config.expected_chain_id = Some(5);
        let err = config.load_vaults().unwrap_err();
        assert!(err.to_string().contains("not on expected chain 5"), "{}", err);
    }

    #[test]
    fn test_no_vaults_is_an_error() {
        let config =
            EngineConfig::parse(r#"{"eth-rpc-url": "http://localhost:8545"}"#, false).unwrap();
        assert!(config.load_vaults().is_err());
    }
}
