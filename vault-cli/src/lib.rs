// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::*;
use ethers::types::Address as EthAddress;
use prometheus::Registry;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vault_engine::config::{EngineConfig, VaultConfigSet};
use vault_engine::countdown::{CountdownDisplay, CountdownState};
use vault_engine::engine::VaultEngine;
use vault_engine::metrics::VaultEngineMetrics;
use vault_engine::read_model_cache::CachedValue;
use vault_engine::types::WithdrawalLifecycle;
use vault_engine_config::Config;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_PKG_NAME"))]
pub struct Args {
    #[clap(subcommand)]
    pub command: VaultCommand,
}

#[derive(Parser, Debug, PartialEq, Eq)]
#[clap(rename_all = "kebab-case")]
pub enum VaultCommand {
    // Load the engine config and validate every vault metadata record
    #[clap(name = "validate-config")]
    ValidateConfig {
        #[clap(long = "config-path")]
        config_path: PathBuf,
    },
    // Print one vault snapshot as JSON
    #[clap(name = "snapshot")]
    Snapshot {
        #[clap(long = "config-path")]
        config_path: PathBuf,
        #[clap(long = "vault-id")]
        vault_id: String,
        #[clap(long)]
        owner: Option<EthAddress>,
    },
    // Print the event history and withdrawal lifecycles of one vault as JSON
    #[clap(name = "history")]
    History {
        #[clap(long = "config-path")]
        config_path: PathBuf,
        #[clap(long = "vault-id")]
        vault_id: String,
        #[clap(long)]
        owner: Option<EthAddress>,
    },
    // Follow the claim countdown of each of the owner's withdrawals
    #[clap(name = "lifecycle-countdown")]
    LifecycleCountdown {
        #[clap(long = "config-path")]
        config_path: PathBuf,
        #[clap(long = "vault-id")]
        vault_id: String,
        #[clap(long)]
        owner: EthAddress,
    },
}

/// Loads the config and validates its vault set without touching the chain.
pub fn load_and_validate(config_path: &Path) -> anyhow::Result<(EngineConfig, VaultConfigSet)> {
    let config = EngineConfig::load(config_path)?;
    let vaults = config
        .load_vaults()
        .with_context(|| format!("invalid vault configuration in {}", config_path.display()))?;
    Ok((config, vaults))
}

pub fn describe_vaults(vaults: &VaultConfigSet) -> Value {
    Value::Array(
        vaults
            .iter()
            .map(|vault| {
                json!({
                    "id": vault.id,
                    "name": vault.name,
                    "chain_id": vault.chain_id,
                    "token_symbol": vault.token_symbol,
                    "vault_address": vault.vault_address,
                    "vault_proxy_address": vault.vault_proxy_address,
                    "start_block": vault.start_block,
                })
            })
            .collect(),
    )
}

/// Connects an engine for a one-shot command. Metrics go to a private registry.
pub async fn connect_engine(config_path: &Path) -> anyhow::Result<Arc<VaultEngine>> {
    let config = EngineConfig::load(config_path)?;
    let metrics = Arc::new(VaultEngineMetrics::new(&Registry::new()));
    VaultEngine::initialize(&config, metrics).await
}

/// Renders a cached read as JSON. A read with no value is an error.
pub fn cached_to_json(cached: &CachedValue) -> anyhow::Result<Value> {
    match (&cached.value, &cached.error) {
        (Some(value), error) => Ok(json!({
            "value": value,
            "stale_error": error.as_ref().map(|e| e.to_string()),
        })),
        (None, Some(error)) => Err(anyhow::anyhow!("{} ({})", error, error.error_type())),
        (None, None) => Err(anyhow::anyhow!("no data available")),
    }
}

pub fn countdown_line(lifecycle: &WithdrawalLifecycle, display: &CountdownDisplay) -> String {
    let status = match display.state {
        CountdownState::Idle => "waiting for claim record".to_string(),
        CountdownState::Counting { .. } => format!(
            "claimable in {}",
            display.text.as_deref().unwrap_or_default()
        ),
        CountdownState::Claimable => "claimable now".to_string(),
    };
    format!(
        "update {} | {} shares | rate {} | {}",
        lifecycle.update_id, lifecycle.shares, lifecycle.withdraw_rate, status
    )
}
