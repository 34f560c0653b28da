// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::*;
use vault_cli::{
    cached_to_json, connect_engine, countdown_line, describe_vaults, load_and_validate, Args,
    VaultCommand,
};
use vault_engine::countdown::CountdownState;
use vault_engine::node::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine readable
    init_logging("warn");
    let args = Args::parse();

    match args.command {
        VaultCommand::ValidateConfig { config_path } => {
            let (config, vaults) = load_and_validate(&config_path)?;
            tracing::debug!("Config loaded from {}", config_path.display());
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "eth_rpc_url": config.eth_rpc_url,
                    "vaults": describe_vaults(&vaults),
                }))?
            );
        }
        VaultCommand::Snapshot {
            config_path,
            vault_id,
            owner,
        } => {
            let engine = connect_engine(&config_path).await?;
            let cached = engine.snapshot(&vault_id, owner).await?;
            println!("{}", serde_json::to_string_pretty(&cached_to_json(&cached)?)?);
        }
        VaultCommand::History {
            config_path,
            vault_id,
            owner,
        } => {
            let engine = connect_engine(&config_path).await?;
            let cached = engine.history(&vault_id, owner).await?;
            println!("{}", serde_json::to_string_pretty(&cached_to_json(&cached)?)?);
        }
        VaultCommand::LifecycleCountdown {
            config_path,
            vault_id,
            owner,
        } => {
            let engine = connect_engine(&config_path).await?;
            let watched = engine.watch_withdrawals(&vault_id, owner).await?;
            if watched.is_empty() {
                println!("No withdrawal requests for {:?} in vault {}", owner, vault_id);
                return Ok(());
            }

            let followers = watched.into_iter().map(|(lifecycle, mut receiver)| async move {
                loop {
                    let display = receiver.borrow_and_update().clone();
                    println!("{}", countdown_line(&lifecycle, &display));
                    // Idle and Claimable displays never tick again.
                    if !matches!(display.state, CountdownState::Counting { .. }) {
                        break;
                    }
                    if receiver.changed().await.is_err() {
                        break;
                    }
                }
            });
            tokio::select! {
                _ = futures::future::join_all(followers) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                }
            }
        }
    }
    Ok(())
}
