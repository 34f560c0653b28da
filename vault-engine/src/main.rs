// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use vault_engine::config::EngineConfig;
use vault_engine::node::{init_logging, run_vault_node, start_prometheus_server};
use vault_engine_config::Config;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging("info");
    let config = EngineConfig::load(&args.config_path)?;

    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    let prometheus_registry = start_prometheus_server(metrics_address);
    info!("Metrics server started at port {}", config.metrics_port);

    let cancel = CancellationToken::new();
    let mut handle = run_vault_node(config, prometheus_registry, cancel.clone()).await?;

    tokio::select! {
        result = &mut handle => {
            cancel.cancel();
            result.map_err(|e| anyhow::anyhow!("Task join error: {}", e))?
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, stopping pollers");
            cancel.cancel();
            handle.abort();
            Ok(())
        }
    }
}
