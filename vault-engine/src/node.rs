// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::EngineConfig,
    engine::VaultEngine,
    metrics::VaultEngineMetrics,
    server::{handler::VaultRequestHandler, run_server},
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const METRICS_PATH: &str = "/metrics";

/// Installs the global subscriber. `RUST_LOG` overrides `default_level`.
pub fn init_logging(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init();
}

async fn metrics_handler(State(registry): State<Registry>) -> impl IntoResponse {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned()),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        ),
    }
}

/// Serves `registry` in the prometheus text format and returns it.
pub fn start_prometheus_server(address: SocketAddr) -> Registry {
    let registry = Registry::new();
    let app = Router::new()
        .route(METRICS_PATH, get(metrics_handler))
        .with_state(registry.clone());
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server to {}: {}", address, e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
            error!("Metrics server exited: {}", e);
        }
    });
    registry
}

/// Starts pollers for every configured vault and the read API. The returned
/// handle resolves when the server stops; `cancel` stops the pollers.
pub async fn run_vault_node(
    config: EngineConfig,
    prometheus_registry: Registry,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
    let metrics = Arc::new(VaultEngineMetrics::new(&prometheus_registry));
    let start_time = std::time::Instant::now();

    // Start server uptime tracking task
    let uptime_metrics = metrics.clone();
    let uptime_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            uptime_metrics
                .server_uptime_seconds
                .set(start_time.elapsed().as_secs() as i64);
            tokio::select! {
                _ = uptime_cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(10)) => {}
            }
        }
    });

    let engine = VaultEngine::initialize(&config, metrics.clone()).await?;
    let pollers = engine.start_pollers(cancel.clone()).await;
    info!("Started {} read model tasks", pollers.len());

    let socket_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        config.server_listen_port,
    );
    Ok(run_server(
        &socket_address,
        VaultRequestHandler::new(engine),
        metrics,
    ))
}
