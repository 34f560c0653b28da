// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::with_metrics;
use crate::{
    config::VaultMetadata,
    error::EngineError,
    metrics::VaultEngineMetrics,
    server::handler::{ErrorBody, ReadModelResponse, VaultRequestHandler, VaultRequestHandlerTrait},
};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use axum::{http::StatusCode, routing::get, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod handler;

pub const HEALTH_PATH: &str = "/health";
pub const VAULTS_PATH: &str = "/vaults";
// Note: Using :param syntax for axum 0.7.x (not {param} which is for axum 0.8.x)
pub const SNAPSHOT_PATH: &str = "/vaults/:vault_id/snapshot";
pub const HISTORY_PATH: &str = "/vaults/:vault_id/history";

#[derive(Debug, Default, Deserialize)]
pub struct OwnerQuery {
    pub owner: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    Unavailable(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Engine(EngineError::UnknownVault(_)) => StatusCode::NOT_FOUND,
            ApiError::Engine(EngineError::ConfigValidation(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Engine(_) | ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Engine(e) => ErrorBody::from(e),
            ApiError::BadRequest(message) => ErrorBody {
                error_type: "bad_request".to_string(),
                message: message.clone(),
            },
            ApiError::Unavailable(message) => ErrorBody {
                error_type: "unavailable".to_string(),
                message: message.clone(),
            },
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), Json(self.body())).into_response()
    }
}

pub fn run_server(
    socket_address: &SocketAddr,
    handler: VaultRequestHandler,
    metrics: Arc<VaultEngineMetrics>,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(socket_address).await?;
        info!("[Server] listening on {}", socket_address);
        axum::serve(
            listener,
            make_router(Arc::new(handler), metrics).into_make_service(),
        )
        .await?;
        Ok(())
    })
}

pub(crate) fn make_router(
    handler: Arc<impl VaultRequestHandlerTrait + Sync + Send + 'static>,
    metrics: Arc<VaultEngineMetrics>,
) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(VAULTS_PATH, get(list_vaults))
        .route(SNAPSHOT_PATH, get(handle_snapshot))
        .route(HISTORY_PATH, get(handle_history))
        .with_state((handler, metrics))
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn list_vaults(
    State((handler, _)): State<(
        Arc<impl VaultRequestHandlerTrait + Sync + Send>,
        Arc<VaultEngineMetrics>,
    )>,
) -> Json<Vec<Arc<VaultMetadata>>> {
    Json(handler.vaults())
}

#[instrument(level = "error", skip_all, fields(vault_id = vault_id))]
async fn handle_snapshot(
    Path(vault_id): Path<String>,
    Query(query): Query<OwnerQuery>,
    State((handler, metrics)): State<(
        Arc<impl VaultRequestHandlerTrait + Sync + Send>,
        Arc<VaultEngineMetrics>,
    )>,
) -> Result<Json<ReadModelResponse>, ApiError> {
    let future = handler.handle_snapshot(vault_id, query.owner);
    with_metrics!(metrics.clone(), "handle_snapshot", future).await
}

#[instrument(level = "error", skip_all, fields(vault_id = vault_id))]
async fn handle_history(
    Path(vault_id): Path<String>,
    Query(query): Query<OwnerQuery>,
    State((handler, metrics)): State<(
        Arc<impl VaultRequestHandlerTrait + Sync + Send>,
        Arc<VaultEngineMetrics>,
    )>,
) -> Result<Json<ReadModelResponse>, ApiError> {
    let future = handler.handle_history(vault_id, query.owner);
    with_metrics!(metrics.clone(), "handle_history", future).await
}

#[macro_export]
macro_rules! with_metrics {
    ($metrics:expr, $type_:expr, $func:expr) => {
        async move {
            info!("Received {} request", $type_);
            $metrics
                .requests_received
                .with_label_values(&[$type_])
                .inc();
            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .inc();

            let result = $func.await;

            match &result {
                Ok(_) => {
                    info!("{} request succeeded", $type_);
                    $metrics.requests_ok.with_label_values(&[$type_]).inc();
                }
                Err(e) => {
                    info!("{} request failed: {:?}", $type_, e);
                    $metrics.err_requests.with_label_values(&[$type_]).inc();
                }
            }

            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .dec();
            result
        }
    };
}
