// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::VaultMetadata;
use crate::engine::VaultEngine;
use crate::error::EngineError;
use crate::read_model_cache::{CachedValue, ReadModel};
use crate::server::ApiError;
use async_trait::async_trait;
use axum::Json;
use ethers::types::Address;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Body of a snapshot or history response. A value served after a failed
/// refresh carries that failure in `error` with `stale` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadModelResponse {
    pub vault_id: String,
    pub owner: Option<Address>,
    #[serde(flatten)]
    pub value: ReadModel,
    pub error: Option<ErrorBody>,
    pub stale: bool,
    pub last_success_ms: Option<u64>,
    pub last_attempt_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error_type: String,
    pub message: String,
}

impl From<&EngineError> for ErrorBody {
    fn from(e: &EngineError) -> Self {
        Self {
            error_type: e.error_type().to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
pub trait VaultRequestHandlerTrait {
    fn vaults(&self) -> Vec<Arc<VaultMetadata>>;

    // Handles a request for the snapshot of one vault, optionally including
    // the position of `owner` (a 0x-prefixed address)
    async fn handle_snapshot(
        &self,
        vault_id: String,
        owner: Option<String>,
    ) -> Result<Json<ReadModelResponse>, ApiError>;

    // Handles a request for the event history and withdrawal lifecycles of one
    // vault, narrowed to `owner` when given
    async fn handle_history(
        &self,
        vault_id: String,
        owner: Option<String>,
    ) -> Result<Json<ReadModelResponse>, ApiError>;
}

pub struct VaultRequestHandler {
    engine: Arc<VaultEngine>,
}

impl VaultRequestHandler {
    pub fn new(engine: Arc<VaultEngine>) -> Self {
        Self { engine }
    }
}

pub(crate) fn parse_owner(owner: Option<String>) -> Result<Option<Address>, ApiError> {
    let Some(raw) = owner.filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    match raw.strip_prefix("0x") {
        Some(hex) if hex.len() == 40 => Address::from_str(hex)
            .map(Some)
            .map_err(|e| ApiError::BadRequest(format!("invalid owner {:?}: {}", raw, e))),
        _ => Err(ApiError::BadRequest(format!(
            "invalid owner {:?}: expected a 0x-prefixed 20-byte hex address",
            raw
        ))),
    }
}

fn into_response(
    vault_id: String,
    owner: Option<Address>,
    cached: CachedValue,
) -> Result<Json<ReadModelResponse>, ApiError> {
    let stale = cached.is_stale();
    match (cached.value, cached.error) {
        (Some(value), error) => Ok(Json(ReadModelResponse {
            vault_id,
            owner,
            value,
            error: error.as_ref().map(ErrorBody::from),
            stale,
            last_success_ms: cached.last_success_ms,
            last_attempt_ms: cached.last_attempt_ms,
        })),
        (None, Some(error)) => Err(ApiError::Engine(error)),
        (None, None) => Err(ApiError::Unavailable(format!(
            "no data for vault {} yet",
            vault_id
        ))),
    }
}

#[async_trait]
impl VaultRequestHandlerTrait for VaultRequestHandler {
    fn vaults(&self) -> Vec<Arc<VaultMetadata>> {
        self.engine.vaults().iter().cloned().collect()
    }

    async fn handle_snapshot(
        &self,
        vault_id: String,
        owner: Option<String>,
    ) -> Result<Json<ReadModelResponse>, ApiError> {
        let owner = parse_owner(owner)?;
        info!(%vault_id, ?owner, "[VaultRequestHandler] snapshot");
        let cached = self.engine.snapshot(&vault_id, owner).await?;
        into_response(vault_id, owner, cached)
    }

    async fn handle_history(
        &self,
        vault_id: String,
        owner: Option<String>,
    ) -> Result<Json<ReadModelResponse>, ApiError> {
        let owner = parse_owner(owner)?;
        info!(%vault_id, ?owner, "[VaultRequestHandler] history");
        let cached = self.engine.history(&vault_id, owner).await?;
        into_response(vault_id, owner, cached)
    }
}
