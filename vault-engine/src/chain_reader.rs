// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The read-only chain access seam the engine is written against.

use crate::error::ReadError;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, Log, H256};

/// A single `eth_call` against `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub target: Address,
    pub calldata: Bytes,
    /// Function name, used for logs and metric labels.
    pub label: &'static str,
}

impl ContractCall {
    pub fn new(target: Address, calldata: impl Into<Bytes>, label: &'static str) -> Self {
        Self {
            target,
            calldata: calldata.into(),
            label,
        }
    }
}

/// Per-call result inside a batch. A failed call does not fail the batch.
pub type CallOutcome = Result<Bytes, ReadError>;

#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Executes `calls` as one batch. Implementations must return exactly one
    /// outcome per call, in call order; callers verify this.
    async fn batch_read(&self, calls: &[ContractCall]) -> Result<Vec<CallOutcome>, ReadError>;

    async fn read_one(&self, call: &ContractCall) -> Result<Bytes, ReadError>;

    /// Raw logs emitted by `address` with topic0 `event_signature` in
    /// `[from_block, to_block]`.
    async fn get_logs(
        &self,
        address: Address,
        event_signature: H256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ReadError>;

    async fn latest_block(&self) -> Result<u64, ReadError>;
}
