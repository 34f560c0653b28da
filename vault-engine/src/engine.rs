// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The process-wide engine context: vault configuration, chain access, the
//! read model cache and the countdown scheduler, wired together once.

use crate::chain_reader::ChainReader;
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, PollingConfig, VaultConfigSet, VaultMetadata};
use crate::countdown::{CountdownDisplay, CountdownScheduler};
use crate::error::{EngineError, EngineResult};
use crate::eth_reader::EthChainReader;
use crate::events::EventLogCollector;
use crate::lifecycle::WithdrawalLifecycleResolver;
use crate::metrics::VaultEngineMetrics;
use crate::read_model_cache::{
    CacheKey, CachedValue, ReadModel, ReadModelCache, ReadModelKind, ReadModelSource,
};
use crate::snapshot::VaultSnapshotAggregator;
use crate::types::{VaultHistory, WithdrawalLifecycle};
use anyhow::Context;
use async_trait::async_trait;
use ethers::types::Address;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

static ENGINE: OnceLock<Arc<VaultEngine>> = OnceLock::new();

/// Builds the read models the cache serves.
pub struct VaultReadModels {
    vaults: Arc<VaultConfigSet>,
    snapshots: VaultSnapshotAggregator,
    collector: EventLogCollector,
    resolver: WithdrawalLifecycleResolver,
}

impl VaultReadModels {
    pub fn new(
        vaults: Arc<VaultConfigSet>,
        reader: Arc<dyn ChainReader>,
        clock: Arc<dyn Clock>,
        display_precision: usize,
        metrics: Arc<VaultEngineMetrics>,
    ) -> Self {
        Self {
            snapshots: VaultSnapshotAggregator::new(reader.clone(), display_precision)
                .with_metrics(metrics.clone()),
            collector: EventLogCollector::new(reader.clone(), display_precision)
                .with_metrics(metrics),
            resolver: WithdrawalLifecycleResolver::new(reader, clock, display_precision),
            vaults,
        }
    }

    /// Events of the vault and the resolved withdrawals. With an owner, both
    /// are narrowed to that owner.
    pub async fn history(
        &self,
        vault: &VaultMetadata,
        owner: Option<Address>,
    ) -> EngineResult<VaultHistory> {
        let decimals = self.collector.read_decimals(vault).await?;
        let events = self.collector.collect_with_decimals(vault, decimals).await?;
        let events = match owner {
            Some(owner) => events.for_owner(owner),
            None => events,
        };
        let withdrawals = self
            .resolver
            .resolve(
                vault,
                decimals.share,
                &events.withdraw_requests,
                &events.updates_processed,
            )
            .await?;
        Ok(VaultHistory {
            vault_id: vault.id.clone(),
            owner,
            events,
            withdrawals,
        })
    }
}

#[async_trait]
impl ReadModelSource for VaultReadModels {
    async fn fetch(&self, key: &CacheKey) -> EngineResult<ReadModel> {
        let vault = self.vaults.get(&key.vault_id)?;
        match key.kind {
            ReadModelKind::Snapshot => {
                let snapshot = self.snapshots.snapshot(vault, key.owner).await?;
                Ok(ReadModel::Snapshot(Arc::new(snapshot)))
            }
            ReadModelKind::Logs => {
                let history = self.history(vault, key.owner).await?;
                Ok(ReadModel::History(Arc::new(history)))
            }
        }
    }
}

pub struct VaultEngine {
    vaults: Arc<VaultConfigSet>,
    cache: Arc<ReadModelCache>,
    countdowns: CountdownScheduler,
    clock: Arc<dyn Clock>,
    metrics: Arc<VaultEngineMetrics>,
}

impl VaultEngine {
    pub fn new(
        vaults: VaultConfigSet,
        reader: Arc<dyn ChainReader>,
        clock: Arc<dyn Clock>,
        polling: PollingConfig,
        display_precision: usize,
        metrics: Arc<VaultEngineMetrics>,
    ) -> Arc<Self> {
        let vaults = Arc::new(vaults);
        let models = VaultReadModels::new(
            vaults.clone(),
            reader,
            clock.clone(),
            display_precision,
            metrics.clone(),
        );
        let cache = ReadModelCache::new(Arc::new(models), clock.clone(), polling, metrics.clone());
        Arc::new(Self {
            vaults,
            cache,
            countdowns: CountdownScheduler::new(clock.clone()).with_metrics(metrics.clone()),
            clock,
            metrics,
        })
    }

    /// Builds the engine from configuration the first time it is called in
    /// this process. Later calls return the same instance.
    pub async fn initialize(
        config: &EngineConfig,
        metrics: Arc<VaultEngineMetrics>,
    ) -> anyhow::Result<Arc<Self>> {
        if let Some(engine) = ENGINE.get() {
            info!("[VaultEngine] already initialized, reusing the existing instance");
            return Ok(engine.clone());
        }

        let vaults = config.load_vaults()?;
        metrics.config_loads.inc();
        info!(
            "[VaultEngine] loaded {} vaults: {:?}",
            vaults.len(),
            vaults.iter().map(|v| v.id.as_str()).collect::<Vec<_>>()
        );
        let reader = EthChainReader::connect(
            &config.eth_rpc_url,
            config.expected_chain_id,
            &config.reader,
            metrics.clone(),
        )
        .await
        .with_context(|| format!("failed to connect to {}", config.eth_rpc_url))?;

        let engine = Self::new(
            vaults,
            Arc::new(reader),
            Arc::new(SystemClock),
            config.polling.clone(),
            config.display_precision,
            metrics,
        );
        Ok(ENGINE.get_or_init(|| engine).clone())
    }

    pub fn vaults(&self) -> &VaultConfigSet {
        &self.vaults
    }

    pub fn cache(&self) -> &Arc<ReadModelCache> {
        &self.cache
    }

    pub fn countdowns(&self) -> &CountdownScheduler {
        &self.countdowns
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<VaultEngineMetrics> {
        &self.metrics
    }

    pub async fn snapshot(
        &self,
        vault_id: &str,
        owner: Option<Address>,
    ) -> EngineResult<CachedValue> {
        self.vaults.get(vault_id)?;
        Ok(self.cache.get(&CacheKey::snapshot(vault_id, owner)).await)
    }

    pub async fn history(
        &self,
        vault_id: &str,
        owner: Option<Address>,
    ) -> EngineResult<CachedValue> {
        self.vaults.get(vault_id)?;
        Ok(self.cache.get(&CacheKey::logs(vault_id, owner)).await)
    }

    /// Snapshots of every configured vault. One vault failing does not affect
    /// the others.
    pub async fn snapshot_all(&self, owner: Option<Address>) -> Vec<(String, CachedValue)> {
        let reads = self.vaults.iter().map(|vault| async move {
            let value = self.cache.get(&CacheKey::snapshot(&vault.id, owner)).await;
            (vault.id.clone(), value)
        });
        futures::future::join_all(reads).await
    }

    /// Retires every key of `old_owner` and returns the keys of `new_owner`.
    pub async fn switch_owner(
        &self,
        old_owner: Option<Address>,
        new_owner: Option<Address>,
    ) -> Vec<CacheKey> {
        let mut keys = Vec::with_capacity(self.vaults.len() * 2);
        for vault in self.vaults.iter() {
            keys.extend(self.cache.switch_owner(&vault.id, old_owner, new_owner).await);
        }
        keys
    }

    /// Polls the anonymous snapshot and history of every vault, and sweeps
    /// idle cache keys, until `cancel` fires.
    pub async fn start_pollers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.vaults.len() * 2 + 1);
        for vault in self.vaults.iter() {
            for key in [
                CacheKey::snapshot(&vault.id, None),
                CacheKey::logs(&vault.id, None),
            ] {
                handles.push(self.cache.spawn_poller(key, cancel.clone()).await);
            }
        }
        info!("[VaultEngine] started {} pollers", handles.len());
        handles.push(self.cache.spawn_evictor(cancel));
        handles
    }

    /// Resolves the owner's withdrawals and binds a live countdown to each.
    pub async fn watch_withdrawals(
        &self,
        vault_id: &str,
        owner: Address,
    ) -> EngineResult<Vec<(WithdrawalLifecycle, watch::Receiver<CountdownDisplay>)>> {
        let cached = self.history(vault_id, Some(owner)).await?;
        let history = match (&cached.value, cached.error) {
            (_, Some(e)) => return Err(e),
            (Some(model), None) => model.as_history().cloned(),
            (None, None) => None,
        }
        .ok_or_else(|| EngineError::data_integrity(vault_id, "history not available"))?;

        let mut watched = Vec::with_capacity(history.withdrawals.len());
        for lifecycle in history.withdrawals.iter() {
            let receiver = self
                .countdowns
                .restart_for_lifecycle(vault_id, lifecycle)
                .await;
            watched.push((lifecycle.clone(), receiver));
        }
        Ok(watched)
    }
}
