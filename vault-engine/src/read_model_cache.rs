// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Polling read model cache with per-key singleflight.
//!
//! - At most one fetch is in flight per key; concurrent requesters join it
//! - A failed refresh keeps the last good value and sets the error flag
//! - Retiring a key bumps its generation, so late completions are dropped
//! - Pollers refresh a key on its kind's period until cancelled
//! - Keys without subscribers, pollers or a fetch are evicted once idle

use crate::clock::Clock;
use crate::config::PollingConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics::VaultEngineMetrics;
use crate::types::{VaultHistory, VaultSnapshot};
use async_trait::async_trait;
use ethers::types::Address;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadModelKind {
    Snapshot,
    Logs,
}

impl ReadModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadModelKind::Snapshot => "snapshot",
            ReadModelKind::Logs => "logs",
        }
    }

    pub fn period(&self, polling: &PollingConfig) -> Duration {
        match self {
            ReadModelKind::Snapshot => polling.snapshot_period,
            ReadModelKind::Logs => polling.logs_period,
        }
    }

    fn fresh_for(&self, polling: &PollingConfig) -> Duration {
        polling.stale_after.unwrap_or_else(|| self.period(polling))
    }
}

/// A wallet switch changes `owner`, and therefore the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub vault_id: String,
    pub owner: Option<Address>,
    pub kind: ReadModelKind,
}

impl CacheKey {
    pub fn snapshot(vault_id: impl Into<String>, owner: Option<Address>) -> Self {
        Self {
            vault_id: vault_id.into(),
            owner,
            kind: ReadModelKind::Snapshot,
        }
    }

    pub fn logs(vault_id: impl Into<String>, owner: Option<Address>) -> Self {
        Self {
            vault_id: vault_id.into(),
            owner,
            kind: ReadModelKind::Logs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ReadModel {
    Snapshot(Arc<VaultSnapshot>),
    History(Arc<VaultHistory>),
}

impl ReadModel {
    pub fn as_snapshot(&self) -> Option<&Arc<VaultSnapshot>> {
        match self {
            ReadModel::Snapshot(snapshot) => Some(snapshot),
            ReadModel::History(_) => None,
        }
    }

    pub fn as_history(&self) -> Option<&Arc<VaultHistory>> {
        match self {
            ReadModel::History(history) => Some(history),
            ReadModel::Snapshot(_) => None,
        }
    }
}

/// What a consumer sees for a key: the last good value, if any, and the
/// error of the latest refresh, if it failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedValue {
    pub value: Option<ReadModel>,
    pub error: Option<EngineError>,
    pub last_success_ms: Option<u64>,
    pub last_attempt_ms: Option<u64>,
}

impl CachedValue {
    /// A value is being served although its latest refresh failed.
    pub fn is_stale(&self) -> bool {
        self.value.is_some() && self.error.is_some()
    }
}

#[async_trait]
pub trait ReadModelSource: Send + Sync + 'static {
    async fn fetch(&self, key: &CacheKey) -> EngineResult<ReadModel>;
}

/// Push-based view of one key. Dropping it unsubscribes.
pub struct Subscription {
    pub receiver: watch::Receiver<CachedValue>,
    _guard: UnsubscribeGuard,
}

impl Subscription {
    pub fn current(&self) -> CachedValue {
        self.receiver.borrow().clone()
    }

    pub async fn changed(&mut self) -> Result<CachedValue, watch::error::RecvError> {
        self.receiver.changed().await?;
        Ok(self.receiver.borrow_and_update().clone())
    }
}

struct UnsubscribeGuard {
    subscribers: Arc<AtomicUsize>,
    unsubscribed: Arc<Notify>,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        if self.subscribers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.unsubscribed.notify_one();
        }
    }
}

// Counts the pollers of a slot for as long as the poller task lives.
struct PollerGuard(Arc<AtomicUsize>);

impl PollerGuard {
    fn new(pollers: Arc<AtomicUsize>) -> Self {
        pollers.fetch_add(1, Ordering::AcqRel);
        Self(pollers)
    }
}

impl Drop for PollerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Slot {
    generation: u64,
    last_read: Instant,
    value: Option<ReadModel>,
    error: Option<EngineError>,
    last_attempt: Option<Instant>,
    last_attempt_ms: Option<u64>,
    last_success_ms: Option<u64>,
    in_flight: Option<broadcast::Sender<CachedValue>>,
    updates: watch::Sender<CachedValue>,
    subscribers: Arc<AtomicUsize>,
    pollers: Arc<AtomicUsize>,
    unsubscribed: Arc<Notify>,
    retired: CancellationToken,
}

impl Slot {
    fn new(generation: u64) -> Self {
        let (updates, _) = watch::channel(CachedValue::default());
        Self {
            generation,
            last_read: Instant::now(),
            value: None,
            error: None,
            last_attempt: None,
            last_attempt_ms: None,
            last_success_ms: None,
            in_flight: None,
            updates,
            subscribers: Arc::new(AtomicUsize::new(0)),
            pollers: Arc::new(AtomicUsize::new(0)),
            unsubscribed: Arc::new(Notify::new()),
            retired: CancellationToken::new(),
        }
    }

    fn cached(&self) -> CachedValue {
        CachedValue {
            value: self.value.clone(),
            error: self.error.clone(),
            last_success_ms: self.last_success_ms,
            last_attempt_ms: self.last_attempt_ms,
        }
    }

    fn is_fresh(&self, fresh_for: Duration) -> bool {
        self.last_attempt
            .map(|at| at.elapsed() < fresh_for)
            .unwrap_or(false)
    }

    fn is_idle(&self, evict_after: Duration) -> bool {
        self.in_flight.is_none()
            && self.subscribers.load(Ordering::Acquire) == 0
            && self.pollers.load(Ordering::Acquire) == 0
            && self.last_read.elapsed() >= evict_after
    }

    fn apply(&mut self, result: EngineResult<ReadModel>, now_ms: u64) {
        self.last_attempt = Some(Instant::now());
        self.last_attempt_ms = Some(now_ms);
        match result {
            Ok(value) => {
                self.value = Some(value);
                self.error = None;
                self.last_success_ms = Some(now_ms);
            }
            // The previous value, if any, stays.
            Err(e) => self.error = Some(e),
        }
    }
}

// Keeps the active pollers gauge in sync however the poller exits.
struct ActivePoller(Arc<VaultEngineMetrics>);

impl ActivePoller {
    fn start(metrics: Arc<VaultEngineMetrics>) -> Self {
        metrics.active_pollers.inc();
        Self(metrics)
    }
}

impl Drop for ActivePoller {
    fn drop(&mut self) {
        self.0.active_pollers.dec();
    }
}

pub struct ReadModelCache {
    source: Arc<dyn ReadModelSource>,
    clock: Arc<dyn Clock>,
    polling: PollingConfig,
    slots: Mutex<HashMap<CacheKey, Slot>>,
    next_generation: AtomicU64,
    // Milliseconds since `created` at which a miss next sweeps idle keys.
    next_sweep_ms: AtomicU64,
    created: Instant,
    metrics: Arc<VaultEngineMetrics>,
}

enum Pending {
    Ready(CachedValue),
    Waiting(broadcast::Receiver<CachedValue>),
}

impl ReadModelCache {
    pub fn new(
        source: Arc<dyn ReadModelSource>,
        clock: Arc<dyn Clock>,
        polling: PollingConfig,
        metrics: Arc<VaultEngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            clock,
            polling,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            next_sweep_ms: AtomicU64::new(0),
            created: Instant::now(),
            metrics,
        })
    }

    pub fn polling(&self) -> &PollingConfig {
        &self.polling
    }

    fn new_slot(&self) -> Slot {
        Slot::new(self.next_generation.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of keys currently held.
    pub async fn key_count(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Drops every idle key and returns how many were dropped.
    pub async fn evict_idle(&self) -> usize {
        let mut slots = self.slots.lock().await;
        self.evict_idle_locked(&mut slots)
    }

    fn evict_idle_locked(&self, slots: &mut HashMap<CacheKey, Slot>) -> usize {
        let evict_after = self.polling.evict_after;
        let before = slots.len();
        slots.retain(|key, slot| {
            if !slot.is_idle(evict_after) {
                return true;
            }
            slot.retired.cancel();
            self.metrics
                .read_model_evicted
                .with_label_values(&[key.kind.as_str()])
                .inc();
            false
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            debug!(evicted, remaining = slots.len(), "[ReadModelCache] evicted idle keys");
        }
        evicted
    }

    // Sweeps at most twice per eviction window so misses stay cheap.
    fn sweep_if_due(&self, slots: &mut HashMap<CacheKey, Slot>) {
        let now_ms = self.created.elapsed().as_millis() as u64;
        if now_ms < self.next_sweep_ms.load(Ordering::Relaxed) {
            return;
        }
        let half_window = (self.polling.evict_after / 2).as_millis() as u64;
        self.next_sweep_ms
            .store(now_ms + half_window.max(1), Ordering::Relaxed);
        self.evict_idle_locked(slots);
    }

    /// Serves the cached value while it is fresh; otherwise fetches, or joins
    /// the fetch already in flight for this key.
    pub async fn get(self: &Arc<Self>, key: &CacheKey) -> CachedValue {
        self.load(key, false).await
    }

    /// Fetches regardless of freshness, still sharing an in-flight fetch.
    pub async fn refresh(self: &Arc<Self>, key: &CacheKey) -> CachedValue {
        self.load(key, true).await
    }

    async fn load(self: &Arc<Self>, key: &CacheKey, force: bool) -> CachedValue {
        let kind = key.kind.as_str();
        let pending = {
            let mut slots = self.slots.lock().await;
            if !slots.contains_key(key) {
                self.sweep_if_due(&mut slots);
            }
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| self.new_slot());
            slot.last_read = Instant::now();
            if let Some(in_flight) = &slot.in_flight {
                debug!(?key, "[ReadModelCache] joining in-flight fetch");
                self.metrics
                    .read_model_cache_joined
                    .with_label_values(&[kind])
                    .inc();
                Pending::Waiting(in_flight.subscribe())
            } else if !force && slot.is_fresh(key.kind.fresh_for(&self.polling)) {
                self.metrics
                    .read_model_cache_hit
                    .with_label_values(&[kind])
                    .inc();
                Pending::Ready(slot.cached())
            } else {
                self.metrics
                    .read_model_cache_miss
                    .with_label_values(&[kind])
                    .inc();
                let (tx, rx) = broadcast::channel(1);
                slot.in_flight = Some(tx.clone());
                tokio::spawn(self.clone().run_fetch(key.clone(), slot.generation, tx));
                Pending::Waiting(rx)
            }
        };

        match pending {
            Pending::Ready(value) => value,
            Pending::Waiting(mut rx) => match rx.recv().await {
                Ok(value) => value,
                Err(e) => {
                    warn!(?key, "[ReadModelCache] fetch ended without a result: {}", e);
                    self.peek(key).await.unwrap_or_default()
                }
            },
        }
    }

    async fn run_fetch(
        self: Arc<Self>,
        key: CacheKey,
        generation: u64,
        done: broadcast::Sender<CachedValue>,
    ) {
        // A panicking source must still clear the in-flight marker and answer
        // the joined callers, so the fetch runs as its own task.
        let source = self.source.clone();
        let fetch_key = key.clone();
        let result = match tokio::spawn(async move { source.fetch(&fetch_key).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(?key, "[ReadModelCache] fetch task failed: {}", e);
                Err(EngineError::data_integrity(
                    &key.vault_id,
                    format!("read model fetch failed: {}", e),
                ))
            }
        };
        let now_ms = self.clock.now_ms();
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.metrics
            .read_model_refreshes
            .with_label_values(&[key.kind.as_str(), outcome])
            .inc();

        let value = {
            let mut slots = self.slots.lock().await;
            match slots.get_mut(&key) {
                Some(slot) if slot.generation == generation => {
                    slot.in_flight = None;
                    slot.apply(result, now_ms);
                    let value = slot.cached();
                    slot.updates.send_replace(value.clone());
                    value
                }
                _ => {
                    // Superseded while in flight: answer the original callers only.
                    debug!(?key, generation, "[ReadModelCache] discarding superseded fetch");
                    self.metrics
                        .read_model_stale_discarded
                        .with_label_values(&[key.kind.as_str()])
                        .inc();
                    let mut detached = Slot::new(generation);
                    detached.apply(result, now_ms);
                    detached.cached()
                }
            }
        };
        if let Some(e) = &value.error {
            warn!(?key, "[ReadModelCache] refresh failed: {}", e);
        }
        let _ = done.send(value);
    }

    /// The cached value without triggering a fetch.
    pub async fn peek(&self, key: &CacheKey) -> Option<CachedValue> {
        self.slots.lock().await.get(key).map(Slot::cached)
    }

    pub async fn subscribe(&self, key: &CacheKey) -> Subscription {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| self.new_slot());
        slot.subscribers.fetch_add(1, Ordering::AcqRel);
        slot.last_read = Instant::now();
        Subscription {
            receiver: slot.updates.subscribe(),
            _guard: UnsubscribeGuard {
                subscribers: slot.subscribers.clone(),
                unsubscribed: slot.unsubscribed.clone(),
            },
        }
    }

    /// Drops the key's slot. Fetches still in flight for it will not write
    /// back, its pollers stop, and its subscribers see the channel close.
    pub async fn retire(&self, key: &CacheKey) -> bool {
        match self.slots.lock().await.remove(key) {
            Some(slot) => {
                slot.retired.cancel();
                info!(?key, generation = slot.generation, "[ReadModelCache] retired key");
                true
            }
            None => false,
        }
    }

    /// Retires both keys of the previous owner and returns the new owner's
    /// keys.
    pub async fn switch_owner(
        &self,
        vault_id: &str,
        old_owner: Option<Address>,
        new_owner: Option<Address>,
    ) -> [CacheKey; 2] {
        let new_keys = [
            CacheKey::snapshot(vault_id, new_owner),
            CacheKey::logs(vault_id, new_owner),
        ];
        if old_owner != new_owner {
            self.retire(&CacheKey::snapshot(vault_id, old_owner)).await;
            self.retire(&CacheKey::logs(vault_id, old_owner)).await;
        }
        new_keys
    }

    /// Refreshes `key` on its kind's period. Stops when `cancel` fires, when
    /// the key is retired, or when its last subscriber leaves.
    pub async fn spawn_poller(
        self: &Arc<Self>,
        key: CacheKey,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let (retired, subscribers, unsubscribed, guard) = {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| self.new_slot());
            (
                slot.retired.clone(),
                slot.subscribers.clone(),
                slot.unsubscribed.clone(),
                PollerGuard::new(slot.pollers.clone()),
            )
        };
        let period = key.kind.period(&self.polling);
        let cache = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _active = ActivePoller::start(cache.metrics.clone());
            info!(?key, ?period, "[ReadModelCache] poller started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = retired.cancelled() => break,
                    _ = unsubscribed.notified() => {
                        if subscribers.load(Ordering::Acquire) == 0 {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        cache.refresh(&key).await;
                    }
                }
            }
            info!(?key, "[ReadModelCache] poller stopped");
        })
    }

    /// Sweeps idle keys every half eviction window until `cancel` fires.
    pub fn spawn_evictor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = (self.polling.evict_after / 2).max(Duration::from_secs(1));
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        cache.evict_idle().await;
                    }
                }
            }
        })
    }
}
