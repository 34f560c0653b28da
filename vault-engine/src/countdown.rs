// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Live remaining-time displays for withdrawals waiting on their claim time.
//!
//! Each display is a small state machine: `Idle` without a usable target,
//! `Counting` while the target is in the future, and `Claimable` once it is
//! reached. `Claimable` is terminal: the display is pinned to all zeros and the
//! ticking task exits.

use crate::clock::Clock;
use crate::format::format_time_remaining;
use crate::metrics::VaultEngineMetrics;
use crate::types::WithdrawalLifecycle;
use ethers::types::Address;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

const CLAIMABLE_DISPLAY: &str = "00:00:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CountdownState {
    Idle,
    Counting { target_ms: u64 },
    Claimable,
}

pub fn countdown_state(target_ms: Option<u64>, now_ms: u64) -> CountdownState {
    match target_ms {
        None => CountdownState::Idle,
        Some(target_ms) if now_ms >= target_ms => CountdownState::Claimable,
        Some(target_ms) => CountdownState::Counting { target_ms },
    }
}

/// Parses a countdown target given as epoch milliseconds or an RFC 3339
/// timestamp.
pub fn parse_target(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse().ok();
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .and_then(|at| u64::try_from(at.timestamp_millis()).ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountdownDisplay {
    #[serde(flatten)]
    pub state: CountdownState,
    /// `None` while idle.
    pub text: Option<String>,
    pub generation: u64,
}

impl CountdownDisplay {
    fn render(state: CountdownState, now_ms: u64, generation: u64) -> Self {
        let text = match state {
            CountdownState::Idle => None,
            CountdownState::Counting { target_ms } => {
                Some(format_time_remaining(target_ms.saturating_sub(now_ms)))
            }
            CountdownState::Claimable => Some(CLAIMABLE_DISPLAY.to_string()),
        };
        Self {
            state,
            text,
            generation,
        }
    }

    fn idle(generation: u64) -> Self {
        Self::render(CountdownState::Idle, 0, generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CountdownId {
    pub vault_id: String,
    pub owner: Address,
    pub update_id: u64,
}

impl CountdownId {
    pub fn for_lifecycle(vault_id: &str, lifecycle: &WithdrawalLifecycle) -> Self {
        Self {
            vault_id: vault_id.to_string(),
            owner: lifecycle.owner,
            update_id: lifecycle.update_id,
        }
    }
}

struct Slot {
    generation: u64,
    sender: Arc<watch::Sender<CountdownDisplay>>,
    task: Option<JoinHandle<()>>,
}

impl Slot {
    fn new() -> Self {
        let (sender, _) = watch::channel(CountdownDisplay::idle(0));
        Self {
            generation: 0,
            sender: Arc::new(sender),
            task: None,
        }
    }

    fn cancel_tick(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// Keeps the active countdowns gauge honest when a tick task is aborted.
struct ActiveCountdown(Option<Arc<VaultEngineMetrics>>);

impl ActiveCountdown {
    fn start(metrics: Option<Arc<VaultEngineMetrics>>) -> Self {
        if let Some(metrics) = &metrics {
            metrics.active_countdowns.inc();
        }
        Self(metrics)
    }
}

impl Drop for ActiveCountdown {
    fn drop(&mut self) {
        if let Some(metrics) = &self.0 {
            metrics.active_countdowns.dec();
        }
    }
}

pub struct CountdownScheduler {
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    slots: Mutex<HashMap<CountdownId, Slot>>,
    metrics: Option<Arc<VaultEngineMetrics>>,
}

impl CountdownScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tick_interval: TICK_INTERVAL,
            slots: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<VaultEngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Binds the display to `target_ms`, replacing whatever it was bound to.
    /// Ticks scheduled for the previous target never reach the display again.
    pub async fn restart(
        &self,
        id: CountdownId,
        target_ms: Option<u64>,
    ) -> watch::Receiver<CountdownDisplay> {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(id.clone()).or_insert_with(Slot::new);
        slot.cancel_tick();
        slot.generation += 1;
        let generation = slot.generation;

        let now_ms = self.clock.now_ms();
        let state = countdown_state(target_ms, now_ms);
        slot.sender
            .send_replace(CountdownDisplay::render(state, now_ms, generation));
        debug!(
            ?id,
            generation,
            "[CountdownScheduler] restarted as {:?}",
            state
        );

        if let CountdownState::Counting { target_ms } = state {
            slot.task = Some(tokio::spawn(tick_until_claimable(
                self.clock.clone(),
                slot.sender.clone(),
                self.tick_interval,
                target_ms,
                generation,
                ActiveCountdown::start(self.metrics.clone()),
            )));
        }
        slot.sender.subscribe()
    }

    /// Like `restart`, with the target given as text. Unparseable targets
    /// leave the display idle.
    pub async fn restart_from_str(
        &self,
        id: CountdownId,
        raw_target: &str,
    ) -> watch::Receiver<CountdownDisplay> {
        self.restart(id, parse_target(raw_target)).await
    }

    pub async fn restart_for_lifecycle(
        &self,
        vault_id: &str,
        lifecycle: &WithdrawalLifecycle,
    ) -> watch::Receiver<CountdownDisplay> {
        self.restart(
            CountdownId::for_lifecycle(vault_id, lifecycle),
            lifecycle.claimable_at_timestamp,
        )
        .await
    }

    /// Observes a display without changing it. Unknown displays start idle.
    pub async fn subscribe(&self, id: CountdownId) -> watch::Receiver<CountdownDisplay> {
        let mut slots = self.slots.lock().await;
        slots.entry(id).or_insert_with(Slot::new).sender.subscribe()
    }

    /// Stops ticking and drops the display. Subscribers see the channel close.
    pub async fn remove(&self, id: &CountdownId) {
        if let Some(mut slot) = self.slots.lock().await.remove(id) {
            slot.cancel_tick();
        }
    }

    pub async fn current(&self, id: &CountdownId) -> Option<CountdownDisplay> {
        self.slots
            .lock()
            .await
            .get(id)
            .map(|slot| slot.sender.borrow().clone())
    }
}

fn until_target(clock: &dyn Clock, target_ms: u64) -> Duration {
    Duration::from_millis(target_ms.saturating_sub(clock.now_ms()))
}

// Ticks once per interval for the text, and wakes exactly at the target so
// `Claimable` is not held back until the next whole tick.
async fn tick_until_claimable(
    clock: Arc<dyn Clock>,
    sender: Arc<watch::Sender<CountdownDisplay>>,
    tick_interval: Duration,
    target_ms: u64,
    generation: u64,
    _active: ActiveCountdown,
) {
    let start = tokio::time::Instant::now() + tick_interval;
    let mut interval = tokio::time::interval_at(start, tick_interval);
    let deadline = tokio::time::sleep(until_target(clock.as_ref(), target_ms));
    tokio::pin!(deadline);
    loop {
        let at_deadline = tokio::select! {
            _ = interval.tick() => false,
            _ = &mut deadline => true,
        };
        let now_ms = clock.now_ms();
        let state = countdown_state(Some(target_ms), now_ms);
        let mut superseded = false;
        // The generation check and the write happen under the channel lock,
        // so a restart that already published cannot be overwritten.
        sender.send_if_modified(|display| {
            if display.generation != generation {
                superseded = true;
                return false;
            }
            *display = CountdownDisplay::render(state, now_ms, generation);
            true
        });
        if superseded || state == CountdownState::Claimable {
            return;
        }
        if at_deadline {
            // The clock lags the timer; wait out the rest.
            deadline
                .as_mut()
                .reset(tokio::time::Instant::now() + until_target(clock.as_ref(), target_ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    const T0: u64 = 1_700_000_000_000;

    fn id(update_id: u64) -> CountdownId {
        CountdownId {
            vault_id: "usdc".to_string(),
            owner: Address::repeat_byte(1),
            update_id,
        }
    }

    fn scheduler() -> (CountdownScheduler, Arc<VaultEngineMetrics>) {
        let metrics = Arc::new(VaultEngineMetrics::new_for_testing());
        let scheduler = CountdownScheduler::new(Arc::new(TokioClock::anchored_at(T0)))
            .with_metrics(metrics.clone());
        (scheduler, metrics)
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(
            parse_target("2024-01-01T00:00:00Z"),
            Some(1_704_067_200_000)
        );
        assert_eq!(
            parse_target("2024-01-01T02:00:00+02:00"),
            Some(1_704_067_200_000)
        );
        assert_eq!(parse_target("next tuesday"), None);
        assert_eq!(parse_target(""), None);
        assert_eq!(parse_target("1969-12-31T00:00:00Z"), None);
    }

    #[test]
    fn test_countdown_state() {
        assert_eq!(countdown_state(None, T0), CountdownState::Idle);
        assert_eq!(countdown_state(Some(T0), T0), CountdownState::Claimable);
        assert_eq!(
            countdown_state(Some(T0 + 1), T0),
            CountdownState::Counting { target_ms: T0 + 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_down_then_pins_claimable() {
        let (scheduler, metrics) = scheduler();
        let mut rx = scheduler.restart(id(1), Some(T0 + 3_000)).await;
        assert_eq!(rx.borrow_and_update().text.as_deref(), Some("00:00:03"));
        assert_eq!(metrics.active_countdowns.get(), 1);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().text.as_deref(), Some("00:00:02"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().text.as_deref(), Some("00:00:01"));
        rx.changed().await.unwrap();
        let display = rx.borrow_and_update().clone();
        assert_eq!(display.state, CountdownState::Claimable);
        assert_eq!(display.text.as_deref(), Some("00:00:00"));

        // terminal: no further ticks
        let next = tokio::time::timeout(Duration::from_secs(30), rx.changed()).await;
        assert!(next.is_err());
        assert_eq!(metrics.active_countdowns.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimable_exactly_at_sub_second_target() {
        let clock = TokioClock::anchored_at(T0);
        let scheduler = CountdownScheduler::new(Arc::new(clock));
        let mut rx = scheduler.restart(id(1), Some(T0 + 2_500)).await;

        let mut seen = vec![];
        loop {
            rx.changed().await.unwrap();
            let display = rx.borrow_and_update().clone();
            seen.push((clock.now_ms() - T0, display.text.clone()));
            if display.state == CountdownState::Claimable {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                (1_000, Some("00:00:01".to_string())),
                (2_000, Some("00:00:00".to_string())),
                (2_500, Some("00:00:00".to_string())),
            ]
        );
        assert_eq!(rx.borrow().state, CountdownState::Claimable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_target() {
        let (scheduler, _) = scheduler();
        let _old = scheduler.restart(id(1), Some(T0 + 10_000)).await;
        let mut rx = scheduler.restart(id(1), Some(T0 + 100_000)).await;

        for expected in ["00:01:39", "00:01:38", "00:01:37"] {
            rx.changed().await.unwrap();
            let display = rx.borrow_and_update().clone();
            assert_eq!(display.generation, 2);
            assert_eq!(display.text.as_deref(), Some(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tick_cannot_overwrite_newer_display() {
        let (scheduler, _) = scheduler();
        let rx = scheduler.restart(id(1), Some(T0 + 10_000)).await;
        // Simulate a tick that was already past its abort point.
        let sender = {
            let slots = scheduler.slots.lock().await;
            slots.get(&id(1)).unwrap().sender.clone()
        };
        let _ = scheduler.restart(id(1), None).await;
        let written = sender.send_if_modified(|display| {
            if display.generation != 1 {
                return false;
            }
            *display = CountdownDisplay::render(CountdownState::Claimable, T0, 1);
            true
        });
        assert!(!written);
        assert_eq!(rx.borrow().state, CountdownState::Idle);
        assert_eq!(rx.borrow().text, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_or_unparseable_target_is_idle() {
        let (scheduler, metrics) = scheduler();
        let rx = scheduler.restart_from_str(id(1), "soon").await;
        assert_eq!(rx.borrow().state, CountdownState::Idle);
        assert_eq!(rx.borrow().text, None);
        assert_eq!(metrics.active_countdowns.get(), 0);

        let rx = scheduler.restart(id(2), None).await;
        assert_eq!(rx.borrow().state, CountdownState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_target_is_claimable_without_ticking() {
        let (scheduler, metrics) = scheduler();
        let rx = scheduler
            .restart_from_str(id(1), &(T0 - 5_000).to_string())
            .await;
        assert_eq!(rx.borrow().state, CountdownState::Claimable);
        assert_eq!(rx.borrow().text.as_deref(), Some("00:00:00"));
        assert_eq!(metrics.active_countdowns.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_stops_ticking() {
        let (scheduler, metrics) = scheduler();
        let mut rx = scheduler.restart(id(1), Some(T0 + 60_000)).await;
        scheduler.remove(&id(1)).await;
        assert!(rx.changed().await.is_err());
        assert_eq!(metrics.active_countdowns.get(), 0);
        assert!(scheduler.current(&id(1)).await.is_none());
    }
}
