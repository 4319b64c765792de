// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for conveyor-core pipeline tests.
//!
//! Provides an in-memory subsystem context, recording stage implementations
//! and a polling wait helper.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use conveyor_core::config::SubsystemSwitches;
use conveyor_core::error::{PipelineError, Result};
use conveyor_core::executor::{Exec, Outcome};
use conveyor_core::lock::{DistributedLock, MemoryLock};
use conveyor_core::notif::Notify;
use conveyor_core::persistent::Persistenter;
use conveyor_core::registry::SubsystemContext;
use conveyor_core::retry::RetryPolicy;
use conveyor_core::reward::Rewarded;
use conveyor_core::running::RunningMap;
use conveyor_core::sentinel::{MemoryStateStore, StateRow};

/// Precondition state of test orders.
pub const WAIT: &str = "WaitPayment";
/// Intermediate state set by the check-state scanner.
pub const CHECK: &str = "CheckPayment";
/// Final state committed by the persistent stage.
pub const PAID: &str = "Paid";

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Retry policy short enough for tests.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        delay: Duration::from_millis(20),
        multiplier: 1,
        max_delay: Duration::from_millis(100),
        max_attempts: Some(5),
        max_pending: 100,
    }
}

/// Context over a fresh in-memory lock and running map.
pub fn context(enabled: &[&str]) -> SubsystemContext {
    context_with_lock(enabled, Arc::new(MemoryLock::new()))
}

pub fn context_with_lock(enabled: &[&str], lock: Arc<dyn DistributedLock>) -> SubsystemContext {
    SubsystemContext {
        token: CancellationToken::new(),
        running: RunningMap::new(),
        lock,
        switches: SubsystemSwitches::new(enabled.iter().copied()),
        lock_prefix: "test".into(),
        lock_ttl: None,
        retry: fast_retry(),
        channel_capacity: 1,
    }
}

/// Store seeded with `ids` in the precondition state.
pub fn seeded_store(ids: &[&str]) -> MemoryStateStore {
    let store = MemoryStateStore::new();
    for id in ids {
        store.insert(*id, WAIT, json!({ "amount": 100 }));
    }
    store
}

/// Result produced by [`OrderExec`].
#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    pub id: String,
    pub amount: i64,
}

/// Shared, cloneable call log.
#[derive(Debug, Clone, Default)]
pub struct Recorder<T> {
    calls: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, value: T) {
        self.calls.lock().unwrap().push(value);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.calls.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// Exec that settles every order, failing the ids in `fail`.
#[derive(Clone)]
pub struct OrderExec {
    pub seen: Recorder<String>,
    pub fail: Vec<String>,
    pub delay: Duration,
}

impl OrderExec {
    pub fn new() -> Self {
        Self {
            seen: Recorder::new(),
            fail: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.fail.push(id.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Exec<StateRow, Settled> for OrderExec {
    async fn exec(&self, row: StateRow) -> Outcome<StateRow, Settled> {
        self.seen.push(row.id.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let amount = row.payload.get("amount").and_then(Value::as_i64).unwrap_or(0);
        let settled = Settled { id: row.id.clone(), amount };
        if self.fail.contains(&row.id) {
            return Outcome::Failed(settled, PipelineError::Service("payment rpc unavailable".into()));
        }
        Outcome::Persist(settled)
    }
}

/// Persistenter moving rows from the check state to `Paid`.
#[derive(Clone)]
pub struct PayPersistenter {
    pub store: MemoryStateStore,
    pub committed: Recorder<String>,
}

impl PayPersistenter {
    pub fn new(store: MemoryStateStore) -> Self {
        Self {
            store,
            committed: Recorder::new(),
        }
    }
}

#[async_trait]
impl Persistenter<Settled> for PayPersistenter {
    async fn update(&self, result: &Settled) -> Result<()> {
        self.store.set_state(&result.id, PAID)?;
        self.committed.push(result.id.clone());
        Ok(())
    }
}

/// Notify that records every id and fails the first `failures` calls.
#[derive(Clone)]
pub struct RecordingNotify {
    pub sent: Recorder<String>,
    pub attempts: Recorder<String>,
    failures: Arc<Mutex<usize>>,
}

impl RecordingNotify {
    pub fn new() -> Self {
        Self::flaky(0)
    }

    pub fn flaky(failures: usize) -> Self {
        Self {
            sent: Recorder::new(),
            attempts: Recorder::new(),
            failures: Arc::new(Mutex::new(failures)),
        }
    }
}

#[async_trait]
impl Notify<Settled> for RecordingNotify {
    async fn notify(&self, result: &Settled) -> Result<()> {
        self.attempts.push(result.id.clone());
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(PipelineError::Service("notification gateway down".into()));
            }
        }
        self.sent.push(result.id.clone());
        Ok(())
    }
}

/// Rewarded that records every id.
#[derive(Clone)]
pub struct RecordingReward {
    pub rewarded: Recorder<String>,
}

impl RecordingReward {
    pub fn new() -> Self {
        Self {
            rewarded: Recorder::new(),
        }
    }
}

#[async_trait]
impl Rewarded<Settled> for RecordingReward {
    async fn update(&self, result: &Settled) -> Result<()> {
        self.rewarded.push(result.id.clone());
        Ok(())
    }
}
