// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delayed re-injection of items into a pipeline channel.
//!
//! The queue is keyed by a caller-chosen string (usually `"{stage}:{object_id}"`).
//! A key that is already waiting is not scheduled twice, and every key carries
//! an attempt counter that bounds how often it can be retried before the item
//! is dropped. Timers are tasks gated on the subsystem token, so nothing is
//! re-injected after the subsystem starts shutting down.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::feed::cancelable_feed;

/// Retry timing and bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub delay: Duration,
    /// Growth factor applied per attempt. `1` keeps the delay fixed.
    pub multiplier: u32,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Attempts allowed per key before the item is dropped. `None` is unbounded.
    pub max_attempts: Option<u32>,
    /// Maximum number of items waiting at once.
    pub max_pending: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(60),
            multiplier: 1,
            max_delay: Duration::from_secs(3600),
            max_attempts: Some(10),
            max_pending: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exp);
        self.delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What [`RetryQueue::schedule`] did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The item will be re-injected after the given delay.
    Scheduled(Duration),
    /// The key is already waiting; the item was dropped.
    Duplicate,
    /// The key ran out of attempts; the item was dropped and the counter cleared.
    Exhausted,
    /// Too many items are waiting; the item was dropped.
    Overflow,
    /// The subsystem is shutting down; the item was dropped.
    Cancelled,
}

struct RetryInner {
    subsystem: String,
    policy: RetryPolicy,
    token: CancellationToken,
    pending: DashMap<String, ()>,
    attempts: DashMap<String, u32>,
}

/// Per-subsystem retry queue. Cloning shares the queue.
#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<RetryInner>,
}

impl RetryQueue {
    /// Create a queue whose timers stop when `token` is cancelled.
    pub fn new(subsystem: impl Into<String>, policy: RetryPolicy, token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RetryInner {
                subsystem: subsystem.into(),
                policy,
                token,
                pending: DashMap::new(),
                attempts: DashMap::new(),
            }),
        }
    }

    /// Schedule `item` to be sent into `tx` once the policy delay elapses.
    pub fn schedule<T>(&self, key: impl Into<String>, item: T, tx: &mpsc::Sender<T>) -> RetryDecision
    where
        T: Send + 'static,
    {
        let key = key.into();
        let inner = &self.inner;

        if inner.token.is_cancelled() {
            return RetryDecision::Cancelled;
        }
        if inner.pending.contains_key(&key) {
            return RetryDecision::Duplicate;
        }
        if inner.pending.len() >= inner.policy.max_pending {
            warn!(
                subsystem = %inner.subsystem,
                key = %key,
                max_pending = inner.policy.max_pending,
                "Retry queue full, dropping item"
            );
            return RetryDecision::Overflow;
        }

        let attempt = {
            let mut count = inner.attempts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some(max) = inner.policy.max_attempts.filter(|max| attempt > *max) {
            inner.attempts.remove(&key);
            warn!(
                subsystem = %inner.subsystem,
                key = %key,
                max_attempts = max,
                "Retry attempts exhausted, dropping item"
            );
            return RetryDecision::Exhausted;
        }

        if inner.pending.insert(key.clone(), ()).is_some() {
            return RetryDecision::Duplicate;
        }

        let delay = inner.policy.delay_for(attempt);
        debug!(
            subsystem = %inner.subsystem,
            key = %key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );

        let inner = Arc::clone(&self.inner);
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = inner.token.cancelled() => {
                    inner.pending.remove(&key);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            inner.pending.remove(&key);
            if cancelable_feed(&inner.token, &tx, item).await.is_err() {
                debug!(subsystem = %inner.subsystem, key = %key, "Retry abandoned on shutdown");
            }
        });

        RetryDecision::Scheduled(delay)
    }

    /// Clear the attempt counter for `key` after it finally succeeded.
    pub fn reset(&self, key: &str) {
        self.inner.attempts.remove(key);
    }

    /// Attempts recorded so far for `key`.
    pub fn attempts(&self, key: &str) -> u32 {
        self.inner.attempts.get(key).map(|a| *a).unwrap_or(0)
    }

    /// Number of items currently waiting.
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    /// The policy this queue was built with.
    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("subsystem", &self.inner.subsystem)
            .field("policy", &self.inner.policy)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}
