// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advisory subsystem locks.
//!
//! A handler takes the lock keyed `"{prefix}:{subsystem}"` before it starts
//! any stage, so at most one process runs a given subsystem at a time. The
//! lock is advisory: a holder that stops renewing loses it when the TTL runs
//! out, and nothing stops a stale holder from continuing to work.
//!
//! Two backends are provided:
//! - [`MemoryLock`]: process-local, for tests and single-instance deployments
//! - [`RedisLock`]: `SET NX PX` with a per-owner token

mod memory;
mod redis_lock;

pub use memory::MemoryLock;
pub use redis_lock::RedisLock;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Proof of ownership returned by [`DistributedLock::try_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    /// Full lock key.
    pub key: String,
    /// Owner token; release and renewal only succeed with it.
    pub token: String,
    /// Lease duration, `None` when the lock never expires.
    pub ttl: Option<Duration>,
}

/// Advisory lock backend.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take `key` without waiting. Returns `None` when it is held elsewhere.
    async fn try_lock(&self, key: &str, ttl: Option<Duration>) -> Result<Option<LockLease>>;

    /// Release the lease. Returns false when it was no longer ours.
    async fn unlock(&self, lease: &LockLease) -> Result<bool>;

    /// Extend the lease by its TTL. Returns false when it was no longer ours.
    async fn renew(&self, lease: &LockLease) -> Result<bool>;
}

/// Build the lock key for a subsystem.
pub fn lock_key(prefix: &str, subsystem: &str) -> String {
    format!("{prefix}:{subsystem}")
}

/// Fresh owner token.
pub(crate) fn owner_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key("scheduler", "order_paid"), "scheduler:order_paid");
    }

    #[test]
    fn test_owner_tokens_differ() {
        assert_ne!(owner_token(), owner_token());
    }
}
