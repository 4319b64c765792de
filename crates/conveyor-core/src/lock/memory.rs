// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local lock backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{DistributedLock, LockLease, owner_token};
use crate::error::Result;

#[derive(Debug)]
struct Held {
    token: String,
    expires_at: Option<Instant>,
}

impl Held {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory lock with expiry. Cloning shares the lock table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    held: Arc<DashMap<String, Held>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held and not expired.
    pub fn is_locked(&self, key: &str) -> bool {
        self.held.get(key).is_some_and(|h| !h.expired())
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_lock(&self, key: &str, ttl: Option<Duration>) -> Result<Option<LockLease>> {
        let token = owner_token();
        let held = Held {
            token: token.clone(),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        match self.held.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().expired() {
                    return Ok(None);
                }
                occupied.insert(held);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(held);
            }
        }
        Ok(Some(LockLease {
            key: key.to_string(),
            token,
            ttl,
        }))
    }

    async fn unlock(&self, lease: &LockLease) -> Result<bool> {
        Ok(self
            .held
            .remove_if(&lease.key, |_, h| h.token == lease.token)
            .is_some())
    }

    async fn renew(&self, lease: &LockLease) -> Result<bool> {
        match self.held.get_mut(&lease.key) {
            Some(mut h) if h.token == lease.token && !h.expired() => {
                h.expires_at = lease.ttl.map(|t| Instant::now() + t);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
