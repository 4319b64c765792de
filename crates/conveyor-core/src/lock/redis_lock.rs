// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis lock backend.
//!
//! Acquisition is a single `SET key token NX [PX ttl]`. Release and renewal
//! run as Lua scripts that compare the stored token first, so a process that
//! lost its lease can never delete or extend somebody else's.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::{DistributedLock, LockLease, owner_token};
use crate::error::Result;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Lock backed by a Redis connection manager.
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    /// Connect to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(&self, key: &str, ttl: Option<Duration>) -> Result<Option<LockLease>> {
        let token = owner_token();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(&token).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }

        let mut conn = self.conn.clone();
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        if reply.is_none() {
            debug!(key = %key, "Lock held elsewhere");
            return Ok(None);
        }
        Ok(Some(LockLease {
            key: key.to_string(),
            token,
            ttl,
        }))
    }

    async fn unlock(&self, lease: &LockLease) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn renew(&self, lease: &LockLease) -> Result<bool> {
        // A lease without TTL never expires, there is nothing to extend.
        let Some(ttl) = lease.ttl else {
            return Ok(true);
        };
        let mut conn = self.conn.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }
}
