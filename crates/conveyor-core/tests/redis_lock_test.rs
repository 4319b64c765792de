// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis lock backend tests.
//!
//! Run with a Redis instance:
//! ```bash
//! TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -p conveyor-core --test redis_lock_test
//! ```

use std::time::Duration;

use conveyor_core::lock::{DistributedLock, RedisLock};
use uuid::Uuid;

macro_rules! skip_if_no_redis {
    () => {
        if std::env::var("TEST_REDIS_URL").is_err() {
            eprintln!("Skipping test: TEST_REDIS_URL not set");
            return;
        }
    };
}

async fn connect() -> RedisLock {
    let url = std::env::var("TEST_REDIS_URL").expect("TEST_REDIS_URL");
    RedisLock::connect(&url).await.expect("connect to redis")
}

fn unique_key() -> String {
    format!("conveyor-test:{}", Uuid::new_v4())
}

#[tokio::test]
async fn test_lock_is_exclusive_until_unlocked() {
    skip_if_no_redis!();
    let lock = connect().await;
    let key = unique_key();

    let lease = lock.try_lock(&key, None).await.unwrap().expect("first lock");
    assert!(lock.try_lock(&key, None).await.unwrap().is_none());

    assert!(lock.unlock(&lease).await.unwrap());
    assert!(!lock.unlock(&lease).await.unwrap());

    let again = lock.try_lock(&key, None).await.unwrap().expect("lock after release");
    lock.unlock(&again).await.unwrap();
}

#[tokio::test]
async fn test_stale_lease_cannot_unlock_or_renew_new_owner() {
    skip_if_no_redis!();
    let lock = connect().await;
    let key = unique_key();
    let ttl = Some(Duration::from_millis(100));

    let stale = lock.try_lock(&key, ttl).await.unwrap().expect("first lock");
    tokio::time::sleep(Duration::from_millis(250)).await;

    let owner = lock.try_lock(&key, ttl).await.unwrap().expect("lock after expiry");
    assert!(!lock.renew(&stale).await.unwrap());
    assert!(!lock.unlock(&stale).await.unwrap());

    assert!(lock.renew(&owner).await.unwrap());
    assert!(lock.unlock(&owner).await.unwrap());
}
