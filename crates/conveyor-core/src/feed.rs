// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel send primitives that respect subsystem cancellation.
//!
//! Every cross-stage hop goes through one of these two functions so that no
//! sender is left blocked on a channel whose receiver has stopped.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};

/// Send `item` into `tx`, giving up when `token` is cancelled.
///
/// Cancellation wins over a ready channel. A closed channel is treated the
/// same as cancellation: the receiving stage is gone, so the item is dropped.
pub async fn cancelable_feed<T>(
    token: &CancellationToken,
    tx: &mpsc::Sender<T>,
    item: T,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(PipelineError::Cancelled),
        res = tx.send(item) => res.map_err(|_| PipelineError::Cancelled),
    }
}

/// Perform [`cancelable_feed`] on a spawned task and return immediately.
///
/// Stages use this to emit back into the dispatch loop while the dispatch
/// loop may itself be blocked feeding that stage.
pub fn async_feed<T>(token: CancellationToken, tx: mpsc::Sender<T>, item: T) -> JoinHandle<()>
where
    T: Send + 'static,
{
    tokio::spawn(async move {
        let _ = cancelable_feed(&token, &tx, item).await;
    })
}
