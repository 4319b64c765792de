// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Guarded calls into subsystem code.
//!
//! Every stage runs its user call ([`Scanner`], [`Exec`], [`Persistenter`],
//! [`Notify`], [`Rewarded`]) through [`watch`]. The call is abandoned when
//! the stage stop token fires, and a panic is caught and reported instead
//! of unwinding the stage task.
//!
//! [`Scanner`]: crate::sentinel::Scanner
//! [`Exec`]: crate::executor::Exec
//! [`Persistenter`]: crate::persistent::Persistenter
//! [`Notify`]: crate::notif::Notify
//! [`Rewarded`]: crate::reward::Rewarded

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

/// How a watched call ended.
#[derive(Debug)]
pub(crate) enum Watched<T> {
    Completed(T),
    /// The stop token fired first; the call was dropped.
    Stopped,
    /// The call panicked; carries the panic message.
    Panicked(String),
}

/// Run `fut` until it completes, panics, or `stop` is cancelled.
pub(crate) async fn watch<F: Future>(stop: &CancellationToken, fut: F) -> Watched<F::Output> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => Watched::Stopped,
        res = AssertUnwindSafe(fut).catch_unwind() => match res {
            Ok(output) => Watched::Completed(output),
            Err(panic) => Watched::Panicked(panic_message(&*panic)),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
