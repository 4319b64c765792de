// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notif stage: delivers notifications for finished objects.
//!
//! A failed delivery goes back on the retry queue under `notif:{object_id}`
//! and re-enters this stage through the dispatch loop once the delay passes.
//! A panicking [`Notify`] closes the subsystem.

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::message::{Message, Tracked};
use crate::retry::{RetryDecision, RetryQueue};
use crate::watch::{Watched, watch};

/// Sends the notification for a result.
#[async_trait]
pub trait Notify<R: Send + Sync + 'static>: Send + Sync {
    async fn notify(&self, result: &R) -> Result<()>;
}

pub(crate) fn retry_key(object_id: &str) -> String {
    format!("notif:{object_id}")
}

pub(crate) struct NotifStage<E: Send + 'static, R: Send + Sync + 'static> {
    subsystem: String,
    notify: Arc<dyn Notify<R>>,
    input: mpsc::Receiver<Tracked<R>>,
    inbox: mpsc::Sender<Message<E, R>>,
    retry: RetryQueue,
    close: CancellationToken,
    stop: CancellationToken,
}

impl<E: Send + 'static, R: Send + Sync + 'static> NotifStage<E, R> {
    pub(crate) fn new(
        subsystem: String,
        notify: Arc<dyn Notify<R>>,
        input: mpsc::Receiver<Tracked<R>>,
        inbox: mpsc::Sender<Message<E, R>>,
        retry: RetryQueue,
        close: CancellationToken,
        stop: CancellationToken,
    ) -> Self {
        Self {
            subsystem,
            notify,
            input,
            inbox,
            retry,
            close,
            stop,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let tracked = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                tracked = self.input.recv() => match tracked {
                    Some(tracked) => tracked,
                    None => break,
                },
            };
            if self.handle(tracked).await.is_break() {
                break;
            }
        }
        debug!(subsystem = %self.subsystem, "Notif stage stopped");
    }

    async fn handle(&self, tracked: Tracked<R>) -> ControlFlow<()> {
        let key = retry_key(&tracked.object_id);
        let sent = watch(&self.stop, self.notify.notify(&tracked.item)).await;
        match sent {
            Watched::Completed(Ok(())) => self.retry.reset(&key),
            Watched::Stopped => return ControlFlow::Break(()),
            // Notif does not own the in-flight entry; its `Done` is sent separately.
            Watched::Panicked(panic) => {
                error!(
                    subsystem = %self.subsystem,
                    object_id = %tracked.object_id,
                    panic = %panic,
                    "Notify panicked, closing subsystem"
                );
                self.close.cancel();
                return ControlFlow::Break(());
            }
            Watched::Completed(Err(e)) => {
                let object_id = tracked.object_id.clone();
                let decision = self.retry.schedule(key, Message::Notif(tracked), &self.inbox);
                warn!(
                    subsystem = %self.subsystem,
                    object_id = %object_id,
                    error = %e,
                    retry = ?decision,
                    "Notify failed"
                );
                if matches!(decision, RetryDecision::Exhausted) {
                    warn!(
                        subsystem = %self.subsystem,
                        object_id = %object_id,
                        "Notification dropped"
                    );
                }
            }
        }
        ControlFlow::Continue(())
    }
}
