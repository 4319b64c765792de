// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reward stage: fire-and-forget side effects after a committed transition.
//!
//! A panicking [`Rewarded`] releases its object and closes the subsystem.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::Result;
use crate::feed::async_feed;
use crate::message::{Message, Tracked};
use crate::running::RunningGuard;
use crate::watch::{Watched, watch};

/// Applies the reward side effect for a committed result.
#[async_trait]
pub trait Rewarded<R: Send + Sync + 'static>: Send + Sync {
    async fn update(&self, result: &R) -> Result<()>;
}

pub(crate) struct RewardStage<E: Send + 'static, R: Send + Sync + 'static> {
    subsystem: String,
    rewarded: Arc<dyn Rewarded<R>>,
    input: mpsc::Receiver<Tracked<R>>,
    inbox: mpsc::Sender<Message<E, R>>,
    notif: bool,
    guard: RunningGuard,
    close: CancellationToken,
    stop: CancellationToken,
}

impl<E: Send + 'static, R: Send + Sync + 'static> RewardStage<E, R> {
    pub(crate) fn new(
        subsystem: String,
        rewarded: Arc<dyn Rewarded<R>>,
        input: mpsc::Receiver<Tracked<R>>,
        inbox: mpsc::Sender<Message<E, R>>,
        notif: bool,
        guard: RunningGuard,
        close: CancellationToken,
        stop: CancellationToken,
    ) -> Self {
        Self {
            subsystem,
            rewarded,
            input,
            inbox,
            notif,
            guard,
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

            // Rewards are best effort; the transition is already committed.
            let update = watch(&self.stop, self.rewarded.update(&tracked.item)).await;
            match update {
                Watched::Completed(Ok(())) => {}
                Watched::Completed(Err(e)) => {
                    error!(
                        subsystem = %self.subsystem,
                        object_id = %tracked.object_id,
                        error = %e,
                        "Reward update failed"
                    );
                }
                Watched::Stopped => break,
                Watched::Panicked(panic) => {
                    error!(
                        subsystem = %self.subsystem,
                        object_id = %tracked.object_id,
                        panic = %panic,
                        "Rewarded panicked, closing subsystem"
                    );
                    self.guard.release(&tracked.object_id);
                    self.close.cancel();
                    break;
                }
            }

            let object_id = tracked.object_id.clone();
            if self.notif {
                async_feed(self.close.clone(), self.inbox.clone(), Message::Notif(tracked));
            }
            async_feed(self.close.clone(), self.inbox.clone(), Message::Done(object_id));
        }
        debug!(subsystem = %self.subsystem, "Reward stage stopped");
    }
}
