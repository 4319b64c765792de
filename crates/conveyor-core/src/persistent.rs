// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistent stage: the single writer of authoritative state transitions.
//!
//! A failed update is logged and the object released. Nothing is retried
//! here: the durable state did not move, so the next scan picks the object
//! up again.
//!
//! A panicking [`Persistenter`] releases its object and closes the subsystem.

use std::ops::ControlFlow;
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

/// Commits an executor result to the durable store.
#[async_trait]
pub trait Persistenter<R: Send + Sync + 'static>: Send + Sync {
    async fn update(&self, result: &R) -> Result<()>;
}

/// Where a committed result goes next.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PersistentRoutes {
    pub reward: bool,
    pub notif: bool,
}

pub(crate) struct PersistentStage<E: Send + 'static, R: Send + Sync + 'static> {
    subsystem: String,
    persistenter: Arc<dyn Persistenter<R>>,
    input: mpsc::Receiver<Tracked<R>>,
    inbox: mpsc::Sender<Message<E, R>>,
    routes: PersistentRoutes,
    guard: RunningGuard,
    close: CancellationToken,
    stop: CancellationToken,
}

impl<E: Send + 'static, R: Send + Sync + 'static> PersistentStage<E, R> {
    pub(crate) fn new(
        subsystem: String,
        persistenter: Arc<dyn Persistenter<R>>,
        input: mpsc::Receiver<Tracked<R>>,
        inbox: mpsc::Sender<Message<E, R>>,
        routes: PersistentRoutes,
        guard: RunningGuard,
        close: CancellationToken,
        stop: CancellationToken,
    ) -> Self {
        Self {
            subsystem,
            persistenter,
            input,
            inbox,
            routes,
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
            if self.handle(tracked).await.is_break() {
                break;
            }
        }
        debug!(subsystem = %self.subsystem, "Persistent stage stopped");
    }

    async fn handle(&self, tracked: Tracked<R>) -> ControlFlow<()> {
        let update = watch(&self.stop, self.persistenter.update(&tracked.item)).await;
        match update {
            Watched::Completed(Ok(())) => {}
            Watched::Completed(Err(e)) => {
                error!(
                    subsystem = %self.subsystem,
                    object_id = %tracked.object_id,
                    error = %e,
                    transient = e.is_transient(),
                    "Persistent update failed"
                );
                self.emit(Message::Done(tracked.object_id));
                return ControlFlow::Continue(());
            }
            Watched::Stopped => return ControlFlow::Break(()),
            Watched::Panicked(panic) => {
                error!(
                    subsystem = %self.subsystem,
                    object_id = %tracked.object_id,
                    panic = %panic,
                    "Persistenter panicked, closing subsystem"
                );
                self.guard.release(&tracked.object_id);
                self.close.cancel();
                return ControlFlow::Break(());
            }
        }

        if self.routes.reward {
            self.emit(Message::Reward(tracked));
            return ControlFlow::Continue(());
        }

        let object_id = tracked.object_id.clone();
        if self.routes.notif {
            self.emit(Message::Notif(tracked));
        }
        self.emit(Message::Done(object_id));
        ControlFlow::Continue(())
    }

    fn emit(&self, msg: Message<E, R>) {
        async_feed(self.close.clone(), self.inbox.clone(), msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::running::RunningMap;
    use std::time::Duration;

    struct RejectOdd;

    #[async_trait]
    impl Persistenter<u32> for RejectOdd {
        async fn update(&self, n: &u32) -> Result<()> {
            if *n == 13 {
                panic!("constraint check crashed");
            }
            if n % 2 == 1 {
                return Err(PipelineError::Store("conflict".into()));
            }
            Ok(())
        }
    }

    async fn run_one(n: u32, routes: PersistentRoutes) -> Vec<&'static str> {
        let (input_tx, input_rx) = mpsc::channel(1);
        let (inbox_tx, mut inbox) = mpsc::channel::<Message<(), u32>>(8);
        let close = CancellationToken::new();
        let stage = PersistentStage::new(
            "test".into(),
            Arc::new(RejectOdd),
            input_rx,
            inbox_tx,
            routes,
            RunningMap::new().guard("test", None),
            close.clone(),
            close.child_token(),
        );
        let handle = tokio::spawn(stage.run());

        input_tx.send(Tracked::new(n.to_string(), n)).await.unwrap();
        drop(input_tx);
        handle.await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(50), inbox.recv()).await {
            kinds.push(msg.kind());
        }
        kinds.sort();
        kinds
    }

    #[tokio::test]
    async fn test_success_routes_to_reward() {
        let routes = PersistentRoutes { reward: true, notif: true };
        assert_eq!(run_one(2, routes).await, vec!["reward"]);
    }

    #[tokio::test]
    async fn test_success_without_reward_notifies_and_releases() {
        let routes = PersistentRoutes { reward: false, notif: true };
        assert_eq!(run_one(2, routes).await, vec!["done", "notif"]);

        let routes = PersistentRoutes { reward: false, notif: false };
        assert_eq!(run_one(2, routes).await, vec!["done"]);
    }

    #[tokio::test]
    async fn test_failure_only_releases() {
        let routes = PersistentRoutes { reward: true, notif: true };
        assert_eq!(run_one(3, routes).await, vec!["done"]);
    }

    #[tokio::test]
    async fn test_panic_releases_and_closes_subsystem() {
        let (input_tx, input_rx) = mpsc::channel(1);
        let (inbox_tx, _inbox) = mpsc::channel::<Message<(), u32>>(8);
        let close = CancellationToken::new();
        let running = RunningMap::new();
        let guard = running.guard("test", None);
        guard.admit("13");

        let stage = PersistentStage::new(
            "test".into(),
            Arc::new(RejectOdd),
            input_rx,
            inbox_tx,
            PersistentRoutes { reward: false, notif: false },
            guard,
            close.clone(),
            close.child_token(),
        );
        let handle = tokio::spawn(stage.run());

        input_tx.send(Tracked::new("13", 13)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(close.is_cancelled());
        assert!(!running.contains("13"));
    }
}
