// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor pool: computes the result for each admitted entity.
//!
//! Every worker pulls from one shared input channel, runs the subsystem
//! [`Exec`] and routes its [`Outcome`] back to the dispatch loop. Each
//! outcome maps to exactly one downstream path, so an admitted entity always
//! ends in a `Done` that releases its in-flight entry.
//!
//! A panic inside `exec` is caught. The entity is released directly on the
//! running guard and the subsystem close token is cancelled, which shuts
//! down this subsystem only. A call still running when the executor stop
//! token fires is dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::PipelineError;
use crate::feed::async_feed;
use crate::message::{Message, Tracked};
use crate::retry::{RetryDecision, RetryQueue};
use crate::running::RunningGuard;
use crate::watch::{Watched, watch};

/// What an [`Exec`] decided for one entity.
#[derive(Debug)]
pub enum Outcome<E, R> {
    /// State changed; commit `R` in the persistent stage.
    Persist(R),
    /// Execution failed without a state change; notify with `R` and release.
    Failed(R, PipelineError),
    /// Nothing to do this time; release.
    Unchanged,
    /// Release now and feed the entity again after the retry delay.
    Requeue(E),
}

/// Subsystem business logic for one entity.
#[async_trait]
pub trait Exec<E: Send + 'static, R: Send + 'static>: Send + Sync {
    async fn exec(&self, entity: E) -> Outcome<E, R>;
}

/// Shared state of all workers of one subsystem.
pub(crate) struct ExecutorShared<E: Send + 'static, R: Send + 'static> {
    pub subsystem: String,
    pub exec: Arc<dyn Exec<E, R>>,
    pub input: Arc<Mutex<mpsc::Receiver<Tracked<E>>>>,
    /// Dispatch loop inbox.
    pub inbox: mpsc::Sender<Message<E, R>>,
    /// Sentinel feed channel, target of requeued entities.
    pub refeed: mpsc::Sender<E>,
    pub retry: RetryQueue,
    pub guard: RunningGuard,
    /// Subsystem close token; cancelled on panic.
    pub close: CancellationToken,
}

impl<E: Send + 'static, R: Send + 'static> Clone for ExecutorShared<E, R> {
    fn clone(&self) -> Self {
        Self {
            subsystem: self.subsystem.clone(),
            exec: Arc::clone(&self.exec),
            input: Arc::clone(&self.input),
            inbox: self.inbox.clone(),
            refeed: self.refeed.clone(),
            retry: self.retry.clone(),
            guard: self.guard.clone(),
            close: self.close.clone(),
        }
    }
}

/// One executor worker.
pub(crate) struct Executor<E: Send + 'static, R: Send + 'static> {
    index: usize,
    shared: ExecutorShared<E, R>,
    stop: CancellationToken,
}

impl<E: Send + 'static, R: Send + 'static> Executor<E, R> {
    pub(crate) fn new(index: usize, shared: ExecutorShared<E, R>, stop: CancellationToken) -> Self {
        Self {
            index,
            shared,
            stop,
        }
    }

    pub(crate) async fn run(self) {
        debug!(subsystem = %self.shared.subsystem, worker = self.index, "Executor started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => None,
                item = async { self.shared.input.lock().await.recv().await } => item,
            };
            let Some(Tracked { object_id, item }) = next else {
                break;
            };

            match watch(&self.stop, self.shared.exec.exec(item)).await {
                Watched::Completed(outcome) => self.route(object_id, outcome),
                // Finalization releases whatever is still in flight.
                Watched::Stopped => break,
                Watched::Panicked(panic) => {
                    error!(
                        subsystem = %self.shared.subsystem,
                        object_id = %object_id,
                        worker = self.index,
                        panic = %panic,
                        "Executor panicked, closing subsystem"
                    );
                    // The close token drops pending feeds, so release here.
                    self.shared.guard.release(&object_id);
                    self.shared.close.cancel();
                    break;
                }
            }
        }

        debug!(subsystem = %self.shared.subsystem, worker = self.index, "Executor stopped");
    }

    fn route(&self, object_id: String, outcome: Outcome<E, R>) {
        let requeue_key = requeue_key(&object_id);
        if !matches!(outcome, Outcome::Requeue(_)) {
            self.shared.retry.reset(&requeue_key);
        }

        match outcome {
            Outcome::Persist(result) => {
                self.emit(Message::Persist(Tracked::new(object_id, result)));
            }
            Outcome::Failed(result, e) => {
                warn!(
                    subsystem = %self.shared.subsystem,
                    object_id = %object_id,
                    error = %e,
                    "Exec failed"
                );
                self.emit(Message::Notif(Tracked::new(object_id.clone(), result)));
                self.emit(Message::Done(object_id));
            }
            Outcome::Unchanged => {
                self.emit(Message::Done(object_id));
            }
            Outcome::Requeue(entity) => {
                self.emit(Message::Done(object_id));
                let decision = self.shared.retry.schedule(requeue_key, entity, &self.shared.refeed);
                if !matches!(decision, RetryDecision::Scheduled(_)) {
                    debug!(
                        subsystem = %self.shared.subsystem,
                        decision = ?decision,
                        "Requeue not scheduled"
                    );
                }
            }
        }
    }

    fn emit(&self, msg: Message<E, R>) {
        async_feed(self.shared.close.clone(), self.shared.inbox.clone(), msg);
    }
}

fn requeue_key(object_id: &str) -> String {
    format!("requeue:{object_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::running::RunningMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Parity {
        requeued_98: AtomicBool,
    }

    #[async_trait]
    impl Exec<u32, String> for Parity {
        async fn exec(&self, n: u32) -> Outcome<u32, String> {
            match n {
                0 => Outcome::Unchanged,
                13 => panic!("unlucky"),
                98 if !self.requeued_98.swap(true, Ordering::SeqCst) => Outcome::Requeue(n),
                99 => Outcome::Requeue(n),
                500 => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Outcome::Unchanged
                }
                n if n % 2 == 0 => Outcome::Persist(format!("even {n}")),
                n => Outcome::Failed(format!("odd {n}"), PipelineError::Data("odd".into())),
            }
        }
    }

    struct Fixture {
        input: mpsc::Sender<Tracked<u32>>,
        inbox: mpsc::Receiver<Message<u32, String>>,
        refeed: mpsc::Receiver<u32>,
        running: RunningMap,
        retry: RetryQueue,
        close: CancellationToken,
        stop: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start() -> Fixture {
        let (input_tx, input_rx) = mpsc::channel(1);
        let (inbox_tx, inbox) = mpsc::channel(8);
        let (refeed_tx, refeed) = mpsc::channel(1);
        let close = CancellationToken::new();
        let stop = close.child_token();
        let policy = RetryPolicy {
            delay: Duration::from_millis(10),
            ..Default::default()
        };
        let running = RunningMap::new();
        let retry = RetryQueue::new("test", policy, close.clone());
        let shared = ExecutorShared {
            subsystem: "test".into(),
            exec: Arc::new(Parity::default()),
            input: Arc::new(Mutex::new(input_rx)),
            inbox: inbox_tx,
            refeed: refeed_tx,
            retry: retry.clone(),
            guard: running.guard("test", None),
            close: close.clone(),
        };
        let handle = tokio::spawn(Executor::new(0, shared, stop.clone()).run());
        Fixture {
            input: input_tx,
            inbox,
            refeed,
            running,
            retry,
            close,
            stop,
            handle,
        }
    }

    async fn recv_kinds(inbox: &mut mpsc::Receiver<Message<u32, String>>, n: usize) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        for _ in 0..n {
            let msg = tokio::time::timeout(Duration::from_secs(1), inbox.recv())
                .await
                .unwrap()
                .unwrap();
            kinds.push(msg.kind());
        }
        kinds.sort();
        kinds
    }

    #[tokio::test]
    async fn test_outcomes_are_routed() {
        let mut fx = start();

        fx.input.send(Tracked::new("2", 2)).await.unwrap();
        assert_eq!(recv_kinds(&mut fx.inbox, 1).await, vec!["persist"]);

        fx.input.send(Tracked::new("3", 3)).await.unwrap();
        assert_eq!(recv_kinds(&mut fx.inbox, 2).await, vec!["done", "notif"]);

        fx.input.send(Tracked::new("0", 0)).await.unwrap();
        assert_eq!(recv_kinds(&mut fx.inbox, 1).await, vec!["done"]);

        fx.stop.cancel();
        fx.handle.await.unwrap();
        assert!(!fx.close.is_cancelled());
    }

    #[tokio::test]
    async fn test_requeue_releases_then_refeeds() {
        let mut fx = start();

        fx.input.send(Tracked::new("99", 99)).await.unwrap();
        assert_eq!(recv_kinds(&mut fx.inbox, 1).await, vec!["done"]);
        let refed = tokio::time::timeout(Duration::from_secs(1), fx.refeed.recv())
            .await
            .unwrap();
        assert_eq!(refed, Some(99));
    }

    #[tokio::test]
    async fn test_panic_releases_and_closes_subsystem() {
        let fx = start();
        let guard = fx.running.guard("test", None);
        guard.admit("13");

        fx.input.send(Tracked::new("13", 13)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), fx.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(fx.close.is_cancelled());
        assert!(!fx.running.contains("13"));
    }

    #[tokio::test]
    async fn test_requeue_attempts_reset_once_routed_elsewhere() {
        let mut fx = start();

        fx.input.send(Tracked::new("98", 98)).await.unwrap();
        assert_eq!(recv_kinds(&mut fx.inbox, 1).await, vec!["done"]);
        assert_eq!(fx.retry.attempts("requeue:98"), 1);

        let refed = tokio::time::timeout(Duration::from_secs(1), fx.refeed.recv())
            .await
            .unwrap()
            .unwrap();
        fx.input.send(Tracked::new("98", refed)).await.unwrap();
        assert_eq!(recv_kinds(&mut fx.inbox, 1).await, vec!["persist"]);
        assert_eq!(fx.retry.attempts("requeue:98"), 0);
    }

    #[tokio::test]
    async fn test_stop_abandons_running_exec() {
        let fx = start();

        fx.input.send(Tracked::new("500", 500)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.stop.cancel();

        tokio::time::timeout(Duration::from_secs(1), fx.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!fx.close.is_cancelled());
    }
}
