// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-subsystem orchestrator.
//!
//! A [`Handler`] owns one subsystem's lock, channels and stage tasks, and the
//! single dispatch loop every stage reports back to:
//!
//! ```text
//!   Sentinel ──fed──► dispatch ──► Executor pool ──┐
//!                        ▲                          │
//!                        │  Persist/Notif/Reward/Done (async feed)
//!                        └──────────────────────────┘
//!                        │
//!                        ├──► Persistent ──► Reward
//!                        └──► Notif
//! ```
//!
//! The dispatch loop is the only place that admits objects into, and
//! releases them from, the running map.
//!
//! # Lifecycle
//!
//! `Uninitialized → Locked → Running → Draining → Finalized`
//!
//! [`HandlerBuilder::initialize`] takes the lock and builds everything but
//! spawns nothing. [`Handler::run`] spawns the tasks. [`Handler::finalize`]
//! releases the lock and stops the stages in construction order, awaiting
//! each. A panic in any stage or a lost lock lease cancels the subsystem
//! close token, which runs the same finalization from a supervisor task.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_LOCK_PREFIX, SubsystemSwitches};
use crate::error::{PipelineError, Result};
use crate::executor::{Exec, Executor, ExecutorShared};
use crate::feed::cancelable_feed;
use crate::lock::{DistributedLock, LockLease, lock_key};
use crate::message::{Message, Tracked};
use crate::notif::{NotifStage, Notify};
use crate::persistent::{PersistentRoutes, PersistentStage, Persistenter};
use crate::registry::SubsystemContext;
use crate::retry::{RetryDecision, RetryPolicy, RetryQueue};
use crate::reward::{RewardStage, Rewarded};
use crate::running::{Admission, RunningGuard, RunningMap};
use crate::sentinel::{DEFAULT_SCAN_INTERVAL, Feeder, Scanner, Sentinel};

/// Default number of executor workers.
pub const DEFAULT_EXECUTOR_NUMBER: usize = 1;

/// Handler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Uninitialized,
    /// Lock held, tasks built but not spawned.
    Locked,
    Running,
    /// Finalization in progress.
    Draining,
    Finalized,
}

impl HandlerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Locked => "locked",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Finalized => "finalized",
        }
    }
}

/// Builder for a subsystem [`Handler`].
pub struct HandlerBuilder<E: Send + 'static, R: Send + Sync + 'static> {
    subsystem: String,
    scanner: Option<Arc<dyn Scanner<E>>>,
    scan_interval: Duration,
    exec: Option<Arc<dyn Exec<E, R>>>,
    executor_number: usize,
    persistenter: Option<Arc<dyn Persistenter<R>>>,
    notify: Option<Arc<dyn Notify<R>>>,
    rewarded: Option<Arc<dyn Rewarded<R>>>,
    running: Option<RunningMap>,
    running_concurrent: Option<usize>,
    lock: Option<Arc<dyn DistributedLock>>,
    switches: Option<SubsystemSwitches>,
    lock_prefix: String,
    lock_ttl: Option<Duration>,
    retry_policy: RetryPolicy,
    channel_capacity: usize,
    parent: Option<CancellationToken>,
}

impl<E: Send + 'static, R: Send + Sync + 'static> HandlerBuilder<E, R> {
    pub fn new(subsystem: impl Into<String>) -> Self {
        Self {
            subsystem: subsystem.into(),
            scanner: None,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            exec: None,
            executor_number: DEFAULT_EXECUTOR_NUMBER,
            persistenter: None,
            notify: None,
            rewarded: None,
            running: None,
            running_concurrent: None,
            lock: None,
            switches: None,
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            lock_ttl: None,
            retry_policy: RetryPolicy::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            parent: None,
        }
    }

    /// Take the shared runtime parts (lock, running map, switches, token,
    /// retry policy, channel capacity) from a subsystem context.
    pub fn context(mut self, ctx: &SubsystemContext) -> Self {
        self.running = Some(ctx.running.clone());
        self.lock = Some(Arc::clone(&ctx.lock));
        self.switches = Some(ctx.switches.clone());
        self.lock_prefix = ctx.lock_prefix.clone();
        self.lock_ttl = ctx.lock_ttl;
        self.retry_policy = ctx.retry.clone();
        self.channel_capacity = ctx.channel_capacity;
        self.parent = Some(ctx.token.clone());
        self
    }

    pub fn scanner(mut self, scanner: impl Scanner<E> + 'static) -> Self {
        self.scanner = Some(Arc::new(scanner));
        self
    }

    /// Default: 30 seconds
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn exec(mut self, exec: impl Exec<E, R> + 'static) -> Self {
        self.exec = Some(Arc::new(exec));
        self
    }

    /// Number of executor workers. Default: 1
    pub fn executor_number(mut self, n: usize) -> Self {
        self.executor_number = n.max(1);
        self
    }

    pub fn persistenter(mut self, persistenter: impl Persistenter<R> + 'static) -> Self {
        self.persistenter = Some(Arc::new(persistenter));
        self
    }

    pub fn notify(mut self, notify: impl Notify<R> + 'static) -> Self {
        self.notify = Some(Arc::new(notify));
        self
    }

    pub fn rewarded(mut self, rewarded: impl Rewarded<R> + 'static) -> Self {
        self.rewarded = Some(Arc::new(rewarded));
        self
    }

    pub fn running_map(mut self, running: RunningMap) -> Self {
        self.running = Some(running);
        self
    }

    /// Cap on objects in flight for this subsystem. Default: unbounded
    pub fn running_concurrent(mut self, concurrent: usize) -> Self {
        self.running_concurrent = Some(concurrent);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn switches(mut self, switches: SubsystemSwitches) -> Self {
        self.switches = Some(switches);
        self
    }

    pub fn lock_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lock_prefix = prefix.into();
        self
    }

    /// Lock lease TTL. `None` never expires and is never renewed.
    pub fn lock_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Parent cancellation token; the subsystem token is its child.
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }

    fn missing(&self, component: &'static str) -> PipelineError {
        PipelineError::MissingComponent {
            subsystem: self.subsystem.clone(),
            component,
        }
    }

    /// Take the subsystem lock and build every stage.
    ///
    /// Returns `Ok(None)` when the subsystem is disabled or its lock is held
    /// by another instance. Neither case waits or retries.
    pub async fn initialize(self) -> Result<Option<Handler>> {
        if let Some(switches) = &self.switches
            && !switches.is_enabled(&self.subsystem)
        {
            debug!(subsystem = %self.subsystem, "Subsystem disabled, not initializing");
            return Ok(None);
        }

        let scanner = self.scanner.clone().ok_or_else(|| self.missing("scanner"))?;
        let exec = self.exec.clone().ok_or_else(|| self.missing("exec"))?;
        let running = self.running.clone().ok_or_else(|| self.missing("running map"))?;
        let lock = self.lock.clone().ok_or_else(|| self.missing("lock"))?;

        let key = lock_key(&self.lock_prefix, &self.subsystem);
        let Some(lease) = lock.try_lock(&key, self.lock_ttl).await? else {
            info!(subsystem = %self.subsystem, lock_key = %key, "Subsystem locked elsewhere");
            return Ok(None);
        };

        let subsystem = self.subsystem;
        let capacity = self.channel_capacity;
        let close = self
            .parent
            .map(|p| p.child_token())
            .unwrap_or_default();
        let retry = RetryQueue::new(subsystem.clone(), self.retry_policy, close.clone());
        let guard = running.guard(subsystem.clone(), self.running_concurrent);

        let (fed_tx, fed_rx) = mpsc::channel::<E>(capacity);
        let (inbox_tx, inbox_rx) = mpsc::channel::<Message<E, R>>(capacity);
        let (exec_tx, exec_rx) = mpsc::channel::<Tracked<E>>(capacity);
        let (trigger_tx, trigger_rx) = mpsc::channel::<Value>(1);

        let mut stages = Vec::new();

        // Stop order: lease, sentinel, dispatch, executor, persistent, notif, reward.
        if let Some(ttl) = lease.ttl {
            let stop = close.child_token();
            let fut = renew_lease(
                subsystem.clone(),
                Arc::clone(&lock),
                lease.clone(),
                ttl,
                close.clone(),
                stop.clone(),
            );
            stages.push(StageTask::new("lease", stop, vec![fut.boxed()]));
        }

        let sentinel_stop = close.child_token();
        let sentinel = Sentinel::new(
            subsystem.clone(),
            Arc::clone(&scanner),
            Feeder::new(fed_tx.clone(), sentinel_stop.clone()),
            trigger_rx,
            self.scan_interval,
            close.clone(),
            sentinel_stop.clone(),
        );
        stages.push(StageTask::new("sentinel", sentinel_stop, vec![sentinel.run().boxed()]));

        let persist = self.persistenter.map(|p| (p, mpsc::channel::<Tracked<R>>(capacity)));
        let notif = self.notify.map(|n| (n, mpsc::channel::<Tracked<R>>(capacity)));
        let reward = self.rewarded.map(|r| (r, mpsc::channel::<Tracked<R>>(capacity)));

        let dispatch_stop = close.child_token();
        let dispatcher = Dispatcher {
            subsystem: subsystem.clone(),
            scanner,
            guard: guard.clone(),
            retry: retry.clone(),
            fed_rx,
            refeed: fed_tx.clone(),
            inbox_rx,
            exec_tx,
            persist_tx: persist.as_ref().map(|(_, (tx, _))| tx.clone()),
            notif_tx: notif.as_ref().map(|(_, (tx, _))| tx.clone()),
            reward_tx: reward.as_ref().map(|(_, (tx, _))| tx.clone()),
            stop: dispatch_stop.clone(),
        };
        stages.push(StageTask::new("dispatch", dispatch_stop, vec![dispatcher.run().boxed()]));

        let executor_stop = close.child_token();
        let shared = ExecutorShared {
            subsystem: subsystem.clone(),
            exec,
            input: Arc::new(tokio::sync::Mutex::new(exec_rx)),
            inbox: inbox_tx.clone(),
            refeed: fed_tx,
            retry: retry.clone(),
            guard: guard.clone(),
            close: close.clone(),
        };
        let workers = (0..self.executor_number)
            .map(|index| Executor::new(index, shared.clone(), executor_stop.clone()).run().boxed())
            .collect();
        stages.push(StageTask::new("executor", executor_stop, workers));

        let routes = PersistentRoutes {
            reward: reward.is_some(),
            notif: notif.is_some(),
        };
        if let Some((persistenter, (_, rx))) = persist {
            let stop = close.child_token();
            let stage = PersistentStage::new(
                subsystem.clone(),
                persistenter,
                rx,
                inbox_tx.clone(),
                routes,
                guard.clone(),
                close.clone(),
                stop.clone(),
            );
            stages.push(StageTask::new("persistent", stop, vec![stage.run().boxed()]));
        }

        if let Some((notify, (_, rx))) = notif {
            let stop = close.child_token();
            let stage = NotifStage::new(
                subsystem.clone(),
                notify,
                rx,
                inbox_tx.clone(),
                retry.clone(),
                close.clone(),
                stop.clone(),
            );
            stages.push(StageTask::new("notif", stop, vec![stage.run().boxed()]));
        }

        if let Some((rewarded, (_, rx))) = reward {
            let stop = close.child_token();
            let stage = RewardStage::new(
                subsystem.clone(),
                rewarded,
                rx,
                inbox_tx,
                routes.notif,
                guard.clone(),
                close.clone(),
                stop.clone(),
            );
            stages.push(StageTask::new("reward", stop, vec![stage.run().boxed()]));
        }

        info!(
            subsystem = %subsystem,
            lock_key = %key,
            executors = self.executor_number,
            stages = stages.len(),
            "Subsystem initialized"
        );

        Ok(Some(Handler {
            inner: Arc::new(HandlerInner {
                subsystem,
                state: Mutex::new(HandlerState::Locked),
                stages: Mutex::new(stages),
                close,
                finished: CancellationToken::new(),
                lock,
                lease,
                trigger_tx,
                guard,
            }),
        }))
    }
}

/// One stage: its stop token and its task(s), unspawned until `run`.
struct StageTask {
    name: &'static str,
    stop: CancellationToken,
    pending: Vec<BoxFuture<'static, ()>>,
    handles: Vec<JoinHandle<()>>,
}

impl StageTask {
    fn new(name: &'static str, stop: CancellationToken, pending: Vec<BoxFuture<'static, ()>>) -> Self {
        Self {
            name,
            stop,
            pending,
            handles: Vec::new(),
        }
    }
}

struct HandlerInner {
    subsystem: String,
    state: Mutex<HandlerState>,
    stages: Mutex<Vec<StageTask>>,
    close: CancellationToken,
    finished: CancellationToken,
    lock: Arc<dyn DistributedLock>,
    lease: LockLease,
    trigger_tx: mpsc::Sender<Value>,
    guard: RunningGuard,
}

impl HandlerInner {
    fn state(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn shutdown(&self) {
        let previous = {
            let mut state = self.state();
            let previous = *state;
            if matches!(previous, HandlerState::Locked | HandlerState::Running) {
                *state = HandlerState::Draining;
            }
            previous
        };
        match previous {
            HandlerState::Locked | HandlerState::Running => {}
            HandlerState::Draining => {
                self.finished.cancelled().await;
                return;
            }
            HandlerState::Uninitialized | HandlerState::Finalized => return,
        }

        info!(subsystem = %self.subsystem, "Finalizing subsystem");

        match self.lock.unlock(&self.lease).await {
            Ok(true) => debug!(subsystem = %self.subsystem, "Lock released"),
            Ok(false) => warn!(subsystem = %self.subsystem, "Lock was already lost"),
            Err(e) => warn!(subsystem = %self.subsystem, error = %e, "Failed to release lock"),
        }

        let stages = std::mem::take(&mut *self.stages.lock().unwrap_or_else(|e| e.into_inner()));
        for stage in stages {
            stage.stop.cancel();
            for handle in stage.handles {
                if let Err(e) = handle.await {
                    error!(
                        subsystem = %self.subsystem,
                        stage = stage.name,
                        "Stage task panicked: {}",
                        e
                    );
                }
            }
        }

        let released = self.guard.release_all();
        if released > 0 {
            debug!(subsystem = %self.subsystem, released, "Released in-flight objects");
        }

        self.close.cancel();
        *self.state() = HandlerState::Finalized;
        self.finished.cancel();
        info!(subsystem = %self.subsystem, "Subsystem finalized");
    }
}

/// A locked (and possibly running) subsystem instance.
pub struct Handler {
    inner: Arc<HandlerInner>,
}

impl Handler {
    /// Start a handler builder for `subsystem`.
    pub fn builder<E: Send + 'static, R: Send + Sync + 'static>(
        subsystem: impl Into<String>,
    ) -> HandlerBuilder<E, R> {
        HandlerBuilder::new(subsystem)
    }

    pub fn subsystem(&self) -> &str {
        &self.inner.subsystem
    }

    pub fn state(&self) -> HandlerState {
        *self.inner.state()
    }

    /// Token cancelled when this subsystem closes for any reason.
    pub fn close_token(&self) -> CancellationToken {
        self.inner.close.clone()
    }

    /// Spawn every stage task plus the supervisor.
    pub fn run(&self) -> Result<()> {
        {
            let mut state = self.inner.state();
            if *state != HandlerState::Locked {
                return Err(PipelineError::InvalidState {
                    subsystem: self.inner.subsystem.clone(),
                    expected: HandlerState::Locked.as_str(),
                    actual: state.as_str(),
                });
            }
            *state = HandlerState::Running;
        }

        {
            let mut stages = self.inner.stages.lock().unwrap_or_else(|e| e.into_inner());
            for stage in stages.iter_mut() {
                for fut in stage.pending.drain(..) {
                    stage.handles.push(tokio::spawn(fut));
                }
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.close.cancelled().await;
            inner.shutdown().await;
        });

        info!(subsystem = %self.inner.subsystem, "Subsystem running");
        Ok(())
    }

    /// Ask the sentinel for a trigger scan. Triggers arriving while one is
    /// still pending are coalesced.
    pub fn trigger(&self, cond: Value) -> Result<()> {
        if self.state() != HandlerState::Running {
            return Err(PipelineError::NotRunning(self.inner.subsystem.clone()));
        }
        match self.inner.trigger_tx.try_send(cond) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(subsystem = %self.inner.subsystem, "Trigger already pending");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                Err(PipelineError::NotRunning(self.inner.subsystem.clone()))
            }
        }
    }

    /// Release the lock and stop every stage in order. Idempotent.
    pub async fn finalize(&self) {
        self.inner.shutdown().await;
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("subsystem", &self.inner.subsystem)
            .field("state", &self.state())
            .field("lock_key", &self.inner.lease.key)
            .finish()
    }
}

/// Finalize `handler` if there is one.
pub async fn finalize_handler(handler: Option<Handler>) {
    if let Some(handler) = handler {
        handler.finalize().await;
    }
}

/// The single loop that owns admission and routing for one subsystem.
struct Dispatcher<E: Send + 'static, R: Send + Sync + 'static> {
    subsystem: String,
    scanner: Arc<dyn Scanner<E>>,
    guard: RunningGuard,
    retry: RetryQueue,
    fed_rx: mpsc::Receiver<E>,
    refeed: mpsc::Sender<E>,
    inbox_rx: mpsc::Receiver<Message<E, R>>,
    exec_tx: mpsc::Sender<Tracked<E>>,
    persist_tx: Option<mpsc::Sender<Tracked<R>>>,
    notif_tx: Option<mpsc::Sender<Tracked<R>>>,
    reward_tx: Option<mpsc::Sender<Tracked<R>>>,
    stop: CancellationToken,
}

impl<E: Send + 'static, R: Send + Sync + 'static> Dispatcher<E, R> {
    async fn run(mut self) {
        loop {
            // Stage reports first, so releases are not starved by new feeds.
            let msg = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                Some(msg) = self.inbox_rx.recv() => msg,
                Some(entity) = self.fed_rx.recv() => Message::Fed(entity),
                else => break,
            };
            self.dispatch(msg).await;
        }
        debug!(subsystem = %self.subsystem, "Dispatch loop stopped");
    }

    async fn dispatch(&self, msg: Message<E, R>) {
        match msg {
            Message::Fed(entity) => self.admit(entity).await,
            Message::Persist(tracked) => {
                self.forward(self.persist_tx.as_ref(), tracked, "persistent", true)
                    .await
            }
            Message::Notif(tracked) => {
                self.forward(self.notif_tx.as_ref(), tracked, "notif", false)
                    .await
            }
            Message::Reward(tracked) => {
                self.forward(self.reward_tx.as_ref(), tracked, "reward", true)
                    .await
            }
            Message::Done(object_id) => self.guard.release(&object_id),
        }
    }

    async fn admit(&self, entity: E) {
        let object_id = self.scanner.object_id(&entity);
        let retry_key = format!("admit:{object_id}");

        match self.guard.admit(&object_id) {
            Admission::Admitted => {
                self.retry.reset(&retry_key);
                let tracked = Tracked::new(object_id.clone(), entity);
                if cancelable_feed(&self.stop, &self.exec_tx, tracked).await.is_err() {
                    self.guard.release(&object_id);
                }
            }
            Admission::AlreadyRunning => {
                debug!(subsystem = %self.subsystem, object_id = %object_id, "Already running");
            }
            Admission::Overflow => {
                let decision = self.retry.schedule(retry_key, entity, &self.refeed);
                debug!(
                    subsystem = %self.subsystem,
                    object_id = %object_id,
                    in_flight = self.guard.in_flight(),
                    retry = ?decision,
                    "Running cap reached"
                );
                if matches!(decision, RetryDecision::Exhausted | RetryDecision::Overflow) {
                    warn!(
                        subsystem = %self.subsystem,
                        object_id = %object_id,
                        "Admission retry dropped, waiting for next scan"
                    );
                }
            }
        }
    }

    /// Feed a stage input. When the stage is missing or the feed is abandoned,
    /// `release` decides whether the object must be released here because no
    /// `Done` will follow.
    async fn forward(
        &self,
        tx: Option<&mpsc::Sender<Tracked<R>>>,
        tracked: Tracked<R>,
        stage: &'static str,
        release: bool,
    ) {
        let object_id = tracked.object_id.clone();
        let delivered = match tx {
            Some(tx) => cancelable_feed(&self.stop, tx, tracked).await.is_ok(),
            None => {
                debug!(subsystem = %self.subsystem, object_id = %object_id, stage, "No stage configured");
                false
            }
        };
        if !delivered && release {
            self.guard.release(&object_id);
        }
    }
}

async fn renew_lease(
    subsystem: String,
    lock: Arc<dyn DistributedLock>,
    lease: LockLease,
    ttl: Duration,
    close: CancellationToken,
    stop: CancellationToken,
) {
    let interval = (ttl / 3).max(Duration::from_millis(10));
    let mut renewed_at = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match lock.renew(&lease).await {
            Ok(true) => renewed_at = Instant::now(),
            Ok(false) => {
                error!(subsystem = %subsystem, lock_key = %lease.key, "Lock lease lost, closing subsystem");
                close.cancel();
                break;
            }
            Err(e) => {
                warn!(subsystem = %subsystem, error = %e, "Lock renewal failed");
                if renewed_at.elapsed() >= ttl {
                    error!(subsystem = %subsystem, lock_key = %lease.key, "Lock lease expired, closing subsystem");
                    close.cancel();
                    break;
                }
            }
        }
    }
}
