// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sentinel stage: finds actionable entities and feeds them into the pipeline.
//!
//! The sentinel runs the subsystem [`Scanner`] once at startup
//! ([`Scanner::init_scan`]), then on every scan interval, and whenever a
//! trigger condition arrives from the control surface. A failed scan is
//! logged and the next tick starts over; there is no cursor to resume.
//! Triggers do not move the periodic schedule. A panicking scanner closes
//! the subsystem.

mod check_state;
mod memory;
mod postgres;

pub use check_state::{CheckStateScanner, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, StateRow, StateStore};
pub use memory::MemoryStateStore;
pub use postgres::PgStateStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::feed::cancelable_feed;
use crate::watch::{Watched, watch};

/// Default interval between scans.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Cancelable sender handed to scanners.
#[derive(Debug)]
pub struct Feeder<E> {
    tx: mpsc::Sender<E>,
    token: CancellationToken,
}

impl<E> Clone for Feeder<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            token: self.token.clone(),
        }
    }
}

impl<E: Send> Feeder<E> {
    pub fn new(tx: mpsc::Sender<E>, token: CancellationToken) -> Self {
        Self { tx, token }
    }

    /// Feed one entity. Returns `Err(Cancelled)` once the subsystem is closing,
    /// so a scanner can abort its page loop with `?`.
    pub async fn feed(&self, entity: E) -> Result<()> {
        cancelable_feed(&self.token, &self.tx, entity).await
    }

    /// Whether feeding has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Subsystem-specific discovery of actionable entities.
#[async_trait]
pub trait Scanner<E: Send + 'static>: Send + Sync {
    /// Runs once when the sentinel starts. Used to re-feed entities a crashed
    /// run left in an intermediate state.
    async fn init_scan(&self, _feeder: &Feeder<E>) -> Result<()> {
        Ok(())
    }

    /// Periodic scan.
    async fn scan(&self, feeder: &Feeder<E>) -> Result<()>;

    /// Scan restricted by a control-surface condition. Defaults to a full scan.
    async fn trigger_scan(&self, _cond: &Value, feeder: &Feeder<E>) -> Result<()> {
        self.scan(feeder).await
    }

    /// Stable identity of an entity, used for in-flight tracking and retry keys.
    fn object_id(&self, entity: &E) -> String;
}

/// Sentinel task state.
pub(crate) struct Sentinel<E: Send + 'static> {
    subsystem: String,
    scanner: Arc<dyn Scanner<E>>,
    feeder: Feeder<E>,
    triggers: mpsc::Receiver<Value>,
    scan_interval: Duration,
    close: CancellationToken,
    stop: CancellationToken,
}

impl<E: Send + 'static> Sentinel<E> {
    pub(crate) fn new(
        subsystem: String,
        scanner: Arc<dyn Scanner<E>>,
        feeder: Feeder<E>,
        triggers: mpsc::Receiver<Value>,
        scan_interval: Duration,
        close: CancellationToken,
        stop: CancellationToken,
    ) -> Self {
        Self {
            subsystem,
            scanner,
            feeder,
            triggers,
            scan_interval,
            close,
            stop,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            subsystem = %self.subsystem,
            scan_interval_ms = self.scan_interval.as_millis() as u64,
            "Sentinel started"
        );

        let init = watch(&self.stop, self.scanner.init_scan(&self.feeder)).await;
        if !self.report(init, "Initial scan failed") {
            return;
        }

        let start = tokio::time::Instant::now() + self.scan_interval;
        let mut ticker = tokio::time::interval_at(start, self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let scan = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                Some(cond) = self.triggers.recv() => {
                    let scan = watch(&self.stop, self.scanner.trigger_scan(&cond, &self.feeder)).await;
                    self.report(scan, "Trigger scan failed")
                }
                _ = ticker.tick() => {
                    let scan = watch(&self.stop, self.scanner.scan(&self.feeder)).await;
                    self.report(scan, "Scan failed")
                }
            };
            if !scan {
                break;
            }
        }
        debug!(subsystem = %self.subsystem, "Sentinel stopping");
    }

    /// Log a scan result. Returns false when the sentinel must stop.
    fn report(&self, scan: Watched<Result<()>>, failure: &'static str) -> bool {
        match scan {
            Watched::Completed(Ok(())) => true,
            Watched::Completed(Err(e)) => {
                warn!(subsystem = %self.subsystem, error = %e, "{}", failure);
                true
            }
            Watched::Stopped => false,
            Watched::Panicked(panic) => {
                error!(
                    subsystem = %self.subsystem,
                    panic = %panic,
                    "Scanner panicked, closing subsystem"
                );
                self.close.cancel();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingScanner {
        init: AtomicUsize,
        scans: AtomicUsize,
        triggers: AtomicUsize,
    }

    #[async_trait]
    impl Scanner<u32> for CountingScanner {
        async fn init_scan(&self, feeder: &Feeder<u32>) -> Result<()> {
            self.init.fetch_add(1, Ordering::SeqCst);
            feeder.feed(0).await
        }

        async fn scan(&self, feeder: &Feeder<u32>) -> Result<()> {
            let n = self.scans.fetch_add(1, Ordering::SeqCst) as u32;
            feeder.feed(100 + n).await
        }

        async fn trigger_scan(&self, cond: &Value, feeder: &Feeder<u32>) -> Result<()> {
            self.triggers.fetch_add(1, Ordering::SeqCst);
            let id = cond["id"].as_u64().unwrap_or_default() as u32;
            if id == 13 {
                panic!("cursor corrupted");
            }
            feeder.feed(id).await
        }

        fn object_id(&self, entity: &u32) -> String {
            entity.to_string()
        }
    }

    struct Running {
        scanner: Arc<CountingScanner>,
        rx: mpsc::Receiver<u32>,
        triggers: mpsc::Sender<Value>,
        close: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_sentinel(capacity: usize) -> Running {
        let scanner = Arc::new(CountingScanner::default());
        let close = CancellationToken::new();
        let stop = close.child_token();
        let (tx, rx) = mpsc::channel(capacity);
        let (triggers, trigger_rx) = mpsc::channel(1);

        let sentinel = Sentinel::new(
            "test".into(),
            scanner.clone(),
            Feeder::new(tx, stop.clone()),
            trigger_rx,
            Duration::from_secs(30),
            close.clone(),
            stop,
        );
        Running {
            scanner,
            rx,
            triggers,
            close,
            handle: tokio::spawn(sentinel.run()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_init_scan_trigger_and_stop() {
        let mut s = spawn_sentinel(8);

        assert_eq!(s.rx.recv().await, Some(0));
        s.triggers.send(serde_json::json!({"id": 42})).await.unwrap();
        assert_eq!(s.rx.recv().await, Some(42));
        assert_eq!(s.rx.recv().await, Some(100));

        s.close.cancel();
        s.handle.await.unwrap();
        assert_eq!(s.scanner.init.load(Ordering::SeqCst), 1);
        assert_eq!(s.scanner.triggers.load(Ordering::SeqCst), 1);
        assert!(s.scanner.scans.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_triggers_do_not_delay_periodic_scans() {
        let s = spawn_sentinel(64);

        // One trigger every 10s for 100s against a 30s scan interval.
        for id in 1..=10 {
            s.triggers.send(serde_json::json!({ "id": id })).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        assert!(s.scanner.triggers.load(Ordering::SeqCst) >= 9);
        assert!(s.scanner.scans.load(Ordering::SeqCst) >= 2);
        s.close.cancel();
        s.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_scanner_panic_closes_subsystem() {
        let s = spawn_sentinel(8);

        s.triggers.send(serde_json::json!({"id": 13})).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), s.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(s.close.is_cancelled());
    }

    #[tokio::test]
    async fn test_feeder_cancelled() {
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);
        let feeder = Feeder::new(tx, token.clone());
        token.cancel();
        assert!(feeder.is_cancelled());
        assert!(feeder.feed(1u32).await.is_err());
    }
}
