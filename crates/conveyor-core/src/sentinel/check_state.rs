// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mark-then-feed scanning over an external state column.
//!
//! An entity in the *live* state is flipped to the *check* state with a
//! compare-and-set before it is fed. A second process (or a second tick)
//! scanning the same row either loses the CAS or finds the row already in
//! the check state, where the in-flight guard drops the duplicate. Rows left
//! in the check state by a crash are picked up again by the startup scan and
//! by every periodic scan.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Feeder, Scanner};
use crate::error::Result;

/// Default number of rows fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Largest accepted page size.
pub const MAX_PAGE_SIZE: usize = 1000;

/// One row of the external state table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRow {
    pub id: String,
    pub state: String,
    pub payload: Value,
}

/// Access to the state column of an external store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Rows whose state is one of `states`, ordered by id. When `ids` is given
    /// only those rows are considered.
    async fn list(
        &self,
        states: &[&str],
        ids: Option<&[String]>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StateRow>>;

    /// Move `id` from `from` to `to`. Returns false when the row was not in `from`.
    async fn compare_and_set(&self, id: &str, from: &str, to: &str) -> Result<bool>;
}

/// Generic scanner over a [`StateStore`].
#[derive(Debug)]
pub struct CheckStateScanner<S> {
    store: S,
    live: String,
    check: String,
    page_size: usize,
}

impl<S: StateStore> CheckStateScanner<S> {
    pub fn new(store: S, live: impl Into<String>, check: impl Into<String>) -> Self {
        Self {
            store,
            live: live.into(),
            check: check.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Rows per page, clamped to `1..=MAX_PAGE_SIZE`.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn scan_states(
        &self,
        states: &[&str],
        ids: Option<&[String]>,
        feeder: &Feeder<StateRow>,
    ) -> Result<()> {
        let mut offset = 0;
        loop {
            let rows = self.store.list(states, ids, offset, self.page_size).await?;
            if rows.is_empty() {
                return Ok(());
            }
            offset += rows.len();

            for mut row in rows {
                if row.state == self.live {
                    if !self
                        .store
                        .compare_and_set(&row.id, &self.live, &self.check)
                        .await?
                    {
                        debug!(object_id = %row.id, "Row moved during scan, skipping");
                        continue;
                    }
                    row.state = self.check.clone();
                }
                feeder.feed(row).await?;
            }
        }
    }
}

#[async_trait]
impl<S: StateStore> Scanner<StateRow> for CheckStateScanner<S> {
    async fn init_scan(&self, feeder: &Feeder<StateRow>) -> Result<()> {
        self.scan_states(&[self.check.as_str()], None, feeder).await
    }

    async fn scan(&self, feeder: &Feeder<StateRow>) -> Result<()> {
        self.scan_states(&[self.live.as_str(), self.check.as_str()], None, feeder)
            .await
    }

    async fn trigger_scan(&self, cond: &Value, feeder: &Feeder<StateRow>) -> Result<()> {
        let ids: Option<Vec<String>> = cond.get("ids").and_then(Value::as_array).map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });
        self.scan_states(
            &[self.live.as_str(), self.check.as_str()],
            ids.as_deref(),
            feeder,
        )
        .await
    }

    fn object_id(&self, row: &StateRow) -> String {
        row.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentinel::MemoryStateStore;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn feeder() -> (Feeder<StateRow>, mpsc::Receiver<StateRow>) {
        let (tx, rx) = mpsc::channel(64);
        (Feeder::new(tx, CancellationToken::new()), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<StateRow>) -> Vec<StateRow> {
        let mut rows = Vec::new();
        while let Ok(row) = rx.try_recv() {
            rows.push(row);
        }
        rows
    }

    fn store() -> MemoryStateStore {
        let store = MemoryStateStore::new();
        store.insert("o1", "WaitPayment", json!({"amount": "10"}));
        store.insert("o2", "CheckPayment", json!({"amount": "20"}));
        store.insert("o3", "Paid", json!({}));
        store
    }

    #[tokio::test]
    async fn test_scan_flips_live_rows_and_refeeds_check_rows() {
        let scanner = CheckStateScanner::new(store(), "WaitPayment", "CheckPayment").with_page_size(1);
        let (feeder, mut rx) = feeder();

        scanner.scan(&feeder).await.unwrap();
        let rows = drain(&mut rx);
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["o1", "o2"]);
        assert!(rows.iter().all(|r| r.state == "CheckPayment"));
        assert_eq!(scanner.store().state("o1").as_deref(), Some("CheckPayment"));
        assert_eq!(scanner.store().state("o3").as_deref(), Some("Paid"));
    }

    #[tokio::test]
    async fn test_scan_is_idempotent() {
        let scanner = CheckStateScanner::new(store(), "WaitPayment", "CheckPayment");
        let (feeder, mut rx) = feeder();

        scanner.scan(&feeder).await.unwrap();
        scanner.scan(&feeder).await.unwrap();
        // Same ids both times; the in-flight guard drops the second copies.
        let ids: Vec<_> = drain(&mut rx).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["o1", "o2", "o1", "o2"]);
        assert_eq!(scanner.store().state("o1").as_deref(), Some("CheckPayment"));
    }

    #[tokio::test]
    async fn test_init_scan_only_check_rows() {
        let scanner = CheckStateScanner::new(store(), "WaitPayment", "CheckPayment");
        let (feeder, mut rx) = feeder();

        scanner.init_scan(&feeder).await.unwrap();
        let ids: Vec<_> = drain(&mut rx).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["o2"]);
        assert_eq!(scanner.store().state("o1").as_deref(), Some("WaitPayment"));
    }

    #[tokio::test]
    async fn test_trigger_scan_filters_ids() {
        let scanner = CheckStateScanner::new(store(), "WaitPayment", "CheckPayment");
        let (feeder, mut rx) = feeder();

        scanner
            .trigger_scan(&json!({"ids": ["o2"]}), &feeder)
            .await
            .unwrap();
        let ids: Vec<_> = drain(&mut rx).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["o2"]);
        assert_eq!(scanner.store().state("o1").as_deref(), Some("WaitPayment"));
    }

    #[tokio::test]
    async fn test_page_size_is_clamped() {
        let scanner = CheckStateScanner::new(store(), "a", "b").with_page_size(0);
        assert_eq!(scanner.page_size(), 1);
        let scanner = CheckStateScanner::new(store(), "a", "b").with_page_size(50_000);
        assert_eq!(scanner.page_size(), MAX_PAGE_SIZE);
    }
}
