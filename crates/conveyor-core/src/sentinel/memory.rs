// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory [`StateStore`] for tests and single-process demos.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::check_state::{StateRow, StateStore};
use crate::error::{PipelineError, Result};

/// Ordered id → (state, payload) table. Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    rows: Arc<Mutex<BTreeMap<String, (String, Value)>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, (String, Value)>>> {
        self.rows
            .lock()
            .map_err(|_| PipelineError::Store("state table poisoned".into()))
    }

    /// Insert or replace a row.
    pub fn insert(&self, id: impl Into<String>, state: impl Into<String>, payload: Value) {
        if let Ok(mut rows) = self.lock() {
            rows.insert(id.into(), (state.into(), payload));
        }
    }

    /// Current state of `id`.
    pub fn state(&self, id: &str) -> Option<String> {
        self.lock().ok()?.get(id).map(|(state, _)| state.clone())
    }

    /// Current row for `id`.
    pub fn get(&self, id: &str) -> Option<StateRow> {
        self.lock().ok()?.get(id).map(|(state, payload)| StateRow {
            id: id.to_string(),
            state: state.clone(),
            payload: payload.clone(),
        })
    }

    /// Unconditionally set the state of an existing row.
    pub fn set_state(&self, id: &str, state: &str) -> Result<()> {
        let mut rows = self.lock()?;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| PipelineError::Store(format!("row {id} not found")))?;
        row.0 = state.to_string();
        Ok(())
    }

    /// Replace the payload of an existing row.
    pub fn set_payload(&self, id: &str, payload: Value) -> Result<()> {
        let mut rows = self.lock()?;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| PipelineError::Store(format!("row {id} not found")))?;
        row.1 = payload;
        Ok(())
    }

    /// Number of rows in `state`.
    pub fn count_in(&self, state: &str) -> usize {
        self.lock()
            .map(|rows| rows.values().filter(|(s, _)| s == state).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn list(
        &self,
        states: &[&str],
        ids: Option<&[String]>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StateRow>> {
        let rows = self.lock()?;
        Ok(rows
            .iter()
            .filter(|(id, (state, _))| {
                states.contains(&state.as_str()) && ids.is_none_or(|ids| ids.contains(*id))
            })
            .skip(offset)
            .take(limit)
            .map(|(id, (state, payload))| StateRow {
                id: id.clone(),
                state: state.clone(),
                payload: payload.clone(),
            })
            .collect())
    }

    async fn compare_and_set(&self, id: &str, from: &str, to: &str) -> Result<bool> {
        let mut rows = self.lock()?;
        match rows.get_mut(id) {
            Some((state, _)) if state == from => {
                *state = to.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
