// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-flight tracking shared by every subsystem in the process.
//!
//! An object id is present in the [`RunningMap`] from the moment it is
//! admitted until its `Done` message is dispatched. Admission is the only
//! place that inserts; release is the only place that removes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::warn;

/// Entries older than this are reported when the same id is fed again.
const STALE_DUPLICATE_AFTER: Duration = Duration::from_secs(60);

/// Releases slower than this are reported.
const SLOW_RELEASE_AFTER: Duration = Duration::from_secs(10);

/// Owner and start time of an in-flight object.
#[derive(Debug, Clone)]
pub struct RunningEntry {
    pub subsystem: String,
    pub started_at: Instant,
}

/// Process-wide map of object id to in-flight entry. Cloning shares the map.
#[derive(Debug, Clone, Default)]
pub struct RunningMap {
    entries: Arc<DashMap<String, RunningEntry>>,
}

impl RunningMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `object_id` is in flight in any subsystem.
    pub fn contains(&self, object_id: &str) -> bool {
        self.entries.contains_key(object_id)
    }

    /// Subsystem currently owning `object_id`.
    pub fn owner(&self, object_id: &str) -> Option<String> {
        self.entries.get(object_id).map(|e| e.subsystem.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Guard that admits objects into this map on behalf of `subsystem`.
    pub fn guard(&self, subsystem: impl Into<String>, concurrent: Option<usize>) -> RunningGuard {
        RunningGuard {
            subsystem: subsystem.into(),
            map: self.clone(),
            concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Result of [`RunningGuard::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The id was inserted and may be fed to the executor.
    Admitted,
    /// The id is already in flight; drop this copy.
    AlreadyRunning,
    /// The subsystem is at its concurrency cap; retry later.
    Overflow,
}

/// Per-subsystem view of the [`RunningMap`] with an optional concurrency cap.
#[derive(Debug, Clone)]
pub struct RunningGuard {
    subsystem: String,
    map: RunningMap,
    concurrent: Option<usize>,
    in_flight: Arc<AtomicUsize>,
}

impl RunningGuard {
    /// Try to mark `object_id` as in flight.
    pub fn admit(&self, object_id: &str) -> Admission {
        match self.map.entries.entry(object_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let elapsed = entry.started_at.elapsed();
                if elapsed > STALE_DUPLICATE_AFTER {
                    warn!(
                        subsystem = %self.subsystem,
                        object_id = %object_id,
                        owner = %entry.subsystem,
                        elapsed_secs = elapsed.as_secs(),
                        in_flight = self.in_flight(),
                        "Object still processing"
                    );
                    entry.started_at = Instant::now();
                }
                Admission::AlreadyRunning
            }
            Entry::Vacant(vacant) => {
                if self
                    .concurrent
                    .is_some_and(|cap| self.in_flight.load(Ordering::Acquire) >= cap)
                {
                    return Admission::Overflow;
                }
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                vacant.insert(RunningEntry {
                    subsystem: self.subsystem.clone(),
                    started_at: Instant::now(),
                });
                Admission::Admitted
            }
        }
    }

    /// Remove `object_id` after its `Done`. Unknown ids are ignored.
    pub fn release(&self, object_id: &str) {
        let Some((_, entry)) = self
            .map
            .entries
            .remove_if(object_id, |_, e| e.subsystem == self.subsystem)
        else {
            return;
        };
        let elapsed = entry.started_at.elapsed();
        if elapsed > SLOW_RELEASE_AFTER {
            warn!(
                subsystem = %self.subsystem,
                object_id = %object_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow object release"
            );
        }
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Drop every entry owned by this subsystem. Used when a handler is
    /// finalized with objects still in its channels.
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        self.map.entries.retain(|_, e| {
            let owned = e.subsystem == self.subsystem;
            released += usize::from(owned);
            !owned
        });
        self.in_flight.store(0, Ordering::Release);
        released
    }

    /// Objects this subsystem currently has in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    pub fn map(&self) -> &RunningMap {
        &self.map
    }
}
