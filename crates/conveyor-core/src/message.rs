// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages exchanged between the stages and the dispatch loop.

/// A pipeline item together with the object id it was admitted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracked<T> {
    pub object_id: String,
    pub item: T,
}

impl<T> Tracked<T> {
    pub fn new(object_id: impl Into<String>, item: T) -> Self {
        Self {
            object_id: object_id.into(),
            item,
        }
    }
}

/// Everything the dispatch loop consumes.
///
/// `E` is the scanned entity, `R` the result computed by the executor.
#[derive(Debug)]
pub enum Message<E, R> {
    /// Entity from the sentinel (or a retry), to be admitted.
    Fed(E),
    /// Result to commit in the persistent stage.
    Persist(Tracked<R>),
    /// Result to deliver through the notif stage.
    Notif(Tracked<R>),
    /// Result to hand to the reward stage.
    Reward(Tracked<R>),
    /// Object left the pipeline; release its in-flight entry.
    Done(String),
}

impl<E, R> Message<E, R> {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Fed(_) => "fed",
            Message::Persist(_) => "persist",
            Message::Notif(_) => "notif",
            Message::Reward(_) => "reward",
            Message::Done(_) => "done",
        }
    }
}
