// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conveyor Core - polling pipeline engine
//!
//! Conveyor drives entities through a fixed pipeline per subsystem: a
//! sentinel discovers actionable entities, an executor pool runs the
//! business step, and optional persistent, reward and notification stages
//! commit and announce the result. Every subsystem runs in at most one
//! process at a time, guarded by a distributed lock.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          SchedulerRuntime                           │
//! │   ┌──────────────┐   ┌──────────────┐   ┌───────────────────────┐   │
//! │   │   Registry   │   │  RunningMap  │   │ DistributedLock       │   │
//! │   │ (name → sub) │   │ (in flight)  │   │ (Redis / in-memory)   │   │
//! │   └──────┬───────┘   └──────────────┘   └───────────────────────┘   │
//! └──────────┼──────────────────────────────────────────────────────────┘
//!            │ initialize / finalize
//!            ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Handler (one subsystem)                      │
//! │                                                                     │
//! │  Sentinel ──► dispatch ──► Executor pool                            │
//! │                  ▲  │                                               │
//! │                  │  ├──► Persistent ──► Reward                      │
//! │                  │  └──► Notif                                      │
//! │                  │                                                  │
//! │                  └──── Persist / Notif / Reward / Done reports      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Stage traits
//!
//! | Trait | Stage | Required |
//! |-------|-------|----------|
//! | [`Scanner`] | Sentinel: init scan, periodic scan, trigger scan | Yes |
//! | [`Exec`] | Executor pool: business step, returns an [`Outcome`] | Yes |
//! | [`Persistenter`] | Commit the result (often through a [`SagaDispose`]) | No |
//! | [`Rewarded`] | Best-effort side effect after a commit | No |
//! | [`Notify`] | Announce the result, retried with backoff | No |
//!
//! # Control operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | [`Registry::enable_subsystem`] | Enable a subsystem and start it here |
//! | [`Registry::disable_subsystem`] | Stop a subsystem here and disable it |
//! | [`Registry::list_subsystems`] | Enabled subsystem names |
//! | [`Registry::trigger_subsystem`] | Ask a running sentinel for a filtered scan |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CONVEYOR_SUBSYSTEMS` | No | - | Comma-separated enabled subsystems |
//! | `CONVEYOR_REDIS_URL` | No | - | Redis lock backend; in-memory when unset |
//! | `CONVEYOR_LOCK_PREFIX` | No | `scheduler` | Lock key prefix |
//! | `CONVEYOR_LOCK_TTL_SECS` | No | `60` | Lock lease TTL, `0` never expires |
//!
//! See [`config`] for the retry and channel variables.
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables and runtime switches
//! - [`error`]: Error types
//! - [`executor`]: Executor pool and outcome routing
//! - [`feed`]: Cancelable channel sends
//! - [`handler`]: Per-subsystem lifecycle and dispatch loop
//! - [`lock`]: Distributed lock backends
//! - [`message`]: Messages exchanged between stages
//! - [`notif`], [`persistent`], [`reward`]: Post-execution stages
//! - [`registry`]: Subsystem table and control surface
//! - [`retry`]: Bounded delayed re-feeding
//! - [`running`]: Process-wide in-flight tracking
//! - [`runtime`]: Embeddable runtime
//! - [`saga`]: Multi-step commits with compensation
//! - [`sentinel`]: Scanning and the check-state pattern

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for pipeline operations.
pub mod error;

/// Executor pool and [`Exec`] outcomes.
pub mod executor;

/// Cancelable and asynchronous channel sends.
pub mod feed;

/// Subsystem handler lifecycle.
pub mod handler;

/// Distributed lock backends.
pub mod lock;

/// Messages exchanged between stages.
pub mod message;

/// Notification stage.
pub mod notif;

/// Persistent stage.
pub mod persistent;

/// Subsystem registry and control surface.
pub mod registry;

/// Delayed re-feeding with backoff.
pub mod retry;

/// Reward stage.
pub mod reward;

/// In-flight object tracking.
pub mod running;

/// Embeddable runtime.
pub mod runtime;

/// Saga steps with compensation.
pub mod saga;

/// Sentinel and scanners.
pub mod sentinel;

mod watch;

pub use config::{Config, ConfigError, SubsystemSwitches};
pub use error::{PipelineError, Result};
pub use executor::{Exec, Outcome};
pub use handler::{Handler, HandlerBuilder, HandlerState, finalize_handler};
pub use lock::{DistributedLock, LockLease, MemoryLock, RedisLock};
pub use message::Tracked;
pub use notif::Notify;
pub use persistent::Persistenter;
pub use registry::{Registry, Subsystem, SubsystemContext};
pub use retry::RetryPolicy;
pub use reward::Rewarded;
pub use running::RunningMap;
pub use runtime::{SchedulerRuntime, SchedulerRuntimeBuilder};
pub use saga::{SagaDispose, SagaStep};
pub use sentinel::{CheckStateScanner, Feeder, MemoryStateStore, PgStateStore, Scanner, StateRow, StateStore};
