// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subsystem registry and control surface.
//!
//! The registry maps each subsystem name to its [`Subsystem`] implementation
//! and the handler it is currently running, if any. It is an explicit value
//! owned by the runtime; nothing registers itself globally.
//!
//! Control operations (`enable_subsystem`, `disable_subsystem`,
//! `list_subsystems`, `trigger_subsystem`) are meant to be wired to whatever
//! RPC or admin surface the embedding service exposes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, SubsystemSwitches};
use crate::error::{PipelineError, Result};
use crate::handler::{Handler, HandlerState, finalize_handler};
use crate::lock::DistributedLock;
use crate::retry::RetryPolicy;
use crate::running::RunningMap;

/// Shared runtime parts handed to every subsystem on initialization.
#[derive(Clone)]
pub struct SubsystemContext {
    /// Parent token; each handler derives its close token from it.
    pub token: CancellationToken,
    pub running: RunningMap,
    pub lock: Arc<dyn DistributedLock>,
    pub switches: SubsystemSwitches,
    pub lock_prefix: String,
    pub lock_ttl: Option<Duration>,
    pub retry: RetryPolicy,
    pub channel_capacity: usize,
}

impl SubsystemContext {
    /// Build a context from loaded configuration.
    pub fn from_config(
        config: &Config,
        lock: Arc<dyn DistributedLock>,
        running: RunningMap,
        token: CancellationToken,
    ) -> Self {
        Self {
            token,
            running,
            lock,
            switches: SubsystemSwitches::new(config.enabled_subsystems.iter().cloned()),
            lock_prefix: config.lock_prefix.clone(),
            lock_ttl: config.lock_ttl,
            retry: config.retry.clone(),
            channel_capacity: config.channel_capacity,
        }
    }
}

impl std::fmt::Debug for SubsystemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsystemContext")
            .field("switches", &self.switches)
            .field("lock_prefix", &self.lock_prefix)
            .field("lock_ttl", &self.lock_ttl)
            .field("retry", &self.retry)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

/// A pluggable subsystem.
///
/// `initialize` usually builds a [`Handler`] with
/// `Handler::builder(..).context(ctx)` and the subsystem's stage
/// implementations. It returns `Ok(None)` when the handler builder did.
#[async_trait]
pub trait Subsystem: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self, ctx: &SubsystemContext) -> Result<Option<Handler>>;
}

struct Entry {
    subsystem: Arc<dyn Subsystem>,
    handler: Option<Handler>,
}

impl Entry {
    fn name(&self) -> &str {
        self.subsystem.name()
    }
}

/// Name → subsystem table plus the runtime enabled set.
pub struct Registry {
    ctx: SubsystemContext,
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn new(ctx: SubsystemContext) -> Self {
        Self {
            ctx,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &SubsystemContext {
        &self.ctx
    }

    /// Register a subsystem. Names must be unique.
    pub async fn register(&self, subsystem: Arc<dyn Subsystem>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.name() == subsystem.name()) {
            return Err(PipelineError::DuplicateSubsystem(subsystem.name().to_string()));
        }
        entries.push(Entry {
            subsystem,
            handler: None,
        });
        Ok(())
    }

    /// Registered subsystem names in registration order.
    pub async fn registered(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Initialize and run every enabled subsystem that is not running yet.
    ///
    /// A subsystem that fails to initialize is logged and skipped; the others
    /// still start.
    pub async fn initialize_all(&self) {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            if entry.handler.is_some() || !self.ctx.switches.is_enabled(entry.name()) {
                continue;
            }
            if let Err(e) = self.start_entry(entry).await {
                error!(subsystem = %entry.name(), error = %e, "Failed to initialize subsystem");
            }
        }
    }

    /// Finalize every running subsystem in reverse registration order.
    pub async fn finalize_all(&self) {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut().rev() {
            finalize_handler(entry.handler.take()).await;
        }
    }

    /// Enable `name` and start it in this process.
    pub async fn enable_subsystem(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = find(&mut entries, name)?;
        if !self.ctx.switches.enable(name) {
            return Err(PipelineError::AlreadyEnabled(name.to_string()));
        }

        // A handler that closed itself (panic, lost lease) is replaced.
        finalize_handler(entry.handler.take()).await;
        if let Err(e) = self.start_entry(entry).await {
            self.ctx.switches.disable(name);
            return Err(e);
        }
        info!(subsystem = %name, running = entry.handler.is_some(), "Subsystem enabled");
        Ok(())
    }

    /// Stop `name` in this process and disable it.
    pub async fn disable_subsystem(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = find(&mut entries, name)?;
        if !self.ctx.switches.is_enabled(name) {
            return Err(PipelineError::AlreadyDisabled(name.to_string()));
        }

        finalize_handler(entry.handler.take()).await;
        self.ctx.switches.disable(name);
        info!(subsystem = %name, "Subsystem disabled");
        Ok(())
    }

    /// Enabled subsystem names, sorted.
    pub fn list_subsystems(&self) -> Vec<String> {
        self.ctx.switches.list()
    }

    /// Forward a trigger condition to a running subsystem.
    pub async fn trigger_subsystem(&self, name: &str, cond: Value) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = find(&mut entries, name)?;
        match &entry.handler {
            Some(handler) => handler.trigger(cond),
            None => Err(PipelineError::NotRunning(name.to_string())),
        }
    }

    /// Handler state of `name` in this process, `None` when not running here.
    pub async fn subsystem_state(&self, name: &str) -> Result<Option<HandlerState>> {
        let mut entries = self.entries.lock().await;
        let entry = find(&mut entries, name)?;
        Ok(entry.handler.as_ref().map(Handler::state))
    }

    async fn start_entry(&self, entry: &mut Entry) -> Result<()> {
        let Some(handler) = entry.subsystem.initialize(&self.ctx).await? else {
            warn!(subsystem = %entry.name(), "Subsystem not started in this process");
            return Ok(());
        };
        if let Err(e) = handler.run() {
            handler.finalize().await;
            return Err(e);
        }
        entry.handler = Some(handler);
        Ok(())
    }
}

fn find<'a>(entries: &'a mut [Entry], name: &str) -> Result<&'a mut Entry> {
    entries
        .iter_mut()
        .find(|e| e.name() == name)
        .ok_or_else(|| PipelineError::UnknownSubsystem(name.to_string()))
}
