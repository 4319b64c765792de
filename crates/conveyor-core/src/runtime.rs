// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for conveyor.
//!
//! [`SchedulerRuntime`] is the composition root: it owns the cancellation
//! token, the process-wide running map, the lock backend and the subsystem
//! registry.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use conveyor_core::config::Config;
//! use conveyor_core::runtime::SchedulerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = SchedulerRuntime::builder()
//!         .config(Config::from_env()?)
//!         .subsystem(Arc::new(MySubsystem::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::lock::{DistributedLock, MemoryLock, RedisLock};
use crate::registry::{Registry, Subsystem, SubsystemContext};
use crate::running::RunningMap;

/// Builder for creating a [`SchedulerRuntime`].
#[derive(Default)]
pub struct SchedulerRuntimeBuilder {
    config: Option<Config>,
    lock: Option<Arc<dyn DistributedLock>>,
    running: Option<RunningMap>,
    token: Option<CancellationToken>,
    subsystems: Vec<Arc<dyn Subsystem>>,
}

impl SchedulerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    ///
    /// Default: [`Config::default`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the lock backend.
    ///
    /// Default: [`RedisLock`] when `redis_url` is configured, otherwise [`MemoryLock`].
    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Share an existing running map (e.g. with another runtime in this process).
    pub fn running_map(mut self, running: RunningMap) -> Self {
        self.running = Some(running);
        self
    }

    /// Parent cancellation token.
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Register a subsystem. Registration order is initialization order.
    pub fn subsystem(mut self, subsystem: Arc<dyn Subsystem>) -> Self {
        self.subsystems.push(subsystem);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if two subsystems share a name.
    pub fn build(self) -> Result<SchedulerRuntimeConfig> {
        let mut names: Vec<&str> = self.subsystems.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(PipelineError::DuplicateSubsystem(dup[0].to_string()));
        }

        Ok(SchedulerRuntimeConfig {
            config: self.config.unwrap_or_default(),
            lock: self.lock,
            running: self.running.unwrap_or_default(),
            token: self.token.unwrap_or_default(),
            subsystems: self.subsystems,
        })
    }
}

/// Configuration for a [`SchedulerRuntime`].
pub struct SchedulerRuntimeConfig {
    config: Config,
    lock: Option<Arc<dyn DistributedLock>>,
    running: RunningMap,
    token: CancellationToken,
    subsystems: Vec<Arc<dyn Subsystem>>,
}

impl SchedulerRuntimeConfig {
    /// Connect the lock backend, register every subsystem and start the
    /// enabled ones.
    pub async fn start(self) -> Result<SchedulerRuntime> {
        let lock: Arc<dyn DistributedLock> = match (self.lock, &self.config.redis_url) {
            (Some(lock), _) => lock,
            (None, Some(url)) => {
                info!("Using Redis lock backend");
                Arc::new(RedisLock::connect(url).await?)
            }
            (None, None) => {
                info!("Using in-memory lock backend");
                Arc::new(MemoryLock::new())
            }
        };

        let ctx = SubsystemContext::from_config(
            &self.config,
            lock,
            self.running.clone(),
            self.token.clone(),
        );
        let registry = Arc::new(Registry::new(ctx));
        for subsystem in self.subsystems {
            registry.register(subsystem).await?;
        }
        registry.initialize_all().await;

        info!(
            registered = registry.registered().await.len(),
            enabled = ?registry.list_subsystems(),
            lock_prefix = %self.config.lock_prefix,
            "SchedulerRuntime started"
        );

        Ok(SchedulerRuntime {
            registry,
            running: self.running,
            token: self.token,
        })
    }
}

/// A running conveyor instance.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct SchedulerRuntime {
    registry: Arc<Registry>,
    running: RunningMap,
    token: CancellationToken,
}

impl SchedulerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SchedulerRuntimeBuilder {
        SchedulerRuntimeBuilder::new()
    }

    /// The subsystem registry, for wiring control endpoints.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn running_map(&self) -> &RunningMap {
        &self.running
    }

    /// Gracefully shut down the runtime.
    ///
    /// Finalizes every subsystem in reverse registration order, then cancels
    /// the root token so nothing spawned by the runtime outlives it.
    pub async fn shutdown(self) {
        info!("SchedulerRuntime shutting down...");
        self.registry.finalize_all().await;
        self.token.cancel();
        info!("SchedulerRuntime shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Subsystem for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn initialize(&self, _ctx: &SubsystemContext) -> Result<Option<Handler>> {
            Ok(None)
        }
    }

    #[test]
    fn test_build_rejects_duplicate_names() {
        let result = SchedulerRuntime::builder()
            .subsystem(Arc::new(Named("order")))
            .subsystem(Arc::new(Named("benefit")))
            .subsystem(Arc::new(Named("order")))
            .build();
        assert!(matches!(result, Err(PipelineError::DuplicateSubsystem(name)) if name == "order"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_with_defaults() {
        let config = Config {
            enabled_subsystems: vec!["order".into()],
            ..Default::default()
        };
        let runtime = SchedulerRuntime::builder()
            .config(config)
            .subsystem(Arc::new(Named("order")))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(runtime.registry().list_subsystems(), vec!["order"]);
        assert!(runtime.running_map().is_empty());
        runtime.shutdown().await;
    }
}
