// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for conveyor-core.

use thiserror::Error;

/// Pipeline errors.
///
/// Stage implementations map their own failures into one of the
/// transport-neutral variants (`Store`, `Service`, `Data`) so the engine can
/// log them uniformly.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The subsystem is shutting down; the send or scan was abandoned.
    #[error("Operation cancelled")]
    Cancelled,

    /// Durable store query or update failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Call to a sibling service failed.
    #[error("Service error: {0}")]
    Service(String),

    /// Entity data is invalid (bad state, unparseable amount, inconsistent totals).
    #[error("Invalid data: {0}")]
    Data(String),

    /// No subsystem is registered under this name.
    #[error("Unknown subsystem: {0}")]
    UnknownSubsystem(String),

    /// A subsystem with this name is already registered.
    #[error("Subsystem '{0}' already registered")]
    DuplicateSubsystem(String),

    /// Subsystem is already enabled.
    #[error("Subsystem '{0}' already enabled")]
    AlreadyEnabled(String),

    /// Subsystem is already disabled.
    #[error("Subsystem '{0}' already disabled")]
    AlreadyDisabled(String),

    /// Handler is in the wrong lifecycle state for the requested operation.
    #[error("Subsystem '{subsystem}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidState {
        /// Subsystem name.
        subsystem: String,
        /// The expected state.
        expected: &'static str,
        /// The actual state.
        actual: &'static str,
    },

    /// Subsystem is enabled but has no running handler in this process.
    #[error("Subsystem '{0}' is not running")]
    NotRunning(String),

    /// Handler builder is missing a required component.
    #[error("Subsystem '{subsystem}' is missing {component}")]
    MissingComponent {
        /// Subsystem name.
        subsystem: String,
        /// Name of the missing component.
        component: &'static str,
    },

    /// A saga step failed and every completed step was compensated.
    #[error("Saga step '{step}' failed: {reason}")]
    SagaFailed {
        /// The failing step.
        step: String,
        /// Failure reason.
        reason: String,
    },

    /// A saga step exceeded its request timeout.
    #[error("Saga step '{step}' timed out after {timeout_ms}ms")]
    SagaTimeout {
        /// The step that timed out.
        step: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Rolling back a completed saga step failed; the store may be inconsistent.
    #[error("Compensation of step '{step}' failed after '{failed_step}' failed: {reason}")]
    CompensationFailed {
        /// The step whose compensation failed.
        step: String,
        /// The step whose failure triggered compensation.
        failed_step: String,
        /// Compensation failure reason.
        reason: String,
    },
}

impl PipelineError {
    /// Whether the failure is worth retrying on the next scan or retry tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Redis(_)
                | Self::Database(_)
                | Self::Store(_)
                | Self::Service(_)
                | Self::SagaFailed { .. }
                | Self::SagaTimeout { .. }
        )
    }
}

/// Result type using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;
