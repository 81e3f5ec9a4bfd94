// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for nudge-core.
//!
//! One error enum covers storage, transition, recovery and transport failures.
//! Callers branch on the variant (or on [`EngineError::error_code`]) to decide
//! whether a failure is fatal, a benign race, or a plain negative answer.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the orchestration engine.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The backing store failed or is unavailable.
    #[error("storage error during {operation}: {details}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The requested state is not reachable from the current state.
    #[error("invalid transition in flow {flow}: {from} -> {to}")]
    InvalidTransition {
        /// Flow identifier.
        flow: String,
        /// State the participant is in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// A conditional transition found a different state than expected.
    #[error("state conflict for participant {participant}: expected {expected}, found {actual}")]
    Conflict {
        /// Participant identifier.
        participant: String,
        /// State the caller expected.
        expected: String,
        /// State actually stored (empty when no row exists).
        actual: String,
    },

    /// A component failed to rebuild its runtime state at startup.
    #[error("recovery failed for {component}: {details}")]
    Recovery {
        /// Name of the recoverable component.
        component: String,
        /// Error details.
        details: String,
    },

    /// A participant, timer or hook lookup found nothing.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up (participant, timer, hook, flow).
        kind: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// Input validation failed.
    #[error("validation error on {field}: {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// The messaging transport rejected or failed a send.
    #[error("transport error: {0}")]
    Transport(String),

    /// The text generator failed.
    #[error("text generation error: {0}")]
    Generation(String),

    /// Configuration loading failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The timer service has been stopped.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// One or more shutdown stages failed.
    #[error("shutdown completed with {} error(s): {}", .failures.len(), .failures.join("; "))]
    Shutdown {
        /// One entry per failed stage.
        failures: Vec<String>,
    },
}

impl EngineError {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Storage { .. } => "STORAGE_ERROR",
            EngineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngineError::Conflict { .. } => "STATE_CONFLICT",
            EngineError::Recovery { .. } => "RECOVERY_FAILED",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Validation { .. } => "VALIDATION_ERROR",
            EngineError::Transport(_) => "TRANSPORT_ERROR",
            EngineError::Generation(_) => "GENERATION_ERROR",
            EngineError::Config(_) => "CONFIG_ERROR",
            EngineError::ShuttingDown => "SHUTTING_DOWN",
            EngineError::Shutdown { .. } => "SHUTDOWN_FAILED",
        }
    }

    /// True for errors that only mean another event won a race for the same
    /// participant. Flows drop the losing transition.
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::InvalidTransition { .. }
        )
    }

    /// Shorthand for a `NotFound` error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for a `Validation` error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn storage(operation: &str, details: impl std::fmt::Display) -> Self {
        EngineError::Storage {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::storage("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::storage("migrate", err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::storage("json", err)
    }
}
