// ABOUTME: Unified error handling for the sync engine with retry classification
// ABOUTME: Distinguishes ordinary, rate-limited, and terminal failures for the runtime
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::time::Duration;

use crate::events::ConnectionErrorType;

/// Result type used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Unified error type for all engine operations.
///
/// The variants carry the retry semantics the runtime needs: rate-limited
/// errors become deferred retries, unauthorized/not-found/schema-drift errors
/// are terminal, everything else is retried up to the function's budget.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied invalid input (malformed event payload, bad cursor shape)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A tenant connection or credential was not found (likely racing an uninstall)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The provider rejected our credentials; terminal for the run
    #[error("Unauthorized ({error_type}): {message}")]
    Unauthorized {
        /// Connection error category reported to the directory sink
        error_type: ConnectionErrorType,
        /// Provider-supplied detail
        message: String,
    },

    /// The provider throttled us; resume after the given delay
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Delay before the invocation should be re-attempted
        retry_after: Duration,
    },

    /// Ordinary provider failure (network, 5xx); retriable
    #[error("Provider error: {0}")]
    Provider(String),

    /// The provider returned a pagination/response shape we do not recognize.
    /// Terminal: silently mis-syncing is worse than stopping.
    #[error("Provider schema drift: {0}")]
    SchemaDrift(String),

    /// Directory sink failure; retriable
    #[error("Sink error: {0}")]
    Sink(String),

    /// Connection store failure; retriable
    #[error("Storage error: {0}")]
    Storage(String),

    /// The run was cancelled by a matching install/uninstall event
    #[error("Run cancelled")]
    Cancelled,

    /// JSON serialization failure (step memoization, event payloads)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a configuration error
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an unauthorized error with a connection error category
    #[must_use]
    pub fn unauthorized(error_type: ConnectionErrorType, msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            error_type,
            message: msg.into(),
        }
    }

    /// Create a rate limited error with the computed delay
    #[must_use]
    pub const fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited { retry_after }
    }

    /// Create an ordinary provider error
    #[must_use]
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a schema drift error
    #[must_use]
    pub fn schema_drift(msg: impl Into<String>) -> Self {
        Self::SchemaDrift(msg.into())
    }

    /// Create a sink error
    #[must_use]
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Create a storage error
    #[must_use]
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error indicates a missing tenant/connection
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the runtime may re-attempt the invocation after this error.
    ///
    /// Rate-limited errors are handled separately (deferred retry) and are
    /// not considered ordinarily retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Provider(_) | Self::Sink(_) | Self::Storage(_) | Self::Internal(_)
        )
    }

    /// The deferred-retry delay, when this is a rate-limit classification
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
