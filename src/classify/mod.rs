// ABOUTME: Error classification turning raw provider failures into retry semantics
// ABOUTME: One classifier per provider, selected from a registry keyed by provider id
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

//! # Provider Error Classification
//!
//! Every provider-calling step passes its raw error through a classifier before
//! it reaches the runtime's retry logic. Classification decides between:
//!
//! - **Ordinary**: transient failure, retried against the normal budget
//! - **Rate limited**: deferred retry after a provider-supplied (or default)
//!   delay, without consuming the ordinary budget
//! - **Unauthorized**: terminal, reported as a connection error
//!
//! Providers differ in how they signal throttling and auth failures, so each
//! provider gets its own [`RateLimitPolicy`] and body signatures, composed
//! into a [`StandardClassifier`] and looked up via [`ClassifierRegistry`].

pub mod rate_limit;
pub mod unauthorized;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::connector::ProviderError;
use crate::events::ConnectionErrorType;

pub use rate_limit::{RateLimitClassifier, RateLimitPolicy, ResetFormat};
pub use unauthorized::UnauthorizedClassifier;

/// Outcome of classifying a raw provider error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Transient failure, handled by the ordinary retry budget
    Ordinary,
    /// Provider throttling; resume after the delay
    RateLimited {
        /// Computed deferred-retry delay
        retry_after: Duration,
    },
    /// Authentication failure; terminal for the run
    Unauthorized {
        /// Connection error category to report
        error_type: ConnectionErrorType,
    },
}

/// Capability for classifying a provider's raw errors.
pub trait ErrorClassifier: Send + Sync {
    /// Classify one raw error
    fn classify(&self, error: &ProviderError) -> Classification;
}

/// Classifier composing rate-limit and unauthorized detection.
///
/// Unauthorized wins over rate-limited: a 401 carrying a stale `Retry-After`
/// header must still end the run.
pub struct StandardClassifier {
    rate_limit: RateLimitClassifier,
    unauthorized: UnauthorizedClassifier,
}

impl StandardClassifier {
    /// Compose a classifier from the two detectors
    #[must_use]
    pub const fn new(
        rate_limit: RateLimitClassifier,
        unauthorized: UnauthorizedClassifier,
    ) -> Self {
        Self {
            rate_limit,
            unauthorized,
        }
    }

    /// Classifier with generic HTTP semantics (429 + `Retry-After`, 401/403)
    #[must_use]
    pub fn generic(default_delay: Duration) -> Self {
        Self {
            rate_limit: RateLimitClassifier::new(RateLimitPolicy::new(default_delay)),
            unauthorized: UnauthorizedClassifier::new(),
        }
    }
}

impl ErrorClassifier for StandardClassifier {
    fn classify(&self, error: &ProviderError) -> Classification {
        if let Some(error_type) = self.unauthorized.classify(error) {
            return Classification::Unauthorized { error_type };
        }
        if let Some(retry_after) = self.rate_limit.classify(error) {
            return Classification::RateLimited { retry_after };
        }
        Classification::Ordinary
    }
}

/// Registry of classifiers keyed by provider id, with a generic fallback.
pub struct ClassifierRegistry {
    classifiers: HashMap<String, Arc<dyn ErrorClassifier>>,
    fallback: Arc<dyn ErrorClassifier>,
}

impl ClassifierRegistry {
    /// Create a registry whose fallback uses generic HTTP semantics with the
    /// given default rate-limit delay.
    #[must_use]
    pub fn new(default_delay: Duration) -> Self {
        Self {
            classifiers: HashMap::new(),
            fallback: Arc::new(StandardClassifier::generic(default_delay)),
        }
    }

    /// Register a provider-specific classifier
    pub fn register(&mut self, provider_id: impl Into<String>, classifier: Arc<dyn ErrorClassifier>) {
        self.classifiers.insert(provider_id.into(), classifier);
    }

    /// Look up the classifier for a provider, falling back to the generic one
    #[must_use]
    pub fn get(&self, provider_id: &str) -> Arc<dyn ErrorClassifier> {
        self.classifiers
            .get(provider_id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}
