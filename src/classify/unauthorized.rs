// ABOUTME: Authentication failure detection from HTTP statuses and error-body signatures
// ABOUTME: Matches convert to terminal outcomes carrying a connection error category
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use http::StatusCode;

use crate::connector::ProviderError;
use crate::events::ConnectionErrorType;

/// Detects authentication failures in raw provider errors.
///
/// Besides 401/403, some providers report auth failures in a 200-style error
/// body (e.g. a GraphQL `AUTHENTICATION_ERROR` code); those are matched as
/// body signatures.
#[derive(Debug, Clone, Default)]
pub struct UnauthorizedClassifier {
    signatures: Vec<(String, ConnectionErrorType)>,
}

impl UnauthorizedClassifier {
    /// Classifier matching only HTTP 401/403
    #[must_use]
    pub fn new() -> Self {
        Self {
            signatures: Vec::new(),
        }
    }

    /// Add a body substring signature mapping to an error category.
    ///
    /// Matching is a plain substring test against the response body, which
    /// is how the GraphQL providers surface `AUTHENTICATION_ERROR` codes.
    #[must_use]
    pub fn with_body_signature(
        mut self,
        needle: impl Into<String>,
        error_type: ConnectionErrorType,
    ) -> Self {
        self.signatures.push((needle.into(), error_type));
        self
    }

    /// Classify an error: `Some(category)` when it is an auth failure.
    #[must_use]
    pub fn classify(&self, error: &ProviderError) -> Option<ConnectionErrorType> {
        match error.status {
            Some(StatusCode::UNAUTHORIZED) => return Some(ConnectionErrorType::Unauthorized),
            Some(StatusCode::FORBIDDEN) => return Some(ConnectionErrorType::NotAdmin),
            _ => {}
        }
        let body = error.body.as_deref()?;
        self.signatures
            .iter()
            .find(|(needle, _)| body.contains(needle.as_str()))
            .map(|(_, error_type)| *error_type)
    }
}
