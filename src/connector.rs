// ABOUTME: Provider-facing connector trait, raw provider errors, and the connector registry
// ABOUTME: One IdentityConnector implementation exists per SaaS provider, selected by id
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::credentials::{AuthType, Credentials};
use crate::errors::{EngineError, EngineResult};
use crate::models::NormalizedIdentity;

/// What kind of failure a provider call produced, before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// An HTTP response with an error status
    Http,
    /// Transport-level failure (DNS, timeout, connection reset)
    Network,
    /// The response parsed, but its pagination/shape is not what the
    /// connector expects
    SchemaDrift,
}

/// Raw error from a provider API call.
///
/// This is the classifier input: it keeps the status code, headers, and body
/// so rate-limit and unauthorized detection can inspect them.
#[derive(Debug, Clone)]
pub struct ProviderError {
    /// Failure category
    pub kind: ProviderErrorKind,
    /// HTTP status, when the provider answered at all
    pub status: Option<StatusCode>,
    /// Response headers (`Retry-After`, provider reset headers)
    pub headers: HeaderMap,
    /// Response body, when captured
    pub body: Option<String>,
    /// Human-readable summary
    pub message: String,
}

impl ProviderError {
    /// An HTTP error response
    #[must_use]
    pub fn http(status: StatusCode, headers: HeaderMap, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            kind: ProviderErrorKind::Http,
            status: Some(status),
            headers,
            message: format!("HTTP {status}"),
            body: Some(body),
        }
    }

    /// A transport-level failure
    #[must_use]
    pub fn network(msg: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Network,
            status: None,
            headers: HeaderMap::new(),
            body: None,
            message: msg.into(),
        }
    }

    /// An unexpected response shape.
    ///
    /// Schema drift is terminal: continuing would risk a silent mis-sync.
    #[must_use]
    pub fn schema_drift(msg: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::SchemaDrift,
            status: None,
            headers: HeaderMap::new(),
            body: None,
            message: msg.into(),
        }
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.status {
            Some(status) => write!(f, "{} (status {status})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// One page of raw user records from a provider list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPage {
    /// Raw provider items, normalized one at a time by the connector
    pub items: Vec<serde_json::Value>,
    /// Continuation token, `None` once pagination has provably terminated
    pub next_cursor: Option<String>,
}

/// New credential material returned by a provider token refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshedCredentials {
    /// New access token
    pub access_token: String,
    /// New refresh token, when the provider rotates them
    pub refresh_token: Option<String>,
    /// New expiry of the access token
    pub expires_at: DateTime<Utc>,
}

/// A provider adapter.
///
/// Implementations own the provider's API semantics (endpoints, field
/// mapping); the engine owns pagination, watermarks, classification, and
/// scheduling. List calls must be idempotent under re-invocation with the
/// same cursor: the runtime delivers at least once.
#[async_trait]
pub trait IdentityConnector: Send + Sync {
    /// Stable provider identifier (also the event source namespace)
    fn provider_id(&self) -> &str;

    /// Authentication scheme this provider's connections use
    fn auth_type(&self) -> AuthType {
        AuthType::OAuth2
    }

    /// Fetch one page of users starting at `cursor` (`None` = first page).
    ///
    /// # Errors
    ///
    /// Returns the raw provider error; the engine classifies it.
    async fn fetch_user_page(
        &self,
        credentials: &Credentials,
        cursor: Option<&str>,
    ) -> Result<UserPage, ProviderError>;

    /// Map one raw item to the directory shape.
    ///
    /// `Ok(None)` means "valid but filtered" (service accounts, bots).
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid item; the orchestrator skips and logs
    /// it without failing the page.
    fn normalize(&self, item: &serde_json::Value) -> EngineResult<Option<NormalizedIdentity>>;

    /// Exchange a refresh token for new credential material.
    ///
    /// # Errors
    ///
    /// Returns the raw provider error; the engine classifies it.
    async fn refresh_credentials(
        &self,
        refresh_token: &str,
    ) -> Result<RefreshedCredentials, ProviderError>;

    /// Suspend/deactivate one account at the provider.
    ///
    /// Must be idempotent: suspending an already-suspended account succeeds.
    ///
    /// # Errors
    ///
    /// Returns the raw provider error; the engine classifies it.
    async fn suspend_user(
        &self,
        credentials: &Credentials,
        user_id: &str,
    ) -> Result<(), ProviderError>;
}

/// Registry of connector implementations keyed by provider id.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn IdentityConnector>>,
}

impl ConnectorRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Register a connector under its own provider id
    pub fn register(&mut self, connector: Arc<dyn IdentityConnector>) {
        self.connectors
            .insert(connector.provider_id().to_owned(), connector);
    }

    /// Look up a connector by provider id.
    ///
    /// # Errors
    ///
    /// Returns an error if no connector is registered for the id.
    pub fn get(&self, provider_id: &str) -> EngineResult<Arc<dyn IdentityConnector>> {
        self.connectors.get(provider_id).cloned().ok_or_else(|| {
            EngineError::invalid_input(format!("Unsupported provider: {provider_id}"))
        })
    }

    /// Ids of all registered providers
    #[must_use]
    pub fn provider_ids(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    /// Whether a provider id has a registered connector
    #[must_use]
    pub fn is_supported(&self, provider_id: &str) -> bool {
        self.connectors.contains_key(provider_id)
    }
}
