// ABOUTME: Credential provider seam resolving per-tenant OAuth/API-key credentials
// ABOUTME: NotFound from the broker is non-retriable and aborts a run silently
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::store::ConnectionStore;

/// Authentication scheme expected for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// OAuth 2.0 access/refresh token pair
    OAuth2,
    /// Static API key
    ApiKey,
}

impl Display for AuthType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::OAuth2 => write!(f, "oauth2"),
            Self::ApiKey => write!(f, "api_key"),
        }
    }
}

/// Credential material for calling a provider on behalf of a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Bearer token or API key
    pub access_token: String,
    /// Refresh token, for OAuth connections
    pub refresh_token: Option<String>,
    /// Access token expiry, when known
    pub expires_at: Option<DateTime<Utc>>,
}

/// A resolved connection: credentials plus broker-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedConnection {
    /// Credential material
    pub credentials: Credentials,
    /// Provider-specific connection configuration (instance URL, workspace id)
    pub connection_config: serde_json::Value,
}

/// External broker resolving per-tenant credentials by connection id.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolve a connection's credentials.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the connection is missing or
    /// invalid (the tenant was likely removed mid-run); other errors are
    /// treated as transient.
    async fn get_connection(
        &self,
        connection_id: &str,
        expected_auth_type: AuthType,
    ) -> EngineResult<ResolvedConnection>;
}

/// Credential provider backed by the engine's own connection store.
///
/// Deployments without an external broker keep tokens in the
/// `TenantConnection` row; this adapter serves them through the same seam.
pub struct StoreCredentialProvider {
    store: Arc<dyn ConnectionStore>,
}

impl StoreCredentialProvider {
    /// Create a provider reading from the given store
    #[must_use]
    pub fn new(store: Arc<dyn ConnectionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialProvider for StoreCredentialProvider {
    async fn get_connection(
        &self,
        connection_id: &str,
        _expected_auth_type: AuthType,
    ) -> EngineResult<ResolvedConnection> {
        let conn = self
            .store
            .get_by_connection_id(connection_id)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(format!("No connection with id {connection_id}"))
            })?;
        Ok(ResolvedConnection {
            credentials: Credentials {
                access_token: conn.access_token,
                refresh_token: conn.refresh_token,
                expires_at: conn.token_expires_at,
            },
            connection_config: serde_json::json!({ "region": conn.region }),
        })
    }
}
