// ABOUTME: Core data model for tenant connections and normalized identities
// ABOUTME: Shared by the connector, sink, and store seams; serializable end to end
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;

/// Identifier of a customer installation of a connector.
///
/// One organisation maps to exactly one `TenantConnection` and at most one
/// in-flight sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganisationId(Uuid);

impl OrganisationId {
    /// Generate a fresh organisation id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OrganisationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OrganisationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrganisationId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EngineError::invalid_input(format!("Invalid organisation id: {e}")))
    }
}

/// A tenant's installed connection to the upstream provider.
///
/// Credential material is written only by the token lifecycle manager; every
/// other component reads the current value per step and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConnection {
    /// Owning organisation
    pub organisation_id: OrganisationId,
    /// Data-residency region for the tenant (e.g. "eu", "us")
    pub region: String,
    /// Current access token
    pub access_token: String,
    /// Refresh token, when the provider issues one
    pub refresh_token: Option<String>,
    /// Identifier of the connection at the external credential broker
    pub external_connection_id: String,
    /// When the current access token expires
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl TenantConnection {
    /// Create a new connection row at install time
    #[must_use]
    pub fn new(
        organisation_id: OrganisationId,
        region: impl Into<String>,
        access_token: impl Into<String>,
        external_connection_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            organisation_id,
            region: region.into(),
            access_token: access_token.into(),
            refresh_token: None,
            external_connection_id: external_connection_id.into(),
            token_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the refresh token
    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Set the access token expiry
    #[must_use]
    pub const fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.token_expires_at = Some(expires_at);
        self
    }
}

/// One identity record in the shape the directory sink accepts.
///
/// Produced per page and flushed immediately; the engine never persists these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedIdentity {
    /// Stable identifier at the provider (the sink upserts by this id)
    pub provider_id: String,
    /// Human-readable name
    pub display_name: String,
    /// Primary email address
    pub primary_email: Option<String>,
    /// Secondary/alias email addresses
    #[serde(default)]
    pub additional_emails: Vec<String>,
    /// Whether the account can be suspended through the provider API
    pub suspendable: bool,
    /// Link to the account's profile page at the provider
    pub profile_url: Option<String>,
    /// Provider-specific role information (admin flags, seat type)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_metadata: Option<serde_json::Value>,
}
