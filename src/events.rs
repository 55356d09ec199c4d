// ABOUTME: Event schema for the sync engine: names, payloads, and envelopes
// ABOUTME: Continuation state travels entirely inside event payloads between invocations
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::models::OrganisationId;

/// Payload field carrying the organisation id, used for concurrency keys and
/// cancellation matching.
pub const ORGANISATION_ID_FIELD: &str = "organisation_id";

/// Payload field marking a bootstrap sync, used for priority boosting.
pub const IS_FIRST_SYNC_FIELD: &str = "is_first_sync";

/// Logical event kinds emitted and consumed by the engine.
///
/// Concrete wire names are namespaced by the connector source, e.g.
/// `gitlab/users.sync.requested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Start or continue a sync run for one tenant
    UsersSyncRequested,
    /// Deactivate specific provider accounts for one tenant
    UsersDeleteRequested,
    /// (Re)enter the token refresh loop for one tenant
    TokenRefreshRequested,
    /// The connector was installed for an organisation
    AppInstalled,
    /// The connector was uninstalled, or its connection became unusable
    AppUninstalled,
}

impl EventKind {
    /// The un-namespaced suffix of the event name
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::UsersSyncRequested => "users.sync.requested",
            Self::UsersDeleteRequested => "users.delete.requested",
            Self::TokenRefreshRequested => "token.refresh.requested",
            Self::AppInstalled => "app.installed",
            Self::AppUninstalled => "app.uninstalled",
        }
    }

    /// The full wire name for a given connector source
    #[must_use]
    pub fn wire_name(self, source: &str) -> String {
        format!("{source}/{}", self.suffix())
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.suffix())
    }
}

/// A serialized event travelling through the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Full wire name (`<source>/<suffix>`)
    pub name: String,
    /// Serialized payload
    pub data: serde_json::Value,
    /// Emission timestamp
    pub sent_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Build an envelope from a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn new<T: Serialize>(kind: EventKind, source: &str, payload: &T) -> EngineResult<Self> {
        Ok(Self {
            name: kind.wire_name(source),
            data: serde_json::to_value(payload)?,
            sent_at: Utc::now(),
        })
    }

    /// Deserialize the payload into a concrete event type.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the expected shape.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> EngineResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            EngineError::invalid_input(format!("Malformed {} payload: {e}", self.name))
        })
    }
}

/// Payload of `users.sync.requested`: the entire state of a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequested {
    /// Tenant being synced
    pub organisation_id: OrganisationId,
    /// Tenant data-residency region
    pub region: String,
    /// Credential broker connection id
    pub connection_id: String,
    /// Whether this is the bootstrap sync after install
    pub is_first_sync: bool,
    /// Deletion watermark: the sync start instant, carried unchanged through
    /// every continuation of the run
    pub sync_started_at: DateTime<Utc>,
    /// Opaque continuation token; `None` on the first page
    pub cursor: Option<String>,
}

/// Payload of `users.delete.requested`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsersDeleteRequested {
    /// Tenant owning the accounts
    pub organisation_id: OrganisationId,
    /// Provider account ids to deactivate
    pub user_ids: Vec<String>,
}

/// Payload of `token.refresh.requested`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRefreshRequested {
    /// Tenant whose token will be refreshed
    pub organisation_id: OrganisationId,
    /// Current access token expiry; the manager sleeps until
    /// `expires_at - margin`
    pub expires_at: DateTime<Utc>,
}

/// Payload of `app.installed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInstalled {
    /// Newly installed tenant
    pub organisation_id: OrganisationId,
}

/// Payload of `app.uninstalled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppUninstalled {
    /// Tenant being removed
    pub organisation_id: OrganisationId,
    /// Connection error category when the uninstall was triggered by an
    /// authentication failure rather than a user action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ConnectionErrorType>,
}

/// Category of a connection-level authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorType {
    /// Credentials rejected outright (401, revoked token)
    Unauthorized,
    /// Authenticated but lacking admin scope (403)
    NotAdmin,
    /// Authentication failure of unknown shape
    Unknown,
}

impl Display for ConnectionErrorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::NotAdmin => write!(f, "not_admin"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for ConnectionErrorType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unauthorized" => Ok(Self::Unauthorized),
            "not_admin" => Ok(Self::NotAdmin),
            "unknown" => Ok(Self::Unknown),
            _ => Err(EngineError::invalid_input(format!(
                "Unknown connection error type: {s}"
            ))),
        }
    }
}
