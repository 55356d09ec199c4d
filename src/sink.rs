// ABOUTME: Directory sink seam receiving normalized identity batches and health updates
// ABOUTME: Upserts are idempotent by provider id; deletion is watermark- or id-based
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::EngineResult;
use crate::events::ConnectionErrorType;
use crate::models::{NormalizedIdentity, OrganisationId};

/// The central directory receiving synchronized identities.
///
/// Upserts key on `NormalizedIdentity::provider_id`, so redelivering a page
/// any number of times yields identical sink state. Watermark deletion
/// (`delete_users_synced_before`) is only ever called from a finalizing run.
#[async_trait]
pub trait DirectorySink: Send + Sync {
    /// Upsert a batch of identities for a tenant.
    ///
    /// # Errors
    ///
    /// Returns a transient error on failure; the runtime retries it.
    async fn update_users(
        &self,
        organisation_id: OrganisationId,
        users: &[NormalizedIdentity],
    ) -> EngineResult<()>;

    /// Delete every identity of the tenant whose last sync predates the
    /// watermark.
    ///
    /// # Errors
    ///
    /// Returns a transient error on failure; the runtime retries it.
    async fn delete_users_synced_before(
        &self,
        organisation_id: OrganisationId,
        synced_before: DateTime<Utc>,
    ) -> EngineResult<()>;

    /// Delete specific identities by provider id.
    ///
    /// # Errors
    ///
    /// Returns a transient error on failure; the runtime retries it.
    async fn delete_users_by_ids(
        &self,
        organisation_id: OrganisationId,
        ids: &[String],
    ) -> EngineResult<()>;

    /// Flag the tenant's connection health.
    ///
    /// Best-effort: callers log failures and continue, so a broken sink
    /// never keeps a failing run alive.
    ///
    /// # Errors
    ///
    /// Returns a transient error on failure.
    async fn update_connection_status(
        &self,
        organisation_id: OrganisationId,
        error_type: ConnectionErrorType,
        error_metadata: Option<serde_json::Value>,
    ) -> EngineResult<()>;
}
