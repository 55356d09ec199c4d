// ABOUTME: TenantConnection persistence seam plus an in-memory reference implementation
// ABOUTME: Token material is written only by the token lifecycle manager
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::errors::{EngineError, EngineResult};
use crate::models::{OrganisationId, TenantConnection};

/// Persistence for tenant connection rows.
///
/// The orchestrator and scheduler only read; `update_tokens` is reserved for
/// the token lifecycle manager (read-latest/overwrite, no locking needed).
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Fetch one tenant's connection row.
    ///
    /// # Errors
    ///
    /// Returns a storage error on backend failure.
    async fn get(&self, organisation_id: OrganisationId)
        -> EngineResult<Option<TenantConnection>>;

    /// Fetch a connection row by its external broker connection id.
    ///
    /// # Errors
    ///
    /// Returns a storage error on backend failure.
    async fn get_by_connection_id(
        &self,
        connection_id: &str,
    ) -> EngineResult<Option<TenantConnection>>;

    /// List every active tenant connection. Zero tenants is a valid result.
    ///
    /// # Errors
    ///
    /// Returns a storage error on backend failure.
    async fn list_active(&self) -> EngineResult<Vec<TenantConnection>>;

    /// Insert or replace a tenant's connection row (install/reinstall).
    ///
    /// # Errors
    ///
    /// Returns a storage error on backend failure.
    async fn upsert(&self, connection: TenantConnection) -> EngineResult<()>;

    /// Overwrite token material after a refresh.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the row no longer exists, or a
    /// storage error on backend failure.
    async fn update_tokens(
        &self,
        organisation_id: OrganisationId,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<()>;

    /// Remove a tenant's connection row (uninstall). Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a storage error on backend failure.
    async fn remove(&self, organisation_id: OrganisationId) -> EngineResult<()>;
}

/// In-memory connection store for tests and local development.
#[derive(Default)]
pub struct MemoryConnectionStore {
    rows: DashMap<OrganisationId, TenantConnection>,
}

impl MemoryConnectionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    /// Number of stored connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the store holds no connections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn get(
        &self,
        organisation_id: OrganisationId,
    ) -> EngineResult<Option<TenantConnection>> {
        Ok(self.rows.get(&organisation_id).map(|r| r.clone()))
    }

    async fn get_by_connection_id(
        &self,
        connection_id: &str,
    ) -> EngineResult<Option<TenantConnection>> {
        Ok(self
            .rows
            .iter()
            .find(|r| r.external_connection_id == connection_id)
            .map(|r| r.clone()))
    }

    async fn list_active(&self) -> EngineResult<Vec<TenantConnection>> {
        Ok(self.rows.iter().map(|r| r.clone()).collect())
    }

    async fn upsert(&self, connection: TenantConnection) -> EngineResult<()> {
        self.rows.insert(connection.organisation_id, connection);
        Ok(())
    }

    async fn update_tokens(
        &self,
        organisation_id: OrganisationId,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut row = self.rows.get_mut(&organisation_id).ok_or_else(|| {
            EngineError::not_found(format!("No connection for organisation {organisation_id}"))
        })?;
        row.access_token = access_token;
        if refresh_token.is_some() {
            row.refresh_token = refresh_token;
        }
        row.token_expires_at = Some(expires_at);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn remove(&self, organisation_id: OrganisationId) -> EngineResult<()> {
        self.rows.remove(&organisation_id);
        Ok(())
    }
}
