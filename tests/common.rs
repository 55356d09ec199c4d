// ABOUTME: Shared test fixtures: scripted mock connector, in-memory directory
// ABOUTME: sink, and an assembled engine harness on the reference runtime
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]
#![allow(
    dead_code,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::similar_names
)]
//! Shared test utilities for `lattice_sync`
//!
//! Provides the scripted connector, the observable directory sink, and the
//! harness that wires a full engine onto the in-process runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue, StatusCode};
use lattice_sync::{
    classify::ClassifierRegistry,
    config::EngineConfig,
    connector::{IdentityConnector, ProviderError, RefreshedCredentials, UserPage},
    credentials::{Credentials, StoreCredentialProvider},
    engine::SyncEngine,
    errors::{EngineError, EngineResult},
    events::{
        AppInstalled, AppUninstalled, ConnectionErrorType, EventEnvelope, EventKind,
        SyncRequested, TokenRefreshRequested, UsersDeleteRequested,
    },
    models::{NormalizedIdentity, OrganisationId, TenantConnection},
    runtime::{MemoryRuntime, RuntimeConfig},
    sink::DirectorySink,
    store::{ConnectionStore, MemoryConnectionStore},
};
use serde_json::json;
use uuid::Uuid;

/// Event source namespace used by every test engine.
pub const SOURCE: &str = "mock";

static INIT_LOGGING: Once = Once::new();

pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = lattice_sync::logging::init("info,lattice_sync=debug");
    });
}

/// A scripted failure for one fetch cursor, consumed `remaining` times.
struct ScriptedFailure {
    cursor: Option<String>,
    error: ProviderError,
    remaining: usize,
}

/// Provider adapter serving a fixed set of user pages, with failure
/// injection per cursor.
pub struct MockConnector {
    pages: Mutex<Vec<UserPage>>,
    fetch_calls: AtomicUsize,
    fetch_failures: Mutex<Vec<ScriptedFailure>>,
    suspended: Mutex<Vec<String>>,
    suspend_failures: Mutex<HashMap<String, ProviderError>>,
    refresh_calls: AtomicUsize,
    refresh_failure: Mutex<Option<ProviderError>>,
    token_lifetime: chrono::Duration,
}

impl MockConnector {
    /// A connector serving `per_page.len()` pages with the given user counts.
    /// User ids are `user-0`, `user-1`, ... across pages; cursors are the
    /// next page index as a string.
    pub fn with_users(per_page: &[usize]) -> Arc<Self> {
        Self::with_pages(build_pages(per_page, 0))
    }

    pub fn with_pages(pages: Vec<UserPage>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages),
            fetch_calls: AtomicUsize::new(0),
            fetch_failures: Mutex::new(Vec::new()),
            suspended: Mutex::new(Vec::new()),
            suspend_failures: Mutex::new(HashMap::new()),
            refresh_calls: AtomicUsize::new(0),
            refresh_failure: Mutex::new(None),
            token_lifetime: chrono::Duration::hours(1),
        })
    }

    /// Replace the served pages, e.g. to model churn between scheduled runs.
    pub fn set_pages(&self, pages: Vec<UserPage>) {
        *self.pages.lock().unwrap() = pages;
    }

    /// Script `times` consecutive failures for fetches at the given cursor.
    pub fn fail_fetch(&self, cursor: Option<&str>, error: ProviderError, times: usize) {
        self.fetch_failures.lock().unwrap().push(ScriptedFailure {
            cursor: cursor.map(str::to_owned),
            error,
            remaining: times,
        });
    }

    /// Script a failure for every user-suspension call for `user_id`.
    pub fn fail_suspend(&self, user_id: &str, error: ProviderError) {
        self.suspend_failures
            .lock()
            .unwrap()
            .insert(user_id.to_owned(), error);
    }

    /// Script a failure for the next token refresh call.
    pub fn fail_refresh(&self, error: ProviderError) {
        *self.refresh_failure.lock().unwrap() = Some(error);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn suspended_ids(&self) -> Vec<String> {
        let mut ids = self.suspended.lock().unwrap().clone();
        ids.sort();
        ids
    }
}

/// Build pages with the given user counts, numbering users from
/// `start_user`. Cursors are the next page index as a string.
pub fn build_pages(per_page: &[usize], start_user: usize) -> Vec<UserPage> {
    let mut pages = Vec::with_capacity(per_page.len());
    let mut next_user = start_user;
    for (index, count) in per_page.iter().enumerate() {
        let items = (next_user..next_user + count).map(user_item).collect();
        next_user += count;
        let next_cursor = if index + 1 < per_page.len() {
            Some((index + 1).to_string())
        } else {
            None
        };
        pages.push(UserPage { items, next_cursor });
    }
    pages
}

/// Raw provider item in the shape `MockConnector::normalize` expects.
pub fn user_item(index: usize) -> serde_json::Value {
    json!({
        "id": format!("user-{index}"),
        "name": format!("User {index}"),
        "email": format!("user-{index}@example.com"),
    })
}

#[async_trait]
impl IdentityConnector for MockConnector {
    fn provider_id(&self) -> &str {
        SOURCE
    }

    async fn fetch_user_page(
        &self,
        _credentials: &Credentials,
        cursor: Option<&str>,
    ) -> Result<UserPage, ProviderError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.fetch_failures.lock().unwrap();
            if let Some(scripted) = failures
                .iter_mut()
                .find(|s| s.cursor.as_deref() == cursor && s.remaining > 0)
            {
                scripted.remaining -= 1;
                return Err(scripted.error.clone());
            }
        }
        let index = match cursor {
            None => 0,
            Some(s) => s
                .parse::<usize>()
                .map_err(|_| ProviderError::schema_drift(format!("Bad cursor: {s}")))?,
        };
        self.pages
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .ok_or_else(|| ProviderError::schema_drift(format!("No page at cursor {index}")))
    }

    fn normalize(&self, item: &serde_json::Value) -> EngineResult<Option<NormalizedIdentity>> {
        if item.get("bot").and_then(serde_json::Value::as_bool) == Some(true) {
            return Ok(None);
        }
        let id = item
            .get("id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| EngineError::invalid_input("Item has no id"))?;
        Ok(Some(NormalizedIdentity {
            provider_id: id.to_owned(),
            display_name: item
                .get("name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(id)
                .to_owned(),
            primary_email: item
                .get("email")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned),
            additional_emails: Vec::new(),
            suspendable: true,
            profile_url: None,
            role_metadata: None,
        }))
    }

    async fn refresh_credentials(
        &self,
        _refresh_token: &str,
    ) -> Result<RefreshedCredentials, ProviderError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.refresh_failure.lock().unwrap().take() {
            return Err(error);
        }
        Ok(RefreshedCredentials {
            access_token: format!("access-{call}"),
            refresh_token: Some(format!("refresh-{call}")),
            expires_at: Utc::now() + self.token_lifetime,
        })
    }

    async fn suspend_user(
        &self,
        _credentials: &Credentials,
        user_id: &str,
    ) -> Result<(), ProviderError> {
        if let Some(error) = self.suspend_failures.lock().unwrap().get(user_id) {
            return Err(error.clone());
        }
        self.suspended.lock().unwrap().push(user_id.to_owned());
        Ok(())
    }
}

/// A stored directory record with the instant it was last upserted.
#[derive(Debug, Clone)]
pub struct StoredUser {
    pub identity: NormalizedIdentity,
    pub synced_at: DateTime<Utc>,
}

/// Observable in-memory directory sink.
#[derive(Default)]
pub struct MemoryDirectorySink {
    users: DashMap<(OrganisationId, String), StoredUser>,
    update_calls: AtomicUsize,
    status_updates: Mutex<Vec<(OrganisationId, ConnectionErrorType)>>,
    confirmed_deletes: Mutex<Vec<String>>,
}

impl MemoryDirectorySink {
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn user_ids(&self, organisation_id: OrganisationId) -> Vec<String> {
        let mut ids: Vec<String> = self
            .users
            .iter()
            .filter(|entry| entry.key().0 == organisation_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn user(&self, organisation_id: OrganisationId, provider_id: &str) -> Option<StoredUser> {
        self.users
            .get(&(organisation_id, provider_id.to_owned()))
            .map(|entry| entry.value().clone())
    }

    pub fn status_updates(&self) -> Vec<(OrganisationId, ConnectionErrorType)> {
        self.status_updates.lock().unwrap().clone()
    }

    pub fn confirmed_deletes(&self) -> Vec<String> {
        let mut ids = self.confirmed_deletes.lock().unwrap().clone();
        ids.sort();
        ids
    }
}

#[async_trait]
impl DirectorySink for MemoryDirectorySink {
    async fn update_users(
        &self,
        organisation_id: OrganisationId,
        users: &[NormalizedIdentity],
    ) -> EngineResult<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        for identity in users {
            self.users.insert(
                (organisation_id, identity.provider_id.clone()),
                StoredUser {
                    identity: identity.clone(),
                    synced_at: now,
                },
            );
        }
        Ok(())
    }

    async fn delete_users_synced_before(
        &self,
        organisation_id: OrganisationId,
        watermark: DateTime<Utc>,
    ) -> EngineResult<()> {
        // Strict inequality: a record stamped exactly at the watermark is
        // part of the current run and survives.
        self.users
            .retain(|key, user| key.0 != organisation_id || user.synced_at >= watermark);
        Ok(())
    }

    async fn delete_users_by_ids(
        &self,
        organisation_id: OrganisationId,
        user_ids: &[String],
    ) -> EngineResult<()> {
        for user_id in user_ids {
            self.users.remove(&(organisation_id, user_id.clone()));
        }
        self.confirmed_deletes
            .lock()
            .unwrap()
            .extend(user_ids.iter().cloned());
        Ok(())
    }

    async fn update_connection_status(
        &self,
        organisation_id: OrganisationId,
        error_type: ConnectionErrorType,
        _details: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        self.status_updates
            .lock()
            .unwrap()
            .push((organisation_id, error_type));
        Ok(())
    }
}

/// A fully wired engine on the reference runtime.
pub struct TestHarness {
    pub runtime: MemoryRuntime,
    pub engine: Arc<SyncEngine>,
    pub store: Arc<MemoryConnectionStore>,
    pub sink: Arc<MemoryDirectorySink>,
    pub connector: Arc<MockConnector>,
}

impl TestHarness {
    /// Wire an engine around the given connector and start the runtime.
    pub async fn start(connector: Arc<MockConnector>) -> Result<Self> {
        Self::start_with_config(connector, EngineConfig::for_testing(SOURCE)).await
    }

    pub async fn start_with_config(
        connector: Arc<MockConnector>,
        config: EngineConfig,
    ) -> Result<Self> {
        init_logging();
        let store = Arc::new(MemoryConnectionStore::new());
        let sink = Arc::new(MemoryDirectorySink::default());
        let credentials = Arc::new(StoreCredentialProvider::new(
            Arc::clone(&store) as Arc<dyn ConnectionStore>
        ));
        let classifiers = ClassifierRegistry::new(config.default_rate_limit_delay);
        let engine = SyncEngine::new(
            config,
            Arc::clone(&connector) as Arc<dyn IdentityConnector>,
            classifiers,
            credentials,
            Arc::clone(&sink) as Arc<dyn DirectorySink>,
            Arc::clone(&store) as Arc<dyn ConnectionStore>,
        )?;
        let runtime = MemoryRuntime::new(RuntimeConfig::for_testing())?;
        engine.register(&runtime);
        runtime.start().await?;
        Ok(Self {
            runtime,
            engine,
            store,
            sink,
            connector,
        })
    }

    /// Insert a tenant connection row and return it.
    pub async fn add_tenant(&self, index: usize) -> Result<TenantConnection> {
        let organisation_id = OrganisationId::from_uuid(Uuid::new_v4());
        let connection = TenantConnection::new(
            organisation_id,
            "eu",
            format!("access-{index}"),
            format!("conn-{index}"),
        )
        .with_refresh_token(format!("refresh-{index}"))
        .with_expiry(Utc::now() + chrono::Duration::hours(1));
        self.store.upsert(connection.clone()).await?;
        Ok(connection)
    }

    /// Publish a sync-requested event for the tenant with a fresh watermark.
    pub fn publish_sync(&self, connection: &TenantConnection, is_first_sync: bool) -> Result<()> {
        let event = EventEnvelope::new(
            EventKind::UsersSyncRequested,
            SOURCE,
            &SyncRequested {
                organisation_id: connection.organisation_id,
                region: connection.region.clone(),
                connection_id: connection.external_connection_id.clone(),
                is_first_sync,
                sync_started_at: Utc::now(),
                cursor: None,
            },
        )?;
        self.runtime.publish(event);
        Ok(())
    }

    /// Publish a delete-requested event for the given user ids.
    pub fn publish_delete(&self, connection: &TenantConnection, user_ids: &[&str]) -> Result<()> {
        let event = EventEnvelope::new(
            EventKind::UsersDeleteRequested,
            SOURCE,
            &UsersDeleteRequested {
                organisation_id: connection.organisation_id,
                user_ids: user_ids.iter().map(|id| (*id).to_owned()).collect(),
            },
        )?;
        self.runtime.publish(event);
        Ok(())
    }

    /// Publish an app-installed event for the organisation.
    pub fn publish_installed(&self, organisation_id: OrganisationId) -> Result<()> {
        let event = EventEnvelope::new(
            EventKind::AppInstalled,
            SOURCE,
            &AppInstalled { organisation_id },
        )?;
        self.runtime.publish(event);
        Ok(())
    }

    /// Publish an app-uninstalled event for the organisation.
    pub fn publish_uninstalled(
        &self,
        organisation_id: OrganisationId,
        error_type: Option<ConnectionErrorType>,
    ) -> Result<()> {
        let event = EventEnvelope::new(
            EventKind::AppUninstalled,
            SOURCE,
            &AppUninstalled {
                organisation_id,
                error_type,
            },
        )?;
        self.runtime.publish(event);
        Ok(())
    }

    /// Publish a token-refresh-requested event with the given expiry.
    pub fn publish_token_refresh(
        &self,
        connection: &TenantConnection,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let event = EventEnvelope::new(
            EventKind::TokenRefreshRequested,
            SOURCE,
            &TokenRefreshRequested {
                organisation_id: connection.organisation_id,
                expires_at,
            },
        )?;
        self.runtime.publish(event);
        Ok(())
    }
}

/// An HTTP 429 with a `Retry-After` header.
pub fn rate_limited_error(retry_after_secs: u64) -> ProviderError {
    let mut headers = HeaderMap::new();
    headers.insert(
        "retry-after",
        HeaderValue::from_str(&retry_after_secs.to_string()).unwrap(),
    );
    ProviderError::http(StatusCode::TOO_MANY_REQUESTS, headers, "throttled")
}

/// An HTTP 401 with an empty body.
pub fn unauthorized_error() -> ProviderError {
    ProviderError::http(StatusCode::UNAUTHORIZED, HeaderMap::new(), "bad token")
}

/// A transient HTTP 503.
pub fn transient_error() -> ProviderError {
    ProviderError::http(
        StatusCode::SERVICE_UNAVAILABLE,
        HeaderMap::new(),
        "upstream unavailable",
    )
}
