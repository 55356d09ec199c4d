// ABOUTME: Sync and delete run handlers: page fetch, normalization, directory
// ABOUTME: upsert, continuation/finalize decisions, and unauthorized propagation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::sync::Arc;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use http::StatusCode;
use tracing::{debug, info, warn};

use crate::classify::{Classification, ErrorClassifier};
use crate::connector::{ProviderError, ProviderErrorKind, UserPage};
use crate::credentials::ResolvedConnection;
use crate::engine::SyncEngine;
use crate::errors::{EngineError, EngineResult};
use crate::events::{
    AppUninstalled, EventEnvelope, EventKind, SyncRequested, UsersDeleteRequested,
};
use crate::models::{NormalizedIdentity, OrganisationId};
use crate::run_state::{RunTransition, SyncRun};
use crate::runtime::{FunctionContext, Step};

/// One invocation of the sync function: fetch a single page, upsert it, and
/// either emit a continuation or finalize the run with the watermark delete.
///
/// # Errors
///
/// Returns a classified error: rate limits defer the invocation, transient
/// failures consume the retry budget, unauthorized and schema-drift errors
/// end the run.
pub async fn run_sync(engine: &SyncEngine, context: &FunctionContext) -> EngineResult<()> {
    let payload: SyncRequested = context.event.payload()?;
    let run = SyncRun::from_event(&payload);
    let organisation_id = run.organisation_id;
    info!(
        %organisation_id,
        cursor = ?run.cursor,
        first_sync = run.is_first_sync,
        "Processing sync page"
    );

    let step = &context.step;
    let Some(resolved) = resolve_connection(engine, step, &run.connection_id).await? else {
        info!(%organisation_id, "Connection no longer exists, ending sync run");
        return Ok(());
    };

    let page = fetch_page(engine, step, &run, &resolved).await;
    let page = intercept_unauthorized(engine, step, organisation_id, page).await?;

    let identities = normalize_page(engine, organisation_id, &page.items);
    debug!(
        %organisation_id,
        fetched = page.items.len(),
        normalized = identities.len(),
        "Page normalized"
    );
    if !identities.is_empty() {
        step.run("update-directory-users", || async {
            engine.sink.update_users(organisation_id, &identities).await
        })
        .await?;
    }

    match run.advance(page.next_cursor) {
        RunTransition::Continue(next) => {
            let event = EventEnvelope::new(
                EventKind::UsersSyncRequested,
                &engine.config.source,
                &next.to_event(),
            )?;
            step.send_event("send-continuation", vec![event])?;
        }
        RunTransition::Finalize => {
            let watermark = run.sync_started_at;
            step.run("delete-stale-users", || async {
                engine
                    .sink
                    .delete_users_synced_before(organisation_id, watermark)
                    .await
            })
            .await?;
            info!(%organisation_id, "Sync run completed");
        }
    }
    Ok(())
}

/// One invocation of the delete function: deactivate the named provider
/// accounts, then confirm their removal to the directory.
///
/// # Errors
///
/// Returns a classified error, as [`run_sync`] does.
pub async fn run_delete(engine: &SyncEngine, context: &FunctionContext) -> EngineResult<()> {
    let payload: UsersDeleteRequested = context.event.payload()?;
    let organisation_id = payload.organisation_id;
    if payload.user_ids.is_empty() {
        return Ok(());
    }
    info!(
        %organisation_id,
        count = payload.user_ids.len(),
        "Deactivating provider accounts"
    );

    let step = &context.step;
    let connection = step
        .run("load-connection", || async {
            engine.store.get(organisation_id).await
        })
        .await?;
    let Some(connection) = connection else {
        info!(%organisation_id, "Tenant already removed, skipping delete");
        return Ok(());
    };
    let Some(resolved) =
        resolve_connection(engine, step, &connection.external_connection_id).await?
    else {
        info!(%organisation_id, "Connection no longer exists, skipping delete");
        return Ok(());
    };

    let classifier = engine.classifiers.get(engine.connector.provider_id());
    let credentials = &resolved.credentials;
    let suspended = step
        .run("suspend-provider-accounts", || async {
            stream::iter(payload.user_ids.clone())
                .map(|user_id| {
                    let classifier = Arc::clone(&classifier);
                    async move {
                        match engine.connector.suspend_user(credentials, &user_id).await {
                            Ok(()) => Ok(()),
                            // Already gone upstream counts as done.
                            Err(error) if error.status == Some(StatusCode::NOT_FOUND) => Ok(()),
                            Err(error) => Err(map_provider_error(classifier.as_ref(), &error)),
                        }
                    }
                })
                .buffer_unordered(engine.config.delete_concurrency)
                .try_collect::<Vec<()>>()
                .await
                .map(|_| ())
        })
        .await;
    intercept_unauthorized(engine, step, organisation_id, suspended).await?;

    step.run("confirm-directory-delete", || async {
        engine
            .sink
            .delete_users_by_ids(organisation_id, &payload.user_ids)
            .await
    })
    .await?;
    info!(%organisation_id, "Provider accounts deactivated");
    Ok(())
}

/// Resolve broker credentials inside a memoized step.
///
/// A missing connection means the tenant was removed while work was queued;
/// callers end the run quietly instead of failing it.
pub(crate) async fn resolve_connection(
    engine: &SyncEngine,
    step: &Step,
    connection_id: &str,
) -> EngineResult<Option<ResolvedConnection>> {
    step.run("resolve-credentials", || async {
        match engine
            .credentials
            .get_connection(connection_id, engine.connector.auth_type())
            .await
        {
            Ok(resolved) => Ok(Some(resolved)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    })
    .await
}

async fn fetch_page(
    engine: &SyncEngine,
    step: &Step,
    run: &SyncRun,
    resolved: &ResolvedConnection,
) -> EngineResult<UserPage> {
    let classifier = engine.classifiers.get(engine.connector.provider_id());
    step.run("fetch-user-page", || async {
        engine
            .connector
            .fetch_user_page(&resolved.credentials, run.cursor.as_deref())
            .await
            .map_err(|error| map_provider_error(classifier.as_ref(), &error))
    })
    .await
}

/// Normalize raw provider items, skipping (and logging) any the connector
/// cannot map. A malformed record must never stall the whole tenant.
fn normalize_page(
    engine: &SyncEngine,
    organisation_id: OrganisationId,
    items: &[serde_json::Value],
) -> Vec<NormalizedIdentity> {
    let mut identities = Vec::with_capacity(items.len());
    for item in items {
        match engine.connector.normalize(item) {
            Ok(Some(identity)) => identities.push(identity),
            Ok(None) => {}
            Err(error) => {
                warn!(%organisation_id, %error, "Skipping item that failed normalization");
            }
        }
    }
    identities
}

/// Map a raw provider error to the engine error that drives retry semantics.
pub(crate) fn map_provider_error(
    classifier: &dyn ErrorClassifier,
    error: &ProviderError,
) -> EngineError {
    if error.kind == ProviderErrorKind::SchemaDrift {
        return EngineError::schema_drift(error.message.clone());
    }
    match classifier.classify(error) {
        Classification::Ordinary => EngineError::provider(error.message.clone()),
        Classification::RateLimited { retry_after } => EngineError::rate_limited(retry_after),
        Classification::Unauthorized { error_type } => {
            EngineError::unauthorized(error_type, error.message.clone())
        }
    }
}

/// Pass the result through, propagating an unauthorized failure to the
/// directory exactly once before returning it.
///
/// The status write is best-effort; the uninstall event is emitted through a
/// memoized step so a retried invocation cannot emit it twice.
pub(crate) async fn intercept_unauthorized<T>(
    engine: &SyncEngine,
    step: &Step,
    organisation_id: OrganisationId,
    result: EngineResult<T>,
) -> EngineResult<T> {
    let (error_type, message) = match result {
        Err(EngineError::Unauthorized {
            error_type,
            message,
        }) => (error_type, message),
        other => return other,
    };

    warn!(%organisation_id, %error_type, "Provider rejected credentials");
    if let Err(error) = engine
        .sink
        .update_connection_status(organisation_id, error_type, None)
        .await
    {
        warn!(%organisation_id, %error, "Failed to record connection status");
    }
    let event = EventEnvelope::new(
        EventKind::AppUninstalled,
        &engine.config.source,
        &AppUninstalled {
            organisation_id,
            error_type: Some(error_type),
        },
    )?;
    step.send_event("emit-app-uninstalled", vec![event])?;
    Err(EngineError::Unauthorized {
        error_type,
        message,
    })
}
