// ABOUTME: Token refresh loop: sleep until shortly before expiry, refresh the
// ABOUTME: tenant's credentials, persist them, and schedule the next cycle
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::engine::SyncEngine;
use crate::errors::EngineResult;
use crate::events::{EventEnvelope, EventKind, TokenRefreshRequested};
use crate::orchestrator::{intercept_unauthorized, map_provider_error};
use crate::runtime::FunctionContext;

/// One cycle of the refresh loop for a tenant.
///
/// The invocation suspends until `expires_at - refresh_margin`, refreshes
/// the token, and re-enters the loop by emitting the next
/// `token.refresh.requested` event. Uninstalling the tenant cancels the
/// suspended run; a tenant removed while sleeping ends the loop quietly.
///
/// # Errors
///
/// Returns a classified provider error when the refresh call fails, or a
/// storage error when the new tokens cannot be persisted.
pub async fn run_token_refresh(engine: &SyncEngine, context: &FunctionContext) -> EngineResult<()> {
    let payload: TokenRefreshRequested = context.event.payload()?;
    let organisation_id = payload.organisation_id;
    let margin =
        chrono::Duration::from_std(engine.config.refresh_margin).unwrap_or_else(|_| {
            chrono::Duration::zero()
        });
    let wake_at = payload.expires_at - margin;

    let step = &context.step;
    step.sleep_until("sleep-until-refresh", wake_at).await?;

    let classifier = engine.classifiers.get(engine.connector.provider_id());
    let refreshed: EngineResult<Option<DateTime<Utc>>> = step
        .run("refresh-token", || async {
            let Some(connection) = engine.store.get(organisation_id).await? else {
                return Ok(None);
            };
            let Some(refresh_token) = connection.refresh_token.as_deref() else {
                warn!(%organisation_id, "Connection has no refresh token, ending refresh loop");
                return Ok(None);
            };
            let refreshed = engine
                .connector
                .refresh_credentials(refresh_token)
                .await
                .map_err(|error| map_provider_error(classifier.as_ref(), &error))?;
            engine
                .store
                .update_tokens(
                    organisation_id,
                    refreshed.access_token,
                    refreshed.refresh_token,
                    refreshed.expires_at,
                )
                .await?;
            Ok(Some(refreshed.expires_at))
        })
        .await;
    let Some(expires_at) = intercept_unauthorized(engine, step, organisation_id, refreshed).await?
    else {
        info!(%organisation_id, "Tenant removed while sleeping, ending refresh loop");
        return Ok(());
    };

    let event = EventEnvelope::new(
        EventKind::TokenRefreshRequested,
        &engine.config.source,
        &TokenRefreshRequested {
            organisation_id,
            expires_at,
        },
    )?;
    step.send_event("schedule-next-refresh", vec![event])?;
    info!(%organisation_id, %expires_at, "Token refreshed, next cycle scheduled");
    Ok(())
}
