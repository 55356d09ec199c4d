// ABOUTME: Cron-triggered scheduler: fans one sync-requested event out to
// ABOUTME: every active tenant with a fresh deletion watermark
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use chrono::Utc;
use tracing::{debug, info};

use crate::engine::SyncEngine;
use crate::errors::EngineResult;
use crate::events::{EventEnvelope, EventKind, SyncRequested};
use crate::models::TenantConnection;
use crate::runtime::FunctionContext;

/// One scheduler tick: emit a fresh sync run for every active tenant.
///
/// Each emitted run gets its own watermark (the emission instant) and starts
/// from the first page. The per-tenant concurrency key on the sync function
/// queues the run behind any sync still in flight for that tenant.
///
/// # Errors
///
/// Returns a storage error when the active-tenant listing fails.
pub async fn run_scheduled_syncs(
    engine: &SyncEngine,
    context: &FunctionContext,
) -> EngineResult<()> {
    let step = &context.step;
    let tenants: Vec<TenantConnection> = step
        .run("list-active-tenants", || async {
            engine.store.list_active().await
        })
        .await?;
    if tenants.is_empty() {
        debug!("No active tenants, nothing to schedule");
        return Ok(());
    }

    let events = tenants
        .iter()
        .map(|connection| {
            EventEnvelope::new(
                EventKind::UsersSyncRequested,
                &engine.config.source,
                &SyncRequested {
                    organisation_id: connection.organisation_id,
                    region: connection.region.clone(),
                    connection_id: connection.external_connection_id.clone(),
                    is_first_sync: false,
                    sync_started_at: Utc::now(),
                    cursor: None,
                },
            )
        })
        .collect::<EngineResult<Vec<_>>>()?;
    let count = events.len();
    step.send_event("emit-tenant-syncs", events)?;
    info!(count, "Scheduled sync runs for active tenants");
    Ok(())
}
