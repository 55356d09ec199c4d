// ABOUTME: Engine assembly: dependency context, install/uninstall lifecycle,
// ABOUTME: and registration of every function on the runtime
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::classify::ClassifierRegistry;
use crate::config::EngineConfig;
use crate::connector::IdentityConnector;
use crate::credentials::CredentialProvider;
use crate::errors::EngineResult;
use crate::events::{
    AppInstalled, AppUninstalled, EventEnvelope, EventKind, SyncRequested, TokenRefreshRequested,
    IS_FIRST_SYNC_FIELD, ORGANISATION_ID_FIELD,
};
use crate::runtime::{FunctionConfig, FunctionContext, MemoryRuntime};
use crate::sink::DirectorySink;
use crate::store::ConnectionStore;
use crate::{orchestrator, scheduler, token};

/// The assembled engine for one provider: configuration plus every seam the
/// handlers call through.
pub struct SyncEngine {
    /// Engine configuration
    pub config: EngineConfig,
    pub(crate) connector: Arc<dyn IdentityConnector>,
    pub(crate) classifiers: ClassifierRegistry,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) sink: Arc<dyn DirectorySink>,
    pub(crate) store: Arc<dyn ConnectionStore>,
}

impl SyncEngine {
    /// Assemble an engine.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid.
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn IdentityConnector>,
        classifiers: ClassifierRegistry,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn DirectorySink>,
        store: Arc<dyn ConnectionStore>,
    ) -> EngineResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            connector,
            classifiers,
            credentials,
            sink,
            store,
        }))
    }

    /// Register every engine function on the runtime.
    ///
    /// Call before [`MemoryRuntime::start`].
    pub fn register(self: &Arc<Self>, runtime: &MemoryRuntime) {
        let source = &self.config.source;
        let uninstalled = EventKind::AppUninstalled.wire_name(source);
        let installed = EventKind::AppInstalled.wire_name(source);

        let sync_config = FunctionConfig::on_event(
            format!("{source}-users-sync"),
            EventKind::UsersSyncRequested.wire_name(source),
        )
        .with_concurrency(ORGANISATION_ID_FIELD, 1)
        .with_cancel_on(uninstalled.clone(), ORGANISATION_ID_FIELD)
        .with_cancel_on(installed.clone(), ORGANISATION_ID_FIELD)
        .with_retries(self.config.step_retries)
        .with_rate_limit_deferrals(self.config.max_rate_limit_deferrals)
        .with_priority_field(IS_FIRST_SYNC_FIELD);
        let engine = Arc::clone(self);
        runtime.register(sync_config, move |context| {
            let engine = Arc::clone(&engine);
            async move { orchestrator::run_sync(&engine, &context).await }
        });

        let delete_config = FunctionConfig::on_event(
            format!("{source}-users-delete"),
            EventKind::UsersDeleteRequested.wire_name(source),
        )
        .with_cancel_on(uninstalled.clone(), ORGANISATION_ID_FIELD)
        .with_retries(self.config.step_retries)
        .with_rate_limit_deferrals(self.config.max_rate_limit_deferrals);
        let engine = Arc::clone(self);
        runtime.register(delete_config, move |context| {
            let engine = Arc::clone(&engine);
            async move { orchestrator::run_delete(&engine, &context).await }
        });

        let refresh_config = FunctionConfig::on_event(
            format!("{source}-token-refresh"),
            EventKind::TokenRefreshRequested.wire_name(source),
        )
        .with_cancel_on(uninstalled.clone(), ORGANISATION_ID_FIELD)
        .with_cancel_on(installed, ORGANISATION_ID_FIELD)
        .with_retries(self.config.step_retries)
        .with_rate_limit_deferrals(self.config.max_rate_limit_deferrals);
        let engine = Arc::clone(self);
        runtime.register(refresh_config, move |context| {
            let engine = Arc::clone(&engine);
            async move { token::run_token_refresh(&engine, &context).await }
        });

        let installed_config = FunctionConfig::on_event(
            format!("{source}-app-installed"),
            EventKind::AppInstalled.wire_name(source),
        )
        .with_retries(self.config.step_retries);
        let engine = Arc::clone(self);
        runtime.register(installed_config, move |context| {
            let engine = Arc::clone(&engine);
            async move { handle_installed(&engine, &context).await }
        });

        let uninstalled_config =
            FunctionConfig::on_event(format!("{source}-app-uninstalled"), uninstalled)
                .with_retries(self.config.step_retries);
        let engine = Arc::clone(self);
        runtime.register(uninstalled_config, move |context| {
            let engine = Arc::clone(&engine);
            async move { handle_uninstalled(&engine, &context).await }
        });

        let scheduler_config = FunctionConfig::on_cron(
            format!("{source}-sync-scheduler"),
            self.config.sync_cron.clone(),
        );
        let engine = Arc::clone(self);
        runtime.register(scheduler_config, move |context| {
            let engine = Arc::clone(&engine);
            async move { scheduler::run_scheduled_syncs(&engine, &context).await }
        });
    }
}

/// A tenant finished installing: start its bootstrap sync and enter the
/// token refresh loop.
///
/// The OAuth callback persists the connection row before this event is
/// emitted, so a missing row means the tenant uninstalled again already.
async fn handle_installed(engine: &SyncEngine, context: &FunctionContext) -> EngineResult<()> {
    let payload: AppInstalled = context.event.payload()?;
    let organisation_id = payload.organisation_id;
    let step = &context.step;

    let connection = step
        .run("load-connection", || async {
            engine.store.get(organisation_id).await
        })
        .await?;
    let Some(connection) = connection else {
        warn!(%organisation_id, "Installed tenant has no connection row, skipping bootstrap");
        return Ok(());
    };
    info!(%organisation_id, region = %connection.region, "Tenant installed, starting bootstrap sync");

    let source = &engine.config.source;
    let sync = EventEnvelope::new(
        EventKind::UsersSyncRequested,
        source,
        &SyncRequested {
            organisation_id,
            region: connection.region.clone(),
            connection_id: connection.external_connection_id.clone(),
            is_first_sync: true,
            sync_started_at: Utc::now(),
            cursor: None,
        },
    )?;
    let refresh_margin = chrono::Duration::from_std(engine.config.refresh_margin)
        .unwrap_or_else(|_| chrono::Duration::zero());
    let refresh = EventEnvelope::new(
        EventKind::TokenRefreshRequested,
        source,
        &TokenRefreshRequested {
            organisation_id,
            expires_at: connection
                .token_expires_at
                .unwrap_or_else(|| Utc::now() + refresh_margin),
        },
    )?;
    step.send_event("start-bootstrap", vec![sync, refresh])?;
    Ok(())
}

/// A tenant uninstalled (or its connection became unusable): drop the
/// connection row. In-flight sync and refresh runs are cancelled by the
/// runtime through their cancel-on declarations.
async fn handle_uninstalled(engine: &SyncEngine, context: &FunctionContext) -> EngineResult<()> {
    let payload: AppUninstalled = context.event.payload()?;
    let organisation_id = payload.organisation_id;
    info!(
        %organisation_id,
        error_type = ?payload.error_type,
        "Tenant uninstalled, removing connection"
    );
    context
        .step
        .run("remove-connection", || async {
            engine.store.remove(organisation_id).await
        })
        .await
}
