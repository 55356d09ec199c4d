// ABOUTME: Error-path tests: retry budgets, rate-limit deferrals, schema
// ABOUTME: drift, unauthorized propagation, and the delete fan-out
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

mod common;

use anyhow::Result;
use lattice_sync::config::EngineConfig;
use lattice_sync::connector::ProviderError;
use lattice_sync::events::ConnectionErrorType;
use lattice_sync::models::NormalizedIdentity;
use lattice_sync::runtime::RunStatus;
use lattice_sync::sink::DirectorySink;
use lattice_sync::store::ConnectionStore;

use common::{
    rate_limited_error, transient_error, unauthorized_error, MockConnector, TestHarness, SOURCE,
};

#[tokio::test]
async fn test_transient_failure_retries_then_succeeds() -> Result<()> {
    let connector = MockConnector::with_users(&[2]);
    connector.fail_fetch(None, transient_error(), 1);
    let harness = TestHarness::start(connector).await?;
    let connection = harness.add_tenant(0).await?;

    harness.publish_sync(&connection, false)?;
    harness.runtime.await_idle().await;

    assert_eq!(harness.connector.fetch_calls(), 2);
    assert_eq!(
        harness.sink.user_ids(connection.organisation_id),
        vec!["user-0", "user-1"]
    );
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-sync", RunStatus::Completed),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_persistent_transient_failure_exhausts_retry_budget() -> Result<()> {
    let connector = MockConnector::with_users(&[2]);
    // Test config allows 2 retries, so attempts 0..=2 all fail.
    connector.fail_fetch(None, transient_error(), 10);
    let harness = TestHarness::start(connector).await?;
    let connection = harness.add_tenant(0).await?;

    harness.publish_sync(&connection, false)?;
    harness.runtime.await_idle().await;

    assert_eq!(harness.connector.fetch_calls(), 3);
    assert!(harness.sink.user_ids(connection.organisation_id).is_empty());
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-sync", RunStatus::Failed),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_rate_limit_deferrals_do_not_consume_retry_budget() -> Result<()> {
    let connector = MockConnector::with_users(&[2]);
    // Three deferrals exceed the 2-retry budget; the run must still finish
    // because throttling is deferred, not retried.
    connector.fail_fetch(None, rate_limited_error(0), 3);
    let harness = TestHarness::start(connector).await?;
    let connection = harness.add_tenant(0).await?;

    harness.publish_sync(&connection, false)?;
    harness.runtime.await_idle().await;

    assert_eq!(harness.connector.fetch_calls(), 4);
    assert_eq!(
        harness.sink.user_ids(connection.organisation_id),
        vec!["user-0", "user-1"]
    );
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-sync", RunStatus::Completed),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_rate_limit_deferral_cap_fails_the_run() -> Result<()> {
    let connector = MockConnector::with_users(&[2]);
    connector.fail_fetch(None, rate_limited_error(0), 10);
    let harness = TestHarness::start(connector).await?;
    let connection = harness.add_tenant(0).await?;

    harness.publish_sync(&connection, false)?;
    harness.runtime.await_idle().await;

    // The test config allows 3 deferrals: the initial attempt plus three
    // deferred re-attempts, then the run fails.
    assert_eq!(harness.connector.fetch_calls(), 4);
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-sync", RunStatus::Failed),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_configured_deferral_cap_is_honored() -> Result<()> {
    let connector = MockConnector::with_users(&[2]);
    connector.fail_fetch(None, rate_limited_error(0), 10);
    let config = EngineConfig {
        max_rate_limit_deferrals: 1,
        ..EngineConfig::for_testing(SOURCE)
    };
    let harness = TestHarness::start_with_config(connector, config).await?;
    let connection = harness.add_tenant(0).await?;

    harness.publish_sync(&connection, false)?;
    harness.runtime.await_idle().await;

    // One deferral only: the initial attempt plus one deferred re-attempt.
    assert_eq!(harness.connector.fetch_calls(), 2);
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-sync", RunStatus::Failed),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_schema_drift_fails_without_retry() -> Result<()> {
    let connector = MockConnector::with_users(&[2]);
    connector.fail_fetch(None, ProviderError::schema_drift("items not an array"), 10);
    let harness = TestHarness::start(connector).await?;
    let connection = harness.add_tenant(0).await?;

    harness.publish_sync(&connection, false)?;
    harness.runtime.await_idle().await;

    assert_eq!(harness.connector.fetch_calls(), 1);
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-sync", RunStatus::Failed),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_unauthorized_fetch_propagates_exactly_once() -> Result<()> {
    let connector = MockConnector::with_users(&[2]);
    connector.fail_fetch(None, unauthorized_error(), 10);
    let harness = TestHarness::start(connector).await?;
    let connection = harness.add_tenant(0).await?;
    let organisation_id = connection.organisation_id;

    harness.publish_sync(&connection, false)?;
    harness.runtime.await_idle().await;

    // No retry on auth failures.
    assert_eq!(harness.connector.fetch_calls(), 1);
    assert_eq!(
        harness.sink.status_updates(),
        vec![(organisation_id, ConnectionErrorType::Unauthorized)]
    );
    // The emitted uninstall event tore the connection down.
    assert!(harness.store.get(organisation_id).await?.is_none());
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-sync", RunStatus::Failed),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_run_never_reaches_watermark_delete() -> Result<()> {
    let connector = MockConnector::with_users(&[2, 2]);
    connector.fail_fetch(Some("1"), transient_error(), 10);
    let harness = TestHarness::start(connector).await?;
    let connection = harness.add_tenant(0).await?;
    let organisation_id = connection.organisation_id;

    harness
        .sink
        .update_users(organisation_id, &[identity("pre-existing")])
        .await?;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    harness.publish_sync(&connection, false)?;
    harness.runtime.await_idle().await;

    // The continuation failed, so nothing was deleted even though the
    // pre-existing record is older than the watermark.
    let ids = harness.sink.user_ids(organisation_id);
    assert!(ids.contains(&"pre-existing".to_owned()), "ids: {ids:?}");
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-sync", RunStatus::Failed),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_delete_fanout_suspends_then_confirms() -> Result<()> {
    let connector = MockConnector::with_users(&[2]);
    let harness = TestHarness::start(connector).await?;
    let connection = harness.add_tenant(0).await?;
    let organisation_id = connection.organisation_id;

    harness
        .sink
        .update_users(
            organisation_id,
            &[identity("user-1"), identity("user-3"), identity("user-4")],
        )
        .await?;

    harness.publish_delete(&connection, &["user-1", "user-3"])?;
    harness.runtime.await_idle().await;

    assert_eq!(harness.connector.suspended_ids(), vec!["user-1", "user-3"]);
    assert_eq!(harness.sink.confirmed_deletes(), vec!["user-1", "user-3"]);
    assert_eq!(harness.sink.user_ids(organisation_id), vec!["user-4"]);
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-delete", RunStatus::Completed),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_delete_with_no_user_ids_is_a_noop() -> Result<()> {
    let connector = MockConnector::with_users(&[2]);
    let harness = TestHarness::start(connector).await?;
    let connection = harness.add_tenant(0).await?;

    harness.publish_delete(&connection, &[])?;
    harness.runtime.await_idle().await;

    assert!(harness.connector.suspended_ids().is_empty());
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-delete", RunStatus::Completed),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_delete_suspend_unauthorized_propagates() -> Result<()> {
    let connector = MockConnector::with_users(&[2]);
    connector.fail_suspend("user-2", unauthorized_error());
    let harness = TestHarness::start(connector).await?;
    let connection = harness.add_tenant(0).await?;
    let organisation_id = connection.organisation_id;

    harness.publish_delete(&connection, &["user-2"])?;
    harness.runtime.await_idle().await;

    assert_eq!(
        harness.sink.status_updates(),
        vec![(organisation_id, ConnectionErrorType::Unauthorized)]
    );
    assert!(harness.sink.confirmed_deletes().is_empty());
    assert_eq!(
        harness
            .runtime
            .count_with_status("mock-users-delete", RunStatus::Failed),
        1
    );
    Ok(())
}

fn identity(id: &str) -> NormalizedIdentity {
    NormalizedIdentity {
        provider_id: id.to_owned(),
        display_name: id.to_owned(),
        primary_email: None,
        additional_emails: Vec::new(),
        suspendable: true,
        profile_url: None,
        role_metadata: None,
    }
}
