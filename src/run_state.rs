// ABOUTME: Pure sync-run state machine: Fetching -> Continuing -> ... -> Finalizing -> Completed
// ABOUTME: Each invocation is a pure function of event payload plus page outcome
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::fmt::{Display, Formatter, Result as FmtResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::SyncRequested;
use crate::models::OrganisationId;

/// Lifecycle status of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    /// Fetching the current page
    Fetching,
    /// A continuation event has been emitted for the next page
    Continuing,
    /// Pagination terminated; stale-record deletion in progress
    Finalizing,
    /// Run finished, watermark deletion applied
    Completed,
    /// Run cancelled by a matching install/uninstall event
    Cancelled,
    /// Retry budget exhausted on an unclassified error
    Failed,
}

impl Display for SyncRunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            Self::Fetching => "fetching",
            Self::Continuing => "continuing",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// The full state of one sync run, carried in event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    /// Tenant being synced
    pub organisation_id: OrganisationId,
    /// Tenant region
    pub region: String,
    /// Credential broker connection id
    pub connection_id: String,
    /// Bootstrap sync flag (continuations inherit it)
    pub is_first_sync: bool,
    /// Deletion watermark, fixed when the run started
    pub sync_started_at: DateTime<Utc>,
    /// Cursor of the page this invocation fetches
    pub cursor: Option<String>,
    /// Current status
    pub status: SyncRunStatus,
}

/// What the state machine decides after a page has been processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTransition {
    /// Emit a continuation event carrying the next cursor; the watermark and
    /// first-sync flag travel unchanged
    Continue(SyncRun),
    /// Pagination provably terminated: delete records synced before the
    /// watermark, then mark the run completed
    Finalize,
}

impl SyncRun {
    /// Reconstruct run state from a sync-requested event payload.
    #[must_use]
    pub fn from_event(event: &SyncRequested) -> Self {
        Self {
            organisation_id: event.organisation_id,
            region: event.region.clone(),
            connection_id: event.connection_id.clone(),
            is_first_sync: event.is_first_sync,
            sync_started_at: event.sync_started_at,
            cursor: event.cursor.clone(),
            status: SyncRunStatus::Fetching,
        }
    }

    /// Decide the next transition after the current page was upserted.
    ///
    /// This is the only place a run may move toward deletion: `Finalize` is
    /// returned exactly when the provider reports no further cursor.
    #[must_use]
    pub fn advance(&self, next_cursor: Option<String>) -> RunTransition {
        next_cursor.map_or(RunTransition::Finalize, |cursor| {
            RunTransition::Continue(Self {
                cursor: Some(cursor),
                status: SyncRunStatus::Continuing,
                ..self.clone()
            })
        })
    }

    /// The continuation event payload for a `Continue` transition.
    #[must_use]
    pub fn to_event(&self) -> SyncRequested {
        SyncRequested {
            organisation_id: self.organisation_id,
            region: self.region.clone(),
            connection_id: self.connection_id.clone(),
            is_first_sync: self.is_first_sync,
            sync_started_at: self.sync_started_at,
            cursor: self.cursor.clone(),
        }
    }
}
