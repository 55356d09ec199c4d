// ABOUTME: Durable-executor surface: function declarations, run records, and runtime config
// ABOUTME: The production runtime is external; this crate ships an in-process reference
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

//! # Execution Runtime Surface
//!
//! Engine functions are declared against a durable, event-driven step
//! executor: memoized steps, event emission, sleep-until suspension, keyed
//! concurrency limits, cancellation-on-event, and a retry budget. In
//! production that executor is external infrastructure; [`MemoryRuntime`]
//! implements the same surface in-process so the engine's semantics are
//! exercised under at-least-once delivery, cancellation, and concurrency
//! keying in tests and local development.

pub mod memory;
pub mod step;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::events::EventEnvelope;

pub use memory::MemoryRuntime;
pub use step::Step;

/// Keyed concurrency limit for a function.
///
/// At most `limit` runs of the function execute concurrently per distinct
/// value of `key_field` in the trigger payload; further runs queue.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    /// Payload field whose value forms the concurrency key
    pub key_field: String,
    /// Maximum concurrent runs per key value
    pub limit: usize,
}

/// Cancel in-flight runs when a matching event arrives.
#[derive(Debug, Clone)]
pub struct CancelOn {
    /// Wire name of the cancelling event
    pub event: String,
    /// Payload field that must be equal in both events for the cancellation
    /// to apply
    pub match_field: String,
}

/// What starts a function.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Runs on every event with this wire name
    Event {
        /// Wire name of the triggering event
        name: String,
    },
    /// Runs on a fixed schedule
    Cron {
        /// Cron expression (evaluated by the production runtime; the
        /// reference runtime fires it via [`MemoryRuntime::invoke_cron`])
        expr: String,
    },
}

/// Declaration of one engine function.
#[derive(Debug, Clone)]
pub struct FunctionConfig {
    /// Unique function id
    pub id: String,
    /// Trigger
    pub trigger: Trigger,
    /// Optional keyed concurrency limit
    pub concurrency: Option<ConcurrencyLimit>,
    /// Events that cancel in-flight runs of this function
    pub cancel_on: Vec<CancelOn>,
    /// Ordinary retry budget
    pub retries: u32,
    /// Cap on rate-limit deferrals per run; deferrals do not consume the
    /// ordinary retry budget
    pub max_rate_limit_deferrals: u32,
    /// Boolean payload field that boosts dispatch priority when true
    /// (bootstrap syncs finish ahead of routine ones)
    pub priority_field: Option<String>,
}

impl FunctionConfig {
    /// Declare an event-triggered function
    #[must_use]
    pub fn on_event(id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger: Trigger::Event {
                name: event_name.into(),
            },
            concurrency: None,
            cancel_on: Vec::new(),
            retries: 3,
            max_rate_limit_deferrals: 10,
            priority_field: None,
        }
    }

    /// Declare a cron-triggered function
    #[must_use]
    pub fn on_cron(id: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger: Trigger::Cron { expr: expr.into() },
            concurrency: None,
            cancel_on: Vec::new(),
            retries: 3,
            max_rate_limit_deferrals: 10,
            priority_field: None,
        }
    }

    /// Set a keyed concurrency limit
    #[must_use]
    pub fn with_concurrency(mut self, key_field: impl Into<String>, limit: usize) -> Self {
        self.concurrency = Some(ConcurrencyLimit {
            key_field: key_field.into(),
            limit,
        });
        self
    }

    /// Add a cancelling event
    #[must_use]
    pub fn with_cancel_on(
        mut self,
        event: impl Into<String>,
        match_field: impl Into<String>,
    ) -> Self {
        self.cancel_on.push(CancelOn {
            event: event.into(),
            match_field: match_field.into(),
        });
        self
    }

    /// Set the ordinary retry budget
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the rate-limit deferral cap
    #[must_use]
    pub const fn with_rate_limit_deferrals(mut self, cap: u32) -> Self {
        self.max_rate_limit_deferrals = cap;
        self
    }

    /// Boost priority when the given boolean payload field is true
    #[must_use]
    pub fn with_priority_field(mut self, field: impl Into<String>) -> Self {
        self.priority_field = Some(field.into());
        self
    }
}

/// Input to one function invocation.
pub struct FunctionContext {
    /// The triggering event
    pub event: EventEnvelope,
    /// Step handle for memoized steps, sleeps, and event emission
    pub step: Step,
    /// Zero-based ordinary-retry attempt number
    pub attempt: u32,
}

/// Boxed function handler stored in the registry.
pub type FunctionHandler =
    Arc<dyn Fn(FunctionContext) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>;

/// Terminal or live status of one function run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Still executing (or queued on a concurrency permit)
    Running,
    /// Handler returned success
    Completed,
    /// Non-retriable error, or retry/deferral budget exhausted
    Failed,
    /// Cancelled by a matching event
    Cancelled,
}

/// Bookkeeping record for one run, inspectable by tests.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Run id
    pub id: Uuid,
    /// Function that ran
    pub function_id: String,
    /// Wire name of the triggering event
    pub event_name: String,
    /// Current status
    pub status: RunStatus,
    /// Terminal error, for failed runs
    pub error: Option<String>,
}

/// Tuning for the reference runtime's retry behavior.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base delay for ordinary-retry exponential backoff
    pub base_retry_delay: Duration,
    /// Cap on the ordinary-retry backoff delay
    pub max_retry_delay: Duration,
    /// Jitter as a fraction of the computed delay, in `[0.0, 1.0]`
    pub jitter_factor: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_secs(300),
            jitter_factor: 0.25,
        }
    }
}

impl RuntimeConfig {
    /// Configuration with short delays for tests
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            base_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(100),
            jitter_factor: 0.0,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when a value is outside its allowed range.
    pub fn validate(&self) -> EngineResult<()> {
        if self.base_retry_delay.is_zero() {
            return Err(EngineError::config("base_retry_delay must be > 0"));
        }
        if self.max_retry_delay < self.base_retry_delay {
            return Err(EngineError::config(
                "max_retry_delay must be >= base_retry_delay",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(EngineError::config("jitter_factor must be in [0.0, 1.0]"));
        }
        Ok(())
    }
}
