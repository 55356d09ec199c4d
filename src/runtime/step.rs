// ABOUTME: Memoized step handle given to function handlers
// ABOUTME: Completed steps replay from memo across re-invocations of the same run
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::trace;

use crate::errors::{EngineError, EngineResult};
use crate::events::EventEnvelope;
use crate::runtime::memory::EventSender;

/// Step handle for one run.
///
/// A run may be re-invoked after a retriable failure or a rate-limit
/// deferral; steps that already succeeded return their recorded result
/// instead of executing again. This is what makes at-least-once delivery
/// safe: side effects live inside steps, and each named step's effect
/// happens at most once per run.
///
/// Cancellation is cooperative and checked at step boundaries, never
/// mid-step.
#[derive(Clone)]
pub struct Step {
    memo: Arc<DashMap<String, serde_json::Value>>,
    sender: EventSender,
    cancel: watch::Receiver<bool>,
}

impl Step {
    pub(crate) fn new(
        memo: Arc<DashMap<String, serde_json::Value>>,
        sender: EventSender,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            memo,
            sender,
            cancel,
        }
    }

    /// Run a named, memoized step.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cancelled`] when the run was cancelled, the
    /// closure's error on failure (nothing is recorded), or a serialization
    /// error if the result cannot be memoized.
    pub async fn run<T, F, Fut>(&self, name: &str, f: F) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = EngineResult<T>> + Send,
    {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(recorded) = self.memo.get(name) {
            trace!(step = name, "Replaying memoized step");
            return Ok(serde_json::from_value(recorded.clone())?);
        }
        let value = f().await?;
        self.memo
            .insert(name.to_owned(), serde_json::to_value(&value)?);
        Ok(value)
    }

    /// Suspend until the given instant. Memoized: a re-invoked run that
    /// already slept does not sleep again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cancelled`] when cancelled before or during
    /// the sleep.
    pub async fn sleep_until(&self, name: &str, until: DateTime<Utc>) -> EngineResult<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.memo.contains_key(name) {
            return Ok(());
        }
        let duration = (until - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        trace!(step = name, secs = duration.as_secs(), "Sleeping until wake");
        self.cancellable_sleep(duration).await?;
        self.memo
            .insert(name.to_owned(), serde_json::Value::Bool(true));
        Ok(())
    }

    /// Emit events. Memoized: a re-invoked run emits each named batch at
    /// most once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cancelled`] when the run was cancelled.
    pub fn send_event(&self, name: &str, events: Vec<EventEnvelope>) -> EngineResult<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.memo.contains_key(name) {
            return Ok(());
        }
        for event in events {
            self.sender.send(event);
        }
        self.memo
            .insert(name.to_owned(), serde_json::Value::Bool(true));
        Ok(())
    }

    /// Whether a cancellation signal has been delivered
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn cancellable_sleep(&self, duration: Duration) -> EngineResult<()> {
        let mut cancel = self.cancel.clone();
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return Ok(()),
                changed = cancel.changed() => match changed {
                    Ok(()) if *cancel.borrow() => return Err(EngineError::Cancelled),
                    Ok(()) => {}
                    Err(_) => {
                        // Cancellation source gone; finish the sleep.
                        sleep.as_mut().await;
                        return Ok(());
                    }
                },
            }
        }
    }
}
