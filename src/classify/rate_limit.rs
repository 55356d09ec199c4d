// ABOUTME: Rate-limit detection and deferred-retry delay computation
// ABOUTME: Handles Retry-After seconds and provider reset-epoch headers with clock-skew clamping
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::header::RETRY_AFTER;
use http::{HeaderMap, StatusCode};
use tracing::debug;

use crate::connector::ProviderError;

/// Format of a provider's rate-limit reset header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetFormat {
    /// Unix epoch in seconds (e.g. GitHub `X-RateLimit-Reset`)
    EpochSeconds,
    /// Unix epoch in milliseconds (e.g. Slack-style `reset` timestamps)
    EpochMillis,
}

/// Per-provider rate-limit parsing policy.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Additional header carrying a reset timestamp, checked after
    /// `Retry-After`
    pub reset_header: Option<String>,
    /// How the reset header's value is encoded
    pub reset_format: ResetFormat,
    /// Delay used when no header yields a usable value; also the floor for
    /// negative computed delays (clock skew)
    pub default_delay: Duration,
    /// Statuses treated as throttling
    pub statuses: Vec<StatusCode>,
}

impl RateLimitPolicy {
    /// Policy recognizing 429 with a standard `Retry-After` header
    #[must_use]
    pub fn new(default_delay: Duration) -> Self {
        Self {
            reset_header: None,
            reset_format: ResetFormat::EpochSeconds,
            default_delay,
            statuses: vec![StatusCode::TOO_MANY_REQUESTS],
        }
    }

    /// Add a provider-specific reset-epoch header
    #[must_use]
    pub fn with_reset_header(mut self, name: impl Into<String>, format: ResetFormat) -> Self {
        self.reset_header = Some(name.into());
        self.reset_format = format;
        self
    }

    /// Also treat the given status as throttling (some providers throttle
    /// with 503)
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.statuses.push(status);
        self
    }
}

/// Maps raw provider errors to deferred-retry delays.
#[derive(Debug, Clone)]
pub struct RateLimitClassifier {
    policy: RateLimitPolicy,
}

impl RateLimitClassifier {
    /// Create a classifier for one provider's policy
    #[must_use]
    pub const fn new(policy: RateLimitPolicy) -> Self {
        Self { policy }
    }

    /// Classify an error: `Some(delay)` when it is a rate limit.
    #[must_use]
    pub fn classify(&self, error: &ProviderError) -> Option<Duration> {
        self.classify_at(error, Utc::now())
    }

    /// Classification against an explicit clock, for deterministic tests.
    #[must_use]
    pub fn classify_at(&self, error: &ProviderError, now: DateTime<Utc>) -> Option<Duration> {
        let status = error.status?;
        if !self.policy.statuses.contains(&status) {
            return None;
        }
        let delay = self.delay_from_headers(&error.headers, now);
        debug!(status = %status, delay_secs = delay.as_secs(), "Classified rate limit");
        Some(delay)
    }

    fn delay_from_headers(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Duration {
        if let Some(secs) = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after_seconds)
        {
            return self.clamp(secs);
        }
        if let Some(reset_header) = &self.policy.reset_header {
            if let Some(epoch) = headers
                .get(reset_header.as_str())
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i64>().ok())
            {
                return self.delay_until_reset(epoch, now);
            }
        }
        self.policy.default_delay
    }

    /// Seconds until the reset epoch, clamped to the default floor when the
    /// reset is already in the past (clock skew between us and the provider).
    fn delay_until_reset(&self, epoch: i64, now: DateTime<Utc>) -> Duration {
        // Compare at the header's own resolution: a seconds-granularity reset
        // must not be shortened by the sub-second part of `now`.
        let delta_millis = match self.policy.reset_format {
            ResetFormat::EpochSeconds => {
                epoch.saturating_sub(now.timestamp()).saturating_mul(1000)
            }
            ResetFormat::EpochMillis => epoch.saturating_sub(now.timestamp_millis()),
        };
        if delta_millis <= 0 {
            return self.policy.default_delay;
        }
        Duration::from_millis(delta_millis as u64)
    }

    fn clamp(&self, delay: Duration) -> Duration {
        if delay.is_zero() {
            self.policy.default_delay
        } else {
            delay
        }
    }
}

/// Parse a `Retry-After` value in seconds form.
///
/// HTTP-date form is not supported; callers fall back to the default delay.
fn parse_retry_after_seconds(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
