// ABOUTME: Tracing subscriber setup with env-filter overrides
// ABOUTME: Defaults come from the caller; RUST_LOG always wins
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::{EngineError, EngineResult};

/// Initialize the global tracing subscriber.
///
/// `default_filter` is a directive like `"info,lattice_sync=debug"`; the
/// `RUST_LOG` environment variable overrides it when set.
///
/// # Errors
///
/// Returns an error when the filter directive is invalid or a subscriber is
/// already installed.
pub fn init(default_filter: &str) -> EngineResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| EngineError::config(format!("Invalid log filter: {e}")))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| EngineError::config(format!("Failed to install subscriber: {e}")))?;
    Ok(())
}
