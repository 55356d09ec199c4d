// ABOUTME: Main library entry point for the Lattice incremental sync engine
// ABOUTME: Exposes the connector seams, run handlers, and reference runtime
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

#![deny(unsafe_code)]

//! # Lattice Sync
//!
//! An incremental synchronization engine that mirrors user identities from
//! upstream providers into a central directory. The engine owns pagination,
//! stale-record deletion, error classification, token refresh, and
//! scheduling; a provider adapter only implements the
//! [`connector::IdentityConnector`] seam.
//!
//! ## Architecture
//!
//! - **Connector**: provider adapters (page fetch, normalization, refresh)
//! - **Orchestrator**: sync/delete run handlers built from durable steps
//! - **Classify**: rate-limit and unauthorized detection per provider
//! - **Runtime**: the durable-executor surface and an in-process reference
//!   implementation used by tests
//! - **Token / Scheduler**: refresh loop and the cron fan-out
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lattice_sync::classify::ClassifierRegistry;
//! use lattice_sync::config::EngineConfig;
//! use lattice_sync::credentials::StoreCredentialProvider;
//! use lattice_sync::engine::SyncEngine;
//! use lattice_sync::errors::EngineResult;
//! use lattice_sync::runtime::{MemoryRuntime, RuntimeConfig};
//! use lattice_sync::store::MemoryConnectionStore;
//!
//! # fn connector() -> Arc<dyn lattice_sync::connector::IdentityConnector> { unimplemented!() }
//! # fn sink() -> Arc<dyn lattice_sync::sink::DirectorySink> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> EngineResult<()> {
//!     let config = EngineConfig::from_env("gitlab")?;
//!     let store = Arc::new(MemoryConnectionStore::new());
//!     let credentials = Arc::new(StoreCredentialProvider::new(store.clone()));
//!     let classifiers = ClassifierRegistry::new(config.default_rate_limit_delay);
//!
//!     let engine = SyncEngine::new(config, connector(), classifiers, credentials, sink(), store)?;
//!     let runtime = MemoryRuntime::new(RuntimeConfig::default())?;
//!     engine.register(&runtime);
//!     runtime.start().await?;
//!     Ok(())
//! }
//! ```

/// Rate-limit and unauthorized classification of raw provider errors
pub mod classify;

/// Engine configuration, loaded from the environment
pub mod config;

/// The provider adapter seam and its registry
pub mod connector;

/// Credential resolution through an external broker or the local store
pub mod credentials;

/// Engine assembly and function registration
pub mod engine;

/// Error types for the engine
pub mod errors;

/// Event names and payloads on the wire
pub mod events;

/// Tracing subscriber setup
pub mod logging;

/// Tenant connections and normalized identities
pub mod models;

/// Sync and delete run handlers
pub mod orchestrator;

/// The sync run state machine
pub mod run_state;

/// The durable-executor surface and the in-process reference runtime
pub mod runtime;

/// Cron-triggered sync scheduling across tenants
pub mod scheduler;

/// The directory sink seam
pub mod sink;

/// Tenant connection persistence
pub mod store;

/// The token refresh loop
pub mod token;
