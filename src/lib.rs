#![allow(unused_assignments)]

//! # Service Fixtures
//!
//! Short-lived, containerized dependency services for integration tests.
//!
//! ## Features
//!
//! - **Lifecycle Engine**: Pull, create, start, wait for readiness, run setup, stop and clean up
//! - **Idempotent Starts**: Concurrent `ensure_running` calls provision a service at most once
//! - **Checkpoint/Restore**: Snapshot a service after its first start and restore it on later starts
//! - **Bounded Waits**: Readiness probes and graceful stops never outlive their timeouts
//! - **Test Harness**: Declare dependencies per test, with cleanup that also runs on panic
//! - **Pluggable Backends**: Docker CLI backend, plus an in-memory backend for fast tests
//!
//! ## Quick Start
//!
//! ```no_run
//! use service_fixtures::{ReadinessProbe, ServiceDefinition, ServiceRegistry, SharedBackend, TestHarness};
//! use std::time::Duration;
//!
//! # async fn example() -> service_fixtures::Result<()> {
//! service_fixtures::logging::init();
//!
//! let registry = ServiceRegistry::new(SharedBackend::docker_from_env()?);
//! let postgres = registry.get_or_create(
//!     ServiceDefinition::builder("postgres", "postgres:16")
//!         .env("POSTGRES_PASSWORD", "test")
//!         .readiness(ReadinessProbe::tcp(5432), Some(Duration::from_secs(30)))
//!         .snapshot(true)
//!         .build()?,
//! );
//!
//! TestHarness::new("inserts_rows")
//!     .depends_on(&postgres, true)
//!     .run(|_ctx| async move {
//!         // talk to localhost:5432
//!         Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - Each [`Service`] guards its runtime handles with one async lock held for
//!   the whole of every transition, backend calls included
//! - Distinct services provision in parallel
//! - The backend connection is shared and established once, on first use
//! - There is no coordination across processes

pub mod backend;
pub mod config;
pub mod error;
pub mod harness;
pub mod logging;
pub mod readiness;
pub mod service;
pub mod snapshot;
pub mod trace;

// Re-export commonly used types
pub use backend::{InMemoryBackend, Mount, NetworkMode, RuntimeBackend, SharedBackend};
pub use config::EngineConfig;
pub use error::{Error, ErrorKind, Result};
pub use harness::{TestContext, TestHarness};
pub use readiness::ReadinessProbe;
pub use service::{Service, ServiceDefinition, ServiceRegistry};
pub use trace::{TraceContext, TraceSink};
