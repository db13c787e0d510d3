//! Service definitions and the lifecycle engine.
//!
//! - [`ServiceDefinition`]: immutable description built with a builder
//! - [`Service`]: the engine owning one service's runtime handles
//! - [`ServiceRegistry`]: process-level cache of engines by name
//!
//! # Example
//!
//! ```no_run
//! use service_fixtures::backend::SharedBackend;
//! use service_fixtures::readiness::ReadinessProbe;
//! use service_fixtures::service::{Service, ServiceDefinition};
//! use std::time::Duration;
//!
//! # async fn example() -> service_fixtures::Result<()> {
//! let backend = SharedBackend::docker_from_env()?;
//! let redis = ServiceDefinition::builder("redis", "redis:7")
//!     .readiness(ReadinessProbe::tcp(6379), Some(Duration::from_secs(20)))
//!     .snapshot(true)
//!     .build()?;
//!
//! let service = Service::new(redis, backend);
//! service.ensure_running().await?;
//! let host = service.hostname().await?;
//! # let _ = host;
//! service.stop().await?;
//! # Ok(())
//! # }
//! ```

mod definition;
mod engine;
mod image_ref;
mod naming;
mod registry;
mod state;

pub use definition::{ServiceContext, ServiceDefinition, ServiceDefinitionBuilder, SetupFn};
pub use engine::Service;
pub use image_ref::canonicalize_image_ref;
pub use naming::IdentityPolicy;
pub use registry::ServiceRegistry;
pub use state::RuntimeSnapshot;

pub(crate) use naming::fnv1a_64;
