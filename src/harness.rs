//! Test harness: start dependencies, run a test body, clean up.
//!
//! ```no_run
//! use service_fixtures::backend::SharedBackend;
//! use service_fixtures::harness::TestHarness;
//! use service_fixtures::service::{ServiceDefinition, ServiceRegistry};
//!
//! # async fn example() -> service_fixtures::Result<()> {
//! let registry = ServiceRegistry::new(SharedBackend::docker_from_env()?);
//! let redis = registry.get_or_create(ServiceDefinition::builder("redis", "redis").build()?);
//! let pg = registry.get_or_create(ServiceDefinition::builder("pg", "postgres:16").build()?);
//!
//! TestHarness::new("writes_through_cache")
//!     .depends_on(&pg, false)
//!     .depends_on(&redis, true)
//!     .run(|ctx| async move {
//!         tracing::info!("running {}", ctx.name);
//!         Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::service::Service;
use crate::trace::TraceContext;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::Instrument;

/// What the test body receives.
#[derive(Debug, Clone)]
pub struct TestContext {
    pub name: String,
    /// Ambient trace context, passed through untouched.
    pub trace: TraceContext,
}

#[derive(Debug)]
struct Dependency {
    service: Arc<Service>,
    cleanup: bool,
}

/// Dependencies of one test invocation, in declaration order.
#[derive(Debug)]
pub struct TestHarness {
    name: String,
    dependencies: Vec<Dependency>,
    trace: TraceContext,
}

impl TestHarness {
    /// New harness; the trace context is read from the process environment.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            trace: TraceContext::from_env(),
        }
    }

    pub fn with_trace_context(mut self, trace: TraceContext) -> Self {
        self.trace = trace;
        self
    }

    /// Declare a dependency. With `cleanup`, the service is stopped after the body.
    pub fn depends_on(mut self, service: &Arc<Service>, cleanup: bool) -> Self {
        self.dependencies.push(Dependency {
            service: Arc::clone(service),
            cleanup,
        });
        self
    }

    /// Ensure every dependency is running, run `body`, then stop the
    /// cleanup-flagged dependencies.
    ///
    /// Cleanup runs whether the body succeeds, fails or panics; a panic is
    /// resumed after cleanup. If a dependency fails to start the body is
    /// skipped, and the cleanup-flagged dependencies started before it are
    /// stopped.
    pub async fn run<F, Fut>(self, body: F) -> Result<()>
    where
        F: FnOnce(TestContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let span = tracing::info_span!(
            "integration_test",
            test = %self.name,
            component = "service-fixtures",
            trace_id = tracing::field::Empty,
        );
        if let Some(trace_id) = self.trace.trace_id() {
            span.record("trace_id", trace_id);
        }

        self.run_inner(body).instrument(span).await
    }

    async fn run_inner<F, Fut>(self, body: F) -> Result<()>
    where
        F: FnOnce(TestContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        for (index, dependency) in self.dependencies.iter().enumerate() {
            if let Err(e) = dependency.service.ensure_running().await {
                let failure = Error::DependencyFailed {
                    service: dependency.service.name().to_string(),
                    source: Box::new(e),
                };
                let cleanup_errors = self.cleanup(&self.dependencies[..index]).await;
                return Err(combine(failure, cleanup_errors));
            }
        }

        let ctx = TestContext {
            name: self.name.clone(),
            trace: self.trace.clone(),
        };
        let outcome = AssertUnwindSafe(async move { body(ctx).await })
            .catch_unwind()
            .await;

        let cleanup_errors = self.cleanup(&self.dependencies).await;

        match outcome {
            Ok(Ok(())) if cleanup_errors.is_empty() => Ok(()),
            Ok(Ok(())) => Err(Error::CleanupFailed(cleanup_errors)),
            Ok(Err(e)) => Err(combine(Error::TestFailed(e), cleanup_errors)),
            Err(panic) => {
                for e in &cleanup_errors {
                    tracing::error!("Cleanup after panicking test '{}' failed: {}", self.name, e);
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Stop every cleanup-flagged dependency in `dependencies`, in order.
    async fn cleanup(&self, dependencies: &[Dependency]) -> Vec<Error> {
        let mut errors = Vec::new();
        for dependency in dependencies.iter().filter(|d| d.cleanup) {
            if let Err(e) = dependency.service.stop().await {
                tracing::warn!(
                    "Failed to stop '{}' after test '{}': {}",
                    dependency.service.name(),
                    self.name,
                    e
                );
                errors.push(e);
            }
        }
        errors
    }
}

fn combine(primary: Error, cleanup_errors: Vec<Error>) -> Error {
    if cleanup_errors.is_empty() {
        primary
    } else {
        Error::Multiple(vec![primary, Error::CleanupFailed(cleanup_errors)])
    }
}
