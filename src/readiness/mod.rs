//! Readiness detection.
//!
//! A [`ReadinessProbe`] is a caller-supplied async check. [`wait_ready`] runs
//! it on its own thread and races it against a timeout, so a probe that hangs
//! or blocks can't hold up the lifecycle engine past the deadline.

mod probes;

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub use probes::poll_until;

type ProbeFn = Arc<dyn Fn(ProbeContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// What a probe knows about the service it is checking.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub service: String,
    /// Address the service is reachable on (`localhost` on the host network).
    pub hostname: String,
    /// Cancelled once the waiter gives up. Probes that loop should watch it.
    pub cancel: CancellationToken,
}

/// A readiness check for a service.
///
/// The probe resolves `Ok(())` once the service accepts work and `Err` if it
/// never will. Built-in probes poll until they succeed or are cancelled;
/// custom probes may do the same with [`poll_until`].
#[derive(Clone)]
pub struct ReadinessProbe {
    label: String,
    probe: ProbeFn,
}

impl ReadinessProbe {
    pub fn new<F, Fut>(label: impl Into<String>, probe: F) -> Self
    where
        F: Fn(ProbeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            probe: Arc::new(move |ctx| Box::pin(probe(ctx))),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn call(&self, ctx: ProbeContext) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.probe)(ctx)
    }
}

impl fmt::Debug for ReadinessProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessProbe")
            .field("label", &self.label)
            .finish()
    }
}

/// Result of waiting for a probe.
#[derive(Debug)]
pub enum ReadinessOutcome {
    Ready,
    /// The probe finished with an error (or panicked).
    Failed(anyhow::Error),
    /// The probe didn't finish in time. Its eventual result is discarded.
    TimedOut,
}

impl ReadinessOutcome {
    /// Map to the engine's error kinds, keeping timeout and failure distinct.
    pub fn into_result(self, service: &str, timeout: Duration) -> Result<()> {
        match self {
            ReadinessOutcome::Ready => Ok(()),
            ReadinessOutcome::Failed(cause) => Err(Error::ReadinessProbeFailed {
                service: service.to_string(),
                cause,
            }),
            ReadinessOutcome::TimedOut => Err(Error::ReadinessTimeout {
                service: service.to_string(),
                timeout,
            }),
        }
    }
}

/// Run `probe` on its own thread and wait at most `timeout` for it.
///
/// The probe gets a dedicated OS thread with a current-thread runtime, so a
/// probe that blocks its thread can't stall the caller's timer. It is not
/// aborted on timeout; its cancellation token is triggered and whatever it
/// returns later is dropped.
pub async fn wait_ready(
    probe: &ReadinessProbe,
    ctx: ProbeContext,
    timeout: Duration,
) -> ReadinessOutcome {
    let cancel = ctx.cancel.clone();
    let label = probe.label.clone();
    let rx = match spawn_probe(probe, ctx) {
        Ok(rx) => rx,
        Err(e) => {
            return ReadinessOutcome::Failed(anyhow::anyhow!(
                "failed to spawn probe '{}': {}",
                label,
                e
            ))
        }
    };

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Ok(()))) => ReadinessOutcome::Ready,
        Ok(Ok(Err(e))) => ReadinessOutcome::Failed(e),
        Ok(Err(_)) => {
            ReadinessOutcome::Failed(anyhow::anyhow!("probe '{}' panicked", label))
        }
        Err(_) => {
            tracing::debug!("Readiness probe '{}' timed out after {:?}", label, timeout);
            cancel.cancel();
            ReadinessOutcome::TimedOut
        }
    }
}

/// Start the probe on a named thread. The receiver errors if the probe panics.
fn spawn_probe(
    probe: &ReadinessProbe,
    ctx: ProbeContext,
) -> std::io::Result<oneshot::Receiver<anyhow::Result<()>>> {
    let (tx, rx) = oneshot::channel();
    let future = probe.call(ctx);
    std::thread::Builder::new()
        .name(format!("probe-{}", probe.label))
        .spawn(move || {
            let result = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(future),
                Err(e) => Err(anyhow::anyhow!("failed to build probe runtime: {}", e)),
            };
            // The waiter may have timed out and dropped the receiver.
            let _ = tx.send(result);
        })?;
    Ok(rx)
}
