//! Readiness waiting as seen through the lifecycle engine.

use service_fixtures::backend::{InMemoryBackend, Operation};
use service_fixtures::error::ErrorKind;
use service_fixtures::readiness::ProbeContext;
use service_fixtures::{EngineConfig, ReadinessProbe, Service, ServiceDefinition, SharedBackend};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

fn setup(definition: ServiceDefinition, config: EngineConfig) -> (Service, Arc<InMemoryBackend>) {
    let backend = Arc::new(InMemoryBackend::new());
    let shared = SharedBackend::from_backend(backend.clone(), config);
    (Service::new(definition, shared), backend)
}

fn quick_stop_config() -> EngineConfig {
    EngineConfig {
        default_stop_grace: Duration::from_millis(100),
        status_poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_hung_probe_fails_start_with_timeout() {
    let timeout = Duration::from_millis(200);
    let definition = ServiceDefinition::builder("kafka", "bitnami/kafka")
        .readiness(
            ReadinessProbe::new("hangs", |_| std::future::pending()),
            Some(timeout),
        )
        .build()
        .unwrap();
    let (service, backend) = setup(definition, quick_stop_config());

    let started = Instant::now();
    let err = service.start().await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::ReadinessTimeout);
    assert!(err.is_retryable());
    assert!(
        elapsed < timeout + Duration::from_secs(1),
        "timeout not honoured: {:?}",
        elapsed
    );
    assert!(!service.is_running().await.unwrap());
    assert!(backend.unit_ids().is_empty());
}

#[tokio::test]
async fn test_thread_blocking_probe_fails_start_with_timeout() {
    let timeout = Duration::from_millis(100);
    let definition = ServiceDefinition::builder("legacy", "acme/legacy")
        .readiness(
            ReadinessProbe::new("blocks", |_| async {
                std::thread::sleep(Duration::from_secs(3));
                Ok(())
            }),
            Some(timeout),
        )
        .build()
        .unwrap();
    let (service, backend) = setup(definition, quick_stop_config());

    let started = Instant::now();
    let err = service.start().await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::ReadinessTimeout);
    assert!(
        elapsed < timeout + Duration::from_secs(1),
        "blocking probe held start for {:?}",
        elapsed
    );
    assert!(backend.unit_ids().is_empty());
}

#[tokio::test]
async fn test_failing_probe_is_distinct_from_timeout() {
    let definition = ServiceDefinition::builder("api", "acme/api")
        .readiness(
            ReadinessProbe::new("crashes", |_| async {
                anyhow::bail!("service exited with code 1")
            }),
            Some(Duration::from_secs(5)),
        )
        .build()
        .unwrap();
    let (service, _backend) = setup(definition, quick_stop_config());

    let err = service.start().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ReadinessProbeFailed);
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("exited with code 1"));
}

#[tokio::test]
async fn test_default_readiness_timeout_comes_from_config() {
    let definition = ServiceDefinition::builder("slow", "acme/slow")
        .readiness(ReadinessProbe::new("hangs", |_| std::future::pending()), None)
        .build()
        .unwrap();
    let config = EngineConfig {
        default_readiness_timeout: Duration::from_millis(100),
        ..quick_stop_config()
    };
    let (service, _backend) = setup(definition, config);

    let err = service.start().await.unwrap_err();
    match err.root() {
        service_fixtures::Error::ReadinessTimeout { timeout, .. } => {
            assert_eq!(*timeout, Duration::from_millis(100));
        }
        other => panic!("expected readiness timeout, got {}", other),
    }
}

#[tokio::test]
async fn test_probe_sees_service_and_hostname() {
    let definition = ServiceDefinition::builder("pg", "postgres")
        .readiness(
            ReadinessProbe::new("inspects", |ctx: ProbeContext| async move {
                anyhow::ensure!(ctx.service == "pg", "wrong service {}", ctx.service);
                anyhow::ensure!(ctx.hostname == "localhost", "wrong host {}", ctx.hostname);
                Ok(())
            }),
            None,
        )
        .build()
        .unwrap();
    let (service, _backend) = setup(definition, quick_stop_config());

    service.start().await.unwrap();
    assert!(service.is_running().await.unwrap());
}

#[tokio::test]
async fn test_tcp_probe_waits_for_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let definition = ServiceDefinition::builder("echo", "acme/echo")
        .readiness(ReadinessProbe::tcp(port), Some(Duration::from_secs(5)))
        .build()
        .unwrap();
    let (service, _backend) = setup(definition, quick_stop_config());

    // The "service" starts listening a little after the unit starts.
    let listener_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let _ = listener.accept().await;
    });

    service.start().await.unwrap();
    listener_task.abort();
}

#[tokio::test]
async fn test_probe_runs_once_per_fresh_start_and_never_on_restore() {
    let probes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&probes);
    let definition = ServiceDefinition::builder("cache", "redis")
        .readiness(
            ReadinessProbe::new("counts", move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            None,
        )
        .snapshot(true)
        .build()
        .unwrap();
    let (service, backend) = setup(definition, quick_stop_config());

    service.start().await.unwrap();
    for _ in 0..3 {
        service.stop().await.unwrap();
        service.start().await.unwrap();
    }

    assert_eq!(probes.load(Ordering::SeqCst), 1);
    assert_eq!(backend.calls(Operation::SnapshotUnit), 1);
}
