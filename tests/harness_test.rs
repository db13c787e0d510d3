//! Test harness behaviour: ordering, cleanup flags, reuse across runs.

use parking_lot::Mutex;
use service_fixtures::backend::{InMemoryBackend, Operation};
use service_fixtures::error::ErrorKind;
use service_fixtures::service::ServiceContext;
use service_fixtures::{
    EngineConfig, ServiceDefinition, ServiceRegistry, SharedBackend, TestHarness, TraceContext,
};
use std::sync::Arc;
use std::time::Duration;

fn registry() -> (ServiceRegistry, Arc<InMemoryBackend>) {
    let backend = Arc::new(InMemoryBackend::new());
    let config = EngineConfig {
        default_stop_grace: Duration::from_millis(100),
        status_poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    (
        ServiceRegistry::new(SharedBackend::from_backend(backend.clone(), config)),
        backend,
    )
}

fn recording_definition(name: &str, log: &Arc<Mutex<Vec<String>>>) -> ServiceDefinition {
    let log = Arc::clone(log);
    ServiceDefinition::builder(name, "redis")
        .setup(move |ctx: ServiceContext| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(ctx.name);
                Ok(())
            }
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_failing_body_stops_only_cleanup_dependencies() {
    let (registry, backend) = registry();
    let a = registry.get_or_create(ServiceDefinition::builder("a", "redis").build().unwrap());
    let b = registry.get_or_create(ServiceDefinition::builder("b", "postgres").build().unwrap());

    let err = TestHarness::new("fails")
        .depends_on(&a, true)
        .depends_on(&b, false)
        .run(|_| async { anyhow::bail!("expected 3 rows, got 2") })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TestFailed);
    assert!(err.to_string().contains("expected 3 rows"));
    assert!(!a.is_running().await.unwrap());
    assert!(b.is_running().await.unwrap());

    let sandboxes_before = backend.calls(Operation::CreateSandbox);
    TestHarness::new("reuses_b")
        .depends_on(&b, false)
        .run(|_| async { Ok(()) })
        .await
        .unwrap();

    assert_eq!(backend.calls(Operation::CreateSandbox), sandboxes_before);
    assert_eq!(backend.calls(Operation::CreateUnit), 2);
    assert!(b.is_running().await.unwrap());
}

#[tokio::test]
async fn test_dependencies_start_and_stop_in_declaration_order() {
    let (registry, backend) = registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    let names = ["zookeeper", "kafka", "schema-registry"];
    let services: Vec<_> = names
        .iter()
        .map(|name| registry.get_or_create(recording_definition(name, &log)))
        .collect();

    let mut harness = TestHarness::new("ordered");
    for service in &services {
        harness = harness.depends_on(service, true);
    }
    harness.run(|_| async { Ok(()) }).await.unwrap();

    assert_eq!(*log.lock(), names.to_vec());

    let stop_order: Vec<String> = backend
        .signals()
        .into_iter()
        .map(|(unit_id, _)| unit_id)
        .collect();
    assert_eq!(stop_order.len(), 3);
    for (unit_id, name) in stop_order.iter().zip(names) {
        assert!(
            unit_id.starts_with(name),
            "unit {} stopped out of order (expected {})",
            unit_id,
            name
        );
    }
}

#[tokio::test]
async fn test_body_sees_all_dependencies_running() {
    let (registry, _backend) = registry();
    let a = registry.get_or_create(ServiceDefinition::builder("a", "redis").build().unwrap());
    let b = registry.get_or_create(ServiceDefinition::builder("b", "redis").build().unwrap());

    let (a2, b2) = (Arc::clone(&a), Arc::clone(&b));
    TestHarness::new("observes")
        .depends_on(&a, true)
        .depends_on(&b, true)
        .run(|_| async move {
            anyhow::ensure!(a2.is_running().await?, "a not running");
            anyhow::ensure!(b2.is_running().await?, "b not running");
            Ok(())
        })
        .await
        .unwrap();

    assert!(!a.is_running().await.unwrap());
    assert!(!b.is_running().await.unwrap());
}

#[tokio::test]
async fn test_failed_dependency_cleans_up_earlier_ones() {
    let (registry, backend) = registry();
    let a = registry.get_or_create(ServiceDefinition::builder("a", "redis").build().unwrap());
    let b = registry.get_or_create(ServiceDefinition::builder("b", "redis").build().unwrap());
    let c = registry.get_or_create(ServiceDefinition::builder("c", "redis").build().unwrap());

    // a and c never fail; b's sandbox creation does.
    a.ensure_running().await.unwrap();
    backend.fail_next(Operation::CreateSandbox, "port already allocated");

    let ran = Arc::new(Mutex::new(false));
    let ran_flag = Arc::clone(&ran);
    let err = TestHarness::new("dependency_breaks")
        .depends_on(&a, true)
        .depends_on(&b, true)
        .depends_on(&c, true)
        .run(|_| async move {
            *ran_flag.lock() = true;
            Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DependencyFailed);
    assert!(!*ran.lock());
    assert!(!a.is_running().await.unwrap());
    assert!(!c.is_running().await.unwrap());
    match err {
        service_fixtures::Error::DependencyFailed { service, source } => {
            assert_eq!(service, "b");
            assert_eq!(source.kind(), ErrorKind::ProvisionFailed);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_cleanup_failure_reported_after_passing_body() {
    let (registry, backend) = registry();
    let a = registry.get_or_create(ServiceDefinition::builder("a", "redis").build().unwrap());
    a.ensure_running().await.unwrap();
    backend.fail_next(Operation::DeleteUnit, "device or resource busy");

    let err = TestHarness::new("cleanup_fails")
        .depends_on(&a, true)
        .run(|_| async { Ok(()) })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CleanupFailed);
    assert!(err.to_string().contains("device or resource busy"));
}

#[tokio::test]
async fn test_trace_context_is_passed_through() {
    let (registry, _backend) = registry();
    let a = registry.get_or_create(ServiceDefinition::builder("a", "redis").build().unwrap());
    let trace = TraceContext::from_vars([
        ("FIXTURES_TRACECTX_TRACE_ID", "4bf92f3577b34da6a3ce929d0e0e4736"),
        ("FIXTURES_TRACECTX_PARENT_SPAN", "00f067aa0ba902b7"),
        ("UNRELATED", "ignored"),
    ]);
    let expected = trace.clone();

    TestHarness::new("traced")
        .with_trace_context(trace)
        .depends_on(&a, false)
        .run(|ctx| async move {
            anyhow::ensure!(ctx.trace == expected, "trace context changed");
            anyhow::ensure!(ctx.trace.get("unrelated").is_none());
            Ok(())
        })
        .await
        .unwrap();
}
