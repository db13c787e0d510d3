/// Property-based tests for the service lifecycle state machine
///
/// These tests use proptest to generate random sequences of lifecycle calls
/// and verify invariants hold after every step:
/// - A held unit is exactly what the backend knows about
/// - Without snapshotting, a stopped service holds no sandbox and never a snapshot
/// - A snapshot is only ever held together with its sandbox
/// - At most one unit and one sandbox exist per service
use proptest::prelude::*;
use service_fixtures::backend::{InMemoryBackend, Operation};
use service_fixtures::service::RuntimeSnapshot;
use service_fixtures::{EngineConfig, Service, ServiceDefinition, SharedBackend};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle calls for property-based testing
#[derive(Debug, Clone)]
enum Step {
    Start,
    EnsureRunning,
    Stop,
    Restore,
    Teardown,
    /// The unit exits on its own
    Crash,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Start),
        3 => Just(Step::EnsureRunning),
        3 => Just(Step::Stop),
        1 => Just(Step::Restore),
        1 => Just(Step::Teardown),
        1 => Just(Step::Crash),
    ]
}

fn setup(snapshot: bool) -> (Service, Arc<InMemoryBackend>) {
    let backend = Arc::new(InMemoryBackend::new());
    let config = EngineConfig {
        default_stop_grace: Duration::from_millis(20),
        status_poll_interval: Duration::from_millis(1),
        ..EngineConfig::default()
    };
    let definition = ServiceDefinition::builder("svc", "redis")
        .snapshot(snapshot)
        .build()
        .expect("valid definition");
    let shared = SharedBackend::from_backend(backend.clone(), config);
    (Service::new(definition, shared), backend)
}

/// Apply a step, ignoring errors
/// (restore without a snapshot is expected to fail)
async fn apply_step(service: &Service, backend: &InMemoryBackend, step: &Step) {
    match step {
        Step::Start => {
            let _ = service.start().await;
        }
        Step::EnsureRunning => {
            let _ = service.ensure_running().await;
        }
        Step::Stop => {
            let _ = service.stop().await;
        }
        Step::Restore => {
            let _ = service.restore().await;
        }
        Step::Teardown => {
            let _ = service.teardown().await;
        }
        Step::Crash => {
            if let Some(task) = service.snapshot_state().await.task {
                backend.crash_unit(&task.id);
            }
        }
    }
}

fn check_invariants(
    state: &RuntimeSnapshot,
    backend: &InMemoryBackend,
    snapshot_enabled: bool,
    step: &Step,
) {
    // Invariant 1: the held unit exists in the backend, and nothing else does
    let units = backend.unit_ids();
    match &state.task {
        Some(task) => assert_eq!(units, vec![task.id.clone()], "after {:?}", step),
        None => assert!(units.is_empty(), "leaked units {:?} after {:?}", units, step),
    }

    // Invariant 2: snapshotting disabled never sets a snapshot
    if !snapshot_enabled {
        assert!(state.snapshot.is_none(), "snapshot set while disabled");
    }

    // Invariant 3: without snapshotting, the sandbox goes away with the unit
    if !snapshot_enabled && state.task.is_none() {
        assert!(state.container.is_none(), "sandbox kept after {:?}", step);
    }

    // Invariant 4: a snapshot always has a sandbox to restore into
    if state.snapshot.is_some() {
        assert!(state.container.is_some(), "snapshot without sandbox");
    }

    // Invariant 5: one service, at most one sandbox
    assert!(backend.sandbox_count() <= 1);
    assert_eq!(backend.sandbox_count(), usize::from(state.container.is_some()));
}

proptest! {
    /// Property test: random lifecycle sequences keep the runtime state consistent
    #[test]
    fn test_lifecycle_invariants(
        snapshot in prop::bool::ANY,
        steps in prop::collection::vec(step_strategy(), 5..40)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (service, backend) = setup(snapshot);

            for step in &steps {
                apply_step(&service, &backend, step).await;
                let state = service.snapshot_state().await;
                check_invariants(&state, &backend, snapshot, step);
            }
        });
    }

    /// Property test: a running service never re-provisions on repeated starts
    #[test]
    fn test_repeated_starts_provision_once(
        snapshot in prop::bool::ANY,
        calls in prop::collection::vec(prop::bool::ANY, 1..20)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (service, backend) = setup(snapshot);

            for use_ensure in &calls {
                if *use_ensure {
                    service.ensure_running().await.unwrap();
                } else {
                    service.start().await.unwrap();
                }
            }

            assert_eq!(backend.calls(Operation::Pull), 1);
            assert_eq!(backend.calls(Operation::CreateSandbox), 1);
            assert_eq!(backend.calls(Operation::CreateUnit), 1);
            assert!(service.is_running().await.unwrap());
        });
    }

    /// Property test: with snapshotting, setup-free restarts reuse the first sandbox
    #[test]
    fn test_restarts_reuse_sandbox(restarts in 1usize..8) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (service, backend) = setup(true);
            service.start().await.unwrap();
            let sandbox = service.snapshot_state().await.container;

            for _ in 0..restarts {
                service.stop().await.unwrap();
                service.start().await.unwrap();
                let state = service.snapshot_state().await;
                assert!(state.is_restored());
                assert_eq!(state.container, sandbox);
            }

            assert_eq!(backend.calls(Operation::CreateSandbox), 1);
            assert_eq!(backend.calls(Operation::SnapshotUnit), 1);
        });
    }
}
