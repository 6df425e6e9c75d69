//! End-to-end tests driving the engine through real unix sockets with
//! wire-level plugin stubs.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{container, pod, wait_until, TestPlugin, TestRuntime};
use nri_adaptation::api::*;
use nri_adaptation::owners::CompoundField;
use nri_adaptation::stub::Stub;
use nri_adaptation::{
    Error, Event, SyncSnapshot, ValidatorConfig, TOLERATE_MISSING_PLUGINS_ANNOTATION,
};

fn bind_mount(source: &str, destination: &str) -> Mount {
    Mount {
        source: source.to_string(),
        destination: destination.to_string(),
        type_: "bind".to_string(),
        options: vec!["rbind".to_string()],
    }
}

#[tokio::test]
async fn test_single_plugin_annotation_adjustment() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    let mut adjust = ContainerAdjustment::new();
    adjust.add_annotation("key", "00-test");
    let plugin = Arc::new(
        TestPlugin::new("00-test", &[Event::CreateContainer]).with_adjust(adjust),
    );
    let _stub = rt.connect("00", "test", plugin).await;

    let response = rt
        .engine
        .create_container(pod("pod0"), container("ctr0", "pod0"))
        .await
        .unwrap();

    let composed = response.adjust.unwrap();
    assert_eq!(composed.annotations.get("key").unwrap(), "00-test");
    assert!(response.update.is_empty());
}

#[tokio::test]
async fn test_mount_conflict_fails_create() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    for (idx, name, source) in [("00", "bar", "/dev/00-bar"), ("10", "foo", "/dev/10-foo")] {
        let mut adjust = ContainerAdjustment::new();
        adjust.add_mount(bind_mount(source, "/mnt/test"));
        let plugin = Arc::new(
            TestPlugin::new(&format!("{}-{}", idx, name), &[Event::CreateContainer])
                .with_adjust(adjust),
        );
        let _stub = rt.connect(idx, name, plugin).await;
    }

    let err = rt
        .engine
        .create_container(pod("pod0"), container("ctr0", "pod0"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict { .. }));
    let msg = err.to_string();
    assert!(msg.contains("00-bar") && msg.contains("10-foo"), "{}", msg);
    assert!(msg.contains("/mnt/test"), "{}", msg);
}

#[tokio::test]
async fn test_mount_remove_then_add_wins() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    let mut first = ContainerAdjustment::new();
    first.add_mount(bind_mount("/dev/00-bar", "/mnt/test"));
    let _a = rt
        .connect(
            "00",
            "bar",
            Arc::new(TestPlugin::new("00-bar", &[Event::CreateContainer]).with_adjust(first)),
        )
        .await;

    let mut second = ContainerAdjustment::new();
    second.remove_mount("/mnt/test");
    second.add_mount(bind_mount("/dev/10-foo", "/mnt/test"));
    let _b = rt
        .connect(
            "10",
            "foo",
            Arc::new(TestPlugin::new("10-foo", &[Event::CreateContainer]).with_adjust(second)),
        )
        .await;

    let response = rt
        .engine
        .create_container(pod("pod0"), container("ctr0", "pod0"))
        .await
        .unwrap();

    let composed = response.adjust.unwrap();
    let real: Vec<_> = composed
        .mounts
        .iter()
        .filter(|m| marked_for_removal(&m.destination).is_none())
        .collect();
    assert_eq!(real.len(), 1);
    assert_eq!(real[0].source, "/dev/10-foo");
    assert_eq!(real[0].destination, "/mnt/test");
}

#[tokio::test]
async fn test_plugins_invoked_in_index_then_name_order() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;
    let recorder = Arc::new(Mutex::new(Vec::new()));

    // Connect out of order on purpose.
    for (idx, name) in [("20", "test"), ("99", "foo"), ("00", "bar")] {
        let plugin = Arc::new(
            TestPlugin::new(&format!("{}-{}", idx, name), &[Event::StartContainer])
                .with_recorder(recorder.clone()),
        );
        let _stub = rt.connect(idx, name, plugin).await;
    }

    rt.engine
        .start_container(pod("pod0"), container("ctr0", "pod0"))
        .await
        .unwrap();

    let calls: Vec<_> = recorder
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.ends_with(":start-container"))
        .cloned()
        .collect();
    assert_eq!(
        calls,
        vec![
            "00-bar:start-container",
            "20-test:start-container",
            "99-foo:start-container"
        ]
    );
}

#[tokio::test]
async fn test_subscription_mask_is_honored() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    let plugin = Arc::new(TestPlugin::new("00-test", &[Event::CreateContainer]));
    let _stub = rt.connect("00", "test", plugin.clone()).await;

    rt.engine
        .start_container(pod("pod0"), container("ctr0", "pod0"))
        .await
        .unwrap();
    rt.engine
        .create_container(pod("pod0"), container("ctr1", "pod0"))
        .await
        .unwrap();

    let calls = plugin.calls();
    assert!(calls.iter().any(|c| c.contains("create-container/ctr1")));
    assert!(!calls.iter().any(|c| c.contains("start-container")));
}

#[tokio::test]
async fn test_solicited_update_for_sibling_container() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    let mut update = ContainerUpdate::new("ctr0");
    update.set_linux_cpu_shares(123);
    let plugin = Arc::new(
        TestPlugin::new("00-test", &[Event::CreateContainer]).with_create_updates(vec![update]),
    );
    let _stub = rt.connect("00", "test", plugin).await;

    let response = rt
        .engine
        .create_container(pod("pod1"), container("ctr1", "pod1"))
        .await
        .unwrap();

    assert_eq!(response.update.len(), 1);
    assert_eq!(response.update[0].container_id, "ctr0");
    let resources = response.update[0]
        .linux
        .as_ref()
        .unwrap()
        .resources
        .as_ref()
        .unwrap();
    assert_eq!(resources.cpu.as_ref().unwrap().shares, Some(123));
}

#[tokio::test]
async fn test_unsolicited_update_for_unknown_container_filtered() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    let plugin = Arc::new(TestPlugin::new("00-test", &[]));
    let stub = rt.connect("00", "test", plugin).await;

    let mut update = ContainerUpdate::new("pod0");
    update.set_linux_rdt_class("test");
    let response = stub.update_containers(vec![update], Vec::new()).await.unwrap();

    assert!(response.failed.is_empty());
    assert!(rt.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unsolicited_update_for_known_container_applied() {
    let snapshot = SyncSnapshot {
        pods: vec![pod("pod0")],
        containers: vec![container("ctr0", "pod0")],
    };
    let rt = TestRuntime::start(snapshot, |_| {}).await;

    let plugin = Arc::new(TestPlugin::new("00-test", &[]));
    let stub = rt.connect("00", "test", plugin).await;

    let mut update = ContainerUpdate::new("ctr0");
    update.set_linux_memory_limit(1 << 30);
    let response = stub.update_containers(vec![update], Vec::new()).await.unwrap();

    assert!(response.failed.is_empty());
    let applied = rt.applied.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].container_id, "ctr0");
}

#[tokio::test]
async fn test_builtin_validator_rejects_hook_injection() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |options| {
        options.validator = Some(ValidatorConfig {
            reject_oci_hook_adjustment: true,
            ..Default::default()
        });
    })
    .await;

    let mut hooks = Hooks::default();
    hooks.prestart.push(Hook {
        path: "/bin/hook".to_string(),
        ..Default::default()
    });
    let mut adjust = ContainerAdjustment::new();
    adjust.add_hooks(&hooks);
    let plugin = Arc::new(
        TestPlugin::new("00-test", &[Event::CreateContainer]).with_adjust(adjust),
    );
    let _stub = rt.connect("00", "test", plugin).await;

    let err = rt
        .engine
        .create_container(pod("pod0"), container("ctr0", "pod0"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ValidationRejected { .. }));
    assert!(err.to_string().contains("OCI hook"), "{}", err);
}

#[tokio::test]
async fn test_validator_plugin_rejection_aborts_create() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    let mut adjust = ContainerAdjustment::new();
    adjust.add_annotation("key", "value");
    let adjuster = Arc::new(
        TestPlugin::new("00-test", &[Event::CreateContainer]).with_adjust(adjust),
    );
    let _a = rt.connect("00", "test", adjuster).await;

    let validator = Arc::new(
        TestPlugin::new("90-validator", &[Event::ValidateContainerAdjustment])
            .rejecting("annotations are not welcome here"),
    );
    let _b = rt.connect("90", "validator", validator.clone()).await;

    let err = rt
        .engine
        .create_container(pod("pod0"), container("ctr0", "pod0"))
        .await
        .unwrap_err();

    match err {
        Error::ValidationRejected { plugin, reason } => {
            assert_eq!(plugin, "90-validator");
            assert_eq!(reason, "annotations are not welcome here");
        }
        other => panic!("unexpected error: {}", other),
    }

    // The validator saw the composed bundle, including the ledger.
    let seen = validator.validation_seen().unwrap();
    assert_eq!(
        seen.owners
            .owner_of_compound("ctr0", CompoundField::Annotation, "key"),
        Some("00-test")
    );
    assert_eq!(seen.plugins.len(), 2);
}

#[tokio::test]
async fn test_required_plugin_missing_fails_unless_tolerated() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |options| {
        options.validator = Some(ValidatorConfig {
            required_plugins: vec!["device-injector".to_string()],
            ..Default::default()
        });
    })
    .await;

    let err = rt
        .engine
        .create_container(pod("pod0"), container("ctr0", "pod0"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RequiredPlugin { plugin } if plugin == "device-injector"));

    let mut tolerant_pod = pod("pod0");
    tolerant_pod.annotations.insert(
        TOLERATE_MISSING_PLUGINS_ANNOTATION.to_string(),
        "true".to_string(),
    );
    rt.engine
        .create_container(tolerant_pod, container("ctr0", "pod0"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_container_returns_subject_first() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    let mut sibling = ContainerUpdate::new("ctr0");
    sibling.set_linux_cpu_shares(10);
    let mut subject = ContainerUpdate::new("ctr1");
    subject.set_linux_cpu_shares(20);
    let plugin = Arc::new(
        TestPlugin::new("00-test", &[Event::UpdateContainer])
            .with_create_updates(vec![sibling, subject]),
    );
    let _stub = rt.connect("00", "test", plugin).await;

    let mut resources = LinuxResources::default();
    resources.cpu = Some(LinuxCpu {
        shares: Some(512),
        ..Default::default()
    });
    let response = rt
        .engine
        .update_container(pod("pod1"), container("ctr1", "pod1"), Some(resources))
        .await
        .unwrap();

    assert_eq!(response.update.len(), 2);
    assert_eq!(response.update[0].container_id, "ctr1");
    assert_eq!(response.update[1].container_id, "ctr0");
}

#[tokio::test]
async fn test_stop_container_collects_updates() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    let mut update = ContainerUpdate::new("ctr0");
    update.set_linux_cpu_quota(5000);
    let plugin = Arc::new(
        TestPlugin::new("00-test", &[Event::StopContainer]).with_create_updates(vec![update]),
    );
    let _stub = rt.connect("00", "test", plugin).await;

    let response = rt
        .engine
        .stop_container(pod("pod0"), container("ctr9", "pod0"))
        .await
        .unwrap();
    assert_eq!(response.update.len(), 1);
    assert_eq!(response.update[0].container_id, "ctr0");
}

#[tokio::test]
async fn test_per_pod_locking_runs_pods_in_parallel() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |options| {
        options.locking = nri_adaptation::LockingStrategy::PerPod;
        options.request_timeout = Duration::from_secs(5);
    })
    .await;

    let plugin = Arc::new(
        TestPlugin::new("00-slow", &[Event::CreateContainer])
            .with_create_delay(Duration::from_millis(300)),
    );
    let _stub = rt.connect("00", "slow", plugin).await;

    let started = Instant::now();
    let (a, b) = tokio::join!(
        rt.engine.create_container(pod("pod0"), container("ctr0", "pod0")),
        rt.engine.create_container(pod("pod1"), container("ctr1", "pod1")),
    );
    a.unwrap();
    b.unwrap();

    assert!(
        started.elapsed() < Duration::from_millis(550),
        "pipelines on different pods should overlap, took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_global_locking_serializes_pods() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |options| {
        options.locking = nri_adaptation::LockingStrategy::Global;
        options.request_timeout = Duration::from_secs(5);
    })
    .await;

    let plugin = Arc::new(
        TestPlugin::new("00-slow", &[Event::CreateContainer])
            .with_create_delay(Duration::from_millis(300)),
    );
    let _stub = rt.connect("00", "slow", plugin).await;

    let started = Instant::now();
    let (a, b) = tokio::join!(
        rt.engine.create_container(pod("pod0"), container("ctr0", "pod0")),
        rt.engine.create_container(pod("pod1"), container("ctr1", "pod1")),
    );
    a.unwrap();
    b.unwrap();

    assert!(
        started.elapsed() >= Duration::from_millis(600),
        "global locking should serialize, took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_synchronization_is_chunked() {
    let snapshot = SyncSnapshot {
        pods: (0..10).map(|i| pod(&format!("pod{}", i))).collect(),
        containers: (0..10)
            .map(|i| container(&format!("ctr{}", i), &format!("pod{}", i)))
            .collect(),
    };
    let chunk_limit = serde_json::to_vec(&snapshot.pods[0]).unwrap().len() * 3;

    let rt = TestRuntime::start(snapshot, move |options| {
        options.sync_chunk_size = chunk_limit;
    })
    .await;

    let plugin = Arc::new(TestPlugin::new("00-test", &[]));
    let _stub = rt.connect("00", "test", plugin.clone()).await;

    let sync_calls = plugin.sync_calls();
    assert!(sync_calls.len() > 1, "expected chunking, got {:?}", sync_calls);
    for (i, (_, _, more)) in sync_calls.iter().enumerate() {
        assert_eq!(*more, i + 1 < sync_calls.len());
    }
    let total_pods: usize = sync_calls.iter().map(|(pods, _, _)| pods).sum();
    let total_containers: usize = sync_calls.iter().map(|(_, containers, _)| containers).sum();
    assert_eq!(total_pods, 10);
    assert_eq!(total_containers, 10);
}

#[tokio::test]
async fn test_initial_sync_updates_reach_the_runtime() {
    let snapshot = SyncSnapshot {
        pods: vec![pod("pod0")],
        containers: vec![container("ctr0", "pod0")],
    };
    let rt = TestRuntime::start(snapshot, |_| {}).await;

    let mut update = ContainerUpdate::new("ctr0");
    update.set_linux_cpu_shares(256);
    // One update for a known container, one for an unknown one.
    let bogus = ContainerUpdate::new("ghost");
    let plugin = Arc::new(TestPlugin::new("00-test", &[]).with_sync_updates(vec![update, bogus]));
    let _stub = rt.connect("00", "test", plugin).await;

    wait_until(|| !rt.applied.lock().unwrap().is_empty()).await;
    let applied = rt.applied.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].container_id, "ctr0");
}

#[tokio::test]
async fn test_reregistration_replaces_previous_instance() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    let mut first = ContainerAdjustment::new();
    first.add_annotation("generation", "first");
    let stub_a = rt
        .connect(
            "00",
            "test",
            Arc::new(TestPlugin::new("00-test", &[Event::CreateContainer]).with_adjust(first)),
        )
        .await;

    let mut second = ContainerAdjustment::new();
    second.add_annotation("generation", "second");
    let _stub_b = rt
        .connect(
            "00",
            "test",
            Arc::new(TestPlugin::new("00-test", &[Event::CreateContainer]).with_adjust(second)),
        )
        .await;

    // The displaced instance is shut down.
    tokio::time::timeout(Duration::from_secs(5), stub_a.closed().cancelled())
        .await
        .expect("displaced plugin should be closed");

    let response = rt
        .engine
        .create_container(pod("pod0"), container("ctr0", "pod0"))
        .await
        .unwrap();
    assert_eq!(
        response.adjust.unwrap().annotations.get("generation").unwrap(),
        "second"
    );
}

#[tokio::test]
async fn test_registration_deadline_closes_silent_connections() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |options| {
        options.registration_timeout = Duration::from_millis(200);
    })
    .await;

    let plugin = Arc::new(TestPlugin::new("00-test", &[]));
    // Connect but never register.
    let stub = Stub::connect(&rt.socket_path, "test", "00", plugin)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), stub.closed().cancelled())
        .await
        .expect("unregistered connection should be closed");
}

#[tokio::test]
async fn test_blocked_sync_delays_registration() {
    let rt = TestRuntime::start(SyncSnapshot::default(), |_| {}).await;

    let block = rt.engine.block_plugin_sync().await;

    let plugin = Arc::new(TestPlugin::new("00-test", &[]));
    let stub = Stub::connect(&rt.socket_path, "test", "00", plugin.clone())
        .await
        .unwrap();
    stub.register().await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        plugin.sync_calls().is_empty(),
        "plugin must not be synchronized while the gate is closed"
    );

    drop(block);
    plugin.wait_synchronized().await;
}
