//! End-to-end lifecycle tests over fake backends.

mod common;

use common::{position, AgentMode, Harness, World};
use skerry_core::{
    ContainerSpec, CoreError, DeviceRequest, EndpointRequest, ProcessSpec, SandboxId,
    SandboxState, Store,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_create_then_remove_leaves_nothing() {
    let h = Harness::new();
    let runtime = h.runtime();

    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    let status = runtime.status_sandbox(id).await.unwrap();
    assert_eq!(status.state, SandboxState::Created);
    assert_eq!(status.endpoints.len(), 1);
    assert_eq!(h.net.live_count(), 1);
    assert!(Store::new(&h.config.state_dir).load(id).await.unwrap().is_some());

    runtime.remove_sandbox(id).await.unwrap();
    assert_eq!(h.net.live_count(), 0);
    assert!(Store::new(&h.config.state_dir).load(id).await.unwrap().is_none());
    let err = runtime.status_sandbox(id).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::NotFound(_)));
}

#[tokio::test]
async fn test_full_lifecycle() {
    let h = Harness::new();
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();

    let err = runtime
        .attach_device(id, DeviceRequest::block(h.disk("early.img")), None)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), CoreError::InvalidTransition { .. }));
    assert!(!err.state_changed());

    runtime.start_sandbox(id).await.unwrap();
    let status = runtime.status_sandbox(id).await.unwrap();
    assert_eq!(status.state, SandboxState::Running);
    assert_eq!(status.agent_version.as_deref(), Some("fake-0.1"));
    assert!(runtime.check_sandbox(id).await.unwrap());

    let device = runtime
        .attach_device(id, DeviceRequest::block(h.disk("data.img")).at("/data"), None)
        .await
        .unwrap();
    let log = h.log();
    assert!(position(&log, "hv:attach").is_some());
    assert!(position(&log, "agent:wait_device").is_some());

    let container = runtime
        .create_container(id, ContainerSpec::new(ProcessSpec::new(["sleep", "infinity"])))
        .await
        .unwrap();
    runtime.start_container(id, container).await.unwrap();

    h.clear_log();
    runtime.stop_sandbox(id, false).await.unwrap();
    let log = h.log();
    let shutdown = position(&log, "hv:shutdown").unwrap();
    assert!(position(&log, "agent:signal_process").unwrap() < shutdown);
    assert!(position(&log, "agent:destroy_sandbox").unwrap() < shutdown);

    let status = runtime.status_sandbox(id).await.unwrap();
    assert_eq!(status.state, SandboxState::Stopped);
    assert!(status.devices.iter().all(|d| !d.is_live()));
    assert!(status.devices.iter().any(|d| d.id == device));
    assert_eq!(h.alive_vms(), 0);

    runtime.remove_sandbox(id).await.unwrap();
    assert_eq!(h.net.live_count(), 0);
    assert!(Store::new(&h.config.state_dir).load(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_remove_running_sandbox_rejected() {
    let h = Harness::new();
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    runtime.start_sandbox(id).await.unwrap();

    let err = runtime.remove_sandbox(id).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::InvalidTransition { .. }));
    assert_eq!(
        runtime.status_sandbox(id).await.unwrap().state,
        SandboxState::Running
    );
}

#[tokio::test]
async fn test_double_stop_is_noop() {
    let h = Harness::new();
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    runtime.start_sandbox(id).await.unwrap();
    runtime.stop_sandbox(id, true).await.unwrap();

    let revision = runtime.status_sandbox(id).await.unwrap().revision;
    h.clear_log();
    runtime.stop_sandbox(id, true).await.unwrap();

    assert_eq!(runtime.status_sandbox(id).await.unwrap().revision, revision);
    assert!(h.log().is_empty());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let h = Harness::new();
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    runtime.start_sandbox(id).await.unwrap();

    runtime.pause_sandbox(id).await.unwrap();
    runtime.pause_sandbox(id).await.unwrap();
    assert_eq!(
        runtime.status_sandbox(id).await.unwrap().state,
        SandboxState::Paused
    );

    runtime.resume_sandbox(id).await.unwrap();
    assert_eq!(
        runtime.status_sandbox(id).await.unwrap().state,
        SandboxState::Running
    );
    let log = h.log();
    assert_eq!(log.iter().filter(|e| *e == "hv:pause").count(), 1);
    assert!(position(&log, "hv:resume").is_some());
}

#[tokio::test]
async fn test_pause_unsupported_makes_no_vmm_call() {
    let h = Harness::with_world(World {
        pause: false,
        ..World::default()
    });
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    runtime.start_sandbox(id).await.unwrap();

    let err = runtime.pause_sandbox(id).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::PauseUnsupported(_)));
    assert!(!err.state_changed());
    assert!(position(&h.log(), "hv:pause").is_none());
    assert_eq!(
        runtime.status_sandbox(id).await.unwrap().state,
        SandboxState::Running
    );
}

#[tokio::test]
async fn test_silent_agent_fails_start() {
    let h = Harness::new();
    h.set_agent(AgentMode::Silent);
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();

    let err = runtime.start_sandbox(id).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::HandshakeFailed(_)));
    assert!(err.state_changed());
    assert_eq!(err.sandbox_id(), Some(id));

    let status = runtime.status_sandbox(id).await.unwrap();
    assert_eq!(status.state, SandboxState::Failed);
    assert!(status.failure.is_some());
    assert!(status.endpoints.is_empty());
    assert_eq!(h.net.live_count(), 0);
    assert_eq!(h.alive_vms(), 0);

    // failed sandboxes can only be removed
    let err = runtime.start_sandbox(id).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::InvalidTransition { .. }));
    runtime.remove_sandbox(id).await.unwrap();
}

#[tokio::test]
async fn test_incompatible_agent_version() {
    let h = Harness::new();
    h.set_agent(AgentMode::Version("2.0".into()));
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();

    let err = runtime.start_sandbox(id).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::HandshakeFailed(_)));
    assert_eq!(
        runtime.status_sandbox(id).await.unwrap().state,
        SandboxState::Failed
    );
}

#[tokio::test]
async fn test_cancelled_start_rolls_back() {
    let h = Harness::new();
    h.set_agent(AgentMode::Silent);
    let runtime = Arc::new(h.runtime());
    let id = runtime.create_sandbox(h.spec()).await.unwrap();

    let cancel = CancellationToken::new();
    let task = {
        let runtime = Arc::clone(&runtime);
        let cancel = cancel.clone();
        tokio::spawn(async move { runtime.start_sandbox_with_cancel(id, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err.root(), CoreError::Cancelled));
    let status = runtime.status_sandbox(id).await.unwrap();
    assert_eq!(status.state, SandboxState::Failed);
    assert_eq!(h.net.live_count(), 0);
    assert_eq!(h.alive_vms(), 0);
}

#[tokio::test]
async fn test_boot_timeout_kills_spawned_vmm() {
    let mut h = Harness::with_world(World {
        boot_delay: Some(Duration::from_secs(5)),
        ..World::default()
    });
    h.config.boot_timeout = Duration::from_millis(100);
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();

    let err = runtime.start_sandbox(id).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::Boot(_)));
    assert!(err.state_changed());

    let log = h.log();
    assert!(position(&log, "hv:boot").unwrap() < position(&log, "hv:shutdown").unwrap());
    assert_eq!(h.alive_vms(), 0);
    assert_eq!(h.net.live_count(), 0);
    assert_eq!(
        runtime.status_sandbox(id).await.unwrap().state,
        SandboxState::Failed
    );
}

#[tokio::test]
async fn test_concurrent_start_and_stop_are_serialized() {
    let h = Harness::new();
    let runtime = Arc::new(h.runtime());
    let id = runtime.create_sandbox(h.spec()).await.unwrap();

    let start = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.start_sandbox(id).await })
    };
    let stop = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.stop_sandbox(id, false).await })
    };
    let start = start.await.unwrap();
    let stop = stop.await.unwrap();
    start.unwrap();

    let status = runtime.status_sandbox(id).await.unwrap();
    match stop {
        Ok(()) => assert_eq!(status.state, SandboxState::Stopped),
        Err(e) => {
            assert!(matches!(e.root(), CoreError::InvalidTransition { .. }));
            assert_eq!(status.state, SandboxState::Running);
        }
    }

    let record = Store::new(&h.config.state_dir).load(id).await.unwrap().unwrap();
    assert_eq!(record.state, status.state);
    assert_eq!(record.revision, status.revision);
}

#[tokio::test]
async fn test_recovery_reattaches_running_vm() {
    let h = Harness::new();
    let first = h.runtime();
    let id = first.create_sandbox(h.spec()).await.unwrap();
    first.start_sandbox(id).await.unwrap();
    let stopped = first.create_sandbox(h.spec()).await.unwrap();
    first.shutdown().await;

    let second = h.runtime();
    let report = second.init().await.unwrap();
    assert_eq!(report.reattached, 1);
    assert_eq!(report.restored, 1);
    assert_eq!(report.failed, 0);

    assert_eq!(
        second.status_sandbox(id).await.unwrap().state,
        SandboxState::Running
    );
    assert_eq!(
        second.status_sandbox(stopped).await.unwrap().state,
        SandboxState::Created
    );
    assert!(second.check_sandbox(id).await.unwrap());
    assert!(position(&h.log(), "hv:reattach").is_some());
}

#[tokio::test]
async fn test_recovery_of_dead_vm_is_failed() {
    let h = Harness::new();
    let first = h.runtime();
    let id = first.create_sandbox(h.spec()).await.unwrap();
    first.start_sandbox(id).await.unwrap();
    first.shutdown().await;
    h.kill_all();

    let second = h.runtime();
    let report = second.init().await.unwrap();
    assert_eq!(report.failed, 1);

    let status = second.status_sandbox(id).await.unwrap();
    assert_eq!(status.state, SandboxState::Failed);
    assert!(status.devices.iter().all(|d| !d.is_live()));

    let record = Store::new(&h.config.state_dir).load(id).await.unwrap().unwrap();
    assert_eq!(record.state, SandboxState::Failed);
    assert!(record.vm.is_none());

    second.remove_sandbox(id).await.unwrap();
    assert_eq!(h.net.live_count(), 0);
}

#[tokio::test]
async fn test_device_release_after_recovery_detaches() {
    let h = Harness::new();
    let first = h.runtime();
    let id = first.create_sandbox(h.spec()).await.unwrap();
    first.start_sandbox(id).await.unwrap();
    let disk = h.disk("data.img");
    let device = first
        .attach_device(id, DeviceRequest::block(&disk), None)
        .await
        .unwrap();
    first.shutdown().await;

    let second = h.runtime();
    assert_eq!(second.init().await.unwrap().reattached, 1);
    h.clear_log();
    second.release_device(id, device).await.unwrap();
    assert!(position(&h.log(), "hv:detach").is_some());
    assert!(second.status_sandbox(id).await.unwrap().devices.is_empty());

    let again = second
        .attach_device(id, DeviceRequest::block(&disk), None)
        .await
        .unwrap();
    let status = second.status_sandbox(id).await.unwrap();
    assert_eq!(status.devices.len(), 1);
    assert_eq!(status.devices[0].id, again);

    second.stop_sandbox(id, false).await.unwrap();
    assert_eq!(h.alive_vms(), 0);
}

#[tokio::test]
async fn test_recovered_addresses_stay_reserved() {
    let h = Harness::new();
    let first = h.runtime();
    let id = first.create_sandbox(h.spec()).await.unwrap();
    first.start_sandbox(id).await.unwrap();
    let device = first
        .attach_device(id, DeviceRequest::block(h.disk("data.img")), None)
        .await
        .unwrap();
    first.shutdown().await;

    let second = h.runtime();
    second.init().await.unwrap();
    let recovered = second.status_sandbox(id).await.unwrap().devices[0]
        .address
        .clone()
        .unwrap();

    let other = second
        .attach_device(id, DeviceRequest::block(h.disk("other.img")), None)
        .await
        .unwrap();
    let status = second.status_sandbox(id).await.unwrap();
    let fresh = status.devices.iter().find(|d| d.id == other).unwrap();
    assert_ne!(fresh.address.as_ref(), Some(&recovered));

    // once released, the address can be handed out again
    second.release_device(id, device).await.unwrap();
    let third = second
        .attach_device(id, DeviceRequest::block(h.disk("third.img")), None)
        .await
        .unwrap();
    let status = second.status_sandbox(id).await.unwrap();
    let reused = status.devices.iter().find(|d| d.id == third).unwrap();
    assert_eq!(reused.address.as_ref(), Some(&recovered));
}

#[tokio::test]
async fn test_exec_ids_not_reused_after_restart() {
    let h = Harness::new();
    let first = h.runtime();
    let id = first.create_sandbox(h.spec()).await.unwrap();
    first.start_sandbox(id).await.unwrap();
    let container = first
        .create_container(id, ContainerSpec::new(ProcessSpec::new(["sh"])))
        .await
        .unwrap();
    first.start_container(id, container).await.unwrap();

    let mut seen = HashSet::new();
    for _ in 0..2 {
        let process = first
            .exec_process(id, container, ProcessSpec::new(["true"]))
            .await
            .unwrap();
        assert!(seen.insert(process.exec_id().to_string()));
    }
    first.shutdown().await;

    let second = h.runtime();
    second.init().await.unwrap();
    let process = second
        .exec_process(id, container, ProcessSpec::new(["true"]))
        .await
        .unwrap();
    assert!(
        seen.insert(process.exec_id().to_string()),
        "exec id {} handed out twice",
        process.exec_id()
    );
}

#[tokio::test]
async fn test_stale_record_rejected() {
    let h = Harness::new();
    let first = h.runtime();
    let id = first.create_sandbox(h.spec()).await.unwrap();
    first.shutdown().await;

    let store = Store::new(&h.config.state_dir);
    let stale = store.load(id).await.unwrap().unwrap();
    let mut newer = stale.clone();
    newer.revision += 5;
    store.save(&newer).await.unwrap();

    let second = h.runtime();
    let err = second.recover(stale).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::StaleRecoveryRecord { .. }));
    assert_eq!(err.sandbox_id(), Some(id));
    assert!(second.status_sandbox(id).await.is_err());
}

#[tokio::test]
async fn test_hotplug_unsupported_makes_no_vmm_call() {
    let h = Harness::with_world(World {
        hotplug: false,
        ..World::default()
    });
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    runtime.start_sandbox(id).await.unwrap();

    h.clear_log();
    let err = runtime
        .attach_device(id, DeviceRequest::block(h.disk("data.img")), None)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), CoreError::UnsupportedDevice(_)));
    assert!(!err.state_changed());
    assert!(position(&h.log(), "hv:attach").is_none());
    assert!(runtime.status_sandbox(id).await.unwrap().devices.is_empty());
}

#[tokio::test]
async fn test_boot_devices_are_coldplugged() {
    let h = Harness::with_world(World {
        hotplug: false,
        ..World::default()
    });
    let runtime = h.runtime();
    let mut spec = h.spec();
    spec.devices.push(DeviceRequest::block(h.disk("boot-data.img")).read_only());
    let id = runtime.create_sandbox(spec).await.unwrap();

    runtime.start_sandbox(id).await.unwrap();
    let log = h.log();
    assert!(position(&log, "hv:attach").unwrap() < position(&log, "hv:boot").unwrap());
    let status = runtime.status_sandbox(id).await.unwrap();
    assert_eq!(status.devices.len(), 1);
    assert!(status.devices[0].is_live());
}

#[tokio::test]
async fn test_resize_unsupported() {
    let h = Harness::with_world(World {
        live_resize: false,
        ..World::default()
    });
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    runtime.start_sandbox(id).await.unwrap();

    let err = runtime.update_resources(id, 2, 512).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::ResizeUnsupported(_)));
    assert!(position(&h.log(), "hv:resize").is_none());
    assert_eq!(runtime.status_sandbox(id).await.unwrap().vcpus, 1);
}

#[tokio::test]
async fn test_resize_onlines_resources() {
    let h = Harness::new();
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    runtime.start_sandbox(id).await.unwrap();

    let err = runtime.update_resources(id, 8, 512).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::InvalidSpec(_)));

    runtime.update_resources(id, 2, 512).await.unwrap();
    let log = h.log();
    assert!(position(&log, "hv:resize").unwrap() < position(&log, "agent:online_resources").unwrap());
    let status = runtime.status_sandbox(id).await.unwrap();
    assert_eq!(status.vcpus, 2);
    assert_eq!(status.memory_mib, 512);
}

#[tokio::test]
async fn test_exec_streams_output() {
    let h = Harness::new();
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    runtime.start_sandbox(id).await.unwrap();
    let container = runtime
        .create_container(id, ContainerSpec::new(ProcessSpec::new(["sh"])))
        .await
        .unwrap();

    let err = runtime
        .exec_process(id, container, ProcessSpec::new(["echo", "hello"]))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), CoreError::InvalidTransition { .. }));
    assert_eq!(err.container_id(), Some(container));

    runtime.start_container(id, container).await.unwrap();
    let mut process = runtime
        .exec_process(id, container, ProcessSpec::new(["echo", "hello"]))
        .await
        .unwrap();

    let mut stdout = Vec::new();
    while let Some(chunk) = process.stdout().recv().await {
        stdout.extend_from_slice(&chunk);
    }
    assert_eq!(stdout, b"hello\n");
    assert!(process.stderr().recv().await.is_none());
    assert_eq!(process.wait(Duration::from_secs(1)).await.unwrap(), 42);
}

#[tokio::test]
async fn test_container_devices_released_on_remove() {
    let h = Harness::new();
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    runtime.start_sandbox(id).await.unwrap();

    let spec = ContainerSpec::new(ProcessSpec::new(["sh"]))
        .device(DeviceRequest::block(h.disk("ctr.img")).at("/dev/vdb"));
    let container = runtime.create_container(id, spec).await.unwrap();
    let status = runtime.status_sandbox(id).await.unwrap();
    assert_eq!(status.devices.len(), 1);
    assert_eq!(status.devices[0].container_id, Some(container));

    runtime.start_container(id, container).await.unwrap();
    let device = status.devices[0].id;
    let err = runtime.release_device(id, device).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::InvalidTransition { .. }));

    runtime.stop_container(id, container).await.unwrap();
    runtime.remove_container(id, container).await.unwrap();
    let status = runtime.status_sandbox(id).await.unwrap();
    assert!(status.devices.is_empty());
    assert!(status.containers.is_empty());
    assert!(position(&h.log(), "hv:detach").is_some());
}

#[tokio::test]
async fn test_bus_addresses_unique_while_live() {
    let h = Harness::new();
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    runtime.start_sandbox(id).await.unwrap();

    let mut devices = Vec::new();
    for i in 0..3 {
        let disk = h.disk(&format!("disk{i}.img"));
        devices.push(
            runtime
                .attach_device(id, DeviceRequest::block(disk), None)
                .await
                .unwrap(),
        );
    }
    runtime.release_device(id, devices[1]).await.unwrap();
    runtime
        .attach_device(id, DeviceRequest::block(h.disk("disk3.img")), None)
        .await
        .unwrap();

    let status = runtime.status_sandbox(id).await.unwrap();
    let live: Vec<_> = status
        .devices
        .iter()
        .filter(|d| d.is_live())
        .filter_map(|d| d.address.clone())
        .collect();
    assert_eq!(live.len(), 3);
    let unique: HashSet<_> = live.iter().collect();
    assert_eq!(unique.len(), live.len());
}

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let h = Harness::new();
    let runtime = h.runtime();
    let id = SandboxId::new();

    runtime.create_sandbox_with_id(id, h.spec()).await.unwrap();
    let err = runtime
        .create_sandbox_with_id(id, h.spec())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), CoreError::AlreadyExists(_)));
    assert_eq!(h.net.live_count(), 1);
}

#[tokio::test]
async fn test_network_failure_leaves_nothing() {
    let h = Harness::new();
    *h.net.fail_create_at.lock().unwrap() = Some(1);
    let runtime = h.runtime();

    let mut spec = h.spec();
    spec.network.push(EndpointRequest::tap());
    let err = runtime.create_sandbox(spec).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::NetworkSetup(_)));

    assert_eq!(h.net.live_count(), 0);
    assert!(runtime.list_sandboxes().await.is_empty());
    assert!(Store::new(&h.config.state_dir).load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_boot_image_rejected() {
    let h = Harness::new();
    let runtime = h.runtime();
    let mut spec = h.spec();
    spec.rootfs = h.dir.path().join("missing.ext4");

    let err = runtime.create_sandbox(spec).await.unwrap_err();
    assert!(matches!(err.root(), CoreError::InvalidSpec(_)));
    assert_eq!(h.net.live_count(), 0);
}

#[tokio::test]
async fn test_watch_sees_transitions() {
    let h = Harness::new();
    let runtime = h.runtime();
    let id = runtime.create_sandbox(h.spec()).await.unwrap();
    let mut watch = runtime.watch_sandbox(id).await.unwrap();
    assert_eq!(watch.borrow_and_update().state, SandboxState::Created);

    runtime.start_sandbox(id).await.unwrap();
    assert!(watch.has_changed().unwrap());
    assert_eq!(watch.borrow_and_update().state, SandboxState::Running);
}
