//! Tests for the OSv/QEMU backend.
//!
//! QEMU and virtiofsd are replaced by shell scripts, so these tests run the
//! real process supervision: spawning, exit watching, log capture, kill and
//! teardown.

#![cfg(unix)]

mod common;

use common::{FakeRegistry, fake_binary, resolver, vm_config};
use fledge::backend::qemu::QemuConfig;
use fledge::backend::{Backend, InstanceSpec, LogOptions, MountedVolume, VmBackend};
use fledge::error::Error;
use fledge::id::InstanceId;
use fledge::pod::{ContainerSpec, InstanceState, PullPolicy, VolumeMount};
use fledge::runtime::Signal;
use fledge::volume::{FileSet, ResolvedSource, ResolvedVolume};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

const IMAGE: &str = "registry.test/osv/app:1.0";
const WAIT: Duration = Duration::from_secs(20);

struct Harness {
    _temp: TempDir,
    root: PathBuf,
    backend: Backend,
    spec: InstanceSpec,
}

/// Backend whose QEMU runs `script`.
async fn harness(script: &str) -> Harness {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_path_buf();
    let qemu = fake_binary(&root, "qemu", &script.replace("{root}", &root.display().to_string()));
    let mut config = vm_config(&root, &qemu);
    config.virtiofs.daemon = fake_binary(
        &root,
        "virtiofsd",
        &format!("echo \"$@\" > {}/virtiofsd.args\nexec sleep 30", root.display()),
    )
    .display()
    .to_string();

    let registry = Arc::new(FakeRegistry::new());
    registry.publish_vm(IMAGE, "app");
    let images = resolver(registry, &root);
    let image_config = images.resolve_config(IMAGE).await.unwrap();

    let mut container = ContainerSpec::new("unikernel", IMAGE);
    container.image_pull_policy = PullPolicy::IfNotPresent;

    Harness {
        _temp: temp,
        backend: Backend::Vm(VmBackend::new(&config, images, false)),
        root,
        spec: InstanceSpec {
            container,
            image_config,
            hostname: None,
            volumes: Vec::new(),
        },
    }
}

fn id() -> InstanceId {
    InstanceId::from_parts("default", "osv", "unikernel").unwrap()
}

fn instance_dir(root: &Path, id: &InstanceId) -> PathBuf {
    root.join("instances/qemu").join(id.as_str())
}

fn stored_config(root: &Path, id: &InstanceId) -> QemuConfig {
    let data = std::fs::read(instance_dir(root, id).join("osv.config")).unwrap();
    serde_yaml::from_slice(&data).unwrap()
}

async fn wait(backend: &Backend, id: &InstanceId) -> fledge::InstanceStatus {
    tokio::time::timeout(WAIT, backend.wait(id))
        .await
        .expect("VM did not exit in time")
        .unwrap()
}

async fn read_logs(backend: &Backend, id: &InstanceId, options: LogOptions) -> String {
    let mut reader = backend.logs(id, &options).await.unwrap();
    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    out
}

// =============================================================================
// Create Tests
// =============================================================================

#[tokio::test]
async fn test_create_stores_config() {
    let h = harness("exit 0").await;
    let id = id();

    h.backend.create(&id, &h.spec).await.unwrap();

    let config = stored_config(&h.root, &id);
    assert_eq!(config.name, id.to_string());
    assert_eq!(config.cmd, "runscript /run/default;");
    assert!(config.image.ends_with("app.qemu"));
    assert!(config.image.is_file());
    assert!(config.backing_file);

    let status = h.backend.status(&id).await.unwrap();
    assert_eq!(
        status.state,
        InstanceState::waiting("Created", "Instance is created")
    );
    assert_eq!(status.container_id, format!("capstan://{}", id));
    assert_eq!(status.last_termination_state, None);
}

#[tokio::test]
async fn test_create_rejects_unknown_hypervisor() {
    let mut h = harness("exit 0").await;
    h.spec.image_config.hypervisor = Some("firecracker".to_string());

    let err = h.backend.create(&id(), &h.spec).await.unwrap_err();
    assert!(matches!(err.root(), Error::UnsupportedHypervisor(_)));
    assert!(err.to_string().starts_with("osv: "));
}

#[tokio::test]
async fn test_create_requires_created_volumes() {
    let mut h = harness("exit 0").await;
    let id = id();
    h.spec.volumes = vec![MountedVolume {
        id: id.with_last("data").unwrap(),
        mount: VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            read_only: false,
        },
        volume: ResolvedVolume {
            name: "data".to_string(),
            source: ResolvedSource::Empty,
        },
    }];

    let err = h.backend.create(&id, &h.spec).await.unwrap_err();
    assert!(matches!(err.root(), Error::VolumeNotCreated(_)));
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_exit_is_recorded_by_watcher() {
    let h = harness("echo 'OSv v0.57.0'\necho \"booting $1\"\nexit 3").await;
    let id = id();
    h.backend.create(&id, &h.spec).await.unwrap();

    h.backend.start(&id).await.unwrap();
    let status = wait(&h.backend, &id).await;

    match &status.state {
        InstanceState::Terminated {
            exit_code,
            signal,
            message,
            started_at,
            ..
        } => {
            assert_eq!(*exit_code, 3);
            assert_eq!(*signal, None);
            assert_eq!(message, "exit status 3");
            assert!(started_at.is_some());
        }
        other => panic!("expected terminated, got {:?}", other),
    }

    // The record is only written by the watcher; querying again is stable.
    assert_eq!(h.backend.status(&id).await.unwrap(), status);

    let logs = read_logs(&h.backend, &id, LogOptions::default()).await;
    assert!(logs.contains("OSv v0.57.0"), "logs: {logs}");
    let tail = read_logs(&h.backend, &id, LogOptions { tail_lines: Some(1) }).await;
    assert_eq!(tail, "booting -display\n");
}

#[tokio::test]
async fn test_start_requires_waiting() {
    let h = harness("exit 0").await;
    let id = id();
    h.backend.create(&id, &h.spec).await.unwrap();
    h.backend.start(&id).await.unwrap();
    wait(&h.backend, &id).await;

    let err = h.backend.start(&id).await.unwrap_err();
    assert!(matches!(err.root(), Error::InvalidState { .. }));
}

#[tokio::test]
async fn test_wait_requires_start() {
    let h = harness("exit 0").await;
    let id = id();
    h.backend.create(&id, &h.spec).await.unwrap();

    let err = tokio::time::timeout(WAIT, h.backend.wait(&id))
        .await
        .expect("wait on a created VM must not block")
        .unwrap_err();
    assert!(matches!(err.root(), Error::InvalidState { .. }));

    h.backend.start(&id).await.unwrap();
    assert_eq!(wait(&h.backend, &id).await.state.exit_code(), Some(0));
}

#[tokio::test]
async fn test_kill_running_vm() {
    let h = harness("echo up\nexec sleep 30").await;
    let id = id();
    h.backend.create(&id, &h.spec).await.unwrap();
    h.backend.start(&id).await.unwrap();
    assert!(h.backend.status(&id).await.unwrap().state.is_running());

    h.backend.kill(&id, Signal::Term).await.unwrap();
    let status = wait(&h.backend, &id).await;

    assert_eq!(status.state.exit_code(), Some(128 + 15));
    assert!(matches!(
        status.state,
        InstanceState::Terminated { signal: Some(15), .. }
    ));

    // Signalling an exited VM is not an error.
    h.backend.kill(&id, Signal::Kill).await.unwrap();
}

#[tokio::test]
async fn test_start_failure_reports_start_failed() {
    let h = harness("exit 0").await;
    let id = id();
    h.backend.create(&id, &h.spec).await.unwrap();
    std::fs::remove_file(h.root.join("qemu")).unwrap();

    let err = h.backend.start(&id).await.unwrap_err();
    assert!(matches!(err.root(), Error::StartFailed { .. }));
    assert!(matches!(
        h.backend.status(&id).await.unwrap().state,
        InstanceState::Waiting { .. }
    ));
}

#[tokio::test]
async fn test_recreate_keeps_last_termination() {
    let h = harness("exit 7").await;
    let id = id();
    h.backend.create(&id, &h.spec).await.unwrap();
    h.backend.start(&id).await.unwrap();
    wait(&h.backend, &id).await;

    h.backend.create(&id, &h.spec).await.unwrap();

    let status = h.backend.status(&id).await.unwrap();
    assert!(matches!(status.state, InstanceState::Waiting { .. }));
    assert_eq!(
        status.last_termination_state.and_then(|s| s.exit_code()),
        Some(7)
    );
}

// =============================================================================
// Delete Tests
// =============================================================================

#[tokio::test]
async fn test_delete_running_vm() {
    let h = harness("exec sleep 30").await;
    let id = id();
    h.backend.create(&id, &h.spec).await.unwrap();
    h.backend.start(&id).await.unwrap();

    tokio::time::timeout(WAIT, h.backend.delete(&id))
        .await
        .expect("delete did not finish in time")
        .unwrap();

    assert!(!instance_dir(&h.root, &id).exists());
    assert!(h.backend.status(&id).await.unwrap_err().is_not_found());
    assert!(h.backend.delete(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_delete_created_vm() {
    let h = harness("exit 0").await;
    let id = id();
    h.backend.create(&id, &h.spec).await.unwrap();

    h.backend.delete(&id).await.unwrap();

    assert!(!instance_dir(&h.root, &id).exists());
    assert!(h.backend.status(&id).await.unwrap_err().is_not_found());
    assert!(h.backend.logs(&id, &LogOptions::default()).await.is_err());
}

// =============================================================================
// Volume Tests
// =============================================================================

#[tokio::test]
async fn test_virtiofs_volume() {
    // QEMU waits until virtiofsd has recorded its arguments.
    let script = "echo \"$@\" > {root}/qemu.args\n\
                  i=0\n\
                  while [ ! -f {root}/virtiofsd.args ] && [ $i -lt 100 ]; do sleep 0.1; i=$((i+1)); done\n\
                  exit 0";
    let mut h = harness(script).await;
    let id = id();
    let volume_id = id.with_last("config").unwrap();
    let empty_id = id.with_last("optional").unwrap();

    let files = ResolvedVolume {
        name: "config".to_string(),
        source: ResolvedSource::Files {
            files: FileSet::from([("app.conf".to_string(), b"debug=1".to_vec())]),
            stubbed: Vec::new(),
        },
    };
    let empty = ResolvedVolume {
        name: "optional".to_string(),
        source: ResolvedSource::Empty,
    };
    h.backend.create_volume(&empty_id, &empty).await.unwrap();
    h.backend.create_volume(&volume_id, &files).await.unwrap();

    let mount = |name: &str, path: &str| VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: true,
    };
    h.spec.volumes = vec![
        MountedVolume {
            id: empty_id.clone(),
            mount: mount("optional", "/opt"),
            volume: empty,
        },
        MountedVolume {
            id: volume_id.clone(),
            mount: mount("config", "/etc/app"),
            volume: files,
        },
    ];
    h.backend.create(&id, &h.spec).await.unwrap();

    // The empty volume takes no device index.
    let config = stored_config(&h.root, &id);
    assert_eq!(
        config.cmd,
        "--rootfs=zfs --mount-fs=virtiofs,/dev/virtiofs0,/etc/app runscript /run/default;"
    );

    h.backend.start(&id).await.unwrap();
    let status = wait(&h.backend, &id).await;
    assert_eq!(status.state.exit_code(), Some(0));

    let volume_dir = h.root.join("volumes/qemu").join(volume_id.as_str());
    assert_eq!(std::fs::read(volume_dir.join("app.conf")).unwrap(), b"debug=1");

    let daemon_args = std::fs::read_to_string(h.root.join("virtiofsd.args")).unwrap();
    assert!(daemon_args.contains(&format!("--shared-dir {}", volume_dir.display())));

    let qemu_args = std::fs::read_to_string(h.root.join("qemu.args")).unwrap();
    assert!(qemu_args.contains("vhost-user-fs-pci,queue-size=1024,chardev=char0,tag=config"));
    assert_eq!(qemu_args.matches("memory-backend-file").count(), 1);

    h.backend.delete(&id).await.unwrap();
    h.backend.delete_volume(&volume_id).await.unwrap();
    h.backend.delete_volume(&empty_id).await.unwrap();
    assert!(!volume_dir.exists());

    let err = h.backend.delete_volume(&volume_id).await.unwrap_err();
    assert!(matches!(err.root(), Error::VolumeNotCreated(_)));
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[tokio::test]
async fn test_shutdown_finalizes_running_vms() {
    let h = harness("exec sleep 30").await;
    let id = id();
    h.backend.create(&id, &h.spec).await.unwrap();
    h.backend.start(&id).await.unwrap();

    tokio::time::timeout(WAIT, h.backend.shutdown())
        .await
        .expect("shutdown did not finish in time")
        .unwrap();

    let status = h.backend.status(&id).await.unwrap();
    assert!(status.state.is_terminated());
}
