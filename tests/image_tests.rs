//! Tests for image resolution.
//!
//! Validates config resolution, layer caching under pull policies and
//! disk image materialization against an in-memory registry.

mod common;

use common::{FakeRegistry, resolver, tar_gz};
use fledge::error::Error;
use fledge::pod::PullPolicy;
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// Config Resolution Tests
// =============================================================================

#[tokio::test]
async fn test_resolve_config_reads_backend() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new());
    registry.publish_vm("registry.test/osv/nginx:1.0", "nginx");
    registry.publish_container("registry.test/app:1.0");
    let images = resolver(registry, temp.path());

    let vm = images.resolve_config("registry.test/osv/nginx:1.0").await.unwrap();
    assert_eq!(vm.backend.as_deref(), Some("osv"));
    assert_eq!(vm.hypervisor.as_deref(), Some("qemu"));

    let container = images.resolve_config("registry.test/app:1.0").await.unwrap();
    assert_eq!(container.backend, None);
    assert_eq!(container.config.entrypoint, vec!["/bin/app"]);
}

#[tokio::test]
async fn test_resolve_config_errors() {
    let temp = TempDir::new().unwrap();
    let images = resolver(Arc::new(FakeRegistry::new()), temp.path());

    assert!(matches!(
        images.resolve_config("alpine").await,
        Err(Error::InvalidReference { .. })
    ));
    assert!(matches!(
        images.resolve_config("registry.test/missing:1.0").await,
        Err(Error::ImagePullFailed { .. })
    ));
}

// =============================================================================
// Layer Tests
// =============================================================================

#[tokio::test]
async fn test_pull_layers_if_not_present_uses_cache() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new());
    registry.publish_container("registry.test/app:1.0");
    let images = resolver(Arc::clone(&registry), temp.path());

    let first = images
        .pull_layers("registry.test/app:1.0", PullPolicy::IfNotPresent)
        .await
        .unwrap();
    assert_eq!(first.layers.len(), 1);
    assert!(images.blobs().has_blob(&first.layers[0].digest));
    let pulls = registry.manifest_pulls();

    let second = images
        .pull_layers("registry.test/app:1.0", PullPolicy::IfNotPresent)
        .await
        .unwrap();
    assert_eq!(second.layers, first.layers);
    assert_eq!(registry.manifest_pulls(), pulls, "cached layers are reused");

    images
        .pull_layers("registry.test/app:1.0", PullPolicy::Always)
        .await
        .unwrap();
    assert_eq!(registry.manifest_pulls(), pulls + 1);
}

#[tokio::test]
async fn test_pull_layers_never_requires_presence() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new());
    registry.publish_container("registry.test/app:1.0");
    let images = resolver(Arc::clone(&registry), temp.path());

    let err = images
        .pull_layers("registry.test/app:1.0", PullPolicy::Never)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ImageNotPresent { .. }));
    assert_eq!(registry.manifest_pulls(), 0);
}

// =============================================================================
// Disk Image Tests
// =============================================================================

#[tokio::test]
async fn test_materialize_disk_image() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new());
    registry.publish_vm("registry.test/osv/nginx:1.0", "nginx");
    let images = resolver(registry, temp.path());

    let path = images
        .materialize_disk_image("registry.test/osv/nginx:1.0", "qemu")
        .await
        .unwrap();

    assert_eq!(path.file_name().unwrap(), "nginx.qemu");
    assert_eq!(std::fs::read(&path).unwrap(), b"disk-image");
    assert!(path.starts_with(temp.path().join("images").join("fledge")));

    let index = images
        .repository()
        .read_index("registry.test/osv/nginx:1.0")
        .unwrap();
    assert_eq!(index.version, "1.0");

    // Only the disk and the index are left behind.
    let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
    assert_eq!(entries, 2);
}

#[tokio::test]
async fn test_ensure_disk_image_honors_policy() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new());
    registry.publish_vm("registry.test/osv/nginx:1.0", "nginx");
    let images = resolver(Arc::clone(&registry), temp.path());

    let reference = "registry.test/osv/nginx:1.0";
    assert!(matches!(
        images.ensure_disk_image(reference, "qemu", PullPolicy::Never).await,
        Err(Error::ImageNotPresent { .. })
    ));

    let path = images
        .ensure_disk_image(reference, "qemu", PullPolicy::IfNotPresent)
        .await
        .unwrap();
    let pulls = registry.blob_pulls();

    let again = images
        .ensure_disk_image(reference, "qemu", PullPolicy::IfNotPresent)
        .await
        .unwrap();
    assert_eq!(again, path);
    assert_eq!(registry.blob_pulls(), pulls);
}

#[tokio::test]
async fn test_materialize_rejects_multi_layer_image() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new());
    registry.publish(
        "registry.test/osv/split:1.0",
        serde_json::json!({"backend": "osv", "hypervisor": "qemu"}),
        vec![
            tar_gz(&[("split.qemu", "a")]),
            tar_gz(&[("extra", "b")]),
        ],
    );
    let images = resolver(registry, temp.path());

    let err = images
        .materialize_disk_image("registry.test/osv/split:1.0", "qemu")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedImage { .. }));
}

#[tokio::test]
async fn test_materialize_rejects_unexpected_entry() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new());
    registry.publish(
        "registry.test/osv/odd:1.0",
        serde_json::json!({"backend": "osv", "hypervisor": "qemu"}),
        vec![tar_gz(&[("README.md", "not a disk")])],
    );
    let images = resolver(registry, temp.path());

    let err = images
        .materialize_disk_image("registry.test/osv/odd:1.0", "qemu")
        .await
        .unwrap_err();
    match err {
        Error::UnexpectedLayerContent { entry, .. } => assert_eq!(entry, "README.md"),
        other => panic!("unexpected error: {other}"),
    }
}
