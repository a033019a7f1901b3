//! Test doubles shared by the integration tests.
//!
//! - [`FakeRegistry`]: in-memory registry serving manifests and blobs
//! - [`FakeRuntime`]: OCI runtime keeping container state in a map
//! - [`fake_binary`]: executable shell script standing in for QEMU or
//!   virtiofsd

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use fledge::constants::{OCI_IMAGE_CONFIG_MEDIA_TYPE, OCI_LAYER_MEDIA_TYPE_GZIP};
use fledge::error::{Error, Result};
use fledge::registry::{ImageManifest, ImageRef, LayerInfo, Registry};
use fledge::runtime::{
    ContainerState, ContainerStatus, ExecOptions, ExecResult, OciRuntime, Signal,
};
use fledge::{Config, ImageResolver};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};

// =============================================================================
// Blobs
// =============================================================================

pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Gzip-compressed tar archive holding `files` in order.
pub fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

// =============================================================================
// Registry
// =============================================================================

struct StoredImage {
    manifest: ImageManifest,
    blobs: HashMap<String, Vec<u8>>,
}

/// In-memory registry keyed by the display form of [`ImageRef`].
#[derive(Default)]
pub struct FakeRegistry {
    images: Mutex<HashMap<String, StoredImage>>,
    manifest_pulls: AtomicUsize,
    blob_pulls: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an image with a config blob and gzip layers.
    pub fn publish(&self, reference: &str, config: serde_json::Value, layers: Vec<Vec<u8>>) {
        let config = serde_json::to_vec(&config).unwrap();
        let mut blobs = HashMap::new();

        let config_info = LayerInfo {
            digest: digest_of(&config),
            size: config.len() as u64,
            media_type: OCI_IMAGE_CONFIG_MEDIA_TYPE.to_string(),
        };
        blobs.insert(config_info.digest.clone(), config);

        let layers = layers
            .into_iter()
            .map(|data| {
                let info = LayerInfo {
                    digest: digest_of(&data),
                    size: data.len() as u64,
                    media_type: OCI_LAYER_MEDIA_TYPE_GZIP.to_string(),
                };
                blobs.insert(info.digest.clone(), data);
                info
            })
            .collect();

        let key = ImageRef::parse(reference).unwrap().to_string();
        self.images.lock().unwrap().insert(
            key,
            StoredImage {
                manifest: ImageManifest {
                    digest: format!("sha256:{:064x}", 1),
                    platform: "linux/amd64".to_string(),
                    config: config_info,
                    layers,
                },
                blobs,
            },
        );
    }

    /// Publishes a container image whose rootfs holds `bin/app`.
    pub fn publish_container(&self, reference: &str) {
        self.publish(
            reference,
            serde_json::json!({
                "architecture": "amd64",
                "os": "linux",
                "config": {"Entrypoint": ["/bin/app"], "Env": ["MODE=test"]}
            }),
            vec![tar_gz(&[("bin/app", "#!/bin/sh\n")])],
        );
    }

    /// Publishes an OSv image with a single `<name>.qemu` disk layer.
    pub fn publish_vm(&self, reference: &str, disk_name: &str) {
        let entry = format!("{}.qemu", disk_name);
        self.publish(
            reference,
            serde_json::json!({"backend": "osv", "hypervisor": "qemu", "config": null}),
            vec![tar_gz(&[(entry.as_str(), "disk-image")])],
        );
    }

    pub fn manifest_pulls(&self) -> usize {
        self.manifest_pulls.load(Ordering::SeqCst)
    }

    pub fn blob_pulls(&self) -> usize {
        self.blob_pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn pull_manifest(&self, image: &ImageRef) -> Result<ImageManifest> {
        self.manifest_pulls.fetch_add(1, Ordering::SeqCst);
        self.images
            .lock()
            .unwrap()
            .get(&image.to_string())
            .map(|stored| stored.manifest.clone())
            .ok_or_else(|| Error::ImagePullFailed {
                reference: image.to_string(),
                reason: "manifest unknown".to_string(),
            })
    }

    async fn pull_blob(
        &self,
        image: &ImageRef,
        blob: &LayerInfo,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        self.blob_pulls.fetch_add(1, Ordering::SeqCst);
        let data = self
            .images
            .lock()
            .unwrap()
            .get(&image.to_string())
            .and_then(|stored| stored.blobs.get(&blob.digest).cloned())
            .ok_or_else(|| Error::ImagePullFailed {
                reference: image.to_string(),
                reason: format!("blob unknown: {}", blob.digest),
            })?;
        out.write_all(&data).await?;
        Ok(())
    }
}

/// Resolver over `registry` storing everything under `root`.
pub fn resolver(registry: Arc<FakeRegistry>, root: &Path) -> Arc<ImageResolver> {
    Arc::new(ImageResolver::new(
        registry,
        fledge::ImageRepository::under_root(root).unwrap(),
        Arc::new(fledge::BlobStore::under_root(root).unwrap()),
    ))
}

// =============================================================================
// OCI Runtime
// =============================================================================

/// OCI runtime that only keeps state. `kill` stops the container at once,
/// the way a process dying from the signal would look from outside.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerState>>,
    /// Bundle passed to `create`, by container id.
    pub bundles: Mutex<HashMap<String, PathBuf>>,
    pub exec_exit_code: Mutex<i32>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.containers.lock().unwrap().contains_key(id)
    }

    /// Marks a container stopped behind the backend's back.
    pub fn exit(&self, id: &str, code: i32) {
        if let Some(state) = self.containers.lock().unwrap().get_mut(id) {
            state.status = ContainerStatus::Stopped;
            state.exit_code = Some(code);
            state.pid = None;
        }
    }
}

#[async_trait]
impl OciRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn unavailable_reason(&self) -> Option<String> {
        None
    }

    async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        if !bundle.join("config.json").is_file() {
            return Err(Error::CreateFailed {
                id: id.to_string(),
                reason: "bundle has no config.json".to_string(),
            });
        }
        self.bundles
            .lock()
            .unwrap()
            .insert(id.to_string(), bundle.to_path_buf());
        self.containers.lock().unwrap().insert(
            id.to_string(),
            ContainerState::new(id, bundle.display().to_string(), ContainerStatus::Created),
        );
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let state = containers
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        state.status = ContainerStatus::Running;
        state.pid = Some(4242);
        state.started_at = Some(Utc::now());
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    async fn kill(&self, id: &str, signal: Signal, _all: bool) -> Result<()> {
        if !self.contains(id) {
            return Err(Error::ContainerNotFound(id.to_string()));
        }
        self.exit(id, 128 + signal.as_i32());
        Ok(())
    }

    async fn delete(&self, id: &str, _force: bool) -> Result<()> {
        self.containers
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    async fn exec(&self, id: &str, command: &[String], _opts: ExecOptions) -> Result<ExecResult> {
        if !self.contains(id) {
            return Err(Error::ContainerNotFound(id.to_string()));
        }
        Ok(ExecResult {
            exit_code: *self.exec_exit_code.lock().unwrap(),
            stdout: command.join(" ").into_bytes(),
            stderr: Vec::new(),
        })
    }
}

// =============================================================================
// Processes
// =============================================================================

/// Writes an executable `/bin/sh` script named `name` into `dir`.
pub fn fake_binary(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Configuration rooted at `root` with the QEMU binary replaced.
pub fn vm_config(root: &Path, qemu: &Path) -> Config {
    let mut config = Config::default();
    config.root_dir = root.to_path_buf();
    config.backends = vec!["containerd".into(), "osv".into(), "null".into()];
    config.qemu.binary = qemu.display().to_string();
    config.qemu.disable_kvm = true;
    config.qemu.verbose = false;
    config
}
