//! Container backend on top of an OCI runtime.
//!
//! ```text
//! create:  delete stale ─▶ pull layers ─▶ materialize volumes ─▶ bundle ─▶ runtime.create
//! start:   runtime.start
//! status:  runtime.state (live, every call)
//! delete:  runtime.delete(force) ─▶ remove bundle ─▶ remove volume dirs
//! ```
//!
//! Volumes are applied at create as bind mounts, so `create_volume` and
//! `delete_volume` have nothing to do. Secret and config map files are
//! written per instance under
//! `<root>/volumes/containerd/<instance-id>/<volume>/` and go away with the
//! instance, so siblings mounting the same pod volume never share a copy.

use super::{AttachIo, InstanceSpec, LogOptions, LogReader};
use crate::bundle::{BundleBuilder, OciContainerConfig};
use crate::constants::{PORTS_ANNOTATION, VOLUME_DIR, WAIT_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::id::InstanceId;
use crate::image::ImageResolver;
use crate::pod::{InstanceState, InstanceStatus};
use crate::portmap::ports_annotation;
use crate::runtime::{ContainerStatus, ExecOptions, OciRuntime, Signal};
use crate::volume::{ResolvedVolume, bind_mount};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const CONTAINER_ID_PREFIX: &str = "containerd://";

/// What the backend remembers about a container besides runtime state.
#[derive(Debug, Clone)]
struct ContainerRecord {
    name: String,
    image: String,
    /// First time the container was seen stopped. The runtime does not
    /// report an exit time.
    finished_at: Option<DateTime<Utc>>,
}

/// Runs instances as OCI containers.
pub struct ContainerBackend {
    runtime: Arc<dyn OciRuntime>,
    images: Arc<ImageResolver>,
    bundles: BundleBuilder,
    volume_dir: PathBuf,
    records: RwLock<HashMap<InstanceId, ContainerRecord>>,
}

impl ContainerBackend {
    pub fn new(
        runtime: Arc<dyn OciRuntime>,
        images: Arc<ImageResolver>,
        root: &Path,
    ) -> Result<Self> {
        let bundles = BundleBuilder::under_root(root, Arc::clone(images.blobs()))?;
        Ok(Self {
            runtime,
            images,
            bundles,
            volume_dir: root.join(VOLUME_DIR).join("containerd"),
            records: RwLock::new(HashMap::new()),
        })
    }

    fn record(&self, id: &InstanceId) -> Result<ContainerRecord> {
        self.records
            .read()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
    }

    /// Time the container was first seen stopped, recorded on first call.
    fn stopped_at(&self, id: &InstanceId) -> Result<DateTime<Utc>> {
        let mut records = self.records.write()?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        Ok(*record.finished_at.get_or_insert_with(Utc::now))
    }

    /// Root of the volumes materialized for one instance.
    fn instance_volume_dir(&self, id: &InstanceId) -> PathBuf {
        self.volume_dir.join(id.as_str())
    }

    pub async fn create(&self, id: &InstanceId, spec: &InstanceSpec) -> Result<()> {
        if let Err(e) = self.runtime.delete(id.as_str(), true).await
            && !e.is_not_found()
        {
            warn!(instance = %id, error = %e, "failed to remove stale container");
        }
        remove_dir(&self.instance_volume_dir(id)).await;

        let container = &spec.container;
        let handle = self
            .images
            .pull_layers(&container.image, container.image_pull_policy)
            .await?;

        let mut config = OciContainerConfig::assemble(container, &spec.image_config)?;
        config.hostname = spec.hostname.clone();

        let volume_root = self.instance_volume_dir(id);
        for mounted in &spec.volumes {
            let dir = volume_root.join(&mounted.volume.name);
            let Some(source) = mounted.volume.materialize(&dir)? else {
                debug!(instance = %id, volume = %mounted.id, "empty volume, not mounted");
                continue;
            };
            config.mounts.push(bind_mount(&source, &mounted.mount));
        }

        if let Some(ports) = ports_annotation(&container.ports)? {
            config.annotations.insert(PORTS_ANNOTATION.to_string(), ports);
        }

        let bundle = self.bundles.build(id, &handle, &config)?;
        self.runtime.create(id.as_str(), &bundle).await?;

        self.records.write()?.insert(
            id.clone(),
            ContainerRecord {
                name: container.name.clone(),
                image: container.image.clone(),
                finished_at: None,
            },
        );

        info!(instance = %id, image = %container.image, "created container");
        Ok(())
    }

    pub async fn start(&self, id: &InstanceId) -> Result<()> {
        self.record(id)?;
        self.runtime.start(id.as_str()).await
    }

    pub async fn kill(&self, id: &InstanceId, signal: Signal) -> Result<()> {
        self.record(id)?;
        self.runtime.kill(id.as_str(), signal, true).await
    }

    pub async fn delete(&self, id: &InstanceId) -> Result<()> {
        self.record(id)?;

        match self.runtime.delete(id.as_str(), true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(instance = %id, "container already gone from runtime");
            }
            Err(e) => return Err(e),
        }

        self.bundles.remove(id)?;
        remove_dir(&self.instance_volume_dir(id)).await;
        self.records.write()?.remove(id);

        info!(instance = %id, "deleted container");
        Ok(())
    }

    /// Queries the runtime on every call.
    pub async fn status(&self, id: &InstanceId) -> Result<InstanceStatus> {
        let record = self.record(id)?;
        let state = self.runtime.state(id.as_str()).await.map_err(|e| {
            if e.is_not_found() {
                Error::InstanceNotFound(id.to_string())
            } else {
                e
            }
        })?;

        let instance_state = match state.status {
            ContainerStatus::Creating | ContainerStatus::Created => {
                InstanceState::waiting("Starting", "Starting container")
            }
            ContainerStatus::Running => InstanceState::Running {
                started_at: state.started_at.unwrap_or_else(Utc::now),
            },
            ContainerStatus::Stopped => InstanceState::Terminated {
                exit_code: state.exit_code.unwrap_or(0),
                signal: None,
                reason: "Stopped".to_string(),
                message: "Container stopped".to_string(),
                started_at: state.started_at,
                finished_at: self.stopped_at(id)?,
            },
        };

        Ok(InstanceStatus::with_state(
            &record.name,
            &record.image,
            &format!("{}{}", CONTAINER_ID_PREFIX, id),
            instance_state,
        ))
    }

    /// The runtime keeps no log file, so the reader is always empty.
    pub async fn logs(&self, id: &InstanceId, _options: &LogOptions) -> Result<LogReader> {
        self.record(id)?;
        Ok(Box::new(tokio::io::empty()))
    }

    pub async fn run(&self, id: &InstanceId, command: &[String], mut io: AttachIo) -> Result<()> {
        self.record(id)?;
        let options = ExecOptions {
            tty: io.tty,
            ..Default::default()
        };
        let result = self.runtime.exec(id.as_str(), command, options).await?;

        if let Some(out) = io.stdout.as_mut() {
            out.write_all(&result.stdout).await?;
            out.flush().await?;
        }
        if let Some(err) = io.stderr.as_mut() {
            err.write_all(&result.stderr).await?;
            err.flush().await?;
        }

        if !result.is_success() {
            return Err(Error::ExecFailed {
                container: id.to_string(),
                reason: format!("command exited with code {}", result.exit_code),
            });
        }
        Ok(())
    }

    pub async fn create_volume(&self, id: &InstanceId, _volume: &ResolvedVolume) -> Result<()> {
        debug!(volume = %id, "volumes are mounted at create");
        Ok(())
    }

    pub async fn delete_volume(&self, id: &InstanceId) -> Result<()> {
        debug!(volume = %id, "volumes are removed with their instance");
        Ok(())
    }

    pub async fn wait(&self, id: &InstanceId) -> Result<InstanceStatus> {
        match self.runtime.wait(id.as_str()).await {
            Ok(_) => {}
            Err(Error::NotSupported(_)) => loop {
                if self.status(id).await?.state.is_terminated() {
                    break;
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            },
            Err(e) => return Err(e),
        }
        self.status(id).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove volume directory"),
    }
}
