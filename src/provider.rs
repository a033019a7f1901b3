//! Pod orchestration over the backends.
//!
//! The provider turns a [`PodSpec`] into instances, one per container,
//! each owned by the backend its image declares:
//!
//! ```text
//! create_pod
//!   ├─ for each container (init first, then regular):
//!   │    id ─▶ normalize image ─▶ resolve config ─▶ pick backend
//!   │       ─▶ translate volumes ─▶ create_volume* ─▶ create
//!   │    (a failure is recorded; siblings continue)
//!   └─ once all were attempted, start in the same order
//!        WaitForCompletion: each init container is awaited; a failed or
//!        non-zero init container blocks everything after it
//! ```
//!
//! Pods and instances live in two lock-guarded maps. An instance leaves
//! its map only after its backend confirmed the delete.

use crate::backend::{
    AttachIo, Backend, BackendKind, ContainerBackend, InstanceSpec, LogOptions, LogReader,
    MountedVolume, NullBackend, VmBackend,
};
use crate::config::{Config, InitOrdering};
use crate::error::{Error, Result};
use crate::id::InstanceId;
use crate::image::{ImageConfig, ImageResolver};
use crate::instance::Instance;
use crate::platform::Platform;
use crate::pod::{ContainerSpec, InstanceState, InstanceStatus, PodPhase, PodSpec, PodStatus, PodSummary};
use crate::registry::{ImageRef, OciRegistry};
use crate::resources::ResourceLookup;
use crate::runtime::Signal;
use crate::runtimes::YoukiRuntime;
use crate::storage::{BlobStore, ImageRepository};
use crate::volume::VolumeTranslator;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

// =============================================================================
// Reports
// =============================================================================

/// Lifecycle step a container failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureStage {
    Create,
    Start,
}

impl FailureStage {
    fn reason(self) -> &'static str {
        match self {
            Self::Create => "CreateFailed",
            Self::Start => "StartFailed",
        }
    }
}

/// A container that could not be created or started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFailure {
    pub container: String,
    pub init: bool,
    pub stage: FailureStage,
    pub message: String,
}

/// Outcome of [`Provider::create_pod`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodReport {
    pub created: Vec<InstanceId>,
    pub started: Vec<InstanceId>,
    pub failures: Vec<ContainerFailure>,
}

// =============================================================================
// Provider
// =============================================================================

#[derive(Debug, Clone)]
struct PodRecord {
    spec: PodSpec,
    /// Container name → failure.
    failures: HashMap<String, ContainerFailure>,
    /// Init container blocking the rest of the pod.
    blocked_by: Option<String>,
    /// Containers left unstarted behind `blocked_by`.
    skipped: HashSet<String>,
    /// Volumes created on a backend, in creation order.
    volumes: Vec<(InstanceId, BackendKind)>,
}

impl PodRecord {
    fn new(spec: PodSpec) -> Self {
        Self {
            spec,
            failures: HashMap::new(),
            blocked_by: None,
            skipped: HashSet::new(),
            volumes: Vec::new(),
        }
    }
}

/// Schedules pods onto the enabled backends.
pub struct Provider {
    config: Config,
    backends: HashMap<BackendKind, Arc<Backend>>,
    images: Arc<ImageResolver>,
    volumes: VolumeTranslator,
    pods: RwLock<HashMap<String, PodRecord>>,
    instances: RwLock<HashMap<InstanceId, Instance>>,
}

fn pod_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl Provider {
    /// Provider over explicit backends.
    pub fn new(
        config: Config,
        backends: Vec<Backend>,
        images: Arc<ImageResolver>,
        resources: Arc<dyn ResourceLookup>,
    ) -> Self {
        let backends = backends
            .into_iter()
            .map(|b| (b.kind(), Arc::new(b)))
            .collect();
        Self {
            config,
            backends,
            images,
            volumes: VolumeTranslator::new(resources),
            pods: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Provider with the production stack: an OCI registry client, youki
    /// for containers and QEMU for VMs, for every enabled backend.
    pub fn from_config(config: Config, resources: Arc<dyn ResourceLookup>) -> Result<Self> {
        let root = config.root_dir.clone();
        let blobs = Arc::new(BlobStore::under_root(&root)?);
        let images = Arc::new(ImageResolver::new(
            Arc::new(OciRegistry::new(&config.insecure_registries)),
            ImageRepository::under_root(&root)?,
            blobs,
        ));

        let platform = Platform::detect();
        let mut backends = Vec::new();
        for kind in config.enabled_backends() {
            let backend = match kind {
                BackendKind::Container => {
                    let runtime = YoukiRuntime::with_state_root(config.container.state_root.clone());
                    Backend::Container(ContainerBackend::new(
                        Arc::new(runtime),
                        Arc::clone(&images),
                        &root,
                    )?)
                }
                BackendKind::Vm => {
                    Backend::Vm(VmBackend::new(&config, Arc::clone(&images), platform.has_kvm()))
                }
                BackendKind::Null => Backend::Null(NullBackend::new()),
            };
            info!(backend = %kind, "enabled backend");
            backends.push(backend);
        }

        Ok(Self::new(config, backends, images, resources))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Backend owning images with this config.
    ///
    /// An image without a declared backend goes to the default backend.
    fn select_backend(&self, image: &ImageConfig) -> Result<Arc<Backend>> {
        let name = image
            .backend
            .as_deref()
            .filter(|b| !b.is_empty())
            .unwrap_or(&self.config.default_backend);
        let kind = BackendKind::from_name(name)?;
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnsupportedBackend(name.to_string()))
    }

    fn instance(&self, id: &InstanceId) -> Result<Instance> {
        self.instances
            .read()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
    }

    fn pod_record(&self, namespace: &str, name: &str) -> Result<PodRecord> {
        let key = pod_key(namespace, name);
        self.pods
            .read()?
            .get(&key)
            .cloned()
            .ok_or(Error::PodNotFound(key))
    }

    fn update_pod_record<F>(&self, key: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut PodRecord),
    {
        match self.pods.write()?.get_mut(key) {
            Some(record) => {
                update(record);
                Ok(())
            }
            None => Err(Error::PodNotFound(key.to_string())),
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates every container of `pod`, then starts them.
    ///
    /// Per-container failures are logged and reported, never returned;
    /// only a pod name collision fails the call.
    pub async fn create_pod(&self, pod: &PodSpec) -> Result<PodReport> {
        let key = pod_key(&pod.namespace, &pod.name);
        {
            let mut pods = self.pods.write()?;
            if pods.contains_key(&key) {
                return Err(Error::NameCollision(key));
            }
            pods.insert(key.clone(), PodRecord::new(pod.clone()));
        }
        info!(pod = %key, "creating pod");

        let mut report = PodReport::default();
        let mut slots: Vec<(&ContainerSpec, bool, Option<Instance>)> = Vec::new();

        for (container, init) in pod.ordered_containers() {
            match self.create_container(&key, pod, container).await {
                Ok(instance) => {
                    report.created.push(instance.id().clone());
                    slots.push((container, init, Some(instance)));
                }
                Err(e) => {
                    error!(pod = %key, container = %container.name, error = %e, "failed to create container");
                    report
                        .failures
                        .push(self.record_failure(&key, container, init, FailureStage::Create, &e)?);
                    slots.push((container, init, None));
                }
            }
        }

        let wait_for_init = self.config.init_ordering == InitOrdering::WaitForCompletion;
        let mut blocked_by: Option<String> = None;

        for (container, init, instance) in slots {
            if let Some(blocker) = &blocked_by {
                debug!(pod = %key, container = %container.name, blocker = %blocker, "not starting, pod is initializing");
                self.update_pod_record(&key, |r| {
                    r.skipped.insert(container.name.clone());
                })?;
                continue;
            }

            let Some(instance) = instance else {
                if init && wait_for_init {
                    blocked_by = Some(container.name.clone());
                }
                continue;
            };

            if let Err(e) = instance.start().await {
                error!(pod = %key, container = %container.name, error = %e, "failed to start container");
                report
                    .failures
                    .push(self.record_failure(&key, container, init, FailureStage::Start, &e)?);
                if init && wait_for_init {
                    blocked_by = Some(container.name.clone());
                }
                continue;
            }
            report.started.push(instance.id().clone());

            if init && wait_for_init {
                match instance.wait().await {
                    Ok(status) if status.state.exit_code() == Some(0) => {
                        debug!(pod = %key, container = %container.name, "init container completed");
                    }
                    Ok(status) => {
                        warn!(pod = %key, container = %container.name, exit_code = ?status.state.exit_code(), "init container failed");
                        blocked_by = Some(container.name.clone());
                    }
                    Err(e) => {
                        warn!(pod = %key, container = %container.name, error = %e, "failed to wait for init container");
                        blocked_by = Some(container.name.clone());
                    }
                }
            }
        }

        if blocked_by.is_some() {
            self.update_pod_record(&key, |r| r.blocked_by = blocked_by)?;
        }

        info!(
            pod = %key,
            created = report.created.len(),
            started = report.started.len(),
            failed = report.failures.len(),
            "pod created"
        );
        Ok(report)
    }

    async fn create_container(
        &self,
        key: &str,
        pod: &PodSpec,
        container: &ContainerSpec,
    ) -> Result<Instance> {
        let id = InstanceId::from_parts(&pod.namespace, &pod.name, &container.name)?;
        if self.instances.read()?.contains_key(&id) {
            return Err(Error::NameCollision(id.to_string()));
        }

        let mut container = container.clone();
        container.image = ImageRef::normalize(&container.image)?;

        let image_config = self.images.resolve_config(&container.image).await?;
        let backend = self.select_backend(&image_config)?;
        debug!(instance = %id, backend = %backend.kind(), image = %container.image, "selected backend");

        let mut volumes = Vec::with_capacity(container.volume_mounts.len());
        for mount in &container.volume_mounts {
            let volume = pod.volume(&mount.name).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "container '{}' mounts unknown volume '{}'",
                    container.name, mount.name
                ))
            })?;
            let resolved = self.volumes.translate(&pod.namespace, volume).await?;
            let volume_id = id.with_last(&mount.name)?;

            let entry = (volume_id.clone(), backend.kind());
            let exists = self.pod_record_volumes(key)?.contains(&entry);
            if !exists {
                backend.create_volume(&volume_id, &resolved).await?;
                self.update_pod_record(key, |r| r.volumes.push(entry))?;
            }

            volumes.push(MountedVolume {
                id: volume_id,
                mount: mount.clone(),
                volume: resolved,
            });
        }

        let spec = InstanceSpec {
            container,
            image_config,
            hostname: pod.hostname.clone(),
            volumes,
        };
        let instance = Instance::new(id.clone(), backend);
        instance.create(&spec).await?;

        self.instances.write()?.insert(id, instance.clone());
        Ok(instance)
    }

    fn pod_record_volumes(&self, key: &str) -> Result<Vec<(InstanceId, BackendKind)>> {
        Ok(self
            .pods
            .read()?
            .get(key)
            .map(|r| r.volumes.clone())
            .unwrap_or_default())
    }

    fn record_failure(
        &self,
        key: &str,
        container: &ContainerSpec,
        init: bool,
        stage: FailureStage,
        error: &Error,
    ) -> Result<ContainerFailure> {
        let failure = ContainerFailure {
            container: container.name.clone(),
            init,
            stage,
            message: error.to_string(),
        };
        let recorded = failure.clone();
        self.update_pod_record(key, |r| {
            r.failures.insert(recorded.container.clone(), recorded);
        })?;
        Ok(failure)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_pod(&self, namespace: &str, name: &str) -> Result<PodSpec> {
        Ok(self.pod_record(namespace, name)?.spec)
    }

    pub async fn list_pods(&self) -> Result<Vec<PodSummary>> {
        let mut keys: Vec<(String, String)> = self
            .pods
            .read()?
            .values()
            .map(|r| (r.spec.namespace.clone(), r.spec.name.clone()))
            .collect();
        keys.sort();

        let mut pods = Vec::with_capacity(keys.len());
        for (namespace, name) in keys {
            let record = match self.pod_record(&namespace, &name) {
                Ok(record) => record,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let status = self.status_of(&record).await?;
            pods.push(PodSummary {
                namespace,
                name,
                phase: status.phase,
                container_count: record.spec.containers.len() + record.spec.init_containers.len(),
            });
        }
        Ok(pods)
    }

    /// Phase and per-container statuses of a pod.
    pub async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus> {
        let record = self.pod_record(namespace, name)?;
        self.status_of(&record).await
    }

    pub async fn container_status(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<InstanceStatus> {
        let record = self.pod_record(namespace, pod)?;
        let (spec, _) = record
            .spec
            .ordered_containers()
            .find(|(c, _)| c.name == container)
            .ok_or_else(|| Error::InstanceNotFound(format!("{}/{}/{}", namespace, pod, container)))?;
        self.container_status_of(&record, spec).await
    }

    async fn status_of(&self, record: &PodRecord) -> Result<PodStatus> {
        let mut init_statuses = Vec::new();
        let mut statuses = Vec::new();
        for (container, init) in record.spec.ordered_containers() {
            let status = self.container_status_of(record, container).await?;
            if init {
                init_statuses.push(status);
            } else {
                statuses.push(status);
            }
        }

        let phase = PodPhase::aggregate(
            init_statuses.iter().chain(statuses.iter()).map(|s| &s.state),
            !record.failures.is_empty(),
        );

        let message = if !record.failures.is_empty() {
            let mut names: Vec<&str> = record.failures.keys().map(String::as_str).collect();
            names.sort();
            Some(format!("containers failed: {}", names.join(", ")))
        } else {
            record
                .blocked_by
                .as_ref()
                .map(|b| format!("blocked by init container '{}'", b))
        };

        Ok(PodStatus {
            phase,
            init_container_statuses: init_statuses,
            container_statuses: statuses,
            message,
        })
    }

    /// Live status, or the synthesized one for failed and blocked
    /// containers.
    async fn container_status_of(
        &self,
        record: &PodRecord,
        container: &ContainerSpec,
    ) -> Result<InstanceStatus> {
        let synthesized = |reason: &str, message: &str| {
            InstanceStatus::with_state(
                &container.name,
                &container.image,
                "",
                InstanceState::waiting(reason, message),
            )
        };

        if let Some(failure) = record.failures.get(&container.name) {
            return Ok(synthesized(failure.stage.reason(), &failure.message));
        }
        if record.skipped.contains(&container.name)
            && let Some(blocker) = &record.blocked_by
        {
            return Ok(synthesized(
                "PodInitializing",
                &format!("waiting for init container '{}'", blocker),
            ));
        }

        let id = InstanceId::from_parts(&record.spec.namespace, &record.spec.name, &container.name)?;
        match self.instance(&id) {
            Ok(instance) => instance.status().await,
            Err(e) if e.is_not_found() => Ok(synthesized("Unknown", "instance is not registered")),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Per-container operations
    // =========================================================================

    fn container_instance(&self, namespace: &str, pod: &str, container: &str) -> Result<Instance> {
        self.instance(&InstanceId::from_parts(namespace, pod, container)?)
    }

    pub async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<LogReader> {
        self.container_instance(namespace, pod, container)?
            .logs(options)
            .await
    }

    pub async fn run_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        io: AttachIo,
    ) -> Result<()> {
        self.container_instance(namespace, pod, container)?
            .run(command, io)
            .await
    }

    pub async fn kill_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        signal: Signal,
    ) -> Result<()> {
        self.container_instance(namespace, pod, container)?
            .kill(signal)
            .await
    }

    // =========================================================================
    // Delete / Update / Shutdown
    // =========================================================================

    /// Stops and deletes every instance of a pod in reverse creation
    /// order, then its volumes.
    ///
    /// The pod stays registered if any instance delete failed, so the call
    /// can be retried.
    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let record = self.pod_record(namespace, name)?;
        let key = pod_key(namespace, name);
        info!(pod = %key, "deleting pod");

        let containers: Vec<&ContainerSpec> =
            record.spec.ordered_containers().map(|(c, _)| c).collect();
        let mut failed = Vec::new();

        for container in containers.into_iter().rev() {
            let id = InstanceId::from_parts(namespace, name, &container.name)?;
            let Ok(instance) = self.instance(&id) else {
                continue;
            };

            if let Err(e) = instance.kill(Signal::Term).await {
                debug!(instance = %id, error = %e, "kill before delete failed");
            }
            match instance.delete().await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(instance = %id, "instance already gone");
                }
                Err(e) => {
                    error!(instance = %id, error = %e, "failed to delete instance");
                    failed.push(format!("{}: {}", id, e));
                    continue;
                }
            }
            self.instances.write()?.remove(&id);
        }

        if !failed.is_empty() {
            return Err(Error::DeleteFailed {
                id: key,
                reason: failed.join("; "),
            });
        }

        for (volume_id, kind) in &record.volumes {
            let Some(backend) = self.backends.get(kind) else {
                continue;
            };
            if let Err(e) = backend.delete_volume(volume_id).await {
                warn!(volume = %volume_id, error = %e, "failed to delete volume");
            }
        }

        self.pods.write()?.remove(&key);
        info!(pod = %key, "pod deleted");
        Ok(())
    }

    /// Pods are immutable once created.
    pub async fn update_pod(&self, pod: &PodSpec) -> Result<()> {
        Err(Error::NotSupported(format!(
            "updating pod '{}'",
            pod_key(&pod.namespace, &pod.name)
        )))
    }

    /// Cancels background work in every backend.
    pub async fn shutdown(&self) -> Result<()> {
        for (kind, backend) in &self.backends {
            if let Err(e) = backend.shutdown().await {
                warn!(backend = %kind, error = %e, "backend shutdown failed");
            }
        }
        info!("provider shut down");
        Ok(())
    }
}
