//! # Pods
//!
//! Kubernetes-compatible pod manifests and the status types reported back
//! for them.
//!
//! A pod is the unit the [`Provider`](crate::provider::Provider) accepts.
//! Every container in it becomes one instance, possibly on a different
//! backend than its siblings:
//!
//! ```text
//!   PodSpec
//!     ├── initContainers  ──▶ instance, instance, ...   (started first)
//!     ├── containers      ──▶ instance, instance, ...
//!     └── volumes         ──▶ resolved per mounting container
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use fledge::pod::PodSpec;
//!
//! let spec = PodSpec::from_yaml(manifest)?;
//! for (container, is_init) in spec.ordered_containers() {
//!     println!("{} init={}", container.name, is_init);
//! }
//! ```

mod spec;
mod state;

pub use spec::{
    ContainerPort, ContainerSpec, EnvVar, HostPathType, KeyToPath, MAX_CONTAINERS_PER_POD,
    MAX_MANIFEST_SIZE, MAX_VOLUMES_PER_POD, ObjectSource, PodSpec, ProjectionSource, PullPolicy,
    ResourceRequirements, Volume, VolumeMount, VolumeSource,
};
pub use state::{ExitEvent, InstanceState, InstanceStatus, PodPhase, PodStatus, PodSummary};
