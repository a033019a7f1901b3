//! # fledge
//!
//! **Backend abstraction and instance orchestration for Kubernetes-style pods**
//!
//! fledge runs each container of a pod as an *instance* on one of several
//! execution backends, chosen by the container's image, behind a single
//! lifecycle:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             Provider                                │
//! │   PodSpec → per container: id → image config → backend → volumes  │
//! │             create (init first) → start → status / logs / delete   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        Instance (id + backend)                      │
//! ├──────────────────────┬──────────────────────┬───────────────────────┤
//! │  ContainerBackend    │  VmBackend           │  NullBackend          │
//! │  OCI bundle + youki  │  OSv disk + QEMU     │  no-op                │
//! │  bind mounts         │  virtiofsd extras    │                       │
//! ├──────────────────────┴──────────────────────┴───────────────────────┤
//! │  ImageResolver (registry, blob store, disk images)                  │
//! │  VolumeTranslator (host paths, secrets, config maps, projections)   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Instance State
//!
//! Every backend reports the same three states:
//!
//! ```text
//!   Waiting ──start──▶ Running ──exit──▶ Terminated
//! ```
//!
//! The container backend derives the state from the OCI runtime on every
//! query. The VM backend keeps a record written by `start` and by a
//! per-instance exit watcher.
//!
//! # Backend Selection
//!
//! | Image config `backend` | Backend |
//! |------------------------|---------|
//! | absent or empty | configured default (`containerd`) |
//! | `containerd` / `container` | [`backend::ContainerBackend`] |
//! | `osv` / `vm` | [`backend::VmBackend`] (requires `hypervisor: qemu`) |
//! | `null` / `dummy` | [`backend::NullBackend`] |
//! | anything else | [`Error::UnsupportedBackend`] |
//!
//! # On-disk Layout
//!
//! Everything lives under the configured root (`~/.fledge`) and is kept
//! until explicitly deleted:
//!
//! ```text
//! <root>/
//! ├── blobs/sha256/<2>/<hash>            container image layers
//! ├── bundles/<instance-id>/             OCI bundles
//! ├── images/fledge/<clean-name>/        OSv disk images + index.yaml
//! ├── instances/qemu/<instance-id>/      osv.config, osv.monitor, osv.socket, osv.logs
//! └── volumes/{qemu,containerd}/         virtio-fs sockets, materialized volumes
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fledge::{Config, PodSpec, Provider, StaticResources};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> fledge::Result<()> {
//!     let provider = Provider::from_config(Config::default(), Arc::new(StaticResources::new()))?;
//!     let pod = PodSpec::from_yaml(&std::fs::read("pod.yaml")?)?;
//!     let report = provider.create_pod(&pod).await?;
//!     println!("{:?}", provider.pod_status(&pod.namespace, &pod.name).await?);
//!     provider.delete_pod(&pod.namespace, &pod.name).await
//! }
//! ```

pub mod backend;
pub mod bundle;
pub mod config;
pub mod constants;
pub mod error;
pub mod id;
pub mod image;
pub mod instance;
pub mod platform;
pub mod pod;
pub mod portmap;
pub mod provider;
pub mod registry;
pub mod resources;
pub mod runtime;
pub mod runtimes;
pub mod storage;
pub mod volume;

// Re-exports
pub use backend::{
    AttachIo, Backend, BackendKind, ContainerBackend, InstanceSpec, LogOptions, NullBackend,
    VmBackend,
};
pub use config::Config;
pub use error::{Error, Result};
pub use id::InstanceId;
pub use image::{ImageConfig, ImageResolver};
pub use instance::Instance;
pub use platform::{Arch, Capability, Os, Platform};
pub use pod::{InstanceState, InstanceStatus, PodPhase, PodSpec, PodStatus};
pub use provider::{ContainerFailure, PodReport, Provider};
pub use registry::{ImageRef, OciRegistry, Registry};
pub use resources::{ResourceLookup, StaticResources};
pub use runtime::{OciRuntime, Signal};
pub use runtimes::YoukiRuntime;
pub use storage::{BlobStore, ImageRepository};
