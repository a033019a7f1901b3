//! Execution backends.
//!
//! A [`Backend`] runs instances of one execution model behind the uniform
//! lifecycle every caller sees:
//!
//! | Backend | Name | Executes with | Status source |
//! |---------|------|---------------|---------------|
//! | [`ContainerBackend`] | `containerd` | OCI runtime (youki) | live runtime query |
//! | [`VmBackend`] | `osv` | QEMU + virtiofsd | record kept by the exit watcher |
//! | [`NullBackend`] | `null` | nothing | always `Terminated(0)` |
//!
//! ```text
//!   create_volume* ──▶ create ──▶ start ──▶ [status | logs | run | kill]* ──▶ delete ──▶ delete_volume*
//! ```
//!
//! Errors leaving a backend are tagged with its name through
//! [`Error::in_backend`], so `is_not_found` still sees the cause.

mod container;
mod null;
pub mod qemu;
mod vm;

pub use container::ContainerBackend;
pub use null::NullBackend;
pub use vm::VmBackend;

use crate::error::{Error, Result};
use crate::id::InstanceId;
use crate::image::ImageConfig;
use crate::pod::{ContainerSpec, InstanceStatus, VolumeMount};
use crate::runtime::Signal;
use crate::volume::ResolvedVolume;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

// =============================================================================
// Backend Kind
// =============================================================================

/// Backend selector, as declared by an image's `backend` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// OCI containers.
    Container,
    /// OSv unikernels on QEMU.
    Vm,
    /// Does nothing; every instance reports success.
    Null,
}

impl BackendKind {
    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Container => "containerd",
            Self::Vm => "osv",
            Self::Null => "null",
        }
    }

    /// Parses a backend name or alias.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "containerd" | "container" => Ok(Self::Container),
            "osv" | "vm" => Ok(Self::Vm),
            "null" | "dummy" => Ok(Self::Null),
            _ => Err(Error::UnsupportedBackend(name.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Instance Inputs
// =============================================================================

/// A volume mounted by an instance, already created on its backend.
#[derive(Debug, Clone)]
pub struct MountedVolume {
    /// Volume id: the instance id with the volume name as last part.
    pub id: InstanceId,
    pub mount: VolumeMount,
    pub volume: ResolvedVolume,
}

/// Everything a backend needs to create one instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub container: ContainerSpec,
    pub image_config: ImageConfig,
    pub hostname: Option<String>,
    /// Mounted volumes in mount order.
    pub volumes: Vec<MountedVolume>,
}

/// Log retrieval options.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Only the last N lines.
    pub tail_lines: Option<usize>,
}

/// Reader over an instance's logs.
pub type LogReader = Box<dyn AsyncRead + Send + Unpin>;

/// Caller streams handed to [`Backend::run`].
#[derive(Default)]
pub struct AttachIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub tty: bool,
}

impl fmt::Debug for AttachIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("tty", &self.tty)
            .finish()
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Closed set of execution backends.
pub enum Backend {
    Container(ContainerBackend),
    Vm(VmBackend),
    Null(NullBackend),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            Backend::Container($b) => $call.await,
            Backend::Vm($b) => $call.await,
            Backend::Null($b) => $call.await,
        }
        .map_err(|e| e.in_backend($self.kind()))
    };
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Container(_) => BackendKind::Container,
            Self::Vm(_) => BackendKind::Vm,
            Self::Null(_) => BackendKind::Null,
        }
    }

    /// Allocates backend resources for `id` without starting it.
    ///
    /// An existing instance with the same id is cleaned up first.
    pub async fn create(&self, id: &InstanceId, spec: &InstanceSpec) -> Result<()> {
        dispatch!(self, b => b.create(id, spec))
    }

    /// Begins execution: Waiting → Running.
    pub async fn start(&self, id: &InstanceId) -> Result<()> {
        dispatch!(self, b => b.start(id))
    }

    /// Delivers `signal`. Termination is observed, not set, here.
    pub async fn kill(&self, id: &InstanceId, signal: Signal) -> Result<()> {
        dispatch!(self, b => b.kill(id, signal))
    }

    pub async fn delete(&self, id: &InstanceId) -> Result<()> {
        dispatch!(self, b => b.delete(id))
    }

    pub async fn status(&self, id: &InstanceId) -> Result<InstanceStatus> {
        dispatch!(self, b => b.status(id))
    }

    pub async fn logs(&self, id: &InstanceId, options: &LogOptions) -> Result<LogReader> {
        dispatch!(self, b => b.logs(id, options))
    }

    /// Runs `command` inside the instance with the caller's streams.
    pub async fn run(&self, id: &InstanceId, command: &[String], io: AttachIo) -> Result<()> {
        dispatch!(self, b => b.run(id, command, io))
    }

    pub async fn create_volume(&self, id: &InstanceId, volume: &ResolvedVolume) -> Result<()> {
        dispatch!(self, b => b.create_volume(id, volume))
    }

    pub async fn delete_volume(&self, id: &InstanceId) -> Result<()> {
        dispatch!(self, b => b.delete_volume(id))
    }

    /// Resolves once the instance is Terminated and returns that status.
    pub async fn wait(&self, id: &InstanceId) -> Result<InstanceStatus> {
        dispatch!(self, b => b.wait(id))
    }

    /// Cancels background work owned by the backend.
    pub async fn shutdown(&self) -> Result<()> {
        dispatch!(self, b => b.shutdown())
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.kind()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names() {
        assert_eq!(BackendKind::from_name("containerd").unwrap(), BackendKind::Container);
        assert_eq!(BackendKind::from_name("container").unwrap(), BackendKind::Container);
        assert_eq!(BackendKind::from_name("OSv").unwrap(), BackendKind::Vm);
        assert_eq!(BackendKind::from_name("dummy").unwrap(), BackendKind::Null);
        assert!(matches!(
            BackendKind::from_name("wasm"),
            Err(Error::UnsupportedBackend(name)) if name == "wasm"
        ));
        assert_eq!(BackendKind::Vm.to_string(), "osv");
    }

    #[tokio::test]
    async fn test_errors_are_tagged() {
        let backend = Backend::Null(NullBackend::new());
        let id = InstanceId::from_parts("default", "web", "app").unwrap();

        let err = backend.status(&id).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("null: "));
    }
}
