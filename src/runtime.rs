//! OCI runtime trait used by the container backend.
//!
//! The standard lifecycle of a single container:
//! - `create`: create a container from an OCI bundle
//! - `start`: start a created container
//! - `state`: query its state, live
//! - `kill`: send a signal to its processes
//! - `delete`: remove it
//!
//! `exec` and `wait` are optional and default to `NotSupported`.
//!
//! See: https://github.com/opencontainers/runtime-spec/blob/main/runtime.md

use crate::constants::OCI_RUNTIME_SPEC_VERSION;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// =============================================================================
// Container State
// =============================================================================

/// OCI runtime container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is being created.
    Creating,
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container has stopped.
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// OCI runtime container state, plus what the runtime knows about the
/// process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Absolute path to the bundle directory.
    pub bundle: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// When the container process was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Exit code once stopped, when the runtime observed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ContainerState {
    pub fn new(id: impl Into<String>, bundle: impl Into<String>, status: ContainerStatus) -> Self {
        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            id: id.into(),
            status,
            pid: None,
            bundle: bundle.into(),
            annotations: HashMap::new(),
            started_at: None,
            exit_code: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Signal to send to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
    Usr1,
    Usr2,
}

impl Signal {
    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
        }
    }

    /// Parses a signal name or number (`SIGTERM`, `TERM`, `15`).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.to_uppercase();
        let s = s.strip_prefix("SIG").unwrap_or(&s);
        match s {
            "TERM" | "15" => Some(Self::Term),
            "KILL" | "9" => Some(Self::Kill),
            "HUP" | "1" => Some(Self::Hup),
            "INT" | "2" => Some(Self::Int),
            "USR1" | "10" => Some(Self::Usr1),
            "USR2" | "12" => Some(Self::Usr2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
            Self::Usr1 => write!(f, "SIGUSR1"),
            Self::Usr2 => write!(f, "SIGUSR2"),
        }
    }
}

// =============================================================================
// Exec
// =============================================================================

/// Options for executing a command in a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Environment variables to add.
    pub env: Vec<(String, String)>,
    /// Working directory override.
    pub working_dir: Option<String>,
    /// Allocate TTY.
    pub tty: bool,
}

/// Result of command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

// =============================================================================
// OCI Runtime Trait
// =============================================================================

/// OCI runtime interface for single containers.
///
/// ```text
/// create(id, bundle) → start(id) → [exec(id, ...)] → kill(id, signal) → delete(id)
/// ```
///
/// `state` is always a live query; implementations must not cache it.
#[async_trait]
pub trait OciRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Checks if this runtime is available on the current platform.
    fn is_available(&self) -> bool;

    /// Returns the reason why this runtime is unavailable (if any).
    fn unavailable_reason(&self) -> Option<String>;

    /// Creates a container from an OCI bundle without starting it.
    async fn create(&self, id: &str, bundle: &Path) -> Result<()>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Gets the current state of a container.
    async fn state(&self, id: &str) -> Result<ContainerState>;

    /// Sends a signal to the container's init process, or to all its
    /// processes when `all` is set.
    async fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()>;

    /// Deletes a container; `force` kills it first if still running.
    async fn delete(&self, id: &str, force: bool) -> Result<()>;

    /// Executes a command in a running container.
    async fn exec(&self, id: &str, command: &[String], opts: ExecOptions) -> Result<ExecResult> {
        let _ = (id, command, opts);
        Err(Error::NotSupported(format!(
            "exec not supported by {} runtime",
            self.name()
        )))
    }

    /// Waits for a container to exit and returns its exit code.
    async fn wait(&self, id: &str) -> Result<i32> {
        let _ = id;
        Err(Error::NotSupported(format!(
            "wait not supported by {} runtime",
            self.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parsing() {
        assert_eq!(Signal::parse("SIGTERM"), Some(Signal::Term));
        assert_eq!(Signal::parse("TERM"), Some(Signal::Term));
        assert_eq!(Signal::parse("15"), Some(Signal::Term));
        assert_eq!(Signal::parse("sigkill"), Some(Signal::Kill));
        assert_eq!(Signal::parse("INVALID"), None);
        assert_eq!(Signal::Kill.as_i32(), libc::SIGKILL);
    }

    #[test]
    fn test_container_state() {
        let state = ContainerState::new("c1", "/bundles/c1", ContainerStatus::Running);
        assert!(state.is_running());
        assert_eq!(state.oci_version, OCI_RUNTIME_SPEC_VERSION);
        assert_eq!(state.exit_code, None);
    }
}
