//! # Youki OCI Runtime
//!
//! Implements [`OciRuntime`] with youki's `libcontainer`: namespaces and
//! cgroups v2 on Linux.
//!
//! | Requirement | Check | Fallback |
//! |-------------|-------|----------|
//! | Linux OS | compile time | stub, every call is `RuntimeUnavailable` |
//! | Namespaces | `/proc/self/ns/pid` exists | not available |
//! | State dir | `state_root` can be created | not available |
//!
//! ## Exit codes
//!
//! The container init process is a child of this process, so its exit
//! status is collected with `waitpid(WNOHANG)` the first time the container
//! is observed stopped, and cached from then on. A signalled process
//! reports `128 + signal`.
//!
//! ## State
//!
//! Every [`OciRuntime::state`] call reloads the libcontainer state file and
//! refreshes it from `/proc`; nothing is cached except exit codes.
//!
//! [`OciRuntime`]: crate::runtime::OciRuntime

#[cfg(target_os = "linux")]
mod linux {
    use crate::constants::{
        DEFAULT_CONTAINER_STATE_ROOT, MAX_CONTAINERS, WAIT_POLL_INTERVAL, validate_container_id,
    };
    use crate::error::{Error, Result};
    use crate::runtime::{
        ContainerState, ContainerStatus, ExecOptions, ExecResult, OciRuntime, Signal,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::RwLock;
    use tracing::{debug, info};

    use libcontainer::container::builder::ContainerBuilder;
    use libcontainer::container::{Container, ContainerStatus as YoukiStatus};
    use libcontainer::signal::Signal as LibcontainerSignal;
    use libcontainer::syscall::syscall::SyscallType;

    #[derive(Debug, Clone)]
    struct ContainerInfo {
        bundle: PathBuf,
        /// Init PID, captured at start.
        init_pid: Option<i32>,
        /// Set once waitpid has reaped the init process.
        exit_code: Option<i32>,
    }

    /// Youki OCI runtime using libcontainer.
    ///
    /// Containers are not cleaned up on drop; call `delete()`.
    pub struct YoukiRuntime {
        available: bool,
        reason: Option<String>,
        state_root: PathBuf,
        containers: RwLock<HashMap<String, ContainerInfo>>,
    }

    impl YoukiRuntime {
        /// Runtime with the default state directory.
        pub fn new() -> Self {
            Self::with_state_root(PathBuf::from(DEFAULT_CONTAINER_STATE_ROOT))
        }

        pub fn with_state_root(state_root: PathBuf) -> Self {
            let (available, reason) = Self::check_availability(&state_root);

            Self {
                available,
                reason,
                state_root,
                containers: RwLock::new(HashMap::new()),
            }
        }

        fn check_availability(state_root: &Path) -> (bool, Option<String>) {
            if !Path::new("/proc/self/ns/pid").exists() {
                return (false, Some("Linux namespaces not available".to_string()));
            }

            if let Err(e) = std::fs::create_dir_all(state_root) {
                return (false, Some(format!("cannot create state dir: {}", e)));
            }

            info!(state_root = %state_root.display(), "youki runtime available");
            (true, None)
        }

        fn ensure_available(&self) -> Result<()> {
            if self.available {
                return Ok(());
            }
            Err(Error::RuntimeUnavailable {
                runtime: "youki".to_string(),
                reason: self.reason.clone().unwrap_or_default(),
            })
        }

        fn load_container(&self, id: &str) -> Result<Container> {
            let container_dir = self.state_root.join(id);
            if !container_dir.exists() {
                return Err(Error::ContainerNotFound(id.to_string()));
            }

            Container::load(container_dir)
                .map_err(|e| Error::Internal(format!("failed to load container {}: {}", id, e)))
        }

        /// Exit code of a stopped container, reaping its init process on
        /// first use. Falls back to 0 when the status cannot be collected.
        fn exit_code(&self, id: &str) -> Result<i32> {
            let (init_pid, cached) = {
                let containers = self.containers.read()?;
                match containers.get(id) {
                    Some(info) => (info.init_pid, info.exit_code),
                    None => (None, None),
                }
            };
            if let Some(code) = cached {
                return Ok(code);
            }

            let code = match init_pid {
                Some(pid) => {
                    let mut status: libc::c_int = 0;
                    // SAFETY: WNOHANG never blocks; an already reaped pid
                    // yields ECHILD.
                    let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                    if result > 0 && libc::WIFEXITED(status) {
                        libc::WEXITSTATUS(status)
                    } else if result > 0 && libc::WIFSIGNALED(status) {
                        128 + libc::WTERMSIG(status)
                    } else {
                        debug!(container = %id, pid, result, "exit status unavailable, using 0");
                        0
                    }
                }
                None => 0,
            };

            if let Some(info) = self.containers.write()?.get_mut(id) {
                info.exit_code = Some(code);
            }
            Ok(code)
        }
    }

    impl Default for YoukiRuntime {
        fn default() -> Self {
            Self::new()
        }
    }

    fn signal_name(signal: Signal) -> &'static str {
        match signal {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
        }
    }

    #[async_trait]
    impl OciRuntime for YoukiRuntime {
        fn name(&self) -> &str {
            "youki"
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn unavailable_reason(&self) -> Option<String> {
            self.reason.clone()
        }

        async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
            self.ensure_available()?;
            debug!(container = %id, bundle = %bundle.display(), "creating container");

            validate_container_id(id).map_err(|reason| Error::InvalidContainerId {
                id: id.to_string(),
                reason: reason.to_string(),
            })?;

            if !bundle.join("config.json").exists() {
                return Err(Error::InvalidBundle {
                    path: bundle.to_path_buf(),
                    reason: "config.json not found".to_string(),
                });
            }

            if self.containers.read()?.len() >= MAX_CONTAINERS {
                return Err(Error::ResourceExhausted(format!(
                    "maximum container limit reached ({})",
                    MAX_CONTAINERS
                )));
            }

            let create_failed = |reason: String| Error::CreateFailed {
                id: id.to_string(),
                reason,
            };
            ContainerBuilder::new(id.to_string(), SyscallType::default())
                .with_root_path(&self.state_root)
                .map_err(|e| create_failed(format!("invalid root path: {}", e)))?
                .validate_id()
                .map_err(|e| create_failed(format!("invalid container id: {}", e)))?
                .as_init(bundle)
                .with_systemd(false)
                .build()
                .map_err(|e| create_failed(format!("build failed: {}", e)))?;

            self.containers.write()?.insert(
                id.to_string(),
                ContainerInfo {
                    bundle: bundle.to_path_buf(),
                    init_pid: None,
                    exit_code: None,
                },
            );

            info!(container = %id, "created container");
            Ok(())
        }

        async fn start(&self, id: &str) -> Result<()> {
            let mut container = self.load_container(id)?;

            container.start().map_err(|e| Error::StartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

            if let Some(pid) = container.pid()
                && let Some(info) = self.containers.write()?.get_mut(id)
            {
                info.init_pid = Some(pid.as_raw());
            }

            info!(container = %id, "started container");
            Ok(())
        }

        async fn state(&self, id: &str) -> Result<ContainerState> {
            let container = self.load_container(id)?;

            let status = match container.state.status {
                YoukiStatus::Creating => ContainerStatus::Creating,
                YoukiStatus::Created => ContainerStatus::Created,
                YoukiStatus::Running | YoukiStatus::Paused => ContainerStatus::Running,
                YoukiStatus::Stopped => ContainerStatus::Stopped,
            };

            let bundle = self
                .containers
                .read()?
                .get(id)
                .map(|c| c.bundle.to_string_lossy().to_string())
                .unwrap_or_else(|| container.state.bundle.to_string_lossy().to_string());

            let mut state = ContainerState::new(id, bundle, status);
            state.pid = container.pid().map(|p| p.as_raw() as u32);
            state.started_at = container.state.created;
            state.annotations = container.state.annotations.clone().unwrap_or_default();
            if status == ContainerStatus::Stopped {
                state.exit_code = Some(self.exit_code(id)?);
            }
            Ok(state)
        }

        async fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()> {
            let mut container = self.load_container(id)?;

            let lc_signal = LibcontainerSignal::try_from(signal_name(signal)).map_err(|e| {
                Error::SignalFailed {
                    id: id.to_string(),
                    reason: format!("invalid signal: {}", e),
                }
            })?;

            container
                .kill(lc_signal, all)
                .map_err(|e| Error::SignalFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                })?;

            info!(container = %id, %signal, all, "signalled container");
            Ok(())
        }

        async fn delete(&self, id: &str, force: bool) -> Result<()> {
            let mut container = self.load_container(id)?;

            container.delete(force).map_err(|e| Error::DeleteFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
            self.containers.write()?.remove(id);

            info!(container = %id, force, "deleted container");
            Ok(())
        }

        async fn wait(&self, id: &str) -> Result<i32> {
            loop {
                let container = self.load_container(id)?;
                if container.state.status == YoukiStatus::Stopped {
                    return self.exit_code(id);
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        }

        /// Runs `command` inside the container's namespaces with `nsenter`.
        async fn exec(
            &self,
            id: &str,
            command: &[String],
            opts: ExecOptions,
        ) -> Result<ExecResult> {
            if command.is_empty() {
                return Err(Error::ExecFailed {
                    container: id.to_string(),
                    reason: "empty command".to_string(),
                });
            }

            let state = self.state(id).await?;
            let pid = match (state.status, state.pid) {
                (ContainerStatus::Running, Some(pid)) => pid,
                _ => {
                    return Err(Error::ExecFailed {
                        container: id.to_string(),
                        reason: format!("container is {}", state.status),
                    });
                }
            };

            let mut cmd = tokio::process::Command::new("nsenter");
            cmd.arg("-t")
                .arg(pid.to_string())
                .args(["-m", "-u", "-i", "-n", "-p"]);
            if let Some(dir) = &opts.working_dir {
                cmd.arg(format!("--wd={}", dir));
            }
            cmd.arg("--");
            if !opts.env.is_empty() {
                cmd.arg("env");
                for (key, value) in &opts.env {
                    cmd.arg(format!("{}={}", key, value));
                }
            }
            cmd.args(command);

            debug!(container = %id, ?command, "exec in container");
            let output = cmd.output().await.map_err(|e| Error::ExecFailed {
                container: id.to_string(),
                reason: format!("nsenter failed: {}", e),
            })?;

            Ok(ExecResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

// =============================================================================
// Non-Linux Stub
// =============================================================================

#[cfg(not(target_os = "linux"))]
mod stub {
    use crate::error::{Error, Result};
    use crate::runtime::{ContainerState, OciRuntime, Signal};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    /// Youki needs Linux namespaces and cgroups; every call fails with
    /// `RuntimeUnavailable` elsewhere.
    pub struct YoukiRuntime {
        _private: (),
    }

    impl YoukiRuntime {
        pub fn new() -> Self {
            Self { _private: () }
        }

        pub fn with_state_root(_state_root: PathBuf) -> Self {
            Self::new()
        }
    }

    impl Default for YoukiRuntime {
        fn default() -> Self {
            Self::new()
        }
    }

    fn unavailable() -> Error {
        Error::RuntimeUnavailable {
            runtime: "youki".to_string(),
            reason: "Linux required".to_string(),
        }
    }

    #[async_trait]
    impl OciRuntime for YoukiRuntime {
        fn name(&self) -> &str {
            "youki"
        }

        fn is_available(&self) -> bool {
            false
        }

        fn unavailable_reason(&self) -> Option<String> {
            Some("youki requires Linux (namespaces, cgroups)".to_string())
        }

        async fn create(&self, _id: &str, _bundle: &Path) -> Result<()> {
            Err(unavailable())
        }

        async fn start(&self, _id: &str) -> Result<()> {
            Err(unavailable())
        }

        async fn state(&self, _id: &str) -> Result<ContainerState> {
            Err(unavailable())
        }

        async fn kill(&self, _id: &str, _signal: Signal, _all: bool) -> Result<()> {
            Err(unavailable())
        }

        async fn delete(&self, _id: &str, _force: bool) -> Result<()> {
            Err(unavailable())
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::YoukiRuntime;

#[cfg(not(target_os = "linux"))]
pub use stub::YoukiRuntime;
