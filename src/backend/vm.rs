//! OSv unikernel backend driving QEMU.
//!
//! # Instance Lifecycle
//!
//! ```text
//!  create ──▶ store osv.config, status Waiting("Created")
//!  start  ──▶ spawn virtiofsd side processes, then QEMU
//!             status Running, then spawn log-copy + exit watcher
//!  watcher ─▶ VM exits (or token cancelled → kill)
//!             stop side processes, close log, publish ExitEvent
//!             status Terminated (own generation only)
//!  delete ──▶ QMP quit, bounded wait, kill on timeout, remove dir + status
//! ```
//!
//! Status is never queried from QEMU: the record is written by `start`
//! (Running) and by the watcher (Terminated), nothing else. Each create
//! bumps a generation counter so a watcher left over from an earlier
//! instance with the same id cannot overwrite the new record.
//!
//! # Volumes
//!
//! `create_volume` turns a resolved volume into [`Extras`]: a virtiofsd
//! side process sharing the volume directory, plus the QEMU devices and
//! guest mount options to reach it. `create` merges the extras of every
//! mounted volume, numbering virtio-fs devices in mount order.

use super::qemu::{Networking, Qemu, QemuConfig};
use super::{AttachIo, InstanceSpec, LogOptions, LogReader};
use crate::config::{Config, QemuSettings, VirtiofsSettings};
use crate::constants::{
    DEFAULT_VM_COMMAND, SUPPORTED_HYPERVISOR, VM_CONTAINER_ID_PREFIX, VM_STOP_TIMEOUT, VOLUME_DIR,
};
use crate::error::{Error, Result};
use crate::id::InstanceId;
use crate::image::ImageResolver;
use crate::pod::{ExitEvent, InstanceState, InstanceStatus};
use crate::portmap::nat_rules;
use crate::runtime::Signal;
use crate::volume::{Extras, ResolvedVolume};
use chrono::Utc;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Records
// =============================================================================

struct VmRecord {
    status: InstanceStatus,
    generation: u64,
    /// Extras merged from every mounted volume.
    extras: Extras,
    /// QEMU pid while running.
    pid: Option<u32>,
    exit: Arc<watch::Sender<Option<ExitEvent>>>,
    cancel: Option<CancellationToken>,
    watcher: Option<JoinHandle<()>>,
}

type Records = Arc<RwLock<HashMap<InstanceId, VmRecord>>>;

/// Runs instances as OSv unikernels under QEMU.
pub struct VmBackend {
    qemu: Qemu,
    images: Arc<ImageResolver>,
    settings: QemuSettings,
    virtiofs: VirtiofsSettings,
    volume_dir: PathBuf,
    records: Records,
    /// Volume id → extras, filled by `create_volume`.
    volumes: RwLock<HashMap<InstanceId, Extras>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl VmBackend {
    pub fn new(config: &Config, images: Arc<ImageResolver>, kvm_available: bool) -> Self {
        Self {
            qemu: Qemu::new(&config.qemu, &config.root_dir, kvm_available),
            images,
            settings: config.qemu.clone(),
            virtiofs: config.virtiofs.clone(),
            volume_dir: config.root_dir.join(VOLUME_DIR).join("qemu"),
            records: Arc::new(RwLock::new(HashMap::new())),
            volumes: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Hypervisor collaborator, exposed for path lookups.
    pub fn qemu(&self) -> &Qemu {
        &self.qemu
    }

    // =========================================================================
    // Create
    // =========================================================================

    pub async fn create(&self, id: &InstanceId, spec: &InstanceSpec) -> Result<()> {
        let previous = self.records.read()?.get(id).map(|r| r.status.clone());
        if previous.is_some() || self.qemu.exists(id) {
            debug!(instance = %id, "cleaning up previous instance");
            if let Err(e) = self.teardown(id).await {
                warn!(instance = %id, error = %e, "failed to clean up previous instance");
            }
        }

        let container = &spec.container;
        let hypervisor = spec.image_config.hypervisor.as_deref().unwrap_or_default();
        if hypervisor != SUPPORTED_HYPERVISOR {
            return Err(Error::UnsupportedHypervisor(hypervisor.to_string()));
        }

        let image = self
            .images
            .ensure_disk_image(&container.image, hypervisor, container.image_pull_policy)
            .await?;

        let extras = self.instance_extras(spec)?;

        let mut cmd = extras.templated_options.clone();
        if self.settings.verbose {
            cmd.push("--verbose".to_string());
        }
        cmd.extend(
            container
                .command_line()
                .unwrap_or_else(|| DEFAULT_VM_COMMAND.iter().map(|s| s.to_string()).collect()),
        );

        let (networking, rules) = if container.ports.is_empty() {
            (Networking::Bridge, Vec::new())
        } else {
            (Networking::Nat, nat_rules(&container.ports))
        };

        let config = QemuConfig {
            name: id.to_string(),
            verbose: self.settings.verbose,
            cmd: cmd.join(" "),
            disable_kvm: self.settings.disable_kvm,
            instance_dir: self.qemu.instance_dir(id),
            monitor: self.qemu.monitor_path(id),
            config_file: self.qemu.config_path(id),
            aio_type: self.settings.aio_type.clone(),
            image,
            backing_file: true,
            memory_mib: self.settings.memory_mib,
            cpus: self.settings.cpus,
            networking,
            bridge: self.settings.bridge.clone(),
            nat_rules: rules,
            mac: None,
            vnc_file: self.qemu.socket_path(id),
        };
        self.qemu.store_config(&config)?;

        let status = InstanceStatus::created(
            &container.name,
            &container.image,
            &format!("{}{}", VM_CONTAINER_ID_PREFIX, id),
            previous.as_ref(),
        );
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (exit, _) = watch::channel(None);

        self.records.write()?.insert(
            id.clone(),
            VmRecord {
                status,
                generation,
                extras,
                pid: None,
                exit: Arc::new(exit),
                cancel: None,
                watcher: None,
            },
        );

        info!(instance = %id, image = %container.image, ?networking, "created VM instance");
        Ok(())
    }

    /// Merges the extras of every mounted volume. Only volumes that
    /// contribute something take a device index.
    fn instance_extras(&self, spec: &InstanceSpec) -> Result<Extras> {
        let volumes = self.volumes.read()?;
        let mut merged = Extras::default();
        let mut index = 0;

        for mounted in &spec.volumes {
            let extras = volumes
                .get(&mounted.id)
                .ok_or_else(|| Error::VolumeNotCreated(mounted.id.to_string()))?;
            if extras.is_empty() {
                continue;
            }
            merged.extend(extras.expand(index, &mounted.mount.mount_path)?);
            index += 1;
        }

        Ok(merged)
    }

    // =========================================================================
    // Start
    // =========================================================================

    pub async fn start(&self, id: &InstanceId) -> Result<()> {
        let (extras, generation) = {
            let records = self.records.read()?;
            let record = records
                .get(id)
                .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
            if !matches!(record.status.state, InstanceState::Waiting { .. }) {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: record.status.state.name().to_string(),
                    expected: "waiting".to_string(),
                });
            }
            (record.extras.clone(), record.generation)
        };

        let config = self.qemu.load_config(id)?;
        let log_path = self.qemu.log_path(id);
        tokio::fs::write(&log_path, b"").await?;
        let log = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .await?
            .into_std()
            .await;

        let start_failed = |reason: String| Error::StartFailed {
            id: id.to_string(),
            reason,
        };

        let mut sides = Vec::with_capacity(extras.side_processes.len());
        for argv in &extras.side_processes {
            match spawn_side_process(argv, &log) {
                Ok(child) => sides.push(child),
                Err(e) => {
                    stop_side_processes(sides).await;
                    return Err(start_failed(e.to_string()));
                }
            }
        }

        let mut args = extras.hypervisor_args.clone();
        args.extend(extras.shared_memory_args());
        let mut child = match self.qemu.command(&config, &args).spawn() {
            Ok(child) => child,
            Err(e) => {
                stop_side_processes(sides).await;
                return Err(start_failed(format!("failed to spawn hypervisor: {}", e)));
            }
        };
        let pid = child.id();

        let token = self.shutdown.child_token();
        let exit = {
            let mut records = self.records.write()?;
            match records.get_mut(id) {
                Some(record) if record.generation == generation => {
                    record.status.mark_running(Utc::now())?;
                    record.pid = pid;
                    record.cancel = Some(token.clone());
                    Some(Arc::clone(&record.exit))
                }
                _ => None,
            }
        };
        let Some(exit) = exit else {
            // Deleted or re-created while spawning; the dropped children die
            // with kill_on_drop.
            return Err(Error::InstanceNotFound(id.to_string()));
        };

        let log_task = tokio::spawn(copy_logs(
            child.stdout.take(),
            child.stderr.take(),
            tokio::fs::File::from_std(log.try_clone()?),
            tokio::fs::File::from_std(log),
        ));

        let watcher = tokio::spawn(watch_vm(Watch {
            records: Arc::clone(&self.records),
            id: id.clone(),
            generation,
            child,
            sides,
            log_task,
            token,
            exit,
        }));

        if let Some(record) = self.records.write()?.get_mut(id)
            && record.generation == generation
        {
            record.watcher = Some(watcher);
        }

        info!(instance = %id, pid = ?pid, "started VM");
        Ok(())
    }

    // =========================================================================
    // Kill / Delete
    // =========================================================================

    /// Signals the QEMU process. The watcher records the exit.
    pub async fn kill(&self, id: &InstanceId, signal: Signal) -> Result<()> {
        let pid = self
            .records
            .read()?
            .get(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?
            .pid;
        let Some(pid) = pid else {
            debug!(instance = %id, "VM is not running, nothing to signal");
            return Ok(());
        };

        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_i32()) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!(instance = %id, pid, "VM already exited");
                return Ok(());
            }
            return Err(Error::SignalFailed {
                id: id.to_string(),
                reason: err.to_string(),
            });
        }

        info!(instance = %id, pid, %signal, "signalled VM");
        Ok(())
    }

    pub async fn delete(&self, id: &InstanceId) -> Result<()> {
        let known = self.records.read()?.contains_key(id);
        if !known && !self.qemu.exists(id) {
            return Err(Error::InstanceNotFound(id.to_string()));
        }
        self.teardown(id).await?;
        info!(instance = %id, "deleted VM instance");
        Ok(())
    }

    /// Stops a running VM, then removes its directory and record.
    async fn teardown(&self, id: &InstanceId) -> Result<()> {
        let (cancel, watcher) = match self.records.write()?.get_mut(id) {
            Some(record) => (record.cancel.clone(), record.watcher.take()),
            None => (None, None),
        };

        if let Some(mut watcher) = watcher {
            let quit = tokio::time::timeout(VM_STOP_TIMEOUT, self.qemu.stop(id)).await;
            let graceful = matches!(quit, Ok(Ok(())));
            if !graceful {
                debug!(instance = %id, "monitor unreachable, killing VM");
            }

            if !graceful
                || tokio::time::timeout(VM_STOP_TIMEOUT, &mut watcher)
                    .await
                    .is_err()
            {
                if let Some(cancel) = &cancel {
                    cancel.cancel();
                }
                if tokio::time::timeout(VM_STOP_TIMEOUT, watcher).await.is_err() {
                    warn!(instance = %id, "VM watcher did not finish in time");
                }
            }
        } else if let Some(cancel) = cancel {
            cancel.cancel();
        }

        match self.qemu.delete(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.records.write()?.remove(id);
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Reads the record kept by `start` and the exit watcher.
    pub async fn status(&self, id: &InstanceId) -> Result<InstanceStatus> {
        self.records
            .read()?
            .get(id)
            .map(|r| r.status.clone())
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
    }

    pub async fn logs(&self, id: &InstanceId, options: &LogOptions) -> Result<LogReader> {
        if !self.records.read()?.contains_key(id) {
            return Err(Error::InstanceNotFound(id.to_string()));
        }

        let path = self.qemu.log_path(id);
        match options.tail_lines {
            None => match tokio::fs::File::open(&path).await {
                Ok(file) => Ok(Box::new(file)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Ok(Box::new(tokio::io::empty()))
                }
                Err(e) => Err(e.into()),
            },
            Some(lines) => {
                let data = match tokio::fs::read(&path).await {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                    Err(e) => return Err(e.into()),
                };
                Ok(Box::new(std::io::Cursor::new(tail(&data, lines).to_vec())))
            }
        }
    }

    /// There is no way into a running unikernel; accepted and ignored.
    pub async fn run(&self, id: &InstanceId, command: &[String], _io: AttachIo) -> Result<()> {
        if !self.records.read()?.contains_key(id) {
            return Err(Error::InstanceNotFound(id.to_string()));
        }
        debug!(instance = %id, ?command, "run is a no-op for VM instances");
        Ok(())
    }

    /// Resolves once the watcher published the exit of the current
    /// instance. An instance that was never started has nothing to wait
    /// for and fails with [`Error::InvalidState`].
    pub async fn wait(&self, id: &InstanceId) -> Result<InstanceStatus> {
        let mut exit = {
            let records = self.records.read()?;
            let record = records
                .get(id)
                .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
            if record.watcher.is_none()
                && matches!(record.status.state, InstanceState::Waiting { .. })
            {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: record.status.state.name().to_string(),
                    expected: "running or terminated".to_string(),
                });
            }
            record.exit.subscribe()
        };

        if exit.wait_for(Option::is_some).await.is_err() {
            // Sender dropped: the record was removed.
            return Err(Error::InstanceNotFound(id.to_string()));
        }
        self.status(id).await
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Prepares the virtio-fs share of a volume.
    ///
    /// Host paths are shared in place; files are written under
    /// `<root>/volumes/qemu/<volume-id>/`. An empty volume yields no extras.
    pub async fn create_volume(&self, id: &InstanceId, volume: &ResolvedVolume) -> Result<()> {
        let extras = match volume.materialize(&self.volume_data_dir(id))? {
            None => Extras::default(),
            Some(shared_dir) => {
                std::fs::create_dir_all(&self.volume_dir)?;
                Extras::virtiofs(
                    &self.volume_socket(id),
                    &shared_dir,
                    &volume.name,
                    &self.virtiofs,
                )
            }
        };

        debug!(volume = %id, empty = extras.is_empty(), "created volume");
        self.volumes.write()?.insert(id.clone(), extras);
        Ok(())
    }

    pub async fn delete_volume(&self, id: &InstanceId) -> Result<()> {
        if self.volumes.write()?.remove(id).is_none() {
            return Err(Error::VolumeNotCreated(id.to_string()));
        }

        for path in [self.volume_socket(id), self.volume_data_dir(id)] {
            let removed = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(e) = removed
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(volume = %id, path = %path.display(), error = %e, "failed to remove volume path");
            }
        }

        debug!(volume = %id, "deleted volume");
        Ok(())
    }

    fn volume_socket(&self, id: &InstanceId) -> PathBuf {
        self.volume_dir.join(format!("{}.sock", id))
    }

    fn volume_data_dir(&self, id: &InstanceId) -> PathBuf {
        self.volume_dir.join(id.as_str())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Cancels every watcher and waits for them to finalize.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        let watchers: Vec<(InstanceId, JoinHandle<()>)> = self
            .records
            .write()?
            .iter_mut()
            .filter_map(|(id, r)| r.watcher.take().map(|w| (id.clone(), w)))
            .collect();

        for (id, watcher) in watchers {
            if tokio::time::timeout(VM_STOP_TIMEOUT, watcher).await.is_err() {
                warn!(instance = %id, "VM watcher did not finish in time");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

struct Watch {
    records: Records,
    id: InstanceId,
    generation: u64,
    child: Child,
    sides: Vec<Child>,
    log_task: JoinHandle<()>,
    token: CancellationToken,
    exit: Arc<watch::Sender<Option<ExitEvent>>>,
}

/// Waits for the VM, then stops side processes, closes the log and
/// publishes the exit.
async fn watch_vm(w: Watch) {
    let Watch {
        records,
        id,
        generation,
        mut child,
        sides,
        log_task,
        token,
        exit,
    } = w;

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = token.cancelled() => None,
    };
    let outcome = match exited {
        Some(status) => status,
        None => {
            debug!(instance = %id, "watcher cancelled, killing VM");
            if let Err(e) = child.start_kill() {
                warn!(instance = %id, error = %e, "failed to kill VM");
            }
            child.wait().await
        }
    };

    stop_side_processes(sides).await;
    if let Err(e) = log_task.await {
        warn!(instance = %id, error = %e, "log copy task failed");
    }

    let event = exit_event(outcome);
    info!(instance = %id, exit_code = event.exit_code, message = %event.message, "VM exited");

    match records.write() {
        Ok(mut records) => {
            if let Some(record) = records.get_mut(&id)
                && record.generation == generation
            {
                if let Err(e) = record.status.mark_terminated(&event) {
                    warn!(instance = %id, error = %e, "could not record VM exit");
                }
                record.pid = None;
                record.cancel = None;
            } else {
                debug!(instance = %id, generation, "stale watcher, record left alone");
            }
        }
        Err(e) => error!(instance = %id, error = %e, "instance map poisoned"),
    }

    exit.send_replace(Some(event));
}

/// Appends VM stdout and stderr to the log file until both close.
async fn copy_logs(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    mut out_log: tokio::fs::File,
    mut err_log: tokio::fs::File,
) {
    let out = async {
        if let Some(mut stdout) = stdout {
            tokio::io::copy(&mut stdout, &mut out_log).await?;
        }
        out_log.flush().await
    };
    let err = async {
        if let Some(mut stderr) = stderr {
            tokio::io::copy(&mut stderr, &mut err_log).await?;
        }
        err_log.flush().await
    };

    let (out, err) = tokio::join!(out, err);
    if let Err(e) = out.and(err) {
        warn!(error = %e, "failed to copy VM output");
    }
}

fn spawn_side_process(argv: &[String], log: &std::fs::File) -> Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::InvalidInput("empty side process command".to_string()))?;

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log.try_clone()?))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Internal(format!("failed to spawn {}: {}", program, e)))?;

    debug!(program = %program, pid = ?child.id(), "spawned side process");
    Ok(child)
}

async fn stop_side_processes(sides: Vec<Child>) {
    for mut side in sides {
        // Already exited is fine.
        let _ = side.start_kill();
        if let Err(e) = side.wait().await {
            warn!(error = %e, "failed to reap side process");
        }
    }
}

fn exit_event(outcome: std::io::Result<ExitStatus>) -> ExitEvent {
    match outcome {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => {
                ExitEvent::now(code, None, "Terminated", &format!("exit status {}", code))
            }
            (None, Some(signal)) => ExitEvent::now(
                128 + signal,
                Some(signal),
                "Terminated",
                &format!("terminated by signal {}", signal),
            ),
            (None, None) => ExitEvent::now(-1, None, "Terminated", "unknown exit status"),
        },
        Err(e) => ExitEvent::now(-1, None, "Terminated", &format!("wait failed: {}", e)),
    }
}

/// The last `lines` lines of `data`.
fn tail(data: &[u8], lines: usize) -> &[u8] {
    if lines == 0 {
        return &[];
    }
    let body = data.strip_suffix(b"\n").unwrap_or(data);
    let mut seen = 0;
    for (i, byte) in body.iter().enumerate().rev() {
        if *byte == b'\n' {
            seen += 1;
            if seen == lines {
                return &data[i + 1..];
            }
        }
    }
    data
}
