//! QEMU process collaborator for the VM backend.
//!
//! Every VM instance owns a directory under `<root>/instances/qemu/<id>/`:
//!
//! | File | Purpose |
//! |------|---------|
//! | `osv.config` | [`QemuConfig`] as YAML, written at create |
//! | `osv.monitor` | QMP socket, used to ask the VM to quit |
//! | `osv.socket` | VNC socket |
//! | `osv.logs` | console output of the VM and its side processes |
//!
//! The config is stored before any process is spawned, so a start only
//! needs the instance id.

use crate::config::QemuSettings;
use crate::constants::{
    INSTANCE_DIR, VM_CONFIG_FILE, VM_LOG_FILE, VM_MONITOR_FILE, VM_SOCKET_FILE,
};
use crate::error::{Error, Result};
use crate::id::InstanceId;
use crate::portmap::PortMapping;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info};

/// VM network attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Networking {
    /// Tap device on a host bridge.
    Bridge,
    /// User-mode networking with host port forwards.
    Nat,
}

/// Everything needed to launch one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QemuConfig {
    pub name: String,
    pub verbose: bool,
    /// Guest command line.
    pub cmd: String,
    pub disable_kvm: bool,
    pub instance_dir: PathBuf,
    pub monitor: PathBuf,
    pub config_file: PathBuf,
    pub aio_type: String,
    pub image: PathBuf,
    /// Run on a throwaway snapshot of `image`.
    pub backing_file: bool,
    pub memory_mib: u32,
    pub cpus: u32,
    pub networking: Networking,
    pub bridge: String,
    #[serde(default)]
    pub nat_rules: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub vnc_file: PathBuf,
}

/// Launches and tears down QEMU instances.
#[derive(Debug, Clone)]
pub struct Qemu {
    binary: String,
    base_dir: PathBuf,
    kvm_available: bool,
}

impl Qemu {
    /// Instances live under `<root>/instances/qemu`.
    pub fn new(settings: &QemuSettings, root: &Path, kvm_available: bool) -> Self {
        Self {
            binary: settings.binary.clone(),
            base_dir: root.join(INSTANCE_DIR).join("qemu"),
            kvm_available,
        }
    }

    pub fn instance_dir(&self, id: &InstanceId) -> PathBuf {
        self.base_dir.join(id.as_str())
    }

    pub fn config_path(&self, id: &InstanceId) -> PathBuf {
        self.instance_dir(id).join(VM_CONFIG_FILE)
    }

    pub fn monitor_path(&self, id: &InstanceId) -> PathBuf {
        self.instance_dir(id).join(VM_MONITOR_FILE)
    }

    pub fn socket_path(&self, id: &InstanceId) -> PathBuf {
        self.instance_dir(id).join(VM_SOCKET_FILE)
    }

    pub fn log_path(&self, id: &InstanceId) -> PathBuf {
        self.instance_dir(id).join(VM_LOG_FILE)
    }

    /// True if the instance directory exists.
    pub fn exists(&self, id: &InstanceId) -> bool {
        self.instance_dir(id).is_dir()
    }

    /// Writes `config` to its config file, creating the instance directory.
    pub fn store_config(&self, config: &QemuConfig) -> Result<()> {
        std::fs::create_dir_all(&config.instance_dir)?;
        std::fs::write(&config.config_file, serde_yaml::to_string(config)?)?;
        debug!(instance = %config.name, path = %config.config_file.display(), "stored VM config");
        Ok(())
    }

    /// Reads the stored config of an instance.
    pub fn load_config(&self, id: &InstanceId) -> Result<QemuConfig> {
        let data = match std::fs::read(self.config_path(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::InstanceNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_yaml::from_slice(&data)?)
    }

    /// Hypervisor arguments for `config`, followed by `extra`.
    pub fn args(&self, config: &QemuConfig, extra: &[String]) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        push(&["-display", "none"]);
        push(&["-m", &config.memory_mib.to_string()]);
        push(&["-smp", &config.cpus.to_string()]);

        let mut drive = format!(
            "file={},if=none,id=hd0,aio={},cache=none",
            config.image.display(),
            config.aio_type
        );
        if config.backing_file {
            drive.push_str(",snapshot=on");
        }
        push(&["-device", "virtio-blk-pci,id=blk0,bootindex=0,drive=hd0"]);
        push(&["-drive", &drive]);

        match config.networking {
            Networking::Bridge => {
                push(&["-netdev", &format!("bridge,id=hn0,br={}", config.bridge)]);
                push(&["-device", &nic_device("hn0", config.mac.as_deref())]);
            }
            Networking::Nat => {
                let mut netdev = "user,id=un0,net=192.168.122.0/24,host=192.168.122.1".to_string();
                for rule in &config.nat_rules {
                    netdev.push_str(",hostfwd=");
                    netdev.push_str(&rule.as_hostfwd());
                }
                push(&["-netdev", &netdev]);
                push(&["-device", &nic_device("un0", config.mac.as_deref())]);
            }
        }

        push(&["-device", "virtio-rng-pci"]);
        push(&[
            "-qmp",
            &format!("unix:{},server=on,wait=off", config.monitor.display()),
        ]);
        push(&["-vnc", &format!("unix:{}", config.vnc_file.display())]);

        if !config.disable_kvm && self.kvm_available {
            push(&["-enable-kvm", "-cpu", "host,+x2apic"]);
        }
        if !config.cmd.is_empty() {
            push(&["-append", &config.cmd]);
        }

        args.extend(extra.iter().cloned());
        args
    }

    /// Command launching the VM. Standard streams are piped.
    pub fn command(&self, config: &QemuConfig, extra: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(config, extra))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Asks the VM to quit over its QMP socket.
    pub async fn stop(&self, id: &InstanceId) -> Result<()> {
        let stream = UnixStream::connect(self.monitor_path(id)).await?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        // Greeting, then capability negotiation.
        lines.next_line().await?;
        write
            .write_all(b"{\"execute\":\"qmp_capabilities\"}\n")
            .await?;
        lines.next_line().await?;
        write.write_all(b"{\"execute\":\"quit\"}\n").await?;
        write.flush().await?;

        info!(instance = %id, "asked VM to quit");
        Ok(())
    }

    /// Removes the instance directory.
    pub async fn delete(&self, id: &InstanceId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.instance_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::InstanceNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn nic_device(netdev: &str, mac: Option<&str>) -> String {
    match mac {
        Some(mac) => format!("virtio-net-pci,netdev={},mac={}", netdev, mac),
        None => format!("virtio-net-pci,netdev={}", netdev),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(qemu: &Qemu, id: &InstanceId) -> QemuConfig {
        QemuConfig {
            name: id.to_string(),
            verbose: true,
            cmd: "--verbose runscript /run/default;".to_string(),
            disable_kvm: false,
            instance_dir: qemu.instance_dir(id),
            monitor: qemu.monitor_path(id),
            config_file: qemu.config_path(id),
            aio_type: "threads".to_string(),
            image: PathBuf::from("/images/app.qemu"),
            backing_file: true,
            memory_mib: 1024,
            cpus: 1,
            networking: Networking::Nat,
            bridge: "virbr0".to_string(),
            nat_rules: vec![PortMapping::tcp(40000, 80)],
            mac: None,
            vnc_file: qemu.socket_path(id),
        }
    }

    #[test]
    fn test_args() {
        let qemu = Qemu::new(&QemuSettings::default(), Path::new("/root"), true);
        let id = InstanceId::from_parts("default", "web", "app").unwrap();
        let args = qemu.args(&config(&qemu, &id), &["-extra".to_string()]);
        let joined = args.join(" ");

        assert!(joined.contains("-m 1024 -smp 1"));
        assert!(joined.contains("snapshot=on"));
        assert!(joined.contains("hostfwd=tcp::40000-:80"));
        assert!(joined.contains("-enable-kvm"));
        assert!(joined.contains("/root/instances/qemu/default_web_app/osv.monitor"));
        let append = args.iter().position(|a| a == "-append").unwrap();
        assert_eq!(args[append + 1], "--verbose runscript /run/default;");
        assert_eq!(args.last().unwrap(), "-extra");
    }

    #[test]
    fn test_store_and_load_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut settings = QemuSettings::default();
        settings.disable_kvm = true;
        let qemu = Qemu::new(&settings, tmp.path(), false);
        let id = InstanceId::from_parts("default", "web", "app").unwrap();

        let missing = qemu.load_config(&id).unwrap_err();
        assert!(matches!(missing, Error::InstanceNotFound(_)));

        let stored = config(&qemu, &id);
        qemu.store_config(&stored).unwrap();
        assert_eq!(qemu.load_config(&id).unwrap(), stored);
        assert!(!qemu.args(&stored, &[]).contains(&"-enable-kvm".to_string()));
    }
}
