//! # Configuration
//!
//! Configuration is read from a JSON file, then overridden by `FLEDGE_*`
//! environment variables, then validated:
//!
//! ```text
//! config.json ──parse──▶ Config ──FLEDGE_*──▶ Config ──validate──▶ ready
//!   (missing file = {})
//! ```
//!
//! | Variable | Field |
//! |----------|-------|
//! | `FLEDGE_ROOT_DIR` | `rootDir` |
//! | `FLEDGE_DEFAULT_BACKEND` | `defaultBackend` |
//! | `FLEDGE_BACKENDS` | `backends` (comma separated) |
//! | `FLEDGE_LOG_LEVEL` | `logLevel` |
//! | `FLEDGE_INIT_ORDERING` | `initOrdering` |
//! | `FLEDGE_QEMU_BINARY` | `qemu.binary` |
//! | `FLEDGE_QEMU_MEMORY` | `qemu.memoryMib` |
//! | `FLEDGE_QEMU_CPUS` | `qemu.cpus` |
//! | `FLEDGE_QEMU_BRIDGE` | `qemu.bridge` |
//! | `FLEDGE_QEMU_DISABLE_KVM` | `qemu.disableKvm` |
//! | `FLEDGE_VIRTIOFS_DAEMON` | `virtiofs.daemon` |
//! | `FLEDGE_CONTAINER_STATE_ROOT` | `container.stateRoot` |

use crate::backend::BackendKind;
use crate::constants::{
    DEFAULT_AIO_TYPE, DEFAULT_BRIDGE, DEFAULT_CONTAINER_STATE_ROOT, DEFAULT_QEMU_BINARY,
    DEFAULT_SHARED_MEMORY, DEFAULT_VCPUS, DEFAULT_VIRTIOFS_DAEMON, DEFAULT_VM_MEMORY_MIB,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "FLEDGE_";

/// How init containers gate the start of regular containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InitOrdering {
    /// Start each init container and wait for a zero exit before the next
    /// one. Regular containers start only after every init container
    /// succeeded.
    #[default]
    WaitForCompletion,
    /// Start every container in order right after creation without waiting.
    CreatedBeforeStarted,
}

impl FromStr for InitOrdering {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waitForCompletion" | "wait" => Ok(Self::WaitForCompletion),
            "createdBeforeStarted" | "none" => Ok(Self::CreatedBeforeStarted),
            other => Err(Error::InvalidConfig {
                field: "initOrdering".to_string(),
                reason: format!("unknown ordering '{}'", other),
            }),
        }
    }
}

/// Settings for the QEMU hypervisor driven by the VM backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QemuSettings {
    pub binary: String,
    pub memory_mib: u32,
    pub cpus: u32,
    pub bridge: String,
    pub disable_kvm: bool,
    pub aio_type: String,
    /// Pass `--verbose` to the guest.
    pub verbose: bool,
}

impl Default for QemuSettings {
    fn default() -> Self {
        Self {
            binary: DEFAULT_QEMU_BINARY.to_string(),
            memory_mib: DEFAULT_VM_MEMORY_MIB,
            cpus: DEFAULT_VCPUS,
            bridge: DEFAULT_BRIDGE.to_string(),
            disable_kvm: false,
            aio_type: DEFAULT_AIO_TYPE.to_string(),
            verbose: true,
        }
    }
}

/// Settings for virtio-fs volume sharing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtiofsSettings {
    pub daemon: String,
    pub shared_memory: String,
}

impl Default for VirtiofsSettings {
    fn default() -> Self {
        Self {
            daemon: DEFAULT_VIRTIOFS_DAEMON.to_string(),
            shared_memory: DEFAULT_SHARED_MEMORY.to_string(),
        }
    }
}

/// Settings for the OCI container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSettings {
    pub state_root: PathBuf,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(DEFAULT_CONTAINER_STATE_ROOT),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Root of images, bundles, instance and volume state.
    pub root_dir: PathBuf,
    /// Backend used for images that declare none.
    pub default_backend: String,
    /// Enabled backends.
    pub backends: Vec<String>,
    pub init_ordering: InitOrdering,
    pub log_level: String,
    /// Registries reached over plain HTTP.
    pub insecure_registries: Vec<String>,
    pub qemu: QemuSettings,
    pub virtiofs: VirtiofsSettings,
    pub container: ContainerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            default_backend: BackendKind::Container.name().to_string(),
            backends: vec![
                BackendKind::Container.name().to_string(),
                BackendKind::Vm.name().to_string(),
            ],
            init_ordering: InitOrdering::default(),
            log_level: "info".to_string(),
            insecure_registries: Vec::new(),
            qemu: QemuSettings::default(),
            virtiofs: VirtiofsSettings::default(),
            container: ContainerSettings::default(),
        }
    }
}

/// `~/.fledge`, or `.fledge` when there is no home directory.
pub fn default_root_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".fledge"))
        .unwrap_or_else(|| PathBuf::from(".fledge"))
}

impl Config {
    /// Loads configuration from `path`, applies the process environment
    /// and validates the result.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        debug!(?config, "configuration is valid");
        Ok(config)
    }

    /// Parses a configuration file without overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => Self::from_json(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file does not exist, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parses a JSON configuration document.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Applies `FLEDGE_*` overrides read through `lookup`.
    ///
    /// Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty())
        };

        if let Some(v) = get("ROOT_DIR") {
            self.root_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DEFAULT_BACKEND") {
            self.default_backend = v;
        }
        if let Some(v) = get("BACKENDS") {
            self.backends = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("INIT_ORDERING") {
            self.init_ordering = v.parse()?;
        }
        if let Some(v) = get("QEMU_BINARY") {
            self.qemu.binary = v;
        }
        if let Some(v) = get("QEMU_MEMORY") {
            self.qemu.memory_mib = parse_number("qemu.memoryMib", &v)?;
        }
        if let Some(v) = get("QEMU_CPUS") {
            self.qemu.cpus = parse_number("qemu.cpus", &v)?;
        }
        if let Some(v) = get("QEMU_BRIDGE") {
            self.qemu.bridge = v;
        }
        if let Some(v) = get("QEMU_DISABLE_KVM") {
            self.qemu.disable_kvm = parse_bool("qemu.disableKvm", &v)?;
        }
        if let Some(v) = get("VIRTIOFS_DAEMON") {
            self.virtiofs.daemon = v;
        }
        if let Some(v) = get("CONTAINER_STATE_ROOT") {
            self.container.state_root = PathBuf::from(v);
        }

        Ok(())
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.qemu.memory_mib == 0 {
            return Err(invalid("qemu.memoryMib", "must be greater than zero"));
        }
        if self.qemu.cpus == 0 {
            return Err(invalid("qemu.cpus", "must be greater than zero"));
        }
        if self.backends.is_empty() {
            return Err(invalid("backends", "at least one backend must be enabled"));
        }
        for name in &self.backends {
            BackendKind::from_name(name)
                .map_err(|_| invalid("backends", &format!("unknown backend '{}'", name)))?;
        }

        let default = BackendKind::from_name(&self.default_backend)
            .map_err(|_| {
                invalid(
                    "defaultBackend",
                    &format!("unknown backend '{}'", self.default_backend),
                )
            })?;
        if !self.enabled_backends().contains(&default) {
            return Err(invalid(
                "defaultBackend",
                &format!("backend '{}' is not enabled", self.default_backend),
            ));
        }

        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(invalid(
                "logLevel",
                &format!("unknown level '{}'", self.log_level),
            ));
        }

        Ok(())
    }

    /// Enabled backends, skipping unknown names.
    pub fn enabled_backends(&self) -> Vec<BackendKind> {
        let mut kinds = Vec::new();
        for name in &self.backends {
            if let Ok(kind) = BackendKind::from_name(name)
                && !kinds.contains(&kind)
            {
                kinds.push(kind);
            }
        }
        kinds
    }

    /// Backend used for images that declare none.
    pub fn default_backend_kind(&self) -> Result<BackendKind> {
        BackendKind::from_name(&self.default_backend)
    }
}

fn invalid(field: &str, reason: &str) -> Error {
    Error::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number(field: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(field, &format!("'{}' is not a number", value)))
}

fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(invalid(field, &format!("'{}' is not a boolean", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.default_backend_kind().unwrap(), BackendKind::Container);
        assert_eq!(config.init_ordering, InitOrdering::WaitForCompletion);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FLEDGE_QEMU_MEMORY", "2048"),
            ("FLEDGE_BACKENDS", "osv, null"),
            ("FLEDGE_DEFAULT_BACKEND", "osv"),
            ("FLEDGE_LOG_LEVEL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.qemu.memory_mib, 2048);
        assert_eq!(config.enabled_backends(), vec![BackendKind::Vm, BackendKind::Null]);
        assert_eq!(config.log_level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_number_override() {
        let mut config = Config::default();
        let result = config.apply_env(|k| (k == "FLEDGE_QEMU_CPUS").then(|| "many".to_string()));
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
