//! Pod specification types.
//!
//! Kubernetes-compatible pod manifest parsing with validation.
//!
//! # Supported Formats
//!
//! - **YAML**: Primary format, parsed via `serde_yaml`
//! - **JSON**: Also supported (YAML is a superset of JSON)

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Constants for Manifest Validation
// =============================================================================

/// Maximum size of a pod manifest in bytes (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum number of containers per pod (init and regular counted apart).
pub const MAX_CONTAINERS_PER_POD: usize = 16;

/// Maximum number of volumes per pod.
pub const MAX_VOLUMES_PER_POD: usize = 64;

/// Maximum length for Kubernetes-compatible names (RFC 1123 DNS subdomain).
pub const MAX_NAME_LEN: usize = 253;

/// Maximum length for namespace names.
pub const MAX_NAMESPACE_LEN: usize = 63;

/// Maximum length for container names within a pod.
pub const MAX_CONTAINER_NAME_LEN: usize = 63;

/// Maximum number of environment variables per container.
pub const MAX_ENV_VARS_PER_CONTAINER: usize = 256;

/// Maximum length of an environment variable value (32 KiB).
pub const MAX_ENV_VALUE_LEN: usize = 32 * 1024;

/// Maximum number of labels per pod.
pub const MAX_LABELS_PER_POD: usize = 64;

/// Maximum number of annotations per pod.
pub const MAX_ANNOTATIONS_PER_POD: usize = 64;

/// Maximum length for label/annotation keys.
pub const MAX_LABEL_KEY_LEN: usize = 253;

/// Maximum length for label/annotation values.
pub const MAX_LABEL_VALUE_LEN: usize = 63 * 1024;

// =============================================================================
// Validation Helpers
// =============================================================================

/// Validates a Kubernetes-compatible name (RFC 1123 DNS label).
///
/// Valid names never contain `_`, which keeps instance ids unambiguous.
fn validate_name(name: &str, max_len: usize) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("name cannot be empty".to_string()));
    }

    if name.len() > max_len {
        return Err(Error::InvalidInput(format!(
            "name '{}' exceeds maximum length of {}",
            name, max_len
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::InvalidInput(format!(
            "name '{}' must contain only lowercase alphanumeric characters or '-'",
            name
        )));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::InvalidInput(format!(
            "name '{}' cannot start or end with '-'",
            name
        )));
    }

    Ok(())
}

fn string_list(value: Option<&serde_yaml::Value>) -> Option<Vec<String>> {
    value.and_then(|v| v.as_sequence()).map(|seq| {
        seq.iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect()
    })
}

// =============================================================================
// Pod Specification
// =============================================================================

/// Pod specification.
///
/// Represents a parsed and validated Kubernetes Pod manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSpec {
    /// Namespace (defaults to "default" if not specified).
    pub namespace: String,
    /// Pod name (RFC 1123 DNS label, unique within namespace).
    pub name: String,
    /// Labels for pod selection and organization.
    pub labels: HashMap<String, String>,
    /// Annotations for arbitrary metadata.
    pub annotations: HashMap<String, String>,
    /// Container specifications (at least one required).
    pub containers: Vec<ContainerSpec>,
    /// Init container specifications (run before main containers).
    pub init_containers: Vec<ContainerSpec>,
    /// Volume definitions for the pod.
    pub volumes: Vec<Volume>,
    /// Override hostname for the pod.
    pub hostname: Option<String>,
}

impl PodSpec {
    /// Parses a pod spec from YAML bytes.
    ///
    /// # Errors
    ///
    /// - Size exceeds `MAX_MANIFEST_SIZE`
    /// - YAML parsing fails
    /// - Validation errors for names, counts, etc.
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        if yaml.len() > MAX_MANIFEST_SIZE {
            return Err(Error::InvalidInput(format!(
                "manifest size {} exceeds limit of {}",
                yaml.len(),
                MAX_MANIFEST_SIZE
            )));
        }

        let doc: serde_yaml::Value =
            serde_yaml::from_slice(yaml).map_err(|e| Error::InvalidInput(e.to_string()))?;

        Self::from_value(&doc)
    }

    /// Parses a pod spec from a `serde_yaml::Value`.
    pub fn from_value(doc: &serde_yaml::Value) -> Result<Self> {
        let metadata = doc.get("metadata");

        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(|n| n.as_str())
            .unwrap_or("default")
            .to_string();
        validate_name(&namespace, MAX_NAMESPACE_LEN)?;

        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .ok_or_else(|| Error::InvalidInput("missing metadata.name".to_string()))?
            .to_string();
        validate_name(&name, MAX_NAME_LEN)?;

        let labels = parse_string_map(
            metadata.and_then(|m| m.get("labels")),
            "label",
            MAX_LABELS_PER_POD,
        )?;

        let annotations = parse_string_map(
            metadata.and_then(|m| m.get("annotations")),
            "annotation",
            MAX_ANNOTATIONS_PER_POD,
        )?;

        let spec = doc.get("spec");

        let containers = parse_container_list(spec.and_then(|s| s.get("containers")), "containers")?;
        if containers.is_empty() {
            return Err(Error::InvalidInput(
                "at least one container required in spec.containers".to_string(),
            ));
        }

        let init_containers =
            parse_container_list(spec.and_then(|s| s.get("initContainers")), "init containers")?;

        let volumes = parse_volume_list(spec.and_then(|s| s.get("volumes")))?;

        let hostname = spec
            .and_then(|s| s.get("hostname"))
            .and_then(|h| h.as_str())
            .map(String::from);

        Ok(Self {
            namespace,
            name,
            labels,
            annotations,
            containers,
            init_containers,
            volumes,
            hostname,
        })
    }

    /// Looks up a pod volume by name.
    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name == name)
    }

    /// Init containers followed by regular containers, tagged with
    /// whether each one is an init container.
    pub fn ordered_containers(&self) -> impl Iterator<Item = (&ContainerSpec, bool)> {
        self.init_containers
            .iter()
            .map(|c| (c, true))
            .chain(self.containers.iter().map(|c| (c, false)))
    }
}

fn parse_string_map(
    value: Option<&serde_yaml::Value>,
    kind: &str,
    max_count: usize,
) -> Result<HashMap<String, String>> {
    let Some(mapping) = value.and_then(|v| v.as_mapping()) else {
        return Ok(HashMap::new());
    };

    if mapping.len() > max_count {
        return Err(Error::InvalidInput(format!(
            "too many {}s: {} (max {})",
            kind,
            mapping.len(),
            max_count
        )));
    }

    let mut result = HashMap::new();
    for (k, v) in mapping.iter() {
        let key = k
            .as_str()
            .ok_or_else(|| Error::InvalidInput(format!("{} key must be a string", kind)))?;
        let val = v
            .as_str()
            .ok_or_else(|| Error::InvalidInput(format!("{} value must be a string", kind)))?;

        if key.len() > MAX_LABEL_KEY_LEN {
            return Err(Error::InvalidInput(format!(
                "{} key '{}' exceeds max length {}",
                kind, key, MAX_LABEL_KEY_LEN
            )));
        }
        if val.len() > MAX_LABEL_VALUE_LEN {
            return Err(Error::InvalidInput(format!(
                "{} value for '{}' exceeds max length {}",
                kind, key, MAX_LABEL_VALUE_LEN
            )));
        }
        result.insert(key.to_string(), val.to_string());
    }
    Ok(result)
}

fn parse_container_list(
    value: Option<&serde_yaml::Value>,
    what: &str,
) -> Result<Vec<ContainerSpec>> {
    let Some(seq) = value.and_then(|v| v.as_sequence()) else {
        return Ok(Vec::new());
    };

    if seq.len() > MAX_CONTAINERS_PER_POD {
        return Err(Error::InvalidInput(format!(
            "too many {}: {} (max {})",
            what,
            seq.len(),
            MAX_CONTAINERS_PER_POD
        )));
    }

    seq.iter().map(ContainerSpec::from_value).collect()
}

fn parse_volume_list(value: Option<&serde_yaml::Value>) -> Result<Vec<Volume>> {
    let Some(seq) = value.and_then(|v| v.as_sequence()) else {
        return Ok(Vec::new());
    };

    if seq.len() > MAX_VOLUMES_PER_POD {
        return Err(Error::InvalidInput(format!(
            "too many volumes: {} (max {})",
            seq.len(),
            MAX_VOLUMES_PER_POD
        )));
    }

    seq.iter().map(Volume::from_value).collect()
}

// =============================================================================
// Container Specification
// =============================================================================

/// When the image of a container is pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    /// Kubernetes default: `Always` for `:latest` or untagged images,
    /// `IfNotPresent` otherwise.
    pub fn default_for(image: &str) -> Self {
        let last = image.rsplit('/').next().unwrap_or(image);
        if last.contains('@') {
            return Self::IfNotPresent;
        }
        match last.split_once(':') {
            Some((_, tag)) if tag != "latest" => Self::IfNotPresent,
            _ => Self::Always,
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "Always" => Ok(Self::Always),
            "IfNotPresent" => Ok(Self::IfNotPresent),
            "Never" => Ok(Self::Never),
            other => Err(Error::InvalidInput(format!(
                "unknown imagePullPolicy '{}'",
                other
            ))),
        }
    }

    /// Whether the image must be fetched given its local presence.
    ///
    /// # Errors
    ///
    /// [`Error::ImageNotPresent`] under `Never` when the image is absent.
    pub fn should_pull(self, reference: &str, present: bool) -> Result<bool> {
        match (self, present) {
            (Self::Always, _) => Ok(true),
            (Self::IfNotPresent, present) => Ok(!present),
            (Self::Never, true) => Ok(false),
            (Self::Never, false) => Err(Error::ImageNotPresent {
                reference: reference.to_string(),
            }),
        }
    }
}

/// Environment variable of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    /// Declared with `valueFrom`; backends skip these.
    pub from_source: bool,
}

/// Container specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name (unique within pod, RFC 1123 label).
    pub name: String,
    /// Image reference (e.g., "nginx:1.25", "ghcr.io/user/app:v1").
    pub image: String,
    pub image_pull_policy: PullPolicy,
    /// Override the image's default entrypoint.
    pub command: Option<Vec<String>>,
    /// Arguments to the entrypoint.
    pub args: Option<Vec<String>>,
    /// Environment variables in declaration order.
    pub env: Vec<EnvVar>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Exposed ports.
    pub ports: Vec<ContainerPort>,
    /// Volume mount points.
    pub volume_mounts: Vec<VolumeMount>,
    /// Resource limits and requests.
    pub resources: ResourceRequirements,
}

impl ContainerSpec {
    /// Minimal container with defaults for everything but name and image.
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            image_pull_policy: PullPolicy::default_for(image),
            command: None,
            args: None,
            env: Vec::new(),
            working_dir: None,
            ports: Vec::new(),
            volume_mounts: Vec::new(),
            resources: ResourceRequirements::default(),
        }
    }

    /// Parses from a YAML value.
    pub fn from_value(value: &serde_yaml::Value) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| Error::InvalidInput("missing container name".to_string()))?
            .to_string();
        validate_name(&name, MAX_CONTAINER_NAME_LEN)?;

        let image = value
            .get("image")
            .and_then(|i| i.as_str())
            .ok_or_else(|| Error::InvalidInput("missing container image".to_string()))?
            .to_string();

        let image_pull_policy = match value.get("imagePullPolicy").and_then(|p| p.as_str()) {
            Some(p) => PullPolicy::parse(p)?,
            None => PullPolicy::default_for(&image),
        };

        let env = parse_env_vars(value.get("env"), &name)?;

        let working_dir = value
            .get("workingDir")
            .and_then(|w| w.as_str())
            .map(String::from);

        Ok(Self {
            name,
            image,
            image_pull_policy,
            command: string_list(value.get("command")),
            args: string_list(value.get("args")),
            env,
            working_dir,
            ports: parse_ports(value.get("ports")),
            volume_mounts: parse_volume_mounts(value.get("volumeMounts")),
            resources: parse_resources(value.get("resources")),
        })
    }

    /// Command followed by args, if either is set.
    pub fn command_line(&self) -> Option<Vec<String>> {
        if self.command.is_none() && self.args.is_none() {
            return None;
        }
        let mut cmd = self.command.clone().unwrap_or_default();
        cmd.extend(self.args.clone().unwrap_or_default());
        Some(cmd)
    }

    /// `NAME=value` pairs for literal env entries, skipping `valueFrom`.
    pub fn literal_env(&self) -> Vec<String> {
        self.env
            .iter()
            .filter(|e| !e.from_source)
            .map(|e| format!("{}={}", e.name, e.value))
            .collect()
    }
}

fn parse_env_vars(value: Option<&serde_yaml::Value>, container_name: &str) -> Result<Vec<EnvVar>> {
    let Some(seq) = value.and_then(|v| v.as_sequence()) else {
        return Ok(Vec::new());
    };

    if seq.len() > MAX_ENV_VARS_PER_CONTAINER {
        return Err(Error::InvalidInput(format!(
            "too many environment variables in container {}: {} (max {})",
            container_name,
            seq.len(),
            MAX_ENV_VARS_PER_CONTAINER
        )));
    }

    let mut vars = Vec::with_capacity(seq.len());
    for item in seq {
        let env_name = item
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| Error::InvalidInput("missing env name".to_string()))?;
        let val = item.get("value").and_then(|v| v.as_str()).unwrap_or("");

        if val.len() > MAX_ENV_VALUE_LEN {
            return Err(Error::InvalidInput(format!(
                "env variable {} value exceeds limit of {} bytes",
                env_name, MAX_ENV_VALUE_LEN
            )));
        }

        vars.push(EnvVar {
            name: env_name.to_string(),
            value: val.to_string(),
            from_source: item.get("valueFrom").is_some(),
        });
    }
    Ok(vars)
}

fn parse_ports(value: Option<&serde_yaml::Value>) -> Vec<ContainerPort> {
    let Some(seq) = value.and_then(|v| v.as_sequence()) else {
        return Vec::new();
    };

    seq.iter()
        .filter_map(|p| {
            let container_port = u16::try_from(p.get("containerPort")?.as_u64()?).ok()?;
            let protocol = p
                .get("protocol")
                .and_then(|pr| pr.as_str())
                .unwrap_or("TCP")
                .to_string();
            let name = p.get("name").and_then(|n| n.as_str()).map(String::from);
            let host_port = p
                .get("hostPort")
                .and_then(|hp| hp.as_u64())
                .and_then(|hp| u16::try_from(hp).ok());
            Some(ContainerPort {
                name,
                container_port,
                protocol,
                host_port,
            })
        })
        .collect()
}

fn parse_volume_mounts(value: Option<&serde_yaml::Value>) -> Vec<VolumeMount> {
    let Some(seq) = value.and_then(|v| v.as_sequence()) else {
        return Vec::new();
    };

    seq.iter()
        .filter_map(|vm| {
            let name = vm.get("name")?.as_str()?.to_string();
            let mount_path = vm.get("mountPath")?.as_str()?.to_string();
            let read_only = vm
                .get("readOnly")
                .and_then(|r| r.as_bool())
                .unwrap_or(false);
            Some(VolumeMount {
                name,
                mount_path,
                read_only,
            })
        })
        .collect()
}

fn parse_resources(value: Option<&serde_yaml::Value>) -> ResourceRequirements {
    let Some(r) = value else {
        return ResourceRequirements::default();
    };

    let memory_bytes = r
        .get("limits")
        .or_else(|| r.get("requests"))
        .and_then(|l| l.get("memory"))
        .and_then(|m| m.as_str())
        .map(parse_memory_string)
        .unwrap_or(0);

    let cpu_millis = r
        .get("limits")
        .or_else(|| r.get("requests"))
        .and_then(|l| l.get("cpu"))
        .and_then(|c| c.as_str())
        .map(parse_cpu_string)
        .unwrap_or(0);

    ResourceRequirements {
        memory_bytes,
        cpu_millis,
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

/// Container port definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerPort {
    /// Optional name for the port (for service discovery).
    pub name: Option<String>,
    /// Port number inside the container.
    pub container_port: u16,
    /// Protocol (TCP or UDP, defaults to TCP).
    pub protocol: String,
    /// Optional host port to map to.
    pub host_port: Option<u16>,
}

/// Volume mount specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Name of the volume to mount.
    pub name: String,
    /// Path inside the container to mount at.
    pub mount_path: String,
    /// If true, mount as read-only.
    pub read_only: bool,
}

/// Pod volume definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name (referenced by volume mounts).
    pub name: String,
    /// Volume source type.
    pub source: VolumeSource,
}

impl Volume {
    fn from_value(value: &serde_yaml::Value) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| Error::InvalidInput("volume missing 'name' field".to_string()))?
            .to_string();

        validate_name(&name, MAX_CONTAINER_NAME_LEN)?;

        let source = if let Some(hp) = value.get("hostPath") {
            let path = hp
                .get("path")
                .and_then(|p| p.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput(format!("hostPath volume '{}' missing 'path' field", name))
                })?
                .to_string();

            if path.split('/').any(|c| c == "..") {
                return Err(Error::InvalidInput(format!(
                    "hostPath volume '{}' contains path traversal: {}",
                    name, path
                )));
            }

            if !path.starts_with('/') {
                return Err(Error::InvalidInput(format!(
                    "hostPath volume '{}' must be absolute path: {}",
                    name, path
                )));
            }

            let kind = HostPathType::parse(hp.get("type").and_then(|t| t.as_str()).unwrap_or(""));
            VolumeSource::HostPath { path, kind }
        } else if let Some(secret) = value.get("secret") {
            VolumeSource::Secret(ObjectSource::from_value(secret, "secretName", &name)?)
        } else if let Some(cm) = value.get("configMap") {
            VolumeSource::ConfigMap(ObjectSource::from_value(cm, "name", &name)?)
        } else if let Some(projected) = value.get("projected") {
            let sources = projected
                .get("sources")
                .and_then(|s| s.as_sequence())
                .map(|seq| {
                    seq.iter()
                        .map(|s| ProjectionSource::from_value(s, &name))
                        .collect::<Result<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            VolumeSource::Projected { sources }
        } else if value.get("emptyDir").is_some() {
            VolumeSource::EmptyDir
        } else {
            let kind = value
                .as_mapping()
                .and_then(|m| {
                    m.keys()
                        .filter_map(|k| k.as_str())
                        .find(|k| *k != "name")
                        .map(String::from)
                })
                .unwrap_or_else(|| "none".to_string());
            VolumeSource::Other { kind }
        };

        Ok(Self { name, source })
    }
}

/// Declared `hostPath.type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPathType {
    Unset,
    Directory,
    DirectoryOrCreate,
    /// Any other Kubernetes type (`File`, `Socket`, ...).
    Other(String),
}

impl HostPathType {
    fn parse(value: &str) -> Self {
        match value {
            "" => Self::Unset,
            "Directory" => Self::Directory,
            "DirectoryOrCreate" => Self::DirectoryOrCreate,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Key selection of a secret or config map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyToPath {
    pub key: String,
    /// Relative file path inside the volume.
    pub path: String,
}

/// Reference to a namespaced object holding volume data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSource {
    pub name: String,
    /// `None` when the manifest does not say.
    pub optional: Option<bool>,
    /// Selected keys; empty means all keys.
    pub items: Vec<KeyToPath>,
}

impl ObjectSource {
    /// Unset counts as required.
    pub fn is_optional(&self) -> bool {
        self.optional.unwrap_or(false)
    }

    fn from_value(value: &serde_yaml::Value, name_key: &str, volume: &str) -> Result<Self> {
        let name = value
            .get(name_key)
            .and_then(|n| n.as_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("volume '{}' missing '{}' field", volume, name_key))
            })?
            .to_string();

        let optional = value.get("optional").and_then(|o| o.as_bool());

        let items = value
            .get("items")
            .and_then(|i| i.as_sequence())
            .map(|seq| {
                seq.iter()
                    .filter_map(|item| {
                        Some(KeyToPath {
                            key: item.get("key")?.as_str()?.to_string(),
                            path: item.get("path")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name,
            optional,
            items,
        })
    }
}

/// One source of a projected volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionSource {
    Secret(ObjectSource),
    ConfigMap(ObjectSource),
    DownwardApi,
    ServiceAccountToken,
    Unknown(String),
}

impl ProjectionSource {
    fn from_value(value: &serde_yaml::Value, volume: &str) -> Result<Self> {
        if let Some(secret) = value.get("secret") {
            Ok(Self::Secret(ObjectSource::from_value(secret, "name", volume)?))
        } else if let Some(cm) = value.get("configMap") {
            Ok(Self::ConfigMap(ObjectSource::from_value(cm, "name", volume)?))
        } else if value.get("downwardAPI").is_some() {
            Ok(Self::DownwardApi)
        } else if value.get("serviceAccountToken").is_some() {
            Ok(Self::ServiceAccountToken)
        } else {
            let kind = value
                .as_mapping()
                .and_then(|m| m.keys().find_map(|k| k.as_str()).map(String::from))
                .unwrap_or_else(|| "none".to_string());
            Ok(Self::Unknown(kind))
        }
    }

    /// Manifest key naming this source kind.
    pub fn kind(&self) -> &str {
        match self {
            Self::Secret(_) => "secret",
            Self::ConfigMap(_) => "configMap",
            Self::DownwardApi => "downwardAPI",
            Self::ServiceAccountToken => "serviceAccountToken",
            Self::Unknown(kind) => kind,
        }
    }
}

/// Volume source type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    /// Host filesystem path.
    HostPath { path: String, kind: HostPathType },
    /// Secret reference.
    Secret(ObjectSource),
    /// ConfigMap reference.
    ConfigMap(ObjectSource),
    /// Several sources projected into one directory.
    Projected { sources: Vec<ProjectionSource> },
    /// Empty directory (ephemeral).
    EmptyDir,
    /// Any other source kind, by manifest key.
    Other { kind: String },
}

impl VolumeSource {
    /// Manifest key naming this source kind.
    pub fn kind(&self) -> &str {
        match self {
            Self::HostPath { .. } => "hostPath",
            Self::Secret(_) => "secret",
            Self::ConfigMap(_) => "configMap",
            Self::Projected { .. } => "projected",
            Self::EmptyDir => "emptyDir",
            Self::Other { kind } => kind,
        }
    }
}

/// Resource requirements for a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Memory limit in bytes.
    pub memory_bytes: u64,
    /// CPU in millicores (1000 = 1 CPU).
    pub cpu_millis: u64,
}

// =============================================================================
// Resource Parsing Helpers
// =============================================================================

/// Parses Kubernetes memory strings to bytes.
fn parse_memory_string(s: &str) -> u64 {
    let s = s.trim();
    if let Some(val) = s.strip_suffix("Gi") {
        val.parse::<u64>()
            .unwrap_or(0)
            .saturating_mul(1024 * 1024 * 1024)
    } else if let Some(val) = s.strip_suffix("Mi") {
        val.parse::<u64>().unwrap_or(0).saturating_mul(1024 * 1024)
    } else if let Some(val) = s.strip_suffix("Ki") {
        val.parse::<u64>().unwrap_or(0).saturating_mul(1024)
    } else if let Some(val) = s.strip_suffix('G') {
        val.parse::<u64>()
            .unwrap_or(0)
            .saturating_mul(1_000_000_000)
    } else if let Some(val) = s.strip_suffix('M') {
        val.parse::<u64>().unwrap_or(0).saturating_mul(1_000_000)
    } else if let Some(val) = s.strip_suffix('K') {
        val.parse::<u64>().unwrap_or(0).saturating_mul(1_000)
    } else {
        s.parse::<u64>().unwrap_or(0)
    }
}

/// Parses Kubernetes CPU strings to millicores.
fn parse_cpu_string(s: &str) -> u64 {
    let s = s.trim();
    if s.is_empty() {
        return 0;
    }
    if let Some(val) = s.strip_suffix('m') {
        val.parse::<u64>().unwrap_or(0)
    } else if let Ok(cores) = s.parse::<f64>() {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millicores = (cores * 1000.0) as u64;
        millicores
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pull_policy() {
        assert_eq!(PullPolicy::default_for("registry.io/app"), PullPolicy::Always);
        assert_eq!(PullPolicy::default_for("registry.io/app:latest"), PullPolicy::Always);
        assert_eq!(
            PullPolicy::default_for("localhost:5000/app:1.0"),
            PullPolicy::IfNotPresent
        );
        assert_eq!(
            PullPolicy::default_for("localhost:5000/app"),
            PullPolicy::Always
        );
        assert_eq!(
            PullPolicy::default_for("registry.io/app@sha256:ab"),
            PullPolicy::IfNotPresent
        );
    }

    #[test]
    fn test_should_pull() {
        assert!(PullPolicy::Always.should_pull("x", true).unwrap());
        assert!(!PullPolicy::IfNotPresent.should_pull("x", true).unwrap());
        assert!(PullPolicy::IfNotPresent.should_pull("x", false).unwrap());
        assert!(matches!(
            PullPolicy::Never.should_pull("x", false),
            Err(Error::ImageNotPresent { .. })
        ));
    }

    #[test]
    fn test_resource_strings() {
        assert_eq!(parse_memory_string("64Mi"), 64 * 1024 * 1024);
        assert_eq!(parse_cpu_string("500m"), 500);
        assert_eq!(parse_cpu_string("1.5"), 1500);
    }
}
