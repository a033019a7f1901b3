//! OCI runtime bundle building.
//!
//! Turns pulled layers plus a container spec into an OCI runtime bundle
//! (rootfs + config.json) for the container backend:
//!
//! ```text
//! <root>/bundles/<instance-id>/
//! ├── config.json     process, mounts, annotations
//! └── rootfs/         layers extracted in order
//! ```
//!
//! Bundles are per instance and rebuilt on every create; a stale bundle
//! left by an earlier instance with the same id is removed first.

use crate::constants::{
    BUNDLE_DIR, MAX_LAYER_SIZE, MAX_ROOTFS_SIZE, OCI_LAYER_MEDIA_TYPE_TAR,
    OCI_RUNTIME_SPEC_VERSION,
};
use crate::error::{Error, Result};
use crate::id::InstanceId;
use crate::image::ImageConfig;
use crate::pod::ContainerSpec;
use crate::registry::{ImageHandle, LayerInfo};
use crate::storage::BlobStore;
use crate::volume::BindMount;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::Archive;
use tracing::{debug, info};

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// =============================================================================
// Container Configuration
// =============================================================================

/// Process and mount settings of one container, already merged from the
/// container spec and the image config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OciContainerConfig {
    pub args: Vec<String>,
    /// `NAME=value` entries; later entries win.
    pub env: Vec<String>,
    pub cwd: String,
    pub mounts: Vec<BindMount>,
    pub annotations: HashMap<String, String>,
    pub hostname: Option<String>,
    /// Memory limit in bytes.
    pub memory_limit: Option<i64>,
    /// CPU quota in millicores.
    pub cpu_millis: Option<u64>,
}

impl OciContainerConfig {
    /// Merges a container spec with its image config.
    ///
    /// - args: `command + args`, else image entrypoint + `args`, else image
    ///   entrypoint + cmd
    /// - env: image env, then the container's literal env
    /// - cwd: container, then image, then `/`
    pub fn assemble(container: &ContainerSpec, image: &ImageConfig) -> Result<Self> {
        let process = &image.config;
        let args = match (&container.command, &container.args) {
            (Some(command), args) => {
                let mut line = command.clone();
                line.extend(args.clone().unwrap_or_default());
                line
            }
            (None, Some(args)) => {
                let mut line = process.entrypoint.clone();
                line.extend(args.iter().cloned());
                line
            }
            (None, None) => {
                let mut line = process.entrypoint.clone();
                line.extend(process.cmd.iter().cloned());
                line
            }
        };
        if args.is_empty() {
            return Err(Error::BundleBuildFailed(format!(
                "container '{}' has no command and its image has no entrypoint",
                container.name
            )));
        }

        let mut env = process.env.clone();
        env.extend(container.literal_env());

        let cwd = container
            .working_dir
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| Some(process.working_dir.clone()).filter(|d| !d.is_empty()))
            .unwrap_or_else(|| "/".to_string());

        let resources = &container.resources;
        Ok(Self {
            args,
            env,
            cwd,
            mounts: Vec::new(),
            annotations: HashMap::new(),
            hostname: None,
            memory_limit: (resources.memory_bytes > 0).then_some(resources.memory_bytes as i64),
            cpu_millis: (resources.cpu_millis > 0).then_some(resources.cpu_millis),
        })
    }
}

// =============================================================================
// Bundle Builder
// =============================================================================

/// Builds per-instance OCI runtime bundles.
pub struct BundleBuilder {
    base_dir: PathBuf,
    storage: Arc<BlobStore>,
}

impl BundleBuilder {
    /// Builder writing under `<root>/bundles`.
    pub fn under_root(root: &Path, storage: Arc<BlobStore>) -> Result<Self> {
        let base_dir = root.join(BUNDLE_DIR);
        fs::create_dir_all(&base_dir).map_err(|e| Error::BundleBuildFailed(e.to_string()))?;
        Ok(Self { base_dir, storage })
    }

    /// Bundle directory of an instance.
    pub fn bundle_dir(&self, id: &InstanceId) -> PathBuf {
        self.base_dir.join(id.as_str())
    }

    /// Builds the bundle of `id` and returns its directory.
    pub fn build(
        &self,
        id: &InstanceId,
        image: &ImageHandle,
        config: &OciContainerConfig,
    ) -> Result<PathBuf> {
        let bundle_dir = self.bundle_dir(id);
        if bundle_dir.exists() {
            debug!(instance = %id, "removing stale bundle");
            fs::remove_dir_all(&bundle_dir)?;
        }

        let rootfs = bundle_dir.join("rootfs");
        fs::create_dir_all(&rootfs)
            .map_err(|e| Error::BundleBuildFailed(format!("failed to create rootfs: {}", e)))?;

        extract_layers(&image.layers, &rootfs, &self.storage)?;

        let spec = generate_oci_spec(config);
        let config_json = serde_json::to_string_pretty(&spec)
            .map_err(|e| Error::BundleBuildFailed(format!("failed to serialize config: {}", e)))?;
        fs::write(bundle_dir.join("config.json"), config_json)
            .map_err(|e| Error::BundleBuildFailed(format!("failed to write config.json: {}", e)))?;

        info!(instance = %id, bundle = %bundle_dir.display(), "built OCI bundle");
        Ok(bundle_dir)
    }

    /// Removes the bundle of `id`, if any.
    pub fn remove(&self, id: &InstanceId) -> Result<()> {
        match fs::remove_dir_all(self.bundle_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Generates the runtime spec for a container.
pub fn generate_oci_spec(config: &OciContainerConfig) -> OciSpec {
    let mut env = config.env.clone();
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.push(DEFAULT_PATH.to_string());
    }

    let mut mounts = default_mounts();
    mounts.extend(config.mounts.iter().map(|m| OciMount {
        destination: m.destination.clone(),
        mount_type: m.kind.clone(),
        source: m.source.to_string_lossy().to_string(),
        options: m.options.clone(),
    }));

    let resources = if config.memory_limit.is_some() || config.cpu_millis.is_some() {
        Some(OciResources {
            memory: config.memory_limit.map(|limit| OciMemory { limit: Some(limit) }),
            cpu: config.cpu_millis.map(|millis| OciCpu {
                shares: None,
                quota: Some(millis as i64 * 100),
                period: Some(100_000),
            }),
        })
    } else {
        None
    };

    OciSpec {
        oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
        root: OciRoot {
            path: "rootfs".to_string(),
            readonly: false,
        },
        process: OciProcess {
            terminal: false,
            user: OciUser { uid: 0, gid: 0 },
            args: config.args.clone(),
            env,
            cwd: config.cwd.clone(),
        },
        hostname: config
            .hostname
            .clone()
            .unwrap_or_else(|| "container".to_string()),
        mounts,
        annotations: config.annotations.clone(),
        linux: Some(OciLinux {
            namespaces: ["pid", "network", "ipc", "uts", "mount"]
                .iter()
                .map(|ns| OciNamespace {
                    ns_type: ns.to_string(),
                    path: None,
                })
                .collect(),
            resources,
        }),
    }
}

fn default_mounts() -> Vec<OciMount> {
    let opts = |o: &[&str]| o.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        OciMount {
            destination: "/proc".to_string(),
            mount_type: "proc".to_string(),
            source: "proc".to_string(),
            options: vec![],
        },
        OciMount {
            destination: "/dev".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            options: opts(&["nosuid", "strictatime", "mode=755"]),
        },
        OciMount {
            destination: "/dev/pts".to_string(),
            mount_type: "devpts".to_string(),
            source: "devpts".to_string(),
            options: opts(&["nosuid", "noexec", "newinstance"]),
        },
        OciMount {
            destination: "/sys".to_string(),
            mount_type: "sysfs".to_string(),
            source: "sysfs".to_string(),
            options: opts(&["nosuid", "noexec", "nodev", "ro"]),
        },
    ]
}

// =============================================================================
// Layer Extraction
// =============================================================================

/// Extracts layers in order into `rootfs`, applying whiteouts.
pub fn extract_layers(layers: &[LayerInfo], rootfs: &Path, storage: &BlobStore) -> Result<()> {
    let mut total_size = 0u64;

    for layer in layers {
        debug!(digest = %layer.digest, "extracting layer");
        let failed = |e: std::io::Error| Error::LayerExtractionFailed {
            digest: layer.digest.clone(),
            reason: e.to_string(),
        };

        let data = storage.get_blob(&layer.digest)?;
        if data.len() > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                size: data.len() as u64,
                limit: MAX_LAYER_SIZE as u64,
            });
        }

        let reader: Box<dyn Read + '_> = if layer.media_type == OCI_LAYER_MEDIA_TYPE_TAR {
            Box::new(&data[..])
        } else {
            Box::new(GzDecoder::new(&data[..]))
        };
        let mut archive = Archive::new(reader);

        for entry in archive.entries().map_err(failed)? {
            let mut entry = entry.map_err(failed)?;
            let path = entry.path().map_err(failed)?.into_owned();

            let path_str = path.to_string_lossy();
            if path_str.split('/').any(|c| c == "..") || path_str.starts_with('/') {
                return Err(Error::PathTraversal {
                    path: path_str.to_string(),
                });
            }

            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if let Some(target) = filename.strip_prefix(".wh.") {
                let parent = path.parent().unwrap_or(Path::new(""));
                let target_path = rootfs.join(parent).join(target);
                if target_path.is_dir() {
                    let _ = fs::remove_dir_all(&target_path);
                } else if target_path.exists() {
                    let _ = fs::remove_file(&target_path);
                }
                continue;
            }

            total_size += entry.size();
            if total_size > MAX_ROOTFS_SIZE {
                return Err(Error::ImageTooLarge {
                    size: total_size,
                    limit: MAX_ROOTFS_SIZE,
                });
            }

            entry.unpack_in(rootfs).map_err(failed)?;
        }
    }

    Ok(())
}

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub root: OciRoot,
    pub process: OciProcess,
    pub hostname: String,
    pub mounts: Vec<OciMount>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciLinux {
    pub namespaces: Vec<OciNamespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<OciResources>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<OciMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<OciCpu>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciMemory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciCpu {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ProcessConfig;
    use crate::pod::EnvVar;

    fn image(entrypoint: &[&str], cmd: &[&str]) -> ImageConfig {
        ImageConfig {
            config: ProcessConfig {
                entrypoint: entrypoint.iter().map(|s| s.to_string()).collect(),
                cmd: cmd.iter().map(|s| s.to_string()).collect(),
                env: vec!["A=image".to_string()],
                working_dir: "/srv".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_assemble_args_precedence() {
        let mut container = ContainerSpec::new("app", "docker.io/library/nginx:1.25");
        let img = image(&["/entry"], &["serve"]);

        let config = OciContainerConfig::assemble(&container, &img).unwrap();
        assert_eq!(config.args, vec!["/entry", "serve"]);
        assert_eq!(config.cwd, "/srv");

        container.args = Some(vec!["debug".to_string()]);
        let config = OciContainerConfig::assemble(&container, &img).unwrap();
        assert_eq!(config.args, vec!["/entry", "debug"]);

        container.command = Some(vec!["/bin/sh".to_string()]);
        container.working_dir = Some("/work".to_string());
        let config = OciContainerConfig::assemble(&container, &img).unwrap();
        assert_eq!(config.args, vec!["/bin/sh", "debug"]);
        assert_eq!(config.cwd, "/work");
    }

    #[test]
    fn test_assemble_env_skips_value_from() {
        let mut container = ContainerSpec::new("app", "docker.io/library/nginx:1.25");
        container.env = vec![
            EnvVar {
                name: "A".to_string(),
                value: "container".to_string(),
                from_source: false,
            },
            EnvVar {
                name: "SECRET".to_string(),
                value: String::new(),
                from_source: true,
            },
        ];
        let config = OciContainerConfig::assemble(&container, &image(&["/entry"], &[])).unwrap();
        assert_eq!(config.env, vec!["A=image", "A=container"]);
    }

    #[test]
    fn test_assemble_without_command_fails() {
        let container = ContainerSpec::new("app", "docker.io/library/nginx:1.25");
        let result = OciContainerConfig::assemble(&container, &ImageConfig::default());
        assert!(matches!(result, Err(Error::BundleBuildFailed(_))));
    }

    #[test]
    fn test_spec_carries_mounts_and_annotations() {
        let mut config = OciContainerConfig {
            args: vec!["/bin/true".to_string()],
            cwd: "/".to_string(),
            ..Default::default()
        };
        config.mounts.push(BindMount {
            destination: "/data".to_string(),
            kind: "none".to_string(),
            source: PathBuf::from("/srv/data"),
            options: vec!["rbind".to_string(), "rw".to_string()],
        });
        config
            .annotations
            .insert("nerdctl/ports".to_string(), "[]".to_string());

        let spec = generate_oci_spec(&config);
        assert!(spec.mounts.iter().any(|m| m.destination == "/data" && m.mount_type == "none"));
        assert_eq!(spec.annotations["nerdctl/ports"], "[]");
        assert!(spec.process.env.iter().any(|e| e.starts_with("PATH=")));
    }
}
