//! Volume translation.
//!
//! Pod volumes are declared generically. Before a backend can use one it is
//! resolved against the host and the cluster objects:
//!
//! ```text
//!   Volume ──translate──▶ ResolvedVolume ──┬──▶ bind mount   (containers)
//!                                          └──▶ virtio-fs    (VMs)
//! ```
//!
//! | Source | Resolution |
//! |--------|------------|
//! | `hostPath` | directory on the host, created for `DirectoryOrCreate` |
//! | `secret`, `configMap` | files fetched through [`ResourceLookup`] |
//! | `projected` | secret and config map files merged into one tree |
//! | anything else | `UnsupportedVolumeType` |
//!
//! A missing secret or config map is fatal unless the volume marks it
//! optional, in which case the volume resolves to [`ResolvedSource::Empty`].

mod extras;

pub use extras::{Extras, TemplateVars, escape, render};

use crate::error::{Error, Result};
use crate::pod::{HostPathType, ObjectSource, ProjectionSource, Volume, VolumeMount, VolumeSource};
use crate::resources::ResourceLookup;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Relative file path to contents.
pub type FileSet = BTreeMap<String, Vec<u8>>;

// =============================================================================
// Resolved Volumes
// =============================================================================

/// A volume whose contents are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedVolume {
    pub name: String,
    pub source: ResolvedSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedSource {
    /// Existing host directory.
    HostPath { path: PathBuf },
    /// Files to write out, from secrets, config maps or projections.
    Files {
        files: FileSet,
        /// Projection sources accepted without contributing content.
        stubbed: Vec<String>,
    },
    /// Optional source that does not exist.
    Empty,
}

impl ResolvedVolume {
    /// Host directory backing this volume, writing files into `dir` when
    /// the volume carries them. `None` for an empty volume.
    ///
    /// `dir` is recreated from scratch.
    pub fn materialize(&self, dir: &Path) -> Result<Option<PathBuf>> {
        match &self.source {
            ResolvedSource::HostPath { path } => Ok(Some(path.clone())),
            ResolvedSource::Empty => Ok(None),
            ResolvedSource::Files { files, .. } => {
                if dir.exists() {
                    fs::remove_dir_all(dir)?;
                }
                fs::create_dir_all(dir)?;

                for (relative, data) in files {
                    let target = safe_join(dir, relative)?;
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&target, data)?;
                }

                debug!(
                    volume = %self.name,
                    dir = %dir.display(),
                    files = files.len(),
                    "materialized volume"
                );
                Ok(Some(dir.to_path_buf()))
            }
        }
    }
}

/// Joins a relative item path under `base`, rejecting escapes.
fn safe_join(base: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let clean = !relative.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !clean {
        return Err(Error::PathTraversal {
            path: relative.to_string(),
        });
    }
    Ok(base.join(path))
}

/// OCI bind mount entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: PathBuf,
    pub options: Vec<String>,
}

/// Bind mount of `source` at the mount's path.
pub fn bind_mount(source: &Path, mount: &VolumeMount) -> BindMount {
    let access = if mount.read_only { "ro" } else { "rw" };
    BindMount {
        destination: mount.mount_path.clone(),
        kind: "none".to_string(),
        source: source.to_path_buf(),
        options: vec!["rbind".to_string(), access.to_string()],
    }
}

// =============================================================================
// Translator
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Secret,
    ConfigMap,
}

impl ObjectKind {
    fn name(self) -> &'static str {
        match self {
            Self::Secret => "secret",
            Self::ConfigMap => "configMap",
        }
    }
}

/// Resolves pod volumes.
#[derive(Clone)]
pub struct VolumeTranslator {
    resources: Arc<dyn ResourceLookup>,
}

impl VolumeTranslator {
    pub fn new(resources: Arc<dyn ResourceLookup>) -> Self {
        Self { resources }
    }

    /// Resolves `volume` for a pod in `namespace`.
    pub async fn translate(&self, namespace: &str, volume: &Volume) -> Result<ResolvedVolume> {
        let source = match &volume.source {
            VolumeSource::HostPath { path, kind } => host_path(&volume.name, path, kind)?,
            VolumeSource::Secret(object) => {
                self.object(namespace, &volume.name, ObjectKind::Secret, object)
                    .await?
                    .map(files_only)
                    .unwrap_or(ResolvedSource::Empty)
            }
            VolumeSource::ConfigMap(object) => {
                self.object(namespace, &volume.name, ObjectKind::ConfigMap, object)
                    .await?
                    .map(files_only)
                    .unwrap_or(ResolvedSource::Empty)
            }
            VolumeSource::Projected { sources } => {
                self.projected(namespace, &volume.name, sources).await?
            }
            other => {
                return Err(Error::UnsupportedVolumeType {
                    volume: volume.name.clone(),
                    reason: format!("'{}' volumes are not supported", other.kind()),
                });
            }
        };

        info!(volume = %volume.name, kind = volume.source.kind(), "resolved volume");
        Ok(ResolvedVolume {
            name: volume.name.clone(),
            source,
        })
    }

    async fn projected(
        &self,
        namespace: &str,
        volume: &str,
        sources: &[ProjectionSource],
    ) -> Result<ResolvedSource> {
        let mut files = FileSet::new();
        let mut stubbed = Vec::new();

        for source in sources {
            let resolved = match source {
                ProjectionSource::Secret(object) => {
                    self.object(namespace, volume, ObjectKind::Secret, object).await
                }
                ProjectionSource::ConfigMap(object) => {
                    self.object(namespace, volume, ObjectKind::ConfigMap, object)
                        .await
                }
                ProjectionSource::DownwardApi | ProjectionSource::ServiceAccountToken => {
                    warn!(
                        volume = %volume,
                        source = source.kind(),
                        "projection source is not implemented, mounting nothing for it"
                    );
                    stubbed.push(source.kind().to_string());
                    continue;
                }
                ProjectionSource::Unknown(kind) => Err(Error::InvalidInput(format!(
                    "unknown projection source '{}'",
                    kind
                ))),
            };

            match resolved {
                Ok(Some(found)) => files.extend(found),
                Ok(None) => {}
                Err(e) => {
                    return Err(Error::UnsupportedProjectionSource {
                        volume: volume.to_string(),
                        source_kind: source.kind().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(ResolvedSource::Files { files, stubbed })
    }

    /// Files of a secret or config map, `None` if it is optional and absent.
    async fn object(
        &self,
        namespace: &str,
        volume: &str,
        kind: ObjectKind,
        source: &ObjectSource,
    ) -> Result<Option<FileSet>> {
        let missing = |name: String, what: &str| Error::MissingRequiredResource {
            kind: what.to_string(),
            name,
            volume: volume.to_string(),
        };

        let data = match self.fetch(kind, &source.name, namespace).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() && source.is_optional() => {
                debug!(
                    volume = %volume,
                    kind = kind.name(),
                    name = %source.name,
                    "optional object not found"
                );
                return Ok(None);
            }
            Err(e) if e.is_not_found() => {
                return Err(missing(source.name.clone(), kind.name()));
            }
            Err(e) => return Err(e),
        };

        if source.items.is_empty() {
            return Ok(Some(data));
        }

        let mut selected = FileSet::new();
        for item in &source.items {
            match data.get(&item.key) {
                Some(value) => {
                    selected.insert(item.path.clone(), value.clone());
                }
                None if source.is_optional() => {
                    debug!(volume = %volume, key = %item.key, "optional key not found");
                }
                None => {
                    return Err(missing(
                        format!("{}/{}", source.name, item.key),
                        &format!("{} key", kind.name()),
                    ));
                }
            }
        }
        Ok(Some(selected))
    }

    async fn fetch(&self, kind: ObjectKind, name: &str, namespace: &str) -> Result<FileSet> {
        match kind {
            ObjectKind::Secret => Ok(self.resources.get_secret(name, namespace).await?.data),
            ObjectKind::ConfigMap => Ok(self
                .resources
                .get_config_map(name, namespace)
                .await?
                .data
                .into_iter()
                .map(|(k, v)| (k, v.into_bytes()))
                .collect()),
        }
    }
}

fn files_only(files: FileSet) -> ResolvedSource {
    ResolvedSource::Files {
        files,
        stubbed: Vec::new(),
    }
}

fn host_path(volume: &str, path: &str, kind: &HostPathType) -> Result<ResolvedSource> {
    match kind {
        HostPathType::DirectoryOrCreate => create_dir(Path::new(path))?,
        HostPathType::Directory | HostPathType::Unset => {}
        HostPathType::Other(other) => {
            return Err(Error::UnsupportedVolumeType {
                volume: volume.to_string(),
                reason: format!("unsupported hostPath.type '{}'", other),
            });
        }
    }
    Ok(ResolvedSource::HostPath {
        path: PathBuf::from(path),
    })
}

#[cfg(unix)]
fn create_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_safe_join() {
        let base = Path::new("/v");
        assert_eq!(safe_join(base, "a/b").unwrap(), PathBuf::from("/v/a/b"));
        assert!(safe_join(base, "../etc/passwd").is_err());
        assert!(safe_join(base, "/etc/passwd").is_err());
        assert!(safe_join(base, "").is_err());
    }

    #[test]
    fn test_materialize_replaces_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("vol");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale"), b"old").unwrap();

        let volume = ResolvedVolume {
            name: "conf".to_string(),
            source: files_only(FileSet::from([("app/settings".to_string(), b"x=1".to_vec())])),
        };
        let path = volume.materialize(&dir).unwrap().unwrap();

        assert!(!path.join("stale").exists());
        assert_eq!(fs::read(path.join("app/settings")).unwrap(), b"x=1");
    }

    #[test]
    fn test_bind_mount_options() {
        let mount = VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            read_only: true,
        };
        let bind = bind_mount(Path::new("/srv"), &mount);
        assert_eq!(bind.kind, "none");
        assert_eq!(bind.options, vec!["rbind", "ro"]);
    }
}
