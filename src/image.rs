//! # Image Resolution
//!
//! [`ImageResolver`] answers two questions about an image reference:
//!
//! - which backend runs it, read from the image config blob
//!   ([`ImageResolver::resolve_config`])
//! - where its runnable content lives on the host
//!
//! The second depends on the backend:
//!
//! | Backend | Content | Operation |
//! |---------|---------|-----------|
//! | container | layers in the [`BlobStore`] | [`ImageResolver::pull_layers`] |
//! | VM | a single disk image file | [`ImageResolver::materialize_disk_image`] |
//!
//! ## Disk images
//!
//! A VM image is an OCI image with exactly one layer. That layer is a tar
//! archive (optionally gzip-compressed) whose first entry is the disk file
//! for the hypervisor, named `*.<hypervisor>`:
//!
//! ```text
//! registry.io/osv/nginx:1.0
//!   └── layer 0 (tar+gzip)
//!         └── nginx.qemu    ──copy──▶ <root>/images/fledge/<name>/nginx.qemu
//! ```
//!
//! Materializing is destructive: the image directory is removed and
//! rebuilt from the registry every time.

use crate::constants::{
    MAX_CONFIG_SIZE, MAX_ROOTFS_SIZE, OCI_LAYER_MEDIA_TYPE_GZIP, OCI_LAYER_MEDIA_TYPE_TAR,
};
use crate::error::{Error, Result};
use crate::pod::PullPolicy;
use crate::registry::{ImageHandle, ImageRef, Registry, pull_image};
use crate::storage::{BlobStore, ImageIndex, ImageRepository, image_tag};
use flate2::read::GzDecoder;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

// =============================================================================
// Image Config
// =============================================================================

/// The parts of an OCI image config the provider uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Backend that runs this image; absent means the container backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Hypervisor for VM images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypervisor: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, deserialize_with = "nullable")]
    pub config: ProcessConfig,
}

/// Default process of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessConfig {
    #[serde(default, deserialize_with = "nullable")]
    pub entrypoint: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub cmd: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub env: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub working_dir: String,
}

/// Treats an explicit `null` like a missing field.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ImageConfig {
    /// Decodes a config blob.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Fetches image metadata and content for the backends.
pub struct ImageResolver {
    registry: Arc<dyn Registry>,
    repository: ImageRepository,
    blobs: Arc<BlobStore>,
}

impl ImageResolver {
    pub fn new(
        registry: Arc<dyn Registry>,
        repository: ImageRepository,
        blobs: Arc<BlobStore>,
    ) -> Self {
        Self {
            registry,
            repository,
            blobs,
        }
    }

    pub fn repository(&self) -> &ImageRepository {
        &self.repository
    }

    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    /// Fetches and decodes the config blob of `reference`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidReference`]: no registry in the reference
    /// - [`Error::ImageTooLarge`]: config blob exceeds `MAX_CONFIG_SIZE`
    /// - [`Error::Serialization`]: config blob is not valid JSON
    pub async fn resolve_config(&self, reference: &str) -> Result<ImageConfig> {
        let image = ImageRef::parse(reference)?;
        let manifest = self.registry.pull_manifest(&image).await?;

        if manifest.config.size > MAX_CONFIG_SIZE as u64 {
            return Err(Error::ImageTooLarge {
                size: manifest.config.size,
                limit: MAX_CONFIG_SIZE as u64,
            });
        }

        let mut data = Vec::new();
        self.registry
            .pull_blob(&image, &manifest.config, &mut data)
            .await?;
        let config = ImageConfig::from_json(&data)?;

        debug!(
            image = %reference,
            backend = config.backend.as_deref().unwrap_or(""),
            hypervisor = config.hypervisor.as_deref().unwrap_or(""),
            "resolved image config"
        );
        Ok(config)
    }

    /// Pulls the layers of a container image honoring `policy`.
    ///
    /// A previous pull counts as present when its layer record exists and
    /// every layer is still in the blob store.
    pub async fn pull_layers(&self, reference: &str, policy: PullPolicy) -> Result<ImageHandle> {
        let image = ImageRef::parse(reference)?;
        let cached = self.cached_layers(reference)?;

        if !policy.should_pull(reference, cached.is_some())?
            && let Some(handle) = cached
        {
            debug!(image = %reference, "using cached layers");
            return Ok(handle);
        }

        let handle = pull_image(self.registry.as_ref(), &image, &self.blobs).await?;
        self.repository.write_layers(reference, &handle)?;
        Ok(handle)
    }

    fn cached_layers(&self, reference: &str) -> Result<Option<ImageHandle>> {
        Ok(self
            .repository
            .read_layers(reference)?
            .filter(|h| h.layers.iter().all(|l| self.blobs.has_blob(&l.digest))))
    }

    /// Materializes the disk image if `policy` asks for it and returns its
    /// path.
    pub async fn ensure_disk_image(
        &self,
        reference: &str,
        hypervisor: &str,
        policy: PullPolicy,
    ) -> Result<PathBuf> {
        let present = self.repository.has_disk_image(reference, hypervisor);
        if policy.should_pull(reference, present)? {
            self.materialize_disk_image(reference, hypervisor).await
        } else {
            debug!(image = %reference, "disk image already present");
            Ok(self.repository.disk_path(reference, hypervisor))
        }
    }

    /// Rebuilds the local disk image of `reference` for `hypervisor`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedImage`]: the image does not have exactly one
    ///   layer
    /// - [`Error::UnsupportedLayerType`]: the layer is not an OCI tar layer
    /// - [`Error::UnexpectedLayerContent`]: the first archive entry is not a
    ///   `.<hypervisor>` file, or the archive is empty
    pub async fn materialize_disk_image(
        &self,
        reference: &str,
        hypervisor: &str,
    ) -> Result<PathBuf> {
        let image = ImageRef::parse(reference)?;
        let dir = self.repository.image_dir(reference);

        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;

        self.repository
            .write_index(reference, &ImageIndex::new(&image_tag(reference)))?;

        let manifest = self.registry.pull_manifest(&image).await?;
        let [layer] = manifest.layers.as_slice() else {
            return Err(Error::UnsupportedImage {
                reference: reference.to_string(),
                reason: format!("expected 1 layer, found {}", manifest.layers.len()),
            });
        };

        let gzip = match layer.media_type.as_str() {
            OCI_LAYER_MEDIA_TYPE_GZIP => true,
            OCI_LAYER_MEDIA_TYPE_TAR => false,
            other => {
                return Err(Error::UnsupportedLayerType {
                    reference: reference.to_string(),
                    media_type: other.to_string(),
                });
            }
        };

        if layer.size > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: layer.size,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        info!(image = %reference, digest = %layer.digest, size = layer.size, "pulling disk image layer");

        let archive = dir.join(format!(".layer-{}.tmp", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&archive).await?;
        let pulled = self.registry.pull_blob(&image, layer, &mut file).await;
        let flushed = file.flush().await;
        drop(file);
        if let Err(e) = pulled.and(flushed.map_err(Error::from)) {
            let _ = tokio::fs::remove_file(&archive).await;
            return Err(e);
        }

        let dest = self.repository.disk_path(reference, hypervisor);
        let extracted = {
            let archive = archive.clone();
            let dest = dest.clone();
            let reference = reference.to_string();
            let hypervisor = hypervisor.to_string();
            let digest = layer.digest.clone();
            tokio::task::spawn_blocking(move || {
                extract_disk(&archive, gzip, &hypervisor, &dest, &reference, &digest)
            })
            .await
            .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))?
        };
        let _ = tokio::fs::remove_file(&archive).await;
        let bytes = extracted?;

        info!(image = %reference, path = %dest.display(), bytes, "materialized disk image");
        Ok(dest)
    }
}

/// Copies the first entry of a layer archive to `dest`.
fn extract_disk(
    archive: &Path,
    gzip: bool,
    hypervisor: &str,
    dest: &Path,
    reference: &str,
    digest: &str,
) -> Result<u64> {
    let failed = |reason: String| Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason,
    };
    let unexpected = |entry: String| Error::UnexpectedLayerContent {
        reference: reference.to_string(),
        entry,
    };

    let file = fs::File::open(archive)?;
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut tar = tar::Archive::new(reader);
    let mut entries = tar.entries().map_err(|e| failed(e.to_string()))?;
    let mut entry = match entries.next() {
        Some(entry) => entry.map_err(|e| failed(e.to_string()))?,
        None => return Err(unexpected("<empty archive>".to_string())),
    };

    let name = entry
        .path()
        .map_err(|e| failed(e.to_string()))?
        .to_string_lossy()
        .into_owned();
    if !name.ends_with(&format!(".{}", hypervisor)) {
        return Err(unexpected(name));
    }

    let mut out = fs::File::create(dest)?;
    let copied = std::io::copy(&mut entry, &mut out).map_err(|e| failed(e.to_string()))?;
    out.sync_all()?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_config_extension_fields() {
        let config = ImageConfig::from_json(
            br#"{"backend":"osv","hypervisor":"qemu","architecture":"amd64","os":"linux",
                "config":{"Cmd":null,"Env":["A=1"],"WorkingDir":"/app"}}"#,
        )
        .unwrap();
        assert_eq!(config.backend.as_deref(), Some("osv"));
        assert_eq!(config.hypervisor.as_deref(), Some("qemu"));
        assert!(config.config.cmd.is_empty());
        assert_eq!(config.config.env, vec!["A=1"]);
        assert_eq!(config.config.working_dir, "/app");
    }

    #[test]
    fn test_image_config_defaults() {
        let config = ImageConfig::from_json(br#"{"config":null}"#).unwrap();
        assert_eq!(config, ImageConfig::default());
        assert!(matches!(
            ImageConfig::from_json(b"not json"),
            Err(Error::Serialization(_))
        ));
    }
}
