//! # OCI Registry Access
//!
//! Parses image references and fetches manifests and blobs from OCI
//! registries.
//!
//! ## References
//!
//! [`ImageRef::parse`] is strict: the first path segment must name a
//! registry (contain `.` or `:`, or be `localhost`). Short Docker names are
//! turned into fully qualified references with [`ImageRef::normalize`]
//! before they reach the resolver:
//!
//! | Input | Normalized |
//! |-------|------------|
//! | `alpine` | `docker.io/library/alpine:latest` |
//! | `localhost:5000/osv/nginx` | `localhost:5000/osv/nginx:latest` |
//!
//! ## Registry Seam
//!
//! [`Registry`] is the collaborator the image resolver talks to.
//! [`OciRegistry`] implements it over `oci-distribution` with:
//!
//! - **Multi-arch resolution**: image indexes are resolved to the host platform
//! - **Timeouts**: every network operation is bounded by `IMAGE_PULL_TIMEOUT`
//! - **Insecure registries**: listed registries are reached over plain HTTP
//!
//! [`pull_image`] downloads every layer of an image into the [`BlobStore`],
//! skipping layers that are already cached and enforcing `MAX_LAYERS` and
//! `MAX_LAYER_SIZE`.

use crate::constants::{IMAGE_PULL_TIMEOUT, MAX_IMAGE_REF_LEN, MAX_LAYER_SIZE, MAX_LAYERS};
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::storage::BlobStore;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

// =============================================================================
// Image References
// =============================================================================

/// A fully qualified image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Registry host, with port if any.
    pub registry: String,
    /// Repository path inside the registry.
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parses a reference that names its registry explicitly.
    ///
    /// An `http://` or `https://` scheme prefix is accepted and dropped.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidReference`] for overlong references, invalid
    /// characters, a missing registry or an empty repository.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = strip_scheme(reference);
        validate_chars(reference, trimmed)?;

        let (registry, rest) = trimmed
            .split_once('/')
            .ok_or_else(|| invalid("does not contain a valid registry"))?;
        if !looks_like_registry(registry) {
            return Err(invalid("does not contain a valid registry"));
        }

        let (name, digest) = match rest.split_once('@') {
            Some((name, digest)) if !digest.is_empty() => (name, Some(digest.to_string())),
            Some(_) => return Err(invalid("empty digest")),
            None => (rest, None),
        };

        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &name[split + 1..];
                if tag.is_empty() {
                    return Err(invalid("empty tag"));
                }
                (&name[..split], Some(tag.to_string()))
            }
            None => (name, None),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid("empty repository"));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Expands Docker short names to fully qualified references.
    ///
    /// `alpine` becomes `docker.io/library/alpine:latest`.
    pub fn normalize(reference: &str) -> Result<String> {
        let trimmed = strip_scheme(reference);
        validate_chars(reference, trimmed)?;

        let parsed: Reference = trimmed.parse().map_err(|e| Error::InvalidReference {
            reference: reference.to_string(),
            reason: format!("{}", e),
        })?;

        let mut whole = parsed.whole();
        if parsed.tag().is_none() && parsed.digest().is_none() {
            whole.push_str(":latest");
        }
        Ok(whole)
    }

    /// Tag of the reference, `latest` when absent.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// True when the image tracks a moving tag.
    pub fn is_latest(&self) -> bool {
        self.digest.is_none() && self.tag_or_latest() == "latest"
    }

    fn to_reference(&self) -> Result<Reference> {
        self.to_string()
            .parse()
            .map_err(|e| Error::InvalidReference {
                reference: self.to_string(),
                reason: format!("{}", e),
            })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn strip_scheme(reference: &str) -> &str {
    reference
        .strip_prefix("https://")
        .or_else(|| reference.strip_prefix("http://"))
        .unwrap_or(reference)
}

fn validate_chars(reference: &str, trimmed: &str) -> Result<()> {
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidReference {
            reference: reference.to_string(),
            reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
        });
    }

    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
    {
        return Err(Error::InvalidReference {
            reference: reference.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }

    Ok(())
}

fn looks_like_registry(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}

// =============================================================================
// Manifests and Blobs
// =============================================================================

/// Handle to an image whose layers are in the [`BlobStore`].
///
/// `layers[0]` is the base layer; later layers overwrite earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHandle {
    /// Original image reference.
    pub reference: String,
    /// Resolved manifest digest.
    pub digest: String,
    /// Platform this image is for.
    pub platform: String,
    /// Layer digests in order.
    pub layers: Vec<LayerInfo>,
    /// Config blob digest.
    pub config_digest: String,
}

/// Metadata about a blob referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
    pub media_type: String,
}

impl LayerInfo {
    fn descriptor(&self) -> OciDescriptor {
        OciDescriptor {
            digest: self.digest.clone(),
            size: self.size as i64,
            media_type: self.media_type.clone(),
            urls: None,
            annotations: None,
        }
    }

    fn from_descriptor(desc: OciDescriptor) -> Self {
        Self {
            digest: desc.digest,
            size: desc.size.max(0) as u64,
            media_type: desc.media_type,
        }
    }
}

/// A single-platform image manifest.
#[derive(Debug, Clone)]
pub struct ImageManifest {
    /// Digest of the manifest as served by the registry.
    pub digest: String,
    /// Platform the manifest was resolved for, e.g. `linux/amd64`.
    pub platform: String,
    pub config: LayerInfo,
    pub layers: Vec<LayerInfo>,
}

/// Registry collaborator used by the image resolver.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetches the manifest of an image, resolving multi-arch indexes.
    async fn pull_manifest(&self, image: &ImageRef) -> Result<ImageManifest>;

    /// Streams a blob of an image into `out`.
    async fn pull_blob(
        &self,
        image: &ImageRef,
        blob: &LayerInfo,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;
}

// =============================================================================
// oci-distribution Client
// =============================================================================

/// [`Registry`] implementation over `oci-distribution`.
///
/// | Method | Constructor |
/// |--------|-------------|
/// | Anonymous | [`OciRegistry::new`] |
/// | Basic auth | [`OciRegistry::with_auth`] |
pub struct OciRegistry {
    client: Client,
    auth: RegistryAuth,
    platform: Platform,
}

impl OciRegistry {
    /// Creates a client with anonymous auth.
    ///
    /// Registries in `insecure` are reached over plain HTTP.
    pub fn new(insecure: &[String]) -> Self {
        Self {
            client: Client::new(client_config(insecure)),
            auth: RegistryAuth::Anonymous,
            platform: Platform::detect(),
        }
    }

    /// Creates a client with basic auth.
    pub fn with_auth(insecure: &[String], username: &str, password: &str) -> Self {
        Self {
            client: Client::new(client_config(insecure)),
            auth: RegistryAuth::Basic(username.to_string(), password.to_string()),
            platform: Platform::detect(),
        }
    }

    /// Resolves a manifest (handling multi-arch index).
    async fn resolve_manifest(
        &self,
        reference: &Reference,
        manifest: OciManifest,
        digest: String,
    ) -> Result<ImageManifest> {
        match manifest {
            OciManifest::Image(img) => Ok(ImageManifest {
                digest,
                platform: self.platform.oci_platform(),
                config: LayerInfo::from_descriptor(img.config),
                layers: img.layers.into_iter().map(LayerInfo::from_descriptor).collect(),
            }),

            OciManifest::ImageIndex(index) => {
                let target_os = self.platform.oci_os();
                let target_arch = self.platform.oci_arch();

                let matching = index.manifests.iter().find(|m| {
                    m.platform
                        .as_ref()
                        .is_some_and(|p| p.os == target_os && p.architecture == target_arch)
                });

                let manifest_desc = matching.ok_or_else(|| {
                    let available: Vec<String> = index
                        .manifests
                        .iter()
                        .filter_map(|m| m.platform.as_ref())
                        .map(|p| format!("{}/{}", p.os, p.architecture))
                        .collect();

                    Error::ImagePullFailed {
                        reference: reference.to_string(),
                        reason: format!(
                            "no manifest for {}/{}. Available: {}",
                            target_os,
                            target_arch,
                            available.join(", ")
                        ),
                    }
                })?;

                let platform_ref: Reference = format!(
                    "{}/{}@{}",
                    reference.registry(),
                    reference.repository(),
                    manifest_desc.digest
                )
                .parse()
                .map_err(|e| Error::ImagePullFailed {
                    reference: reference.to_string(),
                    reason: format!("failed to build digest reference: {}", e),
                })?;

                let (platform_manifest, platform_digest) =
                    timed(&format!("pull platform manifest for {}", reference), async {
                        self.client.pull_manifest(&platform_ref, &self.auth).await
                    })
                    .await?
                    .map_err(|e| Error::ImagePullFailed {
                        reference: reference.to_string(),
                        reason: format!("failed to pull platform manifest: {}", e),
                    })?;

                match platform_manifest {
                    OciManifest::Image(img) => Ok(ImageManifest {
                        digest: platform_digest,
                        platform: format!("{}/{}", target_os, target_arch),
                        config: LayerInfo::from_descriptor(img.config),
                        layers: img.layers.into_iter().map(LayerInfo::from_descriptor).collect(),
                    }),
                    OciManifest::ImageIndex(_) => Err(Error::ImagePullFailed {
                        reference: reference.to_string(),
                        reason: "nested image index not supported".to_string(),
                    }),
                }
            }
        }
    }
}

fn client_config(insecure: &[String]) -> ClientConfig {
    let protocol = if insecure.is_empty() {
        ClientProtocol::Https
    } else {
        ClientProtocol::HttpsExcept(insecure.to_vec())
    };
    ClientConfig {
        protocol,
        ..Default::default()
    }
}

async fn timed<T>(operation: &str, fut: impl std::future::Future<Output = T>) -> Result<T> {
    tokio::time::timeout(IMAGE_PULL_TIMEOUT, fut)
        .await
        .map_err(|_| Error::Timeout {
            operation: operation.to_string(),
            duration: IMAGE_PULL_TIMEOUT,
        })
}

#[async_trait]
impl Registry for OciRegistry {
    async fn pull_manifest(&self, image: &ImageRef) -> Result<ImageManifest> {
        let reference = image.to_reference()?;
        debug!(image = %image, "pulling manifest");

        let (manifest, digest) = timed(&format!("pull manifest for {}", image), async {
            self.client.pull_manifest(&reference, &self.auth).await
        })
        .await?
        .map_err(|e| Error::ImagePullFailed {
            reference: image.to_string(),
            reason: e.to_string(),
        })?;

        self.resolve_manifest(&reference, manifest, digest).await
    }

    async fn pull_blob(
        &self,
        image: &ImageRef,
        blob: &LayerInfo,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let reference = image.to_reference()?;
        let desc = blob.descriptor();

        timed(&format!("pull blob {}", blob.digest), async {
            self.client.pull_blob(&reference, &desc, out).await
        })
        .await?
        .map_err(|e| Error::ImagePullFailed {
            reference: image.to_string(),
            reason: format!("blob {}: {}", blob.digest, e),
        })
    }
}

// =============================================================================
// Layer Pulling
// =============================================================================

/// Pulls every layer of an image into blob storage.
///
/// Already-cached layers (by digest) are skipped, so images sharing base
/// layers only download unique ones. Content is verified by
/// [`BlobStore::put_blob`].
///
/// ## Errors
///
/// - [`Error::ImagePullFailed`]: registry unreachable, image not found or
///   too many layers
/// - [`Error::ImageTooLarge`]: layer exceeds `MAX_LAYER_SIZE`
/// - [`Error::Timeout`]: operation exceeded `IMAGE_PULL_TIMEOUT`
pub async fn pull_image(
    registry: &dyn Registry,
    image: &ImageRef,
    storage: &BlobStore,
) -> Result<ImageHandle> {
    info!(image = %image, "pulling image layers");

    let manifest = registry.pull_manifest(image).await?;

    if manifest.layers.len() > MAX_LAYERS {
        return Err(Error::ImagePullFailed {
            reference: image.to_string(),
            reason: format!("too many layers: {} > {}", manifest.layers.len(), MAX_LAYERS),
        });
    }

    for layer in &manifest.layers {
        if storage.has_blob(&layer.digest) {
            debug!(digest = %layer.digest, "layer already cached");
            continue;
        }

        if layer.size > MAX_LAYER_SIZE as u64 {
            return Err(Error::ImageTooLarge {
                size: layer.size,
                limit: MAX_LAYER_SIZE as u64,
            });
        }

        debug!(digest = %layer.digest, size = layer.size, "pulling layer");

        let mut data = Vec::new();
        registry.pull_blob(image, layer, &mut data).await?;
        storage.put_blob(&layer.digest, &data)?;
    }

    Ok(ImageHandle {
        reference: image.to_string(),
        digest: manifest.digest,
        platform: manifest.platform,
        layers: manifest.layers,
        config_digest: manifest.config.digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reference() {
        let r = ImageRef::parse("https://localhost:5000/osv/nginx:1.0").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "osv/nginx");
        assert_eq!(r.tag.as_deref(), Some("1.0"));
        assert_eq!(r.to_string(), "localhost:5000/osv/nginx:1.0");
    }

    #[test]
    fn test_parse_digest_reference() {
        let r = ImageRef::parse("registry.io/app@sha256:abcd").unwrap();
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:abcd"));
        assert!(!r.is_latest());
    }

    #[test]
    fn test_parse_requires_registry() {
        assert!(matches!(
            ImageRef::parse("library/alpine:3.18"),
            Err(Error::InvalidReference { .. })
        ));
        assert!(ImageRef::parse("alpine").is_err());
        assert!(ImageRef::parse("registry.io/").is_err());
        assert!(ImageRef::parse("registry.io/app:").is_err());
        assert!(ImageRef::parse("registry.io/a pp").is_err());
    }

    #[test]
    fn test_normalize_short_name() {
        assert_eq!(
            ImageRef::normalize("alpine").unwrap(),
            "docker.io/library/alpine:latest"
        );
        let r = ImageRef::parse(&ImageRef::normalize("alpine").unwrap()).unwrap();
        assert!(r.is_latest());
    }
}
