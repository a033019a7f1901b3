//! # Local Image Storage
//!
//! Two stores live under the configured root directory:
//!
//! ```text
//! <root>/
//! ├── blobs/                          BlobStore (container backend)
//! │   └── sha256/
//! │       └── ab/abcd1234...          layer content, digest-verified
//! └── images/                         ImageRepository (VM backend)
//!     └── fledge/
//!         └── registry.io_osv_nginx:1.0/
//!             ├── index.yaml          index record (JSON)
//!             ├── layers.json         pulled layer list (container backend)
//!             └── nginx.qemu          disk image
//! ```
//!
//! ## Blob Store
//!
//! Layers pulled for the container backend are stored by digest. When
//! storing via [`BlobStore::put_blob`], the content hash is computed and
//! verified against the digest first, and writes go through a temp file +
//! rename so a crash never leaves a partial blob behind.
//!
//! Digests are sanitized before they become paths:
//! - Algorithm must be `sha256`, `sha384`, or `sha512`
//! - Hash must contain only hexadecimal characters
//!
//! ## Image Repository
//!
//! Disk images for the VM backend are keyed by the cleaned image reference
//! (see [`clean_name`]). Materializing an image always replaces its
//! directory wholesale; nothing here is garbage-collected.

use crate::constants::{
    BLOB_STORE_DIR, IMAGE_DIR, IMAGE_INDEX_DESCRIPTION, IMAGE_INDEX_FORMAT_VERSION,
    IMAGE_NAMESPACE, INDEX_FILE, LAYERS_FILE,
};
use crate::error::{Error, Result};
use crate::registry::ImageHandle;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Blob Store
// =============================================================================

/// Content-addressed blob store for OCI layers.
///
/// `BlobStore` is safe to use from multiple threads. Each blob operation
/// is independent, and atomic writes prevent corruption from concurrent
/// writers of the same blob.
pub struct BlobStore {
    /// Base directory for blob storage.
    base_dir: PathBuf,
}

impl BlobStore {
    /// Creates a blob store under `<root>/blobs`.
    pub fn under_root(root: &Path) -> Result<Self> {
        Self::with_path(root.join(BLOB_STORE_DIR))
    }

    /// Creates a blob store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        info!(path = %base_dir.display(), "blob store initialized");

        Ok(Self { base_dir })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Gets a blob by digest.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Gets a blob path without reading it.
    ///
    /// # Security
    ///
    /// The digest is sanitized so it can never escape the store:
    /// - Algorithm must be sha256, sha384, or sha512
    /// - Hash must contain only hexadecimal characters
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        // sha256:abcd1234... is stored as blobs/sha256/ab/abcd1234...
        let (algo, hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        let safe_algo = match algo {
            "sha256" | "sha384" | "sha512" => algo,
            _ => {
                warn!(algo, "invalid digest algorithm, defaulting to sha256");
                "sha256"
            }
        };

        let safe_hash: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();

        if safe_hash.len() != hash.len() {
            warn!(hash, sanitized = %safe_hash, "digest hash contained non-hex characters");
        }

        if safe_hash.is_empty() {
            // A path that won't exist
            return self.base_dir.join("invalid").join("empty");
        }

        let prefix = &safe_hash[..2.min(safe_hash.len())];
        self.base_dir.join(safe_algo).join(prefix).join(&safe_hash)
    }

    /// Stores a blob after verifying its content matches the digest.
    ///
    /// Only SHA-256 digests are accepted so every stored blob is verified.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let (algo, expected_hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        if algo != "sha256" {
            return Err(Error::StorageWriteFailed(format!(
                "unsupported digest algorithm '{}': only sha256 is supported",
                algo
            )));
        }

        let computed_hash = hex::encode(Sha256::digest(data));

        if computed_hash != expected_hash {
            return Err(Error::StorageWriteFailed(format!(
                "digest mismatch: expected {}, computed {}",
                expected_hash, computed_hash
            )));
        }

        let path = self.blob_path(digest);

        if path.exists() {
            debug!(digest, "blob already exists");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        // Unique temp names keep concurrent writers of the same blob apart.
        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!(digest, bytes = data.len(), "stored verified blob");
        Ok(())
    }

    /// Removes a blob.
    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Lists all sha256 blob digests.
    pub fn list_blobs(&self) -> Result<Vec<String>> {
        let mut digests = Vec::new();
        let sha256_dir = self.base_dir.join("sha256");
        if !sha256_dir.exists() {
            return Ok(digests);
        }

        for shard in fs::read_dir(&sha256_dir)? {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&shard)? {
                let path = entry?.path();
                if path.is_file()
                    && let Some(hash) = path.file_name().and_then(|n| n.to_str())
                    && hash.chars().all(|c| c.is_ascii_hexdigit())
                {
                    digests.push(format!("sha256:{}", hash));
                }
            }
        }

        Ok(digests)
    }
}

// =============================================================================
// Image Repository
// =============================================================================

/// Index record written next to every materialized disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub format_version: String,
    /// Image tag.
    pub version: String,
    /// Creation time, `YYYY-MM-DD HH:MM` in local time.
    pub created: String,
    pub description: String,
    pub build: String,
}

impl ImageIndex {
    /// Record for an image imported now.
    pub fn new(version: &str) -> Self {
        Self {
            format_version: IMAGE_INDEX_FORMAT_VERSION.to_string(),
            version: version.to_string(),
            created: chrono::Local::now().format("%Y-%m-%d %H:%M").to_string(),
            description: IMAGE_INDEX_DESCRIPTION.to_string(),
            build: String::new(),
        }
    }
}

/// Directory layout for disk images consumed by the VM backend.
#[derive(Debug, Clone)]
pub struct ImageRepository {
    root: PathBuf,
}

impl ImageRepository {
    /// Repository under `<root>/images/fledge`.
    pub fn under_root(root: &Path) -> Result<Self> {
        let dir = root.join(IMAGE_DIR).join(IMAGE_NAMESPACE);
        fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { root: dir })
    }

    /// Base directory of the repository.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the image for `reference`.
    pub fn image_dir(&self, reference: &str) -> PathBuf {
        self.root.join(clean_name(reference).replace('/', "_"))
    }

    /// Path of the image index record.
    pub fn index_path(&self, reference: &str) -> PathBuf {
        self.image_dir(reference).join(INDEX_FILE)
    }

    /// Path of the disk image for a hypervisor, e.g. `<dir>/nginx.qemu`.
    pub fn disk_path(&self, reference: &str, hypervisor: &str) -> PathBuf {
        self.image_dir(reference)
            .join(format!("{}.{}", image_basename(reference), hypervisor))
    }

    /// True if the disk image for `hypervisor` is already materialized.
    pub fn has_disk_image(&self, reference: &str, hypervisor: &str) -> bool {
        self.disk_path(reference, hypervisor).is_file()
    }

    /// Writes the index record for an image.
    pub fn write_index(&self, reference: &str, index: &ImageIndex) -> Result<()> {
        let path = self.index_path(reference);
        fs::write(&path, serde_json::to_vec_pretty(index)?)?;
        debug!(path = %path.display(), "wrote image index");
        Ok(())
    }

    /// Reads the index record of an image.
    pub fn read_index(&self, reference: &str) -> Result<ImageIndex> {
        let data = fs::read(self.index_path(reference))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Records the layers pulled for `reference`.
    pub fn write_layers(&self, reference: &str, handle: &ImageHandle) -> Result<()> {
        let dir = self.image_dir(reference);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(LAYERS_FILE), serde_json::to_vec_pretty(handle)?)?;
        Ok(())
    }

    /// Layers previously pulled for `reference`, if recorded.
    pub fn read_layers(&self, reference: &str) -> Result<Option<ImageHandle>> {
        let path = self.image_dir(reference).join(LAYERS_FILE);
        match fs::read(&path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Cleans an image reference for use as a directory name.
///
/// Strips an `http://`/`https://` scheme and the registry port, keeping
/// the tag or digest.
///
/// | Input | Output |
/// |-------|--------|
/// | `https://localhost:5000/osv/nginx:1.0` | `localhost/osv/nginx:1.0` |
/// | `registry.io/osv/nginx` | `registry.io/osv/nginx` |
pub fn clean_name(reference: &str) -> String {
    let trimmed = reference
        .strip_prefix("https://")
        .or_else(|| reference.strip_prefix("http://"))
        .unwrap_or(reference);

    match trimmed.split_once('/') {
        Some((registry, rest)) => {
            let host = match registry.rsplit_once(':') {
                Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
                _ => registry,
            };
            format!("{}/{}", host, rest)
        }
        None => trimmed.to_string(),
    }
}

/// Final path segment of a reference without tag or digest.
pub fn image_basename(reference: &str) -> String {
    let cleaned = clean_name(reference);
    let without_digest = cleaned.split('@').next().unwrap_or(&cleaned);
    let last = without_digest.rsplit('/').next().unwrap_or(without_digest);
    last.split(':').next().unwrap_or(last).to_string()
}

/// Tag of a reference, `latest` when absent.
pub fn image_tag(reference: &str) -> String {
    let cleaned = clean_name(reference);
    let without_digest = cleaned.split('@').next().unwrap_or(&cleaned);
    let last = without_digest.rsplit('/').next().unwrap_or(without_digest);
    match last.split_once(':') {
        Some((_, tag)) if !tag.is_empty() => tag.to_string(),
        _ => "latest".to_string(),
    }
}
