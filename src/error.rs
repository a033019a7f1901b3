//! Error types for the fledge orchestration layer.

use std::path::PathBuf;

/// Result type alias for fledge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving, creating, or driving instances.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Identifier Errors
    // =========================================================================
    /// Identifier could not be built or parsed.
    #[error("invalid instance identifier '{id}': {reason}")]
    InvalidIdentifier { id: String, reason: String },

    // =========================================================================
    // Instance Lifecycle Errors
    // =========================================================================
    /// Instance was never created or has been deleted.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Pod was never created or has been deleted.
    #[error("pod not found: {0}")]
    PodNotFound(String),

    /// An instance with this identifier already exists.
    #[error("name collision for instance '{0}'")]
    NameCollision(String),

    /// Instance is in the wrong state for the operation.
    #[error("instance '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Image declared a backend that is unknown or not enabled.
    #[error("unsupported backend '{0}'")]
    UnsupportedBackend(String),

    /// Image declared a hypervisor the VM backend cannot drive.
    #[error("unsupported hypervisor '{0}'")]
    UnsupportedHypervisor(String),

    /// Error raised inside a backend, tagged with the backend name.
    #[error("{backend}: {source}")]
    Backend {
        backend: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Container Runtime Errors
    // =========================================================================
    /// Container not found in the OCI runtime.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container ID rejected by the runtime.
    #[error("invalid container id '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// Runtime limit reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Container create failed.
    #[error("failed to create container '{id}': {reason}")]
    CreateFailed { id: String, reason: String },

    /// Container start failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Signal delivery failed.
    #[error("failed to send signal to '{id}': {reason}")]
    SignalFailed { id: String, reason: String },

    /// Container delete failed.
    #[error("failed to delete container '{id}': {reason}")]
    DeleteFailed { id: String, reason: String },

    /// Exec failed or exited non-zero.
    #[error("exec failed in container '{container}': {reason}")]
    ExecFailed { container: String, reason: String },

    /// Runtime not available on this platform.
    #[error("runtime '{runtime}' not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    /// Operation not supported by this backend or runtime.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Image/Registry Errors
    // =========================================================================
    /// Image reference is malformed or lacks a registry.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Image shape does not fit the backend (e.g. layer count).
    #[error("unsupported image '{reference}': {reason}")]
    UnsupportedImage { reference: String, reason: String },

    /// Disk image layer has a media type we cannot unpack.
    #[error("unsupported layer type '{media_type}' in image '{reference}'")]
    UnsupportedLayerType {
        reference: String,
        media_type: String,
    },

    /// Disk image layer does not hold the expected file.
    #[error("unexpected layer content in image '{reference}': {entry}")]
    UnexpectedLayerContent { reference: String, entry: String },

    /// Pull policy forbids pulling and the image is not local.
    #[error("image '{reference}' is not present and pull policy is Never")]
    ImageNotPresent { reference: String },

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Path traversal attempt detected in an archive or item path.
    #[error("path traversal detected: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Bundle Errors
    // =========================================================================
    /// Failed to build bundle.
    #[error("failed to build bundle: {0}")]
    BundleBuildFailed(String),

    /// Invalid bundle (missing config.json or rootfs).
    #[error("invalid bundle at {path}: {reason}")]
    InvalidBundle { path: PathBuf, reason: String },

    // =========================================================================
    // Volume Errors
    // =========================================================================
    /// Volume source kind (or host path type) is not supported.
    #[error("volume '{volume}' has an unsupported type: {reason}")]
    UnsupportedVolumeType { volume: String, reason: String },

    /// A non-optional secret or config map is missing.
    #[error("volume '{volume}' requires {kind} '{name}' which does not exist")]
    MissingRequiredResource {
        kind: String,
        name: String,
        volume: String,
    },

    /// A projected volume source could not be resolved.
    #[error("projected volume '{volume}' source {source_kind} failed: {reason}")]
    UnsupportedProjectionSource {
        volume: String,
        source_kind: String,
        reason: String,
    },

    /// Instance mounts a volume that was never created on its backend.
    #[error("volume '{0}' was not created")]
    VolumeNotCreated(String),

    /// Mount option template is malformed.
    #[error("invalid template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    // =========================================================================
    // Resource Lookup Errors
    // =========================================================================
    /// Cluster object does not exist.
    #[error("{kind} '{namespace}/{name}' not found")]
    ResourceNotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Cluster object lookup failed for another reason.
    #[error("failed to look up {kind} '{name}': {reason}")]
    ResourceLookupFailed {
        kind: String,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration value rejected.
    #[error("invalid configuration for '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Manifest or argument rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Tags this error with the backend that produced it.
    ///
    /// Already tagged errors are returned unchanged.
    pub fn in_backend(self, backend: impl std::fmt::Display) -> Self {
        match self {
            Error::Backend { .. } => self,
            other => Error::Backend {
                backend: backend.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, looking through backend tags.
    pub fn root(&self) -> &Error {
        match self {
            Error::Backend { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for the "object does not exist" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Error::InstanceNotFound(_)
                | Error::PodNotFound(_)
                | Error::ContainerNotFound(_)
                | Error::ResourceNotFound { .. }
                | Error::BlobNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {}", e))
    }
}
