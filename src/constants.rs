//! # Orchestration Constants
//!
//! Defines resource limits, timeouts, file layout names and backend defaults
//! for fledge. These constants are the **single source of truth** for the
//! bounds and well-known names used throughout the codebase.
//!
//! ## Cross-References
//!
//! - [`crate::registry`]: size limits and timeouts for image pulling
//! - [`crate::image`]: disk image layout and index record
//! - [`crate::volume`]: virtio-fs daemon arguments
//! - [`crate::backend`]: VM defaults and instance file names

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// These limits prevent disk and memory exhaustion from malicious or malformed
// OCI images. The cumulative worst-case is:
//   MAX_LAYERS × MAX_LAYER_SIZE = 128 × 512 MiB = 64 GiB (compressed)
// MAX_ROOTFS_SIZE (4 GiB) provides the actual extraction bound.
// =============================================================================

/// Maximum OCI image reference length in bytes.
///
/// **Security**: Prevents overly long image names reaching parsers and paths.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed OCI layer (512 MiB).
///
/// **Security**: Checked before download. A VM disk image layer is bound by
/// the same limit.
pub const MAX_LAYER_SIZE: usize = 512 * 1024 * 1024;

/// Maximum total extracted rootfs size (4 GiB).
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of layers in an OCI image.
pub const MAX_LAYERS: usize = 128;

/// Maximum config blob size (1 MiB).
///
/// Standard configs are typically under 50 KiB.
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Maximum number of concurrent containers per runtime.
pub const MAX_CONTAINERS: usize = 1024;

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for registry operations (5 minutes).
///
/// **Rationale**: Accommodates large images on slow connections while
/// ensuring eventual failure for stuck operations. Applies to the manifest
/// fetch and to every blob pull separately.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Bound on waiting for a VM to exit during delete.
pub const VM_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval used when a runtime has no exit notification.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Storage Layout
// =============================================================================
//
// All paths are relative to the configured root directory (`~/.fledge` by
// default). Nothing here is garbage-collected automatically.
// =============================================================================

/// Subdirectory for OCI blob storage (content-addressed layers).
///
/// Structure: `blobs/sha256/<2-char-prefix>/<full-hash>`
pub const BLOB_STORE_DIR: &str = "blobs";

/// Subdirectory for per-instance OCI runtime bundles.
///
/// Structure: `bundles/<instance-id>/rootfs/` + `bundles/<instance-id>/config.json`
pub const BUNDLE_DIR: &str = "bundles";

/// Subdirectory for disk images materialized for the VM backend.
///
/// Structure: `images/fledge/<clean-name>/{index.yaml,<name>.<hypervisor>}`
pub const IMAGE_DIR: &str = "images";

/// Namespace directory under [`IMAGE_DIR`].
pub const IMAGE_NAMESPACE: &str = "fledge";

/// Subdirectory for per-instance hypervisor state.
pub const INSTANCE_DIR: &str = "instances";

/// Subdirectory for volume sockets and materialized volume data.
pub const VOLUME_DIR: &str = "volumes";

/// Image index record file name.
pub const INDEX_FILE: &str = "index.yaml";

/// Layer list recorded for pulled container images.
pub const LAYERS_FILE: &str = "layers.json";

/// Per-instance QEMU configuration artifact.
pub const VM_CONFIG_FILE: &str = "osv.config";

/// Per-instance QEMU monitor socket.
pub const VM_MONITOR_FILE: &str = "osv.monitor";

/// Per-instance VNC socket.
pub const VM_SOCKET_FILE: &str = "osv.socket";

/// Per-instance log file, appended by the log-copy task.
pub const VM_LOG_FILE: &str = "osv.logs";

// =============================================================================
// Image Index Record
// =============================================================================

/// Format version written to every image index record.
pub const IMAGE_INDEX_FORMAT_VERSION: &str = "1";

/// Description written to every image index record.
pub const IMAGE_INDEX_DESCRIPTION: &str = "OSv image imported by FLEDGE";

// =============================================================================
// VM Backend Defaults
// =============================================================================

/// Hypervisor binary driven by the VM backend.
pub const DEFAULT_QEMU_BINARY: &str = "qemu-system-x86_64";

/// Only hypervisor the VM backend knows how to drive.
pub const SUPPORTED_HYPERVISOR: &str = "qemu";

/// Default guest memory in MiB.
pub const DEFAULT_VM_MEMORY_MIB: u32 = 1024;

/// Default vCPUs for a guest.
pub const DEFAULT_VCPUS: u32 = 1;

/// Default host bridge for guests without declared ports.
pub const DEFAULT_BRIDGE: &str = "virbr0";

/// Default QEMU asynchronous IO mode.
pub const DEFAULT_AIO_TYPE: &str = "threads";

/// Guest command used when a container declares none.
pub const DEFAULT_VM_COMMAND: [&str; 2] = ["runscript", "/run/default;"];

/// Prefix for VM container identifiers reported in status.
pub const VM_CONTAINER_ID_PREFIX: &str = "capstan://";

// =============================================================================
// virtio-fs
// =============================================================================

/// Default virtio-fs daemon binary.
pub const DEFAULT_VIRTIOFS_DAEMON: &str = "virtiofsd";

/// Default shared guest memory backing virtio-fs devices.
pub const DEFAULT_SHARED_MEMORY: &str = "1G";

/// Virtqueue size of each `vhost-user-fs-pci` device.
pub const VIRTIOFS_QUEUE_SIZE: u32 = 1024;

// =============================================================================
// Container Backend
// =============================================================================

/// Default state root for the OCI runtime.
pub const DEFAULT_CONTAINER_STATE_ROOT: &str = "/var/run/fledge/containers";

/// OCI Runtime Spec version for generated `config.json`.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Annotation carrying the JSON port list of a container.
pub const PORTS_ANNOTATION: &str = "nerdctl/ports";

// =============================================================================
// OCI Media Types
// =============================================================================
//
// Reference: <https://github.com/opencontainers/image-spec/blob/main/media-types.md>
// =============================================================================

/// OCI Image Config media type (image configuration blob).
pub const OCI_IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI Layer media type (gzip-compressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI Layer media type (uncompressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for container IDs handed to the OCI runtime.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`
///
/// **Security**: Excludes `/` and other characters that could be used for
/// path traversal when ids are used in filesystem paths.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum container ID length.
///
/// Three 63-byte RFC 1123 labels plus delimiters fit comfortably.
pub const MAX_CONTAINER_ID_LEN: usize = 256;

/// Validates a container ID for safety.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if id == "." || id == ".." {
        return Err("container ID cannot be a relative path component");
    }
    if !id.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}
