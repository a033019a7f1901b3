//! Host platform detection.
//!
//! Supplies the OS/arch pair used to pick a manifest out of a multi-arch
//! image index, and the capabilities that decide whether the container
//! runtime can run and whether QEMU may use KVM.

use std::collections::HashSet;
use std::path::Path;

/// Detected platform information.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Available capabilities.
    pub capabilities: HashSet<Capability>,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Unknown,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Unknown,
}

/// Host capabilities that affect backend availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Linux namespaces (pid, net, mnt, etc.)
    Namespaces,
    /// Linux control groups (v1 or v2)
    Cgroups,
    /// KVM acceleration for QEMU
    Kvm,
}

impl Platform {
    /// Detects the current platform and its capabilities.
    pub fn detect() -> Self {
        let os = Self::detect_os();
        Self {
            os,
            arch: Self::detect_arch(),
            capabilities: Self::detect_capabilities(os),
        }
    }

    fn detect_os() -> Os {
        #[cfg(target_os = "linux")]
        return Os::Linux;

        #[cfg(target_os = "macos")]
        return Os::Darwin;

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        return Os::Unknown;
    }

    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
        return Arch::Unknown;
    }

    fn detect_capabilities(os: Os) -> HashSet<Capability> {
        let mut caps = HashSet::new();

        if os == Os::Linux {
            if Path::new("/proc/self/ns/pid").exists() {
                caps.insert(Capability::Namespaces);
            }
            if Path::new("/sys/fs/cgroup").exists() {
                caps.insert(Capability::Cgroups);
            }
            if Self::check_kvm() {
                caps.insert(Capability::Kvm);
            }
        }

        caps
    }

    /// Checks if `/dev/kvm` exists and is accessible.
    #[cfg(target_os = "linux")]
    fn check_kvm() -> bool {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let kvm_path = Path::new("/dev/kvm");
        if !kvm_path.exists() {
            return false;
        }

        let Ok(c_path) = CString::new(kvm_path.as_os_str().as_bytes()) else {
            return false;
        };
        // SAFETY: access(2) only reads the NUL-terminated path.
        unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
    }

    #[cfg(not(target_os = "linux"))]
    fn check_kvm() -> bool {
        false
    }

    /// Returns true if native Linux containers are supported.
    pub fn supports_native_containers(&self) -> bool {
        self.capabilities.contains(&Capability::Namespaces)
            && self.capabilities.contains(&Capability::Cgroups)
    }

    /// Returns true if QEMU can use KVM acceleration.
    pub fn has_kvm(&self) -> bool {
        self.capabilities.contains(&Capability::Kvm)
    }

    /// OS name as used in OCI image indexes.
    pub fn oci_os(&self) -> &'static str {
        match self.os {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            // Guests run linux images
            Os::Unknown => "linux",
        }
    }

    /// Architecture name as used in OCI image indexes.
    pub fn oci_arch(&self) -> &'static str {
        match self.arch {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Unknown => "amd64",
        }
    }

    /// Returns the OCI platform string (e.g., "linux/amd64").
    pub fn oci_platform(&self) -> String {
        format!("{}/{}", self.oci_os(), self.oci_arch())
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}/{:?} (capabilities: {:?})",
            self.os, self.arch, self.capabilities
        )
    }
}
