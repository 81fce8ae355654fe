//! Platform detection and platform-specific container operations.
//!
//! [`Platform::detect`] enumerates host capabilities once at startup.
//! [`PlatformOps`] collects the operations whose behavior differs per host
//! (IPC mounts, rootfs mounting, forced unmounts, spec building); the daemon
//! receives one implementation at construction and never branches on the
//! OS itself.

use crate::bundle::{OciSpec, SpecBuilder};
use crate::constants::{DEFAULT_SHM_SIZE, SHM_DIR};
use crate::container::Container;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// =============================================================================
// Detection
// =============================================================================

/// Detected platform information.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Kernel version (if detectable).
    pub kernel_version: Option<String>,
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

/// Host capabilities that affect container setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Linux namespaces (pid, net, mnt, etc.)
    Namespaces,
    /// Linux control groups (v1 or v2)
    Cgroups,
    /// Seccomp syscall filtering
    Seccomp,
    /// SELinux labeling is enforced.
    SeLinux,
    /// Mount syscalls are permitted (effective uid 0).
    Mount,
}

impl Platform {
    /// Detects the current platform and its capabilities.
    pub fn detect() -> Self {
        let os = Self::detect_os();
        Self {
            os,
            arch: Self::detect_arch(),
            kernel_version: Self::detect_kernel_version(),
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

    /// Reads the kernel release from `/proc`, falling back to `uname -r`.
    fn detect_kernel_version() -> Option<String> {
        if let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
            return Some(release.trim().to_string());
        }
        std::process::Command::new("uname")
            .arg("-r")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
    }

    fn detect_capabilities(os: Os) -> HashSet<Capability> {
        let mut caps = HashSet::new();
        if os != Os::Linux {
            return caps;
        }
        if Path::new("/proc/self/ns/pid").exists() {
            caps.insert(Capability::Namespaces);
        }
        if Path::new("/sys/fs/cgroup").exists() {
            caps.insert(Capability::Cgroups);
        }
        if Path::new("/proc/self/seccomp").exists() || Path::new("/proc/sys/kernel/seccomp").exists()
        {
            caps.insert(Capability::Seccomp);
        }
        if std::fs::read_to_string("/sys/fs/selinux/enforce").is_ok_and(|s| s.trim() == "1") {
            caps.insert(Capability::SeLinux);
        }
        // SAFETY: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } == 0 {
            caps.insert(Capability::Mount);
        }
        caps
    }

    /// Returns true if the host can run namespaced containers.
    pub fn supports_containers(&self) -> bool {
        self.capabilities.contains(&Capability::Namespaces)
            && self.capabilities.contains(&Capability::Cgroups)
    }

    /// Returns true if mount syscalls are available.
    pub fn can_mount(&self) -> bool {
        self.capabilities.contains(&Capability::Mount)
    }

    /// Returns the OCI platform string (e.g., "linux/amd64").
    pub fn oci_platform(&self) -> String {
        let os = match self.os {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Unknown => "unknown",
        };
        let arch = match self.arch {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Unknown => "unknown",
        };
        format!("{}/{}", os, arch)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.oci_platform())?;
        if let Some(kernel) = &self.kernel_version {
            write!(f, " kernel {}", kernel)?;
        }
        let mut caps: Vec<String> = self.capabilities.iter().map(|c| format!("{:?}", c)).collect();
        caps.sort();
        write!(f, " (capabilities: {})", caps.join(","))
    }
}

// =============================================================================
// Platform Operations
// =============================================================================

/// Host-specific steps of the container lifecycle.
#[async_trait]
pub trait PlatformOps: Send + Sync {
    /// Whether the writable layer is mounted on start and unmounted on
    /// cleanup.
    fn mounts_rootfs(&self) -> bool {
        true
    }

    /// Prepares the init layer of a new writable layer.
    fn setup_init_layer(&self, init_root: &Path) -> Result<()>;

    /// Sets up `/dev/shm` and records its source on the container.
    async fn setup_ipc_mounts(&self, container: &mut Container) -> Result<()>;

    /// Tears down what [`setup_ipc_mounts`](Self::setup_ipc_mounts) created.
    async fn unmount_ipc_mounts(&self, container: &Container) -> Result<()>;

    /// Forcibly detaches every mount belonging to `mount_id`.
    async fn cleanup_mounts_by_id(&self, mount_id: &str) -> Result<()>;

    /// Detaches volume mounts under the container's rootfs.
    async fn unmount_volumes(&self, container: &Container) -> Result<()>;

    /// Builds the runtime spec for a mounted container.
    fn create_spec(&self, container: &Container) -> Result<OciSpec>;
}

/// Files and directories every init layer carries so the runtime can bind
/// over them.
const INIT_LAYER_DIRS: &[&str] = &["dev/pts", "dev/shm", "proc", "sys", "etc"];
const INIT_LAYER_FILES: &[&str] = &["etc/hosts", "etc/hostname", "etc/resolv.conf"];

/// Linux implementation of [`PlatformOps`].
#[derive(Debug, Clone)]
pub struct LinuxPlatform {
    platform: Platform,
}

impl LinuxPlatform {
    /// Creates the implementation for a detected platform.
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    /// Returns the detected platform.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }
}

#[async_trait]
impl PlatformOps for LinuxPlatform {
    fn setup_init_layer(&self, init_root: &Path) -> Result<()> {
        for dir in INIT_LAYER_DIRS {
            std::fs::create_dir_all(init_root.join(dir))?;
        }
        for file in INIT_LAYER_FILES {
            let path = init_root.join(file);
            if !path.exists() {
                std::fs::File::create(&path)?;
            }
        }
        Ok(())
    }

    async fn setup_ipc_mounts(&self, container: &mut Container) -> Result<()> {
        if container.host_config.ipc_mode == "host" {
            container.shm_path = Some(PathBuf::from("/dev/shm"));
            return Ok(());
        }
        let shm = container.root.join(SHM_DIR);
        std::fs::create_dir_all(&shm)?;
        if self.platform.can_mount() && !is_mountpoint(&shm) {
            let mut options = format!("mode=1777,size={}", DEFAULT_SHM_SIZE);
            if !container.mount_label.is_empty() {
                options.push_str(&format!(",context=\"{}\"", container.mount_label));
            }
            mount_tmpfs(&shm, &options)?;
            debug!(container = %container.id, path = %shm.display(), "mounted shm");
        }
        container.shm_path = Some(shm);
        Ok(())
    }

    async fn unmount_ipc_mounts(&self, container: &Container) -> Result<()> {
        match &container.shm_path {
            Some(shm) if shm.starts_with(&container.root) => detach(shm),
            _ => Ok(()),
        }
    }

    async fn cleanup_mounts_by_id(&self, mount_id: &str) -> Result<()> {
        if mount_id.is_empty() {
            return Ok(());
        }
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        let mut targets: Vec<&str> = mountinfo
            .lines()
            .filter_map(|line| line.split_whitespace().nth(4))
            .filter(|mp| mp.contains(mount_id))
            .collect();
        // Deepest first so parents are not busy.
        targets.sort_by_key(|t| std::cmp::Reverse(t.len()));
        for target in targets {
            if let Err(e) = detach(Path::new(target)) {
                warn!(mount_id, path = target, error = %e, "forced unmount failed");
            }
        }
        Ok(())
    }

    async fn unmount_volumes(&self, container: &Container) -> Result<()> {
        let Some(base) = &container.base_fs else {
            return Ok(());
        };
        let mut first_err = None;
        for mp in container.mount_points.values() {
            let target = base.join(mp.destination.trim_start_matches('/'));
            if let Err(e) = detach(&target) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn create_spec(&self, container: &Container) -> Result<OciSpec> {
        let rootfs = container.base_fs.clone().ok_or_else(|| {
            Error::InvalidState {
                id: container.id.clone(),
                state: "unmounted".to_string(),
                expected: "mounted".to_string(),
            }
        })?;
        SpecBuilder::new(container, rootfs).build()
    }
}

#[cfg(target_os = "linux")]
fn cstring(path: &Path) -> Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Internal(format!("path contains NUL: {}", path.display())))
}

#[cfg(target_os = "linux")]
fn mount_tmpfs(target: &Path, options: &str) -> Result<()> {
    let target_c = cstring(target)?;
    let fstype = c"tmpfs";
    let data = std::ffi::CString::new(options)
        .map_err(|_| Error::Internal("mount options contain NUL".to_string()))?;
    // SAFETY: all pointers come from live CStrings.
    let rc = unsafe {
        libc::mount(
            c"shm".as_ptr(),
            target_c.as_ptr(),
            fstype.as_ptr(),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            data.as_ptr().cast(),
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn mount_tmpfs(_target: &Path, _options: &str) -> Result<()> {
    Err(Error::NotSupported("tmpfs mounts require Linux".to_string()))
}

/// Lazily unmounts `target`. Not mounted and missing are both success.
#[cfg(target_os = "linux")]
fn detach(target: &Path) -> Result<()> {
    let target_c = cstring(target)?;
    // SAFETY: target_c is a valid NUL-terminated path.
    let rc = unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINVAL) | Some(libc::ENOENT) => Ok(()),
        // Unprivileged callers cannot have mounted anything.
        Some(libc::EPERM) => Ok(()),
        _ => Err(err.into()),
    }
}

#[cfg(not(target_os = "linux"))]
fn detach(_target: &Path) -> Result<()> {
    Ok(())
}

fn is_mountpoint(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    let (Ok(meta), Some(parent)) = (std::fs::metadata(path), path.parent()) else {
        return false;
    };
    std::fs::metadata(parent).is_ok_and(|p| p.dev() != meta.dev())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        let platform = Platform::detect();
        assert!(platform.os != Os::Unknown || platform.arch != Arch::Unknown);
    }

    #[test]
    fn test_oci_platform_string() {
        let platform = Platform::detect();
        assert!(platform.oci_platform().contains('/'));
    }
}
