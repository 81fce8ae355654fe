//! Tests for platform detection and the Linux platform operations.
//!
//! The operations are exercised with a platform that lacks the mount
//! capability, so nothing here needs privileges.

use berth::container::{Container, ContainerConfig, HostConfig, MountPoint};
use berth::platform::{Arch, Capability, Os, Platform};
use berth::{Error, LinuxPlatform, PlatformOps};
use std::collections::HashSet;
use std::path::PathBuf;
use tempfile::TempDir;

fn unprivileged() -> LinuxPlatform {
    LinuxPlatform::new(Platform {
        os: Os::Linux,
        arch: Arch::Amd64,
        kernel_version: None,
        capabilities: HashSet::new(),
    })
}

fn container(root: PathBuf) -> Container {
    Container::new(
        "0123456789abcdef0123456789abcdef",
        "web",
        root,
        ContainerConfig {
            cmd: vec!["sh".to_string()],
            ..ContainerConfig::default()
        },
        HostConfig::default(),
        "",
    )
}

// =============================================================================
// Detection
// =============================================================================

#[test]
fn test_platform_detect_returns_valid_os() {
    let platform = Platform::detect();

    #[cfg(target_os = "linux")]
    assert_eq!(platform.os, Os::Linux);

    #[cfg(target_os = "macos")]
    assert_eq!(platform.os, Os::Darwin);
}

#[test]
fn test_platform_detect_returns_valid_arch() {
    let platform = Platform::detect();

    #[cfg(target_arch = "x86_64")]
    assert_eq!(platform.arch, Arch::Amd64);

    #[cfg(target_arch = "aarch64")]
    assert_eq!(platform.arch, Arch::Arm64);
}

#[test]
fn test_oci_platform_string() {
    let platform = Platform {
        os: Os::Linux,
        arch: Arch::Arm64,
        kernel_version: Some("6.1.0".to_string()),
        capabilities: HashSet::new(),
    };
    assert_eq!(platform.oci_platform(), "linux/arm64");
}

#[test]
fn test_platform_display() {
    let platform = Platform {
        os: Os::Linux,
        arch: Arch::Amd64,
        kernel_version: Some("6.1.0".to_string()),
        capabilities: HashSet::from([Capability::Mount, Capability::Cgroups]),
    };
    assert_eq!(
        platform.to_string(),
        "linux/amd64 kernel 6.1.0 (capabilities: Cgroups,Mount)"
    );

    let bare = Platform {
        os: Os::Unknown,
        arch: Arch::Unknown,
        kernel_version: None,
        capabilities: HashSet::new(),
    };
    assert_eq!(bare.to_string(), "unknown/unknown (capabilities: )");
}

#[test]
fn test_container_support_needs_namespaces_and_cgroups() {
    let mut platform = Platform {
        os: Os::Linux,
        arch: Arch::Amd64,
        kernel_version: None,
        capabilities: HashSet::from([Capability::Namespaces]),
    };
    assert!(!platform.supports_containers());
    platform.capabilities.insert(Capability::Cgroups);
    assert!(platform.supports_containers());
    assert!(!platform.can_mount());
}

#[cfg(target_os = "linux")]
#[test]
fn test_linux_has_namespaces() {
    let platform = Platform::detect();
    assert!(platform.capabilities.contains(&Capability::Namespaces));
}

// =============================================================================
// Init Layer and IPC
// =============================================================================

#[test]
fn test_init_layer_layout() {
    let dir = TempDir::new().unwrap();
    let platform = unprivileged();
    platform.setup_init_layer(dir.path()).unwrap();

    for sub in ["dev/pts", "dev/shm", "proc", "sys"] {
        assert!(dir.path().join(sub).is_dir(), "{} missing", sub);
    }
    for file in ["etc/hosts", "etc/hostname", "etc/resolv.conf"] {
        assert!(dir.path().join(file).is_file(), "{} missing", file);
    }

    // Existing files are left alone.
    std::fs::write(dir.path().join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();
    platform.setup_init_layer(dir.path()).unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("etc/hosts")).unwrap(),
        "127.0.0.1 localhost\n"
    );
}

#[tokio::test]
async fn test_ipc_setup_without_mount_capability() {
    let dir = TempDir::new().unwrap();
    let platform = unprivileged();
    let mut c = container(dir.path().to_path_buf());

    platform.setup_ipc_mounts(&mut c).await.unwrap();
    let shm = c.shm_path.clone().unwrap();
    assert_eq!(shm, dir.path().join("shm"));
    assert!(shm.is_dir());
    platform.unmount_ipc_mounts(&c).await.unwrap();
}

#[tokio::test]
async fn test_host_ipc_uses_host_shm() {
    let dir = TempDir::new().unwrap();
    let platform = unprivileged();
    let mut c = container(dir.path().to_path_buf());
    c.host_config.ipc_mode = "host".to_string();

    platform.setup_ipc_mounts(&mut c).await.unwrap();
    assert_eq!(c.shm_path, Some(PathBuf::from("/dev/shm")));
    assert!(!dir.path().join("shm").exists());
    // The host's /dev/shm is never detached.
    platform.unmount_ipc_mounts(&c).await.unwrap();
}

// =============================================================================
// Unmounts and Spec
// =============================================================================

#[tokio::test]
async fn test_unmounts_tolerate_missing_targets() {
    let dir = TempDir::new().unwrap();
    let platform = unprivileged();
    let mut c = container(dir.path().to_path_buf());
    c.mount_points.insert(
        "/data".to_string(),
        MountPoint {
            source: dir.path().join("vol"),
            destination: "/data".to_string(),
            read_write: true,
            volume: Some("vol".to_string()),
            anonymous: false,
        },
    );

    // Nothing mounted yet.
    platform.unmount_volumes(&c).await.unwrap();
    c.base_fs = Some(dir.path().join("rootfs"));
    platform.unmount_volumes(&c).await.unwrap();
    platform.cleanup_mounts_by_id("").await.unwrap();
}

#[test]
fn test_spec_requires_mounted_rootfs() {
    let dir = TempDir::new().unwrap();
    let platform = unprivileged();
    let mut c = container(dir.path().to_path_buf());

    let err = platform.create_spec(&c).unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    c.base_fs = Some(dir.path().join("rootfs"));
    let spec = platform.create_spec(&c).unwrap();
    assert_eq!(spec.root.path, dir.path().join("rootfs").display().to_string());
    assert_eq!(spec.process.args, vec!["sh"]);
}
