//! OCI runtime bundles.
//!
//! Builds the `config.json` the execution backend consumes from a
//! [`Container`] record, and lays out bundle directories:
//!
//! ```text
//! <exec_root>/<id>/
//! ├── config.json
//! ├── init-stdin
//! ├── init-stdout
//! └── init-stderr
//! ```
//!
//! The root filesystem is not copied into the bundle; `root.path` points at
//! the container's mounted writable layer.

use crate::constants::{BUNDLE_CONFIG_FILE, DEFAULT_PATH_ENV, OCI_RUNTIME_SPEC_VERSION};
use crate::container::{Container, MountPoint};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Spec Builder
// =============================================================================

/// Builds an [`OciSpec`] for a container.
#[derive(Debug, Clone)]
pub struct SpecBuilder<'a> {
    container: &'a Container,
    rootfs: PathBuf,
    /// Namespace path of the network peer for `container:<name>` mode.
    network_ns: Option<String>,
}

impl<'a> SpecBuilder<'a> {
    /// Starts a spec for `container` rooted at `rootfs`.
    pub fn new(container: &'a Container, rootfs: impl Into<PathBuf>) -> Self {
        Self {
            container,
            rootfs: rootfs.into(),
            network_ns: container.network_settings.sandbox_key.clone(),
        }
    }

    /// Builds the spec.
    pub fn build(&self) -> Result<OciSpec> {
        let c = self.container;
        if c.path.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "container '{}' has no command",
                c.id
            )));
        }

        let mut env = c.config.env.clone();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.push(DEFAULT_PATH_ENV.to_string());
        }
        if !c.config.hostname.is_empty() {
            env.push(format!("HOSTNAME={}", c.config.hostname));
        }

        let mut args = Vec::with_capacity(c.args.len() + 1);
        args.push(c.path.clone());
        args.extend(c.args.iter().cloned());

        let (uid, gid) = parse_user(&c.config.user)?;

        let mut mounts = default_mounts();
        if let Some(shm) = &c.shm_path {
            mounts.retain(|m| m.destination != "/dev/shm");
            mounts.push(OciMount {
                destination: "/dev/shm".to_string(),
                mount_type: "bind".to_string(),
                source: shm.display().to_string(),
                options: vec!["rbind".to_string(), "rprivate".to_string()],
            });
        }
        for mp in c.mount_points.values() {
            mounts.retain(|m| m.destination != mp.destination);
            mounts.push(bind_mount(mp));
        }

        let spec = OciSpec {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: OciRoot {
                path: self.rootfs.display().to_string(),
                readonly: c.host_config.readonly_rootfs,
            },
            process: OciProcess {
                terminal: c.config.tty,
                user: OciUser { uid, gid },
                args,
                env,
                cwd: if c.config.working_dir.is_empty() {
                    "/".to_string()
                } else {
                    c.config.working_dir.clone()
                },
                selinux_label: non_empty(&c.process_label),
            },
            hostname: if c.config.hostname.is_empty() {
                c.short_id().to_string()
            } else {
                c.config.hostname.clone()
            },
            mounts,
            linux: Some(OciLinux {
                namespaces: self.namespaces(),
                resources: self.resources(),
                mount_label: non_empty(&c.mount_label),
            }),
            annotations: c.config.labels.clone(),
        };
        debug!(container = %c.id, mounts = spec.mounts.len(), "built runtime spec");
        Ok(spec)
    }

    fn namespaces(&self) -> Vec<OciNamespace> {
        let hc = &self.container.host_config;
        let mut namespaces = vec![
            OciNamespace::new("mount"),
            OciNamespace::new("uts"),
        ];
        if hc.pid_mode != "host" {
            namespaces.push(OciNamespace::new("pid"));
        }
        if hc.ipc_mode != "host" {
            namespaces.push(OciNamespace::new("ipc"));
        }
        // Peers and attached networks both join an existing namespace by path.
        if hc.network_mode != "host" {
            namespaces.push(OciNamespace {
                ns_type: "network".to_string(),
                path: self.network_ns.clone(),
            });
        }
        namespaces
    }

    fn resources(&self) -> Option<OciResources> {
        let hc = &self.container.host_config;
        if hc.memory == 0 && hc.cpu_shares == 0 && hc.pids_limit == 0 {
            return None;
        }
        Some(OciResources {
            memory: (hc.memory > 0).then_some(OciMemory {
                limit: Some(hc.memory),
            }),
            cpu: (hc.cpu_shares > 0).then_some(OciCpu {
                shares: Some(hc.cpu_shares as u64),
                quota: None,
                period: None,
            }),
            pids: (hc.pids_limit > 0).then_some(OciPids {
                limit: hc.pids_limit,
            }),
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Parses `uid[:gid]`. Names are not resolved; the empty string is root.
fn parse_user(user: &str) -> Result<(u32, u32)> {
    if user.is_empty() {
        return Ok((0, 0));
    }
    let (uid, gid) = user.split_once(':').unwrap_or((user, user));
    let parse = |s: &str| {
        s.parse::<u32>().map_err(|_| {
            Error::InvalidConfig(format!(
                "user '{}' must be numeric uid[:gid]",
                user
            ))
        })
    };
    Ok((parse(uid)?, parse(gid)?))
}

fn bind_mount(mp: &MountPoint) -> OciMount {
    let mut options = vec!["rbind".to_string()];
    options.push(if mp.read_write { "rw" } else { "ro" }.to_string());
    OciMount {
        destination: mp.destination.clone(),
        mount_type: "bind".to_string(),
        source: mp.source.display().to_string(),
        options,
    }
}

/// Returns default OCI mounts.
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
            options: opts(&["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"]),
        },
        OciMount {
            destination: "/dev/shm".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "shm".to_string(),
            options: opts(&["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
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
// Bundle Directory
// =============================================================================

/// Writes `config.json` into `dir`, creating the directory with mode 0700.
pub fn write_bundle(dir: &Path, spec: &OciSpec) -> Result<PathBuf> {
    create_private_dir(dir)?;
    let json = serde_json::to_vec_pretty(spec).map_err(|e| Error::Serialization(e.to_string()))?;
    let path = dir.join(BUNDLE_CONFIG_FILE);
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Reads `config.json` back from a bundle directory.
pub fn read_bundle(dir: &Path) -> Result<OciSpec> {
    let content = fs::read(dir.join(BUNDLE_CONFIG_FILE))?;
    serde_json::from_slice(&content).map_err(|e| Error::Serialization(e.to_string()))
}

/// Creates `dir` (and parents) with mode 0700 on the leaf.
pub fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    Ok(())
}

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI Runtime Spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub root: OciRoot,
    pub process: OciProcess,
    pub hostname: String,
    pub mounts: Vec<OciMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub annotations: std::collections::BTreeMap<String, String>,
}

/// OCI root filesystem config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    pub readonly: bool,
}

/// OCI process config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selinux_label: Option<String>,
}

/// OCI user config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
}

/// OCI mount config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// OCI Linux-specific config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLinux {
    pub namespaces: Vec<OciNamespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<OciResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_label: Option<String>,
}

/// OCI namespace config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl OciNamespace {
    fn new(ns_type: &str) -> Self {
        Self {
            ns_type: ns_type.to_string(),
            path: None,
        }
    }
}

/// OCI resource limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<OciMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<OciCpu>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<OciPids>,
}

/// OCI memory limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMemory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

/// OCI CPU limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciCpu {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

/// OCI PID limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciPids {
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user() {
        assert_eq!(parse_user("").unwrap(), (0, 0));
        assert_eq!(parse_user("1000").unwrap(), (1000, 1000));
        assert_eq!(parse_user("1000:50").unwrap(), (1000, 50));
        assert!(parse_user("nobody").is_err());
    }
}
