//! Declarative mount plans
//!
//! A [`MountPlan`] records what should be visible inside every sandboxed
//! process: an ordered list of bind, tmpfs and proc mounts. Building the
//! plan is pure and happens once at startup; nothing touches the kernel
//! until [`MountPlan::apply`] runs inside a freshly unshared mount
//! namespace. Order is significant, later rules may shadow earlier ones.

use crate::{CorralError, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Kind of a single mount rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// Bind mount, remounted read-only
    BindRo,
    /// Bind mount, writable
    BindRw,
    /// Size-limited tmpfs; `data` is the raw mount data string,
    /// e.g. `size=8m,nr_inodes=4k`
    Tmpfs { data: String },
    /// Fresh procfs for the new pid namespace
    Proc,
}

/// One mount visible inside the sandbox. `target` is relative to the
/// container root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRule {
    pub source: PathBuf,
    pub target: PathBuf,
    pub kind: MountKind,
}

/// Immutable, validated, ordered mount sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    rules: Vec<MountRule>,
}

/// Accumulates mount rules before validation
#[derive(Debug, Default)]
pub struct MountPlanBuilder {
    rules: Vec<MountRule>,
}

impl MountPlanBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a host path into the sandbox read-only
    #[must_use]
    pub fn bind_ro(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.rules.push(MountRule {
            source: source.into(),
            target: target.into(),
            kind: MountKind::BindRo,
        });
        self
    }

    /// Bind a host path into the sandbox read-write
    #[must_use]
    pub fn bind_rw(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.rules.push(MountRule {
            source: source.into(),
            target: target.into(),
            kind: MountKind::BindRw,
        });
        self
    }

    /// Mount a tmpfs at `target` with the given mount data string
    #[must_use]
    pub fn tmpfs(mut self, target: impl Into<PathBuf>, data: impl Into<String>) -> Self {
        self.rules.push(MountRule {
            source: PathBuf::from("tmpfs"),
            target: target.into(),
            kind: MountKind::Tmpfs { data: data.into() },
        });
        self
    }

    /// Mount a fresh procfs at `proc`
    #[must_use]
    pub fn proc(mut self) -> Self {
        self.rules.push(MountRule {
            source: PathBuf::from("proc"),
            target: PathBuf::from("proc"),
            kind: MountKind::Proc,
        });
        self
    }

    /// Validate and freeze the plan.
    ///
    /// Bind sources must exist on the host; a missing one is a
    /// configuration error naming the offending path. No mounts are
    /// performed here.
    pub fn build(self) -> Result<MountPlan> {
        for rule in &self.rules {
            match rule.kind {
                MountKind::BindRo | MountKind::BindRw => {
                    if !rule.source.exists() {
                        return Err(CorralError::Config(format!(
                            "bind mount source does not exist: {}",
                            rule.source.display()
                        )));
                    }
                }
                MountKind::Tmpfs { .. } | MountKind::Proc => {}
            }
        }
        Ok(MountPlan { rules: self.rules })
    }
}

impl MountPlan {
    /// The stock plan for a general-purpose execution sandbox: toolchains
    /// and libraries read-only, /dev/null writable, a fresh proc, and
    /// tmpfs work and tmp directories.
    pub fn defaults(tmpfs_data: &str) -> Result<Self> {
        let mut b = MountPlanBuilder::new()
            .bind_ro("/bin", "bin")
            .bind_ro("/lib", "lib")
            .bind_ro("/usr", "usr")
            .proc();

        // Host-dependent paths: multilib, managed toolchain symlinks, the
        // fpc and ghc support files some compilers insist on.
        for (source, target) in [
            ("/lib64", "lib64"),
            ("/etc/alternatives", "etc/alternatives"),
            ("/etc/fpc.cfg", "etc/fpc.cfg"),
            ("/var/lib/ghc", "var/lib/ghc"),
        ] {
            if Path::new(source).exists() {
                b = b.bind_ro(source, target);
            }
        }

        b.bind_rw("/dev/null", "dev/null")
            .tmpfs("w", tmpfs_data)
            .tmpfs("tmp", tmpfs_data)
            .build()
    }

    /// Rules in declaration order
    #[must_use]
    pub fn rules(&self) -> &[MountRule] {
        &self.rules
    }

    /// Perform every mount relative to `root`.
    ///
    /// Must run inside an unshared mount namespace; this is the
    /// per-instantiation side of the template and the only place the plan
    /// touches the kernel.
    pub fn apply(&self, root: &Path) -> Result<()> {
        for rule in &self.rules {
            let target = root.join(&rule.target);
            match &rule.kind {
                MountKind::BindRo => {
                    prepare_target(&rule.source, &target)?;
                    mount_bind(&rule.source, &target)?;
                    mount_remount_ro(&target)?;
                }
                MountKind::BindRw => {
                    prepare_target(&rule.source, &target)?;
                    mount_bind(&rule.source, &target)?;
                }
                MountKind::Tmpfs { data } => {
                    std::fs::create_dir_all(&target).map_err(|e| {
                        CorralError::Mount(format!("failed to create tmpfs mount point: {e}"))
                    })?;
                    mount_tmpfs(&target, data)?;
                }
                MountKind::Proc => {
                    std::fs::create_dir_all(&target).map_err(|e| {
                        CorralError::Mount(format!("failed to create proc mount point: {e}"))
                    })?;
                    mount_proc(&target)?;
                }
            }
        }
        Ok(())
    }
}

// Helper functions for mount operations

fn prepare_target(source: &Path, target: &Path) -> Result<()> {
    // Bind mounting a file needs an existing file at the target.
    if source.is_dir() {
        std::fs::create_dir_all(target)
            .map_err(|e| CorralError::Mount(format!("failed to create mount point: {e}")))?;
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CorralError::Mount(format!("failed to create mount point: {e}")))?;
        }
        if !target.exists() {
            std::fs::File::create(target)
                .map_err(|e| CorralError::Mount(format!("failed to create mount point: {e}")))?;
        }
    }
    Ok(())
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| CorralError::Mount(format!("invalid path {}: {}", path.display(), e)))
}

fn mount_bind(src: &Path, dst: &Path) -> Result<()> {
    let src_c = path_to_cstring(src)?;
    let dst_c = path_to_cstring(dst)?;

    // SAFETY: mount syscall with bind flag
    let ret = unsafe {
        libc::mount(
            src_c.as_ptr(),
            dst_c.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        )
    };

    if ret != 0 {
        return Err(CorralError::Mount(format!(
            "failed to bind mount {} to {}: {}",
            src.display(),
            dst.display(),
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

fn mount_remount_ro(path: &Path) -> Result<()> {
    let path_c = path_to_cstring(path)?;

    // SAFETY: mount syscall to remount read-only
    let ret = unsafe {
        libc::mount(
            std::ptr::null(),
            path_c.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
            std::ptr::null(),
        )
    };

    if ret != 0 {
        return Err(CorralError::Mount(format!(
            "failed to remount {} read-only: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

fn mount_tmpfs(path: &Path, data: &str) -> Result<()> {
    let path_c = path_to_cstring(path)?;
    let fstype =
        CString::new("tmpfs").map_err(|e| CorralError::Mount(format!("invalid fstype: {e}")))?;
    let data_c =
        CString::new(data).map_err(|e| CorralError::Mount(format!("invalid mount data: {e}")))?;

    // SAFETY: mount syscall with tmpfs
    let ret = unsafe {
        libc::mount(
            fstype.as_ptr(),
            path_c.as_ptr(),
            fstype.as_ptr(),
            libc::MS_NOSUID,
            data_c.as_ptr().cast::<libc::c_void>(),
        )
    };

    if ret != 0 {
        return Err(CorralError::Mount(format!(
            "failed to mount tmpfs at {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

fn mount_proc(path: &Path) -> Result<()> {
    let path_c = path_to_cstring(path)?;
    let fstype =
        CString::new("proc").map_err(|e| CorralError::Mount(format!("invalid fstype: {e}")))?;

    // SAFETY: mount syscall with procfs
    let ret = unsafe {
        libc::mount(
            fstype.as_ptr(),
            path_c.as_ptr(),
            fstype.as_ptr(),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            std::ptr::null(),
        )
    };

    if ret != 0 {
        return Err(CorralError::Mount(format!(
            "failed to mount proc at {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> Result<MountPlan> {
        MountPlanBuilder::new()
            .bind_ro("/bin", "bin")
            .bind_ro("/usr", "usr")
            .proc()
            .tmpfs("w", "size=8m,nr_inodes=4k")
            .build()
    }

    #[test]
    fn build_preserves_declaration_order() {
        let plan = sample_plan().unwrap();
        let targets: Vec<_> = plan
            .rules()
            .iter()
            .map(|r| r.target.to_str().unwrap())
            .collect();
        assert_eq!(targets, ["bin", "usr", "proc", "w"]);
    }

    #[test]
    fn repeated_builds_are_identical() {
        assert_eq!(sample_plan().unwrap(), sample_plan().unwrap());
    }

    #[test]
    fn missing_bind_source_names_the_path() {
        let err = MountPlanBuilder::new()
            .bind_ro("/nonexistent-corral-source", "x")
            .build()
            .unwrap_err();
        match err {
            CorralError::Config(msg) => assert!(msg.contains("/nonexistent-corral-source")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn default_plan_binds_only_paths_the_host_has() {
        let plan = MountPlan::defaults("size=8m,nr_inodes=4k").unwrap();

        // Every bind source passed the existence probe.
        for rule in plan.rules() {
            if matches!(rule.kind, MountKind::BindRo | MountKind::BindRw) {
                assert!(rule.source.exists(), "probed source {:?} missing", rule.source);
            }
        }

        // Toolchain support files are bound whenever the host has them.
        for optional in ["/etc/fpc.cfg", "/var/lib/ghc", "/lib64", "/etc/alternatives"] {
            let bound = plan
                .rules()
                .iter()
                .any(|r| r.source == Path::new(optional));
            assert_eq!(bound, Path::new(optional).exists());
        }

        // Work and tmp tmpfs carry the configured data string.
        let tmpfs: Vec<_> = plan
            .rules()
            .iter()
            .filter(|r| matches!(&r.kind, MountKind::Tmpfs { data } if data == "size=8m,nr_inodes=4k"))
            .map(|r| r.target.to_str().unwrap())
            .collect();
        assert_eq!(tmpfs, ["w", "tmp"]);
    }

    #[test]
    fn tmpfs_and_proc_need_no_host_source() {
        let plan = MountPlanBuilder::new()
            .tmpfs("tmp", "size=1m")
            .proc()
            .build()
            .unwrap();
        assert_eq!(plan.rules().len(), 2);
    }
}
