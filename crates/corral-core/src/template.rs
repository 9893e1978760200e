//! Container template and pooled environments
//!
//! A [`ContainerTemplate`] is the reusable blueprint for spawning isolated
//! processes: root directory, mount plan, namespace-unshare flags and the
//! credential allocator. It is built once at startup and shared read-only
//! by every pooled [`Environment`]. The template itself performs no
//! isolation; the execution collaborator consumes it per run.

use crate::credentials::{Credential, CredentialAllocator};
use crate::mount::MountPlan;
use crate::{CorralError, Result};
use nix::sched::CloneFlags;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read-only blueprint for sandbox environments
#[derive(Debug)]
pub struct ContainerTemplate {
    root: PathBuf,
    mounts: MountPlan,
    clone_flags: CloneFlags,
    credentials: Arc<CredentialAllocator>,
    capture_stderr: bool,
}

/// Builder for [`ContainerTemplate`]
#[derive(Debug)]
pub struct ContainerTemplateBuilder {
    root: PathBuf,
    mounts: MountPlan,
    share_net: bool,
    capture_stderr: bool,
    credentials: Arc<CredentialAllocator>,
}

impl ContainerTemplateBuilder {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, mounts: MountPlan) -> Self {
        Self {
            root: root.into(),
            mounts,
            share_net: false,
            capture_stderr: true,
            credentials: Arc::new(CredentialAllocator::new()),
        }
    }

    /// Keep the host network namespace instead of unsharing it
    #[must_use]
    pub fn share_net(mut self, share: bool) -> Self {
        self.share_net = share;
        self
    }

    #[must_use]
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    /// Use a caller-provided allocator (shared with other templates)
    #[must_use]
    pub fn credentials(mut self, allocator: Arc<CredentialAllocator>) -> Self {
        self.credentials = allocator;
        self
    }

    /// Prepare the root directory and freeze the template
    pub fn build(self) -> Result<ContainerTemplate> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            CorralError::Config(format!(
                "failed to prepare container root {}: {e}",
                self.root.display()
            ))
        })?;

        let mut clone_flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC;
        if !self.share_net {
            clone_flags |= CloneFlags::CLONE_NEWNET;
        }

        Ok(ContainerTemplate {
            root: self.root,
            mounts: self.mounts,
            clone_flags,
            credentials: self.credentials,
            capture_stderr: self.capture_stderr,
        })
    }
}

impl ContainerTemplate {
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn mounts(&self) -> &MountPlan {
        &self.mounts
    }

    #[must_use]
    pub const fn clone_flags(&self) -> CloneFlags {
        self.clone_flags
    }

    #[must_use]
    pub const fn capture_stderr(&self) -> bool {
        self.capture_stderr
    }

    /// Materialize a fresh environment: its own work directory under the
    /// root and a never-before-used credential.
    pub fn instantiate(&self, id: u32) -> Result<Environment> {
        let workdir = self.root.join(format!("env-{id}"));
        std::fs::create_dir_all(&workdir)?;
        let credential = self.credentials.next()?;

        tracing::debug!(id, uid = credential.uid, "instantiated environment");

        Ok(Environment {
            id,
            workdir,
            credential,
            clone_flags: self.clone_flags,
            capture_stderr: self.capture_stderr,
        })
    }
}

/// One live, isolated execution context.
///
/// Owned exclusively by at most one worker at a time; used for exactly one
/// execution between resets.
#[derive(Debug)]
pub struct Environment {
    id: u32,
    workdir: PathBuf,
    credential: Credential,
    clone_flags: CloneFlags,
    capture_stderr: bool,
}

impl Environment {
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// The per-environment work directory, wiped between executions
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    #[must_use]
    pub const fn credential(&self) -> Credential {
        self.credential
    }

    #[must_use]
    pub const fn clone_flags(&self) -> CloneFlags {
        self.clone_flags
    }

    #[must_use]
    pub const fn capture_stderr(&self) -> bool {
        self.capture_stderr
    }

    /// Return the environment to a pristine state.
    ///
    /// Wipes the work directory and verifies nothing still runs under this
    /// environment's uid. Stragglers are killed, but their presence means
    /// the reset cannot be trusted: the error tells the pool to destroy
    /// this instance instead of reusing it.
    pub fn reset(&mut self) -> Result<()> {
        clear_dir(&self.workdir)?;

        let strays = processes_owned_by(self.credential.uid);
        if !strays.is_empty() {
            for pid in &strays {
                let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
            }
            return Err(CorralError::Execution(format!(
                "environment {} left {} process(es) running under uid {}",
                self.id,
                strays.len(),
                self.credential.uid
            )));
        }

        Ok(())
    }

    /// Tear the environment down for good
    pub fn destroy(self) {
        if let Err(e) = std::fs::remove_dir_all(&self.workdir) {
            tracing::warn!(id = self.id, error = %e, "failed to remove environment workdir");
        }
    }
}

/// Remove everything inside `dir` without removing `dir` itself
fn clear_dir(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Pids of host-visible processes whose real uid matches
fn processes_owned_by(uid: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(status) = std::fs::read_to_string(entry.path().join("status")) else {
            continue;
        };
        let owned = status.lines().any(|line| {
            line.strip_prefix("Uid:")
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|real| real == uid.to_string())
        });
        if owned {
            pids.push(pid);
        }
    }
    pids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountPlanBuilder;

    fn template_in(dir: &Path) -> ContainerTemplate {
        let mounts = MountPlanBuilder::new()
            .tmpfs("w", "size=1m")
            .proc()
            .build()
            .unwrap();
        ContainerTemplateBuilder::new(dir.join("root"), mounts)
            .build()
            .unwrap()
    }

    #[test]
    fn build_prepares_the_root_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = template_in(dir.path());
        assert!(tpl.root().is_dir());
    }

    #[test]
    fn default_flags_unshare_network() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = template_in(dir.path());
        assert!(tpl.clone_flags().contains(CloneFlags::CLONE_NEWNET));
        assert!(tpl.clone_flags().contains(CloneFlags::CLONE_NEWPID));
    }

    #[test]
    fn share_net_drops_only_the_network_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = MountPlanBuilder::new().proc().build().unwrap();
        let tpl = ContainerTemplateBuilder::new(dir.path().join("root"), mounts)
            .share_net(true)
            .build()
            .unwrap();
        assert!(!tpl.clone_flags().contains(CloneFlags::CLONE_NEWNET));
        assert!(tpl.clone_flags().contains(CloneFlags::CLONE_NEWNS));
    }

    #[test]
    fn instantiations_get_distinct_workdirs_and_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = template_in(dir.path());

        let a = tpl.instantiate(0).unwrap();
        let b = tpl.instantiate(1).unwrap();

        assert_ne!(a.workdir(), b.workdir());
        assert_ne!(a.credential().uid, b.credential().uid);
        assert!(a.workdir().is_dir());
    }

    #[test]
    fn reset_wipes_the_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = template_in(dir.path());
        let mut env = tpl.instantiate(0).unwrap();

        std::fs::write(env.workdir().join("a.out"), b"junk").unwrap();
        std::fs::create_dir(env.workdir().join("scratch")).unwrap();

        env.reset().unwrap();
        assert_eq!(std::fs::read_dir(env.workdir()).unwrap().count(), 0);
    }
}
