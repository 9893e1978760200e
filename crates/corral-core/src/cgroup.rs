//! Cgroup resource accounting templates and per-execution instances
//!
//! A [`CgroupTemplate`] is built once at startup: the desired controllers
//! are declared, then checked against what the running kernel actually
//! exposes. A declared controller the host lacks is a configuration error,
//! running without resource accounting is judged unsafe enough to refuse
//! to start. Each execution gets its own [`CgroupInstance`], destroyed
//! after use so counters never leak across executions.

use crate::{CorralError, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default mount point of the cgroup v1 hierarchies
pub const CGROUP_BASE: &str = "/sys/fs/cgroup";

/// A resource controller attached per execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    /// CPU time accounting (`cpuacct`)
    CpuAcct,
    /// Memory limiting and peak accounting (`memory`)
    Memory,
    /// Process-count limiting (`pids`)
    Pids,
}

impl Controller {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CpuAcct => "cpuacct",
            Self::Memory => "memory",
            Self::Pids => "pids",
        }
    }
}

/// Immutable recipe for per-execution cgroups under a named hierarchy
#[derive(Debug, Clone)]
pub struct CgroupTemplate {
    name: String,
    controllers: Vec<Controller>,
    base: PathBuf,
}

/// Declares desired controllers before host filtering
#[derive(Debug)]
pub struct CgroupTemplateBuilder {
    name: String,
    controllers: Vec<Controller>,
    base: PathBuf,
}

impl CgroupTemplateBuilder {
    /// Start a template under `<base>/<controller>/<name>/`
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            controllers: Vec::new(),
            base: PathBuf::from(CGROUP_BASE),
        }
    }

    /// Override the hierarchy mount point. Tests point this at a tempdir.
    #[must_use]
    pub fn base(mut self, base: impl Into<PathBuf>) -> Self {
        self.base = base.into();
        self
    }

    #[must_use]
    pub fn cpu_acct(mut self) -> Self {
        self.controllers.push(Controller::CpuAcct);
        self
    }

    #[must_use]
    pub fn memory(mut self) -> Self {
        self.controllers.push(Controller::Memory);
        self
    }

    #[must_use]
    pub fn pids(mut self) -> Self {
        self.controllers.push(Controller::Pids);
        self
    }

    /// Check the declared controllers against an explicit availability set.
    ///
    /// Every declared controller must be present; a missing one fails
    /// deterministically rather than being dropped silently.
    pub fn filter(self, available: &HashSet<String>) -> Result<CgroupTemplate> {
        for ctrl in &self.controllers {
            if !available.contains(ctrl.as_str()) {
                return Err(CorralError::Config(format!(
                    "cgroup controller '{}' not available on this host (available: {:?})",
                    ctrl.as_str(),
                    available
                )));
            }
        }
        if self.controllers.is_empty() {
            return Err(CorralError::Config(
                "no cgroup controllers declared".into(),
            ));
        }
        Ok(CgroupTemplate {
            name: self.name,
            controllers: self.controllers,
            base: self.base,
        })
    }

    /// Check the declared controllers against the running kernel
    pub fn filter_host(self) -> Result<CgroupTemplate> {
        let available = host_controllers()?;
        self.filter(&available)
    }
}

impl CgroupTemplate {
    #[must_use]
    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    /// Create the per-execution cgroup directories for instance `id`
    pub fn instantiate(&self, id: u32) -> Result<CgroupInstance> {
        let mut dirs = Vec::with_capacity(self.controllers.len());
        for ctrl in &self.controllers {
            let dir = self
                .base
                .join(ctrl.as_str())
                .join(&self.name)
                .join(id.to_string());
            std::fs::create_dir_all(&dir).map_err(|e| {
                CorralError::Cgroup(format!("failed to create {}: {e}", dir.display()))
            })?;
            dirs.push((*ctrl, dir));
        }
        tracing::debug!(id, name = %self.name, "created cgroup instance");
        Ok(CgroupInstance { id, dirs })
    }
}

/// One execution's cgroup directories, one per controller.
///
/// Owned exclusively by a single in-flight execution; destroyed on release
/// so resource counters do not carry over.
#[derive(Debug)]
pub struct CgroupInstance {
    id: u32,
    dirs: Vec<(Controller, PathBuf)>,
}

impl CgroupInstance {
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Place a process in every attached controller
    pub fn add_process(&self, pid: u32) -> Result<()> {
        for (_, dir) in &self.dirs {
            write_file(&dir.join("cgroup.procs"), &pid.to_string())?;
        }
        Ok(())
    }

    /// Memory limit in bytes (`memory.limit_in_bytes`)
    pub fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        if let Some(dir) = self.dir(Controller::Memory) {
            write_file(&dir.join("memory.limit_in_bytes"), &bytes.to_string())?;
        }
        Ok(())
    }

    /// Process-count limit (`pids.max`)
    pub fn set_pids_limit(&self, max: u32) -> Result<()> {
        if let Some(dir) = self.dir(Controller::Pids) {
            write_file(&dir.join("pids.max"), &max.to_string())?;
        }
        Ok(())
    }

    /// Accumulated CPU time in nanoseconds (`cpuacct.usage`)
    pub fn cpu_usage(&self) -> Result<u64> {
        self.dir(Controller::CpuAcct)
            .map_or(Ok(0), |dir| read_u64(&dir.join("cpuacct.usage")))
    }

    /// Peak memory usage in bytes (`memory.max_usage_in_bytes`)
    pub fn memory_max_usage(&self) -> Result<u64> {
        self.dir(Controller::Memory)
            .map_or(Ok(0), |dir| read_u64(&dir.join("memory.max_usage_in_bytes")))
    }

    /// Number of processes the kernel OOM-killed in this cgroup, from the
    /// `oom_kill` field of `memory.oom_control`
    pub fn oom_kill_count(&self) -> Result<u64> {
        let Some(dir) = self.dir(Controller::Memory) else {
            return Ok(0);
        };
        let path = dir.join("memory.oom_control");
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| CorralError::Cgroup(format!("failed to read {}: {e}", path.display())))?;
        Ok(parse_oom_kill(&raw))
    }

    /// Pids still inside the cgroup
    pub fn procs(&self) -> Result<Vec<u32>> {
        let Some((_, dir)) = self.dirs.first() else {
            return Ok(Vec::new());
        };
        let raw = std::fs::read_to_string(dir.join("cgroup.procs")).map_err(|e| {
            CorralError::Cgroup(format!("failed to read {}: {e}", dir.display()))
        })?;
        Ok(raw
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// Kill anything left inside, then remove the directories.
    pub fn destroy(self) -> Result<()> {
        let strays = self.procs().unwrap_or_default();
        if !strays.is_empty() {
            for pid in &strays {
                // Stragglers only exist if the execution misbehaved.
                let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
            }
            // SIGKILL delivery is asynchronous; rmdir fails with EBUSY
            // until the kernel reaps them. Wait, bounded.
            for _ in 0..50 {
                if self.procs().unwrap_or_default().is_empty() {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
        for (_, dir) in &self.dirs {
            std::fs::remove_dir(dir).map_err(|e| {
                CorralError::Cgroup(format!("failed to remove {}: {e}", dir.display()))
            })?;
        }
        tracing::debug!(id = self.id, "destroyed cgroup instance");
        Ok(())
    }

    fn dir(&self, ctrl: Controller) -> Option<&Path> {
        self.dirs
            .iter()
            .find(|(c, _)| *c == ctrl)
            .map(|(_, d)| d.as_path())
    }
}

/// Controllers the running kernel exposes, from `/proc/cgroups`
pub fn host_controllers() -> Result<HashSet<String>> {
    let raw = std::fs::read_to_string("/proc/cgroups")
        .map_err(|e| CorralError::Config(format!("failed to read /proc/cgroups: {e}")))?;
    Ok(parse_proc_cgroups(&raw))
}

/// Parse `/proc/cgroups` content: `subsys_name hierarchy num_cgroups enabled`
fn parse_proc_cgroups(raw: &str) -> HashSet<String> {
    raw.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let enabled = fields.nth(2)?;
            (enabled == "1").then(|| name.to_string())
        })
        .collect()
}

/// Parse the `oom_kill` field out of `memory.oom_control` content.
/// The file also carries `oom_kill_disable`, so the field name must match
/// exactly.
fn parse_oom_kill(raw: &str) -> u64 {
    raw.lines()
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            (fields.next() == Some("oom_kill")).then(|| fields.next())?
        })
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .map_err(|e| CorralError::Cgroup(format!("failed to write {}: {e}", path.display())))
}

fn read_u64(path: &Path) -> Result<u64> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CorralError::Cgroup(format!("failed to read {}: {e}", path.display())))?;
    raw.trim()
        .parse()
        .map_err(|e| CorralError::Cgroup(format!("bad value in {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_set() -> HashSet<String> {
        ["cpuacct", "memory", "pids"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn filter_accepts_available_controllers() {
        let tpl = CgroupTemplateBuilder::new("corral")
            .cpu_acct()
            .memory()
            .pids()
            .filter(&full_set())
            .unwrap();
        assert_eq!(
            tpl.controllers(),
            [Controller::CpuAcct, Controller::Memory, Controller::Pids]
        );
    }

    #[test]
    fn filter_fails_deterministically_on_missing_controller() {
        let mut available = full_set();
        available.remove("pids");

        for _ in 0..3 {
            let err = CgroupTemplateBuilder::new("corral")
                .cpu_acct()
                .memory()
                .pids()
                .filter(&available)
                .unwrap_err();
            match err {
                CorralError::Config(msg) => assert!(msg.contains("pids")),
                other => panic!("expected Config error, got {other:?}"),
            }
        }
    }

    #[test]
    fn filter_rejects_empty_declaration() {
        assert!(CgroupTemplateBuilder::new("corral").filter(&full_set()).is_err());
    }

    #[test]
    fn parses_proc_cgroups_enabled_column() {
        let raw = "#subsys_name\thierarchy\tnum_cgroups\tenabled\n\
                   cpuacct\t3\t10\t1\n\
                   memory\t5\t20\t1\n\
                   pids\t7\t15\t0\n";
        let set = parse_proc_cgroups(raw);
        assert!(set.contains("cpuacct"));
        assert!(set.contains("memory"));
        assert!(!set.contains("pids"));
    }

    #[test]
    fn oom_kill_field_is_not_confused_with_oom_kill_disable() {
        let raw = "oom_kill_disable 0\nunder_oom 0\noom_kill 3\n";
        assert_eq!(parse_oom_kill(raw), 3);

        let none = "oom_kill_disable 1\nunder_oom 0\n";
        assert_eq!(parse_oom_kill(none), 0);
    }

    #[test]
    fn oom_kill_count_reads_the_memory_controller() {
        let base = tempfile::tempdir().unwrap();
        let tpl = CgroupTemplateBuilder::new("corral")
            .base(base.path())
            .memory()
            .filter(&full_set())
            .unwrap();

        let instance = tpl.instantiate(3).unwrap();
        std::fs::write(
            base.path().join("memory/corral/3/memory.oom_control"),
            "oom_kill_disable 0\nunder_oom 0\noom_kill 1\n",
        )
        .unwrap();

        assert_eq!(instance.oom_kill_count().unwrap(), 1);
    }

    #[test]
    fn destroy_waits_for_killed_processes_to_drain() {
        let base = tempfile::tempdir().unwrap();
        let tpl = CgroupTemplateBuilder::new("corral")
            .base(base.path())
            .pids()
            .filter(&full_set())
            .unwrap();

        let instance = tpl.instantiate(5).unwrap();
        let procs_path = base.path().join("pids/corral/5/cgroup.procs");
        // A pid that cannot exist, so the kill is a no-op and the entry
        // only disappears when the fixture removes it.
        std::fs::write(&procs_path, "2147483647\n").unwrap();

        let remover = std::thread::spawn({
            let procs_path = procs_path.clone();
            move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                std::fs::remove_file(&procs_path).unwrap();
            }
        });

        instance.destroy().unwrap();
        remover.join().unwrap();
        assert!(!procs_path.parent().unwrap().exists());
    }

    #[test]
    fn instantiate_and_destroy_round_trip() {
        let base = tempfile::tempdir().unwrap();
        let tpl = CgroupTemplateBuilder::new("corral")
            .base(base.path())
            .memory()
            .pids()
            .filter(&full_set())
            .unwrap();

        let instance = tpl.instantiate(7).unwrap();
        let mem_dir = base.path().join("memory/corral/7");
        assert!(mem_dir.is_dir());

        // No cgroup.procs file in the fixture, destroy still removes dirs.
        instance.destroy().unwrap();
        assert!(!mem_dir.exists());
    }
}
