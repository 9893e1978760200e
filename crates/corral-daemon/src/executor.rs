//! Process-spawning execution collaborator
//!
//! Consumes a checked-out environment and cgroup instance and runs one
//! program: request files placed in the work directory, the process
//! started under the environment's credential and attached to the cgroup,
//! a wall-clock limit enforced with a kill. Resource usage is read back
//! from the cgroup when the run ends.

use corral_core::dispatch::Execute;
use corral_core::protocol::RunRequest;
use corral_core::template::Environment;
use corral_core::{CgroupInstance, CorralError, ExecutionResult, Result};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Wall-clock limit applied when the request does not carry one
const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(30);

pub struct ProcessExecutor;

impl Execute for ProcessExecutor {
    async fn execute(
        &self,
        env: &mut Environment,
        cgroup: &mut CgroupInstance,
        req: &RunRequest,
    ) -> Result<ExecutionResult> {
        let program = req
            .argv
            .first()
            .ok_or_else(|| CorralError::Execution("empty argv".into()))?;

        place_files(env, req)?;
        chown_workdir(env)?;

        if let Some(bytes) = req.memory_limit {
            cgroup.set_memory_limit(bytes)?;
        }
        if let Some(max) = req.proc_limit {
            cgroup.set_pids_limit(max)?;
        }

        let cred = env.credential();
        let mut cmd = Command::new(program);
        cmd.args(&req.argv[1..])
            .current_dir(env.workdir())
            .env_clear()
            .envs(req.env.iter().filter_map(|kv| kv.split_once('=')))
            .uid(cred.uid)
            .gid(cred.gid)
            .stdin(if req.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(if env.capture_stderr() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| CorralError::Execution(format!("failed to spawn {program}: {e}")))?;

        if let Some(pid) = child.id() {
            cgroup.add_process(pid)?;
        }

        if let (Some(data), Some(mut stdin)) = (req.stdin.as_deref(), child.stdin.take()) {
            // Best effort; the program may exit without reading.
            let _ = stdin.write_all(data).await;
        }

        let limit = req.time_limit.unwrap_or(DEFAULT_TIME_LIMIT);
        let outcome = timeout(limit, child.wait_with_output()).await;
        let duration = start.elapsed();

        let memory_peak = cgroup.memory_max_usage().unwrap_or(0);
        // cpuacct.usage reports nanoseconds.
        let cpu_time_us = cgroup.cpu_usage().unwrap_or(0) / 1000;
        let oom_killed = cgroup.oom_kill_count().unwrap_or(0) > 0;

        match outcome {
            Ok(output) => {
                let output = output
                    .map_err(|e| CorralError::Execution(format!("wait failed: {e}")))?;
                Ok(ExecutionResult {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    duration,
                    memory_peak,
                    cpu_time_us,
                    timed_out: false,
                    oom_killed,
                })
            }
            // kill_on_drop reaped the child when the wait future dropped;
            // anything it spawned dies with the cgroup instance.
            Err(_) => Ok(ExecutionResult {
                exit_code: -1,
                stdout: Vec::new(),
                stderr: Vec::new(),
                duration,
                memory_peak,
                cpu_time_us,
                timed_out: true,
                oom_killed,
            }),
        }
    }
}

/// Hand the work directory to the execution's credential so the child can
/// write its own cwd.
fn chown_workdir(env: &Environment) -> Result<()> {
    let cred = env.credential();
    nix::unistd::chown(
        env.workdir(),
        Some(nix::unistd::Uid::from_raw(cred.uid)),
        Some(nix::unistd::Gid::from_raw(cred.gid)),
    )
    .map_err(|e| {
        CorralError::Execution(format!(
            "failed to chown {} to uid {}: {e}",
            env.workdir().display(),
            cred.uid
        ))
    })
}

/// Write the request's files into the work directory
fn place_files(env: &Environment, req: &RunRequest) -> Result<()> {
    for (name, content) in &req.files {
        if name.contains('/') || name.contains("..") {
            return Err(CorralError::Execution(format!(
                "invalid file name: {name}"
            )));
        }
        std::fs::write(env.workdir().join(name), content)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::mount::MountPlanBuilder;
    use corral_core::template::ContainerTemplateBuilder;

    fn environment_in(dir: &std::path::Path) -> Environment {
        let mounts = MountPlanBuilder::new().tmpfs("w", "size=1m").build().unwrap();
        let template = ContainerTemplateBuilder::new(dir.join("root"), mounts)
            .build()
            .unwrap();
        template.instantiate(0).unwrap()
    }

    #[test]
    fn workdir_is_handed_to_the_credential_before_spawn() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let env = environment_in(dir.path());

        if nix::unistd::Uid::effective().is_root() {
            chown_workdir(&env).unwrap();
            let meta = std::fs::metadata(env.workdir()).unwrap();
            assert_eq!(meta.uid(), env.credential().uid);
            assert_eq!(meta.gid(), env.credential().gid);
        } else {
            // Unprivileged chown to a foreign uid must surface, not be
            // skipped silently.
            assert!(chown_workdir(&env).is_err());
        }
    }

    #[test]
    fn rejects_file_names_that_escape_the_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment_in(dir.path());

        let req = RunRequest {
            argv: vec!["/bin/true".into()],
            env: Vec::new(),
            stdin: None,
            time_limit: None,
            memory_limit: None,
            proc_limit: None,
            files: vec![("../escape".into(), Vec::new())],
        };

        assert!(place_files(&env, &req).is_err());
    }
}
