//! Execution result types
//!
//! Failures originating inside the sandboxed run (non-zero exit, limit
//! violations, crashes) are structured results, not subsystem errors;
//! they never affect pool or dispatcher health.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of one sandboxed execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code of the process
    pub exit_code: i32,

    /// Standard output
    pub stdout: Vec<u8>,

    /// Standard error
    pub stderr: Vec<u8>,

    /// Wall-clock duration
    pub duration: Duration,

    /// Peak memory usage in bytes, from the execution's cgroup
    pub memory_peak: u64,

    /// CPU time used in microseconds, from the execution's cgroup
    pub cpu_time_us: u64,

    /// Whether the process was killed due to timeout
    pub timed_out: bool,

    /// Whether the process was killed due to memory limit
    pub oom_killed: bool,
}

impl ExecutionResult {
    /// Get stdout as UTF-8 string, lossy conversion
    #[must_use]
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Get stderr as UTF-8 string, lossy conversion
    #[must_use]
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Check if execution was successful (exit code 0, no timeout, no OOM)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.oom_killed
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            exit_code: -1,
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration: Duration::ZERO,
            memory_peak: 0,
            cpu_time_us: 0,
            timed_out: false,
            oom_killed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_kills_are_not_success() {
        let ok = ExecutionResult {
            exit_code: 0,
            ..ExecutionResult::default()
        };
        assert!(ok.is_success());

        let oom = ExecutionResult {
            exit_code: 0,
            oom_killed: true,
            ..ExecutionResult::default()
        };
        assert!(!oom.is_success());

        let slow = ExecutionResult {
            exit_code: 0,
            timed_out: true,
            ..ExecutionResult::default()
        };
        assert!(!slow.is_success());
    }
}
