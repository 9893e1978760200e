//! Wire protocol for daemon communication
//!
//! Length-prefixed msgpack over a Unix socket.

use crate::ExecutionResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Request to run a program inside a sandbox environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Program and arguments
    pub argv: Vec<String>,
    /// Environment variables, `KEY=value`
    pub env: Vec<String>,
    /// Bytes fed to stdin
    pub stdin: Option<Vec<u8>>,
    /// Wall-clock limit
    pub time_limit: Option<Duration>,
    /// Memory limit in bytes, enforced through the execution's cgroup
    pub memory_limit: Option<u64>,
    /// Process-count limit, enforced through the execution's cgroup
    pub proc_limit: Option<u32>,
    /// Files placed in the work directory before the run (name -> content)
    pub files: Vec<(String, Vec<u8>)>,
}

/// Response from a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    /// Whether the run was carried out (the result may still be a failure)
    pub success: bool,
    /// Execution result (if success)
    pub result: Option<ExecutionResult>,
    /// Error message (if !success)
    pub error: Option<String>,
}

/// Request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Run a program
    Run(RunRequest),
    /// Get dispatcher status
    Status,
    /// Ping
    Ping,
}

/// Response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Run outcome
    Run(RunResponse),
    /// Dispatcher status
    Status {
        parallelism: usize,
        free_slots: usize,
        idle_environments: usize,
    },
    /// Pong
    Pong,
    /// Error
    Error { message: String },
}

/// Encode a message to msgpack
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(msg)
}

/// Decode a message from msgpack
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_request_survives_the_wire() {
        let req = Request::Run(RunRequest {
            argv: vec!["/bin/echo".into(), "hi".into()],
            env: vec!["PATH=/bin".into()],
            stdin: None,
            time_limit: Some(Duration::from_secs(5)),
            memory_limit: Some(64 * 1024 * 1024),
            proc_limit: Some(16),
            files: vec![("main.py".into(), b"print(1)".to_vec())],
        });

        let bytes = encode(&req).unwrap();
        let decoded: Request = decode(&bytes).unwrap();
        match decoded {
            Request::Run(r) => {
                assert_eq!(r.argv[0], "/bin/echo");
                assert_eq!(r.proc_limit, Some(16));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
