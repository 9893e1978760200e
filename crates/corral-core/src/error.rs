//! Error types for corral-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorralError {
    /// Startup-time misconfiguration. Fatal by policy: the daemon refuses
    /// to run without its isolation guarantees in place.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    /// The allocator ran out of uid/gid space. Never reuses a credential.
    #[error("credential range exhausted")]
    CredentialsExhausted,

    /// A pooled instance could not be constructed on demand. Reported to
    /// the requesting caller; the server stays up.
    #[error("acquisition error: {0}")]
    Acquire(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}
