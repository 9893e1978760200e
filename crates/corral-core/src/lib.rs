//! # corral-core
//!
//! Environment lifecycle primitives for a pooled code-execution sandbox.
//!
//! This crate provides the pieces a sandbox daemon assembles at startup:
//! - declarative mount plans (bind, tmpfs, proc) validated once
//! - a thread-safe uid/gid allocator giving every execution a fresh identity
//! - cgroup templates filtered against the controllers the host exposes
//! - a container template combining root, mounts, unshare flags and credentials
//! - bounded pools of environments and cgroup instances, checked out
//!   exclusively per execution and released on every exit path
//! - a dispatcher bounding simultaneous executions to a configured parallelism

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cgroup;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod mount;
pub mod pool;
pub mod protocol;
pub mod result;
pub mod template;

pub use cgroup::{CgroupInstance, CgroupTemplate, CgroupTemplateBuilder, Controller};
pub use config::SandboxSettings;
pub use credentials::{Credential, CredentialAllocator};
pub use dispatch::{Dispatcher, DispatcherStatus, Execute};
pub use error::CorralError;
pub use mount::{MountKind, MountPlan, MountPlanBuilder, MountRule};
pub use pool::{CgroupPool, Checkout, EnvironmentPool, Pool};
pub use result::ExecutionResult;
pub use template::{ContainerTemplate, ContainerTemplateBuilder, Environment};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, CorralError>;
