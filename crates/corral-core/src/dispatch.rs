//! Worker dispatcher
//!
//! Bounds simultaneous executions to the configured parallelism and
//! sequences pool checkout, delegation and release. The protocol is
//! acquire, delegate, unconditionally release: the concurrency slot and
//! both pooled resources are scoped to the dispatch call, so every exit
//! path, including cancellation mid-run, gives them back. A leaked slot
//! or environment would degrade effective concurrency permanently.

use crate::cgroup::{CgroupInstance, CgroupTemplate};
use crate::pool::{CgroupPool, EnvironmentPool};
use crate::protocol::RunRequest;
use crate::template::{ContainerTemplate, Environment};
use crate::{CorralError, ExecutionResult, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// The execution collaborator: runs one program inside a checked-out
/// environment, accounted by a checked-out cgroup instance.
pub trait Execute: Send + Sync {
    fn execute(
        &self,
        env: &mut Environment,
        cgroup: &mut CgroupInstance,
        req: &RunRequest,
    ) -> impl Future<Output = Result<ExecutionResult>> + Send;
}

/// Bounds concurrent executions and owns the resource pools
pub struct Dispatcher {
    slots: Arc<Semaphore>,
    envs: EnvironmentPool,
    cgroups: CgroupPool,
    parallelism: usize,
}

/// Point-in-time dispatcher observables
#[derive(Debug, Clone, Copy)]
pub struct DispatcherStatus {
    pub parallelism: usize,
    pub free_slots: usize,
    pub idle_environments: usize,
}

impl Dispatcher {
    /// Build pools bounded at `parallelism` over the two templates
    #[must_use]
    pub fn new(
        template: Arc<ContainerTemplate>,
        cgroup_template: Arc<CgroupTemplate>,
        parallelism: usize,
    ) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            slots: Arc::new(Semaphore::new(parallelism)),
            envs: EnvironmentPool::new(template, parallelism),
            cgroups: CgroupPool::new(cgroup_template, parallelism),
            parallelism,
        }
    }

    /// Run one request through the execution collaborator.
    ///
    /// Suspends until a concurrency slot is free, checks out one
    /// environment and one cgroup instance, delegates, and releases all
    /// three before returning, whatever the outcome.
    pub async fn dispatch<E: Execute>(
        &self,
        executor: &E,
        req: &RunRequest,
    ) -> Result<ExecutionResult> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| CorralError::Acquire("dispatcher is shut down".into()))?;

        let mut env = self.envs.checkout().await?;
        let mut cgroup = self.cgroups.checkout().await?;

        tracing::debug!(env = env.id(), cgroup = cgroup.id(), "dispatching execution");

        // Guards and slot drop with this frame on every path.
        executor.execute(&mut env, &mut cgroup, req).await
    }

    #[must_use]
    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            parallelism: self.parallelism,
            free_slots: self.slots.available_permits(),
            idle_environments: self.envs.idle(),
        }
    }

    /// The environment pool, for observability
    #[must_use]
    pub fn environments(&self) -> &EnvironmentPool {
        &self.envs
    }

    /// The cgroup pool, for observability
    #[must_use]
    pub fn cgroups(&self) -> &CgroupPool {
        &self.cgroups
    }
}
