//! Bounded pools of per-execution resources
//!
//! A [`Pool`] holds at most `capacity` live instances, the same bound the
//! dispatcher applies to concurrent executions, so exhaustion can never
//! exceed the service's declared parallelism. Checkout is exclusive: the
//! [`Checkout`] guard is the sole owner until it drops, and dropping it
//! is the release, on every exit path including cancellation. Instances
//! are constructed lazily; a construction failure is reported to the
//! requesting caller as an acquisition error, never retried silently.

use crate::cgroup::{CgroupInstance, CgroupTemplate};
use crate::template::{ContainerTemplate, Environment};
use crate::{CorralError, Result};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A resource that can live in a [`Pool`]
pub trait PoolItem: Send + Sized + 'static {
    /// Shared read-only state needed to construct instances
    type Factory: Send + Sync + 'static;

    /// Construct a fresh instance on demand
    fn build(factory: &Self::Factory, id: u32) -> Result<Self>;

    /// Make the instance checkout-eligible again, or consume it if reuse
    /// cannot be guaranteed safe. `None` means a replacement will be
    /// built lazily on next demand.
    fn recycle(self) -> Option<Self>;
}

struct PoolInner<T: PoolItem> {
    factory: T::Factory,
    idle: Mutex<Vec<T>>,
    slots: Arc<Semaphore>,
    capacity: usize,
    next_id: AtomicU32,
}

/// Bounded pool of exclusively checked-out instances
pub struct Pool<T: PoolItem> {
    inner: Arc<PoolInner<T>>,
}

impl<T: PoolItem> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PoolItem> Pool<T> {
    /// Create a pool bounded at `capacity` live instances
    #[must_use]
    pub fn new(factory: T::Factory, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                idle: Mutex::new(Vec::with_capacity(capacity)),
                slots: Arc::new(Semaphore::new(capacity)),
                capacity,
                next_id: AtomicU32::new(0),
            }),
        }
    }

    /// Check out an instance, suspending while the pool is at capacity.
    ///
    /// Pops an idle instance or lazily builds a new one. Exclusive until
    /// the returned guard drops.
    pub async fn checkout(&self) -> Result<Checkout<T>> {
        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|_| CorralError::Acquire("pool is closed".into()))?;

        let recycled = self.inner.idle.lock().pop();
        let item = match recycled {
            Some(item) => item,
            None => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                match T::build(&self.inner.factory, id) {
                    Ok(item) => item,
                    Err(e) => {
                        // Permit drops with this frame; the slot is not lost.
                        drop(permit);
                        return Err(CorralError::Acquire(e.to_string()));
                    }
                }
            }
        };

        Ok(Checkout {
            item: Some(item),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Checkouts that could start right now without suspending
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Instances sitting ready for reuse
    #[must_use]
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Exclusive ownership of one pooled instance.
///
/// Dropping the guard releases the instance: it is recycled back into the
/// pool, or discarded if recycling deems reuse unsafe. The concurrency
/// slot is returned either way.
pub struct Checkout<T: PoolItem> {
    item: Option<T>,
    inner: Arc<PoolInner<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T: PoolItem> std::fmt::Debug for Checkout<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkout").finish_non_exhaustive()
    }
}

impl<T: PoolItem> Checkout<T> {
    /// Release explicitly. Identical to dropping the guard.
    pub fn release(self) {}
}

impl<T: PoolItem> Deref for Checkout<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("checkout accessed after release")
    }
}

impl<T: PoolItem> DerefMut for Checkout<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("checkout accessed after release")
    }
}

impl<T: PoolItem> Drop for Checkout<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            if let Some(item) = item.recycle() {
                self.inner.idle.lock().push(item);
            }
        }
        // _permit drops here, freeing the slot.
    }
}

/// Pool of sandbox [`Environment`]s built from a [`ContainerTemplate`]
pub type EnvironmentPool = Pool<Environment>;

/// Pool of per-execution [`CgroupInstance`]s
pub type CgroupPool = Pool<CgroupInstance>;

impl PoolItem for Environment {
    type Factory = Arc<ContainerTemplate>;

    fn build(template: &Self::Factory, id: u32) -> Result<Self> {
        template.instantiate(id)
    }

    fn recycle(mut self) -> Option<Self> {
        match self.reset() {
            Ok(()) => Some(self),
            Err(e) => {
                // Reuse cannot be trusted after a failed reset; rebuild
                // lazily instead.
                tracing::warn!(id = self.id(), error = %e, "discarding environment after failed reset");
                self.destroy();
                None
            }
        }
    }
}

impl PoolItem for CgroupInstance {
    type Factory = Arc<CgroupTemplate>;

    fn build(template: &Self::Factory, id: u32) -> Result<Self> {
        template.instantiate(id)
    }

    fn recycle(self) -> Option<Self> {
        // Cgroup instances are never reused: counters must start from
        // zero for the next execution.
        let id = self.id();
        if let Err(e) = self.destroy() {
            tracing::warn!(id, error = %e, "failed to destroy cgroup instance");
        }
        None
    }
}
