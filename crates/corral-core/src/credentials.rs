//! Per-execution uid/gid allocation
//!
//! Every execution runs under its own unprivileged identity so that one
//! sandboxed program cannot signal or inspect another's process tree even
//! if namespace isolation is imperfect.

use crate::{CorralError, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// The uid/gid identity assigned to one execution. The two halves are
/// always equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
}

/// First id handed out; clear of normal host uid ranges.
pub const CREDENTIAL_START: u32 = 10000;

/// Thread-safe allocator of fresh, never-reused credentials.
///
/// A single fetch-and-add per call; concurrent callers never observe the
/// same value. When the u32 range runs out the allocator fails closed:
/// every further call returns [`CorralError::CredentialsExhausted`] rather
/// than wrapping around onto an identity that may still be live.
#[derive(Debug)]
pub struct CredentialAllocator {
    next: AtomicU32,
}

impl CredentialAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(CREDENTIAL_START)
    }

    /// Start the counter at an arbitrary id. Used by tests to exercise the
    /// exhaustion path without 4 billion calls.
    #[must_use]
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Allocate the next credential.
    pub fn next(&self) -> Result<Credential> {
        let id = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
            .map_err(|_| CorralError::CredentialsExhausted)?;

        Ok(Credential { uid: id, gid: id })
    }
}

impl Default for CredentialAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn sequential_allocations_are_strictly_increasing() {
        let alloc = CredentialAllocator::new();
        let mut last = None;
        for _ in 0..100 {
            let cred = alloc.next().unwrap();
            assert_eq!(cred.uid, cred.gid);
            if let Some(prev) = last {
                assert!(cred.uid > prev);
            }
            last = Some(cred.uid);
        }
    }

    #[test]
    fn starts_above_host_uid_range() {
        let alloc = CredentialAllocator::new();
        assert_eq!(alloc.next().unwrap().uid, CREDENTIAL_START);
    }

    #[test]
    fn concurrent_allocations_are_pairwise_distinct() {
        let alloc = Arc::new(CredentialAllocator::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..250)
                    .map(|_| alloc.next().unwrap().uid)
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for uid in handle.join().unwrap() {
                assert!(seen.insert(uid), "uid {uid} handed out twice");
            }
        }
        assert_eq!(seen.len(), 8 * 250);
    }

    #[test]
    fn fails_closed_at_range_end() {
        let alloc = CredentialAllocator::starting_at(u32::MAX - 1);
        assert_eq!(alloc.next().unwrap().uid, u32::MAX - 1);
        assert!(matches!(
            alloc.next(),
            Err(CorralError::CredentialsExhausted)
        ));
        // Still closed on the next call; no wraparound.
        assert!(matches!(
            alloc.next(),
            Err(CorralError::CredentialsExhausted)
        ));
    }
}
