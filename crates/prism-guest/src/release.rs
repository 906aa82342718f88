//! Resource release tracking.
//!
//! Every submitted command that references releasable memory carries a
//! release id; the device echoes the id on the release ring once it has
//! finished reading the referenced memory. Observing the id here is the only
//! thing that makes reuse of that memory safe, so ids are registered before
//! the command is published and removed exactly once when they come back.
//!
//! The tracker holds weak references only: it observes resource lifetime, it
//! never extends it.

use std::collections::HashMap;
use std::sync::Weak;

use thiserror::Error;
use tracing::warn;

use crate::ring::{RingChannel, RingError};
use crate::shmem::SharedMemory;

/// A resource whose backing memory becomes reusable once its release id has
/// been observed.
pub trait Reclaimable {
    fn reclaim(&self);
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ReleaseError {
    #[error("release id {id} is already pending")]
    DuplicateReleaseId { id: u64 },
    #[error("release ring carried unknown ids {ids:?}")]
    UnknownRelease { ids: Vec<u64> },
    #[error(transparent)]
    Ring(#[from] RingError),
}

#[derive(Debug, Default)]
pub struct ResourceReleaseTracker {
    pending: HashMap<u64, Weak<dyn Reclaimable>>,
}

impl ResourceReleaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Register a release id at command-build time, before the command is
    /// published. An id may be reused only after it has been observed
    /// released.
    pub fn register_pending(
        &mut self,
        id: u64,
        resource: Weak<dyn Reclaimable>,
    ) -> Result<(), ReleaseError> {
        if self.pending.contains_key(&id) {
            return Err(ReleaseError::DuplicateReleaseId { id });
        }
        self.pending.insert(id, resource);
        Ok(())
    }

    /// Forget a registration whose command was never published (failed
    /// command build). Harmless if the id is not pending.
    pub fn cancel_pending(&mut self, id: u64) {
        self.pending.remove(&id);
    }

    /// Drop every registration. A device reset discards outstanding commands,
    /// so their releases will never arrive.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Drain the release ring, reclaiming every matched resource exactly
    /// once.
    ///
    /// The ring is always drained to the end so the cursors are never left
    /// torn; ids with no matching registration are collected and reported as
    /// one `UnknownRelease` error afterwards. Returns the number of resources
    /// released.
    pub fn drain_releases(
        &mut self,
        mem: &mut dyn SharedMemory,
        ring: &mut RingChannel<u64>,
    ) -> Result<usize, ReleaseError> {
        let mut released = 0usize;
        let mut unknown = Vec::new();
        let pending = &mut self.pending;
        ring.drain(mem, |id| match pending.remove(&id) {
            Some(resource) => {
                released += 1;
                // An upgrade failure means the owner dropped the resource
                // already; the registration still had to be consumed.
                if let Some(resource) = resource.upgrade() {
                    resource.reclaim();
                }
            }
            None => unknown.push(id),
        })?;
        if !unknown.is_empty() {
            warn!(?unknown, "release ring carried unknown release ids");
            return Err(ReleaseError::UnknownRelease { ids: unknown });
        }
        Ok(released)
    }
}
