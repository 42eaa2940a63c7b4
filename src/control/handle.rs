//! Client handle allocation: the bidirectional service ↔ handle mapping.
//!
//! Clients never see internal service references; they hold opaque numeric
//! handles. Several handles may alias one service (repeated lookups each
//! get their own), so the forward relation is one-to-many and the reverse
//! relation many-to-one. The two are kept exact mirrors of each other.

use std::collections::{HashMap, TryReserveError};

use crate::supervisor::{ServiceId, SupervisorContext};

/// Opaque numeric id a client holds for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Per-connection handle table.
#[derive(Debug, Default)]
pub struct HandleAllocator {
    forward: HashMap<ServiceId, Vec<Handle>>,
    reverse: HashMap<Handle, ServiceId>,
}

impl HandleAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws a fresh handle from the context and inserts it into both
    /// relations. All room is reserved before either relation is touched,
    /// so a failure commits nothing.
    ///
    /// # Errors
    ///
    /// Returns the reservation error under memory pressure.
    pub fn allocate(
        &mut self,
        ctx: &mut SupervisorContext,
        service: ServiceId,
    ) -> Result<Handle, TryReserveError> {
        self.reverse.try_reserve(1)?;
        if let Some(bucket) = self.forward.get_mut(&service) {
            bucket.try_reserve(1)?;
            let handle = ctx.next_handle();
            bucket.push(handle);
            self.reverse.insert(handle, service);
            Ok(handle)
        } else {
            self.forward.try_reserve(1)?;
            let mut bucket = Vec::new();
            bucket.try_reserve(1)?;
            let handle = ctx.next_handle();
            bucket.push(handle);
            self.forward.insert(service, bucket);
            self.reverse.insert(handle, service);
            Ok(handle)
        }
    }

    /// The service a handle refers to, if the handle is live.
    #[must_use]
    pub fn resolve(&self, handle: Handle) -> Option<ServiceId> {
        self.reverse.get(&handle).copied()
    }

    /// Releases one handle from both relations; no-op if absent.
    pub fn release(&mut self, handle: Handle) {
        let Some(service) = self.reverse.remove(&handle) else {
            return;
        };
        if let Some(bucket) = self.forward.get_mut(&service) {
            bucket.retain(|&h| h != handle);
            if bucket.is_empty() {
                self.forward.remove(&service);
            }
        }
    }

    /// Releases every handle aliasing `service`.
    pub fn release_service(&mut self, service: ServiceId) {
        if let Some(bucket) = self.forward.remove(&service) {
            for handle in bucket {
                self.reverse.remove(&handle);
            }
        }
    }

    /// Releases everything; used at connection teardown.
    pub fn release_all(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    /// Handles currently aliasing `service`, for event fan-out.
    #[must_use]
    pub fn handles_for(&self, service: ServiceId) -> &[Handle] {
        self.forward.get(&service).map_or(&[], Vec::as_slice)
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(n: u32) -> ServiceId {
        ServiceId::from_raw(n)
    }

    #[test]
    fn allocate_is_injective_and_resolvable() {
        let mut ctx = SupervisorContext::new();
        let mut alloc = HandleAllocator::new();
        let a = alloc.allocate(&mut ctx, svc(1)).unwrap();
        let b = alloc.allocate(&mut ctx, svc(2)).unwrap();
        let c = alloc.allocate(&mut ctx, svc(1)).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(alloc.resolve(a), Some(svc(1)));
        assert_eq!(alloc.resolve(b), Some(svc(2)));
        assert_eq!(alloc.resolve(c), Some(svc(1)));
        assert_eq!(alloc.len(), 3);
    }

    #[test]
    fn aliasing_handles_fan_out_together() {
        let mut ctx = SupervisorContext::new();
        let mut alloc = HandleAllocator::new();
        let a = alloc.allocate(&mut ctx, svc(9)).unwrap();
        let b = alloc.allocate(&mut ctx, svc(9)).unwrap();

        let mut handles = alloc.handles_for(svc(9)).to_vec();
        handles.sort();
        assert_eq!(handles, vec![a, b]);
        assert!(alloc.handles_for(svc(8)).is_empty());
    }

    #[test]
    fn release_removes_from_both_relations() {
        let mut ctx = SupervisorContext::new();
        let mut alloc = HandleAllocator::new();
        let a = alloc.allocate(&mut ctx, svc(1)).unwrap();
        let b = alloc.allocate(&mut ctx, svc(1)).unwrap();

        alloc.release(a);
        assert_eq!(alloc.resolve(a), None);
        assert_eq!(alloc.handles_for(svc(1)), &[b]);

        // releasing again is a no-op
        alloc.release(a);
        assert_eq!(alloc.len(), 1);
    }

    #[test]
    fn release_service_drops_every_alias() {
        let mut ctx = SupervisorContext::new();
        let mut alloc = HandleAllocator::new();
        let a = alloc.allocate(&mut ctx, svc(1)).unwrap();
        let b = alloc.allocate(&mut ctx, svc(1)).unwrap();
        let c = alloc.allocate(&mut ctx, svc(2)).unwrap();

        alloc.release_service(svc(1));
        assert_eq!(alloc.resolve(a), None);
        assert_eq!(alloc.resolve(b), None);
        assert_eq!(alloc.resolve(c), Some(svc(2)));
        assert!(alloc.handles_for(svc(1)).is_empty());
    }

    #[test]
    fn release_all_empties_the_table() {
        let mut ctx = SupervisorContext::new();
        let mut alloc = HandleAllocator::new();
        for i in 0..4 {
            alloc.allocate(&mut ctx, svc(i)).unwrap();
        }
        alloc.release_all();
        assert!(alloc.is_empty());
    }
}
