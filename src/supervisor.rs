//! Interfaces to the surrounding supervisor.
//!
//! The service graph, process execution and configuration all live outside
//! this crate; control connections reach them through [`ServiceBroker`].
//! Process-wide bookkeeping that the original design kept in globals (the
//! active-connection count, the rollback-listener back-reference) is an
//! explicit [`SupervisorContext`] owned by the embedder.

use std::io;

use thiserror::Error;

use crate::control::handle::Handle;

/// Internal reference to a service record. Never exposed on the wire;
/// clients see [`Handle`]s instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(u32);

impl ServiceId {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Lifecycle state of a service as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

/// Event codes broadcast to listening connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceEvent {
    Started = 0,
    Stopped = 1,
    StartFailed = 2,
    StartCanceled = 3,
    StopCanceled = 4,
}

impl ServiceEvent {
    /// Wire code carried in the service-event packet.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Why a service description could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("service description not found")]
    NotFound,
    #[error("service description invalid: {0}")]
    Invalid(String),
    #[error("i/o error loading service description")]
    Io(#[from] io::Error),
}

/// Why a loaded service could not be unloaded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnloadError {
    #[error("service is still active")]
    Active,
    #[error("service has active dependents")]
    Dependents,
}

/// The external supervisor API consumed by control connections.
///
/// Start/stop are fire-and-forget: outcomes arrive asynchronously as
/// [`ServiceEvent`] broadcasts.
pub trait ServiceBroker {
    /// Looks up an already-loaded service by name.
    fn find_service(&self, name: &str) -> Option<ServiceId>;

    /// Loads a service description by name, or returns the existing record.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if no valid description exists.
    fn load_service(&mut self, name: &str) -> Result<ServiceId, LoadError>;

    fn start_service(&mut self, id: ServiceId);

    fn stop_service(&mut self, id: ServiceId);

    /// Releases a pin previously placed on the service.
    fn unpin_service(&mut self, id: ServiceId);

    /// Retires a loaded service record.
    ///
    /// # Errors
    ///
    /// Returns [`UnloadError`] while the service is active or depended upon.
    fn unload_service(&mut self, id: ServiceId) -> Result<(), UnloadError>;

    fn service_state(&self, id: ServiceId) -> ServiceState;

    /// Visits every loaded service. The visitor keeps allocation out of the
    /// broker's hands; packet building (and its failure handling) stays with
    /// the caller.
    fn list_services(&self, visit: &mut dyn FnMut(ServiceId, &str, ServiceState));

    /// Begins supervisor shutdown/rollback. Completion is reported to the
    /// registered rollback listener.
    fn begin_shutdown(&mut self);
}

/// Capability for receiving service event broadcasts. Implemented by the
/// control connection; registered with the event source explicitly on
/// construction and unregistered on destruction.
pub trait ServiceListener {
    fn service_event(&mut self, service: ServiceId, event: ServiceEvent);
}

/// Identity of a control connection within one supervisor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

/// Process-wide mutable state shared by all control connections.
#[derive(Debug, Default)]
pub struct SupervisorContext {
    active_control_conns: u32,
    rollback_listener: Option<ConnId>,
    next_handle: u32,
    next_conn_id: u64,
}

impl SupervisorContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new connection: bumps the active count and issues its id.
    pub fn register_conn(&mut self) -> ConnId {
        self.active_control_conns += 1;
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        id
    }

    /// Retires a connection: drops the active count and clears the rollback
    /// listener registration if this connection held it.
    pub fn unregister_conn(&mut self, id: ConnId) {
        self.active_control_conns = self.active_control_conns.saturating_sub(1);
        if self.rollback_listener == Some(id) {
            self.rollback_listener = None;
        }
    }

    #[must_use]
    pub fn active_connections(&self) -> u32 {
        self.active_control_conns
    }

    /// Registers `id` as the connection awaiting rollback completion.
    pub fn set_rollback_listener(&mut self, id: ConnId) {
        self.rollback_listener = Some(id);
    }

    #[must_use]
    pub fn rollback_listener(&self) -> Option<ConnId> {
        self.rollback_listener
    }

    /// Clears the rollback-listener registration.
    pub fn clear_rollback_listener(&mut self) {
        self.rollback_listener = None;
    }

    /// Issues a fresh client handle. Handles are monotonically allocated and
    /// never reused for the life of the process (the u32 space outlasts any
    /// realistic session count).
    pub fn next_handle(&mut self) -> Handle {
        let handle = Handle::from_raw(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_registration_counts() {
        let mut ctx = SupervisorContext::new();
        let a = ctx.register_conn();
        let b = ctx.register_conn();
        assert_ne!(a, b);
        assert_eq!(ctx.active_connections(), 2);
        ctx.unregister_conn(a);
        assert_eq!(ctx.active_connections(), 1);
    }

    #[test]
    fn unregister_clears_rollback_listener_only_for_holder() {
        let mut ctx = SupervisorContext::new();
        let a = ctx.register_conn();
        let b = ctx.register_conn();
        ctx.set_rollback_listener(a);

        ctx.unregister_conn(b);
        assert_eq!(ctx.rollback_listener(), Some(a));

        ctx.unregister_conn(a);
        assert_eq!(ctx.rollback_listener(), None);
    }

    #[test]
    fn handles_are_monotonic() {
        let mut ctx = SupervisorContext::new();
        let a = ctx.next_handle();
        let b = ctx.next_handle();
        assert_ne!(a, b);
        assert!(a.raw() < b.raw());
    }
}
