//! Warden core: the reactor-adjacent heart of a service supervisor.
//!
//! Two subsystems live here. The timer side multiplexes an unbounded set of
//! logical, possibly-repeating timers onto a single one-shot OS alarm,
//! drift-corrected against the monotonic clock. The control side parses a
//! length-framed binary packet protocol from client sockets, maps opaque
//! handles to supervisor services in both directions, and survives partial
//! reads, slow peers and allocation failure without corrupting framing.
//!
//! The reactor itself, the service graph and process execution are external
//! collaborators reached through the traits in [`reactor`] and [`supervisor`].

pub mod control;
pub mod reactor;
pub mod supervisor;
pub mod time;
pub mod timer;
pub mod trace;

pub use time::{Clock, MonoTime, MonotonicClock};
pub use timer::{TimerId, TimerService};
