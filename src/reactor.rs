//! Contract between warden and the host reactor.
//!
//! Warden does not run an event loop of its own. The embedding supervisor
//! owns one (typically mio-based) and feeds readiness and signal
//! notifications into the types in [`timer`](crate::timer) and
//! [`control`](crate::control) through the traits defined here.

use std::io;
use std::os::fd::BorrowedFd;

/// Readiness interest for a watched file descriptor.
///
/// Unlike [`mio::Interest`], the empty set is representable: a connection
/// with nothing to send and input processing suspended watches for nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(1);
    pub const WRITE: Interest = Interest(2);

    /// True if every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Converts to mio's interest type; `None` for the empty set, which mio
    /// expresses by deregistering instead.
    #[must_use]
    pub fn to_mio(self) -> Option<mio::Interest> {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// What a callback wants done with its watch after returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// Keep the watch registered.
    Keep,
    /// Deregister the watch; the watcher is going away.
    Remove,
}

/// OS signal number.
pub type Signo = i32;

/// Receiver for watched-signal notifications.
///
/// Sinks form a chain: a sink that does not own the delivered signal passes
/// it to the next sink in the chain rather than swallowing it.
pub trait SignalSink {
    fn receive_signal(&mut self, signo: Signo) -> Rearm;
}

/// Terminal element of a signal chain; keeps the watch and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreSignals;

impl SignalSink for IgnoreSignals {
    fn receive_signal(&mut self, _signo: Signo) -> Rearm {
        Rearm::Keep
    }
}

/// Per-fd handle through which a watcher adjusts its own readiness interest.
///
/// The reactor resolves callbacks to their owning object by the token or
/// index it issued at registration; watchers never reconstruct an owner from
/// an embedded member.
pub trait WatchControl {
    fn set_watches(&mut self, interest: Interest);
}

/// Registration surface of the host reactor.
pub trait Reactor {
    type Watch: WatchControl;

    /// Registers interest in an OS signal. Notifications arrive through the
    /// reactor's [`SignalSink`] chain.
    fn add_signal_watch(&mut self, signo: Signo) -> io::Result<()>;

    /// Registers a file descriptor with an initial interest set and returns
    /// the handle used to adjust it later.
    fn add_fd_watch(&mut self, fd: BorrowedFd<'_>, interest: Interest) -> io::Result<Self::Watch>;
}
