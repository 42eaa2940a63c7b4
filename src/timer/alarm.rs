//! The single scarce OS alarm behind the timer multiplexer.
//!
//! The multiplexer programs exactly one alarm, always one-shot: the OS
//! interval field stays zero and repeats are handled in the multiplexer.
//! [`TimerFdAlarm`] is the production implementation; tests substitute a
//! recording mock through the [`Alarm`] trait.

use std::io;
use std::time::Duration;

use crate::reactor::Signo;
use crate::trace::warn;

/// One-shot OS alarm. Arming and disarming are non-failing by contract;
/// implementations log and carry on if the underlying syscall fails.
pub trait Alarm {
    /// Programs the alarm to fire once after `delta`.
    fn arm_oneshot(&mut self, delta: Duration);

    /// Cancels any pending expiry.
    fn disarm(&mut self);
}

/// The signal dinit-style platforms deliver the alarm through.
pub const ALARM_SIGNO: Signo = nix::libc::SIGALRM;

/// Unblocks `signo` for the calling thread.
///
/// On platforms that deliver the alarm as a signal this must run *before*
/// the signal watch is registered with the reactor: a signal raised between
/// arming and registration must not be lost while blocked.
///
/// # Errors
///
/// Returns the underlying `sigprocmask` error.
pub fn unblock_signal(signo: Signo) -> io::Result<()> {
    use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};

    let signal = Signal::try_from(signo)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "unknown signal number"))?;
    let mut set = SigSet::empty();
    set.add(signal);
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None)
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
}

/// Production alarm backed by a monotonic timerfd.
///
/// The descriptor is nonblocking and close-on-exec; register it with the
/// reactor (e.g. via `mio::unix::SourceFd`) and drain one `u64` on
/// readability before handing the expiry to the multiplexer.
#[cfg(target_os = "linux")]
pub struct TimerFdAlarm {
    fd: std::os::fd::OwnedFd,
}

#[cfg(target_os = "linux")]
impl TimerFdAlarm {
    /// Creates the timerfd, initially disarmed.
    ///
    /// # Errors
    ///
    /// Returns the `timerfd_create` error.
    pub fn new() -> io::Result<Self> {
        use rustix::time::{timerfd_create, TimerfdClockId, TimerfdFlags};

        let fd = timerfd_create(
            TimerfdClockId::Monotonic,
            TimerfdFlags::NONBLOCK | TimerfdFlags::CLOEXEC,
        )?;
        Ok(Self { fd })
    }

    /// The descriptor to watch for alarm expiry.
    #[must_use]
    pub fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }

    fn settime(&self, delta: Duration) {
        use rustix::time::{timerfd_settime, Itimerspec, TimerfdTimerFlags, Timespec};

        let spec = Itimerspec {
            // interval stays zero: repeats belong to the multiplexer
            it_interval: Timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: Timespec {
                tv_sec: delta.as_secs() as i64,
                tv_nsec: delta.subsec_nanos() as i64,
            },
        };
        if let Err(err) = timerfd_settime(&self.fd, TimerfdTimerFlags::empty(), &spec) {
            warn!("timerfd_settime failed: {}", err);
        }
    }
}

#[cfg(target_os = "linux")]
impl Alarm for TimerFdAlarm {
    fn arm_oneshot(&mut self, delta: Duration) {
        self.settime(delta);
    }

    fn disarm(&mut self) {
        self.settime(Duration::ZERO);
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn timerfd_arms_and_fires() {
        let mut alarm = TimerFdAlarm::new().unwrap();
        alarm.arm_oneshot(Duration::from_millis(5));

        // blocking read via poll-free spin; the expiry lands within the test
        // timeout or something is genuinely broken
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut buf = [0u8; 8];
        loop {
            match rustix::io::read(alarm.as_fd(), &mut buf) {
                Ok(8) => break,
                Ok(n) => panic!("short timerfd read: {n}"),
                Err(rustix::io::Errno::AGAIN) => {
                    assert!(std::time::Instant::now() < deadline, "alarm never fired");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => panic!("timerfd read failed: {err}"),
            }
        }
        assert!(u64::from_ne_bytes(buf) >= 1);
    }

    #[test]
    #[serial]
    fn disarm_cancels_pending_expiry() {
        let mut alarm = TimerFdAlarm::new().unwrap();
        alarm.arm_oneshot(Duration::from_millis(20));
        alarm.disarm();
        std::thread::sleep(Duration::from_millis(40));
        let mut buf = [0u8; 8];
        assert_eq!(
            rustix::io::read(alarm.as_fd(), &mut buf),
            Err(rustix::io::Errno::AGAIN),
            "disarmed alarm still fired"
        );
    }

    #[test]
    fn unblock_signal_accepts_alarm() {
        unblock_signal(ALARM_SIGNO).unwrap();
    }
}
