//! Timer multiplexer: unlimited logical timers over one OS alarm.
//!
//! [`TimerMux`] owns the queue and the alarm and assumes its caller already
//! holds the loop lock; it is the `_nolock` surface. [`TimerService`] wraps
//! the mux in that lock: its methods are the public API, and
//! [`TimerService::lock`] hands out the guard for callers that batch several
//! operations under one acquisition. Holding the guard *is* holding the
//! lock, so the locked/unlocked split cannot be misused at runtime.
//!
//! Expiry delivery happens outside the lock: the drain collects due timers
//! and the service invokes the caller's delivery closure afterwards, so a
//! delivery callback may re-enter the public API freely.

use std::collections::TryReserveError;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::reactor::{Reactor, Rearm, SignalSink, Signo};
use crate::time::{Clock, MonoTime};
use crate::timer::alarm::{self, Alarm};
use crate::timer::queue::{TimerId, TimerQueue};
use crate::trace::info;

/// Timer queue, alarm and clock as a single actor. All methods assume the
/// caller holds the loop lock (see [`TimerService`]).
pub struct TimerMux<T, A, C> {
    queue: TimerQueue<T>,
    alarm: A,
    clock: C,
}

impl<T, A: Alarm, C: Clock> TimerMux<T, A, C> {
    pub fn new(alarm: A, clock: C) -> Self {
        Self {
            queue: TimerQueue::new(),
            alarm,
            clock,
        }
    }

    /// Current time on the multiplexer's clock.
    pub fn now(&self) -> MonoTime {
        self.clock.now()
    }

    /// Read access to the queue, mainly for inspection.
    pub fn queue(&self) -> &TimerQueue<T> {
        &self.queue
    }

    /// Allocates a timer, initially unscheduled.
    ///
    /// # Errors
    ///
    /// Returns the reservation error under memory pressure; queue state is
    /// unchanged and the caller can retry or degrade.
    pub fn add_timer(&mut self, data: T) -> Result<TimerId, TryReserveError> {
        self.queue.allocate(data)
    }

    /// Dequeues (if queued) and deallocates a timer. Idempotent: a stale id
    /// is a no-op. Re-arms the alarm if the removed timer was the root.
    pub fn remove_timer(&mut self, id: TimerId) {
        if !self.queue.is_valid(id) {
            return;
        }
        if self.queue.is_queued(id) {
            let was_root = self.is_root(id);
            self.queue.remove(id);
            if was_root {
                self.set_alarm_from_queue();
            }
        }
        self.queue.deallocate(id);
    }

    /// Schedules or reschedules a timer to expire at `timeout`, with `interval`
    /// repeats (zero for one-shot). Resets the accumulated expiry count.
    ///
    /// # Panics
    ///
    /// Panics on a stale id.
    pub fn set_timer(&mut self, id: TimerId, timeout: MonoTime, interval: Duration, enable: bool) {
        {
            let node = self.queue.node_data_mut(id);
            node.interval = interval;
            node.expiry_count = 0;
            node.enabled = enable;
        }
        let root_changed = if self.queue.is_queued(id) {
            self.queue.set_priority(id, timeout)
        } else {
            self.queue.insert(id, timeout)
        };
        if root_changed {
            self.set_alarm_from_queue();
        }
    }

    /// [`set_timer`](Self::set_timer) with a timeout relative to now.
    pub fn set_timer_rel(&mut self, id: TimerId, timeout: Duration, interval: Duration, enable: bool) {
        let deadline = self.clock.now() + timeout;
        self.set_timer(id, deadline, interval, enable);
    }

    /// Enables or disables expiry reporting without stopping the timer.
    ///
    /// If deliveries accumulated while the timer was disabled, returns
    /// `Some(count)` and zeroes the counter instead of flipping the flag;
    /// the caller must deliver that count through its expiry path now.
    ///
    /// # Panics
    ///
    /// Panics on a stale id.
    #[must_use]
    pub fn enable_timer(&mut self, id: TimerId, enable: bool) -> Option<u32> {
        let node = self.queue.node_data_mut(id);
        if node.expiry_count != 0 {
            let count = std::mem::replace(&mut node.expiry_count, 0);
            Some(count)
        } else {
            node.enabled = enable;
            None
        }
    }

    /// Dequeues a timer without deallocating it. Re-arms the alarm if the
    /// removed timer was the root.
    pub fn stop_timer(&mut self, id: TimerId) {
        if self.queue.is_queued(id) {
            let was_root = self.is_root(id);
            self.queue.remove(id);
            if was_root {
                self.set_alarm_from_queue();
            }
        }
    }

    /// Programs the alarm from the queue root: disarmed when the queue is
    /// empty, otherwise a one-shot for `root - now`. Arming does not depend
    /// on the root being enabled; only delivery does.
    pub fn set_alarm_from_queue(&mut self) {
        match self.queue.peek_root() {
            None => self.alarm.disarm(),
            Some((_, expiry)) => {
                let now = self.clock.now();
                // the subtraction borrows a second when the sub-second
                // remainder would go negative; an already-due root arms the
                // shortest one-shot (zero would disarm a timerfd)
                let delta = expiry
                    .saturating_duration_since(now)
                    .max(Duration::from_nanos(1));
                self.alarm.arm_oneshot(delta);
            }
        }
    }

    /// Drains every queue entry due at `now`, reporting enabled expiries
    /// through `sink` and accumulating disabled ones. Does not re-arm; the
    /// caller re-arms once after the drain.
    ///
    /// A periodic timer that fell several periods behind advances by whole
    /// intervals until its expiry passes `now` and is reported once with the
    /// number of elapsed periods, so catch-up never storms callbacks.
    pub fn drain_expired(&mut self, now: MonoTime, mut sink: impl FnMut(TimerId, u32)) {
        while let Some((id, expiry)) = self.queue.peek_root() {
            if expiry > now {
                break;
            }
            let (interval, enabled) = {
                let node = self.queue.node_data(id);
                (node.interval, node.enabled)
            };
            let periods = if interval.is_zero() {
                self.queue.remove(id);
                1
            } else {
                let behind = now.saturating_duration_since(expiry);
                let skipped = behind.as_nanos() / interval.as_nanos();
                let steps = u32::try_from(skipped + 1).unwrap_or(u32::MAX);
                self.queue
                    .set_priority(id, expiry + interval.saturating_mul(steps));
                steps
            };
            if enabled {
                sink(id, periods);
            } else {
                let node = self.queue.node_data_mut(id);
                node.expiry_count = node.expiry_count.saturating_add(periods);
            }
        }
    }

    fn is_root(&self, id: TimerId) -> bool {
        self.queue.peek_root().is_some_and(|(root, _)| root == id)
    }
}

/// The public timer API: a [`TimerMux`] behind the loop lock.
///
/// The signal-drain path and the public methods are two callers of the same
/// guarded entry points; nothing touches the queue without the lock.
pub struct TimerService<T, A, C> {
    inner: Mutex<TimerMux<T, A, C>>,
    signo: Signo,
}

impl<T, A: Alarm, C: Clock> TimerService<T, A, C> {
    /// Wraps an alarm and clock; `signo` is the OS signal the alarm is
    /// delivered through on signal-delivery platforms.
    pub fn new(alarm: A, clock: C, signo: Signo) -> Self {
        Self {
            inner: Mutex::new(TimerMux::new(alarm, clock)),
            signo,
        }
    }

    /// Registers the alarm signal with the reactor. The signal is unblocked
    /// for the calling thread first: a signal raised between alarm arming
    /// and watch registration must not be lost while blocked.
    ///
    /// # Errors
    ///
    /// Returns the unblock or registration error.
    pub fn init<R: Reactor>(&self, reactor: &mut R) -> io::Result<()> {
        alarm::unblock_signal(self.signo)?;
        reactor.add_signal_watch(self.signo)?;
        info!("timer multiplexer registered for signal {}", self.signo);
        Ok(())
    }

    /// The signal this service owns in a [`SignalSink`] chain.
    #[must_use]
    pub fn signo(&self) -> Signo {
        self.signo
    }

    /// Acquires the loop lock, exposing the batch (`_nolock`-style) surface.
    pub fn lock(&self) -> MutexGuard<'_, TimerMux<T, A, C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// See [`TimerMux::add_timer`].
    ///
    /// # Errors
    ///
    /// Returns the reservation error under memory pressure.
    pub fn add_timer(&self, data: T) -> Result<TimerId, TryReserveError> {
        self.lock().add_timer(data)
    }

    /// See [`TimerMux::remove_timer`].
    pub fn remove_timer(&self, id: TimerId) {
        self.lock().remove_timer(id);
    }

    /// See [`TimerMux::set_timer`].
    pub fn set_timer(&self, id: TimerId, timeout: MonoTime, interval: Duration, enable: bool) {
        self.lock().set_timer(id, timeout, interval, enable);
    }

    /// See [`TimerMux::set_timer_rel`].
    pub fn set_timer_rel(&self, id: TimerId, timeout: Duration, interval: Duration, enable: bool) {
        self.lock().set_timer_rel(id, timeout, interval, enable);
    }

    /// See [`TimerMux::stop_timer`].
    pub fn stop_timer(&self, id: TimerId) {
        self.lock().stop_timer(id);
    }

    /// Enables or disables expiry reporting. Deliveries that accumulated
    /// while disabled are handed to `deliver` immediately, outside the lock,
    /// rather than silently dropped.
    pub fn enable_timer(&self, id: TimerId, enable: bool, deliver: impl FnOnce(TimerId, u32)) {
        let pending = self.lock().enable_timer(id, enable);
        if let Some(count) = pending {
            deliver(id, count);
        }
    }

    /// Alarm-delivery entry point: reads the clock once, drains everything
    /// due, re-arms from the new root, then reports expiries through
    /// `deliver` outside the lock. The alarm watch is never removed by this
    /// path.
    pub fn receive_alarm(&self, deliver: &mut dyn FnMut(TimerId, u32)) -> Rearm {
        let mut fired: Vec<(TimerId, u32)> = Vec::new();
        {
            let mut mux = self.lock();
            let now = mux.now();
            mux.drain_expired(now, |id, count| fired.push((id, count)));
            mux.set_alarm_from_queue();
        }
        for (id, count) in fired {
            deliver(id, count);
        }
        Rearm::Keep
    }
}

/// Adapter chaining a [`TimerService`] into a reactor's signal dispatch.
///
/// Signals the service does not own fall through to `next`.
pub struct AlarmSink<'s, T, A, C, F, N> {
    service: &'s TimerService<T, A, C>,
    deliver: F,
    next: N,
}

impl<'s, T, A, C, F, N> AlarmSink<'s, T, A, C, F, N> {
    pub fn new(service: &'s TimerService<T, A, C>, deliver: F, next: N) -> Self {
        Self {
            service,
            deliver,
            next,
        }
    }
}

impl<T, A, C, F, N> SignalSink for AlarmSink<'_, T, A, C, F, N>
where
    A: Alarm,
    C: Clock,
    F: FnMut(TimerId, u32),
    N: SignalSink,
{
    fn receive_signal(&mut self, signo: Signo) -> Rearm {
        if signo == self.service.signo() {
            self.service.receive_alarm(&mut self.deliver)
        } else {
            self.next.receive_signal(signo)
        }
    }
}
