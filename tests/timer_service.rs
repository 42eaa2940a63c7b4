//! Timer multiplexer behavior against a recording alarm and a scripted
//! clock: one OS alarm always tracks the queue root, drains are
//! drift-correct, and disabled timers accumulate rather than fire.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use warden::reactor::{Interest, Reactor, Rearm, SignalSink, Signo, WatchControl};
use warden::time::{Clock, MonoTime};
use warden::timer::{Alarm, AlarmSink, TimerId, TimerService, ALARM_SIGNO};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlarmCall {
    Arm(Duration),
    Disarm,
}

#[derive(Clone, Default)]
struct MockAlarm(Rc<RefCell<Vec<AlarmCall>>>);

impl Alarm for MockAlarm {
    fn arm_oneshot(&mut self, delta: Duration) {
        self.0.borrow_mut().push(AlarmCall::Arm(delta));
    }

    fn disarm(&mut self) {
        self.0.borrow_mut().push(AlarmCall::Disarm);
    }
}

#[derive(Clone)]
struct MockClock(Rc<Cell<MonoTime>>);

impl Clock for MockClock {
    fn now(&self) -> MonoTime {
        self.0.get()
    }
}

type Service = TimerService<(), MockAlarm, MockClock>;

fn service() -> (Service, Rc<RefCell<Vec<AlarmCall>>>, Rc<Cell<MonoTime>>) {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let now = Rc::new(Cell::new(MonoTime::ZERO));
    let service = TimerService::new(
        MockAlarm(calls.clone()),
        MockClock(now.clone()),
        ALARM_SIGNO,
    );
    (service, calls, now)
}

fn t(secs: i64) -> MonoTime {
    MonoTime::new(secs, 0)
}

fn last(calls: &Rc<RefCell<Vec<AlarmCall>>>) -> AlarmCall {
    *calls.borrow().last().expect("no alarm programming recorded")
}

fn drain(service: &Service) -> Vec<(TimerId, u32)> {
    let mut fired = Vec::new();
    assert_eq!(
        service.receive_alarm(&mut |id, count| fired.push((id, count))),
        Rearm::Keep,
        "the alarm delivery path must keep its watch"
    );
    fired
}

#[test]
fn alarm_tracks_the_minimum_expiry() {
    let (service, calls, _) = service();
    let a = service.add_timer(()).unwrap();
    let b = service.add_timer(()).unwrap();
    let c = service.add_timer(()).unwrap();

    service.set_timer(a, t(5), Duration::ZERO, true);
    assert_eq!(last(&calls), AlarmCall::Arm(Duration::from_secs(5)));

    // earlier expiry displaces the root and reprograms
    service.set_timer(b, t(3), Duration::ZERO, true);
    assert_eq!(last(&calls), AlarmCall::Arm(Duration::from_secs(3)));

    // later expiry leaves the alarm alone
    let before = calls.borrow().len();
    service.set_timer(c, t(9), Duration::ZERO, true);
    assert_eq!(calls.borrow().len(), before, "non-root change reprogrammed the alarm");
}

#[test]
fn arming_ignores_enabled_but_delivery_honors_it() {
    let (service, calls, _) = service();
    let a = service.add_timer(()).unwrap();
    let b = service.add_timer(()).unwrap();

    // the disabled timer is earlier: it still owns the alarm slot
    service.set_timer(a, t(2), Duration::ZERO, false);
    service.set_timer(b, t(4), Duration::ZERO, true);
    assert_eq!(last(&calls), AlarmCall::Arm(Duration::from_secs(2)));
}

#[test]
fn stopping_the_root_rearms_to_the_next() {
    let (service, calls, _) = service();
    let a = service.add_timer(()).unwrap();
    let b = service.add_timer(()).unwrap();
    service.set_timer(a, t(2), Duration::ZERO, true);
    service.set_timer(b, t(7), Duration::ZERO, true);

    service.stop_timer(a);
    assert_eq!(last(&calls), AlarmCall::Arm(Duration::from_secs(7)));

    // removing the last queued timer disarms entirely
    service.stop_timer(b);
    assert_eq!(last(&calls), AlarmCall::Disarm);

    // stop on an unqueued timer does not touch the alarm
    let before = calls.borrow().len();
    service.stop_timer(a);
    assert_eq!(calls.borrow().len(), before);
}

#[test]
fn removing_a_non_root_does_not_reprogram() {
    let (service, calls, _) = service();
    let a = service.add_timer(()).unwrap();
    let b = service.add_timer(()).unwrap();
    service.set_timer(a, t(2), Duration::ZERO, true);
    service.set_timer(b, t(7), Duration::ZERO, true);

    let before = calls.borrow().len();
    service.remove_timer(b);
    assert_eq!(calls.borrow().len(), before);

    // removing a timer twice is a harmless no-op
    service.remove_timer(b);
    assert_eq!(calls.borrow().len(), before);
}

#[test]
fn one_shot_fires_once_and_disarms() {
    let (service, calls, now) = service();
    let a = service.add_timer(()).unwrap();
    service.set_timer(a, t(1), Duration::ZERO, true);

    now.set(t(1));
    assert_eq!(drain(&service), vec![(a, 1)]);
    assert_eq!(last(&calls), AlarmCall::Disarm);

    // nothing left: a later drain delivers nothing
    now.set(t(10));
    assert_eq!(drain(&service), vec![]);
}

#[test]
fn periodic_timer_rearms_on_its_own_phase() {
    let (service, calls, now) = service();
    let a = service.add_timer(()).unwrap();
    service.set_timer(a, t(1), Duration::from_secs(1), true);

    now.set(t(1));
    assert_eq!(drain(&service), vec![(a, 1)]);
    // requeued at t=2, armed for the remaining second
    assert_eq!(last(&calls), AlarmCall::Arm(Duration::from_secs(1)));

    now.set(t(2));
    assert_eq!(drain(&service), vec![(a, 1)]);
}

#[test]
fn periodic_catchup_delivers_once_with_elapsed_period_count() {
    let (service, _, now) = service();
    let a = service.add_timer(()).unwrap();
    service.set_timer(a, t(1), Duration::from_secs(1), true);

    // the process stalls past five periods
    now.set(MonoTime::new(5, 500_000_000));
    let fired = drain(&service);
    assert_eq!(fired, vec![(a, 5)], "one callback carrying every elapsed period");

    // phase is preserved: next expiry is t=6, not 6.5
    now.set(t(6));
    assert_eq!(drain(&service), vec![(a, 1)]);
}

#[test]
fn disabled_timer_accumulates_and_enable_delivers_the_count() {
    let (service, _, now) = service();
    let a = service.add_timer(()).unwrap();
    service.set_timer(a, t(1), Duration::from_secs(1), false);

    now.set(t(1));
    assert_eq!(drain(&service), vec![], "disabled timers never call back");
    now.set(t(2));
    assert_eq!(drain(&service), vec![]);
    now.set(t(3));
    assert_eq!(drain(&service), vec![]);

    // enabling delivers the accumulated count exactly once and zeroes it
    let mut delivered = Vec::new();
    service.enable_timer(a, true, |id, count| delivered.push((id, count)));
    assert_eq!(delivered, vec![(a, 3)]);

    delivered.clear();
    service.enable_timer(a, true, |id, count| delivered.push((id, count)));
    assert_eq!(delivered, vec![], "the counter was reset by the first delivery");
}

#[test]
fn disabled_one_shot_accumulates_a_single_expiry() {
    let (service, calls, now) = service();
    let a = service.add_timer(()).unwrap();
    service.set_timer(a, t(1), Duration::ZERO, false);

    now.set(t(4));
    assert_eq!(drain(&service), vec![]);
    assert_eq!(last(&calls), AlarmCall::Disarm, "a drained one-shot leaves the queue");

    let mut delivered = Vec::new();
    service.enable_timer(a, true, |id, count| delivered.push((id, count)));
    assert_eq!(delivered, vec![(a, 1)]);
}

#[test]
fn set_timer_resets_the_accumulated_count() {
    let (service, _, now) = service();
    let a = service.add_timer(()).unwrap();
    service.set_timer(a, t(1), Duration::from_secs(1), false);

    now.set(t(2));
    assert_eq!(drain(&service), vec![]);

    // rescheduling forgets the missed deliveries
    service.set_timer(a, t(5), Duration::ZERO, true);
    let mut delivered = Vec::new();
    service.enable_timer(a, true, |id, count| delivered.push((id, count)));
    assert_eq!(delivered, vec![]);
}

#[test]
fn set_timer_rel_schedules_from_now() {
    let (service, calls, now) = service();
    let a = service.add_timer(()).unwrap();
    now.set(t(10));
    service.set_timer_rel(a, Duration::from_secs(3), Duration::ZERO, true);
    assert_eq!(last(&calls), AlarmCall::Arm(Duration::from_secs(3)));

    now.set(t(13));
    assert_eq!(drain(&service), vec![(a, 1)]);
}

#[test]
fn overdue_root_arms_the_shortest_one_shot() {
    let (service, calls, now) = service();
    let a = service.add_timer(()).unwrap();
    now.set(t(10));
    // scheduling into the past must not disarm; it arms the minimum delta
    service.set_timer(a, t(1), Duration::ZERO, true);
    assert_eq!(last(&calls), AlarmCall::Arm(Duration::from_nanos(1)));
}

#[derive(Default)]
struct MockReactor {
    signal_watches: Vec<Signo>,
}

impl Reactor for MockReactor {
    type Watch = NoWatch;

    fn add_signal_watch(&mut self, signo: Signo) -> std::io::Result<()> {
        self.signal_watches.push(signo);
        Ok(())
    }

    fn add_fd_watch(
        &mut self,
        _fd: std::os::fd::BorrowedFd<'_>,
        _interest: Interest,
    ) -> std::io::Result<NoWatch> {
        Ok(NoWatch)
    }
}

struct NoWatch;

impl WatchControl for NoWatch {
    fn set_watches(&mut self, _interest: Interest) {}
}

#[test]
fn init_unblocks_then_registers_the_alarm_signal() {
    let (service, _, _) = service();
    let mut reactor = MockReactor::default();
    service.init(&mut reactor).unwrap();
    assert_eq!(reactor.signal_watches, vec![ALARM_SIGNO]);
}

struct Recording<'a>(&'a mut Vec<Signo>);

impl SignalSink for Recording<'_> {
    fn receive_signal(&mut self, signo: Signo) -> Rearm {
        self.0.push(signo);
        Rearm::Keep
    }
}

#[test]
fn alarm_sink_owns_its_signal_and_chains_the_rest() {
    let (service, _, now) = service();
    let a = service.add_timer(()).unwrap();
    service.set_timer(a, t(1), Duration::ZERO, true);
    now.set(t(1));

    let mut fired = Vec::new();
    let mut passed = Vec::new();
    {
        let mut sink = AlarmSink::new(
            &service,
            |id, count| fired.push((id, count)),
            Recording(&mut passed),
        );
        assert_eq!(sink.receive_signal(ALARM_SIGNO + 1), Rearm::Keep);
        assert_eq!(sink.receive_signal(ALARM_SIGNO), Rearm::Keep);
    }
    assert_eq!(fired, vec![(a, 1)]);
    assert_eq!(passed, vec![ALARM_SIGNO + 1]);
}

#[test]
fn guard_surface_batches_under_one_acquisition() {
    let (service, calls, _) = service();
    let a = service.add_timer(()).unwrap();
    let b = service.add_timer(()).unwrap();
    {
        let mut mux = service.lock();
        mux.set_timer(a, t(4), Duration::ZERO, true);
        mux.set_timer(b, t(2), Duration::ZERO, true);
        mux.stop_timer(b);
    }
    assert_eq!(last(&calls), AlarmCall::Arm(Duration::from_secs(4)));
}
