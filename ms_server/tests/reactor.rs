use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use ms_server::reactor::{
    Control, FileHandler, Interest, Reactor, ReactorConfig, ReadyEvent, TimerHandler, TimerId,
};
use ms_server::testing::{mock_reactor, MockClock, MockPoller};
use ms_server::Error;

/// Appends a line per callback to a shared journal.
#[derive(Default)]
struct Journal {
    entries: RefCell<Vec<String>>,
}

impl Journal {
    fn push(&self, entry: String) {
        self.entries.borrow_mut().push(entry);
    }

    fn take(&self) -> Vec<String> {
        self.entries.take()
    }
}

struct Recorder {
    journal: Rc<Journal>,
}

impl FileHandler<()> for Recorder {
    fn on_readable(self: Rc<Self>, _: &mut Reactor<()>, fd: RawFd, _: Interest) {
        self.journal.push(format!("read {fd}"));
    }

    fn on_writable(self: Rc<Self>, _: &mut Reactor<()>, fd: RawFd, _: Interest) {
        self.journal.push(format!("write {fd}"));
    }
}

impl TimerHandler<()> for Recorder {
    fn on_timeout(self: Rc<Self>, reactor: &mut Reactor<()>, _: TimerId, data: usize) {
        self.journal
            .push(format!("timer {data} at {}", reactor.now_ms()));
    }
}

fn setup() -> (Reactor<()>, MockPoller, MockClock, Rc<Journal>, Rc<Recorder>) {
    let config = ReactorConfig {
        capacity: 16,
        ..ReactorConfig::default()
    };
    let (reactor, poller, clock) = mock_reactor(config, |_| ()).unwrap();
    let journal = Rc::new(Journal::default());
    let recorder = Rc::new(Recorder {
        journal: journal.clone(),
    });
    (reactor, poller, clock, journal, recorder)
}

#[test]
fn timer_fires_once_after_its_deadline() {
    let (mut reactor, _poller, clock, journal, recorder) = setup();
    reactor.add_timer(50, recorder, 7).unwrap();

    clock.set(49);
    reactor.turn(Some(Duration::ZERO));
    assert!(journal.take().is_empty());
    assert_eq!(reactor.timer_count(), 1);

    clock.set(51);
    reactor.turn(Some(Duration::ZERO));
    assert_eq!(journal.take(), ["timer 7 at 51"]);
    assert_eq!(reactor.timer_count(), 0);

    reactor.turn(Some(Duration::ZERO));
    assert!(journal.take().is_empty());
}

#[test]
fn wait_is_bounded_by_the_earliest_deadline() {
    let (mut reactor, poller, _clock, journal, recorder) = setup();
    reactor.add_timer(50, recorder, 1).unwrap();

    reactor.turn(Some(Duration::from_millis(20)));
    reactor.turn(Some(Duration::from_millis(20)));
    reactor.turn(Some(Duration::from_millis(20)));

    assert_eq!(
        poller.waits(),
        [
            Some(Duration::from_millis(20)),
            Some(Duration::from_millis(20)),
            Some(Duration::from_millis(10)),
        ]
    );
    assert_eq!(journal.take(), ["timer 1 at 50"]);
}

#[test]
fn elapsed_timer_forces_a_zero_wait() {
    let (mut reactor, poller, clock, journal, recorder) = setup();
    reactor.add_timer(10, recorder, 3).unwrap();
    clock.set(25);

    reactor.turn(None);
    assert_eq!(poller.waits(), [Some(Duration::ZERO)]);
    assert_eq!(journal.take(), ["timer 3 at 25"]);
}

#[test]
fn no_timers_and_no_bound_blocks_indefinitely() {
    let (mut reactor, poller, ..) = setup();
    reactor.turn(None);
    assert_eq!(poller.waits(), [None]);
}

#[test]
fn io_is_dispatched_before_timers() {
    let (mut reactor, poller, _clock, journal, recorder) = setup();
    reactor
        .register_interest(4, Interest::READABLE, recorder.clone())
        .unwrap();
    reactor.add_timer(0, recorder, 9).unwrap();
    poller.ready(4, Interest::READABLE);

    reactor.turn(None);
    assert_eq!(journal.take(), ["read 4", "timer 9 at 0"]);
}

#[test]
fn readiness_outside_the_interest_mask_is_ignored() {
    let (mut reactor, poller, _clock, journal, recorder) = setup();
    reactor
        .register_interest(5, Interest::READABLE, recorder)
        .unwrap();
    poller.ready(5, Interest::both());

    reactor.turn(Some(Duration::ZERO));
    assert_eq!(journal.take(), ["read 5"]);
}

#[test]
fn registration_follows_add_modify_delete() {
    let (mut reactor, poller, _clock, _journal, recorder) = setup();
    reactor
        .register_interest(6, Interest::READABLE, recorder.clone())
        .unwrap();
    reactor
        .register_interest(6, Interest::WRITABLE, recorder)
        .unwrap();
    assert_eq!(reactor.interest(6), Interest::both());

    reactor.unregister_interest(6, Interest::READABLE);
    assert_eq!(reactor.interest(6), Interest::WRITABLE);
    reactor.unregister_interest(6, Interest::WRITABLE);
    assert!(reactor.interest(6).is_empty());

    assert_eq!(
        poller.calls(),
        [
            (Control::Add, 6, Interest::READABLE),
            (Control::Modify, 6, Interest::both()),
            (Control::Modify, 6, Interest::WRITABLE),
            (Control::Delete, 6, Interest::empty()),
        ]
    );
    assert_eq!(poller.registered(6), None);
}

#[test]
fn unregistering_an_idle_descriptor_is_a_no_op() {
    let (mut reactor, poller, ..) = setup();
    reactor.unregister_interest(3, Interest::both());
    reactor.unregister_interest(1000, Interest::both());
    assert!(poller.calls().is_empty());
}

#[test]
fn out_of_range_descriptor_is_refused() {
    let (mut reactor, poller, _clock, _journal, recorder) = setup();
    let err = reactor
        .register_interest(16, Interest::READABLE, recorder)
        .unwrap_err();
    assert!(matches!(err, Error::DescriptorOutOfRange { fd: 16, capacity: 16 }));
    assert!(poller.calls().is_empty());
}

#[test]
fn failed_control_leaves_the_slot_untouched() {
    let (mut reactor, poller, _clock, _journal, recorder) = setup();
    poller.fail_next_control(std::io::ErrorKind::PermissionDenied);
    let err = reactor
        .register_interest(2, Interest::READABLE, recorder)
        .unwrap_err();
    assert!(matches!(err, Error::Control { op: "add", fd: 2, .. }));
    assert!(reactor.interest(2).is_empty());
}

/// Drops its own write interest from the read callback.
struct Retracting {
    journal: Rc<Journal>,
}

impl FileHandler<()> for Retracting {
    fn on_readable(self: Rc<Self>, reactor: &mut Reactor<()>, fd: RawFd, _: Interest) {
        self.journal.push(format!("read {fd}"));
        reactor.unregister_interest(fd, Interest::WRITABLE);
    }

    fn on_writable(self: Rc<Self>, _: &mut Reactor<()>, fd: RawFd, _: Interest) {
        self.journal.push(format!("write {fd}"));
    }
}

#[test]
fn write_callback_sees_changes_made_by_the_read_callback() {
    let (mut reactor, poller, _clock, journal, _recorder) = setup();
    let handler = Rc::new(Retracting {
        journal: journal.clone(),
    });
    reactor
        .register_interest(7, Interest::both(), handler)
        .unwrap();
    poller.push_ready(vec![ReadyEvent {
        fd: 7,
        ready: Interest::both(),
    }]);

    reactor.turn(Some(Duration::ZERO));
    assert_eq!(journal.take(), ["read 7"]);
}

#[test]
fn cancelled_timer_never_fires() {
    let (mut reactor, _poller, clock, journal, recorder) = setup();
    let id = reactor.add_timer(5, recorder, 1).unwrap();
    assert!(reactor.cancel_timer(id));
    assert!(!reactor.cancel_timer(id));

    clock.set(100);
    reactor.turn(Some(Duration::ZERO));
    assert!(journal.take().is_empty());
}

#[test]
fn expired_timers_beyond_the_cap_are_deferred() {
    let (mut reactor, _poller, _clock, journal, recorder) = setup();
    reactor.set_max_timers_per_tick(2);
    for data in 0..5 {
        reactor.add_timer(0, recorder.clone(), data).unwrap();
    }

    reactor.turn(Some(Duration::ZERO));
    assert_eq!(journal.take().len(), 2);
    assert_eq!(reactor.timer_count(), 3);

    reactor.turn(Some(Duration::ZERO));
    reactor.turn(Some(Duration::ZERO));
    assert_eq!(journal.take().len(), 3);
    assert_eq!(reactor.timer_count(), 0);
}

/// Re-arms itself a fixed number of times.
struct Rearming {
    remaining: RefCell<usize>,
    journal: Rc<Journal>,
}

impl TimerHandler<()> for Rearming {
    fn on_timeout(self: Rc<Self>, reactor: &mut Reactor<()>, _: TimerId, _: usize) {
        self.journal.push(format!("tick at {}", reactor.now_ms()));
        let left = {
            let mut remaining = self.remaining.borrow_mut();
            *remaining -= 1;
            *remaining
        };
        if left > 0 {
            reactor.add_timer(10, self.clone(), 0).unwrap();
        }
    }
}

#[test]
fn timer_callback_can_rearm() {
    let (mut reactor, ..) = setup();
    let journal = Rc::new(Journal::default());
    let handler = Rc::new(Rearming {
        remaining: RefCell::new(3),
        journal: journal.clone(),
    });
    reactor.add_timer(10, handler, 0).unwrap();

    for _ in 0..5 {
        reactor.turn(None);
    }
    assert_eq!(journal.take(), ["tick at 10", "tick at 20", "tick at 30"]);
}

/// Stops the loop on the first readable event.
struct Stopper;

impl FileHandler<()> for Stopper {
    fn on_readable(self: Rc<Self>, reactor: &mut Reactor<()>, _: RawFd, _: Interest) {
        reactor.stop();
    }
}

#[test]
fn run_returns_after_stop() {
    let (mut reactor, poller, ..) = setup();
    reactor
        .register_interest(1, Interest::READABLE, Rc::new(Stopper))
        .unwrap();
    poller.push_ready(Vec::new());
    poller.ready(1, Interest::READABLE);

    reactor.run(Some(Duration::from_millis(5)));
    assert!(reactor.is_stopped());
    assert_eq!(poller.waits().len(), 2);
}

/// Stops the loop when its timer fires.
struct StopOnTimeout {
    journal: Rc<Journal>,
}

impl TimerHandler<()> for StopOnTimeout {
    fn on_timeout(self: Rc<Self>, reactor: &mut Reactor<()>, _: TimerId, _: usize) {
        self.journal.push(format!("stop at {}", reactor.now_ms()));
        reactor.stop();
    }
}

#[test]
fn failed_wait_still_expires_due_timers() {
    let (mut reactor, poller, _clock, journal, recorder) = setup();
    reactor.add_timer(0, recorder, 4).unwrap();
    poller.fail_waits(1);

    assert_eq!(reactor.turn(None), 0);
    assert_eq!(journal.take(), ["timer 4 at 0"]);
    assert_eq!(reactor.timer_count(), 0);
}

#[test]
fn run_survives_a_failed_wait() {
    let (mut reactor, poller, _clock, journal, _recorder) = setup();
    let handler = Rc::new(StopOnTimeout {
        journal: journal.clone(),
    });
    reactor.add_timer(0, handler, 0).unwrap();
    poller.fail_waits(1);

    reactor.run(Some(Duration::from_millis(10)));
    assert_eq!(journal.take(), ["stop at 0"]);
    assert_eq!(poller.waits().len(), 1);
}

#[test]
fn loop_keeps_going_after_a_failed_wait() {
    let (mut reactor, poller, _clock, journal, _recorder) = setup();
    let handler = Rc::new(StopOnTimeout {
        journal: journal.clone(),
    });
    reactor.add_timer(30, handler, 0).unwrap();
    poller.fail_waits(1);

    reactor.run(Some(Duration::from_millis(10)));
    assert_eq!(journal.take(), ["stop at 30"]);
    assert_eq!(poller.waits().len(), 4);
}

#[test]
fn timers_fire_across_clock_wraparound() {
    let (mut reactor, poller, clock, journal, recorder) = setup();
    let start = u64::MAX - 10;
    clock.set(start);
    reactor.add_timer(20, recorder.clone(), 5).unwrap();
    reactor.add_timer(5, recorder, 6).unwrap();
    assert_eq!(reactor.next_deadline(), Some(u64::MAX - 5));

    reactor.turn(Some(Duration::ZERO));
    assert!(journal.take().is_empty());

    reactor.turn(None);
    assert_eq!(journal.take(), [format!("timer 6 at {}", u64::MAX - 5)]);
    assert_eq!(reactor.next_deadline(), Some(9));

    reactor.turn(None);
    assert_eq!(journal.take(), ["timer 5 at 9"]);
    assert_eq!(
        poller.waits(),
        [
            Some(Duration::ZERO),
            Some(Duration::from_millis(5)),
            Some(Duration::from_millis(15)),
        ]
    );
    assert_eq!(reactor.timer_count(), 0);
}

#[test]
fn timers_do_not_draw_on_the_payload_arena() {
    let config = ReactorConfig {
        capacity: 8,
        payload_size: 64,
        ..ReactorConfig::default()
    };
    let (mut reactor, ..) = mock_reactor(config, |_| ()).unwrap();
    let before = reactor.arena_stats();
    assert_eq!(before.small_used, 8 * 64);
    assert_eq!(before.large_blocks, 0);

    let recorder = Rc::new(Recorder {
        journal: Rc::new(Journal::default()),
    });
    for data in 0..16 {
        reactor.add_timer(100, recorder.clone(), data).unwrap();
    }
    assert_eq!(reactor.timer_count(), 16);
    assert_eq!(reactor.arena_stats(), before);
}

#[test]
fn slot_payloads_are_zeroed_and_disjoint() {
    let config = ReactorConfig {
        capacity: 4,
        payload_size: 32,
        ..ReactorConfig::default()
    };
    let (mut reactor, ..) = mock_reactor(config, |fd| fd).unwrap();

    for fd in 0..4 {
        let (tag, region) = reactor.payload_mut(fd).unwrap();
        assert_eq!(*tag, fd);
        assert_eq!(region.len(), 32);
        assert!(region.iter().all(|&b| b == 0));
        region.fill(fd as u8 + 1);
    }
    for fd in 0..4 {
        let (_, region) = reactor.payload_mut(fd).unwrap();
        assert!(region.iter().all(|&b| b == fd as u8 + 1));
    }
    assert!(reactor.payload_mut(4).is_none());
}
