//! Timer queue and cross-thread wake-up behavior.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use net_reactor::Reactor;

#[test]
fn timer_fires_near_its_deadline() {
    let mut reactor = Reactor::new().unwrap();
    let waker = reactor.waker().unwrap();

    let fired_at = Rc::new(RefCell::new(None::<Duration>));
    let fired_at_cb = fired_at.clone();
    let start = Instant::now();

    reactor.schedule(50, move |_, scheduled| {
        assert_eq!(scheduled, 50);
        *fired_at_cb.borrow_mut() = Some(start.elapsed());
        waker.wake().unwrap();
    });

    reactor.run().unwrap();

    let elapsed = fired_at.borrow().expect("timer fired");
    assert!(elapsed >= Duration::from_millis(47), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");
    assert_eq!(reactor.timer_count(), 0);
}

#[test]
fn near_coincident_timers_fire_together() {
    let mut reactor = Reactor::new().unwrap();
    let waker = Rc::new(reactor.waker().unwrap());

    let order = Rc::new(RefCell::new(Vec::<u64>::new()));
    for delay in [51u64, 50, 300] {
        let order = order.clone();
        let waker = waker.clone();
        reactor.schedule(delay, move |_, scheduled| {
            order.borrow_mut().push(scheduled);
            if order.borrow().len() == 2 {
                waker.wake().unwrap();
            }
        });
    }

    reactor.run().unwrap();

    // The 50/51 pair is inside the coincidence band and fires in heap
    // order; the 300ms timer stays queued.
    assert_eq!(*order.borrow(), vec![50, 51]);
    assert_eq!(reactor.timer_count(), 1);
}

#[test]
fn staggered_timers_keep_their_own_deadlines() {
    let mut reactor = Reactor::new().unwrap();
    let waker = reactor.waker().unwrap();

    let marks = Rc::new(RefCell::new(Vec::<(u64, Duration)>::new()));
    let start = Instant::now();

    let marks_a = marks.clone();
    reactor.schedule(20, move |_, scheduled| {
        marks_a.borrow_mut().push((scheduled, start.elapsed()));
    });
    let marks_b = marks.clone();
    reactor.schedule(120, move |_, scheduled| {
        marks_b.borrow_mut().push((scheduled, start.elapsed()));
        waker.wake().unwrap();
    });

    reactor.run().unwrap();

    let marks = marks.borrow();
    assert_eq!(marks.len(), 2);
    let (first, at_first) = marks[0];
    let (second, at_second) = marks[1];
    assert_eq!(first, 20);
    assert_eq!(second, 120);
    assert!(at_first >= Duration::from_millis(17), "{at_first:?}");
    assert!(at_first < Duration::from_millis(110), "{at_first:?}");
    // The long timer is measured from its scheduling instant, not from the
    // short timer's firing.
    assert!(at_second >= Duration::from_millis(115), "{at_second:?}");
    assert!(at_second < Duration::from_millis(600), "{at_second:?}");
}

#[test]
fn timer_reschedules_from_its_own_callback() {
    let mut reactor = Reactor::new().unwrap();
    let waker = Rc::new(reactor.waker().unwrap());

    fn tick(reactor: &mut Reactor, remaining: u32, count: Rc<RefCell<u32>>, waker: Rc<net_reactor::Waker>) {
        reactor.schedule(10, move |reactor, _| {
            *count.borrow_mut() += 1;
            if remaining == 1 {
                waker.wake().unwrap();
            } else {
                tick(reactor, remaining - 1, count, waker);
            }
        });
    }

    let count = Rc::new(RefCell::new(0u32));
    tick(&mut reactor, 3, count.clone(), waker);

    reactor.run().unwrap();
    assert_eq!(*count.borrow(), 3);
}

#[test]
fn wake_interrupts_idle_reactor() {
    let mut reactor = Reactor::new().unwrap();

    // A long timer at the head of the queue must not delay the wake-up and
    // must survive it.
    reactor.schedule(60_000, |_, _| panic!("60s timer must not fire"));

    let waker = reactor.waker().unwrap();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        waker.wake().unwrap();
    });

    let start = Instant::now();
    reactor.run().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(reactor.timer_count(), 1);
    handle.join().unwrap();
}

#[test]
fn consecutive_runs_each_need_their_own_wake() {
    let mut reactor = Reactor::new().unwrap();

    for _ in 0..2 {
        let waker = reactor.waker().unwrap();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });
        reactor.run().unwrap();
        handle.join().unwrap();
    }
}
