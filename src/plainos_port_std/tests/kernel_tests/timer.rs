//! Software timers.
use once_cell::sync::OnceCell;
use plainos_kernel::{
    CancelTimerError, InitTimerError, PortToKernel, QueryObjectError, SoftTimer, StartTimerError,
};
use plainos_port_std::StdPort;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::{boot, Trace};

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    (count, move || {
        count2.fetch_add(1, Ordering::Relaxed);
    })
}

#[test]
fn state_errors() {
    let sys = boot();
    let (count, fun) = counter();

    sys.interrupt(|k| {
        let timer = SoftTimer::request(k, "t").unwrap();
        assert_eq!(timer.start(), Err(StartTimerError::BadObjectState));
        assert_eq!(timer.cancel(), Err(CancelTimerError::Empty));

        timer.init(fun, 5).unwrap();
        timer.start().unwrap();
        assert_eq!(timer.start(), Err(StartTimerError::Busy));
        assert_eq!(timer.init(|| {}, 1), Err(InitTimerError::Busy));
        assert_eq!(timer.deadline().unwrap(), Some(5));

        timer.cancel().unwrap();
        assert!(!timer.is_armed().unwrap());
        assert_eq!(timer.deadline().unwrap(), None);
        // The callback was detached
        assert_eq!(timer.start(), Err(StartTimerError::BadObjectState));

        timer.release().unwrap();
        assert_eq!(timer.is_armed(), Err(QueryObjectError::BadId));
    })
    .unwrap();

    sys.ticks(10).unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 0);
}

#[test]
fn one_shot_timer_needs_a_new_callback_after_firing() {
    let sys = boot();
    let (count, fun) = counter();

    let timer = sys
        .interrupt(|k| {
            let timer = SoftTimer::request(k, "t").unwrap();
            timer.init(fun, 2).unwrap();
            timer.start().unwrap();
            timer
        })
        .unwrap();
    sys.ticks(2).unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 1);

    sys.interrupt(|_| {
        assert_eq!(timer.start(), Err(StartTimerError::BadObjectState));
        let count = count.clone();
        timer
            .init(
                move || {
                    count.fetch_add(10, Ordering::Relaxed);
                },
                3,
            )
            .unwrap();
        timer.start().unwrap();
    })
    .unwrap();
    sys.ticks(3).unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 11);
}

#[test]
fn periodic_timer_reloads() {
    let sys = boot();
    let (count, fun) = counter();

    let timer = sys
        .interrupt(|k| {
            let timer = SoftTimer::request(k, "periodic").unwrap();
            timer.reload(true, fun, 3).unwrap();
            timer.start().unwrap();
            timer
        })
        .unwrap();

    sys.ticks(9).unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 3);
    sys.interrupt(|_| assert_eq!(timer.deadline().unwrap(), Some(12)))
        .unwrap();

    sys.interrupt(|_| timer.cancel().unwrap()).unwrap();
    sys.ticks(6).unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 3);
}

#[test]
fn cancelling_from_the_callback_stops_reloading() {
    let sys = boot();
    let count = Arc::new(AtomicUsize::new(0));
    let handle: Arc<OnceCell<SoftTimer<StdPort>>> = Arc::new(OnceCell::new());

    sys.interrupt(|k| {
        let timer = SoftTimer::request(k, "self_cancel").unwrap();
        let (count, handle) = (count.clone(), handle.clone());
        timer
            .reload(
                true,
                move || {
                    if count.fetch_add(1, Ordering::Relaxed) + 1 == 2 {
                        handle.get().unwrap().cancel().unwrap();
                    }
                },
                2,
            )
            .unwrap();
        timer.start().unwrap();
        timer
    })
    .map(|timer| handle.set(timer).unwrap())
    .unwrap();

    sys.ticks(10).unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 2);
    sys.interrupt(|_| assert!(!handle.get().unwrap().is_armed().unwrap()))
        .unwrap();
}

#[test]
fn cancelling_a_one_shot_timer_from_its_callback() {
    let sys = boot();
    let results = Arc::new(Mutex::new(Vec::new()));
    let handle: Arc<OnceCell<SoftTimer<StdPort>>> = Arc::new(OnceCell::new());

    sys.interrupt(|k| {
        let timer = SoftTimer::request(k, "one_shot").unwrap();
        let (results, handle) = (results.clone(), handle.clone());
        timer
            .init(
                move || {
                    let timer = handle.get().unwrap();
                    results.lock().unwrap().push(timer.cancel());
                    results.lock().unwrap().push(timer.cancel());
                },
                2,
            )
            .unwrap();
        timer.start().unwrap();
        timer
    })
    .map(|timer| handle.set(timer).unwrap())
    .unwrap();

    sys.ticks(4).unwrap();
    assert_eq!(
        *results.lock().unwrap(),
        [Err(CancelTimerError::Empty), Err(CancelTimerError::Empty)]
    );
    sys.interrupt(|_| {
        let timer = handle.get().unwrap();
        assert!(!timer.is_armed().unwrap());
        assert_eq!(timer.start(), Err(StartTimerError::BadObjectState));
    })
    .unwrap();
}

#[test]
fn cancelling_a_due_timer() {
    let sys = boot();
    let (count, fun) = counter();

    let timer = sys
        .interrupt(|k| {
            let timer = SoftTimer::request(k, "due").unwrap();
            timer.init(fun, 1).unwrap();
            timer.start().unwrap();
            timer
        })
        .unwrap();

    // Expire the timer and cancel it before the daemon gets to run
    sys.interrupt(|k| {
        k.systick_expiration();
        assert!(timer.is_armed().unwrap());
        assert_eq!(timer.deadline().unwrap(), Some(1));
        timer.cancel().unwrap();
        assert!(!timer.is_armed().unwrap());
        assert_eq!(timer.deadline().unwrap(), None);
        assert_eq!(timer.cancel(), Err(CancelTimerError::Empty));
    })
    .unwrap();
    sys.settle().unwrap();
    sys.ticks(3).unwrap();

    assert_eq!(count.load(Ordering::Relaxed), 0);
    sys.interrupt(|_| assert_eq!(timer.start(), Err(StartTimerError::BadObjectState)))
        .unwrap();
}

#[test]
fn timers_with_equal_deadlines_fire_in_start_order() {
    let sys = boot();
    let trace = Trace::default();

    let timers = sys
        .interrupt(|k| {
            let timers = [("t1", 4), ("t2", 2), ("t3", 4)].map(|(name, timing)| {
                let timer = SoftTimer::request(k, name).unwrap();
                let trace = trace.clone();
                timer.init(move || trace.push(name), timing).unwrap();
                timer.start().unwrap();
                timer
            });

            let armed: Vec<_> = k.snapshot().unwrap().timers;
            assert_eq!(
                armed,
                [(timers[1].id(), 2), (timers[0].id(), 4), (timers[2].id(), 4)]
            );
            timers
        })
        .unwrap();

    sys.ticks(4).unwrap();
    assert_eq!(trace.take(), ["t2", "t1", "t3"]);
    sys.interrupt(|_| {
        for timer in timers {
            assert!(!timer.is_armed().unwrap());
        }
    })
    .unwrap();
}
