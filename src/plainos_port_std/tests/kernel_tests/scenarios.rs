//! End-to-end scenarios exercising the scheduler, timers, workqueues, joins,
//! and stack overflow detection together.
use assert_matches::assert_matches;
use once_cell::sync::OnceCell;
use plainos_kernel::{AddWorkError, SoftTimer, Task, TaskState, Work, Workqueue};
use plainos_port_std::{clobber_stack_canary, StdPort, SystemHalted};
use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    Arc,
};

use crate::{boot, Trace, STACK_SIZE};

#[test]
fn pend_resume_ping_pong() {
    let sys = boot();
    let counter = Arc::new(AtomicUsize::new(0));
    let trace = Trace::default();
    let pong: Arc<OnceCell<Task<StdPort>>> = Arc::new(OnceCell::new());

    let (ping, pong) = sys
        .interrupt(|k| {
            let ping = k
                .create_task("ping", 5, STACK_SIZE, {
                    let (counter, trace, pong) = (counter.clone(), trace.clone(), pong.clone());
                    move || {
                        for _ in 0..10 {
                            counter.fetch_add(1, Ordering::Relaxed);
                            trace.push("ping");
                            k.delay_ticks(0).unwrap();
                            pong.get().unwrap().resume().unwrap();
                            k.current_task().unwrap().pend().unwrap();
                        }
                        0
                    }
                })
                .unwrap();
            let pong_task = k
                .create_task("pong", 5, STACK_SIZE, {
                    let (counter, trace) = (counter.clone(), trace.clone());
                    move || {
                        for _ in 0..10 {
                            counter.fetch_add(1, Ordering::Relaxed);
                            trace.push("pong");
                            ping.resume().unwrap();
                            k.current_task().unwrap().pend().unwrap();
                        }
                        0
                    }
                })
                .unwrap();
            pong.set(pong_task).unwrap();
            (ping, pong_task)
        })
        .unwrap();
    sys.settle().unwrap();

    assert_eq!(counter.load(Ordering::Relaxed), 20);
    let events = trace.take();
    assert_eq!(events.len(), 20);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(*event, if i % 2 == 0 { "ping" } else { "pong" }, "{events:?}");
    }

    // `ping` has exited and been reclaimed; `pong` is waiting for its last
    // resumption
    sys.interrupt(|_| {
        assert!(ping.state().is_err());
        assert_eq!(pong.state().unwrap(), TaskState::Pending);
        pong.resume().unwrap();
    })
    .unwrap();
    sys.settle().unwrap();
    sys.interrupt(|_| assert!(pong.state().is_err())).unwrap();
}

#[test]
fn one_shot_timer_fires_on_its_deadline() {
    let sys = boot();
    let fired = Arc::new(AtomicUsize::new(0));

    let timer = sys
        .interrupt(|k| {
            assert_eq!(k.systicks().unwrap(), 0);
            let timer = SoftTimer::request(k, "oneshot").unwrap();
            let fired = fired.clone();
            timer
                .init(
                    move || {
                        fired.fetch_add(1, Ordering::Relaxed);
                    },
                    50,
                )
                .unwrap();
            timer.start().unwrap();
            timer
        })
        .unwrap();

    sys.ticks(49).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 0);
    let snapshot = sys.interrupt(|k| k.snapshot().unwrap()).unwrap();
    assert_eq!(snapshot.timers, [(timer.id(), 50)]);

    sys.ticks(1).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    sys.interrupt(|k| {
        assert_eq!(k.systicks().unwrap(), 50);
        assert!(!timer.is_armed().unwrap());
        assert!(k.snapshot().unwrap().timers.is_empty());
    })
    .unwrap();

    sys.ticks(10).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn workqueue_keeps_one_slot_free() {
    let sys = boot();
    let trace = Trace::default();

    let wq = sys
        .interrupt(|k| {
            let wq = Workqueue::create(k, "wq", 10, STACK_SIZE, 4).unwrap();
            wq.executor().unwrap().pend().unwrap();

            let work = |name: &'static str| {
                let trace = trace.clone();
                Work::new(move || trace.push(name))
            };
            wq.add(&work("w1")).unwrap();
            wq.add(&work("w2")).unwrap();
            wq.add(&work("w3")).unwrap();
            assert_eq!(wq.add(&work("w4")), Err(AddWorkError::Full));
            assert_eq!(wq.len().unwrap(), 3);
            wq
        })
        .unwrap();
    sys.settle().unwrap();

    assert_eq!(trace.take(), ["w1", "w2", "w3"]);
    sys.interrupt(|_| assert_eq!(wq.len().unwrap(), 0)).unwrap();
}

#[test]
fn join_before_the_target_runs() {
    let sys = boot();
    let joined = Arc::new(AtomicI32::new(0));

    sys.interrupt(|k| {
        let joined = joined.clone();
        k.create_task("joiner", 5, STACK_SIZE, move || {
            let target = k.create_task("target", 10, STACK_SIZE, || 42).unwrap();
            assert_eq!(target.state().unwrap(), TaskState::Ready);
            joined.store(target.join().unwrap(), Ordering::Relaxed);
            0
        })
        .unwrap();
    })
    .unwrap();
    sys.settle().unwrap();

    assert_eq!(joined.load(Ordering::Relaxed), 42);
}

#[test]
fn stack_overflow_halts_the_system() {
    let sys = boot();
    let survived = Arc::new(AtomicBool::new(false));

    sys.interrupt(|k| {
        let survived = survived.clone();
        k.create_task("overflow", 10, STACK_SIZE, move || {
            clobber_stack_canary();
            // The canary is checked when this task is switched out
            let _ = k.delay_ticks(1);
            survived.store(true, Ordering::Relaxed);
            0
        })
        .unwrap();
    })
    .unwrap();

    assert_matches!(sys.settle(), Err(SystemHalted));
    assert!(sys.is_halted());
    assert!(!survived.load(Ordering::Relaxed));
    assert_matches!(sys.tick(), Err(SystemHalted));
    assert_matches!(sys.interrupt(|k| k.systicks()), Err(SystemHalted));
}
