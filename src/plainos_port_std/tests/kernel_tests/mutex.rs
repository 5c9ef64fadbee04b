//! Mutexes.
use plainos_kernel::{Mutex, PollError};

use crate::{boot, Trace, STACK_SIZE};

#[test]
fn contended_lock_is_handed_over() {
    let sys = boot();
    let trace = Trace::default();

    let mutex = sys
        .interrupt(|k| {
            let mutex = Mutex::new(k).unwrap();

            let trace1 = trace.clone();
            k.create_task("holder", 10, STACK_SIZE, move || {
                mutex.lock().unwrap();
                trace1.push("holder: locked");
                k.delay_ticks(2).unwrap();
                trace1.push("holder: unlocking");
                mutex.unlock().unwrap();
                0
            })
            .unwrap();

            let trace2 = trace.clone();
            k.create_task("contender", 10, STACK_SIZE, move || {
                assert_eq!(mutex.try_lock(), Err(PollError::Busy));
                mutex.lock().unwrap();
                trace2.push("contender: locked");
                mutex.unlock().unwrap();
                0
            })
            .unwrap();
            mutex
        })
        .unwrap();
    sys.settle().unwrap();

    assert_eq!(trace.take(), ["holder: locked"]);
    sys.interrupt(|_| assert!(mutex.is_locked().unwrap())).unwrap();

    sys.ticks(2).unwrap();
    assert_eq!(trace.take(), ["holder: unlocking", "contender: locked"]);
    sys.interrupt(|_| {
        assert!(!mutex.is_locked().unwrap());
        mutex.delete().unwrap();
    })
    .unwrap();
}

#[test]
fn unlocking_an_unlocked_mutex_does_nothing() {
    let sys = boot();
    sys.interrupt(|k| {
        let mutex = Mutex::new(k).unwrap();
        mutex.unlock().unwrap();
        mutex.unlock().unwrap();
        assert_eq!(mutex.try_lock(), Ok(()));
        assert_eq!(mutex.try_lock(), Err(PollError::Busy));
        mutex.unlock().unwrap();
        assert!(!mutex.is_locked().unwrap());
    })
    .unwrap();
}
