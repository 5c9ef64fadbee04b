//! Completions.
use plainos_kernel::{Completion, PollError};

use crate::{boot, Trace, STACK_SIZE};

#[test]
fn post_without_waiters_is_latched() {
    let sys = boot();
    let trace = Trace::default();

    let done = sys.interrupt(|k| {
        let done = Completion::new(k).unwrap();
        assert_eq!(done.try_wait(), Err(PollError::Busy));
        done.post().unwrap();
        done.post().unwrap();
        assert!(done.is_done().unwrap());
        done
    })
    .unwrap();

    sys.interrupt(|k| {
        let trace = trace.clone();
        k.create_task("consumer", 10, STACK_SIZE, move || {
            // Consumes the latched post without blocking
            done.wait().unwrap();
            trace.push("consumed");
            done.wait().unwrap();
            trace.push("posted again");
            0
        })
        .unwrap();
    })
    .unwrap();
    sys.settle().unwrap();
    assert_eq!(trace.take(), ["consumed"]);

    sys.interrupt(|_| {
        assert!(!done.is_done().unwrap());
        done.post().unwrap();
        // Handed to the waiter instead of being latched
        assert!(!done.is_done().unwrap());
    })
    .unwrap();
    sys.settle().unwrap();
    assert_eq!(trace.take(), ["posted again"]);
}

#[test]
fn post_all_wakes_every_waiter() {
    let sys = boot();
    let trace = Trace::default();

    let done = sys
        .interrupt(|k| {
            let done = Completion::new(k).unwrap();
            for name in ["w1", "w2", "w3"] {
                let trace = trace.clone();
                k.create_task(name, 10, STACK_SIZE, move || {
                    done.wait().unwrap();
                    trace.push(name);
                    0
                })
                .unwrap();
            }
            done
        })
        .unwrap();
    sys.settle().unwrap();
    assert!(trace.take().is_empty());

    sys.interrupt(|_| {
        done.post_all().unwrap();
        assert!(!done.is_done().unwrap());
    })
    .unwrap();
    sys.settle().unwrap();

    assert_eq!(trace.take(), ["w1", "w2", "w3"]);
    sys.interrupt(|_| done.delete().unwrap()).unwrap();
}
