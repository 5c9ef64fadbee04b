//! Counting semaphores.
use plainos_kernel::{
    CreateSemaphoreError, DeleteObjectError, PollError, QueryObjectError, ResultCode, Semaphore,
    SignalError, Task, WaitError,
};
use plainos_port_std::StdPort;

use crate::{boot, Trace, STACK_SIZE};

fn spawn_waiter(
    k: crate::K,
    sem: Semaphore<StdPort>,
    name: &'static str,
    trace: &Trace,
) -> Task<StdPort> {
    let trace = trace.clone();
    k.create_task(name, 10, STACK_SIZE, move || {
        sem.wait().unwrap();
        trace.push(name);
        0
    })
    .unwrap()
}

#[test]
fn initial_count_out_of_range() {
    let sys = boot();
    sys.interrupt(|k| {
        assert_eq!(
            Semaphore::new(k, usize::MAX).err(),
            Some(CreateSemaphoreError::BadParam)
        );
        assert_eq!(
            Semaphore::new(k, isize::MAX as usize + 1).err(),
            Some(CreateSemaphoreError::BadParam)
        );

        let sem = Semaphore::new(k, isize::MAX as usize).unwrap();
        assert_eq!(sem.value().unwrap(), isize::MAX);
        assert_eq!(sem.post(), Err(SignalError::Full));
        assert_eq!(sem.value().unwrap(), isize::MAX);
    })
    .unwrap();
}

#[test]
fn counts_without_waiters() {
    let sys = boot();
    sys.interrupt(|k| {
        let sem = Semaphore::new(k, 1).unwrap();
        assert_eq!(sem.try_wait(), Ok(()));
        assert_eq!(sem.try_wait(), Err(PollError::Busy));
        assert_eq!(sem.value().unwrap(), 0);

        sem.post().unwrap();
        sem.post().unwrap();
        assert_eq!(sem.value().unwrap(), 2);
        assert_eq!(sem.num_waiters().unwrap(), 0);

        // Blocking isn't allowed in an interrupt context
        assert_eq!(sem.wait(), Err(WaitError::BadContext));
        assert_eq!(sem.value().unwrap(), 2);
    })
    .unwrap();
}

#[test]
fn waiters_are_woken_in_fifo_order() {
    let sys = boot();
    let trace = Trace::default();

    let sem = sys
        .interrupt(|k| {
            let sem = Semaphore::new(k, 0).unwrap();
            for name in ["a", "b", "c"] {
                spawn_waiter(k, sem, name, &trace);
            }
            sem
        })
        .unwrap();
    sys.settle().unwrap();

    sys.interrupt(|_| {
        assert_eq!(sem.value().unwrap(), -3);
        assert_eq!(sem.num_waiters().unwrap(), 3);
        sem.post().unwrap();
        sem.post().unwrap();
    })
    .unwrap();
    sys.settle().unwrap();
    assert_eq!(trace.take(), ["a", "b"]);

    sys.interrupt(|_| {
        assert_eq!(sem.value().unwrap(), -1);
        sem.post().unwrap();
    })
    .unwrap();
    sys.settle().unwrap();
    assert_eq!(trace.take(), ["c"]);
    sys.interrupt(|_| assert_eq!(sem.value().unwrap(), 0)).unwrap();
}

#[test]
fn killing_a_waiter_gives_its_unit_back() {
    let sys = boot();
    let trace = Trace::default();

    let (sem, first) = sys
        .interrupt(|k| {
            let sem = Semaphore::new(k, 0).unwrap();
            let first = spawn_waiter(k, sem, "first", &trace);
            spawn_waiter(k, sem, "second", &trace);
            (sem, first)
        })
        .unwrap();
    sys.settle().unwrap();

    sys.interrupt(|_| {
        assert_eq!(sem.value().unwrap(), -2);
        first.kill().unwrap();
        assert_eq!(sem.value().unwrap(), -1);
        assert_eq!(sem.num_waiters().unwrap(), 1);
        assert_eq!(sem.delete(), Err(DeleteObjectError::Busy));
        sem.post().unwrap();
    })
    .unwrap();
    sys.settle().unwrap();

    assert_eq!(trace.take(), ["second"]);
    sys.interrupt(|_| {
        assert_eq!(sem.value().unwrap(), 0);
        sem.delete().unwrap();
        assert_eq!(sem.value(), Err(QueryObjectError::BadId));
        assert_eq!(ResultCode::from(sem.post()), ResultCode::BadId);
    })
    .unwrap();
}
