//! Workqueues, including the system workqueues.
use plainos_kernel::{
    AddWorkError, CreateWorkqueueError, DestroyWorkqueueError, QueryObjectError, SystemWorkqueue,
    TaskFlags, TaskState, Work, Workqueue,
};

use crate::{boot, Trace, STACK_SIZE};

#[test]
fn system_workqueues_run_work() {
    let sys = boot();
    let trace = Trace::default();

    sys.interrupt(|k| {
        let high = k.system_workqueue(SystemWorkqueue::High).unwrap();
        let low = k.system_workqueue(SystemWorkqueue::Low).unwrap();
        let executor = high.executor().unwrap();
        assert!(executor.flags().unwrap().contains(TaskFlags::SYSTEM));
        assert_eq!(executor.state().unwrap(), TaskState::Pending);

        let (t1, t2) = (trace.clone(), trace.clone());
        low.add(&Work::new(move || t1.push("low"))).unwrap();
        high.add(&Work::new(move || t2.push("high"))).unwrap();

        // System workqueues can't be destroyed
        assert_eq!(high.destroy(), Err(DestroyWorkqueueError::BadParam));
    })
    .unwrap();
    sys.settle().unwrap();

    // The high-priority queue goes first
    assert_eq!(trace.take(), ["high", "low"]);
}

#[test]
fn the_same_work_can_be_queued_twice() {
    let sys = boot();
    let trace = Trace::default();

    sys.interrupt(|k| {
        let wq = Workqueue::create(k, "wq", 10, STACK_SIZE, 8).unwrap();
        let trace = trace.clone();
        let work = Work::new(move || trace.push("run"));
        wq.add(&work).unwrap();
        wq.add(&work).unwrap();
    })
    .unwrap();
    sys.settle().unwrap();

    assert_eq!(trace.take(), ["run", "run"]);
}

#[test]
fn work_added_from_a_task() {
    let sys = boot();
    let trace = Trace::default();

    sys.interrupt(|k| {
        let wq = Workqueue::create(k, "wq", 5, STACK_SIZE, 4).unwrap();
        let trace = trace.clone();
        k.create_task("producer", 10, STACK_SIZE, move || {
            let trace2 = trace.clone();
            wq.add(&Work::new(move || trace2.push("work"))).unwrap();
            // The executor is more urgent, so the work has already run
            trace.push("producer");
            0
        })
        .unwrap();
    })
    .unwrap();
    sys.settle().unwrap();

    assert_eq!(trace.take(), ["work", "producer"]);
}

#[test]
fn destroy() {
    let sys = boot();
    let trace = Trace::default();

    let (wq, executor) = sys
        .interrupt(|k| {
            let wq = Workqueue::create(k, "doomed", 10, STACK_SIZE, 4).unwrap();
            let executor = wq.executor().unwrap();
            executor.pend().unwrap();
            let trace = trace.clone();
            wq.add(&Work::new(move || trace.push("dropped"))).unwrap();
            wq.destroy().unwrap();
            (wq, executor)
        })
        .unwrap();
    sys.settle().unwrap();

    assert!(trace.take().is_empty());
    sys.interrupt(|_| {
        assert_eq!(wq.len(), Err(QueryObjectError::BadId));
        assert_eq!(
            wq.add(&Work::new(|| {})),
            Err(AddWorkError::BadId)
        );
        assert_eq!(wq.destroy(), Err(DestroyWorkqueueError::BadId));
        // The executor has been reclaimed
        assert!(executor.state().is_err());
    })
    .unwrap();
}

#[test]
fn bad_capacity() {
    let sys = boot();
    sys.interrupt(|k| {
        for capacity in [0, 1, 5] {
            assert_eq!(
                Workqueue::create(k, "wq", 10, STACK_SIZE, capacity).err(),
                Some(CreateWorkqueueError::BadParam)
            );
        }
    })
    .unwrap();
}
