//! Task creation, delays, pending, joining, and termination.
use plainos_kernel::{
    cfg::EXIT_CODE_KILLED, GetCurrentTaskError, JoinTaskError, KillTaskError, PendTaskError,
    QueryTaskError, Semaphore, TaskFlags, TaskState,
};
use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use crate::{boot, Trace, STACK_SIZE};

#[test]
fn delayed_tasks_wake_in_deadline_order() {
    let sys = boot();
    let trace = Trace::default();

    sys.interrupt(|k| {
        for (name, ticks) in [("d1", 5), ("d2", 3), ("d3", 5)] {
            let trace = trace.clone();
            k.create_task(name, 10, STACK_SIZE, move || {
                k.delay_ticks(ticks).unwrap();
                trace.push(name);
                0
            })
            .unwrap();
        }
    })
    .unwrap();
    sys.settle().unwrap();

    let snapshot = sys.interrupt(|k| k.snapshot().unwrap()).unwrap();
    let names: Vec<_> = snapshot
        .delayed
        .iter()
        .map(|&id| snapshot.task(id).unwrap().name)
        .collect();
    assert_eq!(names, ["d2", "d1", "d3"]);
    assert_eq!(
        snapshot.task(snapshot.delayed[0]).unwrap().delay_ticks,
        Some(3)
    );

    sys.ticks(3).unwrap();
    assert_eq!(trace.take(), ["d2"]);
    sys.ticks(1).unwrap();
    assert!(trace.take().is_empty());
    sys.ticks(1).unwrap();
    assert_eq!(trace.take(), ["d1", "d3"]);
}

#[test]
fn pend_and_resume() {
    let sys = boot();
    let trace = Trace::default();

    let task = sys
        .interrupt(|k| {
            let trace = trace.clone();
            let task = k
                .create_task("worker", 10, STACK_SIZE, move || {
                    trace.push("started");
                    k.current_task().unwrap().pend().unwrap();
                    trace.push("resumed");
                    k.delay_ticks(10).unwrap();
                    0
                })
                .unwrap();

            // Pending a task that hasn't run yet
            task.pend().unwrap();
            task.pend().unwrap();
            assert_eq!(task.state().unwrap(), TaskState::Pending);
            task
        })
        .unwrap();
    sys.settle().unwrap();
    assert!(trace.take().is_empty());

    sys.interrupt(|_| task.resume().unwrap()).unwrap();
    sys.settle().unwrap();
    assert_eq!(trace.take(), ["started"]);

    sys.interrupt(|_| task.resume().unwrap()).unwrap();
    sys.settle().unwrap();
    assert_eq!(trace.take(), ["resumed"]);

    sys.interrupt(|k| {
        assert_eq!(task.state().unwrap(), TaskState::Delay);
        assert_eq!(task.pend(), Err(PendTaskError::BadObjectState));
        // Resuming a task that isn't pending does nothing
        task.resume().unwrap();
        assert_eq!(task.state().unwrap(), TaskState::Delay);

        let idle = k
            .snapshot()
            .unwrap()
            .tasks
            .into_iter()
            .find(|info| info.flags.contains(TaskFlags::IDLE))
            .unwrap();
        assert_eq!(idle.priority, plainos_kernel::cfg::IDLE_PRIORITY);
    })
    .unwrap();
}

#[test]
fn system_tasks_are_protected() {
    let sys = boot();
    sys.interrupt(|k| {
        let executor = k
            .system_workqueue(plainos_kernel::SystemWorkqueue::Low)
            .unwrap()
            .executor()
            .unwrap();
        assert_eq!(executor.pend(), Err(PendTaskError::BadParam));
        assert_eq!(executor.kill(), Err(KillTaskError::BadParam));
    })
    .unwrap();
}

#[test]
fn join_and_exit_codes() {
    let sys = boot();
    let codes = Arc::new([AtomicI32::new(0), AtomicI32::new(0), AtomicI32::new(0)]);

    sys.interrupt(|k| {
        let codes = codes.clone();
        k.create_task("parent", 10, STACK_SIZE, move || {
            let me = k.current_task().unwrap();
            assert_eq!(me.join(), Err(JoinTaskError::BadParam));

            let exits = k
                .create_task("exits", 20, STACK_SIZE, move || {
                    k.exit_task(7).unwrap();
                    unreachable!()
                })
                .unwrap();
            assert_eq!(exits.parent().unwrap(), Some(me));
            codes[0].store(exits.join().unwrap(), Ordering::Relaxed);

            let sleeper = k
                .create_task("sleeper", 20, STACK_SIZE, move || {
                    k.delay_ticks(1000).unwrap();
                    0
                })
                .unwrap();
            let killer = k
                .create_task("killer", 15, STACK_SIZE, move || {
                    // `parent` is more urgent and preempts us right away
                    sleeper.kill().unwrap();
                    3
                })
                .unwrap();
            codes[1].store(sleeper.join().unwrap(), Ordering::Relaxed);
            codes[2].store(killer.join().unwrap(), Ordering::Relaxed);
            0
        })
        .unwrap();
    })
    .unwrap();
    sys.settle().unwrap();

    assert_eq!(codes[0].load(Ordering::Relaxed), 7);
    assert_eq!(codes[1].load(Ordering::Relaxed), EXIT_CODE_KILLED);
    assert_eq!(codes[2].load(Ordering::Relaxed), 3);
}

#[test]
fn kill_and_stale_handles() {
    let sys = boot();
    let sem = sys.interrupt(|k| Semaphore::new(k, 0).unwrap()).unwrap();

    let task = sys
        .interrupt(|k| {
            k.create_task("victim", 10, STACK_SIZE, move || {
                sem.wait().unwrap();
                0
            })
            .unwrap()
        })
        .unwrap();
    sys.settle().unwrap();

    sys.interrupt(|k| {
        assert_eq!(task.state().unwrap(), TaskState::Waiting);
        assert_eq!(task.parent().unwrap(), None);
        task.kill().unwrap();
        assert_eq!(task.state().unwrap(), TaskState::Exit);
        assert_eq!(task.kill(), Err(KillTaskError::Already));
        assert_eq!(task.pend(), Err(PendTaskError::Already));
        assert_eq!(k.snapshot().unwrap().exited, [task.id()]);
        assert_eq!(k.current_task().err(), Some(GetCurrentTaskError::BadContext));
    })
    .unwrap();
    sys.settle().unwrap();

    sys.interrupt(|k| {
        assert_eq!(task.state(), Err(QueryTaskError::BadId));
        assert_eq!(task.kill(), Err(KillTaskError::BadId));
        assert!(k.snapshot().unwrap().exited.is_empty());

        // A new task may reuse the slot, but not the identity
        let successor = k.create_task("successor", 10, STACK_SIZE, || 0).unwrap();
        assert_ne!(successor.id(), task.id());
        assert_eq!(task.state(), Err(QueryTaskError::BadId));
    })
    .unwrap();
    sys.settle().unwrap();
}
