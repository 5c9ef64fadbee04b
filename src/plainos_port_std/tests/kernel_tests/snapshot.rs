//! Consistency of the scheduler lists, observed through snapshots.
use plainos_kernel::{KernelSnapshot, Semaphore, TaskFlags, TaskState};

use crate::{boot, STACK_SIZE};

fn assert_consistent(snapshot: &KernelSnapshot) {
    for info in &snapshot.tasks {
        let expected = if info.state == TaskState::Fatal { 0 } else { 1 };
        assert_eq!(
            snapshot.memberships(info.id),
            expected,
            "{} ({}) is in a wrong number of lists\n{snapshot}",
            info.name,
            info.id
        );
    }

    let priorities: Vec<usize> = snapshot.ready.iter().map(|(p, _)| *p).collect();
    assert_eq!(snapshot.ready_bits.as_slice(), &priorities[..]);
    for (priority, bucket) in &snapshot.ready {
        for &id in bucket {
            let info = snapshot.task(id).unwrap();
            assert_eq!(info.state, TaskState::Ready);
            assert_eq!(info.priority, *priority);
        }
    }

    let deadlines: Vec<_> = snapshot
        .delayed
        .iter()
        .map(|&id| snapshot.task(id).unwrap().delay_ticks.unwrap())
        .collect();
    assert!(deadlines.windows(2).all(|w| w[0] <= w[1]), "{deadlines:?}");
    assert!(snapshot.timers.windows(2).all(|w| w[0].1 <= w[1].1));
}

#[test]
fn every_task_is_in_exactly_one_list() {
    let sys = boot();
    let sem = sys.interrupt(|k| Semaphore::new(k, 0).unwrap()).unwrap();

    let idle_snapshot = sys.interrupt(|k| k.snapshot().unwrap()).unwrap();
    assert_consistent(&idle_snapshot);
    let running = idle_snapshot.task(idle_snapshot.running.unwrap()).unwrap();
    assert!(running.flags.contains(TaskFlags::IDLE));
    assert_eq!(idle_snapshot.ready.len(), 1);
    // The timer daemon and the two system workqueue executors
    assert_eq!(idle_snapshot.pending.len(), 3);

    sys.interrupt(|k| {
        for ticks in [7, 2, 7, 4] {
            k.create_task("sleeper", 10, STACK_SIZE, move || {
                k.delay_ticks(ticks).unwrap();
                0
            })
            .unwrap();
        }
        k.create_task("pender", 10, STACK_SIZE, move || {
            k.current_task().unwrap().pend().unwrap();
            0
        })
        .unwrap();
        for _ in 0..2 {
            k.create_task("waiter", 12, STACK_SIZE, move || {
                sem.wait().unwrap();
                0
            })
            .unwrap();
        }
    })
    .unwrap();
    sys.settle().unwrap();

    let snapshot = sys
        .interrupt(|k| {
            // Ready, but not running until this handler returns
            k.create_task("fresh", 20, STACK_SIZE, || 0).unwrap();
            k.snapshot().unwrap()
        })
        .unwrap();
    assert_consistent(&snapshot);
    assert_eq!(snapshot.delayed.len(), 4);
    assert_eq!(snapshot.pending.len(), 4);
    assert_eq!(snapshot.wait_lists.len(), 1);
    assert_eq!(snapshot.wait_lists[0].len(), 2);
    assert_eq!(snapshot.ready_bits.as_slice(), [20, 31]);
    log::debug!("{snapshot}");

    for _ in 0..8 {
        sys.ticks(1).unwrap();
        assert_consistent(&sys.interrupt(|k| k.snapshot().unwrap()).unwrap());
    }
    let snapshot = sys.interrupt(|k| k.snapshot().unwrap()).unwrap();
    assert!(snapshot.delayed.is_empty());
    assert!(snapshot.exited.is_empty());
}
