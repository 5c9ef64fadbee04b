//! Kernel state inspection
use alloc::{string::ToString, vec::Vec};
use arrayvec::ArrayVec;
use core::fmt;
use slab::Slab;

use crate::{
    cfg::NUM_TASK_PRIORITY_LEVELS,
    error::BadContextError,
    task::{TaskCb, TaskFlags, TaskSt, TaskState},
    utils::intrusive_list::{ListAccessor, ListHead},
    Id, Kernel, Port, Ticks,
};

/// A summary of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: Id,
    pub name: &'static str,
    pub priority: usize,
    pub state: TaskState,
    pub flags: TaskFlags,
    pub parent: Option<Id>,
    /// The wake-up tick of a delayed task.
    pub delay_ticks: Option<Ticks>,
    pub exit_code: Option<i32>,
}

/// A consistent copy of the scheduler's lists, taken in one critical section.
#[derive(Debug, Clone)]
pub struct KernelSnapshot {
    pub systicks: Ticks,
    pub running: Option<Id>,
    pub sched_lock_count: usize,
    /// The non-empty ready buckets as `(priority, tasks)`, most urgent first.
    pub ready: Vec<(usize, Vec<Id>)>,
    /// The priorities whose bit is set in the ready bitmap.
    pub ready_bits: ArrayVec<usize, NUM_TASK_PRIORITY_LEVELS>,
    /// Delayed tasks in wake-up order.
    pub delayed: Vec<Id>,
    pub pending: Vec<Id>,
    /// Exited tasks that haven't been reclaimed yet.
    pub exited: Vec<Id>,
    /// The non-empty wait lists of semaphores, completions, and joined tasks.
    pub wait_lists: Vec<Vec<Id>>,
    /// Armed timers as `(timer, deadline)` in firing order.
    pub timers: Vec<(Id, Ticks)>,
    pub tasks: Vec<TaskInfo>,
}

impl KernelSnapshot {
    /// Find a task by its identifier.
    pub fn task(&self, id: Id) -> Option<&TaskInfo> {
        self.tasks.iter().find(|info| info.id == id)
    }

    /// Count the scheduler lists (ready buckets, the delay, pend, and exit
    /// lists, and the wait lists) that contain `id`.
    pub fn memberships(&self, id: Id) -> usize {
        let lists = self
            .ready
            .iter()
            .map(|(_, tasks)| tasks)
            .chain([&self.delayed, &self.pending, &self.exited])
            .chain(&self.wait_lists);
        lists.map(|list| list.iter().filter(|&&x| x == id).count()).sum()
    }
}

impl fmt::Display for KernelSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "systicks = {}, running = ", self.systicks)?;
        match self.running {
            Some(id) => write!(f, "{id}")?,
            None => f.write_str("-")?,
        }
        writeln!(f, ", sched lock = {}", self.sched_lock_count)?;

        writeln!(f, "  {:<8} {:<16} {:>4}  {:<8} {}", "ID", "NAME", "PRIO", "STATE", "PARENT")?;
        for info in &self.tasks {
            let marker = if Some(info.id) == self.running { '*' } else { ' ' };
            write!(
                f,
                "{marker} {:<8} {:<16} {:>4}  {:<8} ",
                info.id.to_string(),
                info.name,
                info.priority,
                info.state.as_str()
            )?;
            match info.parent {
                Some(parent) => writeln!(f, "{parent}")?,
                None => writeln!(f, "-")?,
            }
        }

        for (id, reach) in &self.timers {
            writeln!(f, "  timer {id} fires at tick {reach}")?;
        }
        Ok(())
    }
}

fn collect<P: Port>(head: &mut ListHead<usize>, tasks: &mut Slab<TaskCb<P>>) -> Vec<Id> {
    let accessor = ListAccessor::new(head, tasks);
    accessor
        .iter()
        .map(|i| Id::new(i, accessor.pool()[i].serial))
        .collect()
}

impl<P: Port> Kernel<P> {
    /// Take a snapshot of the scheduler state.
    pub fn snapshot(&self) -> Result<KernelSnapshot, BadContextError> {
        let mut lock = self.lock()?;
        let st = self.state.write(&mut *lock);

        let mut ready = Vec::new();
        for priority in 0..NUM_TASK_PRIORITY_LEVELS {
            let bucket = collect(st.ready.bucket(priority), &mut st.tasks);
            if !bucket.is_empty() {
                ready.push((priority, bucket));
            }
        }

        let mut wait_lists = Vec::new();
        for (_, cb) in st.semaphores.iter_mut() {
            wait_lists.push(collect(&mut cb.waiters, &mut st.tasks));
        }
        for (_, cb) in st.completions.iter_mut() {
            wait_lists.push(collect(&mut cb.waiters, &mut st.tasks));
        }
        let task_indices: Vec<usize> = st.tasks.iter().map(|(i, _)| i).collect();
        for &i in &task_indices {
            let mut joiners = st.tasks[i].joiners;
            wait_lists.push(collect(&mut joiners, &mut st.tasks));
        }
        wait_lists.retain(|list| !list.is_empty());

        let timer_accessor = ListAccessor::new(&mut st.timer_list, &mut st.timers);
        let timers = timer_accessor
            .iter()
            .map(|i| {
                let cb = &timer_accessor.pool()[i];
                (Id::new(i, cb.serial), cb.reach)
            })
            .collect();

        let tasks = st
            .tasks
            .iter()
            .map(|(i, cb)| TaskInfo {
                id: Id::new(i, cb.serial),
                name: cb.name,
                priority: cb.priority,
                state: cb.st.into(),
                flags: cb.flags,
                parent: cb.parent,
                delay_ticks: (cb.st == TaskSt::Delay).then(|| cb.delay_ticks),
                exit_code: cb.exit_code,
            })
            .collect();

        Ok(KernelSnapshot {
            systicks: st.systicks,
            running: st.running.map(|i| Id::new(i, st.tasks[i].serial)),
            sched_lock_count: st.sched_lock_count,
            ready,
            ready_bits: st.ready.set_bits().collect(),
            delayed: collect(&mut st.delay_list, &mut st.tasks),
            pending: collect(&mut st.pend_list, &mut st.tasks),
            exited: collect(&mut st.exit_list, &mut st.tasks),
            wait_lists,
            timers,
            tasks,
        })
    }

    /// Log a process-status style table of all tasks.
    pub fn dump(&self) {
        match self.snapshot() {
            Ok(snapshot) => log::info!("kernel state:\n{snapshot}"),
            Err(e) => log::warn!("couldn't take a snapshot: {e:?}"),
        }
    }
}
