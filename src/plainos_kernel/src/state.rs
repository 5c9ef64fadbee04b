//! The kernel's global state
use core::fmt;
use slab::Slab;

use crate::{
    completion::CompletionCb,
    error::BadContextError,
    semaphore::SemaphoreCb,
    task::{readyqueue::ReadyQueue, TaskCb, TaskSt},
    timer::TimerCb,
    utils::intrusive_list::ListHead,
    workqueue::{Work, WorkqueueCb},
    Id, Port, Ticks,
};

/// All mutable state of a kernel instance. Only accessed with CPU Lock active.
pub(crate) struct State<P: Port> {
    pub(crate) tasks: Slab<TaskCb<P>>,
    pub(crate) ready: ReadyQueue,
    /// Tasks in the Delay state, sorted by `delay_ticks` in ascending order.
    pub(crate) delay_list: ListHead<usize>,
    pub(crate) pend_list: ListHead<usize>,
    /// Exited tasks awaiting reclamation.
    pub(crate) exit_list: ListHead<usize>,
    /// The task whose context is currently loaded. Stays in its ready bucket
    /// while it runs.
    pub(crate) running: Option<usize>,
    pub(crate) idle_task: Option<usize>,
    pub(crate) systicks: Ticks,
    pub(crate) sched_lock_count: usize,
    pub(crate) initialized: bool,
    pub(crate) started: bool,
    next_serial: u32,
    pub(crate) cpu_rate: CpuRateSampler,

    pub(crate) semaphores: Slab<SemaphoreCb>,
    pub(crate) completions: Slab<CompletionCb>,

    pub(crate) timers: Slab<TimerCb>,
    /// Armed timers, sorted by deadline in ascending order.
    pub(crate) timer_list: ListHead<usize>,
    /// Expired timers waiting for the daemon to run their callbacks.
    pub(crate) timer_due: ListHead<usize>,
    pub(crate) timer_daemon: Option<usize>,

    pub(crate) workqueues: Slab<WorkqueueCb>,
    /// `[high, low]`
    pub(crate) system_workqueues: Option<[Id; 2]>,
    /// The work item that reclaims exited tasks. Runs on the high-priority
    /// system workqueue.
    pub(crate) reclaim_work: Option<Work>,
    pub(crate) reclaim_queued: bool,
}

impl<P: Port> State<P> {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Slab::new(),
            ready: ReadyQueue::INIT,
            delay_list: ListHead::new(),
            pend_list: ListHead::new(),
            exit_list: ListHead::new(),
            running: None,
            idle_task: None,
            systicks: 0,
            sched_lock_count: 0,
            initialized: false,
            started: false,
            next_serial: 0,
            cpu_rate: CpuRateSampler::INIT,
            semaphores: Slab::new(),
            completions: Slab::new(),
            timers: Slab::new(),
            timer_list: ListHead::new(),
            timer_due: ListHead::new(),
            timer_daemon: None,
            workqueues: Slab::new(),
            system_workqueues: None,
            reclaim_work: None,
            reclaim_queued: false,
        }
    }

    /// Allocate a serial number for a new object.
    pub(crate) fn next_serial(&mut self) -> u32 {
        self.next_serial = self.next_serial.wrapping_add(1);
        self.next_serial
    }

    /// Get the running task if the current context is a task context.
    pub(crate) fn expect_task_context(&self, port: &P) -> Result<usize, BadContextError> {
        match self.running {
            Some(running) if self.started && port.is_task_context() => Ok(running),
            _ => Err(BadContextError::BadContext),
        }
    }

    /// Get the running task if the current context can block.
    pub(crate) fn expect_waitable_context(&self, port: &P) -> Result<usize, BadContextError> {
        let running = self.expect_task_context(port)?;
        if self.sched_lock_count > 0 || self.tasks[running].st != TaskSt::Ready {
            Err(BadContextError::BadContext)
        } else {
            Ok(running)
        }
    }

    #[inline]
    pub(crate) fn task_index(&self, id: Id) -> Option<usize> {
        resolve(&self.tasks, id)
    }
}

/// Objects that carry the serial number of the handle that created them.
pub(crate) trait Serial {
    fn serial(&self) -> u32;
}

/// Map a handle's `Id` to a slab key. Returns `None` if the slot is vacant or
/// has been reused by another object.
#[inline]
pub(crate) fn resolve<T: Serial>(slab: &Slab<T>, id: Id) -> Option<usize> {
    slab.get(id.index())
        .filter(|obj| obj.serial() == id.serial())
        .map(|_| id.index())
}

/// The CPU utilization measured over one sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuRate {
    /// The length of the window, in ticks.
    pub base: u32,
    /// The number of ticks in which a task other than the idle task was
    /// selected.
    pub useful: u32,
}

impl CpuRate {
    /// Get the utilization in units of 0.1%.
    pub fn permille(&self) -> u32 {
        if self.base == 0 {
            0
        } else {
            (u64::from(self.useful) * 1000 / u64::from(self.base)) as u32
        }
    }
}

impl fmt::Display for CpuRate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let permille = self.permille();
        write!(f, "{}.{}%", permille / 10, permille % 10)
    }
}

/// Accumulates the current CPU utilization sampling window.
pub(crate) struct CpuRateSampler {
    ticks: u32,
    idle_ticks: u32,
    last: CpuRate,
}

impl CpuRateSampler {
    pub(crate) const INIT: Self = Self {
        ticks: 0,
        idle_ticks: 0,
        last: CpuRate { base: 0, useful: 0 },
    };

    /// Account for one tick. `idle` indicates whether the idle task was
    /// selected when the tick arrived.
    pub(crate) fn sample(&mut self, idle: bool, interval: u32) {
        self.ticks += 1;
        self.idle_ticks += u32::from(idle);
        if self.ticks >= interval {
            self.last = CpuRate {
                base: self.ticks,
                useful: self.ticks - self.idle_ticks,
            };
            self.ticks = 0;
            self.idle_ticks = 0;
            log::trace!("cpu rate: {}", self.last);
        }
    }

    /// The result of the last completed window.
    pub(crate) fn last(&self) -> CpuRate {
        self.last
    }
}
