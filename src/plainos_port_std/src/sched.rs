//! The simulated CPU
//!
//! Every task runs on its own OS thread, and the thread that drives the system
//! (boots it and raises interrupts) is called the driver. At any moment, exactly
//! one of these threads owns the CPU; the others are parked on [`Cpu::cond`].
use slab::Slab;
use std::{
    any::Any,
    sync::{Condvar, Mutex, MutexGuard, PoisonError, WaitTimeoutResult},
    time::Duration,
};

/// The owner of the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    /// The driver, which runs the boot code and interrupt handlers.
    Driver,
    /// The thread of the task with the specified context key.
    Task(usize),
}

pub(crate) struct SchedState {
    pub(crate) owner: Owner,
    /// The task whose context is loaded. The driver hands the CPU back to this
    /// task when an interrupt handler completes.
    pub(crate) current: Option<usize>,
    /// The nesting level of critical sections.
    pub(crate) cs_depth: usize,
    /// The driver is waiting for the CPU.
    pub(crate) irq_pending: bool,
    /// An interrupt handler requested a context switch.
    pub(crate) dispatch_pending: bool,
    /// The idle task handed the CPU to the driver to wait for an interrupt.
    pub(crate) idle: bool,
    pub(crate) halted: bool,
    pub(crate) threads: Slab<ThreadSlot>,
    /// The panic that escaped from a task, re-raised on the driver.
    pub(crate) panic: Option<Box<dyn Any + Send>>,
}

/// The lifecycle of a task thread. The slot is freed when both flags are set.
#[derive(Debug, Default)]
pub(crate) struct ThreadSlot {
    /// The kernel dropped the task's port state.
    retired: bool,
    /// The thread has finished.
    exited: bool,
}

impl SchedState {
    fn new() -> Self {
        Self {
            owner: Owner::Driver,
            current: None,
            cs_depth: 0,
            irq_pending: false,
            dispatch_pending: false,
            idle: false,
            halted: false,
            threads: Slab::new(),
            panic: None,
        }
    }

    /// Make `next` the current task and give it the CPU, unless the driver is
    /// waiting for it, in which case the driver goes first.
    pub(crate) fn release_to(&mut self, next: usize) {
        self.current = Some(next);
        self.idle = false;
        self.owner = if self.irq_pending {
            Owner::Driver
        } else {
            Owner::Task(next)
        };
    }

    pub(crate) fn is_retired(&self, key: usize) -> bool {
        self.threads.get(key).map_or(true, |slot| slot.retired)
    }

    pub(crate) fn retire_thread(&mut self, key: usize) {
        if let Some(slot) = self.threads.get_mut(key) {
            slot.retired = true;
            if slot.exited {
                self.threads.remove(key);
            }
        }
    }

    pub(crate) fn exit_thread(&mut self, key: usize) {
        if let Some(slot) = self.threads.get_mut(key) {
            slot.exited = true;
            if slot.retired {
                self.threads.remove(key);
            }
        }
    }
}

pub(crate) struct Cpu {
    state: Mutex<SchedState>,
    cond: Condvar,
}

impl Cpu {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SchedState::new()),
            cond: Condvar::new(),
        }
    }

    /// Lock the scheduler state. A thread that panicked while holding the lock
    /// has already halted the system, so poisoning is ignored.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify(&self) {
        self.cond.notify_all();
    }

    /// Block while `cond` holds and the system hasn't halted.
    pub(crate) fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, SchedState>,
        mut cond: impl FnMut(&SchedState) -> bool,
    ) -> MutexGuard<'a, SchedState> {
        self.cond
            .wait_while(guard, |st| !st.halted && cond(st))
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// [`Self::wait_while`] with a time limit.
    pub(crate) fn wait_timeout_while<'a>(
        &self,
        guard: MutexGuard<'a, SchedState>,
        timeout: Duration,
        mut cond: impl FnMut(&SchedState) -> bool,
    ) -> (MutexGuard<'a, SchedState>, WaitTimeoutResult) {
        self.cond
            .wait_timeout_while(guard, timeout, |st| !st.halted && cond(st))
            .unwrap_or_else(PoisonError::into_inner)
    }
}
