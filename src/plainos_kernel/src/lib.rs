#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
extern crate alloc;

use alloc::boxed::Box;
use core::{fmt, ptr::NonNull};

/// Implement the common traits of an object handle type `$ty<P>` consisting of
/// `kernel: &'static Kernel<P>` and `id: Id`.
macro_rules! impl_object_handle {
    ($ty:ident) => {
        impl<P: $crate::Port> Clone for $ty<P> {
            #[inline]
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<P: $crate::Port> Copy for $ty<P> {}

        impl<P: $crate::Port> PartialEq for $ty<P> {
            #[inline]
            fn eq(&self, other: &Self) -> bool {
                core::ptr::eq(self.kernel, other.kernel) && self.id == other.id
            }
        }

        impl<P: $crate::Port> Eq for $ty<P> {}

        impl<P: $crate::Port> core::fmt::Debug for $ty<P> {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                f.debug_tuple(stringify!($ty)).field(&self.id).finish()
            }
        }

        impl<P: $crate::Port> $ty<P> {
            #[inline]
            pub(crate) fn from_id(kernel: &'static $crate::Kernel<P>, id: $crate::Id) -> Self {
                Self { kernel, id }
            }

            /// Get the object's identifier.
            #[inline]
            pub fn id(&self) -> $crate::Id {
                self.id
            }
        }
    };
}

pub mod cfg;
mod completion;
mod debug;
mod error;
mod klock;
mod mutex;
mod semaphore;
mod state;
mod task;
mod timer;
mod utils;
mod wait;
mod workqueue;

pub use self::{
    cfg::KernelCfg,
    completion::Completion,
    debug::{KernelSnapshot, TaskInfo},
    error::*,
    mutex::Mutex,
    semaphore::Semaphore,
    state::CpuRate,
    task::{Task, TaskFlags, TaskState},
    timer::SoftTimer,
    workqueue::{SystemWorkqueue, Work, Workqueue},
};

/// Unsigned integer type representing a tick count.
pub type Ticks = u64;

/// The entry point handed to [`Port::initialize_task_state`]. It never returns;
/// the kernel routes the task's exit through [`Port::exit_and_switch`].
pub type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a kernel object. The serial number distinguishes objects that
/// occupied the same slot at different times, so a handle to a deleted object
/// never aliases its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id {
    index: usize,
    serial: u32,
}

impl Id {
    pub(crate) const fn new(index: usize, serial: u32) -> Self {
        Self { index, serial }
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.index
    }

    #[inline]
    pub(crate) const fn serial(self) -> u32 {
        self.serial
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.serial)
    }
}

/// The memory region allocated for a task's stack.
#[derive(Debug, Clone, Copy)]
pub struct StackRange {
    /// The lowest address of the region.
    pub base: NonNull<usize>,
    /// The size of the region, measured in words.
    pub words: usize,
}

/// The initial context of a task, produced by [`Port::initialize_task_state`].
pub struct TaskContext<PortTaskState> {
    /// Port-specific per-task data. The kernel keeps it in the task control
    /// block and drops it when the task is reclaimed.
    pub state: PortTaskState,
    /// The initial value of the task's saved stack pointer.
    pub sp: usize,
    /// The lowest usable word of the stack. The kernel plants
    /// [`cfg::STACK_MAGIC`] here and checks it on every context save.
    pub stack_floor: NonNull<usize>,
}

/// Implemented by a port.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait Port: Send + Sync + Sized + 'static {
    type PortTaskState: Send + 'static;

    /// Give the port a way to reach the kernel from its trap and interrupt
    /// handlers. Called exactly once by [`Kernel::init`].
    fn attach(&self, kernel: &'static (dyn PortToKernel + Sync));

    /// Mask kernel-managed interrupts. Calls nest.
    ///
    /// # Safety
    ///
    /// Must be paired with a call to `exit_critical`.
    unsafe fn enter_critical(&self);

    /// Undo one `enter_critical`, unmasking interrupts when the outermost
    /// critical section is left.
    ///
    /// # Safety
    ///
    /// Must be paired with a preceding call to `enter_critical`.
    unsafe fn exit_critical(&self);

    /// Return a flag indicating whether the caller is a task (not an interrupt
    /// handler nor the boot context).
    fn is_task_context(&self) -> bool;

    /// Build the initial context of a task that will start by calling `entry`
    /// on the stack `stack`. Returns `None` if the port ran out of resources.
    ///
    /// # Safety
    ///
    /// `stack` must stay valid until the returned state is dropped.
    unsafe fn initialize_task_state(
        &self,
        stack: StackRange,
        entry: TaskEntry,
    ) -> Option<TaskContext<Self::PortTaskState>>;

    /// Start scheduling by restoring the context chosen by
    /// [`PortToKernel::next_context_sp`].
    ///
    /// # Safety
    ///
    /// Only called once by [`Kernel::start`], outside a critical section.
    unsafe fn dispatch_first_task(&self);

    /// Request a context switch. In a task context, this returns when the
    /// calling task is chosen again. In an interrupt context, the switch is
    /// deferred until the handler returns.
    ///
    /// The port calls [`PortToKernel::save_context_sp`] and then
    /// [`PortToKernel::next_context_sp`] while performing the switch.
    ///
    /// # Safety
    ///
    /// Must be called outside a critical section.
    unsafe fn switch_context(&self);

    /// Discard the current task's context and switch to the one chosen by
    /// [`PortToKernel::next_context_sp`].
    ///
    /// # Safety
    ///
    /// Must be called from a task context, outside a critical section, after
    /// the current task has been retired.
    unsafe fn exit_and_switch(&self) -> !;

    /// One iteration of the idle loop (e.g., wait for an interrupt).
    fn idle(&self);

    /// Stop the system forever.
    fn halt(&self) -> !;
}

/// Methods intended to be called by a port.
pub trait PortToKernel {
    /// Store the stack pointer of the outgoing task. Verifies the task's stack
    /// canary; a violation halts the system.
    fn save_context_sp(&self, sp: usize);

    /// Choose the next task to run and return its saved stack pointer.
    fn next_context_sp(&self) -> usize;

    /// The periodic timer interrupt handler.
    fn systick_expiration(&self);
}

/// A kernel instance.
///
/// All kernel state is kept in this object. It's usually placed in a `static`
/// (or leaked) because tasks and object handles refer to it through
/// `&'static Kernel<P>`.
pub struct Kernel<P: Port> {
    port: P,
    cfg: KernelCfg,
    cpu_lock: klock::CpuLock,
    state: klock::CpuLockCell<state::State<P>>,
}

// Safety: `state` is only accessed with CPU Lock active, and the port
//         guarantees that only one execution context runs at a time.
unsafe impl<P: Port> Sync for Kernel<P> {}
unsafe impl<P: Port> Send for Kernel<P> {}

impl<P: Port> Kernel<P> {
    /// Construct a kernel instance. Call [`Self::init`] and [`Self::start`] to
    /// bring it up.
    pub fn new(port: P, cfg: KernelCfg) -> Self {
        let cpu_lock = klock::CpuLock::new();
        let state = cpu_lock.new_cell(state::State::new());
        Self {
            port,
            cfg,
            cpu_lock,
            state,
        }
    }

    /// Get a reference to the port.
    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get the configuration the kernel was constructed with.
    #[inline]
    pub fn cfg(&self) -> &KernelCfg {
        &self.cfg
    }

    /// Attempt to enter a CPU Lock state.
    #[inline]
    pub(crate) fn lock(&self) -> Result<klock::CpuLockGuard<'_, P>, BadContextError> {
        klock::lock_cpu(&self.port, &self.cpu_lock)
    }
}

impl<P: Port> Kernel<P> {
    /// Initialize the kernel: create the idle task, the system workqueues, the
    /// timer daemon, and finally the task that runs `init`. Nothing runs until
    /// [`Self::start`] is called.
    pub fn init(&'static self, init: impl FnOnce() -> i32 + Send + 'static) -> Result<(), InitError> {
        let cfg = &self.cfg;
        cfg.validate()?;
        {
            let mut lock = self.lock()?;
            let st = self.state.write(&mut *lock);
            if st.initialized {
                return Err(InitError::BadContext);
            }
            st.initialized = true;
        }

        self.port.attach(self);

        self.spawn(
            "idle",
            cfg::IDLE_PRIORITY,
            cfg.idle_stack_size,
            TaskFlags::SYSTEM | TaskFlags::IDLE,
            Box::new(move || -> i32 {
                loop {
                    self.port.idle();
                }
            }),
        )?;
        let high = workqueue::create(
            self,
            "wq_high",
            cfg.high_workqueue_priority,
            cfg.high_workqueue_stack_size,
            cfg.high_workqueue_capacity,
            TaskFlags::SYSTEM,
        )?;
        let low = workqueue::create(
            self,
            "wq_low",
            cfg.low_workqueue_priority,
            cfg.low_workqueue_stack_size,
            cfg.low_workqueue_capacity,
            TaskFlags::SYSTEM,
        )?;
        let timer_daemon = self.spawn(
            "timer_daemon",
            cfg.timer_daemon_priority,
            cfg.timer_daemon_stack_size,
            TaskFlags::SYSTEM,
            Box::new(move || timer::daemon_main(self)),
        )?;

        {
            let mut lock = self.lock()?;
            let st = self.state.write(&mut *lock);
            st.timer_daemon = Some(timer_daemon.index());
            st.system_workqueues = Some([high, low]);
            st.reclaim_work = Some(Work::new(move || self.reclaim_exited()));
        }

        self.spawn(
            "init",
            cfg.init_priority,
            cfg.init_stack_size,
            TaskFlags::empty(),
            Box::new(init),
        )?;

        log::debug!("kernel initialized");
        Ok(())
    }

    /// Start scheduling. Depending on the port, this may never return.
    pub fn start(&'static self) -> Result<(), BadContextError> {
        {
            let mut lock = self.lock()?;
            let st = self.state.write(&mut *lock);
            if !st.initialized || st.started {
                return Err(BadContextError::BadContext);
            }
            st.started = true;
        }

        log::debug!("starting the scheduler");

        // Safety: CPU Lock inactive, called only once
        unsafe { self.port.dispatch_first_task() };
        Ok(())
    }

    /// Discard all tasks and objects. The port must have stopped every task
    /// before calling this. The kernel can't be started again.
    pub fn teardown(&self) -> Result<(), BadContextError> {
        let old_state = {
            let mut lock = self.lock()?;
            let st = self.state.write(&mut *lock);
            let mut new_state = state::State::new();
            new_state.initialized = true;
            new_state.started = true;
            core::mem::replace(st, new_state)
        };
        log::debug!("tearing down {} task(s)", old_state.tasks.len());

        // Stacks and port states are released outside the critical section
        drop(old_state);
        Ok(())
    }

    /// Get the CPU utilization measured over the last completed sampling
    /// window.
    pub fn cpu_rate(&self) -> Result<CpuRate, BadContextError> {
        let mut lock = self.lock()?;
        Ok(self.state.write(&mut *lock).cpu_rate.last())
    }
}

impl<P: Port> PortToKernel for Kernel<P> {
    #[inline]
    fn save_context_sp(&self, sp: usize) {
        self.save_context(sp);
    }

    #[inline]
    fn next_context_sp(&self) -> usize {
        self.choose_next()
    }

    #[inline]
    fn systick_expiration(&self) {
        self.systick();
    }
}

impl<P: Port> fmt::Debug for Kernel<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}
