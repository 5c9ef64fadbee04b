#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use once_cell::sync::OnceCell;
use plainos_kernel::{
    InitError, Kernel, KernelCfg, Port, PortToKernel, StackRange, TaskContext, TaskEntry,
};
use spin::Mutex as SpinMutex;
use std::{
    cell::Cell,
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, MutexGuard},
    thread::{self, JoinHandle},
    time::Duration,
};

mod sched;

use self::sched::{Cpu, Owner, SchedState, ThreadSlot};

/// How long [`System::settle`] waits for the tasks to block before concluding
/// that one of them is spinning.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// The role of the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The thread that booted the system.
    Boot,
    /// The driver, while running an interrupt handler.
    Interrupt,
    /// The thread of the task with the specified context key.
    Task(usize),
}

thread_local! {
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
    /// The lowest word of the current task's kernel-allocated stack.
    static STACK_FLOOR: Cell<usize> = Cell::new(0);
}

fn thread_role() -> ThreadRole {
    THREAD_ROLE.with(Cell::get)
}

fn owner_of(role: ThreadRole) -> Owner {
    match role {
        ThreadRole::Task(key) => Owner::Task(key),
        ThreadRole::Unknown | ThreadRole::Boot | ThreadRole::Interrupt => Owner::Driver,
    }
}

/// Unwinding payload that ends a task thread whose task has exited or has been
/// reclaimed.
struct TaskThreadExit;

/// Unwinding payload that ends a thread after the system has halted.
struct HaltUnwind;

/// Returned by the operations of [`System`] after the system has halted (e.g.,
/// because a stack overflow was detected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemHalted;

impl fmt::Display for SystemHalted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("the system has halted")
    }
}

impl std::error::Error for SystemHalted {}

/// The port. Every task runs on a dedicated OS thread, but only the thread
/// owning the simulated CPU makes progress.
#[derive(Clone)]
pub struct StdPort {
    inner: Arc<Inner>,
}

struct Inner {
    cpu: Cpu,
    kernel: OnceCell<&'static (dyn PortToKernel + Sync)>,
    threads: SpinMutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for StdPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StdPort").finish_non_exhaustive()
    }
}

/// The port-specific state of a task: its thread.
pub struct TaskThread {
    port: StdPort,
    key: usize,
}

impl fmt::Debug for TaskThread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TaskThread").field(&self.key).finish()
    }
}

impl Drop for TaskThread {
    fn drop(&mut self) {
        // If the thread is still parked, this wakes it up so that it can exit
        self.port.inner.cpu.lock().retire_thread(self.key);
        self.port.inner.cpu.notify();
    }
}

impl StdPort {
    fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cpu: Cpu::new(),
                kernel: OnceCell::new(),
                threads: SpinMutex::new(Vec::new()),
            }),
        }
    }

    fn kernel(&self) -> &'static (dyn PortToKernel + Sync) {
        *self.inner.kernel.get().expect("the port isn't attached to a kernel")
    }

    /// Park the calling task thread until the CPU is handed to it. Unwinds if
    /// the system halts or the task is reclaimed in the meantime.
    fn wait_for_cpu<'a>(&'a self, st: MutexGuard<'a, SchedState>, key: usize) -> MutexGuard<'a, SchedState> {
        let st = self
            .inner
            .cpu
            .wait_while(st, |st| st.owner != Owner::Task(key) && !st.is_retired(key));
        if st.halted {
            drop(st);
            panic::resume_unwind(Box::new(HaltUnwind));
        }
        if st.owner != Owner::Task(key) {
            drop(st);
            log::trace!("task thread {key} was reclaimed while parked");
            panic::resume_unwind(Box::new(TaskThreadExit));
        }
        st
    }

    fn task_thread_main(&self, key: usize, floor: usize, entry: TaskEntry) {
        THREAD_ROLE.with(|role| role.set(ThreadRole::Task(key)));
        STACK_FLOOR.with(|f| f.set(floor));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            drop(self.wait_for_cpu(self.inner.cpu.lock(), key));
            log::trace!("task thread {key} is running");
            entry();
        }));

        let mut st = self.inner.cpu.lock();
        if let Err(payload) = result {
            if !payload.is::<TaskThreadExit>() && !payload.is::<HaltUnwind>() {
                log::error!("task thread {key} panicked; halting the system");
                st.halted = true;
                st.panic.get_or_insert(payload);
            }
        }
        st.exit_thread(key);
        drop(st);
        self.inner.cpu.notify();
    }
}

unsafe impl Port for StdPort {
    type PortTaskState = TaskThread;

    fn attach(&self, kernel: &'static (dyn PortToKernel + Sync)) {
        if self.inner.kernel.set(kernel).is_err() {
            panic!("the port is already attached to a kernel");
        }
    }

    unsafe fn enter_critical(&self) {
        let role = thread_role();
        let mut st = self.inner.cpu.lock();
        if st.halted {
            // Stop a task at its next kernel call. Threads that are already
            // unwinding and the driver may proceed.
            if matches!(role, ThreadRole::Task(_)) && !thread::panicking() {
                drop(st);
                panic::resume_unwind(Box::new(HaltUnwind));
            }
        } else {
            assert_eq!(
                st.owner,
                owner_of(role),
                "{role:?} entered a critical section without owning the CPU"
            );
        }
        st.cs_depth += 1;
    }

    unsafe fn exit_critical(&self) {
        let mut st = self.inner.cpu.lock();
        st.cs_depth = st.cs_depth.saturating_sub(1);

        // A pending interrupt is taken when a task leaves its outermost
        // critical section
        if let ThreadRole::Task(key) = thread_role() {
            if st.cs_depth == 0 && st.irq_pending && !st.halted && !thread::panicking() {
                log::trace!("task thread {key} is interrupted");
                st.owner = Owner::Driver;
                self.inner.cpu.notify();
                drop(self.wait_for_cpu(st, key));
            }
        }
    }

    fn is_task_context(&self) -> bool {
        matches!(thread_role(), ThreadRole::Task(_))
    }

    unsafe fn initialize_task_state(
        &self,
        stack: StackRange,
        entry: TaskEntry,
    ) -> Option<TaskContext<TaskThread>> {
        let key = self.inner.cpu.lock().threads.insert(ThreadSlot::default());
        let floor = stack.base.as_ptr() as usize;

        let port = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("task{key}"))
            .spawn(move || port.task_thread_main(key, floor, entry));
        match spawned {
            Ok(handle) => {
                let mut threads = self.inner.threads.lock();
                threads.retain(|handle| !handle.is_finished());
                threads.push(handle);
            }
            Err(e) => {
                log::warn!("couldn't spawn a task thread: {e}");
                self.inner.cpu.lock().threads.remove(key);
                return None;
            }
        }
        log::trace!("initialize_task_state: spawned task thread {key}");

        Some(TaskContext {
            state: TaskThread {
                port: self.clone(),
                key,
            },
            sp: key,
            stack_floor: stack.base,
        })
    }

    unsafe fn dispatch_first_task(&self) {
        log::trace!("dispatch_first_task");
        let next = self.kernel().next_context_sp();
        self.inner.cpu.lock().release_to(next);
        self.inner.cpu.notify();
    }

    unsafe fn switch_context(&self) {
        let ThreadRole::Task(me) = thread_role() else {
            // Deferred until the interrupt handler returns
            self.inner.cpu.lock().dispatch_pending = true;
            return;
        };

        // Interrupts stay masked until the switch is complete
        self.inner.cpu.lock().cs_depth += 1;
        let kernel = self.kernel();
        kernel.save_context_sp(me);
        let next = kernel.next_context_sp();

        let mut st = self.inner.cpu.lock();
        st.cs_depth -= 1;
        if next == me {
            return;
        }
        log::trace!("switching from task thread {me} to {next}");
        st.release_to(next);
        self.inner.cpu.notify();
        drop(self.wait_for_cpu(st, me));
    }

    unsafe fn exit_and_switch(&self) -> ! {
        let ThreadRole::Task(me) = thread_role() else {
            panic!("exit_and_switch called outside a task thread");
        };

        self.inner.cpu.lock().cs_depth += 1;
        let next = self.kernel().next_context_sp();

        let mut st = self.inner.cpu.lock();
        st.cs_depth -= 1;
        debug_assert_ne!(next, me);
        st.release_to(next);
        drop(st);
        self.inner.cpu.notify();

        log::trace!("task thread {me} exits");
        panic::resume_unwind(Box::new(TaskThreadExit))
    }

    fn idle(&self) {
        let ThreadRole::Task(me) = thread_role() else { return };
        let mut st = self.inner.cpu.lock();
        st.idle = true;
        st.owner = Owner::Driver;
        self.inner.cpu.notify();
        let mut st = self.wait_for_cpu(st, me);
        st.idle = false;
    }

    fn halt(&self) -> ! {
        log::error!("the system has halted");
        self.inner.cpu.lock().halted = true;
        self.inner.cpu.notify();
        panic::resume_unwind(Box::new(HaltUnwind))
    }
}

/// Overwrite the stack canary of the calling task, as a stack overflow would.
/// The kernel detects it at the task's next context switch.
///
/// # Panics
///
/// Panics if the caller isn't a task.
pub fn clobber_stack_canary() {
    let floor = STACK_FLOOR.with(Cell::get);
    assert!(
        matches!(thread_role(), ThreadRole::Task(_)) && floor != 0,
        "clobber_stack_canary called outside a task"
    );
    // Safety: `floor` is the lowest word of the calling task's stack, which
    //         the kernel keeps allocated while the task can run
    unsafe { (floor as *mut usize).write_volatile(0) };
}

/// A running kernel instance and the thread driving it.
///
/// The thread that calls [`Self::boot`] acts as the hardware: it raises
/// interrupts ([`Self::interrupt`], [`Self::tick`]) and waits for the tasks to
/// block ([`Self::settle`]). Tasks only make progress while the driver is
/// waiting in one of these methods.
///
/// Dropping a `System` halts it, joins the task threads, and tears the kernel
/// down.
pub struct System {
    kernel: &'static Kernel<StdPort>,
    port: StdPort,
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("System")
            .field("kernel", self.kernel)
            .finish_non_exhaustive()
    }
}

impl System {
    /// Construct and start a kernel. `init` runs in the kernel's init task.
    ///
    /// The returned system may still be running its tasks; call
    /// [`Self::settle`] to wait for them to block.
    pub fn boot(
        cfg: KernelCfg,
        init: impl FnOnce(&'static Kernel<StdPort>) -> i32 + Send + 'static,
    ) -> Result<Self, InitError> {
        let _ = env_logger::builder().is_test(true).try_init();

        let port = StdPort::new();
        let kernel: &'static Kernel<StdPort> = Box::leak(Box::new(Kernel::new(port.clone(), cfg)));
        let system = Self { kernel, port };

        THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));
        kernel.init(move || init(kernel))?;
        kernel.start()?;
        Ok(system)
    }

    /// Get the kernel.
    #[inline]
    pub fn kernel(&self) -> &'static Kernel<StdPort> {
        self.kernel
    }

    /// Get a flag indicating whether the system has halted.
    pub fn is_halted(&self) -> bool {
        self.port.inner.cpu.lock().halted
    }

    /// Preempt the running task and call `f` in an interrupt context. Switches
    /// requested by `f` take effect when it returns.
    ///
    /// # Panics
    ///
    /// Panics if called from a task. A panic that escaped from a task is
    /// re-raised here.
    pub fn interrupt<R>(
        &self,
        f: impl FnOnce(&'static Kernel<StdPort>) -> R,
    ) -> Result<R, SystemHalted> {
        assert!(
            !matches!(thread_role(), ThreadRole::Task(_)),
            "tasks can't raise interrupts"
        );
        drop(self.take_cpu()?);

        let prev_role = THREAD_ROLE.with(|role| role.replace(ThreadRole::Interrupt));
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let output = f(self.kernel);
            self.dispatch();
            output
        }));
        THREAD_ROLE.with(|role| role.set(prev_role));

        match result {
            Ok(output) => {
                self.resume_current();
                Ok(output)
            }
            Err(payload) if payload.is::<HaltUnwind>() => Err(SystemHalted),
            Err(payload) => {
                self.port.inner.cpu.lock().halted = true;
                self.port.inner.cpu.notify();
                panic::resume_unwind(payload)
            }
        }
    }

    /// Deliver one timer tick.
    pub fn tick(&self) -> Result<(), SystemHalted> {
        self.interrupt(|kernel| kernel.systick_expiration())
    }

    /// Deliver `count` timer ticks, letting the tasks run until they block
    /// after each one.
    pub fn ticks(&self, count: u64) -> Result<(), SystemHalted> {
        for _ in 0..count {
            self.tick()?;
            self.settle()?;
        }
        Ok(())
    }

    /// Wait until every task is blocked and the idle task is waiting for an
    /// interrupt.
    ///
    /// # Panics
    ///
    /// Panics if that doesn't happen within [`SETTLE_TIMEOUT`].
    pub fn settle(&self) -> Result<(), SystemHalted> {
        let cpu = &self.port.inner.cpu;
        let (st, timeout) = cpu.wait_timeout_while(cpu.lock(), SETTLE_TIMEOUT, |st| {
            !(st.owner == Owner::Driver && st.idle)
        });
        if st.halted {
            return Err(Self::halted(st));
        }
        if timeout.timed_out() {
            drop(st);
            panic!("the system didn't settle within {SETTLE_TIMEOUT:?}");
        }
        Ok(())
    }

    /// Wait until the driver owns the CPU.
    fn take_cpu(&self) -> Result<MutexGuard<'_, SchedState>, SystemHalted> {
        let cpu = &self.port.inner.cpu;
        let mut st = cpu.lock();
        st.irq_pending = true;
        let mut st = cpu.wait_while(st, |st| st.owner != Owner::Driver);
        st.irq_pending = false;
        if st.halted {
            return Err(Self::halted(st));
        }
        Ok(st)
    }

    /// Re-raise the panic that halted the system, if any.
    fn halted(mut st: MutexGuard<'_, SchedState>) -> SystemHalted {
        if let Some(payload) = st.panic.take() {
            drop(st);
            panic::resume_unwind(payload);
        }
        SystemHalted
    }

    /// Perform the context switch requested by an interrupt handler.
    fn dispatch(&self) {
        let mut st = self.port.inner.cpu.lock();
        if !mem::take(&mut st.dispatch_pending) {
            return;
        }
        let current = st.current;
        drop(st);

        let kernel = self.port.kernel();
        if let Some(current) = current {
            kernel.save_context_sp(current);
        }
        let next = kernel.next_context_sp();
        log::trace!("dispatch: current = {current:?}, next = {next}");
        self.port.inner.cpu.lock().current = Some(next);
    }

    /// Return from an interrupt handler.
    fn resume_current(&self) {
        let mut st = self.port.inner.cpu.lock();
        if let Some(current) = st.current {
            st.owner = Owner::Task(current);
            st.idle = false;
        }
        drop(st);
        self.port.inner.cpu.notify();
    }
}

impl Drop for System {
    fn drop(&mut self) {
        let cpu = &self.port.inner.cpu;
        cpu.lock().halted = true;
        cpu.notify();

        // Parked threads unwind right away. A running task stops at its next
        // kernel call.
        loop {
            let threads = mem::take(&mut *self.port.inner.threads.lock());
            if threads.is_empty() {
                break;
            }
            for thread in threads {
                let _ = thread.join();
            }
        }

        if let Err(e) = self.kernel.teardown() {
            log::warn!("couldn't tear down the kernel: {e:?}");
        }
        log::debug!("the system has shut down");
    }
}
