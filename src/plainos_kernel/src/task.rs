//! Tasks
use alloc::{
    alloc::{alloc, dealloc, Layout},
    boxed::Box,
};
use core::{convert::Infallible, fmt, mem, ptr::NonNull};

use crate::{
    cfg::{EXIT_CODE_KILLED, IDLE_PRIORITY, MIN_STACK_SIZE, NUM_TASK_PRIORITY_LEVELS, STACK_MAGIC},
    error::{
        BadContextError, CreateTaskError, DelayError, GetCurrentTaskError, JoinTaskError,
        KillTaskError, PendTaskError, QueryTaskError, ResumeTaskError,
    },
    klock::CpuLockGuard,
    state::{Serial, State},
    utils::intrusive_list::{Link, Linked, ListAccessor, ListHead},
    wait::{self, WaitTarget},
    Id, Kernel, Port, StackRange, TaskEntry, Ticks,
};

pub(crate) mod readyqueue;

bitflags::bitflags! {
    /// Attributes of a task.
    pub struct TaskFlags: u8 {
        /// The task belongs to the kernel. Applications can't pend or kill it.
        const SYSTEM = 1 << 0;
        /// The idle task.
        const IDLE = 1 << 1;
    }
}

/// The state of a task, as observed from outside the kernel.
///
/// There is no "running" state; the running task is a [`Self::Ready`] task
/// that happens to be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Ready,
    /// Sleeping until a tick count is reached.
    Delay,
    /// Blocked on a semaphore, a mutex, a completion, or another task's exit.
    Waiting,
    /// Suspended until resumed explicitly.
    Pending,
    /// Exited, awaiting reclamation.
    Exit,
    /// Halted the system by overflowing its stack.
    Fatal,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Delay => "Delay",
            Self::Waiting => "Waiting",
            Self::Pending => "Pending",
            Self::Exit => "Exit",
            Self::Fatal => "Fatal",
        }
    }
}

/// Task state machine. The state determines which list the task's link
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    /// In `ready[priority]`
    Ready,
    /// In `delay_list`
    Delay,
    /// In the wait list of the target
    Waiting(WaitTarget),
    /// In `pend_list`
    Pending,
    /// In `exit_list`
    Exit,
    /// Unlinked
    Fatal,
}

impl From<TaskSt> for TaskState {
    fn from(x: TaskSt) -> Self {
        match x {
            TaskSt::Ready => Self::Ready,
            TaskSt::Delay => Self::Delay,
            TaskSt::Waiting(_) => Self::Waiting,
            TaskSt::Pending => Self::Pending,
            TaskSt::Exit => Self::Exit,
            TaskSt::Fatal => Self::Fatal,
        }
    }
}

/// A heap-allocated task stack.
pub(crate) struct StackRegion {
    base: NonNull<usize>,
    layout: Layout,
}

impl StackRegion {
    fn new(size: usize) -> Option<Self> {
        let layout = Layout::array::<usize>(size / mem::size_of::<usize>()).ok()?;
        debug_assert_ne!(layout.size(), 0);
        // Safety: `layout` has a non-zero size (`size >= MIN_STACK_SIZE`)
        let base = NonNull::new(unsafe { alloc(layout) }.cast::<usize>())?;
        Some(Self { base, layout })
    }

    fn range(&self) -> StackRange {
        StackRange {
            base: self.base,
            words: self.layout.size() / mem::size_of::<usize>(),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        // Safety: Allocated by `StackRegion::new` with the same layout
        unsafe { dealloc(self.base.as_ptr().cast(), self.layout) };
    }
}

/// *Task control block* - the state data of a task.
pub(crate) struct TaskCb<P: Port> {
    pub(crate) serial: u32,
    pub(crate) name: &'static str,
    pub(crate) priority: usize,
    pub(crate) flags: TaskFlags,
    pub(crate) st: TaskSt,
    pub(crate) link: Option<Link<usize>>,
    /// The tick count at which a task in the Delay state becomes ready.
    pub(crate) delay_ticks: Ticks,
    pub(crate) context_sp: usize,
    pub(crate) stack_floor: NonNull<usize>,
    pub(crate) parent: Option<Id>,
    /// Tasks waiting for this task to exit.
    pub(crate) joiners: ListHead<usize>,
    /// The exit code delivered to this task by the task it joined.
    pub(crate) wait_result: Option<i32>,
    pub(crate) exit_code: Option<i32>,
    // Dropped before `stack`
    pub(crate) port_task_state: P::PortTaskState,
    pub(crate) stack: StackRegion,
}

impl<P: Port> Linked<usize> for TaskCb<P> {
    #[inline]
    fn link(&self) -> &Option<Link<usize>> {
        &self.link
    }

    #[inline]
    fn link_mut(&mut self) -> &mut Option<Link<usize>> {
        &mut self.link
    }
}

impl<P: Port> Serial for TaskCb<P> {
    #[inline]
    fn serial(&self) -> u32 {
        self.serial
    }
}

impl<P: Port> fmt::Debug for TaskCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("serial", &self.serial)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("flags", &self.flags)
            .field("st", &self.st)
            .field("delay_ticks", &self.delay_ticks)
            .field("context_sp", &format_args!("{:#x}", self.context_sp))
            .field("stack_floor", &self.stack_floor)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

/// List transitions. Each of these keeps "the state names the list the task is
/// linked to" true.
impl<P: Port> State<P> {
    /// Transition `task` into the Ready state, appending it to the tail of its
    /// bucket. `task` must be unlinked.
    pub(crate) fn make_ready(&mut self, task: usize) {
        let priority = self.tasks[task].priority;
        self.tasks[task].st = TaskSt::Ready;
        self.ready.push_back(&mut self.tasks, task, priority);
    }

    /// Unlink `task` from the list its current state names. The state itself
    /// is left for the caller to update. A waiter's effect on the object it
    /// was waiting for is undone.
    pub(crate) fn unlink(&mut self, task: usize) {
        match self.tasks[task].st {
            TaskSt::Ready => {
                let priority = self.tasks[task].priority;
                self.ready.remove(&mut self.tasks, task, priority);
            }
            TaskSt::Delay => {
                ListAccessor::new(&mut self.delay_list, &mut self.tasks)
                    .remove(task)
                    .unwrap();
            }
            TaskSt::Pending => {
                ListAccessor::new(&mut self.pend_list, &mut self.tasks)
                    .remove(task)
                    .unwrap();
            }
            TaskSt::Exit => {
                ListAccessor::new(&mut self.exit_list, &mut self.tasks)
                    .remove(task)
                    .unwrap();
            }
            TaskSt::Waiting(target) => wait::abandon(self, target, task),
            TaskSt::Fatal => {}
        }
    }

    /// Transition the ready task `task` into the Pending state.
    pub(crate) fn suspend(&mut self, task: usize) {
        debug_assert_eq!(self.tasks[task].st, TaskSt::Ready);
        self.unlink(task);
        self.tasks[task].st = TaskSt::Pending;
        ListAccessor::new(&mut self.pend_list, &mut self.tasks)
            .push_back(task)
            .unwrap();
    }

    /// Make `task` ready if it's in the Pending state. Returns `true` if it
    /// was.
    pub(crate) fn resume(&mut self, task: usize) -> bool {
        if self.tasks[task].st != TaskSt::Pending {
            return false;
        }
        self.unlink(task);
        self.make_ready(task);
        true
    }

    /// Transition the ready task `task` into the Delay state until the tick
    /// count reaches `wake`.
    pub(crate) fn delay(&mut self, task: usize, wake: Ticks) {
        self.unlink(task);
        let cb = &mut self.tasks[task];
        cb.st = TaskSt::Delay;
        cb.delay_ticks = wake;

        // Insert after every entry with the same deadline
        let mut accessor = ListAccessor::new(&mut self.delay_list, &mut self.tasks);
        let at = accessor.find(|_, cb| cb.delay_ticks > wake);
        accessor.insert(task, at).unwrap();
    }

    /// Transition `task` into the Exit state and hand `exit_code` to the tasks
    /// joining it.
    pub(crate) fn retire(&mut self, task: usize, exit_code: i32) {
        self.unlink(task);
        let cb = &mut self.tasks[task];
        cb.st = TaskSt::Exit;
        cb.exit_code = Some(exit_code);
        log::debug!("task {:?} exited with code {exit_code}", cb.name);

        ListAccessor::new(&mut self.exit_list, &mut self.tasks)
            .push_back(task)
            .unwrap();

        let num_joiners = wait::wake_all(self, WaitTarget::Join(task), Some(exit_code));
        if num_joiners > 0 {
            log::trace!("woke up {num_joiners} joiner(s)");
        }
    }

    /// Make sure the exited tasks will be reclaimed by the high-priority system
    /// workqueue.
    pub(crate) fn queue_reclaim(&mut self) {
        if self.reclaim_queued {
            return;
        }
        let (Some([high, _]), Some(work)) = (self.system_workqueues, self.reclaim_work.clone())
        else {
            return;
        };
        match crate::workqueue::enqueue(self, high, work) {
            Ok(()) => self.reclaim_queued = true,
            Err(e) => log::warn!("couldn't queue the reclamation of exited tasks: {e:?}"),
        }
    }
}

/// A handle to a task.
pub struct Task<P: Port> {
    kernel: &'static Kernel<P>,
    id: Id,
}

impl_object_handle!(Task);

impl<P: Port> Kernel<P> {
    /// Relinquish CPU Lock. After that, if the task that should run isn't the
    /// running task, call [`Port::switch_context`].
    ///
    /// System services that transition a task into the Ready state, or the
    /// current task out of it, should call this before returning to the
    /// caller.
    pub(crate) fn unlock_cpu_and_check_preemption(&self, mut lock: CpuLockGuard<'_, P>) {
        let st = self.state.write(&mut *lock);
        let switch = st.started && st.sched_lock_count == 0 && st.ready.highest() != st.running;

        // Relinquish CPU Lock
        drop(lock);

        if switch {
            // Safety: CPU Lock inactive
            unsafe { self.port.switch_context() };
        }
    }

    /// Create a task. It starts running `entry` when it's chosen by the
    /// scheduler, and exits with the returned value as its exit code.
    ///
    /// A `priority` more urgent than [`KernelCfg::reserved_priority`] is
    /// replaced with the creating task's priority (or with the threshold
    /// itself when not called from a task).
    ///
    /// [`KernelCfg::reserved_priority`]: crate::KernelCfg::reserved_priority
    pub fn create_task(
        &'static self,
        name: &'static str,
        priority: usize,
        stack_size: usize,
        entry: impl FnOnce() -> i32 + Send + 'static,
    ) -> Result<Task<P>, CreateTaskError> {
        let id = self.spawn(name, priority, stack_size, TaskFlags::empty(), Box::new(entry))?;
        Ok(Task::from_id(self, id))
    }

    pub(crate) fn spawn(
        &'static self,
        name: &'static str,
        priority: usize,
        stack_size: usize,
        flags: TaskFlags,
        entry: Box<dyn FnOnce() -> i32 + Send>,
    ) -> Result<Id, CreateTaskError> {
        let is_idle = flags.contains(TaskFlags::IDLE);
        if priority >= NUM_TASK_PRIORITY_LEVELS
            || (priority == IDLE_PRIORITY) != is_idle
            || stack_size < MIN_STACK_SIZE
        {
            return Err(CreateTaskError::BadParam);
        }

        let (priority, parent) = {
            let mut lock = self.lock()?;
            let st = self.state.write(&mut *lock);
            let creator = st.expect_task_context(&self.port).ok();
            let priority =
                if flags.contains(TaskFlags::SYSTEM) || priority >= self.cfg.reserved_priority {
                    priority
                } else {
                    creator.map_or(self.cfg.reserved_priority, |c| st.tasks[c].priority)
                };
            (priority, creator.map(|c| Id::new(c, st.tasks[c].serial)))
        };

        let stack = StackRegion::new(stack_size).ok_or(CreateTaskError::NoMemory)?;
        let trampoline: TaskEntry = Box::new(move || {
            let exit_code = entry();
            self.exit_current(exit_code);
        });
        // Safety: The port state is dropped before `stack` (see `TaskCb`)
        let ctx = unsafe { self.port.initialize_task_state(stack.range(), trampoline) }
            .ok_or(CreateTaskError::NoMemory)?;
        // Safety: `stack_floor` points to the new task's stack, which isn't
        //         in use yet
        unsafe { ctx.stack_floor.as_ptr().write_volatile(STACK_MAGIC) };

        let mut lock = self.lock()?;
        let st = self.state.write(&mut *lock);
        let serial = st.next_serial();
        let index = st.tasks.insert(TaskCb {
            serial,
            name,
            priority,
            flags,
            st: TaskSt::Fatal,
            link: None,
            delay_ticks: 0,
            context_sp: ctx.sp,
            stack_floor: ctx.stack_floor,
            parent,
            joiners: ListHead::new(),
            wait_result: None,
            exit_code: None,
            port_task_state: ctx.state,
            stack,
        });
        st.make_ready(index);
        if is_idle {
            st.idle_task = Some(index);
        }
        log::debug!("created task {name:?} ({index}#{serial}) at priority {priority}");

        self.unlock_cpu_and_check_preemption(lock);
        Ok(Id::new(index, serial))
    }

    /// Retire the current task and switch away from it for good.
    pub(crate) fn exit_current(&self, exit_code: i32) -> ! {
        let Ok(mut lock) = self.lock() else {
            log::error!("a task exited inside a critical section");
            self.port.halt();
        };
        let st = self.state.write(&mut *lock);
        if let Ok(running) = st.expect_task_context(&self.port) {
            if st.sched_lock_count > 0 {
                log::warn!(
                    "task {:?} exited with the scheduler locked",
                    st.tasks[running].name
                );
                st.sched_lock_count = 0;
            }
            st.retire(running, exit_code);
            st.queue_reclaim();
        }

        // Leave the critical section without a preemption check. The task is
        // no longer ready, so `exit_and_switch` chooses another one.
        drop(lock);

        // Safety: CPU Lock inactive, and the current task has been retired
        unsafe { self.port.exit_and_switch() }
    }

    /// Terminate the current task with the specified exit code.
    pub fn exit_task(&self, exit_code: i32) -> Result<Infallible, BadContextError> {
        {
            let mut lock = self.lock()?;
            self.state
                .write(&mut *lock)
                .expect_task_context(&self.port)?;
        }
        self.exit_current(exit_code)
    }

    /// Get the current task.
    pub fn current_task(&'static self) -> Result<Task<P>, GetCurrentTaskError> {
        let mut lock = self.lock()?;
        let st = self.state.write(&mut *lock);
        let running = st.expect_task_context(&self.port)?;
        Ok(Task::from_id(
            self,
            Id::new(running, st.tasks[running].serial),
        ))
    }

    /// Block the current task for the specified number of ticks. Returns
    /// immediately if `ticks` is zero.
    pub fn delay_ticks(&self, ticks: Ticks) -> Result<(), DelayError> {
        let mut lock = self.lock()?;
        let st = self.state.write(&mut *lock);
        let running = st.expect_waitable_context(&self.port)?;
        if ticks == 0 {
            return Ok(());
        }

        let wake = st.systicks.saturating_add(ticks);
        st.delay(running, wake);
        log::trace!("task {running} sleeps until tick {wake}");

        self.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Disable preemption. Calls nest; each must be paired with
    /// [`Self::sched_unlock`]. Blocking operations fail with `BadContext`
    /// while preemption is disabled.
    pub fn sched_lock(&self) -> Result<(), BadContextError> {
        let mut lock = self.lock()?;
        let st = self.state.write(&mut *lock);
        st.expect_task_context(&self.port)?;
        st.sched_lock_count += 1;
        Ok(())
    }

    /// Undo one [`Self::sched_lock`]. Returns `BadContext` if preemption isn't
    /// disabled.
    pub fn sched_unlock(&self) -> Result<(), BadContextError> {
        let mut lock = self.lock()?;
        let st = self.state.write(&mut *lock);
        st.expect_task_context(&self.port)?;
        if st.sched_lock_count == 0 {
            return Err(BadContextError::BadContext);
        }
        st.sched_lock_count -= 1;
        self.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the number of ticks elapsed since the kernel was constructed.
    pub fn systicks(&self) -> Result<Ticks, BadContextError> {
        let mut lock = self.lock()?;
        Ok(self.state.write(&mut *lock).systicks)
    }

    /// Implements [`PortToKernel::save_context_sp`].
    ///
    /// [`PortToKernel::save_context_sp`]: crate::PortToKernel::save_context_sp
    pub(crate) fn save_context(&self, sp: usize) {
        let Ok(mut lock) = self.lock() else {
            log::error!("save_context_sp: CPU Lock is active");
            self.port.halt();
        };
        let st = self.state.write(&mut *lock);
        let Some(running) = st.running else { return };
        let Some(cb) = st.tasks.get_mut(running) else { return };
        cb.context_sp = sp;

        // Safety: The stack lives as long as the TCB
        let canary = unsafe { cb.stack_floor.as_ptr().read_volatile() };
        if canary != STACK_MAGIC {
            self.stack_overflow(lock, running, canary);
        }
    }

    /// The fatal path for a stack canary violation. Never returns.
    fn stack_overflow(&self, mut lock: CpuLockGuard<'_, P>, task: usize, canary: usize) -> ! {
        let st = self.state.write(&mut *lock);
        st.unlink(task);
        let cb = &mut st.tasks[task];
        cb.st = TaskSt::Fatal;

        log::error!("stack overflow detected in task {:?}", cb.name);
        log::error!(
            "    found {canary:#x} instead of {STACK_MAGIC:#x} at {:p}",
            cb.stack_floor
        );
        log::error!(
            "    priority = {}, sp = {:#x}, stack size = {} bytes",
            cb.priority,
            cb.context_sp,
            cb.stack.size()
        );
        log::error!("    systicks = {}", st.systicks);

        // CPU Lock stays active
        self.port.halt()
    }

    /// Implements [`PortToKernel::next_context_sp`].
    ///
    /// [`PortToKernel::next_context_sp`]: crate::PortToKernel::next_context_sp
    pub(crate) fn choose_next(&self) -> usize {
        let Ok(mut lock) = self.lock() else {
            log::error!("next_context_sp: CPU Lock is active");
            self.port.halt();
        };
        let st = self.state.write(&mut *lock);
        let Some(next) = st.ready.highest() else {
            log::error!("no runnable task");
            self.port.halt();
        };

        if st.running != Some(next) {
            log::trace!("switching to task {:?}", st.tasks[next].name);
            st.running = Some(next);
        }
        st.tasks[next].context_sp
    }

    /// Implements [`PortToKernel::systick_expiration`].
    ///
    /// [`PortToKernel::systick_expiration`]: crate::PortToKernel::systick_expiration
    pub(crate) fn systick(&self) {
        let Ok(mut lock) = self.lock() else {
            log::warn!("systick_expiration: CPU Lock is active; the tick is lost");
            return;
        };
        let st = self.state.write(&mut *lock);

        let idle = st.running.is_some() && st.running == st.idle_task;
        st.cpu_rate.sample(idle, self.cfg.cpu_rate_interval_ticks);

        st.systicks += 1;
        let now = st.systicks;

        // Wake up the delayed tasks that are due. The list is sorted, so stop
        // at the first one that isn't.
        loop {
            let mut accessor = ListAccessor::new(&mut st.delay_list, &mut st.tasks);
            let Some(first) = accessor.front() else { break };
            if accessor.pool()[first].delay_ticks > now {
                break;
            }
            accessor.remove(first).unwrap();
            st.make_ready(first);
        }

        crate::timer::expire(st, now);

        // Round-robin among the running task's peers
        if st.sched_lock_count == 0 {
            if let Some(running) = st.running {
                let cb = &st.tasks[running];
                if cb.st == TaskSt::Ready {
                    let priority = cb.priority;
                    st.ready.move_to_back(&mut st.tasks, running, priority);
                }
            }
        }

        self.unlock_cpu_and_check_preemption(lock);
    }
}

impl<P: Port> Task<P> {
    /// Get the kernel the task belongs to.
    #[inline]
    pub fn kernel(&self) -> &'static Kernel<P> {
        self.kernel
    }

    /// Get the task's name.
    pub fn name(&self) -> Result<&'static str, QueryTaskError> {
        self.query(|cb| cb.name)
    }

    /// Get the task's priority.
    pub fn priority(&self) -> Result<usize, QueryTaskError> {
        self.query(|cb| cb.priority)
    }

    /// Get the task's state.
    pub fn state(&self) -> Result<TaskState, QueryTaskError> {
        self.query(|cb| cb.st.into())
    }

    /// Get the task's attributes.
    pub fn flags(&self) -> Result<TaskFlags, QueryTaskError> {
        self.query(|cb| cb.flags)
    }

    /// Get the task that created this task. The returned handle may be stale.
    pub fn parent(&self) -> Result<Option<Task<P>>, QueryTaskError> {
        let kernel = self.kernel;
        self.query(|cb| cb.parent.map(|id| Task::from_id(kernel, id)))
    }

    fn query<R>(&self, f: impl FnOnce(&TaskCb<P>) -> R) -> Result<R, QueryTaskError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = st.task_index(self.id).ok_or(QueryTaskError::BadId)?;
        Ok(f(&st.tasks[index]))
    }

    /// Suspend the task until [`Self::resume`] is called.
    ///
    /// Pending a task that is already pending does nothing. Tasks blocked on a
    /// delay or an object can't be pended (`BadObjectState`), and neither can
    /// the running task while the scheduler is locked (`BadContext`).
    pub fn pend(&self) -> Result<(), PendTaskError> {
        let kernel = self.kernel;
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let index = st.task_index(self.id).ok_or(PendTaskError::BadId)?;
        if st.tasks[index].flags.contains(TaskFlags::SYSTEM) {
            return Err(PendTaskError::BadParam);
        }

        match st.tasks[index].st {
            TaskSt::Ready => {
                // A task holding the scheduler lock can't be switched away from
                if st.running == Some(index) && st.sched_lock_count > 0 {
                    return Err(PendTaskError::BadContext);
                }
                st.suspend(index);
                log::trace!("pended task {:?}", st.tasks[index].name);
            }
            TaskSt::Pending => return Ok(()),
            TaskSt::Delay | TaskSt::Waiting(_) => return Err(PendTaskError::BadObjectState),
            TaskSt::Exit | TaskSt::Fatal => return Err(PendTaskError::Already),
        }

        kernel.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Resume the task if it's pending. Does nothing otherwise.
    pub fn resume(&self) -> Result<(), ResumeTaskError> {
        let kernel = self.kernel;
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let index = st.task_index(self.id).ok_or(ResumeTaskError::BadId)?;
        if st.resume(index) {
            log::trace!("resumed task {:?}", st.tasks[index].name);
        }
        kernel.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Block the current task until this task exits, and get its exit code.
    pub fn join(&self) -> Result<i32, JoinTaskError> {
        let kernel = self.kernel;
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let running = st.expect_waitable_context(&kernel.port)?;
        let index = st.task_index(self.id).ok_or(JoinTaskError::BadId)?;
        if index == running {
            return Err(JoinTaskError::BadParam);
        }
        if matches!(st.tasks[index].st, TaskSt::Exit | TaskSt::Fatal) {
            return Err(JoinTaskError::Already);
        }

        wait::park(st, running, WaitTarget::Join(index));
        kernel.unlock_cpu_and_check_preemption(lock);

        // The target's `retire` stored its exit code
        let mut lock = kernel.lock()?;
        let exit_code = kernel.state.write(&mut *lock).tasks[running]
            .wait_result
            .take();
        Ok(exit_code.unwrap_or(EXIT_CODE_KILLED))
    }

    /// Terminate the task. Its joiners receive [`EXIT_CODE_KILLED`].
    ///
    /// Killing the current task doesn't return.
    pub fn kill(&self) -> Result<(), KillTaskError> {
        let kernel = self.kernel;
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let index = st.task_index(self.id).ok_or(KillTaskError::BadId)?;
        if st.tasks[index].flags.contains(TaskFlags::SYSTEM) {
            return Err(KillTaskError::BadParam);
        }
        if matches!(st.tasks[index].st, TaskSt::Exit | TaskSt::Fatal) {
            return Err(KillTaskError::Already);
        }

        if st.expect_task_context(&kernel.port) == Ok(index) {
            drop(lock);
            kernel.exit_current(EXIT_CODE_KILLED);
        }

        log::debug!("killing task {:?}", st.tasks[index].name);
        if st.running == Some(index) && st.sched_lock_count > 0 {
            // Killed by an interrupt handler while it held the scheduler lock
            log::warn!(
                "task {:?} was killed with the scheduler locked",
                st.tasks[index].name
            );
            st.sched_lock_count = 0;
        }
        st.retire(index, EXIT_CODE_KILLED);
        st.queue_reclaim();
        kernel.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}
