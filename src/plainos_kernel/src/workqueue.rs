//! Workqueues
//!
//! A workqueue is a ring of work items drained by a dedicated executor task.
//! The executor pends itself when the ring is empty; [`Workqueue::add`]
//! resumes it.
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::fmt;

use crate::{
    cfg::is_valid_ring_capacity,
    error::{AddWorkError, CreateWorkqueueError, DestroyWorkqueueError, KillTaskError, QueryObjectError},
    state::{resolve, Serial, State},
    task::{Task, TaskFlags},
    utils::intrusive_list::ListAccessor,
    Id, Kernel, Port,
};

/// A unit of deferred work. Cloning is cheap; all clones run the same closure.
#[derive(Clone)]
pub struct Work(Arc<dyn Fn() + Send + Sync + 'static>);

impl Work {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Run the work in the current context.
    #[inline]
    pub fn run(&self) {
        (self.0)()
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Work")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// Selects one of the kernel's system workqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemWorkqueue {
    /// Runs at [`KernelCfg::high_workqueue_priority`]. Also reclaims exited
    /// tasks.
    ///
    /// [`KernelCfg::high_workqueue_priority`]: crate::KernelCfg::high_workqueue_priority
    High,
    /// Runs at [`KernelCfg::low_workqueue_priority`].
    ///
    /// [`KernelCfg::low_workqueue_priority`]: crate::KernelCfg::low_workqueue_priority
    Low,
}

/// *Workqueue control block* - the state data of a workqueue.
pub(crate) struct WorkqueueCb {
    pub(crate) serial: u32,
    pub(crate) name: &'static str,
    pub(crate) executor: Option<Id>,
    /// The length is a power of two. One slot is always left empty.
    ring: Vec<Option<Work>>,
    /// The next slot to fill
    in_: usize,
    /// The next slot to drain
    out: usize,
    pub(crate) system: bool,
}

impl Serial for WorkqueueCb {
    #[inline]
    fn serial(&self) -> u32 {
        self.serial
    }
}

impl WorkqueueCb {
    fn new(
        serial: u32,
        name: &'static str,
        capacity: usize,
        system: bool,
    ) -> Result<Self, CreateWorkqueueError> {
        if !is_valid_ring_capacity(capacity) {
            return Err(CreateWorkqueueError::BadParam);
        }
        let mut ring = Vec::new();
        ring.try_reserve_exact(capacity)
            .map_err(|_| CreateWorkqueueError::NoMemory)?;
        ring.resize_with(capacity, || None);
        Ok(Self {
            serial,
            name,
            executor: None,
            ring,
            in_: 0,
            out: 0,
            system,
        })
    }

    #[inline]
    fn mask(&self) -> usize {
        self.ring.len() - 1
    }

    /// The number of queued items.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.in_.wrapping_sub(self.out) & self.mask()
    }

    fn push(&mut self, work: Work) -> Result<(), AddWorkError> {
        if self.ring.len() - self.len() <= 1 {
            return Err(AddWorkError::Full);
        }
        self.ring[self.in_] = Some(work);
        self.in_ = (self.in_ + 1) & self.mask();
        Ok(())
    }

    fn pop(&mut self) -> Option<Work> {
        if self.in_ == self.out {
            return None;
        }
        let work = self.ring[self.out].take();
        self.out = (self.out + 1) & self.mask();
        work
    }
}

/// Append `work` to the workqueue `id` and resume its executor.
pub(crate) fn enqueue<P: Port>(st: &mut State<P>, id: Id, work: Work) -> Result<(), AddWorkError> {
    let index = resolve(&st.workqueues, id).ok_or(AddWorkError::BadId)?;
    st.workqueues[index].push(work)?;

    let executor = st.workqueues[index].executor;
    match executor.and_then(|executor| st.task_index(executor)) {
        Some(executor) => {
            st.resume(executor);
        }
        None => log::warn!("workqueue {:?} has no executor", st.workqueues[index].name),
    }
    Ok(())
}

/// The body of an executor task.
fn executor_main<P: Port>(kernel: &'static Kernel<P>, id: Id) -> i32 {
    loop {
        let Ok(mut lock) = kernel.lock() else {
            log::error!("workqueue executor: CPU Lock is active");
            return -1;
        };
        let st = kernel.state.write(&mut *lock);
        let Some(index) = resolve(&st.workqueues, id) else {
            // Destroyed
            return 0;
        };

        match st.workqueues[index].pop() {
            Some(work) => {
                drop(lock);
                work.run();
            }
            None => {
                if let Ok(me) = st.expect_task_context(&kernel.port) {
                    st.suspend(me);
                }
                kernel.unlock_cpu_and_check_preemption(lock);
            }
        }
    }
}

/// Create a workqueue and its executor.
pub(crate) fn create<P: Port>(
    kernel: &'static Kernel<P>,
    name: &'static str,
    priority: usize,
    stack_size: usize,
    capacity: usize,
    flags: TaskFlags,
) -> Result<Id, CreateWorkqueueError> {
    let id = {
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let serial = st.next_serial();
        let cb = WorkqueueCb::new(serial, name, capacity, flags.contains(TaskFlags::SYSTEM))?;
        Id::new(st.workqueues.insert(cb), serial)
    };

    let spawned = kernel.spawn(
        name,
        priority,
        stack_size,
        flags,
        Box::new(move || executor_main(kernel, id)),
    );

    let mut lock = kernel.lock()?;
    let st = kernel.state.write(&mut *lock);
    match spawned {
        Ok(executor) => {
            st.workqueues[id.index()].executor = Some(executor);
            log::debug!("created workqueue {name:?} with {capacity} slots");
            Ok(id)
        }
        Err(e) => {
            st.workqueues.remove(id.index());
            Err(e.into())
        }
    }
}

/// A handle to a workqueue.
pub struct Workqueue<P: Port> {
    kernel: &'static Kernel<P>,
    id: Id,
}

impl_object_handle!(Workqueue);

impl<P: Port> Workqueue<P> {
    /// Create a workqueue with `capacity` ring slots (a power of two, at least
    /// two) and an executor task with the specified parameters. The ring holds
    /// up to `capacity - 1` items.
    pub fn create(
        kernel: &'static Kernel<P>,
        name: &'static str,
        priority: usize,
        stack_size: usize,
        capacity: usize,
    ) -> Result<Self, CreateWorkqueueError> {
        let id = create(kernel, name, priority, stack_size, capacity, TaskFlags::empty())?;
        Ok(Self::from_id(kernel, id))
    }

    /// Queue a clone of `work`. Can be called from an interrupt handler.
    pub fn add(&self, work: &Work) -> Result<(), AddWorkError> {
        let kernel = self.kernel;
        let mut lock = kernel.lock()?;
        enqueue(kernel.state.write(&mut *lock), self.id, work.clone())?;
        kernel.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the number of queued items.
    pub fn len(&self) -> Result<usize, QueryObjectError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.workqueues, self.id).ok_or(QueryObjectError::BadId)?;
        Ok(st.workqueues[index].len())
    }

    /// Get the executor task.
    pub fn executor(&self) -> Result<Task<P>, QueryObjectError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.workqueues, self.id).ok_or(QueryObjectError::BadId)?;
        let executor = st.workqueues[index]
            .executor
            .ok_or(QueryObjectError::BadId)?;
        Ok(Task::from_id(self.kernel, executor))
    }

    /// Discard the queued items and terminate the executor. System workqueues
    /// can't be destroyed.
    pub fn destroy(self) -> Result<(), DestroyWorkqueueError> {
        let kernel = self.kernel;
        let cb = {
            let mut lock = kernel.lock()?;
            let st = kernel.state.write(&mut *lock);
            let index = resolve(&st.workqueues, self.id).ok_or(DestroyWorkqueueError::BadId)?;
            if st.workqueues[index].system {
                return Err(DestroyWorkqueueError::BadParam);
            }
            st.workqueues.remove(index)
        };
        log::debug!("destroying workqueue {:?} ({} items dropped)", cb.name, cb.len());
        let executor = cb.executor;
        // The work items are dropped outside the critical section
        drop(cb);

        if let Some(executor) = executor {
            match Task::from_id(kernel, executor).kill() {
                Ok(()) | Err(KillTaskError::BadId | KillTaskError::Already) => {}
                Err(e) => log::warn!("couldn't kill the executor of a destroyed workqueue: {e:?}"),
            }
        }
        Ok(())
    }
}

impl<P: Port> Kernel<P> {
    /// Get one of the system workqueues. Returns `None` before [`Self::init`].
    pub fn system_workqueue(&'static self, which: SystemWorkqueue) -> Option<Workqueue<P>> {
        let mut lock = self.lock().ok()?;
        let [high, low] = self.state.write(&mut *lock).system_workqueues?;
        let id = match which {
            SystemWorkqueue::High => high,
            SystemWorkqueue::Low => low,
        };
        Some(Workqueue::from_id(self, id))
    }

    /// Reclaim the exited tasks. Runs on the high-priority system workqueue.
    pub(crate) fn reclaim_exited(&self) {
        let Ok(mut lock) = self.lock() else { return };
        let st = self.state.write(&mut *lock);
        st.reclaim_queued = false;

        let mut reclaimed = Vec::new();
        loop {
            let exited = ListAccessor::new(&mut st.exit_list, &mut st.tasks).pop_front();
            let Some(task) = exited else { break };
            reclaimed.push(st.tasks.remove(task));
        }
        drop(lock);

        for cb in &reclaimed {
            log::debug!("reclaimed task {:?} (exit code {:?})", cb.name, cb.exit_code);
        }
        // Stacks and port states are released outside the critical section
        drop(reclaimed);
    }
}
