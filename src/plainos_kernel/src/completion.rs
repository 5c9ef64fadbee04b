//! Completions
use crate::{
    error::{BadContextError, DeleteObjectError, PollError, QueryObjectError, SignalError, WaitError},
    state::{resolve, Serial},
    utils::intrusive_list::ListHead,
    wait::{self, WaitTarget},
    Id, Kernel, Port,
};

/// *Completion control block* - the state data of a completion.
pub(crate) struct CompletionCb {
    pub(crate) serial: u32,
    /// Set by a post that found no waiter. Consumed by the next wait.
    pub(crate) done: bool,
    pub(crate) waiters: ListHead<usize>,
}

impl Serial for CompletionCb {
    #[inline]
    fn serial(&self) -> u32 {
        self.serial
    }
}

/// A one-shot event that tasks can wait for.
///
/// [`post`] wakes one waiter; if nobody is waiting, it latches a done flag that
/// the next [`wait`] consumes without blocking. [`post_all`] wakes every
/// waiter at once.
///
/// [`post`]: Self::post
/// [`wait`]: Self::wait
/// [`post_all`]: Self::post_all
pub struct Completion<P: Port> {
    kernel: &'static Kernel<P>,
    id: Id,
}

impl_object_handle!(Completion);

impl<P: Port> Completion<P> {
    pub fn new(kernel: &'static Kernel<P>) -> Result<Self, BadContextError> {
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let serial = st.next_serial();
        let index = st.completions.insert(CompletionCb {
            serial,
            done: false,
            waiters: ListHead::new(),
        });
        Ok(Self::from_id(kernel, Id::new(index, serial)))
    }

    /// Block the current task until the completion is posted. Returns
    /// immediately (clearing the done flag) if it has been posted already.
    pub fn wait(&self) -> Result<(), WaitError> {
        let kernel = self.kernel;
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let running = st.expect_waitable_context(&kernel.port)?;
        let index = resolve(&st.completions, self.id).ok_or(WaitError::BadId)?;

        let cb = &mut st.completions[index];
        if cb.done {
            cb.done = false;
            return Ok(());
        }
        wait::park(st, running, WaitTarget::Completion(index));
        kernel.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Consume the done flag if it's set.
    pub fn try_wait(&self) -> Result<(), PollError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.completions, self.id).ok_or(PollError::BadId)?;

        let cb = &mut st.completions[index];
        if cb.done {
            cb.done = false;
            Ok(())
        } else {
            Err(PollError::Busy)
        }
    }

    /// Wake up the first waiter, or set the done flag if there's none. Can be
    /// called from an interrupt handler.
    pub fn post(&self) -> Result<(), SignalError> {
        let kernel = self.kernel;
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let index = resolve(&st.completions, self.id).ok_or(SignalError::BadId)?;

        if wait::wake_one(st, WaitTarget::Completion(index), None).is_none() {
            st.completions[index].done = true;
        }
        kernel.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wake up every waiter. The done flag isn't touched.
    pub fn post_all(&self) -> Result<(), SignalError> {
        let kernel = self.kernel;
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let index = resolve(&st.completions, self.id).ok_or(SignalError::BadId)?;

        let count = wait::wake_all(st, WaitTarget::Completion(index), None);
        log::trace!("completion {}: woke up {count} task(s)", self.id);
        kernel.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the done flag.
    pub fn is_done(&self) -> Result<bool, QueryObjectError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.completions, self.id).ok_or(QueryObjectError::BadId)?;
        Ok(st.completions[index].done)
    }

    /// Delete the completion. Fails with `Busy` while tasks are waiting on it.
    pub fn delete(self) -> Result<(), DeleteObjectError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.completions, self.id).ok_or(DeleteObjectError::BadId)?;
        if !st.completions[index].waiters.is_empty() {
            return Err(DeleteObjectError::Busy);
        }
        st.completions.remove(index);
        Ok(())
    }
}
