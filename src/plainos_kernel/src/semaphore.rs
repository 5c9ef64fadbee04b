//! Semaphores
use crate::{
    error::{
        BadContextError, CreateSemaphoreError, DeleteObjectError, PollError, QueryObjectError,
        SignalError, WaitError,
    },
    state::{resolve, Serial},
    utils::intrusive_list::ListHead,
    wait::{self, WaitTarget},
    Id, Kernel, Port,
};

/// *Semaphore control block* - the state data of a semaphore.
pub(crate) struct SemaphoreCb {
    pub(crate) serial: u32,
    /// The count. A negative value `-n` means `n` tasks are waiting.
    pub(crate) value: isize,
    pub(crate) waiters: ListHead<usize>,
}

impl Serial for SemaphoreCb {
    #[inline]
    fn serial(&self) -> u32 {
        self.serial
    }
}

/// A counting semaphore.
///
/// The count goes negative while tasks are waiting: a count of `-n` means `n`
/// tasks are parked on the semaphore. Waiters are woken in FIFO order.
pub struct Semaphore<P: Port> {
    kernel: &'static Kernel<P>,
    id: Id,
}

impl_object_handle!(Semaphore);

impl<P: Port> Semaphore<P> {
    /// Create a semaphore with the specified initial count.
    ///
    /// Fails with `BadParam` if `initial` exceeds `isize::MAX`.
    pub fn new(kernel: &'static Kernel<P>, initial: usize) -> Result<Self, CreateSemaphoreError> {
        let value = isize::try_from(initial).map_err(|_| CreateSemaphoreError::BadParam)?;
        Ok(Self::with_value(kernel, value)?)
    }

    pub(crate) fn with_value(
        kernel: &'static Kernel<P>,
        value: isize,
    ) -> Result<Self, BadContextError> {
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let serial = st.next_serial();
        let index = st.semaphores.insert(SemaphoreCb {
            serial,
            value,
            waiters: ListHead::new(),
        });
        Ok(Self::from_id(kernel, Id::new(index, serial)))
    }

    /// Take one unit, blocking the current task if none is available.
    pub fn wait(&self) -> Result<(), WaitError> {
        let kernel = self.kernel;
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let running = st.expect_waitable_context(&kernel.port)?;
        let index = resolve(&st.semaphores, self.id).ok_or(WaitError::BadId)?;

        let cb = &mut st.semaphores[index];
        cb.value -= 1;
        if cb.value < 0 {
            wait::park(st, running, WaitTarget::Semaphore(index));
            kernel.unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Take one unit if it's available without blocking.
    pub fn try_wait(&self) -> Result<(), PollError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.semaphores, self.id).ok_or(PollError::BadId)?;

        let cb = &mut st.semaphores[index];
        if cb.value > 0 {
            cb.value -= 1;
            Ok(())
        } else {
            Err(PollError::Busy)
        }
    }

    /// Give back one unit, waking up the first waiter if any. Can be called
    /// from an interrupt handler.
    pub fn post(&self) -> Result<(), SignalError> {
        self.signal(None)
    }

    /// Like [`Self::post`], but does nothing if the count is already `max` or
    /// higher.
    pub(crate) fn signal(&self, max: Option<isize>) -> Result<(), SignalError> {
        let kernel = self.kernel;
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let index = resolve(&st.semaphores, self.id).ok_or(SignalError::BadId)?;

        let cb = &mut st.semaphores[index];
        if max.map_or(false, |max| cb.value >= max) {
            return Ok(());
        }
        let old_value = cb.value;
        cb.value = old_value.checked_add(1).ok_or(SignalError::Full)?;
        if old_value < 0 {
            wait::wake_one(st, WaitTarget::Semaphore(index), None);
            kernel.unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Get the current count.
    pub fn value(&self) -> Result<isize, QueryObjectError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.semaphores, self.id).ok_or(QueryObjectError::BadId)?;
        Ok(st.semaphores[index].value)
    }

    /// Get the number of tasks waiting on the semaphore.
    pub fn num_waiters(&self) -> Result<usize, QueryObjectError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.semaphores, self.id).ok_or(QueryObjectError::BadId)?;
        Ok(wait::num_waiters(st, WaitTarget::Semaphore(index)))
    }

    /// Delete the semaphore. Fails with `Busy` while tasks are waiting on it.
    pub fn delete(self) -> Result<(), DeleteObjectError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.semaphores, self.id).ok_or(DeleteObjectError::BadId)?;
        if !st.semaphores[index].waiters.is_empty() {
            return Err(DeleteObjectError::Busy);
        }
        st.semaphores.remove(index);
        Ok(())
    }
}
