//! Mutexes
use core::fmt;

use crate::{
    error::{BadContextError, DeleteObjectError, PollError, QueryObjectError, SignalError, WaitError},
    semaphore::Semaphore,
    Id, Kernel, Port,
};

/// A mutual exclusion lock built on a semaphore with a count of one.
///
/// There's no ownership tracking nor priority inheritance. Unlocking a mutex
/// that isn't locked does nothing.
pub struct Mutex<P: Port> {
    sem: Semaphore<P>,
}

impl<P: Port> Clone for Mutex<P> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for Mutex<P> {}

impl<P: Port> PartialEq for Mutex<P> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.sem == other.sem
    }
}

impl<P: Port> Eq for Mutex<P> {}

impl<P: Port> fmt::Debug for Mutex<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Mutex").field(&self.sem.id()).finish()
    }
}

impl<P: Port> Mutex<P> {
    /// Create an unlocked mutex.
    pub fn new(kernel: &'static Kernel<P>) -> Result<Self, BadContextError> {
        Ok(Self {
            sem: Semaphore::with_value(kernel, 1)?,
        })
    }

    #[inline]
    pub fn id(&self) -> Id {
        self.sem.id()
    }

    /// Acquire the mutex, blocking the current task until it's available.
    pub fn lock(&self) -> Result<(), WaitError> {
        self.sem.wait()
    }

    /// Acquire the mutex if it's available.
    pub fn try_lock(&self) -> Result<(), PollError> {
        self.sem.try_wait()
    }

    /// Release the mutex, handing it to the first waiter if any.
    pub fn unlock(&self) -> Result<(), SignalError> {
        self.sem.signal(Some(1))
    }

    pub fn is_locked(&self) -> Result<bool, QueryObjectError> {
        Ok(self.sem.value()? <= 0)
    }

    /// Delete the mutex. Fails with `Busy` while tasks are waiting on it.
    pub fn delete(self) -> Result<(), DeleteObjectError> {
        self.sem.delete()
    }
}
