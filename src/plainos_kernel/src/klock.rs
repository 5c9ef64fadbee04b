//! Kernel state locking mechanism
use core::{
    ops,
    sync::atomic::{AtomicBool, Ordering},
};
use tokenlock::{Token, TokenLock};

use crate::{error::BadContextError, Port};

/// The keyhole type for [`CpuLockCell`]. Each kernel instance has its own
/// keyhole so that a token issued by one kernel never unlocks the state of
/// another.
pub(crate) struct CpuLockKeyhole {
    kernel_id: usize,
}

/// The key that "unlocks" [`CpuLockCell`]. Only [`lock_cpu`] creates it.
pub(crate) struct CpuLockToken {
    kernel_id: usize,
}

// Safety: `CpuLockToken` is only created by `lock_cpu` while the CPU Lock of
//         the kernel identified by `kernel_id` is held, and there's at most one
//         such token per kernel at any moment.
unsafe impl Token<CpuLockKeyhole> for CpuLockToken {
    fn eq_id(&self, keyhole: &CpuLockKeyhole) -> bool {
        self.kernel_id == keyhole.kernel_id
    }
}

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub(crate) type CpuLockCell<T> = TokenLock<T, CpuLockKeyhole>;

/// The CPU Lock state of a kernel instance.
pub(crate) struct CpuLock {
    kernel_id: usize,
    active: AtomicBool,
}

impl CpuLock {
    pub(crate) fn new() -> Self {
        Self {
            kernel_id: next_kernel_id(),
            active: AtomicBool::new(false),
        }
    }

    /// Construct a [`CpuLockCell`] that can be unlocked by this lock.
    pub(crate) fn new_cell<T>(&self, x: T) -> CpuLockCell<T> {
        TokenLock::new(
            CpuLockKeyhole {
                kernel_id: self.kernel_id,
            },
            x,
        )
    }
}

#[cfg(target_has_atomic = "ptr")]
fn next_kernel_id() -> usize {
    use core::sync::atomic::AtomicUsize;
    static NEXT_KERNEL_ID: AtomicUsize = AtomicUsize::new(0);
    NEXT_KERNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Targets without atomic read-modify-write operations only ever host a
/// single kernel instance.
#[cfg(not(target_has_atomic = "ptr"))]
fn next_kernel_id() -> usize {
    0
}

/// Attempt to enter a CPU Lock state and get an RAII guard.
/// Return `BadContext` if the kernel is already in a CPU Lock state.
pub(crate) fn lock_cpu<'a, P: Port>(
    port: &'a P,
    lock: &'a CpuLock,
) -> Result<CpuLockGuard<'a, P>, BadContextError> {
    // Safety: The critical section is left by `CpuLockGuard::drop` or below
    unsafe { port.enter_critical() };

    if lock.active.load(Ordering::Acquire) {
        // Safety: We entered it just above
        unsafe { port.exit_critical() };
        return Err(BadContextError::BadContext);
    }
    lock.active.store(true, Ordering::Relaxed);

    Ok(CpuLockGuard {
        port,
        lock,
        token: CpuLockToken {
            kernel_id: lock.kernel_id,
        },
    })
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(crate) struct CpuLockGuard<'a, P: Port> {
    port: &'a P,
    lock: &'a CpuLock,
    token: CpuLockToken,
}

impl<P: Port> Drop for CpuLockGuard<'_, P> {
    fn drop(&mut self) {
        // The flag must be cleared first; leaving the critical section may
        // switch to another context that locks the kernel.
        self.lock.active.store(false, Ordering::Release);

        // Safety: CPU Lock is currently active, and it's us (the kernel) who
        // are currently controlling the CPU Lock state
        unsafe { self.port.exit_critical() };
    }
}

impl<P: Port> ops::Deref for CpuLockGuard<'_, P> {
    type Target = CpuLockToken;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: Port> ops::DerefMut for CpuLockGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
