//! Error codes.
//!
//! Every fallible kernel operation returns a small, operation-specific error
//! enum. All of them share their discriminants with [`ResultCode`], so
//! converting one into the signed integer result used at the C-style API
//! surface is free.
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use plainos_kernel::ResultCode;
            /// assert_eq!(ResultCode::Already.as_str(), "Already");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the kernel can report.
    ///
    /// The values follow the POSIX `errno` numbers of the closest equivalent
    /// condition, negated.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// The current context disallows the operation: it was invoked from an
        /// interrupt handler, while the scheduler is locked, or while the kernel
        /// is already inside a critical section of its own.
        BadContext = -1,
        /// The object handle refers to an object that doesn't exist (anymore).
        BadId = -3,
        /// The memory pool couldn't satisfy an allocation request.
        NoMemory = -12,
        /// The object is busy: a timer is already armed, or an object that is
        /// being destroyed still has tasks parked on it.
        Busy = -16,
        /// A parameter is invalid in a way that is not covered by any other error
        /// codes.
        BadParam = -22,
        /// There is nothing to operate on, e.g., the timer being cancelled isn't
        /// armed.
        Empty = -61,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -77,
        /// A ring buffer has no room for another entry.
        Full = -105,
        /// The operation has already happened, e.g., the task being joined has
        /// already exited.
        Already = -114,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod bad_context_error {}
    /// Error type for operations that only fail because of the calling
    /// context, e.g., [`Kernel::sched_lock`].
    ///
    /// [`Kernel::sched_lock`]: crate::Kernel::sched_lock
    pub enum BadContextError {
        BadContext,
    }
}

define_error! {
    mod init_error {}
    /// Error type for [`Kernel::init`].
    ///
    /// [`Kernel::init`]: crate::Kernel::init
    pub enum InitError: BadContextError {
        /// The kernel was already initialized.
        BadContext,
        /// The configuration is inconsistent.
        BadParam,
        /// A system task's stack couldn't be allocated.
        NoMemory,
    }
}

define_error! {
    mod create_task_error {}
    /// Error type for [`Kernel::create_task`].
    ///
    /// [`Kernel::create_task`]: crate::Kernel::create_task
    pub enum CreateTaskError: BadContextError {
        BadContext,
        /// The priority is out of range, or the stack is too small.
        BadParam,
        /// The stack couldn't be allocated.
        NoMemory,
    }
}

define_error! {
    mod get_current_task_error {}
    /// Error type for [`Kernel::current_task`].
    ///
    /// [`Kernel::current_task`]: crate::Kernel::current_task
    pub enum GetCurrentTaskError: BadContextError {
        /// Not called from a task context.
        BadContext,
    }
}

define_error! {
    mod delay_error {}
    /// Error type for [`Kernel::delay_ticks`].
    ///
    /// [`Kernel::delay_ticks`]: crate::Kernel::delay_ticks
    pub enum DelayError: BadContextError {
        /// Not called from a task context, or the scheduler is locked.
        BadContext,
    }
}

define_error! {
    mod query_task_error {}
    /// Error type for task queries such as [`Task::state`].
    ///
    /// [`Task::state`]: crate::Task::state
    pub enum QueryTaskError: BadContextError {
        BadContext,
        /// The task has been reclaimed.
        BadId,
    }
}

define_error! {
    mod pend_task_error {}
    /// Error type for [`Task::pend`].
    ///
    /// [`Task::pend`]: crate::Task::pend
    pub enum PendTaskError: BadContextError {
        BadContext,
        BadId,
        /// The target is a system task.
        BadParam,
        /// The task is blocked on a delay or a synchronization object.
        BadObjectState,
        /// The task has exited.
        Already,
    }
}

define_error! {
    mod resume_task_error {}
    /// Error type for [`Task::resume`].
    ///
    /// [`Task::resume`]: crate::Task::resume
    pub enum ResumeTaskError: BadContextError {
        BadContext,
        BadId,
    }
}

define_error! {
    mod join_task_error {}
    /// Error type for [`Task::join`].
    ///
    /// [`Task::join`]: crate::Task::join
    pub enum JoinTaskError: BadContextError {
        BadContext,
        /// The task has been reclaimed.
        BadId,
        /// The caller tried to join itself.
        BadParam,
        /// The task has already exited; its exit code was delivered to the
        /// tasks that were joining it at that time.
        Already,
    }
}

define_error! {
    mod kill_task_error {}
    /// Error type for [`Task::kill`].
    ///
    /// [`Task::kill`]: crate::Task::kill
    pub enum KillTaskError: BadContextError {
        BadContext,
        BadId,
        /// The target is a system task.
        BadParam,
        /// The task has already exited.
        Already,
    }
}

define_error! {
    mod wait_error {}
    /// Error type for blocking operations on synchronization objects, e.g.,
    /// [`Semaphore::wait`].
    ///
    /// [`Semaphore::wait`]: crate::Semaphore::wait
    pub enum WaitError: BadContextError {
        /// Not called from a task context, or the scheduler is locked.
        BadContext,
        /// The object has been deleted.
        BadId,
    }
}

define_error! {
    mod poll_error {}
    /// Error type for non-blocking acquisitions, e.g.,
    /// [`Semaphore::try_wait`].
    ///
    /// [`Semaphore::try_wait`]: crate::Semaphore::try_wait
    pub enum PollError: BadContextError {
        BadContext,
        BadId,
        /// The operation would block.
        Busy,
    }
}

define_error! {
    mod signal_error {}
    /// Error type for releasing operations, e.g., [`Semaphore::post`].
    ///
    /// [`Semaphore::post`]: crate::Semaphore::post
    pub enum SignalError: BadContextError {
        BadContext,
        BadId,
        /// The semaphore's count is at its maximum.
        Full,
    }
}

define_error! {
    mod create_semaphore_error {}
    /// Error type for [`Semaphore::new`].
    ///
    /// [`Semaphore::new`]: crate::Semaphore::new
    pub enum CreateSemaphoreError: BadContextError {
        BadContext,
        /// The initial count doesn't fit in the semaphore's counter.
        BadParam,
    }
}

define_error! {
    mod query_object_error {}
    /// Error type for object queries, e.g., [`Semaphore::value`].
    ///
    /// [`Semaphore::value`]: crate::Semaphore::value
    pub enum QueryObjectError: BadContextError {
        BadContext,
        BadId,
    }
}

define_error! {
    mod delete_object_error {}
    /// Error type for object destruction, e.g., [`Semaphore::delete`].
    ///
    /// [`Semaphore::delete`]: crate::Semaphore::delete
    pub enum DeleteObjectError: BadContextError {
        BadContext,
        BadId,
        /// Tasks are still parked on the object.
        Busy,
    }
}

define_error! {
    mod init_timer_error {}
    /// Error type for [`SoftTimer::init`] and [`SoftTimer::reload`].
    ///
    /// [`SoftTimer::init`]: crate::SoftTimer::init
    /// [`SoftTimer::reload`]: crate::SoftTimer::reload
    pub enum InitTimerError: BadContextError {
        BadContext,
        BadId,
        /// The timer is armed; its parameters can't change until it fires or
        /// is cancelled.
        Busy,
    }
}

define_error! {
    mod start_timer_error {}
    /// Error type for [`SoftTimer::start`].
    ///
    /// [`SoftTimer::start`]: crate::SoftTimer::start
    pub enum StartTimerError: BadContextError {
        BadContext,
        BadId,
        /// The timer is already armed.
        Busy,
        /// The timer has no callback: it was never initialized, or it was
        /// cancelled.
        BadObjectState,
    }
}

define_error! {
    mod cancel_timer_error {}
    /// Error type for [`SoftTimer::cancel`].
    ///
    /// [`SoftTimer::cancel`]: crate::SoftTimer::cancel
    pub enum CancelTimerError: BadContextError {
        BadContext,
        BadId,
        /// The timer isn't armed, or it's a one-shot timer whose callback is
        /// running.
        Empty,
    }
}

define_error! {
    mod create_workqueue_error {}
    /// Error type for [`Workqueue::create`].
    ///
    /// [`Workqueue::create`]: crate::Workqueue::create
    pub enum CreateWorkqueueError: BadContextError {
        BadContext,
        /// The capacity isn't a power of two (or is smaller than two), or the
        /// executor parameters were rejected.
        BadParam,
        /// The ring or the executor's stack couldn't be allocated.
        NoMemory,
    }
}

define_error! {
    mod add_work_error {}
    /// Error type for [`Workqueue::add`].
    ///
    /// [`Workqueue::add`]: crate::Workqueue::add
    pub enum AddWorkError: BadContextError {
        BadContext,
        BadId,
        /// The ring has at most one free slot left.
        Full,
    }
}

define_error! {
    mod destroy_workqueue_error {}
    /// Error type for [`Workqueue::destroy`].
    ///
    /// [`Workqueue::destroy`]: crate::Workqueue::destroy
    pub enum DestroyWorkqueueError: BadContextError {
        BadContext,
        BadId,
        /// The workqueue is one of the kernel's system workqueues.
        BadParam,
    }
}

impl From<CreateTaskError> for CreateWorkqueueError {
    #[inline]
    fn from(x: CreateTaskError) -> Self {
        match x {
            CreateTaskError::BadContext => Self::BadContext,
            CreateTaskError::BadParam => Self::BadParam,
            CreateTaskError::NoMemory => Self::NoMemory,
        }
    }
}

impl From<CreateTaskError> for InitError {
    #[inline]
    fn from(x: CreateTaskError) -> Self {
        match x {
            CreateTaskError::BadContext => Self::BadContext,
            CreateTaskError::BadParam => Self::BadParam,
            CreateTaskError::NoMemory => Self::NoMemory,
        }
    }
}

impl From<CreateWorkqueueError> for InitError {
    #[inline]
    fn from(x: CreateWorkqueueError) -> Self {
        match x {
            CreateWorkqueueError::BadContext => Self::BadContext,
            CreateWorkqueueError::BadParam => Self::BadParam,
            CreateWorkqueueError::NoMemory => Self::NoMemory,
        }
    }
}
