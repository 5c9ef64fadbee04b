//! Software timers
//!
//! Armed timers are kept in a list sorted by deadline. The tick handler moves
//! the expired prefix of the list to the due list and resumes the timer daemon,
//! a system task that runs the callbacks outside the interrupt context.
use alloc::sync::Arc;

use crate::{
    error::{BadContextError, CancelTimerError, DeleteObjectError, InitTimerError, QueryObjectError, StartTimerError},
    state::{resolve, Serial, State},
    utils::intrusive_list::{Link, Linked, ListAccessor},
    Id, Kernel, Port, Ticks,
};

/// A timer callback.
pub(crate) type TimerFn = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerSt {
    /// Not in any list.
    Idle,
    /// In `timer_list`
    Armed,
    /// In `timer_due`
    Due,
    /// Not in any list. The daemon is running the callback and re-arms the
    /// timer afterwards if it's periodic.
    Firing,
}

/// *Timer control block* - the state data of a software timer.
pub(crate) struct TimerCb {
    pub(crate) serial: u32,
    pub(crate) name: &'static str,
    /// Detached while the callback runs and when the timer is cancelled.
    pub(crate) fun: Option<TimerFn>,
    /// The period, in ticks.
    pub(crate) timing: Ticks,
    /// The deadline of an armed timer.
    pub(crate) reach: Ticks,
    pub(crate) reload: bool,
    pub(crate) st: TimerSt,
    pub(crate) link: Option<Link<usize>>,
}

impl Linked<usize> for TimerCb {
    #[inline]
    fn link(&self) -> &Option<Link<usize>> {
        &self.link
    }

    #[inline]
    fn link_mut(&mut self) -> &mut Option<Link<usize>> {
        &mut self.link
    }
}

impl Serial for TimerCb {
    #[inline]
    fn serial(&self) -> u32 {
        self.serial
    }
}

/// Insert the timer `index` into `timer_list` with the deadline `now + timing`,
/// after every timer with the same deadline.
fn arm<P: Port>(st: &mut State<P>, index: usize) {
    let now = st.systicks;
    let cb = &mut st.timers[index];
    cb.reach = now.saturating_add(cb.timing);
    cb.st = TimerSt::Armed;
    let reach = cb.reach;

    // Scan from the back; re-armed periodic timers usually land there
    let mut accessor = ListAccessor::new(&mut st.timer_list, &mut st.timers);
    let mut pos = accessor.back();
    while let Some(p) = pos {
        if accessor.pool()[p].reach <= reach {
            break;
        }
        pos = accessor.prev(p).unwrap();
    }
    let inserted = match pos {
        Some(p) => accessor.insert_after(index, p),
        None => accessor.push_front(index),
    };
    inserted.unwrap();
}

/// Unlink the timer `index` from the list its state names.
fn disarm<P: Port>(st: &mut State<P>, index: usize) {
    match st.timers[index].st {
        TimerSt::Armed => {
            ListAccessor::new(&mut st.timer_list, &mut st.timers)
                .remove(index)
                .unwrap();
        }
        TimerSt::Due => {
            ListAccessor::new(&mut st.timer_due, &mut st.timers)
                .remove(index)
                .unwrap();
        }
        TimerSt::Idle | TimerSt::Firing => {}
    }
    st.timers[index].st = TimerSt::Idle;
}

/// Move the timers whose deadline is `now` or earlier to the due list, and
/// resume the daemon if any was moved. Called by the tick handler.
pub(crate) fn expire<P: Port>(st: &mut State<P>, now: Ticks) {
    let mut accessor = ListAccessor::new(&mut st.timer_list, &mut st.timers);
    let Some(first) = accessor.front() else { return };
    if accessor.pool()[first].reach > now {
        return;
    }

    let mut last = first;
    accessor.pool_mut()[first].st = TimerSt::Due;
    while let Some(next) = accessor.next(last).unwrap() {
        if accessor.pool()[next].reach > now {
            break;
        }
        accessor.pool_mut()[next].st = TimerSt::Due;
        last = next;
    }
    accessor.move_chain_to_back(first, last, &mut st.timer_due);

    if let Some(daemon) = st.timer_daemon {
        st.resume(daemon);
    }
}

/// The body of the timer daemon task.
pub(crate) fn daemon_main<P: Port>(kernel: &'static Kernel<P>) -> i32 {
    loop {
        let Ok(mut lock) = kernel.lock() else {
            log::error!("timer daemon: CPU Lock is active");
            return -1;
        };
        let st = kernel.state.write(&mut *lock);

        let due = ListAccessor::new(&mut st.timer_due, &mut st.timers).pop_front();
        let Some(index) = due else {
            // Sleep until `expire` finds work for us
            if let Ok(me) = st.expect_task_context(&kernel.port) {
                st.suspend(me);
            }
            kernel.unlock_cpu_and_check_preemption(lock);
            continue;
        };

        let cb = &mut st.timers[index];
        cb.st = TimerSt::Firing;
        let fun = cb.fun.take();
        let id = Id::new(index, cb.serial);
        log::trace!("firing timer {:?} at tick {}", cb.name, st.systicks);
        drop(lock);

        if let Some(fun) = &fun {
            fun();
        }

        finish_firing(kernel, id, fun);
    }
}

/// Return a timer from the Firing state, re-arming it if it's periodic. The
/// callback may have restarted, re-initialized, cancelled, or released the
/// timer in the meantime, in which case its decision stands.
fn finish_firing<P: Port>(kernel: &'static Kernel<P>, id: Id, fun: Option<TimerFn>) {
    let Ok(mut lock) = kernel.lock() else { return };
    let st = kernel.state.write(&mut *lock);
    let Some(index) = resolve(&st.timers, id) else { return };

    let cb = &mut st.timers[index];
    if cb.st != TimerSt::Firing {
        return;
    }
    cb.st = TimerSt::Idle;
    if cb.reload {
        if cb.fun.is_none() {
            cb.fun = fun;
        }
        arm(st, index);
    }
}

/// A software timer. Its callback runs in the timer daemon task.
pub struct SoftTimer<P: Port> {
    kernel: &'static Kernel<P>,
    id: Id,
}

impl_object_handle!(SoftTimer);

impl<P: Port> SoftTimer<P> {
    /// Allocate a timer. It has no callback until [`Self::init`] or
    /// [`Self::reload`] is called.
    pub fn request(kernel: &'static Kernel<P>, name: &'static str) -> Result<Self, BadContextError> {
        let mut lock = kernel.lock()?;
        let st = kernel.state.write(&mut *lock);
        let serial = st.next_serial();
        let index = st.timers.insert(TimerCb {
            serial,
            name,
            fun: None,
            timing: 0,
            reach: 0,
            reload: false,
            st: TimerSt::Idle,
            link: None,
        });
        Ok(Self::from_id(kernel, Id::new(index, serial)))
    }

    /// Configure a one-shot timer that calls `fun` `timing` ticks after it's
    /// started.
    pub fn init(
        &self,
        fun: impl Fn() + Send + Sync + 'static,
        timing: Ticks,
    ) -> Result<(), InitTimerError> {
        self.configure(false, Arc::new(fun), timing)
    }

    /// Configure a timer. If `auto_reload` is set, the timer re-arms itself
    /// with the same period every time it fires.
    pub fn reload(
        &self,
        auto_reload: bool,
        fun: impl Fn() + Send + Sync + 'static,
        timing: Ticks,
    ) -> Result<(), InitTimerError> {
        self.configure(auto_reload, Arc::new(fun), timing)
    }

    fn configure(&self, reload: bool, fun: TimerFn, timing: Ticks) -> Result<(), InitTimerError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.timers, self.id).ok_or(InitTimerError::BadId)?;

        let cb = &mut st.timers[index];
        if matches!(cb.st, TimerSt::Armed | TimerSt::Due) {
            return Err(InitTimerError::Busy);
        }
        cb.fun = Some(fun);
        cb.timing = timing;
        cb.reload = reload;
        Ok(())
    }

    /// Arm the timer. It fires `timing` ticks from now.
    pub fn start(&self) -> Result<(), StartTimerError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.timers, self.id).ok_or(StartTimerError::BadId)?;

        let cb = &st.timers[index];
        if matches!(cb.st, TimerSt::Armed | TimerSt::Due) {
            return Err(StartTimerError::Busy);
        }
        if cb.fun.is_none() {
            return Err(StartTimerError::BadObjectState);
        }
        arm(st, index);
        log::trace!(
            "timer {:?} armed for tick {}",
            st.timers[index].name,
            st.timers[index].reach
        );
        Ok(())
    }

    /// Disarm the timer and detach its callback. Cancelling a periodic timer
    /// from its own callback stops it from being re-armed. Fails with `Empty`
    /// if there's nothing left to cancel, which includes a one-shot timer
    /// whose callback is running.
    pub fn cancel(&self) -> Result<(), CancelTimerError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.timers, self.id).ok_or(CancelTimerError::BadId)?;

        match st.timers[index].st {
            TimerSt::Idle => return Err(CancelTimerError::Empty),
            // A one-shot callback is already detached while it runs
            TimerSt::Firing if !st.timers[index].reload => {
                return Err(CancelTimerError::Empty)
            }
            _ => {}
        }
        disarm(st, index);
        st.timers[index].fun = None;
        Ok(())
    }

    /// Get a flag indicating whether the timer is armed.
    pub fn is_armed(&self) -> Result<bool, QueryObjectError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.timers, self.id).ok_or(QueryObjectError::BadId)?;
        Ok(matches!(st.timers[index].st, TimerSt::Armed | TimerSt::Due))
    }

    /// Get the tick count at which the armed timer fires.
    pub fn deadline(&self) -> Result<Option<Ticks>, QueryObjectError> {
        let mut lock = self.kernel.lock()?;
        let st = self.kernel.state.write(&mut *lock);
        let index = resolve(&st.timers, self.id).ok_or(QueryObjectError::BadId)?;
        let cb = &st.timers[index];
        Ok(matches!(cb.st, TimerSt::Armed | TimerSt::Due).then(|| cb.reach))
    }

    /// Disarm the timer if needed and free it.
    pub fn release(self) -> Result<(), DeleteObjectError> {
        let fun = {
            let mut lock = self.kernel.lock()?;
            let st = self.kernel.state.write(&mut *lock);
            let index = resolve(&st.timers, self.id).ok_or(DeleteObjectError::BadId)?;
            disarm(st, index);
            st.timers.remove(index).fun
        };
        // The callback's captures are dropped outside the critical section
        drop(fun);
        Ok(())
    }
}
