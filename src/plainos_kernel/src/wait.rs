//! Wait lists
//!
//! A task blocked on an object is linked to the object's wait list through the
//! same link field it uses for the ready queue, so a blocked task is never in
//! two lists at once. Wait lists are FIFO: the task that waited first is woken
//! first.
use crate::{
    state::State,
    task::{TaskCb, TaskSt},
    utils::intrusive_list::{ListAccessor, ListHead},
    Port,
};
use slab::Slab;

/// Identifies the wait list a task in the Waiting state is linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitTarget {
    /// `semaphores[i].waiters`
    Semaphore(usize),
    /// `completions[i].waiters`
    Completion(usize),
    /// `tasks[i].joiners`
    Join(usize),
}

/// Call `f` with an accessor to the wait list identified by `target`.
fn with_wait_list<P: Port, R>(
    st: &mut State<P>,
    target: WaitTarget,
    f: impl FnOnce(&mut ListAccessor<'_, usize, Slab<TaskCb<P>>>) -> R,
) -> R {
    match target {
        WaitTarget::Semaphore(i) => {
            f(&mut ListAccessor::new(&mut st.semaphores[i].waiters, &mut st.tasks))
        }
        WaitTarget::Completion(i) => {
            f(&mut ListAccessor::new(&mut st.completions[i].waiters, &mut st.tasks))
        }
        WaitTarget::Join(i) => {
            // The head lives in the pool it indexes, so borrow it separately
            let mut head: ListHead<usize> = st.tasks[i].joiners;
            let result = f(&mut ListAccessor::new(&mut head, &mut st.tasks));
            st.tasks[i].joiners = head;
            result
        }
    }
}

/// Transition the ready task `task` into the Waiting state, appending it to the
/// wait list of `target`.
pub(crate) fn park<P: Port>(st: &mut State<P>, task: usize, target: WaitTarget) {
    st.unlink(task);
    st.tasks[task].st = TaskSt::Waiting(target);
    with_wait_list(st, target, |list| list.push_back(task).unwrap());
}

/// Wake up the first waiter of `target`, handing `result` to it. Returns the
/// woken task, if any.
pub(crate) fn wake_one<P: Port>(
    st: &mut State<P>,
    target: WaitTarget,
    result: Option<i32>,
) -> Option<usize> {
    let task = with_wait_list(st, target, |list| list.pop_front())?;
    st.tasks[task].wait_result = result;
    st.make_ready(task);
    Some(task)
}

/// Wake up every waiter of `target` in FIFO order. Returns the number of woken
/// tasks.
pub(crate) fn wake_all<P: Port>(
    st: &mut State<P>,
    target: WaitTarget,
    result: Option<i32>,
) -> usize {
    let mut count = 0;
    while wake_one(st, target, result).is_some() {
        count += 1;
    }
    count
}

/// Unlink `task` from the wait list of `target` without waking it up. The
/// unit it took from a semaphore's count is given back.
pub(crate) fn abandon<P: Port>(st: &mut State<P>, target: WaitTarget, task: usize) {
    with_wait_list(st, target, |list| list.remove(task).unwrap());
    if let WaitTarget::Semaphore(i) = target {
        st.semaphores[i].value += 1;
    }
}

/// Count the waiters of `target`.
pub(crate) fn num_waiters<P: Port>(st: &mut State<P>, target: WaitTarget) -> usize {
    with_wait_list(st, target, |list| list.iter().count())
}
