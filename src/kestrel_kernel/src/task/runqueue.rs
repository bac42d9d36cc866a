//! The scheduler queue
//!
//! An index-based doubly linked list threaded through
//! [`TaskCb::link`](super::TaskCb). Every created task except the idle task
//! is a member at all times.
use crate::{
    klock::CpuLockGuard,
    task::{TaskCb, TaskId},
    utils::list::{Link, LinkAccess, ListHead},
    KernelTraits,
};

/// Provides access to the links of the tasks in the task table.
pub(crate) struct PoolLinks<'a, Traits: KernelTraits> {
    pool: &'static [TaskCb<Traits>],
    pub(crate) lock: &'a mut CpuLockGuard<Traits>,
}

impl<'a, Traits: KernelTraits> PoolLinks<'a, Traits> {
    pub(crate) fn new(lock: &'a mut CpuLockGuard<Traits>) -> Self {
        Self {
            pool: Traits::state().task_cb_pool,
            lock,
        }
    }
}

impl<Traits: KernelTraits> LinkAccess<TaskId> for PoolLinks<'_, Traits> {
    #[inline]
    fn link(&self, index: TaskId) -> Link<TaskId> {
        self.pool[index.index()].link.get(&*self.lock)
    }

    #[inline]
    fn set_link(&mut self, index: TaskId, link: Link<TaskId>) {
        self.pool[index.index()].link.replace(&mut *self.lock, link);
    }
}

/// Run `f` with the scheduler queue borrowed mutably.
pub(crate) fn with_run_queue<Traits: KernelTraits, R>(
    lock: &mut CpuLockGuard<Traits>,
    f: impl FnOnce(&mut ListHead<TaskId>, &mut PoolLinks<'_, Traits>) -> R,
) -> R {
    let state = Traits::state();
    let mut head = state.run_queue.get(lock);
    let ret = f(&mut head, &mut PoolLinks::new(lock));
    state.run_queue.replace(lock, head);
    ret
}

/// Append `task` to the tail of the scheduler queue.
pub(crate) fn push_back<Traits: KernelTraits>(lock: &mut CpuLockGuard<Traits>, task: TaskId) {
    debug_assert_ne!(task, TaskId::IDLE);
    with_run_queue(lock, |head, links| head.push_back(links, task));
}
