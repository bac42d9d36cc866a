use core::{cell::UnsafeCell, fmt};

use crate::{
    heap::Heap,
    klock::CpuLockCell,
    mutex::Mutex,
    task::{TaskCb, TaskId},
    utils::list::ListHead,
    Hunk, PortThreading,
};

/// Global kernel state. Created by [`build!`](crate::build).
///
/// This is the only kernel context; every entry point reaches it through
/// [`KernelTraits::state`](crate::KernelTraits::state). It's initialized at
/// compile time and never torn down.
pub struct State<Traits: PortThreading> {
    /// The task table. Index `0` is the idle task.
    pub(crate) task_cb_pool: &'static [TaskCb<Traits>],
    pub(crate) idle_stack: &'static Hunk<[u8]>,
    pub(crate) heap_hunk: &'static Hunk<[u8]>,

    /// The currently running task.
    pub(crate) running_task: CpuLockCell<Traits, TaskId>,

    /// The number of user tasks created so far. They occupy
    /// `task_cb_pool[1..=num_tasks]`.
    pub(crate) num_tasks: CpuLockCell<Traits, usize>,

    /// The scheduler queue. Contains every created task except the idle
    /// task.
    pub(crate) run_queue: CpuLockCell<Traits, ListHead<TaskId>>,

    /// Set by `System::boot` right before the first dispatch. Reschedule
    /// requests are ignored until then.
    pub(crate) started: CpuLockCell<Traits, bool>,

    /// Serializes accesses to `heap`.
    pub(crate) heap_lock: Mutex<Traits>,
    pub(crate) heap: UnsafeCell<Heap>,
}

// Safety: `heap` is only accessed while `heap_lock` is held. Everything else
//         is protected by CPU Lock.
unsafe impl<Traits: PortThreading> Sync for State<Traits> {}

impl<Traits: PortThreading> State<Traits> {
    #[doc(hidden)]
    pub const fn new(
        task_cb_pool: &'static [TaskCb<Traits>],
        idle_stack: &'static Hunk<[u8]>,
        heap_hunk: &'static Hunk<[u8]>,
    ) -> Self {
        Self {
            task_cb_pool,
            idle_stack,
            heap_hunk,
            running_task: CpuLockCell::new(TaskId::IDLE),
            num_tasks: CpuLockCell::new(0),
            run_queue: CpuLockCell::new(ListHead::new()),
            started: CpuLockCell::new(false),
            heap_lock: Mutex::new(),
            heap: UnsafeCell::new(Heap::new()),
        }
    }

    /// Get the [`TaskCb`] for the specified task.
    #[inline]
    pub(crate) fn task_cb(&self, task: TaskId) -> &'static TaskCb<Traits> {
        let pool: &'static [TaskCb<Traits>] = self.task_cb_pool;
        &pool[task.index()]
    }

    /// The capacity of the task table, excluding the idle task.
    pub fn max_tasks(&self) -> usize {
        self.task_cb_pool.len() - 1
    }
}

impl<Traits: PortThreading> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("task_cb_pool", &self.task_cb_pool)
            .field("running_task", &self.running_task)
            .field("num_tasks", &self.num_tasks)
            .field("run_queue", &self.run_queue)
            .field("started", &self.started)
            .field("heap_lock", &self.heap_lock)
            .finish_non_exhaustive()
    }
}
