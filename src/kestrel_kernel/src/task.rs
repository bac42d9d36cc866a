//! Tasks
use core::fmt;

use crate::{
    error::{fatal, FatalError},
    klock::{self, CpuLockCell, CpuLockGuard},
    sched,
    timeout::{Ticks, EXPIRED, WAIT_FOREVER},
    utils::{list::Link, Init},
    wait::{self, LockKind},
    Hunk, KernelTraits, PortThreading,
};

pub(crate) mod runqueue;

/// Task priority. Lower values represent higher priorities.
pub type Priority = u8;

/// Identifies a task. This is an index into the task table; the idle task is
/// always [`TaskId::IDLE`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

impl TaskId {
    /// The idle task.
    pub const IDLE: Self = Self(0);

    #[inline]
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Get the index of the task in the task table.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl Init for TaskId {
    const INIT: Self = Self::IDLE;
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if *self == Self::IDLE {
            f.write_str("TaskId(idle)")
        } else {
            write!(f, "TaskId({})", self.0)
        }
    }
}

/// The static properties of a task, given to
/// [`PortThreading::initialize_task_state`].
pub struct TaskAttr {
    /// The entry point of the task.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The task's stack region.
    pub stack: &'static Hunk<[u8]>,
}

impl fmt::Debug for TaskAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskAttr")
            .field("entry_point", &(self.entry_point as *const ()))
            .field("entry_param", &self.entry_param)
            .field("stack", &self.stack)
            .finish()
    }
}

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<Traits: PortThreading> {
    /// Get a reference to `PortTaskState` in the task control block.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so that
    /// assembler code can refer to this easily.
    pub port_task_state: Traits::PortTaskState,

    pub(crate) name: CpuLockCell<Traits, &'static str>,

    /// The per-task context value, retrievable by `System::current_context`.
    pub(crate) entry_param: CpuLockCell<Traits, usize>,

    pub(crate) priority: CpuLockCell<Traits, Priority>,

    /// What the task is waiting for, if anything.
    pub(crate) lock: CpuLockCell<Traits, LockKind<Traits>>,

    /// Ticks remaining before the current wait times out. [`WAIT_FOREVER`]
    /// means no timeout; [`EXPIRED`] means it has timed out.
    pub(crate) timeout: CpuLockCell<Traits, Ticks>,

    pub(crate) time_slice: CpuLockCell<Traits, Ticks>,
    pub(crate) reload_slice: CpuLockCell<Traits, Ticks>,

    /// The task's position in the scheduler queue.
    pub(crate) link: CpuLockCell<Traits, Link<TaskId>>,
}

impl<Traits: PortThreading> Init for TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_task_state: Traits::PORT_TASK_STATE_INIT,
        name: Init::INIT,
        entry_param: Init::INIT,
        priority: Init::INIT,
        lock: CpuLockCell::new(LockKind::Run),
        timeout: CpuLockCell::new(WAIT_FOREVER),
        time_slice: Init::INIT,
        reload_slice: Init::INIT,
        link: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("port_task_state", &self.port_task_state)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("lock", &self.lock)
            .field("timeout", &self.timeout)
            .field("time_slice", &self.time_slice)
            .finish_non_exhaustive()
    }
}

/// Implements `System::create_task`.
pub(crate) fn create_task<Traits: KernelTraits>(
    name: &'static str,
    priority: Priority,
    attr: TaskAttr,
) -> TaskId {
    if attr.stack.len() < Traits::STACK_MIN_SIZE {
        log::error!(
            "task {:?}: stack of {} bytes is below the minimum of {} bytes",
            name,
            attr.stack.len(),
            Traits::STACK_MIN_SIZE
        );
        fatal(FatalError::StackTooSmall);
    }

    let mut lock = klock::lock_cpu::<Traits>();
    let state = Traits::state();

    let num_tasks = state.num_tasks.get(&lock);
    if num_tasks >= state.max_tasks() {
        drop(lock);
        log::error!(
            "task {:?}: the task table is full ({} tasks)",
            name,
            state.max_tasks()
        );
        fatal(FatalError::TaskTableExhausted);
    }

    let task = TaskId::new(num_tasks + 1);
    let task_cb = state.task_cb(task);
    reset_task_cb(&mut lock, task_cb, name, priority, attr.entry_param);

    // Safety: CPU Lock active
    unsafe { Traits::initialize_task_state(task_cb, &attr) };

    runqueue::push_back(&mut lock, task);
    state.num_tasks.replace(&mut lock, num_tasks + 1);

    log::debug!(
        "created task {:?} ({:?}, priority {}, {} byte stack)",
        name,
        task,
        priority,
        attr.stack.len()
    );

    // A task created by a running task might outrank it
    sched::request_reschedule_locked(&lock);

    task
}

fn reset_task_cb<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    task_cb: &TaskCb<Traits>,
    name: &'static str,
    priority: Priority,
    entry_param: usize,
) {
    task_cb.name.replace(lock, name);
    task_cb.entry_param.replace(lock, entry_param);
    task_cb.priority.replace(lock, priority);
    task_cb.lock.replace(lock, LockKind::Run);
    task_cb.timeout.replace(lock, WAIT_FOREVER);
    task_cb.time_slice.replace(lock, Traits::TIME_SLICE);
    task_cb.reload_slice.replace(lock, Traits::TIME_SLICE);
    task_cb.link.replace(lock, Link::INIT);
}

/// Set up the idle task. It's never linked to the scheduler queue.
pub(crate) fn init_idle_task<Traits: KernelTraits>(lock: &mut CpuLockGuard<Traits>) {
    let state = Traits::state();
    let task_cb = state.task_cb(TaskId::IDLE);
    reset_task_cb(lock, task_cb, "idle", Priority::MAX, 0);

    let attr = TaskAttr {
        entry_point: idle_task_body::<Traits>,
        entry_param: 0,
        stack: state.idle_stack,
    };

    // Safety: CPU Lock active
    unsafe { Traits::initialize_task_state(task_cb, &attr) };
}

fn idle_task_body<Traits: KernelTraits>(_: usize) {
    loop {
        Traits::wait_for_interrupt();
    }
}

/// Implements `System::sleep`.
pub(crate) fn sleep<Traits: KernelTraits>(ticks: Ticks) {
    if ticks == WAIT_FOREVER {
        return;
    }

    let mut lock = klock::lock_cpu::<Traits>();

    // `WaitTimer` is never satisfied, so this only returns on timeout
    let _ = wait::block_on_locked(&mut lock, LockKind::WaitTimer, ticks.min(EXPIRED - 1));
}

/// Implements `System::suspend`.
pub(crate) fn suspend<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>();
    let _ = wait::block_on_locked(&mut lock, LockKind::Suspended, WAIT_FOREVER);
}

/// Implements `System::exit_task`.
pub(crate) fn exit_task<Traits: KernelTraits>() -> ! {
    let mut lock = klock::lock_cpu::<Traits>();
    let state = Traits::state();
    log::debug!(
        "task {:?} exited",
        state
            .task_cb(state.running_task.get(&lock))
            .name
            .get(&lock)
    );
    loop {
        let _ = wait::block_on_locked(&mut lock, LockKind::WaitTimer, WAIT_FOREVER);
    }
}
