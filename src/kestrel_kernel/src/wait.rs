//! The blocking primitive
use core::fmt;

use crate::{
    error::{fatal, FatalError, TimeoutError},
    event::Event,
    klock::CpuLockGuard,
    multiwait::MultiWaitSnapshot,
    mutex::Mutex,
    queue::Queue,
    task::TaskId,
    timeout::{Ticks, EXPIRED, WAIT_FOREVER},
    KernelTraits, Word,
};

bitflags::bitflags! {
    /// Options for the waiting operations of [`Mutex`], [`Event`], and
    /// [`Queue`].
    pub struct WaitFlags: u8 {
        /// Return [`WouldBlock`](crate::ResultCode::WouldBlock) instead of
        /// blocking.
        const NOWAIT = 1 << 0;
        /// Clear the matched event bits when a wait succeeds.
        const CLEAR = 1 << 1;
    }
}

impl WaitFlags {
    /// Block indefinitely, or for the given timeout.
    pub const NONE: Self = Self::empty();
}

/// What a task is waiting for. Each waiting variant carries what the
/// scheduler needs to decide whether the task can run.
pub enum LockKind<Traits: 'static> {
    /// Running or ready to run.
    Run,
    /// Yielded to other tasks. Resumed when no other task is ready.
    Suspended,
    /// Waiting for the timeout only.
    WaitTimer,
    /// Waiting for all of the given bits of the mutex to be clear.
    WaitMutex(&'static Mutex<Traits>, Word),
    /// Waiting for any of the given bits of the event to be set.
    WaitEvent(&'static Event<Traits>, Word),
    /// Waiting for the queue to have room for a message.
    WaitQueueFull(&'static Queue<Traits>),
    /// Waiting for the queue to have a message.
    WaitQueueEmpty(&'static Queue<Traits>),
    /// Waiting for a combination of sub-waits.
    WaitMulti(MultiWaitSnapshot<Traits>),
}

impl<Traits: KernelTraits> LockKind<Traits> {
    /// Evaluate the readiness predicate of a waiting task. `Run` is always
    /// satisfied; `Suspended` and `WaitTimer` never are.
    pub(crate) fn is_satisfied(&self, lock: &CpuLockGuard<Traits>) -> bool {
        match self {
            Self::Run => true,
            Self::Suspended | Self::WaitTimer => false,
            Self::WaitMutex(mutex, mask) => mutex.is_clear_locked(lock, *mask),
            Self::WaitEvent(event, mask) => event.matched_locked(lock, *mask) != 0,
            Self::WaitQueueFull(queue) => queue.has_room_locked(lock),
            Self::WaitQueueEmpty(queue) => queue.has_data_locked(lock),
            Self::WaitMulti(snapshot) => snapshot.is_satisfied(lock),
        }
    }
}

impl<Traits: 'static> Clone for LockKind<Traits> {
    fn clone(&self) -> Self {
        match self {
            Self::Run => Self::Run,
            Self::Suspended => Self::Suspended,
            Self::WaitTimer => Self::WaitTimer,
            Self::WaitMutex(mutex, mask) => Self::WaitMutex(*mutex, *mask),
            Self::WaitEvent(event, mask) => Self::WaitEvent(*event, *mask),
            Self::WaitQueueFull(queue) => Self::WaitQueueFull(*queue),
            Self::WaitQueueEmpty(queue) => Self::WaitQueueEmpty(*queue),
            Self::WaitMulti(snapshot) => Self::WaitMulti(snapshot.clone()),
        }
    }
}

impl<Traits: 'static> fmt::Debug for LockKind<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Run => f.write_str("Run"),
            Self::Suspended => f.write_str("Suspended"),
            Self::WaitTimer => f.write_str("WaitTimer"),
            Self::WaitMutex(mutex, mask) => write!(f, "WaitMutex({:p}, {:#x})", *mutex, mask),
            Self::WaitEvent(event, mask) => write!(f, "WaitEvent({:p}, {:#x})", *event, mask),
            Self::WaitQueueFull(queue) => write!(f, "WaitQueueFull({:p})", *queue),
            Self::WaitQueueEmpty(queue) => write!(f, "WaitQueueEmpty({:p})", *queue),
            Self::WaitMulti(snapshot) => f.debug_tuple("WaitMulti").field(snapshot).finish(),
        }
    }
}

/// Block the running task on `kind` for at most `timeout` ticks.
///
/// Returns the remaining ticks ([`WAIT_FOREVER`] if there was no timeout)
/// when the task was woken up because `kind` became satisfied, or
/// `Err(Timeout)` when the timeout expired. A `timeout` of [`EXPIRED`] fails
/// immediately without blocking. Either way, the caller must re-check its
/// condition because another task may have consumed it first.
///
/// Calling this from an interrupt context or the idle task is fatal.
pub(crate) fn block_on_locked<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    kind: LockKind<Traits>,
    timeout: Ticks,
) -> Result<Ticks, TimeoutError> {
    let state = Traits::state();
    let running_task = state.running_task.get(lock);

    if !Traits::is_task_context() || running_task == TaskId::IDLE {
        log::error!("blocking on {:?} from a non-waitable context", kind);
        fatal(FatalError::BadContext);
    }

    if timeout == EXPIRED {
        return Err(TimeoutError::Timeout);
    }

    let task_cb = state.task_cb(running_task);
    log::trace!(
        "{:?} blocks on {:?} (timeout = {})",
        running_task,
        kind,
        timeout
    );
    task_cb.lock.replace(lock, kind);
    task_cb.timeout.replace(lock, timeout);

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from this
        //             function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: The scheduler will not choose this task again until its
        // condition holds or its timeout expires
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if matches!(task_cb.lock.read(lock), LockKind::Run) {
            break;
        }
    }

    let remaining = task_cb.timeout.replace(lock, WAIT_FOREVER);
    log::trace!("{:?} woke up (timeout = {})", running_task, remaining);

    if remaining == EXPIRED {
        Err(TimeoutError::Timeout)
    } else {
        Ok(remaining)
    }
}
