//! Timeouts and time slices
//!
//! The kernel counts time in ticks of the port's periodic timer interrupt.
//! Every waiting task carries its own countdown in [`TaskCb::timeout`]; each
//! tick decrements all of them, which bounds the tick handler's cost by the
//! size of the task table.
//!
//! [`TaskCb::timeout`]: crate::TaskCb
use crate::{klock::CpuLockGuard, sched, task::TaskId, wait::LockKind, KernelTraits};

/// A duration measured in ticks.
pub type Ticks = u32;

/// A timeout value meaning "wait without a timeout".
pub const WAIT_FOREVER: Ticks = 0;

/// A sentinel value marking a timeout that has run out. Passing it as a
/// timeout fails immediately.
pub const EXPIRED: Ticks = Ticks::MAX;

/// Convert a duration in microseconds to ticks, rounding up. The result is
/// at least one tick and less than [`EXPIRED`].
pub(crate) const fn us_to_ticks(us: u64, tick_period_us: u32) -> Ticks {
    let period = if tick_period_us == 0 {
        1
    } else {
        tick_period_us as u64
    };
    let ticks = (us + period - 1) / period;
    if ticks == 0 {
        1
    } else if ticks >= EXPIRED as u64 {
        EXPIRED - 1
    } else {
        ticks as Ticks
    }
}

/// Advance the time by one tick.
///
///  - Every task with a pending timeout has it decremented. A timeout that
///    reaches zero becomes [`EXPIRED`], and a reschedule is requested so that
///    the scheduler can wake the task up.
///  - The running task's time slice is decremented if it's in `Run`. When
///    the slice runs out, it's reloaded and a reschedule is requested, which
///    moves the task behind its peers.
pub(crate) fn tick<Traits: KernelTraits>(lock: &mut CpuLockGuard<Traits>) {
    let state = Traits::state();
    let mut reschedule = false;

    let num_tasks = state.num_tasks.get(lock);
    for task_cb in &state.task_cb_pool[1..=num_tasks] {
        let timeout = task_cb.timeout.get(lock);
        if timeout == WAIT_FOREVER || timeout == EXPIRED {
            continue;
        }

        if timeout == 1 {
            task_cb.timeout.replace(lock, EXPIRED);
            reschedule = true;
        } else {
            task_cb.timeout.replace(lock, timeout - 1);
        }
    }

    let running_task = state.running_task.get(lock);
    if running_task != TaskId::IDLE {
        let task_cb = state.task_cb(running_task);
        let reload = task_cb.reload_slice.get(lock);
        if reload != 0 && matches!(task_cb.lock.read(lock), LockKind::Run) {
            let slice = task_cb.time_slice.get(lock).saturating_sub(1);
            if slice == 0 {
                log::trace!("{:?} used up its time slice", running_task);
                task_cb.time_slice.replace(lock, reload);
                reschedule = true;
            } else {
                task_cb.time_slice.replace(lock, slice);
            }
        }
    }

    if reschedule {
        sched::request_reschedule_locked(lock);
    }
}
