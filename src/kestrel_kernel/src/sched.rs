//! The scheduler
use crate::{
    klock::CpuLockGuard,
    task::{runqueue, Priority, TaskId},
    wait::LockKind,
    KernelTraits,
};

/// Request a reschedule if the system has started. Before that, there's no
/// dispatcher to take the request.
pub(crate) fn request_reschedule_locked<Traits: KernelTraits>(lock: &CpuLockGuard<Traits>) {
    if Traits::state().started.get(lock) {
        // Safety: CPU Lock active
        unsafe { Traits::yield_cpu() };
    }
}

/// Choose the next task to run and record it as the running task. Called by
/// the port's dispatcher through `PortToKernel::choose_running_task`.
///
///  1. The previously running task (unless it's the idle task) moves to the
///     tail of the scheduler queue.
///  2. The queue is walked once from the head. A task in `Run` is a
///     candidate. A waiting task is a candidate if its timeout has expired or
///     its [readiness predicate](LockKind::is_satisfied) holds.
///  3. The candidate with the lowest priority value wins. Ties go to the one
///     closest to the head. If there are no candidates, the first
///     `Suspended` task is resumed. Otherwise, the idle task runs.
pub(crate) fn choose_running_task<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
) -> TaskId {
    let state = Traits::state();
    let prev_task = state.running_task.get(lock);

    let (best, first_suspended) = runqueue::with_run_queue(lock, |head, links| {
        if prev_task != TaskId::IDLE {
            head.move_to_back(links, prev_task);
        }

        let links = &*links;
        let lock = &*links.lock;

        let mut best: Option<(TaskId, Priority)> = None;
        let mut first_suspended = None;

        for task in head.iter(links) {
            let task_cb = state.task_cb(task);
            let kind = task_cb.lock.read(lock);

            let ready = match kind {
                LockKind::Run => true,
                LockKind::Suspended => {
                    first_suspended.get_or_insert(task);
                    false
                }
                _ => task_cb.timeout.get(lock) == crate::EXPIRED || kind.is_satisfied(lock),
            };

            if ready {
                let priority = task_cb.priority.get(lock);
                if best.map_or(true, |(_, best_priority)| priority < best_priority) {
                    best = Some((task, priority));
                }
            }
        }

        (best.map(|(task, _)| task), first_suspended)
    });

    let next_task = best.or(first_suspended).unwrap_or(TaskId::IDLE);

    if next_task != TaskId::IDLE {
        let task_cb = state.task_cb(next_task);
        if !matches!(task_cb.lock.read(lock), LockKind::Run) {
            task_cb.lock.replace(lock, LockKind::Run);
        }
    }

    if next_task != prev_task {
        log::trace!("dispatch: {:?} -> {:?}", prev_task, next_task);
    }

    state.running_task.replace(lock, next_task);
    next_task
}
