#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
use core::{fmt, marker::PhantomData, ptr::NonNull};

#[macro_use]
mod cfg;
#[cfg(test)]
#[macro_use]
mod test_port;

pub mod error;
mod event;
mod heap;
mod klock;
mod multiwait;
mod mutex;
mod queue;
mod sched;
mod state;
mod task;
mod timeout;
pub mod utils;
mod wait;

pub use self::{
    cfg::*, error::*, event::*, heap::*, multiwait::*, mutex::*, queue::*, state::*, task::*,
    timeout::*, wait::*,
};

#[doc(hidden)]
pub extern crate arrayvec;

/// The machine word interpreted as a bit set by [`Mutex`] and [`Event`].
pub type Word = u32;

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    type PortTaskState: Send + Sync + fmt::Debug + 'static;

    /// The initial value of [`TaskCb::port_task_state`] for all tasks.
    #[allow(clippy::declare_interior_mutable_const)]
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// The smallest stack a task can be given. [`System::create_task`] treats
    /// a smaller stack as a fatal configuration error.
    const STACK_MIN_SIZE: usize = 256;

    /// Transfer the control to the task chosen by
    /// [`PortToKernel::choose_running_task`], discarding the current
    /// (startup) context.
    ///
    /// Precondition: CPU Lock active, boot phase
    unsafe fn dispatch_first_task() -> !;

    /// Request a reschedule. The port pends its dispatch exception, which
    /// calls [`PortToKernel::choose_running_task`] once it's taken. The
    /// scheduler is never run synchronously from this method.
    ///
    /// This method may be called with or without CPU Lock active.
    unsafe fn yield_cpu();

    /// Disable all kernel-managed interrupts (this state is called *CPU Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Activate CPU Lock. Return `true` iff CPU Lock was inactive before the
    /// call.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Prepare the task for activation. More specifically, write an initial
    /// context to [`TaskAttr::stack`] so that the task starts execution from
    /// [`TaskAttr::entry_point`], receiving [`TaskAttr::entry_param`] as its
    /// argument, the first time it receives the control.
    ///
    /// Precondition: CPU Lock active
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>, attr: &TaskAttr);

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;

    /// Put the processor to sleep until an interrupt arrives. The body of the
    /// idle task.
    ///
    /// Precondition: CPU Lock inactive, idle task context
    fn wait_for_interrupt();
}

/// Compile-time kernel configuration. Implemented by [`build!`], which
/// overrides the defaults with the values given to it.
pub trait KernelCfg: Sized + 'static {
    /// The period of the timer interrupt driving [`PortToKernel::timer_tick`],
    /// measured in microseconds.
    const TICK_PERIOD_US: u32 = 1000;

    /// The number of ticks a running task may hold the processor before
    /// being rotated behind other tasks of the same priority. `0` disables
    /// round-robin preemption.
    const TIME_SLICE: Ticks = 10;
}

/// Associates a kernel trait type with kernel-private data. Use [`build!`] to
/// implement.
///
/// # Safety
///
/// This is only intended to be implemented by `build!`.
pub unsafe trait KernelTraits: PortThreading + KernelCfg {
    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;
}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel: PortThreading {
    /// Determine the next task to run and return it. The returned task is
    /// recorded as the running task.
    ///
    /// Precondition: CPU Lock active, dispatch exception context /
    /// Postcondition: CPU Lock active
    unsafe fn choose_running_task() -> &'static TaskCb<Self>;

    /// Get the running task, which is the task whose context the dispatcher
    /// should save.
    ///
    /// Precondition: CPU Lock active
    unsafe fn running_task() -> &'static TaskCb<Self>;

    /// Advance the kernel's notion of time by one tick. Called by the port's
    /// timer interrupt handler.
    ///
    /// Precondition: CPU Lock inactive, interrupt context
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn choose_running_task() -> &'static TaskCb<Self> {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        let task = sched::choose_running_task(&mut lock);
        let task_cb = Traits::state().task_cb(task);

        // Post-condition: CPU Lock active
        lock.forget();

        task_cb
    }

    unsafe fn running_task() -> &'static TaskCb<Self> {
        // Safety: CPU Lock active
        let lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        let state = Traits::state();
        let task_cb = state.task_cb(state.running_task.get(&lock));
        lock.forget();
        task_cb
    }

    unsafe fn timer_tick() {
        let mut lock = klock::lock_cpu::<Traits>();
        timeout::tick(&mut lock);
    }
}

/// Wraps a kernel trait type to provide the kernel's API.
///
/// All kernel objects ([`Mutex`], [`Event`], [`Queue`], [`MultiWait`]) are
/// parameterized by the same kernel trait type and live in `static`s.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits> Clone for System<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits> Copy for System<Traits> {}

impl<Traits> fmt::Debug for System<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("System")
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Run `init`, create the idle task, and transfer the control to the
    /// highest-priority task. `init` is where the application creates its
    /// tasks and kernel objects.
    ///
    /// # Safety
    ///
    /// This must be called exactly once, by the port's startup code, with
    /// CPU Lock inactive and before any other kernel entry point except
    /// those called by `init`.
    pub unsafe fn boot(init: impl FnOnce()) -> ! {
        log::debug!("boot: running init");
        init();

        let mut lock = klock::lock_cpu::<Traits>();
        task::init_idle_task(&mut lock);
        Traits::state().started.replace(&mut lock, true);
        log::debug!(
            "boot: {} task(s) created, dispatching",
            Traits::state().num_tasks.get(&lock)
        );

        // The port takes over the CPU Lock state from here
        lock.forget();

        // Safety: CPU Lock active, boot phase
        unsafe { Traits::dispatch_first_task() }
    }

    /// Create a task and append it to the tail of the scheduler queue.
    ///
    /// A stack smaller than the port's minimum, or more tasks than were
    /// given to [`build!`], is a fatal error.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn create_task(
        name: &'static str,
        stack: &'static Hunk<[u8]>,
        priority: Priority,
        entry_point: fn(usize),
        entry_param: usize,
    ) -> TaskId {
        task::create_task::<Traits>(
            name,
            priority,
            TaskAttr {
                entry_point,
                entry_param,
                stack,
            },
        )
    }

    /// Get the currently running task ([`TaskId::IDLE`] if the idle task is
    /// running). In an interrupt context, this is the interrupted task.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn current_task() -> TaskId {
        let lock = klock::lock_cpu::<Traits>();
        Traits::state().running_task.get(&lock)
    }

    /// Get the per-task context value passed to [`Self::create_task`] for the
    /// running task.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn current_context() -> usize {
        let lock = klock::lock_cpu::<Traits>();
        let state = Traits::state();
        state
            .task_cb(state.running_task.get(&lock))
            .entry_param
            .get(&lock)
    }

    /// Block the current task for `ticks` ticks. `0` returns immediately.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn sleep(ticks: Ticks) {
        task::sleep::<Traits>(ticks)
    }

    /// Give other tasks a turn. The current task enters the `Suspended`
    /// state and is resumed once no other task is ready.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn suspend() {
        task::suspend::<Traits>()
    }

    /// Terminate the current task. The task is parked forever.
    pub fn exit_task() -> ! {
        task::exit_task::<Traits>()
    }

    /// Block the current task until `kind`'s condition holds or `timeout`
    /// ticks elapse. Returns the remaining ticks on wake-up.
    ///
    /// The caller is responsible for re-checking its condition after the
    /// call returns. Calling this from an interrupt context or the idle task
    /// is a fatal error.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn block_on(kind: LockKind<Traits>, timeout: Ticks) -> Result<Ticks, TimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>();
        wait::block_on_locked(&mut lock, kind, timeout)
    }

    /// Request a reschedule. ISR-safe.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn request_reschedule() {
        let lock = klock::lock_cpu::<Traits>();
        sched::request_reschedule_locked(&lock);
    }

    /// Advance the kernel's time by one tick. ISR-safe. Ports call this from
    /// their timer interrupt handler (through [`PortToKernel::timer_tick`]).
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn tick() {
        let mut lock = klock::lock_cpu::<Traits>();
        timeout::tick(&mut lock);
    }

    /// Allocate `size` bytes from the kernel heap. The returned region is
    /// aligned to [`HEAP_ALIGN`] bytes. Exhaustion is a fatal error.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn alloc(size: usize) -> NonNull<u8> {
        heap::alloc::<Traits>(size)
    }

    /// Return a region allocated by [`Self::alloc`] to the kernel heap.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after the call.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub unsafe fn free(ptr: NonNull<u8>) {
        // Safety: Upheld by the caller
        unsafe { heap::free::<Traits>(ptr) }
    }

    /// Walk the kernel heap's block chain and return its usage statistics.
    pub fn heap_stats() -> HeapStats {
        heap::stats::<Traits>()
    }

    /// Convert milliseconds to ticks, rounding up to at least one tick.
    pub const fn ms_to_ticks(ms: u32) -> Ticks {
        timeout::us_to_ticks(ms as u64 * 1000, Traits::TICK_PERIOD_US)
    }

    /// Convert microseconds to ticks, rounding up to at least one tick.
    pub const fn us_to_ticks(us: u32) -> Ticks {
        timeout::us_to_ticks(us as u64, Traits::TICK_PERIOD_US)
    }
}
