use core::{cell::UnsafeCell, fmt, ptr};
use cortex_m::peripheral::{
    scb::{SystemHandler, VectActive},
    SCB,
};
use kestrel_kernel::{KernelTraits, PortThreading, PortToKernel, System, TaskAttr, TaskCb};

use super::frame::{self, InitialContext};
use crate::ThreadingOptions;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState> + ThreadingOptions
{
}

pub struct TaskState {
    /// The saved stack pointer. Points to the software frame (see
    /// [`frame`]).
    sp: UnsafeCell<*mut u32>,
}

// Safety: `sp` is only accessed with CPU Lock active
unsafe impl Send for TaskState {}
unsafe impl Sync for TaskState {}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            sp: UnsafeCell::new(ptr::null_mut()),
        }
    }
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskState")
            .field("sp", unsafe { &*self.sp.get() })
            .finish()
    }
}

/// The body of the entry point generated by `use_port!`.
///
/// # Safety
///
/// Only meant to be called once, by the entry point.
pub unsafe fn port_boot<Traits: PortInstance>(init: fn()) -> ! {
    // Safety: We own the processor at this point
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

    // Safety: We don't make "priority-based critical sections"
    unsafe {
        peripherals
            .SCB
            .set_priority(SystemHandler::PendSV, Traits::PEND_SV_PRIORITY);
    }

    // No task context to save on the first dispatch
    // Safety: We are in the boot context, still using MSP
    #[allow(unused_unsafe)]
    unsafe {
        cortex_m::register::psp::write(0)
    };

    log::trace!("port_boot");

    // Safety: We are a port, so it's okay to call this. CPU Lock inactive
    unsafe { System::<Traits>::boot(init) }
}

/// Pend PendSV and release CPU Lock, letting the dispatcher discard the boot
/// context.
///
/// # Safety
///
/// CPU Lock active, boot context
pub unsafe fn dispatch_first_task<Traits: PortInstance>() -> ! {
    SCB::set_pendsv();

    // Safety: CPU Lock active
    unsafe { leave_cpu_lock::<Traits>() };

    // PendSV is taken here and never returns to this context
    loop {
        cortex_m::asm::wfi();
    }
}

/// The Rust half of the PendSV handler.
///
/// # Safety
///
/// PendSV context, CPU Lock active
pub unsafe fn switch_context<Traits: PortInstance>(sp: *mut u32) -> *mut u32 {
    if !sp.is_null() {
        // Safety: CPU Lock active
        let prev = unsafe { Traits::running_task() };
        // Safety: CPU Lock active
        unsafe { *prev.port_task_state.sp.get() = sp };
    }

    // Safety: CPU Lock active, PendSV context
    let next = unsafe { Traits::choose_running_task() };

    // Safety: CPU Lock active
    unsafe { *next.port_task_state.sp.get() }
}

#[inline]
pub unsafe fn yield_cpu<Traits: PortInstance>() {
    SCB::set_pendsv();
}

#[inline(always)]
pub unsafe fn enter_cpu_lock<Traits: PortInstance>() {
    // Set `PRIMASK` to `1`
    cortex_m::interrupt::disable();
}

#[inline(always)]
pub unsafe fn leave_cpu_lock<Traits: PortInstance>() {
    // Set `PRIMASK` to `0`
    unsafe { cortex_m::interrupt::enable() };
}

pub unsafe fn initialize_task_state<Traits: PortInstance>(
    task: &'static TaskCb<Traits>,
    attr: &TaskAttr,
) {
    let ctx = InitialContext {
        entry_point: attr.entry_point as usize as u32,
        entry_param: attr.entry_param as u32,
        exit: task_exit::<Traits> as usize as u32,
    };

    // Safety: The kernel has checked the stack size against `STACK_MIN_SIZE`
    let sp = unsafe { frame::write_initial_frame(attr.stack.as_ptr(), &ctx) };

    // Safety: CPU Lock active
    unsafe { *task.port_task_state.sp.get() = sp };
}

/// The return address of every task's entry point.
extern "C" fn task_exit<Traits: PortInstance>() -> ! {
    System::<Traits>::exit_task()
}

#[inline(always)]
pub fn is_cpu_lock_active<Traits: PortInstance>() -> bool {
    cortex_m::register::primask::read().is_inactive()
}

pub fn is_task_context<Traits: PortInstance>() -> bool {
    // Tasks (including the idle task) run in Thread mode. Everything else
    // is an exception handler.
    SCB::vect_active() == VectActive::ThreadMode
}

pub fn wait_for_interrupt<Traits: PortInstance>() {
    if Traits::USE_WFI {
        cortex_m::asm::wfi();
    }
}
