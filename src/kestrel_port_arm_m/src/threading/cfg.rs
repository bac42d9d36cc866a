/// The configuration of the port.
pub trait ThreadingOptions {
    /// Enables the use of the `wfi` instruction in the idle task to save power.
    /// Defaults to `true`.
    const USE_WFI: bool = true;

    /// The priority of PendSV, which performs context switching. Must be
    /// lower (numerically higher) than the priorities of all interrupts that
    /// use the kernel. Defaults to `0xff`.
    const PEND_SV_PRIORITY: u8 = 0xff;
}

/// Instantiate the port.
///
/// This macro defines the program's entry point, which boots the kernel with
/// `$init` as the initialization function, and the PendSV handler. It doesn't
/// drive the kernel's tick. See [`use_systick!`](crate::use_systick) for that.
///
/// # Safety
///
///  - The target must really be a bare-metal Armv7-M environment.
///  - You shouldn't interfere with the port's operations. For example, you
///    shouldn't manually modify `PRIMASK` or `PSP` unless you know what you
///    are doing.
///  - `::cortex_m_rt` should point to the `cortex-m-rt` crate.
///
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident, init = $init:path) => {
        $vis struct $SystemTraits;

        mod port_arm_m_impl {
            use super::$SystemTraits;
            use $crate::kestrel_kernel::{PortThreading, TaskAttr, TaskCb};
            use $crate::threading::imp::{self, PortInstance, TaskState};

            unsafe impl PortInstance for $SystemTraits {}

            // Assume `$SystemTraits: KernelTraits`
            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: Self::PortTaskState = TaskState::new();

                // Debug formatting is particularly memory-hungry
                const STACK_MIN_SIZE: usize = 512;

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { imp::dispatch_first_task::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { imp::yield_cpu::<Self>() }
                }

                #[inline(always)]
                unsafe fn enter_cpu_lock() {
                    unsafe { imp::enter_cpu_lock::<Self>() }
                }

                #[inline(always)]
                unsafe fn leave_cpu_lock() {
                    unsafe { imp::leave_cpu_lock::<Self>() }
                }

                unsafe fn initialize_task_state(task: &'static TaskCb<Self>, attr: &TaskAttr) {
                    unsafe { imp::initialize_task_state::<Self>(task, attr) }
                }

                fn is_cpu_lock_active() -> bool {
                    imp::is_cpu_lock_active::<Self>()
                }

                fn is_task_context() -> bool {
                    imp::is_task_context::<Self>()
                }

                fn wait_for_interrupt() {
                    imp::wait_for_interrupt::<Self>()
                }
            }

            /// Called by the PendSV handler with the outgoing task's saved
            /// stack pointer (null on the first dispatch). Returns the
            /// incoming task's.
            #[no_mangle]
            unsafe extern "C" fn kestrel_pend_sv_switch(sp: *mut u32) -> *mut u32 {
                // Safety: PendSV context, CPU Lock active
                unsafe { imp::switch_context::<$SystemTraits>(sp) }
            }
        }

        // `PendSV` overrides the default handler provided by `cortex-m-rt`.
        //
        //    <r4-r11 = context, lr = EXC_RETURN>
        //
        //    r0 = psp
        //    if r0 != 0:
        //        r0 -= 40
        //        r0[0..10] = [control, r4-r11, lr]
        //    r0 = kestrel_pend_sv_switch(r0)
        //    [control, r4-r11, lr] = r0[0..10]
        //    psp = r0 + 40
        //
        //    <r4-r11 = context, lr = EXC_RETURN>
        $crate::core::arch::global_asm!(
            "
            .section .text.PendSV, \"ax\", %progbits
            .global PendSV
            .type PendSV, %function
            .thumb_func
        PendSV:
            cpsid i

            mrs r0, psp
            cbz r0, 1f
            mrs r1, control
            stmdb r0!, {{r1, r4-r11, lr}}
        1:
            bl kestrel_pend_sv_switch

            ldmia r0!, {{r1, r4-r11, lr}}
            msr control, r1
            isb
            msr psp, r0

            cpsie i
            bx lr
            .size PendSV, . - PendSV
            "
        );

        #[$crate::cortex_m_rt::entry]
        fn main() -> ! {
            // Safety: We are the entry point
            unsafe { $crate::threading::imp::port_boot::<$SystemTraits>($init) }
        }
    };
}
