//! The SysTick-based tick source.
use cortex_m::peripheral::scb::SystemHandler;
use kestrel_kernel::{KernelTraits, PortToKernel};

use crate::SysTickOptions;

/// Configure SysTick to interrupt every `TICK_PERIOD` cycles.
pub fn configure<Traits: KernelTraits + SysTickOptions>() {
    // Safety: We have the control of SysTick
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

    // Safety: We don't make "priority-based critical sections"
    unsafe {
        peripherals
            .SCB
            .set_priority(SystemHandler::SysTick, Traits::INTERRUPT_PRIORITY)
    };

    log::debug!(
        "systick: {} cycles per tick ({} us)",
        Traits::TICK_PERIOD,
        Traits::TICK_PERIOD_US
    );

    peripherals.SYST.set_reload(Traits::TICK_PERIOD - 1);
    peripherals.SYST.clear_current();
    peripherals.SYST.enable_interrupt();
    peripherals.SYST.enable_counter();
}

/// Handle a SysTick interrupt.
///
/// # Safety
///
/// Interrupt context, CPU Lock inactive
#[inline(always)]
pub unsafe fn handle_tick<Traits: KernelTraits>() {
    // Safety: CPU Lock inactive, an interrupt context
    unsafe { Traits::timer_tick() };
}
