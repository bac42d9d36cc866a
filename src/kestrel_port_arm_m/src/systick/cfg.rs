use kestrel_kernel::KernelCfg;

/// The configuration for the SysTick-based tick source.
pub trait SysTickOptions: KernelCfg {
    /// The numerator of the input clock frequency of SysTick.
    const FREQUENCY: u64;

    /// The denominator of the input clock frequency of SysTick.
    /// Defaults to `1`.
    const FREQUENCY_DENOMINATOR: u64 = 1;

    /// The interrupt priority of SysTick. Defaults to `0xc0`.
    const INTERRUPT_PRIORITY: u8 = 0xc0;

    /// The reload period measured in SysTick cycles, derived from
    /// [`KernelCfg::TICK_PERIOD_US`].
    const TICK_PERIOD: u32 = tick_period_cycles(
        Self::FREQUENCY,
        Self::FREQUENCY_DENOMINATOR,
        Self::TICK_PERIOD_US,
    );
}

/// Convert a tick period in microseconds to SysTick cycles, clamped to the
/// 24-bit counter's range `1..=0x1000000`.
pub const fn tick_period_cycles(freq_num: u64, freq_denom: u64, period_us: u32) -> u32 {
    let x = freq_num as u128 * period_us as u128 / (freq_denom as u128 * 1_000_000);
    if x == 0 {
        1
    } else if x > 0x100_0000 {
        0x100_0000
    } else {
        x as u32
    }
}

/// Attach the SysTick-based tick source to a given kernel trait type.
///
/// You should also do the following:
///
///  - Implement [`SysTickOptions`] manually.
///  - Call `$Traits::configure_systick()` in your initialization function.
///    See the following example.
///
/// ```rust,ignore
/// kestrel_port_arm_m::use_systick!(unsafe impl PortTimer for SystemTraits);
///
/// impl kestrel_port_arm_m::SysTickOptions for SystemTraits {
///    // SysTick = AHB/8, AHB = HSI (internal 16-MHz RC oscillator)
///     const FREQUENCY: u64 = 2_000_000;
/// }
///
/// fn init() {
///     SystemTraits::configure_systick();
///     /* ... */
/// }
/// ```
///
/// # Safety
///
///  - The target must really be a bare-metal Arm-M environment.
///
#[macro_export]
macro_rules! use_systick {
    (unsafe impl PortTimer for $Traits:ty) => {
        const _: () = {
            use $crate::systick::imp;

            impl $Traits {
                /// Configure SysTick and start the periodic tick.
                pub fn configure_systick() {
                    imp::configure::<Self>();
                }
            }

            #[$crate::cortex_m_rt::exception]
            fn SysTick() {
                // Safety: It's a first-level interrupt handler here. CPU Lock
                //         inactive
                unsafe { imp::handle_tick::<$Traits>() };
            }
        };
    };
}
