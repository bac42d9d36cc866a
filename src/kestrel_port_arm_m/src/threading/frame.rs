//! The layout of a saved task context
//!
//! ```text
//!   high address  ┌──────────────┐ ← top of the stack (8-byte aligned)
//!                 │ xPSR         │
//!                 │ PC           │
//!                 │ LR           │
//!                 │ R12          │  hardware frame (stacked on exception
//!                 │ R3 .. R1     │  entry, unstacked on exception return)
//!                 │ R0           │
//!                 ├──────────────┤
//!                 │ EXC_RETURN   │
//!                 │ R11 .. R4    │  software frame (saved and restored by
//!                 │ CONTROL      │  the PendSV handler)
//!   low address   └──────────────┘ ← TaskState::sp
//! ```
use core::{mem::MaybeUninit, slice};

/// `EXC_RETURN`: Return to Thread mode. Exception return gets state from the
/// process stack, and execution uses the process stack after return.
pub const EXC_RETURN_THREAD_PSP: u32 = 0xffff_fffd;

/// `CONTROL`: `SPSEL = 1` (use PSP), privileged Thread mode.
pub const CONTROL_PSP: u32 = 0x0000_0002;

/// `xPSR` with the Thumb bit set.
pub const XPSR_THUMB: u32 = 0x0100_0000;

/// The number of words in the hardware frame.
pub const HW_FRAME_WORDS: usize = 8;

/// The number of words in the software frame.
pub const SW_FRAME_WORDS: usize = 10;

/// The number of bytes a task's initial context occupies.
pub const INITIAL_FRAME_SIZE: usize = (HW_FRAME_WORDS + SW_FRAME_WORDS) * 4;

/// The register values a task starts with.
#[derive(Debug, Clone, Copy)]
pub struct InitialContext {
    /// The address of the entry point. The Thumb bit may be set.
    pub entry_point: u32,
    /// Passed in `R0`.
    pub entry_param: u32,
    /// The return address of the entry point.
    pub exit: u32,
}

/// Write `ctx` at the top of `stack` so that the PendSV handler's context
/// restoration sequence "returns" to `ctx.entry_point`. Returns the new
/// stack pointer.
///
/// # Safety
///
/// `stack` must be valid for writes and at least
/// `INITIAL_FRAME_SIZE + 8` bytes long.
pub unsafe fn write_initial_frame(stack: *mut [u8], ctx: &InitialContext) -> *mut u32 {
    let start = stack as *mut u8;
    let len = stack.len();
    let top = start.wrapping_add(len);
    let top = top.wrapping_sub(top as usize % 8) as *mut MaybeUninit<u32>;

    let preload_all = cfg!(feature = "preload-registers");

    // Safety: `stack` is large enough
    let hw_frame = unsafe {
        slice::from_raw_parts_mut(top.sub(HW_FRAME_WORDS), HW_FRAME_WORDS)
    };

    // R0: Parameter to the entry point
    hw_frame[0] = MaybeUninit::new(ctx.entry_param);
    // R1-R3, R12: Uninitialized
    if preload_all {
        hw_frame[1] = MaybeUninit::new(0x01010101);
        hw_frame[2] = MaybeUninit::new(0x02020202);
        hw_frame[3] = MaybeUninit::new(0x03030303);
        hw_frame[4] = MaybeUninit::new(0x12121212);
    }
    // LR: The return address
    hw_frame[5] = MaybeUninit::new(ctx.exit);
    // PC: The entry point. A function pointer has its LSB set to mark a
    // Thumb function, but the PC value in an exception frame must be
    // halfword aligned.
    hw_frame[6] = MaybeUninit::new(ctx.entry_point & !1);
    hw_frame[7] = MaybeUninit::new(XPSR_THUMB);

    // Safety: `stack` is large enough
    let sw_frame = unsafe {
        slice::from_raw_parts_mut(
            top.sub(HW_FRAME_WORDS + SW_FRAME_WORDS),
            SW_FRAME_WORDS,
        )
    };

    sw_frame[0] = MaybeUninit::new(CONTROL_PSP);
    // R4-R11: Uninitialized
    if preload_all {
        for (i, word) in sw_frame[1..9].iter_mut().enumerate() {
            *word = MaybeUninit::new(0x04040404 * (i as u32 + 1));
        }
    }
    sw_frame[9] = MaybeUninit::new(EXC_RETURN_THREAD_PSP);

    sw_frame.as_mut_ptr() as *mut u32
}
