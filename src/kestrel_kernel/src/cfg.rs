//! Static configuration mechanism for the kernel
use core::{cell::UnsafeCell, fmt, mem};

/// A statically allocated, 8-byte aligned memory region. Task stacks, the
/// idle stack, and the kernel heap arena are hunks.
///
/// A `&'static Hunk<[u8; N]>` coerces to `&'static Hunk<[u8]>`, which is the
/// form the kernel API accepts.
///
/// ```
/// use kestrel_kernel::Hunk;
/// static STACK: Hunk<[u8; 1024]> = Hunk::new();
/// let stack: &'static Hunk<[u8]> = &STACK;
/// assert_eq!(stack.len(), 1024);
/// assert_eq!(stack.as_ptr() as *mut u8 as usize % 8, 0);
/// ```
#[repr(C)]
pub struct Hunk<T: ?Sized> {
    _align: [u64; 0],
    cell: UnsafeCell<T>,
}

// Safety: The kernel never creates references to a hunk's contents; it only
//         hands out raw pointers
unsafe impl<T: ?Sized> Sync for Hunk<T> {}

impl<const LEN: usize> Hunk<[u8; LEN]> {
    /// Construct a zero-filled hunk.
    pub const fn new() -> Self {
        Self {
            _align: [],
            cell: UnsafeCell::new([0; LEN]),
        }
    }
}

impl<const LEN: usize> Default for Hunk<[u8; LEN]> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Hunk<T> {
    /// Get a raw pointer to the hunk's contents.
    #[inline]
    pub const fn as_ptr(&self) -> *mut T {
        self.cell.get()
    }
}

impl Hunk<[u8]> {
    /// The size of the hunk in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        mem::size_of_val(&self.cell)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> fmt::Debug for Hunk<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Hunk({:p}, {} bytes)",
            self.cell.get() as *mut u8,
            mem::size_of_val(&self.cell)
        )
    }
}

/// Instantiate the kernel for a kernel trait type. The trait type must
/// already implement [`PortThreading`](crate::PortThreading) (this is usually
/// done by the port's `use_port!` macro).
///
/// This macro creates the static task table (`tasks` user tasks plus the idle
/// task), the heap arena (`heap` bytes), and the idle task's stack
/// (`idle_stack` bytes), and implements [`KernelCfg`](crate::KernelCfg) and
/// [`KernelTraits`](crate::KernelTraits) for the trait type.
///
/// ```ignore
/// kestrel_port_std::use_port!(unsafe struct SystemTraits);
/// kestrel_kernel::build!(SystemTraits {
///     tasks: 4,
///     heap: 4096,
///     idle_stack: 1024,
///     tick_period_us: 1000,
///     time_slice: 5,
/// });
/// ```
#[macro_export]
macro_rules! build {
    (
        $Traits:ty {
            tasks: $num_tasks:expr,
            heap: $heap_size:expr,
            idle_stack: $idle_stack_size:expr
            $(, tick_period_us: $tick_period_us:expr )?
            $(, time_slice: $time_slice:expr )?
            $(,)?
        }
    ) => {
        const _: () = {
            use $crate::{utils::Init, Hunk, KernelCfg, KernelTraits, State, TaskCb};

            const NUM_TASK_CBS: usize = $num_tasks + 1;

            static TASK_CB_POOL: [TaskCb<$Traits>; NUM_TASK_CBS] =
                [const { <TaskCb<$Traits> as Init>::INIT }; NUM_TASK_CBS];
            static HEAP: Hunk<[u8; $heap_size]> = Hunk::new();
            static IDLE_STACK: Hunk<[u8; $idle_stack_size]> = Hunk::new();
            static STATE: State<$Traits> = State::new(&TASK_CB_POOL, &IDLE_STACK, &HEAP);

            impl KernelCfg for $Traits {
                $( const TICK_PERIOD_US: u32 = $tick_period_us; )?
                $( const TIME_SLICE: $crate::Ticks = $time_slice; )?
            }

            // Safety: We are `build!`, so it's okay to `impl` this
            unsafe impl KernelTraits for $Traits {
                #[inline(always)]
                fn state() -> &'static State<Self> {
                    &STATE
                }
            }
        };
    };
}
