//! Kernel state locking mechanism
use core::{fmt, mem};
use tokenlock::UnsyncTokenLock;

use crate::{error::FatalError, utils::Init, PortThreading};

pub(crate) struct CpuLockTag<Traits>(Traits);

/// The key that "unlocks" [`CpuLockCell`].
pub(crate) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(crate) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Cell type that can be accessed by [`CpuLockGuard`] (which can be obtained
/// by [`lock_cpu`]).
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<Traits: PortThreading, T: ?Sized> CpuLockCell<Traits, T> {
    #[inline]
    pub(crate) fn read<'a>(&'a self, lock: &'a CpuLockGuard<Traits>) -> &'a T {
        self.0.read(&lock.token)
    }

    #[inline]
    pub(crate) fn write<'a>(&'a self, lock: &'a mut CpuLockGuard<Traits>) -> &'a mut T {
        self.0.write(&mut lock.token)
    }

    #[inline]
    pub(crate) fn get(&self, lock: &CpuLockGuard<Traits>) -> T
    where
        T: Clone,
    {
        self.read(lock).clone()
    }

    #[inline]
    pub(crate) fn replace(&self, lock: &mut CpuLockGuard<Traits>, x: T) -> T
    where
        T: Sized,
    {
        mem::replace(self.write(lock), x)
    }

    /// Return a debug formatting proxy of the cell. The given closure is used
    /// to format the borrowed contents. Note that CPU Lock is active when the
    /// closure is called.
    pub(crate) fn debug_fmt_with_ref<'a, F: 'a + Fn(&T, &mut fmt::Formatter) -> fmt::Result>(
        &'a self,
        f: F,
    ) -> impl fmt::Debug + 'a {
        struct DebugFmtWithRef<'a, Traits, T: ?Sized, F> {
            cell: &'a CpuLockCell<Traits, T>,
            f: F,
        }

        impl<Traits: PortThreading, T: ?Sized, F: Fn(&T, &mut fmt::Formatter) -> fmt::Result>
            fmt::Debug for DebugFmtWithRef<'_, Traits, T, F>
        {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if let Some(lock) = try_lock_cpu::<Traits>() {
                    f.write_str("CpuLockCell(")?;
                    (self.f)(self.cell.read(&lock), f)?;
                    f.write_str(")")
                } else {
                    f.write_str("CpuLockCell(< locked >)")
                }
            }
        }

        DebugFmtWithRef { cell: self, f }
    }
}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.debug_fmt_with_ref(|x, f| x.fmt(f)).fmt(f)
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

/// Attempt to enter a CPU Lock state and get an RAII guard.
/// Return `None` if the kernel is already in a CPU Lock state.
pub(crate) fn try_lock_cpu<Traits: PortThreading>() -> Option<CpuLockGuard<Traits>> {
    // Safety: `try_enter_cpu_lock` is only meant to be called by the kernel
    if unsafe { Traits::try_enter_cpu_lock() } {
        // Safety: We just entered a CPU Lock state. This also means there are
        //         no instances of `CpuLockGuard` existing at this point.
        Some(unsafe { assume_cpu_lock() })
    } else {
        None
    }
}

/// Enter a CPU Lock state and get an RAII guard.
///
/// Kernel entry points are not reentrant. Calling one with CPU Lock already
/// active is a fatal [`FatalError::BadContext`].
pub(crate) fn lock_cpu<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    match try_lock_cpu() {
        Some(lock) => lock,
        None => crate::error::fatal(FatalError::BadContext),
    }
}

/// Assume a CPU Lock state and get `CpuLockGuard`.
///
/// # Safety
///
/// The system must be really in a CPU Lock state. There must be no instances of
/// `CpuLockGuard` existing at the point of the call.
pub(crate) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: There are no other instances of `CpuLockToken`; this is
        //         upheld by the caller.
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// RAII guard for a CPU Lock state. Dropping it leaves CPU Lock on every exit
/// path, including unwinding.
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Keep CPU Lock active after the guard is gone. Used when the port, not
    /// the kernel, owns the CPU Lock state (e.g., in the dispatcher).
    pub(crate) fn forget(self) {
        mem::forget(self);
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is currently active, and it's us (the kernel) who
        // are currently controlling the CPU Lock state
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}
