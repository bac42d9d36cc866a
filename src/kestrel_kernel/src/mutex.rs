//! Mutexes
use core::fmt;

use crate::{
    error::{LockMutexError, TimeoutError},
    klock::{self, CpuLockCell, CpuLockGuard},
    sched,
    timeout::Ticks,
    utils::Init,
    wait::{self, LockKind, WaitFlags},
    KernelTraits, PortThreading, Word,
};

/// A word of mutex bits. Each bit is an independent lock: a set bit means
/// locked. [`Self::lock`] with a multi-bit mask acquires all of the bits at
/// once.
///
/// There's no ownership tracking and no priority inheritance. A
/// low-priority task holding a bit can keep a high-priority waiter blocked
/// for as long as a medium-priority task keeps running.
pub struct Mutex<Traits> {
    word: CpuLockCell<Traits, Word>,
}

impl<Traits> Mutex<Traits> {
    /// Construct a `Mutex` with all bits clear.
    pub const fn new() -> Self {
        Self {
            word: CpuLockCell::new(0),
        }
    }
}

impl<Traits> Init for Mutex<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits> Default for Mutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field("word", &self.word)
            .finish()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Acquire all bits in `mask`, blocking until they are clear.
    ///
    /// Returns `WouldBlock` if any of them is set and `flags` contains
    /// [`WaitFlags::NOWAIT`]. In that case, no reschedule is requested.
    /// Returns `Timeout` if they didn't become clear within `timeout` ticks
    /// ([`WAIT_FOREVER`](crate::WAIT_FOREVER) waits indefinitely).
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn lock(
        &'static self,
        mask: Word,
        flags: WaitFlags,
        timeout: Ticks,
    ) -> Result<(), LockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>();
        self.lock_locked(&mut lock, mask, flags, timeout)?;
        Ok(())
    }

    /// Clear the bits in `mask` and request a reschedule so that a waiter can
    /// run immediately.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn unlock(&self, mask: Word) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.unlock_locked(&mut lock, mask);
    }

    /// Clear the bits in `mask` without requesting a reschedule. A waiter
    /// will notice at the next reschedule.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn unlock_ns(&self, mask: Word) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.unlock_ns_locked(&mut lock, mask);
    }

    /// Return `true` if any of the bits in `mask` is set.
    pub fn is_locked(&self, mask: Word) -> bool {
        let lock = klock::lock_cpu::<Traits>();
        !self.is_clear_locked(&lock, mask)
    }

    /// The readiness predicate of [`LockKind::WaitMutex`].
    #[inline]
    pub(crate) fn is_clear_locked(&self, lock: &CpuLockGuard<Traits>, mask: Word) -> bool {
        *self.word.read(lock) & mask == 0
    }

    /// Acquire the bits in `mask` if they are all clear.
    fn poll_locked(&self, lock: &mut CpuLockGuard<Traits>, mask: Word) -> bool {
        if self.is_clear_locked(lock, mask) {
            *self.word.write(lock) |= mask;
            true
        } else {
            false
        }
    }

    /// Implements [`Self::lock`]. On success, returns what's left of
    /// `timeout` so that a caller that has more waiting to do can carry it
    /// over.
    pub(crate) fn lock_locked(
        &'static self,
        lock: &mut CpuLockGuard<Traits>,
        mask: Word,
        flags: WaitFlags,
        mut timeout: Ticks,
    ) -> Result<Ticks, LockMutexError> {
        loop {
            if self.poll_locked(lock, mask) {
                return Ok(timeout);
            }

            if flags.contains(WaitFlags::NOWAIT) {
                return Err(LockMutexError::WouldBlock);
            }

            match wait::block_on_locked(lock, LockKind::WaitMutex(self, mask), timeout) {
                Ok(remaining) => timeout = remaining,
                Err(TimeoutError::Timeout) => {
                    // The bits might have been released right as the timeout
                    // expired
                    return if self.poll_locked(lock, mask) {
                        Ok(crate::EXPIRED)
                    } else {
                        Err(LockMutexError::Timeout)
                    };
                }
            }
        }
    }

    pub(crate) fn unlock_locked(&self, lock: &mut CpuLockGuard<Traits>, mask: Word) {
        self.unlock_ns_locked(lock, mask);
        sched::request_reschedule_locked(lock);
    }

    pub(crate) fn unlock_ns_locked(&self, lock: &mut CpuLockGuard<Traits>, mask: Word) {
        *self.word.write(lock) &= !mask;
    }
}
