//! Events
use core::fmt;

use crate::{
    error::{TimeoutError, WaitEventError},
    klock::{self, CpuLockCell, CpuLockGuard},
    sched,
    timeout::Ticks,
    utils::Init,
    wait::{self, LockKind, WaitFlags},
    KernelTraits, PortThreading, Word,
};

/// A word of event bits. A set bit means a signal is pending.
///
/// Events are level-triggered: a raised bit stays set until a waiter
/// consumes it with [`WaitFlags::CLEAR`] or someone calls [`Self::clear`].
/// Hence a wait that starts after the raise still succeeds without blocking.
pub struct Event<Traits> {
    word: CpuLockCell<Traits, Word>,
}

impl<Traits> Event<Traits> {
    /// Construct an `Event` with all bits clear.
    pub const fn new() -> Self {
        Self {
            word: CpuLockCell::new(0),
        }
    }
}

impl<Traits> Init for Event<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits> Default for Event<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> fmt::Debug for Event<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("self", &(self as *const _))
            .field("word", &self.word)
            .finish()
    }
}

impl<Traits: KernelTraits> Event<Traits> {
    /// Set the bits in `mask` and request a reschedule so that a waiter can
    /// run immediately.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn raise(&self, mask: Word) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.raise_ns_locked(&mut lock, mask);
        sched::request_reschedule_locked(&lock);
    }

    /// Set the bits in `mask` without requesting a reschedule. This is the
    /// variant to use in an interrupt handler that doesn't want to yield.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn raise_ns(&self, mask: Word) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.raise_ns_locked(&mut lock, mask);
    }

    /// Clear the bits in `mask`.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn clear(&self, mask: Word) {
        let mut lock = klock::lock_cpu::<Traits>();
        *self.word.write(&mut lock) &= !mask;
    }

    /// Get the current bits.
    pub fn get(&self) -> Word {
        let lock = klock::lock_cpu::<Traits>();
        self.word.get(&lock)
    }

    /// Wait until any of the bits in `mask` is set, and return the set ones
    /// among them. With [`WaitFlags::CLEAR`], the returned bits are cleared
    /// in the same critical section.
    ///
    /// Returns `WouldBlock` if none of them is set and `flags` contains
    /// [`WaitFlags::NOWAIT`], and `Timeout` if none of them became set within
    /// `timeout` ticks.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn wait(
        &'static self,
        mask: Word,
        flags: WaitFlags,
        mut timeout: Ticks,
    ) -> Result<Word, WaitEventError> {
        let mut lock = klock::lock_cpu::<Traits>();
        loop {
            if let Some(matched) = self.poll_locked(&mut lock, mask, flags) {
                return Ok(matched);
            }

            if flags.contains(WaitFlags::NOWAIT) {
                return Err(WaitEventError::WouldBlock);
            }

            match wait::block_on_locked(&mut lock, LockKind::WaitEvent(self, mask), timeout) {
                Ok(remaining) => timeout = remaining,
                Err(TimeoutError::Timeout) => {
                    return self
                        .poll_locked(&mut lock, mask, flags)
                        .ok_or(WaitEventError::Timeout);
                }
            }
        }
    }

    /// The readiness predicate of [`LockKind::WaitEvent`]: the bits in `mask`
    /// that are set.
    #[inline]
    pub(crate) fn matched_locked(&self, lock: &CpuLockGuard<Traits>, mask: Word) -> Word {
        *self.word.read(lock) & mask
    }

    /// Consume the set bits in `mask`, if any.
    pub(crate) fn poll_locked(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        mask: Word,
        flags: WaitFlags,
    ) -> Option<Word> {
        let matched = self.matched_locked(lock, mask);
        if matched == 0 {
            return None;
        }
        if flags.contains(WaitFlags::CLEAR) {
            *self.word.write(lock) &= !matched;
        }
        Some(matched)
    }

    pub(crate) fn raise_ns_locked(&self, lock: &mut CpuLockGuard<Traits>, mask: Word) {
        *self.word.write(lock) |= mask;
    }
}
