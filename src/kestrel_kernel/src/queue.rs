//! Message queues
use core::{fmt, ptr::NonNull};

use crate::{
    error::{fatal, FatalError, QueueError},
    heap,
    klock::{self, CpuLockCell, CpuLockGuard},
    mutex::Mutex,
    timeout::{Ticks, EXPIRED, WAIT_FOREVER},
    utils::Init,
    wait::{self, LockKind, WaitFlags},
    KernelTraits, PortThreading, Word,
};

/// The bit of [`Queue::mutex`] serializing accesses to the ring's contents.
const RING_LOCK: Word = 1;

/// The size of the length prefix of each slot.
const LEN_HEADER_SIZE: usize = 2;

/// A bounded FIFO queue of variable-length messages.
///
/// The queue owns a ring of fixed-size slots allocated from the kernel heap
/// by [`Self::create`]. Each slot holds a little-endian `u16` length followed
/// by up to `max_payload` bytes of payload. Messages are copied in and out
/// while the queue's internal mutex is held, not under CPU Lock, so the
/// interrupt latency doesn't depend on the message size.
pub struct Queue<Traits> {
    mutex: Mutex<Traits>,
    ring: CpuLockCell<Traits, Option<Ring>>,
}

impl<Traits> Queue<Traits> {
    /// Construct a `Queue`. It must be [created](Self::create) before use.
    pub const fn new() -> Self {
        Self {
            mutex: Mutex::new(),
            ring: CpuLockCell::new(None),
        }
    }
}

impl<Traits> Init for Queue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits> Default for Queue<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> fmt::Debug for Queue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue")
            .field("self", &(self as *const _))
            .field("mutex", &self.mutex)
            .field("ring", &self.ring)
            .finish()
    }
}

impl<Traits: KernelTraits> Queue<Traits> {
    /// Allocate a ring of `capacity_slots` slots, each holding up to
    /// `max_payload` bytes.
    ///
    /// Creating a queue twice, a zero `capacity_slots`, or a `max_payload`
    /// that doesn't fit in the `u16` length prefix is a fatal error.
    pub fn create(&'static self, capacity_slots: usize, max_payload: usize) {
        if capacity_slots == 0 || max_payload > u16::MAX as usize {
            log::error!(
                "queue {:p}: invalid geometry ({} slots of {} bytes)",
                self,
                capacity_slots,
                max_payload
            );
            fatal(FatalError::BadParam);
        }

        let capacity_bytes = match capacity_slots.checked_mul(LEN_HEADER_SIZE + max_payload) {
            Some(x) => x,
            None => fatal(FatalError::BadParam),
        };

        if self.is_created() {
            fatal(FatalError::BadObjectState);
        }

        let buf = heap::alloc::<Traits>(capacity_bytes);

        let mut lock = klock::lock_cpu::<Traits>();
        if self.ring.read(&lock).is_some() {
            fatal(FatalError::BadObjectState);
        }
        // Safety: `buf` is valid for `capacity_bytes` bytes and owned by the
        //         queue from now on
        let ring = unsafe { Ring::new(buf, capacity_slots, max_payload) };
        self.ring.replace(&mut lock, Some(ring));

        log::debug!(
            "queue {:p}: created with {} slots of {} bytes",
            self,
            capacity_slots,
            max_payload
        );
    }

    fn is_created(&self) -> bool {
        let lock = klock::lock_cpu::<Traits>();
        self.ring.read(&lock).is_some()
    }

    /// Append a message to the queue, blocking while the queue is full.
    ///
    /// A message longer than `max_payload` is a fatal error. Returns
    /// `WouldBlock` if the queue is full (or is being accessed by another
    /// task) and `flags` contains [`WaitFlags::NOWAIT`], and `Timeout` if no
    /// room became available within `timeout` ticks.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn add(&'static self, flags: WaitFlags, timeout: Ticks, data: &[u8]) -> Result<(), QueueError> {
        let mut lock = klock::lock_cpu::<Traits>();

        let slot_size = self.ring_locked(&lock).slot_size;
        if data.len() > slot_size {
            drop(lock);
            log::error!(
                "queue {:p}: {} byte message exceeds the {} byte slot",
                self,
                data.len(),
                slot_size
            );
            fatal(FatalError::MessageTooLarge);
        }

        let ring = self.acquire_locked(&mut lock, flags, timeout, Ring::has_room, |queue| {
            LockKind::WaitQueueFull(queue)
        })?;

        // Copy the message outside CPU Lock. The ring mutex keeps the slot
        // ours.
        drop(lock);
        // Safety: We hold `RING_LOCK`
        unsafe { ring.write_slot(data) };

        let mut lock = klock::lock_cpu::<Traits>();
        if let Some(ring) = self.ring.write(&mut lock) {
            ring.commit_write();
        }
        self.mutex.unlock_locked(&mut lock, RING_LOCK);
        Ok(())
    }

    /// Remove the oldest message from the queue, blocking while the queue is
    /// empty. The message is copied to `buf` and the number of copied bytes
    /// is returned. A message longer than `buf` is truncated.
    ///
    /// Returns `WouldBlock` if the queue is empty (or is being accessed by
    /// another task) and `flags` contains [`WaitFlags::NOWAIT`], and
    /// `Timeout` if no message arrived within `timeout` ticks.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn remove(
        &'static self,
        flags: WaitFlags,
        timeout: Ticks,
        buf: &mut [u8],
    ) -> Result<usize, QueueError> {
        let mut lock = klock::lock_cpu::<Traits>();

        let ring = self.acquire_locked(&mut lock, flags, timeout, Ring::has_data, |queue| {
            LockKind::WaitQueueEmpty(queue)
        })?;

        drop(lock);
        // Safety: We hold `RING_LOCK`
        let len = unsafe { ring.read_slot(buf) };

        let mut lock = klock::lock_cpu::<Traits>();
        if let Some(ring) = self.ring.write(&mut lock) {
            ring.commit_read();
        }
        self.mutex.unlock_locked(&mut lock, RING_LOCK);
        drop(lock);

        if len > buf.len() {
            log::warn!(
                "queue {:p}: {} byte message truncated to {} bytes",
                self,
                len,
                buf.len()
            );
        }

        Ok(len.min(buf.len()))
    }

    /// Discard all queued messages. Tasks waiting for room are released.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn flush(&'static self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.ring_locked(&lock);

        if self
            .mutex
            .lock_locked(&mut lock, RING_LOCK, WaitFlags::NONE, WAIT_FOREVER)
            .is_err()
        {
            unreachable!();
        }

        if let Some(ring) = self.ring.write(&mut lock) {
            log::debug!("queue {:p}: flushing {} message(s)", self, ring.len());
            ring.clear();
        }
        self.mutex.unlock_locked(&mut lock, RING_LOCK);
    }

    /// Get the number of queued messages.
    pub fn len(&self) -> usize {
        let lock = klock::lock_cpu::<Traits>();
        self.ring.read(&lock).as_ref().map_or(0, Ring::len)
    }

    /// Return `true` if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return `true` if every slot is occupied.
    pub fn is_full(&self) -> bool {
        let lock = klock::lock_cpu::<Traits>();
        !self.has_room_locked(&lock)
    }

    /// The readiness predicate of [`LockKind::WaitQueueFull`].
    pub(crate) fn has_room_locked(&self, lock: &CpuLockGuard<Traits>) -> bool {
        self.ring.read(lock).as_ref().map_or(false, Ring::has_room)
    }

    /// The readiness predicate of [`LockKind::WaitQueueEmpty`].
    pub(crate) fn has_data_locked(&self, lock: &CpuLockGuard<Traits>) -> bool {
        self.ring.read(lock).as_ref().map_or(false, Ring::has_data)
    }

    fn ring_locked(&self, lock: &CpuLockGuard<Traits>) -> Ring {
        match *self.ring.read(lock) {
            Some(ring) => ring,
            None => {
                log::error!("queue {:p}: used before creation", self);
                fatal(FatalError::BadObjectState)
            }
        }
    }

    /// Acquire `RING_LOCK` with `cond` holding on the ring. While `cond`
    /// doesn't hold, the mutex is released and the task blocks on the wait
    /// built by `wait_kind`.
    fn acquire_locked(
        &'static self,
        lock: &mut CpuLockGuard<Traits>,
        flags: WaitFlags,
        mut timeout: Ticks,
        cond: fn(&Ring) -> bool,
        wait_kind: fn(&'static Self) -> LockKind<Traits>,
    ) -> Result<Ring, QueueError> {
        loop {
            timeout = self.mutex.lock_locked(lock, RING_LOCK, flags, timeout)?;

            let ring = self.ring_locked(lock);
            if cond(&ring) {
                return Ok(ring);
            }

            self.mutex.unlock_ns_locked(lock, RING_LOCK);

            if flags.contains(WaitFlags::NOWAIT) {
                return Err(QueueError::WouldBlock);
            }

            if timeout == EXPIRED {
                // This was the last check after a timeout
                return Err(QueueError::Timeout);
            }

            // On timeout, make one more pass to pick up a change that raced
            // with the expiry
            timeout = wait::block_on_locked(lock, wait_kind(self), timeout).unwrap_or(EXPIRED);
        }
    }
}

/// The ring buffer of a [`Queue`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ring {
    buf: NonNull<u8>,
    /// The maximum payload size.
    slot_size: usize,
    capacity_bytes: usize,
    byte_count: usize,
    write_offset: usize,
}

// Safety: The buffer is owned by the ring. Its contents are only accessed
//         while the queue's mutex is held.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Construct an empty `Ring`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads and writes of
    /// `slots * (LEN_HEADER_SIZE + slot_size)` bytes for the ring's lifetime.
    unsafe fn new(buf: NonNull<u8>, slots: usize, slot_size: usize) -> Self {
        Self {
            buf,
            slot_size,
            capacity_bytes: slots * (LEN_HEADER_SIZE + slot_size),
            byte_count: 0,
            write_offset: 0,
        }
    }

    #[inline]
    fn stride(&self) -> usize {
        LEN_HEADER_SIZE + self.slot_size
    }

    fn has_room(&self) -> bool {
        self.byte_count < self.capacity_bytes
    }

    fn has_data(&self) -> bool {
        self.byte_count > 0
    }

    fn len(&self) -> usize {
        self.byte_count / self.stride()
    }

    fn read_offset(&self) -> usize {
        (self.write_offset + self.capacity_bytes - self.byte_count) % self.capacity_bytes
    }

    /// Write `data` to the slot at the write position.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the slot.
    unsafe fn write_slot(&self, data: &[u8]) {
        debug_assert!(self.has_room());
        debug_assert!(data.len() <= self.slot_size);
        let header = (data.len() as u16).to_le_bytes();
        // Safety: The slot is within `buf` and not aliased
        unsafe {
            let slot = self.buf.as_ptr().add(self.write_offset);
            core::ptr::copy_nonoverlapping(header.as_ptr(), slot, LEN_HEADER_SIZE);
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                slot.add(LEN_HEADER_SIZE),
                data.len(),
            );
        }
    }

    fn commit_write(&mut self) {
        self.write_offset = (self.write_offset + self.stride()) % self.capacity_bytes;
        self.byte_count += self.stride();
    }

    /// Copy the message at the read position to `out`, truncating it if
    /// needed. Returns the message's full length.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the slot.
    unsafe fn read_slot(&self, out: &mut [u8]) -> usize {
        debug_assert!(self.has_data());
        let mut header = [0u8; LEN_HEADER_SIZE];
        // Safety: The slot is within `buf` and not aliased
        unsafe {
            let slot = self.buf.as_ptr().add(self.read_offset());
            core::ptr::copy_nonoverlapping(slot, header.as_mut_ptr(), LEN_HEADER_SIZE);
            let len = u16::from_le_bytes(header) as usize;
            core::ptr::copy_nonoverlapping(
                slot.add(LEN_HEADER_SIZE),
                out.as_mut_ptr(),
                len.min(out.len()),
            );
            len
        }
    }

    fn commit_read(&mut self) {
        self.byte_count -= self.stride();
    }

    fn clear(&mut self) {
        self.byte_count = 0;
        self.write_offset = 0;
    }
}
