//! The kernel heap
//!
//! A best-fit allocator over a single static arena. The arena is carved into
//! blocks, each starting with a [`BlockHeader`], chained from the lowest
//! address to the highest. Freeing a block only marks it free; adjacent free
//! blocks are merged by the next allocation's scan.
use core::{fmt, mem, ptr, ptr::NonNull};

use crate::{
    error::{fatal, FatalError},
    timeout::WAIT_FOREVER,
    wait::WaitFlags,
    KernelTraits, Word,
};

/// The alignment of every allocation.
pub const HEAP_ALIGN: usize = 8;

const HEADER_SIZE: usize = align_up(mem::size_of::<BlockHeader>());

/// The smallest remainder worth splitting off a block.
const MIN_REMAINDER: usize = HEAP_ALIGN;

const MAGIC: u32 = 0x4b48_4250;
const STATE_FREE: u32 = 0x4652_4545;
const STATE_BUSY: u32 = 0x4255_5359;

/// The bit of `State::heap_lock` serializing heap accesses.
const HEAP_LOCK: Word = 1;

const fn align_up(x: usize) -> usize {
    (x + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1)
}

/// [`align_up`] for request sizes, which may be arbitrarily large.
fn checked_align_up(x: usize) -> Option<usize> {
    Some(x.checked_add(HEAP_ALIGN - 1)? & !(HEAP_ALIGN - 1))
}

#[repr(C)]
struct BlockHeader {
    magic: u32,
    /// `STATE_FREE` or `STATE_BUSY`.
    state: u32,
    /// The payload size in bytes, excluding the header.
    size: usize,
    /// The next block in address order.
    next: *mut BlockHeader,
}

/// Usage statistics of a [`Heap`], gathered by walking its block chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// The number of blocks, free or busy.
    pub blocks: usize,
    pub free_blocks: usize,
    /// The total payload bytes of free blocks.
    pub free_bytes: usize,
    /// The total payload bytes of busy blocks.
    pub used_bytes: usize,
    /// The payload size of the largest free block.
    pub largest_free: usize,
    /// The number of free blocks immediately followed by another free block.
    /// Zero right after an allocation.
    pub adjacent_free_pairs: usize,
}

/// A best-fit allocator managing one memory region.
///
/// This type does no locking of its own. The kernel heap wraps it in the
/// heap mutex.
pub struct Heap {
    base: *mut u8,
    len: usize,
    /// The first block. Null until the first allocation carves the arena.
    first: *mut BlockHeader,
}

// Safety: `Heap` owns the region it manages
unsafe impl Send for Heap {}

impl Heap {
    /// Construct a `Heap` managing no memory.
    pub const fn new() -> Self {
        Self {
            base: ptr::null_mut(),
            len: 0,
            first: ptr::null_mut(),
        }
    }

    /// Return `true` if [`Self::init`] has been called.
    pub fn is_initialized(&self) -> bool {
        !self.base.is_null()
    }

    /// Assign the region to manage. The region is trimmed to
    /// [`HEAP_ALIGN`]-byte boundaries. No blocks are created until the first
    /// allocation.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes and must not be accessed
    /// by anything else for the lifetime of the `Heap`.
    pub unsafe fn init(&mut self, region: *mut [u8]) {
        let start = region as *mut u8 as usize;
        let end = start + region.len();
        let aligned_start = align_up(start);
        let aligned_end = end & !(HEAP_ALIGN - 1);
        self.base = (region as *mut u8).wrapping_add(aligned_start - start);
        self.len = aligned_end.saturating_sub(aligned_start);
        self.first = ptr::null_mut();
    }

    /// Allocate `size` bytes. The returned pointer is aligned to
    /// [`HEAP_ALIGN`] bytes.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, FatalError> {
        let Some(size) = checked_align_up(size.max(1)) else {
            log::error!("heap: request of {} bytes overflows", size);
            return Err(FatalError::HeapExhausted);
        };

        if self.first.is_null() {
            self.carve()?;
        }

        // Safety: The chain was validated as we go
        unsafe {
            let mut best: *mut BlockHeader = ptr::null_mut();
            let mut block = self.first;
            while !block.is_null() {
                self.check_header(block)?;

                if (*block).state == STATE_FREE {
                    // Absorb the following free blocks
                    while !(*block).next.is_null() {
                        let next = (*block).next;
                        self.check_header(next)?;
                        if (*next).state != STATE_FREE {
                            break;
                        }
                        (*block).size += HEADER_SIZE + (*next).size;
                        (*block).next = (*next).next;
                        (*next).magic = 0;
                    }

                    if (*block).size >= size && (best.is_null() || (*block).size < (*best).size) {
                        best = block;
                    }
                }

                block = (*block).next;
            }

            if best.is_null() {
                log::error!("heap: no free block can hold {} bytes", size);
                return Err(FatalError::HeapExhausted);
            }

            if (*best).size - size >= HEADER_SIZE + MIN_REMAINDER {
                let rest = (best as *mut u8).add(HEADER_SIZE + size) as *mut BlockHeader;
                rest.write(BlockHeader {
                    magic: MAGIC,
                    state: STATE_FREE,
                    size: (*best).size - size - HEADER_SIZE,
                    next: (*best).next,
                });
                (*best).size = size;
                (*best).next = rest;
            }

            (*best).state = STATE_BUSY;
            Ok(NonNull::new_unchecked((best as *mut u8).add(HEADER_SIZE)))
        }
    }

    /// Return a block allocated by [`Self::alloc`].
    ///
    /// A pointer that doesn't point to a block payload, or a block whose
    /// header is damaged, results in `HeapCorrupted`. Freeing a free block
    /// results in `DoubleFree`.
    ///
    /// # Safety
    ///
    /// The block's contents must not be used after the call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), FatalError> {
        let addr = ptr.as_ptr() as usize;
        let base = self.base as usize;
        if self.first.is_null()
            || addr < base + HEADER_SIZE
            || addr >= base + self.len
            || (addr - base) % HEAP_ALIGN != 0
        {
            log::error!("heap: {:p} doesn't belong to the heap", ptr);
            return Err(FatalError::HeapCorrupted);
        }

        let block = (addr - HEADER_SIZE) as *mut BlockHeader;
        // Safety: `block` is within the arena and aligned
        unsafe {
            if (*block).magic != MAGIC {
                log::error!("heap: {:p} has a bad block header", ptr);
                return Err(FatalError::HeapCorrupted);
            }
            match (*block).state {
                STATE_BUSY => {
                    (*block).state = STATE_FREE;
                    Ok(())
                }
                STATE_FREE => {
                    log::error!("heap: {:p} freed twice", ptr);
                    Err(FatalError::DoubleFree)
                }
                _ => Err(FatalError::HeapCorrupted),
            }
        }
    }

    /// Walk the block chain, verifying that it covers the arena exactly, and
    /// return the usage statistics.
    pub fn check(&self) -> Result<HeapStats, FatalError> {
        let mut stats = HeapStats::default();
        if self.first.is_null() {
            return Ok(stats);
        }

        let end = self.base as usize + self.len;
        let mut expected = self.base as usize;
        let mut prev_free = false;
        let mut block = self.first;

        // Safety: Each header is validated before it's dereferenced
        unsafe {
            while !block.is_null() {
                if block as usize != expected {
                    return Err(FatalError::HeapCorrupted);
                }
                self.check_header(block)?;

                let size = (*block).size;
                let is_free = (*block).state == STATE_FREE;
                stats.blocks += 1;
                if is_free {
                    stats.free_blocks += 1;
                    stats.free_bytes += size;
                    stats.largest_free = stats.largest_free.max(size);
                    if prev_free {
                        stats.adjacent_free_pairs += 1;
                    }
                } else {
                    stats.used_bytes += size;
                }
                prev_free = is_free;

                expected = block as usize + HEADER_SIZE + size;
                if expected > end {
                    return Err(FatalError::HeapCorrupted);
                }
                block = (*block).next;
            }
        }

        if expected != end {
            return Err(FatalError::HeapCorrupted);
        }

        Ok(stats)
    }

    /// Like [`Self::check`], but treats a corrupted chain as fatal.
    pub fn stats(&self) -> HeapStats {
        match self.check() {
            Ok(stats) => stats,
            Err(e) => fatal(e),
        }
    }

    fn carve(&mut self) -> Result<(), FatalError> {
        if self.len < HEADER_SIZE + MIN_REMAINDER {
            log::error!("heap: the arena of {} bytes is too small", self.len);
            return Err(FatalError::HeapExhausted);
        }

        let first = self.base as *mut BlockHeader;
        // Safety: The arena is valid and aligned
        unsafe {
            first.write(BlockHeader {
                magic: MAGIC,
                state: STATE_FREE,
                size: self.len - HEADER_SIZE,
                next: ptr::null_mut(),
            })
        };
        self.first = first;
        log::debug!("heap: carved {} bytes at {:p}", self.len, self.base);
        Ok(())
    }

    /// Verify that `block` is a well-formed header within the arena.
    ///
    /// # Safety
    ///
    /// `block` must be a pointer found in the chain.
    unsafe fn check_header(&self, block: *mut BlockHeader) -> Result<(), FatalError> {
        let addr = block as usize;
        let base = self.base as usize;
        if addr < base || addr + HEADER_SIZE > base + self.len || addr % HEAP_ALIGN != 0 {
            return Err(FatalError::HeapCorrupted);
        }
        // Safety: `block` is within the arena
        let (magic, state) = unsafe { ((*block).magic, (*block).state) };
        if magic != MAGIC || (state != STATE_FREE && state != STATE_BUSY) {
            log::error!("heap: bad block header at {:p}", block);
            return Err(FatalError::HeapCorrupted);
        }
        Ok(())
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("stats", &self.check())
            .finish()
    }
}

/// Run `f` with the kernel heap while holding the heap mutex.
fn with_kernel_heap<Traits: KernelTraits, R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    let state = Traits::state();
    if state
        .heap_lock
        .lock(HEAP_LOCK, WaitFlags::NONE, WAIT_FOREVER)
        .is_err()
    {
        unreachable!();
    }

    // Safety: We hold the heap mutex
    let heap = unsafe { &mut *state.heap.get() };
    if !heap.is_initialized() {
        // Safety: The heap hunk is only ever accessed through this heap
        unsafe { heap.init(state.heap_hunk.as_ptr()) };
    }

    let ret = f(heap);
    state.heap_lock.unlock(HEAP_LOCK);
    ret
}

/// Implements `System::alloc`.
pub(crate) fn alloc<Traits: KernelTraits>(size: usize) -> NonNull<u8> {
    match with_kernel_heap::<Traits, _>(|heap| heap.alloc(size)) {
        Ok(ptr) => {
            log::trace!("heap: allocated {} bytes at {:p}", size, ptr);
            ptr
        }
        Err(e) => fatal(e),
    }
}

/// Implements `System::free`.
///
/// # Safety
///
/// See `Heap::free`.
pub(crate) unsafe fn free<Traits: KernelTraits>(ptr: NonNull<u8>) {
    // Safety: Upheld by the caller
    if let Err(e) = with_kernel_heap::<Traits, _>(|heap| unsafe { heap.free(ptr) }) {
        fatal(e);
    }
    log::trace!("heap: freed {:p}", ptr);
}

/// Implements `System::heap_stats`.
pub(crate) fn stats<Traits: KernelTraits>() -> HeapStats {
    with_kernel_heap::<Traits, _>(|heap| heap.stats())
}
