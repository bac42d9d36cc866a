//! Multi-waits
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    error::{fatal, FatalError, MultiWaitError, TimeoutError},
    event::Event,
    klock::{self, CpuLockCell, CpuLockGuard},
    queue::Queue,
    timeout::Ticks,
    utils::Init,
    wait::{self, LockKind, WaitFlags},
    KernelTraits, PortThreading, Word,
};

/// The maximum number of sub-waits a [`MultiWait`] can hold.
pub const MULTI_WAIT_MAX: usize = 8;

/// How the sub-waits of a [`MultiWait`] are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    /// Ready when every sub-wait is ready.
    And,
    /// Ready when at least one sub-wait is ready.
    Or,
}

/// The condition a queue sub-wait waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCondition {
    /// The queue has a message.
    NotEmpty,
    /// The queue has room for a message.
    NotFull,
}

/// The set of sub-waits that were ready when [`MultiWait::wait`] returned,
/// identified by the order they were added in.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadySet(u32);

impl ReadySet {
    /// Return `true` if the `i`-th sub-wait was ready.
    pub const fn contains(self, i: usize) -> bool {
        i < 32 && self.0 & (1 << i) != 0
    }

    /// Get the set as a bit mask. Bit `i` represents the `i`-th sub-wait.
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate over the indices of the ready sub-waits.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..32).filter(move |&i| self.contains(i))
    }
}

impl fmt::Debug for ReadySet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

pub(crate) enum SubWait<Traits: 'static> {
    Event {
        event: &'static Event<Traits>,
        mask: Word,
        flags: WaitFlags,
    },
    Queue {
        queue: &'static Queue<Traits>,
        cond: QueueCondition,
    },
}

impl<Traits: 'static> Clone for SubWait<Traits> {
    fn clone(&self) -> Self {
        match *self {
            Self::Event { event, mask, flags } => Self::Event { event, mask, flags },
            Self::Queue { queue, cond } => Self::Queue { queue, cond },
        }
    }
}

impl<Traits: 'static> fmt::Debug for SubWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Event { event, mask, flags } => {
                write!(f, "Event({:p}, {:#x}, {:?})", *event, mask, flags)
            }
            Self::Queue { queue, cond } => write!(f, "Queue({:p}, {:?})", *queue, cond),
        }
    }
}

impl<Traits: KernelTraits> SubWait<Traits> {
    /// Evaluate the sub-wait with the predicate of the equivalent standalone
    /// wait.
    fn to_lock_kind(&self) -> LockKind<Traits> {
        match *self {
            Self::Event { event, mask, .. } => LockKind::WaitEvent(event, mask),
            Self::Queue {
                queue,
                cond: QueueCondition::NotEmpty,
            } => LockKind::WaitQueueEmpty(queue),
            Self::Queue {
                queue,
                cond: QueueCondition::NotFull,
            } => LockKind::WaitQueueFull(queue),
        }
    }

    fn is_satisfied(&self, lock: &CpuLockGuard<Traits>) -> bool {
        self.to_lock_kind().is_satisfied(lock)
    }
}

/// A copy of a [`MultiWait`]'s sub-waits, stored in
/// [`LockKind::WaitMulti`] so that the scheduler can evaluate it.
pub struct MultiWaitSnapshot<Traits: 'static> {
    entries: ArrayVec<SubWait<Traits>, MULTI_WAIT_MAX>,
    combinator: Combinator,
}

impl<Traits: 'static> Clone for MultiWaitSnapshot<Traits> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            combinator: self.combinator,
        }
    }
}

impl<Traits: 'static> fmt::Debug for MultiWaitSnapshot<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MultiWaitSnapshot")
            .field("entries", &self.entries)
            .field("combinator", &self.combinator)
            .finish()
    }
}

impl<Traits: KernelTraits> MultiWaitSnapshot<Traits> {
    /// Evaluate every sub-wait and return the ready ones.
    fn ready_set(&self, lock: &CpuLockGuard<Traits>) -> ReadySet {
        let bits = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_satisfied(lock))
            .fold(0, |bits, (i, _)| bits | (1 << i));
        ReadySet(bits)
    }

    fn is_satisfied_by(&self, ready: ReadySet) -> bool {
        match self.combinator {
            Combinator::And => ready.bits().count_ones() as usize == self.entries.len(),
            Combinator::Or => !ready.is_empty(),
        }
    }

    /// The readiness predicate of [`LockKind::WaitMulti`].
    pub(crate) fn is_satisfied(&self, lock: &CpuLockGuard<Traits>) -> bool {
        self.is_satisfied_by(self.ready_set(lock))
    }
}

struct MultiWaitInner<Traits: 'static> {
    capacity: usize,
    entries: ArrayVec<SubWait<Traits>, MULTI_WAIT_MAX>,
}

impl<Traits: 'static> Init for MultiWaitInner<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        capacity: 0,
        entries: ArrayVec::new_const(),
    };
}

impl<Traits: 'static> fmt::Debug for MultiWaitInner<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MultiWaitInner")
            .field("capacity", &self.capacity)
            .field("entries", &self.entries)
            .finish()
    }
}

/// Waits for an AND or OR combination of event and queue conditions.
///
/// Each sub-wait is evaluated exactly like the standalone wait it
/// corresponds to ([`Event::wait`], [`Queue::remove`], [`Queue::add`]). A
/// multi-wait belongs to a single task; using one from several tasks at once
/// gives unspecified results.
///
/// ```ignore
/// static RX: Queue<SystemTraits> = Queue::new();
/// static STOP: Event<SystemTraits> = Event::new();
/// static MW: MultiWait<SystemTraits> = MultiWait::new();
///
/// MW.create(2);
/// MW.add_queue(&RX, QueueCondition::NotEmpty);
/// MW.add_event(&STOP, 1, WaitFlags::CLEAR);
/// let ready = MW.wait(Combinator::Or, WAIT_FOREVER).unwrap();
/// if ready.contains(1) { /* stop requested */ }
/// ```
pub struct MultiWait<Traits: 'static> {
    inner: CpuLockCell<Traits, MultiWaitInner<Traits>>,
}

impl<Traits: 'static> MultiWait<Traits> {
    /// Construct a `MultiWait`. It must be [created](Self::create) before use.
    pub const fn new() -> Self {
        Self {
            inner: CpuLockCell::new(MultiWaitInner::INIT),
        }
    }
}

impl<Traits: 'static> Init for MultiWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: 'static> Default for MultiWait<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> fmt::Debug for MultiWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MultiWait")
            .field("self", &(self as *const _))
            .field("inner", &self.inner)
            .finish()
    }
}

impl<Traits: KernelTraits> MultiWait<Traits> {
    /// Reset the multi-wait to hold up to `n` sub-waits. `n` greater than
    /// [`MULTI_WAIT_MAX`] is a fatal error.
    pub fn create(&self, n: usize) {
        if n > MULTI_WAIT_MAX {
            log::error!(
                "multi-wait {:p}: {} sub-waits requested, the maximum is {}",
                self,
                n,
                MULTI_WAIT_MAX
            );
            fatal(FatalError::MultiWaitFull);
        }
        let mut lock = klock::lock_cpu::<Traits>();
        let inner = self.inner.write(&mut lock);
        inner.capacity = n;
        inner.entries.clear();
    }

    /// Add a sub-wait that is ready when any of the bits in `mask` of
    /// `event` is set. If `flags` contains [`WaitFlags::CLEAR`], the matched
    /// bits are cleared when [`Self::wait`] succeeds.
    pub fn add_event(&self, event: &'static Event<Traits>, mask: Word, flags: WaitFlags) {
        self.push(SubWait::Event { event, mask, flags });
    }

    /// Add a sub-wait that is ready when `queue` satisfies `cond`.
    pub fn add_queue(&self, queue: &'static Queue<Traits>, cond: QueueCondition) {
        self.push(SubWait::Queue { queue, cond });
    }

    fn push(&self, entry: SubWait<Traits>) {
        let mut lock = klock::lock_cpu::<Traits>();
        let inner = self.inner.write(&mut lock);
        if inner.entries.len() >= inner.capacity {
            let capacity = inner.capacity;
            drop(lock);
            log::error!(
                "multi-wait {:p}: adding {:?} exceeds the capacity of {}",
                self,
                entry,
                capacity
            );
            fatal(FatalError::MultiWaitFull);
        }
        inner.entries.push(entry);
    }

    /// Wait until the sub-waits are ready as a whole according to
    /// `combinator`, and return the ready ones. The matched bits of event
    /// sub-waits with [`WaitFlags::CLEAR`] are then cleared.
    ///
    /// Returns `Timeout` if the combination didn't become ready within
    /// `timeout` ticks. Waiting on a multi-wait without sub-waits is a fatal
    /// error.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn wait(
        &self,
        combinator: Combinator,
        mut timeout: Ticks,
    ) -> Result<ReadySet, MultiWaitError> {
        let mut lock = klock::lock_cpu::<Traits>();

        let snapshot = MultiWaitSnapshot {
            entries: self.inner.read(&lock).entries.clone(),
            combinator,
        };
        if snapshot.entries.is_empty() {
            drop(lock);
            log::error!("multi-wait {:p}: waiting without sub-waits", self);
            fatal(FatalError::BadObjectState);
        }

        loop {
            let ready = snapshot.ready_set(&lock);
            if snapshot.is_satisfied_by(ready) {
                consume(&mut lock, &snapshot, ready);
                return Ok(ready);
            }

            let kind = LockKind::WaitMulti(snapshot.clone());
            match wait::block_on_locked(&mut lock, kind, timeout) {
                Ok(remaining) => timeout = remaining,
                Err(TimeoutError::Timeout) => {
                    let ready = snapshot.ready_set(&lock);
                    if snapshot.is_satisfied_by(ready) {
                        consume(&mut lock, &snapshot, ready);
                        return Ok(ready);
                    }
                    return Err(MultiWaitError::Timeout);
                }
            }
        }
    }
}

/// Clear the matched bits of the ready event sub-waits that asked for it.
fn consume<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    snapshot: &MultiWaitSnapshot<Traits>,
    ready: ReadySet,
) {
    for (i, entry) in snapshot.entries.iter().enumerate() {
        if let SubWait::Event { event, mask, flags } = *entry {
            if ready.contains(i) && flags.contains(WaitFlags::CLEAR) {
                event.poll_locked(lock, mask, flags);
            }
        }
    }
}
