//! The simulated processor's state
use std::{any::Any, thread::JoinHandle};

/// The number of interrupt lines. The valid range of interrupt numbers is
/// defined as `0..NUM_INTERRUPT_LINES`. Lower-numbered lines are taken first.
pub const NUM_INTERRUPT_LINES: usize = 32;

/// An interrupt line number.
pub type InterruptNum = usize;

/// An interrupt handler.
pub type InterruptHandler = fn();

/// The error type returned for an out-of-range interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadIntLineError;

/// Identifies the thread that is allowed to run simulated instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    None,
    /// The thread running the boot phase.
    Boot,
    /// The thread backing the task whose `TaskCb` is at this address.
    Task(usize),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Line {
    pub(crate) pended: bool,
    pub(crate) handler: Option<InterruptHandler>,
}

impl Line {
    const INIT: Self = Self {
        pended: false,
        handler: None,
    };
}

pub(crate) struct SchedState {
    pub(crate) booted: bool,
    /// Set by `dispatch_first_task`. Interrupts and dispatch requests are
    /// held pending until then.
    pub(crate) started: bool,
    pub(crate) cpu_lock: bool,
    pub(crate) owner: Owner,
    /// The dispatch exception is pended.
    pub(crate) dispatch_pended: bool,
    /// An interrupt handler is running.
    pub(crate) in_interrupt: bool,
    /// The idle task is sleeping in `wait_for_interrupt`.
    pub(crate) idle_waiting: bool,
    pub(crate) shutdown: bool,
    pub(crate) tick_count: u64,
    pub(crate) lines: [Line; NUM_INTERRUPT_LINES],
    /// Port-managed threads, joined on shutdown.
    pub(crate) threads: Vec<JoinHandle<()>>,
    /// The first panic that occurred in a port-managed thread.
    pub(crate) panic: Option<Box<dyn Any + Send>>,
}

impl SchedState {
    pub(crate) const fn new() -> Self {
        Self {
            booted: false,
            started: false,
            cpu_lock: false,
            owner: Owner::None,
            dispatch_pended: false,
            in_interrupt: false,
            idle_waiting: false,
            shutdown: false,
            tick_count: 0,
            lines: [Line::INIT; NUM_INTERRUPT_LINES],
            threads: Vec::new(),
            panic: None,
        }
    }

    pub(crate) fn update_line(
        &mut self,
        num: InterruptNum,
        f: impl FnOnce(&mut Line),
    ) -> Result<(), BadIntLineError> {
        f(self.lines.get_mut(num).ok_or(BadIntLineError)?);
        Ok(())
    }

    /// Find the lowest-numbered pended line that has a handler, clear its
    /// pending flag, and return the handler. A line without a handler stays
    /// pended until one is registered.
    pub(crate) fn take_pended_line(&mut self) -> Option<InterruptHandler> {
        let line = self
            .lines
            .iter_mut()
            .find(|line| line.pended && line.handler.is_some())?;
        line.pended = false;
        line.handler
    }

    /// Return `true` if there's an interrupt or a dispatch request to take.
    pub(crate) fn has_pending_work(&self) -> bool {
        self.dispatch_pended
            || self
                .lines
                .iter()
                .any(|line| line.pended && line.handler.is_some())
    }

    /// Return `true` if the idle task is sleeping and nothing can wake it up
    /// except for an external event.
    pub(crate) fn is_quiescent(&self) -> bool {
        self.idle_waiting && !self.has_pending_work()
    }
}
