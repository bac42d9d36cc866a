//! Error types
use core::fmt;

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) an operation can report.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful.
        Success = 0,
        /// The condition was false and `NOWAIT` was requested.
        WouldBlock = -47,
        /// The condition did not become true within the requested window.
        Timeout = -50,
    }
}

/// Define an error type that is a subset of [`ResultCode`].
macro_rules! define_suberror {
    (
        $( #[doc = $doc:literal] )*
        pub enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc = $doc] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        pub enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }
    };
}

define_suberror! {
    /// Error type for [`System::block_on`](crate::System::block_on).
    pub enum TimeoutError {
        Timeout,
    }
}

define_suberror! {
    /// Error type for [`Mutex::lock`](crate::Mutex::lock).
    pub enum LockMutexError {
        WouldBlock,
        Timeout,
    }
}

define_suberror! {
    /// Error type for [`Event::wait`](crate::Event::wait).
    pub enum WaitEventError {
        WouldBlock,
        Timeout,
    }
}

define_suberror! {
    /// Error type for [`Queue::add`](crate::Queue::add) and
    /// [`Queue::remove`](crate::Queue::remove).
    pub enum QueueError {
        WouldBlock,
        Timeout,
    }
}

define_suberror! {
    /// Error type for [`MultiWait::wait`](crate::MultiWait::wait).
    pub enum MultiWaitError {
        Timeout,
    }
}

impl From<TimeoutError> for LockMutexError {
    #[inline]
    fn from(TimeoutError::Timeout: TimeoutError) -> Self {
        Self::Timeout
    }
}

impl From<LockMutexError> for QueueError {
    #[inline]
    fn from(x: LockMutexError) -> Self {
        match x {
            LockMutexError::WouldBlock => Self::WouldBlock,
            LockMutexError::Timeout => Self::Timeout,
        }
    }
}

/// Unrecoverable configuration or corruption errors. Each variant carries a
/// stable diagnostic code (the discriminant).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// More tasks were created than the task table can hold.
    TaskTableExhausted = 1,
    /// A task stack is smaller than the port's minimum.
    StackTooSmall = 2,
    /// A queue message is larger than the queue's slot.
    MessageTooLarge = 3,
    /// A multi-wait was given more sub-waits than it can hold.
    MultiWaitFull = 4,
    /// No free heap block is large enough.
    HeapExhausted = 5,
    /// A heap block header has a bad magic number, or a pointer doesn't
    /// belong to the heap.
    HeapCorrupted = 6,
    /// A heap block was freed twice.
    DoubleFree = 7,
    /// A blocking operation was invoked from an interrupt handler or the idle
    /// task, or a kernel entry point was reentered with CPU Lock active.
    BadContext = 8,
    /// An object was used before creation or created twice.
    BadObjectState = 9,
    /// A parameter is out of its valid range.
    BadParam = 10,
}

impl FatalError {
    /// The diagnostic code reported when the system halts.
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Self::TaskTableExhausted => "task table exhausted",
            Self::StackTooSmall => "stack too small",
            Self::MessageTooLarge => "message too large",
            Self::MultiWaitFull => "multi-wait capacity exceeded",
            Self::HeapExhausted => "heap exhausted",
            Self::HeapCorrupted => "heap corrupted",
            Self::DoubleFree => "double free",
            Self::BadContext => "bad context",
            Self::BadObjectState => "bad object state",
            Self::BadParam => "bad parameter",
        };
        write!(f, "{} (code {})", msg, self.code())
    }
}

/// Halt the system with a diagnostic code.
///
/// The halt is a panic; what happens next is up to the application's panic
/// handler (`panic-halt`, a debugger breakpoint, a hosted test failure).
#[cold]
#[track_caller]
pub fn fatal(e: FatalError) -> ! {
    log::error!("kernel fatal error: {}", e);
    panic!("kernel fatal error: {}", e)
}
