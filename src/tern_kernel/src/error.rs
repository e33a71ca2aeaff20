//! Error codes returned by the system-call surface.
//!
//! Every fallible operation returns a dedicated error enum covering exactly
//! the failures that operation can produce. All of them project losslessly
//! into [`ResultCode`], the flat taxonomy shared with non-Rust callers.
use core::fmt;

/// The flat result-code taxonomy.
///
/// Errors are returned synchronously; the kernel never aborts a thread on a
/// programming error.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// The operation completed successfully.
    Success = 0,
    /// A parameter is invalid for the requested operation.
    WrongParam = -1,
    /// The identity tag does not match: the object was deleted or its
    /// storage was never initialized.
    NoExist = -2,
    /// The operation is not legal in the calling context (e.g. a blocking
    /// call from an interrupt handler), or the target object is not in the
    /// required state.
    IllegalContext = -3,
    /// The wait was not satisfied within the requested time.
    Timeout = -4,
    /// The object was deleted while the caller was waiting on it.
    Deleted = -5,
    /// A counter or container is already at its maximum (semaphore at max,
    /// non-recursive mutex reacquired, pool full).
    Overflow = -6,
    /// A counter or container is empty on a non-blocking read.
    Underflow = -7,
    /// The caller is not permitted to perform the operation on this object
    /// (e.g. unlocking a mutex it does not own).
    IllegalUse = -8,
    /// The object is unavailable for the requested state transition.
    Resource = -9,
}

macro_rules! define_error {
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
            $( $Variant = ResultCode::$Variant as i8, )*
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant, )*
                }
            }
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }
    };
}

define_error! {
    /// Failures of object creation.
    pub enum CreateError {
        WrongParam,
        IllegalContext,
    }
}

define_error! {
    /// Failures of object deletion.
    pub enum DeleteError {
        NoExist,
        IllegalContext,
    }
}

define_error! {
    /// Failures of kernel lifecycle and scheduler-lock operations.
    pub enum StateError {
        Resource,
        IllegalContext,
        WrongParam,
    }
}

define_error! {
    /// Failures of a blocking acquire (semaphore, memory pool).
    pub enum AcquireError {
        Timeout,
        Deleted,
        NoExist,
        IllegalContext,
    }
}

define_error! {
    /// Failures of a release (semaphore, memory pool).
    pub enum ReleaseError {
        Overflow,
        NoExist,
        IllegalContext,
        WrongParam,
    }
}

define_error! {
    /// Failures of `MutexCb::lock`.
    pub enum LockError {
        Timeout,
        Deleted,
        Overflow,
        NoExist,
        IllegalContext,
    }
}

define_error! {
    /// Failures of `MutexCb::unlock`.
    pub enum UnlockError {
        IllegalUse,
        NoExist,
        IllegalContext,
    }
}

define_error! {
    /// Failures of `EventFlagsCb::wait`.
    pub enum FlagsWaitError {
        Timeout,
        Deleted,
        NoExist,
        IllegalContext,
        WrongParam,
    }
}

define_error! {
    /// Failures of `EventFlagsCb::set` / `clear` / `get`.
    pub enum FlagsUpdateError {
        NoExist,
        IllegalContext,
        WrongParam,
    }
}

define_error! {
    /// Failures of `MsgBufCb::send` / `send_front`.
    pub enum SendError {
        Timeout,
        Deleted,
        NoExist,
        IllegalContext,
        WrongParam,
    }
}

define_error! {
    /// Failures of `MsgBufCb::receive`.
    pub enum ReceiveError {
        Timeout,
        Deleted,
        Underflow,
        NoExist,
        IllegalContext,
        WrongParam,
    }
}

define_error! {
    /// Failures of `thread::sleep`.
    pub enum SleepError {
        IllegalContext,
        WrongParam,
    }
}

define_error! {
    /// Failures of thread state-transition operations (start, suspend,
    /// resume, terminate, wakeup, release_wait).
    pub enum ThreadOpError {
        Overflow,
        Resource,
        NoExist,
        IllegalContext,
    }
}

define_error! {
    /// Failures of `thread::set_priority`.
    pub enum SetPriorityError {
        WrongParam,
        NoExist,
        IllegalContext,
    }
}

define_error! {
    /// Failures of thread attribute queries.
    pub enum QueryError {
        NoExist,
        IllegalContext,
    }
}

define_error! {
    /// Failures of alarm / cyclic timer operations.
    pub enum TimerOpError {
        WrongParam,
        NoExist,
        IllegalContext,
    }
}

/// The two abnormal outcomes a blocked thread can observe, stored in the
/// waiter's result slot by whichever release path wins the race.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum WaitError {
    Timeout,
    Deleted,
}

impl From<WaitError> for AcquireError {
    #[inline]
    fn from(x: WaitError) -> Self {
        match x {
            WaitError::Timeout => Self::Timeout,
            WaitError::Deleted => Self::Deleted,
        }
    }
}

impl From<WaitError> for LockError {
    #[inline]
    fn from(x: WaitError) -> Self {
        match x {
            WaitError::Timeout => Self::Timeout,
            WaitError::Deleted => Self::Deleted,
        }
    }
}

impl From<WaitError> for FlagsWaitError {
    #[inline]
    fn from(x: WaitError) -> Self {
        match x {
            WaitError::Timeout => Self::Timeout,
            WaitError::Deleted => Self::Deleted,
        }
    }
}

impl From<WaitError> for SendError {
    #[inline]
    fn from(x: WaitError) -> Self {
        match x {
            WaitError::Timeout => Self::Timeout,
            WaitError::Deleted => Self::Deleted,
        }
    }
}

impl From<WaitError> for ReceiveError {
    #[inline]
    fn from(x: WaitError) -> Self {
        match x {
            WaitError::Timeout => Self::Timeout,
            WaitError::Deleted => Self::Deleted,
        }
    }
}

/// `IllegalContext` as a standalone error, used by the CPU Lock layer.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) struct BadContextError;

macro_rules! impl_from_bad_context {
    ( $( $Name:ident ),* $(,)? ) => {
        $(
            impl From<BadContextError> for $Name {
                #[inline]
                fn from(_: BadContextError) -> Self {
                    Self::IllegalContext
                }
            }
        )*
    };
}

impl_from_bad_context!(
    CreateError,
    DeleteError,
    StateError,
    AcquireError,
    ReleaseError,
    LockError,
    UnlockError,
    FlagsWaitError,
    FlagsUpdateError,
    SendError,
    ReceiveError,
    SleepError,
    ThreadOpError,
    SetPriorityError,
    QueryError,
    TimerOpError,
);
