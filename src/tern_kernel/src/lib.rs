//! A preemptive real-time kernel for single-core microcontrollers.
//!
//! The kernel provides fixed-priority preemptive scheduling of lightweight
//! threads, the classical inter-thread coordination primitives (counting
//! semaphores, event flags, mutexes with priority inheritance, fixed-size
//! memory pools, circular message buffers), and a software-timer service
//! driven by a periodic tick.
//!
//! # Storage model
//!
//! The kernel allocates nothing. Every kernel object lives in storage the
//! caller supplies, usually a `static` control block built with the
//! object's `const fn new()`. `create` initializes the storage and stamps
//! an identity tag that every later call checks; `delete` invalidates the
//! tag and wakes every thread blocked on the object with a *deleted*
//! result.
//!
//! # Contexts
//!
//! Exactly one thread runs at any time; interrupt handlers preempt
//! threads. The kernel body executes inside the CPU Lock critical section
//! (interrupts masked at or below the configured maximum system-call
//! priority), so it is single-threaded by construction. Only a documented
//! subset of calls is legal from interrupt context; the others return an
//! `IllegalContext` error.
//!
//! # Priorities
//!
//! 32 priority levels, numerically lower value = greater urgency.
//! Priority 0 is reserved for the timer thread and 31 for the idle thread;
//! application threads use 1..=30. Within one priority, the order is FIFO.
#![cfg_attr(not(test), no_std)]

pub mod error;
mod klock;

pub mod flags;
pub mod kernel;
pub mod mempool;
pub mod msgbuf;
pub mod mutex;
pub mod semaphore;
pub mod thread;
pub mod timer;
pub mod utils;
pub(crate) mod wait;

#[cfg(test)]
pub(crate) mod test_port;

pub use self::flags::EventFlagsCb;
pub use self::kernel::KernelState;
pub use self::mempool::MemoryPoolCb;
pub use self::msgbuf::MsgBufCb;
pub use self::mutex::MutexCb;
pub use self::semaphore::SemaphoreCb;
pub use self::thread::{Stack, ThreadCb};
pub use self::timer::{tick_handler, AlarmCb, CyclicCb};
pub use self::utils::Init;

/// Unsigned integer type representing a point of time or a time span in
/// tick periods. Wraps around on overflow.
pub type Ticks = u32;

/// Thread priority. Numerically lower value = greater urgency.
pub type Priority = u8;

/// The number of priority levels.
pub const PRIORITY_LEVELS: usize = 32;

/// The priority reserved for the timer thread.
pub const TIMER_PRIORITY: Priority = 0;

/// The priority reserved for the idle thread.
pub const IDLE_PRIORITY: Priority = 31;

/// The range of priorities usable by application threads.
pub const USER_PRIORITY_RANGE: core::ops::RangeInclusive<Priority> = 1..=30;

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never block; return `Timeout` immediately when the object is not
    /// ready.
    Poll,
    /// Wait for at most the specified number of ticks.
    Ticks(Ticks),
    /// Wait indefinitely.
    Forever,
}

impl Timeout {
    /// `true` if the operation must not block.
    #[inline]
    pub fn is_poll(&self) -> bool {
        matches!(self, Self::Poll | Self::Ticks(0))
    }
}

/// Static kernel configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Frequency of the tick interrupt, in hertz. Informational; the port
    /// programs the hardware timer.
    pub tick_freq_hz: u32,
    /// The value every stack word is filled with at thread creation, for
    /// the stack-space watermark.
    pub stack_fill: u32,
    /// Hook invoked repeatedly by the idle thread.
    pub idle_hook: Option<fn()>,
    /// Whether threads start in the privileged execution mode. Consumed by
    /// the port when building initial stack frames.
    pub privileged_threads: bool,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            tick_freq_hz: 1_000,
            stack_fill: 0xffff_ffff,
            idle_hook: None,
            privileged_threads: true,
        }
    }
}

/// Compile-time kernel parameters. Implemented by the "system" type
/// together with the port traits.
///
/// # Safety
///
/// The constants are relied upon by unsafe code in the kernel and ports.
pub unsafe trait KernelCfg1: Sized + Send + Sync + 'static {
    const CONFIG: Config;
}

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation. These methods are only meant to be called by the
/// kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: KernelCfg1 {
    /// Port-private per-thread state (saved stack pointer and whatever
    /// else the dispatcher needs). Placed at the beginning of every
    /// [`ThreadCb`] so that assembly code can refer to it easily.
    type PortThreadState: Send + Sync + Init + 'static;

    /// The minimum stack size the port can build an initial frame in,
    /// in words.
    const STACK_MIN_WORDS: usize = 32;

    /// Disable all kernel-managed interrupts (this state is called
    /// *CPU Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is an
    /// interrupt context.
    fn is_interrupt_context() -> bool;

    /// Pend a context switch. The switch must not take place immediately;
    /// the port performs it on return from the current interrupt or via a
    /// pendable service call, at which point it calls
    /// [`kernel::exchange_running_thread`] and swaps stack pointers.
    ///
    /// Precondition: CPU Lock active
    unsafe fn request_context_switch();

    /// Prepare the thread for activation: build an initial stack frame
    /// inside `stack` so that the thread will start executing `entry`
    /// with `arg` next time it receives the control, and record the
    /// resulting stack pointer in
    /// [`ThreadCb::port_state`](thread::ThreadCb::port_state).
    ///
    /// Precondition: CPU Lock active, the thread is not running
    unsafe fn initialize_stack(
        thread: &'static thread::ThreadCb<Self>,
        stack: thread::Stack,
        entry: fn(usize),
        arg: usize,
    );

    /// Transfer the control to the thread designated by the `(current,
    /// next)` pair, discarding the current (startup) context.
    ///
    /// Precondition: CPU Lock active, called from [`kernel::start`]
    unsafe fn dispatch_first_thread() -> !;

    /// Destroy the state of the previously running thread (which has
    /// already been unscheduled) and proceed to the dispatcher.
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch(thread: &'static thread::ThreadCb<Self>) -> !;
}

/// Associates the "system" type with the kernel-private storage the
/// integrator provides.
///
/// # Safety
///
/// `state` must return the same object every time, and the stacks must be
/// valid, mutually disjoint regions unused by anything else.
pub unsafe trait KernelCfg2: PortThreading {
    /// Access the kernel's global state.
    fn state() -> &'static KernelState<Self>;

    /// The stack for the timer thread.
    fn timer_stack() -> Stack;

    /// The stack for the idle thread.
    fn idle_stack() -> Stack;
}

/// Represents the complete group of traits a system type implements.
pub trait KernelTraits: KernelCfg2 {}

impl<T: KernelCfg2> KernelTraits for T {}
