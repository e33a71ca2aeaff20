//! Kernel singleton state and lifecycle.
use core::convert::Infallible;
use core::fmt;

use crate::{
    error::{BadContextError, StateError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    semaphore::SemaphoreCb,
    thread::{self, ThreadCb, ThreadRef},
    timer,
    utils::{
        intrusive_list::{Ident, StaticListHead},
        Init,
    },
    KernelTraits, PortThreading, Priority, Ticks, IDLE_PRIORITY, PRIORITY_LEVELS, TIMER_PRIORITY,
    USER_PRIORITY_RANGE,
};

/// Kernel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// `initialize` has not been called yet.
    Inactive,
    /// Initialized, not started.
    Ready,
    /// Started; the scheduler is active.
    Running,
    /// Started, with the scheduler locked: dispatch requests are held
    /// until `unlock`.
    Locked,
}

impl Init for State {
    const INIT: Self = Self::Inactive;
}

/// The scheduler-lock state observed and restored by `lock` / `unlock` /
/// `restore_lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
}

/// The `(current, next)` running pair.
///
/// `current` is the thread whose context is on the CPU; `next` is the
/// thread elected to run. They differ exactly while a context switch is
/// pending.
pub(crate) struct Run<Traits: PortThreading> {
    pub(crate) current: Option<ThreadRef<Traits>>,
    pub(crate) next: Option<ThreadRef<Traits>>,
}

impl<Traits: PortThreading> Clone for Run<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for Run<Traits> {}

impl<Traits: PortThreading> Init for Run<Traits> {
    const INIT: Self = Self {
        current: None,
        next: None,
    };
}

/// Version information returned by [`info`].
#[derive(Debug, Clone, Copy)]
pub struct KernelInfo {
    pub api_version: u32,
    pub kernel_version: u32,
    pub id: &'static str,
}

const KERNEL_ID: &str = "tern";
const API_VERSION: u32 = 1_00_00;
const KERNEL_VERSION: u32 = 0_01_00;

/// Global kernel state. The integrator places one instance in a `static`
/// and hands it to the kernel through
/// [`KernelCfg2::state`](crate::KernelCfg2::state).
pub struct KernelState<Traits: PortThreading> {
    pub(crate) state: CpuLockCell<Traits, State>,

    /// The monotonic tick counter, advanced by [`timer::tick_handler`].
    pub(crate) tick: CpuLockCell<Traits, Ticks>,

    pub(crate) run: CpuLockCell<Traits, Run<Traits>>,

    pub(crate) ready: thread::readyqueue::ReadyQueue<Traits>,

    /// The single time-ordered queue of timer events.
    pub(crate) timer_queue: CpuLockCell<Traits, StaticListHead<timer::TimerEvent<Traits>>>,

    /// Released by the tick handler when the head of the timer queue is
    /// due; the timer thread blocks on it.
    pub(crate) timer_semaphore: SemaphoreCb<Traits>,

    pub(crate) timer_thread: ThreadCb<Traits>,
    pub(crate) idle_thread: ThreadCb<Traits>,

    /// Round-robin time slice per priority level, in ticks. Zero disables
    /// round-robin for that level.
    pub(crate) rr_slice: CpuLockCell<Traits, [u16; PRIORITY_LEVELS]>,
}

impl<Traits: PortThreading> Init for KernelState<Traits> {
    const INIT: Self = Self {
        state: Init::INIT,
        tick: Init::INIT,
        run: Init::INIT,
        ready: Init::INIT,
        timer_queue: Init::INIT,
        timer_semaphore: Init::INIT,
        timer_thread: Init::INIT,
        idle_thread: Init::INIT,
        rr_slice: Init::INIT,
    };
}

impl<Traits: PortThreading> KernelState<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> fmt::Debug for KernelState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelState")
            .field("state", &self.state)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

/// If the current context is an interrupt context, return `BadContext`.
pub(crate) fn expect_thread_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if Traits::is_interrupt_context() {
        Err(BadContextError)
    } else {
        Ok(())
    }
}

/// If the current context cannot perform a blocking wait (an interrupt
/// context, the scheduler not running or locked, or no thread scheduled
/// yet), return `BadContext`.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<(), BadContextError> {
    if Traits::is_interrupt_context() {
        return Err(BadContextError);
    }
    let st = Traits::state();
    if st.state.get(&*lock) != State::Running {
        return Err(BadContextError);
    }
    if st.run.get(&*lock).current.is_none() {
        return Err(BadContextError);
    }
    Ok(())
}

/// Initialize the kernel. Transitions `Inactive → Ready`. Calling it again
/// in the `Ready` state is a no-op.
pub fn initialize<Traits: KernelTraits>() -> Result<(), StateError> {
    expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    let st = Traits::state();

    match st.state.get(&*lock) {
        State::Ready => return Ok(()),
        State::Inactive => {}
        _ => return Err(StateError::Resource),
    }

    st.tick.replace(&mut *lock, 0);
    st.run.replace(&mut *lock, Init::INIT);
    st.state.replace(&mut *lock, State::Ready);

    Ok(())
}

/// Start the kernel: create the timer thread (priority 0) and the idle
/// thread (priority 31), elect the first thread to run, and transfer
/// control to it. Does not return on success.
pub fn start<Traits: KernelTraits>() -> Result<Infallible, StateError> {
    expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    start_core(lock.borrow_mut())?;

    // CPU Lock stays active; the port drops it when entering the first
    // thread.
    core::mem::forget(lock);
    unsafe { Traits::dispatch_first_thread() }
}

pub(crate) fn start_core<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<(), StateError> {
    let st = Traits::state();

    if st.state.get(&*lock) != State::Ready {
        return Err(StateError::Resource);
    }

    // Thread startup (idle and timer thread). Their storage is embedded in
    // the kernel state; the stacks come from the integrator.
    thread::create_system_thread(
        lock.borrow_mut(),
        &st.timer_thread,
        "timer",
        timer::timer_thread_body::<Traits>,
        TIMER_PRIORITY,
        Traits::timer_stack(),
    )
    .map_err(|_| StateError::Resource)?;
    thread::create_system_thread(
        lock.borrow_mut(),
        &st.idle_thread,
        "idle",
        idle_thread_body::<Traits>,
        IDLE_PRIORITY,
        Traits::idle_stack(),
    )
    .map_err(|_| StateError::Resource)?;

    st.timer_semaphore.initialize(lock.borrow_mut(), 0, 1);

    // Switch to the ready thread with the highest priority.
    let first = st.ready.highest(lock.borrow_mut()).unwrap();
    first
        .0
        .state
        .replace(&mut *lock, thread::ThreadState::RUNNING);
    st.run.replace(
        &mut *lock,
        Run {
            current: Some(first),
            next: Some(first),
        },
    );

    st.state.replace(&mut *lock, State::Running);
    Ok(())
}

fn idle_thread_body<Traits: KernelTraits>(_: usize) {
    loop {
        if let Some(hook) = Traits::CONFIG.idle_hook {
            hook();
        }
    }
}

/// Get the kernel lifecycle state.
pub fn state<Traits: KernelTraits>() -> Result<State, StateError> {
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().state.get(&*lock))
}

/// Get kernel identification and version information.
pub fn info<Traits: KernelTraits>() -> KernelInfo {
    KernelInfo {
        api_version: API_VERSION,
        kernel_version: KERNEL_VERSION,
        id: KERNEL_ID,
    }
}

/// Lock the scheduler, deferring all dispatches. Returns the previous
/// lock state.
pub fn lock<Traits: KernelTraits>() -> Result<LockState, StateError> {
    expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    let st = Traits::state();

    match st.state.get(&*lock) {
        State::Running => {
            st.state.replace(&mut *lock, State::Locked);
            Ok(LockState::Unlocked)
        }
        State::Locked => Ok(LockState::Locked),
        _ => Err(StateError::Resource),
    }
}

/// Unlock the scheduler and perform the deferred dispatch. Returns the
/// previous lock state.
pub fn unlock<Traits: KernelTraits>() -> Result<LockState, StateError> {
    expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    let st = Traits::state();

    match st.state.get(&*lock) {
        State::Running => Ok(LockState::Unlocked),
        State::Locked => {
            st.state.replace(&mut *lock, State::Running);
            thread::reschedule(lock.borrow_mut());
            Ok(LockState::Locked)
        }
        _ => Err(StateError::Resource),
    }
}

/// Re-apply a lock state previously returned by [`lock`] or [`unlock`].
/// Returns the new lock state.
pub fn restore_lock<Traits: KernelTraits>(prev: LockState) -> Result<LockState, StateError> {
    expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    let st = Traits::state();

    match st.state.get(&*lock) {
        State::Running | State::Locked => match prev {
            LockState::Unlocked => {
                let was_locked = st.state.get(&*lock) == State::Locked;
                st.state.replace(&mut *lock, State::Running);
                if was_locked {
                    thread::reschedule(lock.borrow_mut());
                }
                Ok(LockState::Unlocked)
            }
            LockState::Locked => {
                st.state.replace(&mut *lock, State::Locked);
                Ok(LockState::Locked)
            }
        },
        _ => Err(StateError::Resource),
    }
}

/// Get the current tick count.
pub fn tick_count<Traits: KernelTraits>() -> Result<Ticks, StateError> {
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().tick.get(&*lock))
}

/// Get the configured tick frequency, in hertz.
pub fn tick_freq<Traits: KernelTraits>() -> u32 {
    Traits::CONFIG.tick_freq_hz
}

/// Enable round-robin scheduling for one priority level with the given
/// time slice (in ticks), or disable it with a slice of zero.
pub fn set_round_robin<Traits: KernelTraits>(
    priority: Priority,
    slice_ticks: u16,
) -> Result<(), StateError> {
    if !USER_PRIORITY_RANGE.contains(&priority) {
        return Err(StateError::WrongParam);
    }
    let mut lock = klock::lock_cpu::<Traits>()?;
    Traits::state().rr_slice.write(&mut *lock)[priority as usize] = slice_ticks;
    Ok(())
}

/// Get the currently running thread, `None` before the kernel starts.
pub fn current_thread<Traits: KernelTraits>() -> Result<Option<&'static ThreadCb<Traits>>, StateError>
{
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().run.get(&*lock).current.map(|Ident(t)| t))
}

/// Commit a pending context switch: make `next` the new `current`.
///
/// Returns `(previous, next)` so the caller can save the outgoing
/// context into `previous` and restore the incoming one from `next`.
///
/// # Safety
///
/// Only meant to be called by the port's context-switch handler, with
/// CPU Lock active.
pub unsafe fn exchange_running_thread<Traits: KernelTraits>(
) -> (Option<&'static ThreadCb<Traits>>, &'static ThreadCb<Traits>) {
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let st = Traits::state();

    let mut run = st.run.get(&*lock);
    let prev = run.current;
    let next = run.next.unwrap();
    run.current = Some(next);
    st.run.replace(&mut *lock, run);

    core::mem::forget(lock);
    (prev.map(|Ident(t)| t), next.0)
}
