//! Threads and the scheduler core.
use core::convert::Infallible;
use core::fmt;

use crate::{
    error::{CreateError, DeleteError, QueryError, SetPriorityError, SleepError, StateError,
            ThreadOpError},
    kernel,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    mutex::{self, MutexCb},
    timer,
    utils::{
        intrusive_list::{Ident, StaticLink, StaticListHead},
        Init, ObjectId,
    },
    wait, KernelTraits, PortThreading, Priority, Ticks, Timeout, USER_PRIORITY_RANGE,
};

pub(crate) mod readyqueue;

/// A reference to a thread control block, compared by identity.
pub(crate) type ThreadRef<Traits> = Ident<&'static ThreadCb<Traits>>;

bitflags::bitflags! {
    /// Thread state set.
    ///
    /// A thread with no bit set is *inactive*: created but never started.
    /// `BLOCKED | SUSPENDED` is a legal composite; releasing the wait of
    /// such a thread clears only the `BLOCKED` bit.
    pub struct ThreadState: u8 {
        /// Linked into a ready queue, eligible to run.
        const READY = 1 << 0;
        /// Elected by the dispatcher. Also linked into its ready queue.
        const RUNNING = 1 << 1;
        /// Waiting on a wait queue and/or a deadline.
        const BLOCKED = 1 << 2;
        /// Suspended by `thread::suspend`.
        const SUSPENDED = 1 << 3;
        /// Exited or terminated; can be started again or deleted.
        const TERMINATED = 1 << 4;
    }
}

impl Init for ThreadState {
    const INIT: Self = Self::empty();
}

bitflags::bitflags! {
    /// Options for `thread::create`.
    pub struct ThreadOptions: u8 {
        /// Make the thread ready immediately instead of leaving it
        /// inactive until `thread::start`.
        const START_ON_CREATE = 1 << 0;
    }
}

/// A stack region supplied by the caller, in 32-bit words.
#[derive(Debug, Clone, Copy)]
pub struct Stack {
    base: *mut u32,
    words: usize,
}

// Safety: the kernel only touches the region inside the critical section,
// and the creator promised exclusive ownership.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Init for Stack {
    const INIT: Self = Self {
        base: core::ptr::null_mut(),
        words: 0,
    };
}

impl Stack {
    /// Construct a `Stack` from a base address (lowest address of the
    /// region) and a length in words.
    ///
    /// # Safety
    ///
    /// The region must be valid, writable, suitably aligned, and used by
    /// nothing else for as long as any thread runs on it.
    pub const unsafe fn from_raw_parts(base: *mut u32, words: usize) -> Self {
        Self { base, words }
    }

    pub const fn size_words(&self) -> usize {
        self.words
    }

    pub const fn size_bytes(&self) -> usize {
        self.words * core::mem::size_of::<u32>()
    }

    /// The lowest address of the region.
    pub const fn as_mut_ptr(&self) -> *mut u32 {
        self.base
    }

    pub(crate) const fn is_unset(&self) -> bool {
        self.base.is_null() || self.words == 0
    }

    /// Fill the whole region with the watermark value.
    pub(crate) fn fill(&self, value: u32) {
        let mut p = self.base;
        for _ in 0..self.words {
            // Safety: the region is valid per `from_raw_parts`
            unsafe {
                p.write(value);
                p = p.add(1);
            }
        }
    }

    /// Count the unused (still watermarked) bytes, scanning upward from
    /// the bottom of the region.
    pub(crate) fn unused_bytes(&self, fill: u32) -> usize {
        let mut n = 0;
        let mut p = self.base;
        while n < self.words {
            // Safety: the region is valid per `from_raw_parts`
            if unsafe { p.read() } != fill {
                break;
            }
            n += 1;
            p = unsafe { p.add(1) };
        }
        n * core::mem::size_of::<u32>()
    }
}

/// Entry function and argument of a thread.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadEntry {
    pub(crate) func: fn(usize),
    pub(crate) arg: usize,
}

/// *Thread control block* - the state data of a thread. The caller supplies
/// the storage (`ThreadCb::new()` in a `static`); `thread::create`
/// initializes it.
#[repr(C)]
pub struct ThreadCb<Traits: PortThreading> {
    /// Port-private per-thread state (saved stack pointer and whatever
    /// else the dispatcher needs).
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that assembly code can refer to it easily.
    pub port_state: Traits::PortThreadState,

    pub(crate) ident: CpuLockCell<Traits, ObjectId>,
    pub(crate) name: CpuLockCell<Traits, Option<&'static str>>,
    pub(crate) entry: CpuLockCell<Traits, Option<ThreadEntry>>,
    pub(crate) stack: CpuLockCell<Traits, Stack>,

    /// The priority given at creation.
    pub(crate) base_priority: CpuLockCell<Traits, Priority>,

    /// The effective priority, possibly boosted by the mutex
    /// priority-inheritance protocol. Invariant: at least as urgent as
    /// `base_priority` demands, boosted above it only while the thread
    /// holds an inheritance mutex with a waiter.
    pub(crate) priority: CpuLockCell<Traits, Priority>,

    pub(crate) state: CpuLockCell<Traits, ThreadState>,

    /// Queue link for whichever ready or wait queue currently holds the
    /// thread. A thread is linked into at most one such queue at a time.
    pub(crate) link: CpuLockCell<Traits, Option<StaticLink<ThreadCb<Traits>>>>,

    /// The wait state: what the thread is waiting for and where the result
    /// is delivered.
    pub(crate) wait: wait::ThreadWait<Traits>,

    /// Timer event used for this thread's own wait deadline.
    pub(crate) wait_timer: timer::TimerEvent<Traits>,

    /// Mutexes currently held, in acquisition order.
    pub(crate) held_mutexes: CpuLockCell<Traits, StaticListHead<MutexCb<Traits>>>,

    /// Cumulative run time, in ticks.
    pub(crate) run_time: CpuLockCell<Traits, Ticks>,

    /// Ticks consumed of the current round-robin slice.
    pub(crate) slice_count: CpuLockCell<Traits, u16>,
}

impl<Traits: PortThreading> Init for ThreadCb<Traits> {
    const INIT: Self = Self {
        port_state: Init::INIT,
        ident: Init::INIT,
        name: Init::INIT,
        entry: Init::INIT,
        stack: Init::INIT,
        base_priority: Init::INIT,
        priority: Init::INIT,
        state: Init::INIT,
        link: Init::INIT,
        wait: Init::INIT,
        wait_timer: Init::INIT,
        held_mutexes: Init::INIT,
        run_time: Init::INIT,
        slice_count: Init::INIT,
    };
}

impl<Traits: PortThreading> ThreadCb<Traits> {
    /// Construct the constant initial value for a `static`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// Scheduler core
// ---------------------------------------------------------------------------

/// Elect `t` as the next thread to run and, unless it already owns the
/// CPU, ask the port for a context switch.
pub(crate) fn set_next<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    t: ThreadRef<Traits>,
) {
    let st = Traits::state();
    let mut run = st.run.get(&*lock);

    if run.next == Some(t) {
        return;
    }

    // The previously elected thread loses the election.
    if let Some(old) = run.next {
        let s = old.0.state.get(&*lock);
        if s.contains(ThreadState::RUNNING) {
            old.0.state.replace(&mut *lock, ThreadState::READY);
        }
    }

    t.0.state.replace(&mut *lock, ThreadState::RUNNING);
    run.next = Some(t);
    st.run.replace(&mut *lock, run);

    if run.current != Some(t) {
        // Safety: CPU Lock active
        unsafe { Traits::request_context_switch() };
    }
}

/// Elect the head of the highest-priority non-empty ready queue. No-op
/// while the scheduler is locked or not yet running.
pub(crate) fn reschedule<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let st = Traits::state();
    if st.state.get(&*lock) != kernel::State::Running {
        return;
    }
    if let Some(h) = st.ready.highest(lock.borrow_mut()) {
        set_next(lock, h);
    }
}

/// After `t` became ready: preempt the elected thread if `t` is strictly
/// more urgent. No-op while the scheduler is locked.
pub(crate) fn preempt_check<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    t: ThreadRef<Traits>,
) {
    let st = Traits::state();
    if st.state.get(&*lock) != kernel::State::Running {
        return;
    }
    let run = st.run.get(&*lock);
    let next = match run.next {
        Some(next) => next,
        None => return,
    };
    // less value - greater priority
    if t.0.priority.get(&*lock) < next.0.priority.get(&*lock) {
        set_next(lock, t);
    }
}

/// Transition the thread into the Ready state and append it to the ready
/// queue for its priority.
pub(crate) fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    t: ThreadRef<Traits>,
) {
    t.0.state.replace(&mut *lock, ThreadState::READY);
    Traits::state().ready.push_back(lock.borrow_mut(), t);
    preempt_check(lock, t);
}

/// Move a Ready/Running thread to another priority level, re-inserting it
/// at the tail of the destination queue, and re-dispatch.
pub(crate) fn change_priority_requeue<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    t: ThreadRef<Traits>,
    priority: Priority,
) {
    let st = Traits::state();
    st.ready.remove(lock.borrow_mut(), t);
    t.0.priority.replace(&mut *lock, priority);
    st.ready.push_back(lock.borrow_mut(), t);
    reschedule(lock);
}

/// Apply a new effective priority to a thread in any state, propagating
/// along the mutex-wait chain as required by the inheritance protocol.
pub(crate) fn apply_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    t: ThreadRef<Traits>,
    priority: Priority,
) {
    if t.0.priority.get(&*lock) == priority {
        return;
    }

    let s = t.0.state.get(&*lock);
    if s.intersects(ThreadState::READY | ThreadState::RUNNING) {
        change_priority_requeue(lock, t, priority);
    } else if s.contains(ThreadState::BLOCKED) {
        t.0.priority.replace(&mut *lock, priority);
        // The thread's urgency changed while it waits; if it waits on an
        // inheritance mutex, the owner inherits the change transitively.
        if let wait::WaitPayload::Mutex(m) = t.0.wait.payload.get(&*lock) {
            mutex::reevaluate_owner_priority(lock, m);
        }
    } else {
        t.0.priority.replace(&mut *lock, priority);
    }
}

// Lifecycle
// ---------------------------------------------------------------------------

fn create_core<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    name: Option<&'static str>,
    entry: ThreadEntry,
    stack: Stack,
    priority: Priority,
) {
    thread.name.replace(&mut *lock, name);
    thread.entry.replace(&mut *lock, Some(entry));
    thread.stack.replace(&mut *lock, stack);
    thread.base_priority.replace(&mut *lock, priority);
    thread.priority.replace(&mut *lock, priority);
    thread.state.replace(&mut *lock, ThreadState::empty());
    thread.run_time.replace(&mut *lock, 0);
    thread.slice_count.replace(&mut *lock, 0);
    thread.wait.reset(lock.borrow_mut());

    // Fill the stack for the high-watermark scan.
    stack.fill(Traits::CONFIG.stack_fill);

    thread.ident.replace(&mut *lock, ObjectId::THREAD);
}

fn activate_core<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let base = thread.base_priority.get(&*lock);
    thread.priority.replace(&mut *lock, base);
    thread.slice_count.replace(&mut *lock, 0);

    let entry = thread.entry.get(&*lock).unwrap();
    let stack = thread.stack.get(&*lock);
    // Safety: CPU Lock active, the thread is not running
    unsafe { Traits::initialize_stack(thread, stack, entry.func, entry.arg) };

    make_ready(lock, Ident(thread));
}

/// Create one of the two system threads at kernel start.
pub(crate) fn create_system_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    name: &'static str,
    body: fn(usize),
    priority: Priority,
    stack: Stack,
) -> Result<(), CreateError> {
    if stack.is_unset() || stack.size_words() < Traits::STACK_MIN_WORDS {
        return Err(CreateError::WrongParam);
    }
    create_core(
        lock.borrow_mut(),
        thread,
        Some(name),
        ThreadEntry { func: body, arg: 0 },
        stack,
        priority,
    );
    activate_core(lock, thread);
    Ok(())
}

/// Create a thread in the caller-supplied control block.
///
/// The thread is left inactive unless
/// [`ThreadOptions::START_ON_CREATE`] is given.
pub fn create<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
    name: Option<&'static str>,
    entry: fn(usize),
    arg: usize,
    stack: Stack,
    priority: Priority,
    options: ThreadOptions,
) -> Result<(), CreateError> {
    kernel::expect_thread_context::<Traits>()?;
    if !USER_PRIORITY_RANGE.contains(&priority) {
        return Err(CreateError::WrongParam);
    }
    if stack.is_unset() || stack.size_words() < Traits::STACK_MIN_WORDS {
        return Err(CreateError::WrongParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    if thread.ident.get(&*lock) != ObjectId::INVALID {
        return Err(CreateError::WrongParam);
    }

    create_core(
        lock.borrow_mut(),
        thread,
        name,
        ThreadEntry { func: entry, arg },
        stack,
        priority,
    );

    if options.contains(ThreadOptions::START_ON_CREATE) {
        activate_core(lock.borrow_mut(), thread);
    }

    Ok(())
}

/// Delete a thread. The thread must be inactive or terminated; its storage
/// returns to the caller.
pub fn delete<Traits: KernelTraits>(thread: &'static ThreadCb<Traits>) -> Result<(), DeleteError> {
    kernel::expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    if thread.ident.get(&*lock) != ObjectId::THREAD {
        return Err(DeleteError::NoExist);
    }

    let s = thread.state.get(&*lock);
    if !(s.is_empty() || s == ThreadState::TERMINATED) {
        return Err(DeleteError::IllegalContext);
    }

    thread.ident.replace(&mut *lock, ObjectId::INVALID);
    Ok(())
}

/// Start an inactive or terminated thread.
pub fn start<Traits: KernelTraits>(thread: &'static ThreadCb<Traits>) -> Result<(), ThreadOpError> {
    kernel::expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    if thread.ident.get(&*lock) != ObjectId::THREAD {
        return Err(ThreadOpError::NoExist);
    }

    let s = thread.state.get(&*lock);
    if !(s.is_empty() || s == ThreadState::TERMINATED) {
        return Err(ThreadOpError::Overflow);
    }

    activate_core(lock.borrow_mut(), thread);
    Ok(())
}

/// Terminate the currently running thread. Every mutex it holds is
/// released (most recently acquired first), waking the next waiters.
pub fn exit<Traits: KernelTraits>() -> Result<Infallible, StateError> {
    kernel::expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    let st = Traits::state();

    let curr = match st.run.get(&*lock).current {
        Some(t) => t,
        None => return Err(StateError::Resource),
    };

    // Exiting while the scheduler is locked would leave no one to unlock
    // it; resume dispatching first.
    if st.state.get(&*lock) == kernel::State::Locked {
        st.state.replace(&mut *lock, kernel::State::Running);
    }

    mutex::release_all_held(lock.borrow_mut(), curr);

    st.ready.remove(lock.borrow_mut(), curr);
    curr.0.state.replace(&mut *lock, ThreadState::TERMINATED);
    reschedule(lock.borrow_mut());

    core::mem::forget(lock);
    // Safety: CPU Lock active, `curr` is off the ready set
    unsafe { Traits::exit_and_dispatch(curr.0) }
}

/// Terminate another thread. The target must not be the currently running
/// thread.
pub fn terminate<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<(), ThreadOpError> {
    kernel::expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    let st = Traits::state();
    if thread.ident.get(&*lock) != ObjectId::THREAD {
        return Err(ThreadOpError::NoExist);
    }

    let t = Ident(thread);
    let s = thread.state.get(&*lock);
    if s.is_empty() || s == ThreadState::TERMINATED {
        return Err(ThreadOpError::IllegalContext);
    }
    if st.run.get(&*lock).current == Some(t) {
        return Err(ThreadOpError::IllegalContext);
    }

    if s.contains(ThreadState::BLOCKED) {
        wait::abort_wait(lock.borrow_mut(), t);
    } else if s.intersects(ThreadState::READY | ThreadState::RUNNING) {
        st.ready.remove(lock.borrow_mut(), t);
    }

    mutex::release_all_held(lock.borrow_mut(), t);

    thread.state.replace(&mut *lock, ThreadState::TERMINATED);

    if st.run.get(&*lock).next == Some(t) {
        reschedule(lock.borrow_mut());
    }

    Ok(())
}

/// Suspend a thread. A blocked thread keeps waiting and enters the
/// combined blocked-suspended state.
pub fn suspend<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<(), ThreadOpError> {
    kernel::expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    let st = Traits::state();
    if thread.ident.get(&*lock) != ObjectId::THREAD {
        return Err(ThreadOpError::NoExist);
    }

    let t = Ident(thread);
    let s = thread.state.get(&*lock);
    if s.contains(ThreadState::SUSPENDED) {
        return Err(ThreadOpError::Overflow);
    }
    if s.is_empty() || s == ThreadState::TERMINATED {
        return Err(ThreadOpError::Resource);
    }

    if s.contains(ThreadState::BLOCKED) {
        thread
            .state
            .replace(&mut *lock, s | ThreadState::SUSPENDED);
    } else {
        st.ready.remove(lock.borrow_mut(), t);
        thread.state.replace(&mut *lock, ThreadState::SUSPENDED);

        let run = st.run.get(&*lock);
        if run.current == Some(t) || run.next == Some(t) {
            reschedule(lock.borrow_mut());
        }
    }

    Ok(())
}

/// Resume a suspended thread.
pub fn resume<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<(), ThreadOpError> {
    kernel::expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    if thread.ident.get(&*lock) != ObjectId::THREAD {
        return Err(ThreadOpError::NoExist);
    }

    let s = thread.state.get(&*lock);
    if !s.contains(ThreadState::SUSPENDED) {
        return Err(ThreadOpError::Resource);
    }

    if s.contains(ThreadState::BLOCKED) {
        thread
            .state
            .replace(&mut *lock, s & !ThreadState::SUSPENDED);
    } else {
        make_ready(lock.borrow_mut(), Ident(thread));
    }

    Ok(())
}

/// Put the currently running thread to sleep.
///
/// The sleep ends normally when the deadline expires, or early through
/// [`wakeup`] or [`release_wait`]. `Timeout::Forever` sleeps until
/// explicitly woken.
pub fn sleep<Traits: KernelTraits>(timeout: Timeout) -> Result<(), SleepError> {
    if timeout.is_poll() {
        return Err(SleepError::WrongParam);
    }
    let mut lock = klock::lock_cpu::<Traits>()?;
    kernel::expect_waitable_context::<Traits>(lock.borrow_mut())?;

    wait::enter_wait(lock.borrow_mut(), None, wait::WaitPayload::Sleep, timeout);
    drop(lock);

    // Deadline expiry is the normal completion of a sleep.
    let _ = wait::finish::<Traits>();
    Ok(())
}

/// Wake a sleeping thread before its deadline.
pub fn wakeup<Traits: KernelTraits>(thread: &'static ThreadCb<Traits>) -> Result<(), ThreadOpError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if thread.ident.get(&*lock) != ObjectId::THREAD {
        return Err(ThreadOpError::NoExist);
    }

    let s = thread.state.get(&*lock);
    let sleeping = s.contains(ThreadState::BLOCKED)
        && matches!(thread.wait.payload.get(&*lock), wait::WaitPayload::Sleep);
    if !sleeping {
        return Err(ThreadOpError::Resource);
    }

    wait::exit_wait(lock.borrow_mut(), Ident(thread), Ok(wait::WaitValue::None));
    Ok(())
}

/// Forcibly release a thread from any wait. The wait completes with an
/// `Ok` result.
pub fn release_wait<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<(), ThreadOpError> {
    kernel::expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    if thread.ident.get(&*lock) != ObjectId::THREAD {
        return Err(ThreadOpError::NoExist);
    }

    if !thread.state.get(&*lock).contains(ThreadState::BLOCKED) {
        return Err(ThreadOpError::Resource);
    }

    wait::exit_wait(lock.borrow_mut(), Ident(thread), Ok(wait::WaitValue::None));
    Ok(())
}

/// Rotate the currently running thread to the tail of its ready queue and
/// re-dispatch.
pub fn yield_now<Traits: KernelTraits>() -> Result<(), StateError> {
    kernel::expect_thread_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    let st = Traits::state();

    let curr = match st.run.get(&*lock).current {
        Some(t) => t,
        None => return Err(StateError::Resource),
    };

    st.ready.rotate(lock.borrow_mut(), curr);
    reschedule(lock.borrow_mut());
    Ok(())
}

/// Change a thread's base priority.
///
/// The effective priority is recomputed under the inheritance protocol:
/// it remains boosted while any held mutex has a more urgent waiter, and
/// a change to a thread blocked on an inheritance mutex propagates along
/// the ownership chain.
pub fn set_priority<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
    priority: Priority,
) -> Result<(), SetPriorityError> {
    kernel::expect_thread_context::<Traits>()?;
    if !USER_PRIORITY_RANGE.contains(&priority) {
        return Err(SetPriorityError::WrongParam);
    }
    let mut lock = klock::lock_cpu::<Traits>()?;
    if thread.ident.get(&*lock) != ObjectId::THREAD {
        return Err(SetPriorityError::NoExist);
    }

    let s = thread.state.get(&*lock);
    if s.is_empty() || s == ThreadState::TERMINATED {
        return Err(SetPriorityError::IllegalContext);
    }

    thread.base_priority.replace(&mut *lock, priority);
    let effective = mutex::effective_priority(lock.borrow_mut(), Ident(thread));
    apply_priority(lock.borrow_mut(), Ident(thread), effective);

    Ok(())
}

// Queries
// ---------------------------------------------------------------------------

fn checked<Traits: KernelTraits, R>(
    thread: &'static ThreadCb<Traits>,
    f: impl FnOnce(&klock::CpuLockGuard<Traits>) -> R,
) -> Result<R, QueryError> {
    let lock = klock::lock_cpu::<Traits>()?;
    if thread.ident.get(&*lock) != ObjectId::THREAD {
        return Err(QueryError::NoExist);
    }
    Ok(f(&lock))
}

/// Get the thread's name.
pub fn name<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<Option<&'static str>, QueryError> {
    checked(thread, |lock| thread.name.get(&**lock))
}

/// Get the thread's state set.
pub fn state<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<ThreadState, QueryError> {
    checked(thread, |lock| thread.state.get(&**lock))
}

/// Get the thread's effective priority.
pub fn priority<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<Priority, QueryError> {
    checked(thread, |lock| thread.priority.get(&**lock))
}

/// Get the thread's base priority.
pub fn base_priority<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<Priority, QueryError> {
    checked(thread, |lock| thread.base_priority.get(&**lock))
}

/// Get the size of the thread's stack, in bytes.
pub fn stack_size<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<usize, QueryError> {
    checked(thread, |lock| thread.stack.get(&**lock).size_bytes())
}

/// Get the number of stack bytes never touched since creation, based on
/// the stack watermark.
pub fn stack_space<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<usize, QueryError> {
    checked(thread, |lock| {
        thread
            .stack
            .get(&**lock)
            .unused_bytes(Traits::CONFIG.stack_fill)
    })
}

/// Get the thread's cumulative run time, in ticks.
pub fn run_time<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<Ticks, QueryError> {
    checked(thread, |lock| thread.run_time.get(&**lock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_port::{self, define_test_kernel};
    use crate::timer;

    fn spawn<Traits: KernelTraits>(
        t: &'static ThreadCb<Traits>,
        name: &'static str,
        priority: Priority,
    ) {
        create::<Traits>(
            t,
            Some(name),
            test_port::noop_entry,
            0,
            test_port::test_stack(),
            priority,
            ThreadOptions::START_ON_CREATE,
        )
        .unwrap();
    }

    #[test]
    fn create_rejects_bad_parameters() {
        define_test_kernel!(Sys);
        static A: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();

        // Reserved priorities
        for bad in [crate::TIMER_PRIORITY, crate::IDLE_PRIORITY] {
            assert_eq!(
                create::<Sys>(
                    &A,
                    None,
                    test_port::noop_entry,
                    0,
                    test_port::test_stack(),
                    bad,
                    ThreadOptions::empty(),
                ),
                Err(CreateError::WrongParam)
            );
        }

        // Undersized stack
        let tiny = {
            let mem = Box::leak(Box::new([0u32; 8]));
            unsafe { Stack::from_raw_parts(mem.as_mut_ptr(), mem.len()) }
        };
        assert_eq!(
            create::<Sys>(&A, None, test_port::noop_entry, 0, tiny, 5, ThreadOptions::empty()),
            Err(CreateError::WrongParam)
        );

        // Double creation
        spawn(&A, "a", 5);
        assert_eq!(
            create::<Sys>(
                &A,
                None,
                test_port::noop_entry,
                0,
                test_port::test_stack(),
                5,
                ThreadOptions::empty()
            ),
            Err(CreateError::WrongParam)
        );
    }

    #[test]
    fn operations_on_stale_handles_fail() {
        define_test_kernel!(Sys);
        static A: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();

        assert_eq!(start::<Sys>(&A), Err(ThreadOpError::NoExist));
        assert_eq!(suspend::<Sys>(&A), Err(ThreadOpError::NoExist));
        assert_eq!(priority::<Sys>(&A), Err(QueryError::NoExist));

        create::<Sys>(
            &A,
            Some("a"),
            test_port::noop_entry,
            0,
            test_port::test_stack(),
            5,
            ThreadOptions::empty(),
        )
        .unwrap();
        delete::<Sys>(&A).unwrap();
        assert_eq!(start::<Sys>(&A), Err(ThreadOpError::NoExist));
    }

    #[test]
    fn fifo_order_and_yield_rotation() {
        define_test_kernel!(Sys);
        static A: ThreadCb<Sys> = ThreadCb::new();
        static B: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        spawn(&A, "a", 5);
        spawn(&B, "b", 5);
        test_port::park_timer_thread::<Sys>();

        // FIFO within one priority: A was made ready first
        assert!(core::ptr::eq(test_port::current::<Sys>(), &A));

        yield_now::<Sys>().unwrap();
        test_port::commit_switch::<Sys>();
        assert!(core::ptr::eq(test_port::current::<Sys>(), &B));

        yield_now::<Sys>().unwrap();
        test_port::commit_switch::<Sys>();
        assert!(core::ptr::eq(test_port::current::<Sys>(), &A));
    }

    #[test]
    fn higher_urgency_thread_preempts() {
        define_test_kernel!(Sys);
        static A: ThreadCb<Sys> = ThreadCb::new();
        static B: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        spawn(&A, "a", 10);
        test_port::park_timer_thread::<Sys>();
        assert!(core::ptr::eq(test_port::current::<Sys>(), &A));
        let requests = switch_requests();

        spawn(&B, "b", 3);
        assert!(switch_requests() > requests);
        assert_eq!(state::<Sys>(&B).unwrap(), ThreadState::RUNNING);
        assert_eq!(state::<Sys>(&A).unwrap(), ThreadState::READY);
        test_port::commit_switch::<Sys>();
        assert!(core::ptr::eq(test_port::current::<Sys>(), &B));
    }

    #[test]
    fn suspend_resume_interacts_with_waits() {
        define_test_kernel!(Sys);
        static A: ThreadCb<Sys> = ThreadCb::new();
        static B: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        spawn(&A, "a", 5);
        spawn(&B, "b", 6);
        test_port::park_timer_thread::<Sys>();
        assert!(core::ptr::eq(test_port::current::<Sys>(), &A));

        // A goes to sleep, B takes over
        sleep::<Sys>(Timeout::Forever).unwrap();
        test_port::commit_switch::<Sys>();
        assert!(core::ptr::eq(test_port::current::<Sys>(), &B));
        assert_eq!(state::<Sys>(&A).unwrap(), ThreadState::BLOCKED);

        // Suspending a blocked thread forms the composite state
        suspend::<Sys>(&A).unwrap();
        assert_eq!(
            state::<Sys>(&A).unwrap(),
            ThreadState::BLOCKED | ThreadState::SUSPENDED
        );
        assert_eq!(suspend::<Sys>(&A), Err(ThreadOpError::Overflow));

        // Waking it while suspended only clears the blocked flag
        wakeup::<Sys>(&A).unwrap();
        assert_eq!(state::<Sys>(&A).unwrap(), ThreadState::SUSPENDED);

        // A (priority 5) preempts the running B (priority 6) on resume
        resume::<Sys>(&A).unwrap();
        assert_eq!(state::<Sys>(&A).unwrap(), ThreadState::RUNNING);
        assert_eq!(resume::<Sys>(&A), Err(ThreadOpError::Resource));
    }

    #[test]
    fn set_priority_is_idempotent() {
        define_test_kernel!(Sys);
        static A: ThreadCb<Sys> = ThreadCb::new();
        static B: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        spawn(&A, "a", 5);
        spawn(&B, "b", 5);
        test_port::park_timer_thread::<Sys>();

        set_priority::<Sys>(&B, 4).unwrap();
        assert_eq!(priority::<Sys>(&B).unwrap(), 4);
        assert_eq!(state::<Sys>(&B).unwrap(), ThreadState::RUNNING);

        set_priority::<Sys>(&B, 4).unwrap();
        assert_eq!(priority::<Sys>(&B).unwrap(), 4);
        assert_eq!(base_priority::<Sys>(&B).unwrap(), 4);
        assert_eq!(state::<Sys>(&B).unwrap(), ThreadState::RUNNING);

        assert_eq!(set_priority::<Sys>(&B, 0), Err(SetPriorityError::WrongParam));
    }

    #[test]
    fn stack_is_watermarked() {
        define_test_kernel!(Sys);
        static A: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        spawn(&A, "a", 5);

        // The test port never touches the stack, so all of it is unused.
        assert_eq!(
            stack_space::<Sys>(&A).unwrap(),
            stack_size::<Sys>(&A).unwrap()
        );
    }

    #[test]
    fn terminating_a_blocked_thread_disarms_its_deadline() {
        define_test_kernel!(Sys);
        static A: ThreadCb<Sys> = ThreadCb::new();
        static B: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        spawn(&A, "a", 5);
        spawn(&B, "b", 6);
        test_port::park_timer_thread::<Sys>();

        sleep::<Sys>(Timeout::Ticks(5)).unwrap();
        test_port::commit_switch::<Sys>();
        assert!(core::ptr::eq(test_port::current::<Sys>(), &B));

        // Terminating the sleeper must also unlink its timer event
        terminate::<Sys>(&A).unwrap();
        assert_eq!(state::<Sys>(&A).unwrap(), ThreadState::TERMINATED);
        assert_eq!(terminate::<Sys>(&A), Err(ThreadOpError::IllegalContext));

        for _ in 0..6 {
            timer::tick_handler::<Sys>();
        }
        timer::process_expired::<Sys>();
        assert_eq!(state::<Sys>(&A).unwrap(), ThreadState::TERMINATED);

        // A terminated thread can be started anew; being the most urgent
        // ready thread, it is elected immediately
        start::<Sys>(&A).unwrap();
        assert_eq!(state::<Sys>(&A).unwrap(), ThreadState::RUNNING);
    }

    #[test]
    fn sleep_rejects_polling() {
        define_test_kernel!(Sys);
        test_port::boot::<Sys>();
        assert_eq!(sleep::<Sys>(Timeout::Poll), Err(SleepError::WrongParam));
        assert_eq!(sleep::<Sys>(Timeout::Ticks(0)), Err(SleepError::WrongParam));
    }
}
