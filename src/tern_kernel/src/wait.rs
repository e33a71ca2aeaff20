//! The wait/timeout core: how a thread blocks on a wait queue with an
//! optional deadline, and how expiry and explicit wake interact.
//!
//! Enter-wait, every satisfaction path, and the timeout callback all run
//! under the CPU Lock critical section, so a completion and a timeout can
//! never both fire: whichever enters the section first removes the thread
//! from both the wait queue and the timer queue, and only that side writes
//! the caller's result slot.
use crate::{
    error::WaitError,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    mutex::{self, MutexCb},
    thread::{self, ThreadCb, ThreadRef, ThreadState},
    timer,
    utils::{
        intrusive_list::{self, Ident, ListAccessorCell, Static, StaticListHead},
        Init,
    },
    KernelTraits, PortThreading, Priority, Timeout,
};

/// Get a `ListAccessorCell` used to access a wait queue.
macro_rules! wait_list {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new($head, &Static, |t: &ThreadCb<_>| &t.link, $key)
    };
}

/// Raw pointer to a blocked sender's message. Only dereferenced inside the
/// critical section, while the sender is parked on the wait queue and its
/// buffer is therefore live.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendPtr(pub *const u8);

// Safety: see the type-level comment
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// Raw pointer to a blocked receiver's buffer. Same liveness argument as
/// [`SendPtr`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecvPtr(pub *mut u8);

// Safety: see the type-level comment
unsafe impl Send for RecvPtr {}
unsafe impl Sync for RecvPtr {}

/// A memory-pool block handed to a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockPtr(pub *mut u8);

// Safety: pool blocks are plain storage owned by the pool
unsafe impl Send for BlockPtr {}
unsafe impl Sync for BlockPtr {}

/// Describes the operation a blocked thread is waiting to complete.
pub(crate) enum WaitPayload<Traits: PortThreading> {
    None,
    Sleep,
    Semaphore,
    Flags {
        pattern: u32,
        options: crate::flags::FlagsWaitOptions,
    },
    Mutex(&'static MutexCb<Traits>),
    PoolGet,
    MsgSend {
        msg: SendPtr,
        to_front: bool,
    },
    MsgReceive {
        buf: RecvPtr,
    },
}

impl<Traits: PortThreading> Clone for WaitPayload<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for WaitPayload<Traits> {}

/// The value delivered together with a successful wait completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitValue {
    None,
    /// The event-flags snapshot that satisfied the wait.
    Flags(u32),
    /// The memory-pool block granted to the waiter.
    Block(BlockPtr),
}

/// The wait state of a thread, embedded in the TCB. The result slot is
/// written by the waker before the thread is made ready and read by the
/// caller once it resumes; it must be inspected before any out-value.
pub(crate) struct ThreadWait<Traits: PortThreading> {
    /// The wait queue the thread is parked on, if any (`None` for a pure
    /// sleep).
    pub(crate) queue: CpuLockCell<Traits, Option<&'static WaitQueue<Traits>>>,
    pub(crate) payload: CpuLockCell<Traits, WaitPayload<Traits>>,
    pub(crate) result: CpuLockCell<Traits, Result<WaitValue, WaitError>>,
}

impl<Traits: PortThreading> Init for ThreadWait<Traits> {
    const INIT: Self = Self {
        queue: Init::INIT,
        payload: CpuLockCell::new(WaitPayload::None),
        result: CpuLockCell::new(Ok(WaitValue::None)),
    };
}

impl<Traits: PortThreading> ThreadWait<Traits> {
    pub(crate) fn reset(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        self.queue.replace(&mut *lock, None);
        self.payload.replace(&mut *lock, WaitPayload::None);
        self.result.replace(&mut *lock, Ok(WaitValue::None));
    }
}

/// A queue of threads blocked on one waitable object. FIFO: waiters are
/// appended at the tail and released from the head.
pub(crate) struct WaitQueue<Traits: PortThreading> {
    waits: CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    const INIT: Self = Self { waits: Init::INIT };
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    pub(crate) fn front(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<ThreadRef<Traits>> {
        wait_list!(&self.waits, lock.borrow_mut()).front()
    }

    pub(crate) fn next(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        t: ThreadRef<Traits>,
    ) -> Option<ThreadRef<Traits>> {
        wait_list!(&self.waits, lock.borrow_mut()).next(t)
    }

    /// The most urgent priority among the waiters, `None` when the queue
    /// is empty.
    pub(crate) fn min_waiter_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<Priority> {
        let accessor = wait_list!(&self.waits, lock.borrow_mut());
        let mut best: Option<Priority> = None;
        let mut cursor = accessor.front();
        while let Some(t) = cursor {
            let p = intrusive_list::CellLike::get(&accessor.pool()[t].priority, accessor.cell_key());
            best = Some(match best {
                Some(b) if b <= p => b,
                _ => p,
            });
            cursor = accessor.next(t);
        }
        best
    }

    fn enqueue(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, t: ThreadRef<Traits>) {
        wait_list!(&self.waits, lock.borrow_mut()).push_back(t);
    }

    fn remove(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, t: ThreadRef<Traits>) -> bool {
        wait_list!(&self.waits, lock.borrow_mut()).remove(t)
    }

    /// Release every waiter with a *deleted* result. The queue is empty
    /// afterwards.
    pub(crate) fn wake_all_deleted(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        while let Some(t) = self.front(lock.borrow_mut()) {
            exit_wait(lock.borrow_mut(), t, Err(WaitError::Deleted));
        }
    }
}

/// Block the currently running thread.
///
/// Removes the thread from the ready set, parks it at the tail of
/// `wait_queue` (if given), arms the thread's deadline timer (for a finite
/// timeout), and re-dispatches. The caller must have verified the context
/// is waitable and must drop the CPU Lock promptly afterwards so the
/// pended context switch can take place.
pub(crate) fn enter_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait_queue: Option<&'static WaitQueue<Traits>>,
    payload: WaitPayload<Traits>,
    timeout: Timeout,
) {
    debug_assert!(!timeout.is_poll());

    let st = Traits::state();
    let t = st.run.get(&*lock).current.unwrap();

    st.ready.remove(lock.borrow_mut(), t);
    t.0.state.replace(&mut *lock, ThreadState::BLOCKED);
    t.0.wait.payload.replace(&mut *lock, payload);
    t.0.wait.queue.replace(&mut *lock, wait_queue);
    // The slot defaults to the deadline outcome; every release path
    // overwrites it before making the thread ready.
    t.0.wait.result.replace(&mut *lock, Err(WaitError::Timeout));

    if let Some(q) = wait_queue {
        q.enqueue(lock.borrow_mut(), t);
    }

    if let Timeout::Ticks(delay) = timeout {
        let now = st.tick.get(&*lock);
        timer::insert(
            lock.borrow_mut(),
            Ident(&t.0.wait_timer),
            now.wrapping_add(delay),
            wait_timeout_handler::<Traits>,
            t.0 as *const ThreadCb<Traits> as usize,
        );
    }

    thread::reschedule(lock);
}

/// Release a blocked thread, delivering `result`.
///
/// Removes the thread from its wait queue and from the timer queue, runs
/// the priority-inheritance adjustment when the thread was waiting on an
/// inheritance mutex, and makes the thread ready. A thread that was
/// independently suspended stays suspended; only its blocked flag is
/// cleared.
pub(crate) fn exit_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    t: ThreadRef<Traits>,
    result: Result<WaitValue, WaitError>,
) {
    debug_assert!(t.0.state.get(&*lock).contains(ThreadState::BLOCKED));

    unlink_waiter(lock.borrow_mut(), t);

    t.0.wait.result.replace(&mut *lock, result);

    let s = t.0.state.get(&*lock);
    if s.contains(ThreadState::SUSPENDED) {
        t.0.state.replace(&mut *lock, ThreadState::SUSPENDED);
    } else {
        thread::make_ready(lock, t);
    }
}

/// Detach a blocked thread from everything it waits on without completing
/// the wait. Used when the thread is terminated.
pub(crate) fn abort_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    t: ThreadRef<Traits>,
) {
    unlink_waiter(lock, t);
}

fn unlink_waiter<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    t: ThreadRef<Traits>,
) {
    if let Some(q) = t.0.wait.queue.get(&*lock) {
        q.remove(lock.borrow_mut(), t);
    }
    timer::remove(lock.borrow_mut(), Ident(&t.0.wait_timer));

    // If the thread was blocked by an inheritance mutex, the owner's boost
    // may have come from this waiter; recompute.
    if let WaitPayload::Mutex(m) = t.0.wait.payload.get(&*lock) {
        if m.owner(lock.borrow_mut()) != Some(t) {
            mutex::reevaluate_owner_priority(lock.borrow_mut(), m);
        }
    }

    t.0.wait.queue.replace(&mut *lock, None);
    t.0.wait.payload.replace(&mut *lock, WaitPayload::None);
}

/// Read back the wait result after the current thread resumed from a
/// blocking operation.
pub(crate) fn finish<Traits: KernelTraits>() -> Result<WaitValue, WaitError> {
    let lock = klock::lock_cpu::<Traits>()
        .unwrap_or_else(|_| unsafe { klock::assume_cpu_lock::<Traits>() });
    let t = Traits::state().run.get(&*lock).current.unwrap();
    t.0.wait.result.get(&*lock)
}

/// Deadline callback armed by [`enter_wait`]. Runs in the timer thread,
/// outside the critical section; the `BLOCKED` re-check under the lock
/// resolves the race against a completion that won in the meantime.
fn wait_timeout_handler<Traits: KernelTraits>(arg: usize) {
    // Safety: the argument was produced from a `&'static ThreadCb` by
    // `enter_wait`
    let t = unsafe { &*(arg as *const ThreadCb<Traits>) };

    let mut lock = match klock::lock_cpu::<Traits>() {
        Ok(lock) => lock,
        Err(_) => return,
    };

    if t.state.get(&*lock).contains(ThreadState::BLOCKED) {
        exit_wait(lock.borrow_mut(), Ident(t), Err(WaitError::Timeout));
    }
}
