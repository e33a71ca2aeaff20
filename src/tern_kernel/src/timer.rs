//! The tick and the software-timer service.
//!
//! A single global queue holds every outstanding timer event, sorted by
//! ascending expiry tick. The tick handler only advances the clock and
//! releases the timer semaphore when the head of the queue is due; the
//! actual callbacks run in the dedicated timer thread (priority 0), which
//! drops the critical section around each callback so a callback may
//! itself take locks or perform scheduling actions.
use crate::{
    error::{CreateError, DeleteError, TimerOpError},
    kernel,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    thread,
    utils::{
        intrusive_list::{self, Ident, ListAccessorCell, Static, StaticLink},
        time_before, time_before_eq, Init, ObjectId,
    },
    KernelTraits, PortThreading, Ticks, Timeout,
};

/// Get a `ListAccessorCell` used to access the global timer queue.
macro_rules! timer_list {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new($head, &Static, |e: &TimerEvent<_>| &e.link, $key)
    };
}

/// Callback of a timer event: a plain function and a `usize` argument.
/// Invoked by the timer thread with the critical section dropped.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerCallback {
    pub(crate) func: fn(usize),
    pub(crate) arg: usize,
}

/// A timer event: a queue link, an expiry tick value, and a callback.
/// Embedded into every TCB (for the wait deadline) and into the alarm and
/// cyclic control blocks.
pub(crate) struct TimerEvent<Traits: PortThreading> {
    pub(crate) link: CpuLockCell<Traits, Option<StaticLink<TimerEvent<Traits>>>>,
    pub(crate) expiry: CpuLockCell<Traits, Ticks>,
    pub(crate) callback: CpuLockCell<Traits, Option<TimerCallback>>,
}

impl<Traits: PortThreading> Init for TimerEvent<Traits> {
    const INIT: Self = Self {
        link: Init::INIT,
        expiry: Init::INIT,
        callback: Init::INIT,
    };
}

pub(crate) type TimerEventRef<Traits> = Ident<&'static TimerEvent<Traits>>;

/// Register `ev` to fire at the absolute tick `at`. Insertion is a linear
/// walk from the head; the queue stays sorted by ascending expiry, FIFO
/// among equal expiries.
pub(crate) fn insert<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    ev: TimerEventRef<Traits>,
    at: Ticks,
    func: fn(usize),
    arg: usize,
) {
    ev.0.expiry.replace(&mut *lock, at);
    ev.0
        .callback
        .replace(&mut *lock, Some(TimerCallback { func, arg }));

    let mut accessor = timer_list!(&Traits::state().timer_queue, lock.borrow_mut());
    let mut insert_at = None;
    let mut cursor = accessor.front();
    while let Some(i) = cursor {
        let expiry = intrusive_list::CellLike::get(&accessor.pool()[i].expiry, accessor.cell_key());
        if time_before(at, expiry) {
            insert_at = Some(i);
            break;
        }
        cursor = accessor.next(i);
    }
    accessor.insert(ev, insert_at);
}

/// Unregister `ev`. No-op if it is not registered.
pub(crate) fn remove<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    ev: TimerEventRef<Traits>,
) {
    timer_list!(&Traits::state().timer_queue, lock.borrow_mut()).remove(ev);
}

/// The tick interrupt handler. Must be called from the system tick ISR.
///
/// Advances the tick counter, charges the running thread's run time,
/// performs the round-robin rotation when the current slice has elapsed,
/// wakes the timer thread when the head of the timer queue is due, and
/// requests a dispatch.
pub fn tick_handler<Traits: KernelTraits>() {
    let mut lock = match klock::lock_cpu::<Traits>() {
        Ok(lock) => lock,
        Err(_) => return,
    };
    let st = Traits::state();

    let now = st.tick.get(&*lock).wrapping_add(1);
    st.tick.replace(&mut *lock, now);

    match st.state.get(&*lock) {
        kernel::State::Running | kernel::State::Locked => {}
        _ => return,
    }

    if let Some(curr) = st.run.get(&*lock).current {
        curr.0
            .run_time
            .replace_with(&mut *lock, |t| t.wrapping_add(1));

        // Round-robin among equal-priority threads, when enabled for this
        // priority level.
        let pri = curr.0.priority.get(&*lock) as usize;
        let slice = st.rr_slice.read(&*lock)[pri];
        if slice != 0 {
            let count = curr.0.slice_count.get(&*lock) + 1;
            if count >= slice {
                curr.0.slice_count.replace(&mut *lock, 0);
                if st.ready.has_multiple(lock.borrow_mut(), pri) {
                    st.ready.rotate(lock.borrow_mut(), curr);
                }
            } else {
                curr.0.slice_count.replace(&mut *lock, count);
            }
        }
    }

    // Wake the timer thread when the head of the timer queue is due.
    let head_due = {
        let accessor = timer_list!(&st.timer_queue, lock.borrow_mut());
        match accessor.front() {
            Some(i) => {
                let expiry = intrusive_list::CellLike::get(&accessor.pool()[i].expiry, accessor.cell_key());
                time_before_eq(expiry, now)
            }
            None => false,
        }
    };
    if head_due {
        st.timer_semaphore.release_from_tick(lock.borrow_mut());
    }

    thread::reschedule(lock.borrow_mut());
}

/// The timer thread's body: wait on the timer semaphore, then drain every
/// due event, invoking each callback outside the critical section.
pub(crate) fn timer_thread_body<Traits: KernelTraits>(_: usize) {
    loop {
        let _ = Traits::state().timer_semaphore.acquire(Timeout::Forever);
        process_expired::<Traits>();
    }
}

pub(crate) fn process_expired<Traits: KernelTraits>() {
    loop {
        let mut lock = match klock::lock_cpu::<Traits>() {
            Ok(lock) => lock,
            Err(_) => return,
        };
        let st = Traits::state();
        let now = st.tick.get(&*lock);

        // Detach the head if it is due. The event is off the queue before
        // the lock is dropped, so a racing completion path sees it as
        // already fired.
        let callback = {
            let mut accessor = timer_list!(&st.timer_queue, lock.borrow_mut());
            match accessor.front() {
                Some(i) => {
                    let expiry = intrusive_list::CellLike::get(&accessor.pool()[i].expiry, accessor.cell_key());
                    if time_before(now, expiry) {
                        None
                    } else {
                        accessor.remove(i);
                        intrusive_list::CellLike::get(&accessor.pool()[i].callback, accessor.cell_key())
                    }
                }
                None => None,
            }
        };

        match callback {
            Some(cb) => {
                drop(lock);
                (cb.func)(cb.arg);
            }
            None => return,
        }
    }
}

// Alarms
// ---------------------------------------------------------------------------

/// One-shot timer: fires once, `delay` ticks after `start`. The handler
/// runs in the timer thread.
pub struct AlarmCb<Traits: PortThreading> {
    ident: CpuLockCell<Traits, ObjectId>,
    event: TimerEvent<Traits>,
    handler: CpuLockCell<Traits, Option<TimerCallback>>,
    active: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Init for AlarmCb<Traits> {
    const INIT: Self = Self {
        ident: Init::INIT,
        event: Init::INIT,
        handler: Init::INIT,
        active: Init::INIT,
    };
}

impl<Traits: PortThreading> AlarmCb<Traits> {
    /// Construct the constant initial value for a `static`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> AlarmCb<Traits> {
    /// Initialize the alarm in the caller-supplied control block.
    pub fn create(&'static self, handler: fn(usize), arg: usize) -> Result<(), CreateError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::INVALID {
            return Err(CreateError::WrongParam);
        }

        self.handler
            .replace(&mut *lock, Some(TimerCallback { func: handler, arg }));
        self.active.replace(&mut *lock, false);
        self.ident.replace(&mut *lock, ObjectId::ALARM);
        Ok(())
    }

    /// Arm the alarm to fire `delay` ticks from now. Re-arming an active
    /// alarm restarts it.
    pub fn start(&'static self, delay: Ticks) -> Result<(), TimerOpError> {
        if delay == 0 {
            return Err(TimerOpError::WrongParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::ALARM {
            return Err(TimerOpError::NoExist);
        }

        if self.active.get(&*lock) {
            remove(lock.borrow_mut(), Ident(&self.event));
        }

        let now = Traits::state().tick.get(&*lock);
        insert(
            lock.borrow_mut(),
            Ident(&self.event),
            now.wrapping_add(delay),
            alarm_expired::<Traits>,
            self as *const Self as usize,
        );
        self.active.replace(&mut *lock, true);
        Ok(())
    }

    /// Disarm the alarm.
    pub fn stop(&'static self) -> Result<(), TimerOpError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::ALARM {
            return Err(TimerOpError::NoExist);
        }

        if self.active.get(&*lock) {
            remove(lock.borrow_mut(), Ident(&self.event));
            self.active.replace(&mut *lock, false);
        }
        Ok(())
    }

    /// Delete the alarm; the storage returns to the caller.
    pub fn delete(&'static self) -> Result<(), DeleteError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::ALARM {
            return Err(DeleteError::NoExist);
        }

        if self.active.get(&*lock) {
            remove(lock.borrow_mut(), Ident(&self.event));
        }
        self.handler.replace(&mut *lock, None);
        self.active.replace(&mut *lock, false);
        self.ident.replace(&mut *lock, ObjectId::INVALID);
        Ok(())
    }

    /// Is the alarm currently armed?
    pub fn is_active(&'static self) -> Result<bool, TimerOpError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::ALARM {
            return Err(TimerOpError::NoExist);
        }
        Ok(self.active.get(&*lock))
    }
}

fn alarm_expired<Traits: KernelTraits>(arg: usize) {
    // Safety: the argument was produced from `&'static Self` by `start`
    let alarm = unsafe { &*(arg as *const AlarmCb<Traits>) };

    let handler = {
        let mut lock = match klock::lock_cpu::<Traits>() {
            Ok(lock) => lock,
            Err(_) => return,
        };
        if alarm.ident.get(&*lock) != ObjectId::ALARM {
            return;
        }
        alarm.active.replace(&mut *lock, false);
        alarm.handler.get(&*lock)
    };

    if let Some(h) = handler {
        (h.func)(h.arg);
    }
}

// Cyclic timers
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    /// Options for `CyclicCb::create`.
    pub struct CyclicOptions: u8 {
        /// Start the timer immediately on creation.
        const START = 1 << 0;
        /// Preserve the initial phase across stop/start: restarting
        /// continues the original expiry grid instead of rebasing on the
        /// current time.
        const PHASE = 1 << 1;
    }
}

/// Periodic timer. On every expiry the next one is scheduled at
/// `last_expiry + period`, catching up by whole periods if processing
/// lagged behind, then the handler runs in the timer thread.
pub struct CyclicCb<Traits: PortThreading> {
    ident: CpuLockCell<Traits, ObjectId>,
    event: TimerEvent<Traits>,
    handler: CpuLockCell<Traits, Option<TimerCallback>>,
    period: CpuLockCell<Traits, Ticks>,
    options: CpuLockCell<Traits, u8>,
    active: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Init for CyclicCb<Traits> {
    const INIT: Self = Self {
        ident: Init::INIT,
        event: Init::INIT,
        handler: Init::INIT,
        period: Init::INIT,
        options: Init::INIT,
        active: Init::INIT,
    };
}

impl<Traits: PortThreading> CyclicCb<Traits> {
    /// Construct the constant initial value for a `static`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> CyclicCb<Traits> {
    /// Initialize the cyclic timer. The first expiry is `phase` ticks from
    /// now; subsequent ones follow every `period` ticks.
    pub fn create(
        &'static self,
        handler: fn(usize),
        arg: usize,
        period: Ticks,
        phase: Ticks,
        options: CyclicOptions,
    ) -> Result<(), CreateError> {
        kernel::expect_thread_context::<Traits>()?;
        if period == 0 {
            return Err(CreateError::WrongParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::INVALID {
            return Err(CreateError::WrongParam);
        }

        self.handler
            .replace(&mut *lock, Some(TimerCallback { func: handler, arg }));
        self.period.replace(&mut *lock, period);
        self.options.replace(&mut *lock, options.bits());
        self.ident.replace(&mut *lock, ObjectId::CYCLIC);

        let first = Traits::state().tick.get(&*lock).wrapping_add(phase);
        if options.contains(CyclicOptions::START) {
            self.active.replace(&mut *lock, true);
            insert(
                lock.borrow_mut(),
                Ident(&self.event),
                first,
                cyclic_expired::<Traits>,
                self as *const Self as usize,
            );
        } else {
            self.active.replace(&mut *lock, false);
            // Remember the phase origin for a later `start`.
            self.event.expiry.replace(&mut *lock, first);
        }
        Ok(())
    }

    /// Start the timer.
    pub fn start(&'static self) -> Result<(), TimerOpError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::CYCLIC {
            return Err(TimerOpError::NoExist);
        }

        let now = Traits::state().tick.get(&*lock);
        let options = CyclicOptions::from_bits_truncate(self.options.get(&*lock));

        if options.contains(CyclicOptions::PHASE) {
            if !self.active.get(&*lock) {
                let mut at = self.event.expiry.get(&*lock);
                if time_before_eq(at, now) {
                    at = self.next_time(lock.borrow_mut(), now);
                }
                insert(
                    lock.borrow_mut(),
                    Ident(&self.event),
                    at,
                    cyclic_expired::<Traits>,
                    self as *const Self as usize,
                );
            }
        } else {
            if self.active.get(&*lock) {
                remove(lock.borrow_mut(), Ident(&self.event));
            }
            let at = now.wrapping_add(self.period.get(&*lock));
            insert(
                lock.borrow_mut(),
                Ident(&self.event),
                at,
                cyclic_expired::<Traits>,
                self as *const Self as usize,
            );
        }
        self.active.replace(&mut *lock, true);
        Ok(())
    }

    /// Stop the timer.
    pub fn stop(&'static self) -> Result<(), TimerOpError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::CYCLIC {
            return Err(TimerOpError::NoExist);
        }

        if self.active.get(&*lock) {
            remove(lock.borrow_mut(), Ident(&self.event));
            self.active.replace(&mut *lock, false);
        }
        Ok(())
    }

    /// Delete the timer; the storage returns to the caller.
    pub fn delete(&'static self) -> Result<(), DeleteError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::CYCLIC {
            return Err(DeleteError::NoExist);
        }

        if self.active.get(&*lock) {
            remove(lock.borrow_mut(), Ident(&self.event));
        }
        self.handler.replace(&mut *lock, None);
        self.active.replace(&mut *lock, false);
        self.ident.replace(&mut *lock, ObjectId::INVALID);
        Ok(())
    }

    /// Is the timer currently running?
    pub fn is_active(&'static self) -> Result<bool, TimerOpError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::CYCLIC {
            return Err(TimerOpError::NoExist);
        }
        Ok(self.active.get(&*lock))
    }

    /// The earliest future point on the timer's expiry grid, catching up
    /// by whole periods when processing lagged more than one period.
    fn next_time(&'static self, lock: CpuLockTokenRefMut<'_, Traits>, now: Ticks) -> Ticks {
        let period = self.period.get(&*lock);
        let last = self.event.expiry.get(&*lock);
        let mut at = last.wrapping_add(period);

        if time_before_eq(at, now) {
            let behind = now.wrapping_sub(last);
            let n = behind / period + 1;
            at = last.wrapping_add(n.wrapping_mul(period));
        }
        at
    }
}

fn cyclic_expired<Traits: KernelTraits>(arg: usize) {
    // Safety: the argument was produced from `&'static Self` by `create` /
    // `start`
    let cyclic = unsafe { &*(arg as *const CyclicCb<Traits>) };

    let handler = {
        let mut lock = match klock::lock_cpu::<Traits>() {
            Ok(lock) => lock,
            Err(_) => return,
        };
        if cyclic.ident.get(&*lock) != ObjectId::CYCLIC || !cyclic.active.get(&*lock) {
            return;
        }

        let now = Traits::state().tick.get(&*lock);
        let at = cyclic.next_time(lock.borrow_mut(), now);
        insert(
            lock.borrow_mut(),
            Ident(&cyclic.event),
            at,
            cyclic_expired::<Traits>,
            arg,
        );

        cyclic.handler.get(&*lock)
    };

    if let Some(h) = handler {
        (h.func)(h.arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_port::{self, define_test_kernel};
    use crate::thread::{self, ThreadCb, ThreadOptions};
    use crate::{kernel, KernelCfg2};
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn bump(arg: usize) {
        // Safety: the argument is the address of an `AtomicUsize` owned by
        // the test
        unsafe { &*(arg as *const AtomicUsize) }.fetch_add(1, Ordering::SeqCst);
    }

    fn tick_and_drain<Traits: crate::KernelTraits>(n: usize) {
        for _ in 0..n {
            tick_handler::<Traits>();
            process_expired::<Traits>();
        }
    }

    #[test]
    fn timer_queue_stays_sorted() {
        define_test_kernel!(Sys);
        test_port::boot::<Sys>();

        let e1: &'static TimerEvent<Sys> = Box::leak(Box::new(TimerEvent::INIT));
        let e2: &'static TimerEvent<Sys> = Box::leak(Box::new(TimerEvent::INIT));
        let e3: &'static TimerEvent<Sys> = Box::leak(Box::new(TimerEvent::INIT));
        let e4: &'static TimerEvent<Sys> = Box::leak(Box::new(TimerEvent::INIT));

        let mut lock = klock::lock_cpu::<Sys>().unwrap();
        insert(lock.borrow_mut(), Ident(e1), 30, |_| {}, 0);
        insert(lock.borrow_mut(), Ident(e2), 10, |_| {}, 0);
        insert(lock.borrow_mut(), Ident(e3), 20, |_| {}, 0);
        // FIFO among equal expiries
        insert(lock.borrow_mut(), Ident(e4), 10, |_| {}, 0);

        let order: Vec<u32> = {
            let accessor =
                timer_list!(&<Sys as KernelCfg2>::state().timer_queue, lock.borrow_mut());
            accessor
                .iter()
                .map(|i| intrusive_list::CellLike::get(&accessor.pool()[i].expiry, accessor.cell_key()))
                .collect()
        };
        assert_eq!(order, [10, 10, 20, 30]);

        let second_at_10 = {
            let accessor =
                timer_list!(&<Sys as KernelCfg2>::state().timer_queue, lock.borrow_mut());
            let first = accessor.front().unwrap();
            accessor.next(first).unwrap()
        };
        assert!(core::ptr::eq(second_at_10.0, e4));

        remove(lock.borrow_mut(), Ident(e2));
        remove(lock.borrow_mut(), Ident(e4));
        remove(lock.borrow_mut(), Ident(e3));
        remove(lock.borrow_mut(), Ident(e1));
        // Removing an unregistered event is a no-op
        remove(lock.borrow_mut(), Ident(e1));
    }

    #[test]
    fn tick_wakes_timer_thread_when_head_is_due() {
        define_test_kernel!(Sys);
        test_port::boot::<Sys>();
        test_port::park_timer_thread::<Sys>();

        let ev: &'static TimerEvent<Sys> = Box::leak(Box::new(TimerEvent::INIT));
        {
            let mut lock = klock::lock_cpu::<Sys>().unwrap();
            insert(lock.borrow_mut(), Ident(ev), 2, |_| {}, 0);
        }

        tick_handler::<Sys>();
        assert_eq!(
            <Sys as KernelCfg2>::state().timer_semaphore.count().unwrap(),
            0
        );
        tick_handler::<Sys>();
        assert_eq!(
            <Sys as KernelCfg2>::state().timer_semaphore.count().unwrap(),
            1
        );
    }

    #[test]
    fn alarm_fires_once_at_deadline() {
        define_test_kernel!(Sys);
        static ALARM: AlarmCb<Sys> = AlarmCb::new();
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        test_port::boot::<Sys>();
        test_port::park_timer_thread::<Sys>();

        ALARM.create(bump, &FIRED as *const _ as usize).unwrap();
        assert_eq!(ALARM.start(0), Err(TimerOpError::WrongParam));
        ALARM.start(3).unwrap();
        assert!(ALARM.is_active().unwrap());

        tick_and_drain::<Sys>(2);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        tick_and_drain::<Sys>(1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert!(!ALARM.is_active().unwrap());

        // One-shot: later ticks do nothing
        tick_and_drain::<Sys>(5);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn alarm_stop_and_restart() {
        define_test_kernel!(Sys);
        static ALARM: AlarmCb<Sys> = AlarmCb::new();
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        test_port::boot::<Sys>();
        test_port::park_timer_thread::<Sys>();

        ALARM.create(bump, &FIRED as *const _ as usize).unwrap();
        ALARM.start(2).unwrap();
        ALARM.stop().unwrap();

        tick_and_drain::<Sys>(4);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        // Restarting rebases the deadline
        ALARM.start(2).unwrap();
        tick_and_drain::<Sys>(1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        tick_and_drain::<Sys>(1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        ALARM.delete().unwrap();
        assert_eq!(ALARM.start(1), Err(TimerOpError::NoExist));
    }

    /// A cyclic timer whose first expiry is "now + 0" fires on the next
    /// tick, never synchronously from `create`.
    #[test]
    fn cyclic_with_zero_phase_fires_on_next_tick() {
        define_test_kernel!(Sys);
        static CYC: CyclicCb<Sys> = CyclicCb::new();
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        test_port::boot::<Sys>();
        test_port::park_timer_thread::<Sys>();

        CYC.create(bump, &FIRED as *const _ as usize, 10, 0, CyclicOptions::START)
            .unwrap();
        // Nothing fires from the scheduling call itself
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        tick_and_drain::<Sys>(1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cyclic_catches_up_by_whole_periods() {
        define_test_kernel!(Sys);
        static CYC: CyclicCb<Sys> = CyclicCb::new();
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        test_port::boot::<Sys>();
        test_port::park_timer_thread::<Sys>();

        CYC.create(bump, &FIRED as *const _ as usize, 10, 0, CyclicOptions::START)
            .unwrap();

        tick_and_drain::<Sys>(1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        // Let two whole periods pass without draining the queue
        for _ in 0..25 {
            tick_handler::<Sys>();
        }
        process_expired::<Sys>();
        // One lagging expiry is delivered; the grid then continues at
        // tick 30 rather than 26 + 10
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
        tick_and_drain::<Sys>(3);
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
        tick_and_drain::<Sys>(1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 3);

        CYC.stop().unwrap();
        tick_and_drain::<Sys>(20);
        assert_eq!(FIRED.load(Ordering::SeqCst), 3);
    }

    /// Spec scenario: three equal-priority threads with a 10-tick slice
    /// each receive exactly 20 of 60 ticks, in strict rotation.
    #[test]
    fn round_robin_shares_the_priority_level() {
        define_test_kernel!(Sys);
        static A: ThreadCb<Sys> = ThreadCb::new();
        static B: ThreadCb<Sys> = ThreadCb::new();
        static C: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();

        for (t, name) in [(&A, "a"), (&B, "b"), (&C, "c")] {
            thread::create::<Sys>(
                t,
                Some(name),
                test_port::noop_entry,
                0,
                test_port::test_stack(),
                5,
                ThreadOptions::START_ON_CREATE,
            )
            .unwrap();
        }
        kernel::set_round_robin::<Sys>(5, 10).unwrap();
        test_port::park_timer_thread::<Sys>();
        assert!(core::ptr::eq(test_port::current::<Sys>(), &A));

        let mut order = Vec::new();
        for _ in 0..60 {
            tick_handler::<Sys>();
            test_port::commit_switch::<Sys>();
            let curr = test_port::current::<Sys>();
            if order.last() != Some(&(curr as *const _)) {
                order.push(curr as *const _);
            }
        }

        assert_eq!(thread::run_time::<Sys>(&A).unwrap(), 20);
        assert_eq!(thread::run_time::<Sys>(&B).unwrap(), 20);
        assert_eq!(thread::run_time::<Sys>(&C).unwrap(), 20);
        // Strict rotation; the 60th tick closes C's slice and hands the
        // level back to A
        assert_eq!(
            order,
            [
                &A as *const ThreadCb<Sys>,
                &B as *const _,
                &C as *const _,
                &A as *const _,
                &B as *const _,
                &C as *const _,
                &A as *const _,
            ]
        );
    }
}
