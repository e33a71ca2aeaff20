//! A simulated port for unit tests.
//!
//! CPU Lock is a process-local flag, context-switch requests are counted,
//! and `commit_switch` plays the role of the hardware dispatcher by
//! committing `run.next` to `run.current`. Each test defines its own
//! system type with [`define_test_kernel!`], giving it private kernel
//! state, so tests can run in parallel.
use crate::{
    kernel, klock,
    thread::{ThreadCb, ThreadState},
    utils::intrusive_list::Ident,
    KernelTraits, Stack,
};

/// Declare a fresh system type with its own kernel state, CPU Lock flag,
/// and switch-request counter. Meant to be invoked inside a test function.
macro_rules! define_test_kernel {
    ($Sys:ident) => {
        struct $Sys;

        static KERNEL_STATE: $crate::kernel::KernelState<$Sys> =
            $crate::kernel::KernelState::new();
        static CPU_LOCK: core::sync::atomic::AtomicBool =
            core::sync::atomic::AtomicBool::new(false);
        static SWITCH_REQUESTS: core::sync::atomic::AtomicUsize =
            core::sync::atomic::AtomicUsize::new(0);
        static IN_ISR: core::sync::atomic::AtomicBool =
            core::sync::atomic::AtomicBool::new(false);
        static mut TIMER_STACK_MEM: [u32; 64] = [0; 64];
        static mut IDLE_STACK_MEM: [u32; 64] = [0; 64];

        unsafe impl $crate::KernelCfg1 for $Sys {
            const CONFIG: $crate::Config = $crate::Config::new();
        }

        unsafe impl $crate::PortThreading for $Sys {
            type PortThreadState = ();

            unsafe fn enter_cpu_lock() {
                let was = CPU_LOCK.swap(true, core::sync::atomic::Ordering::SeqCst);
                assert!(!was, "CPU Lock was already active");
            }

            unsafe fn leave_cpu_lock() {
                let was = CPU_LOCK.swap(false, core::sync::atomic::Ordering::SeqCst);
                assert!(was, "CPU Lock was not active");
            }

            fn is_cpu_lock_active() -> bool {
                CPU_LOCK.load(core::sync::atomic::Ordering::SeqCst)
            }

            fn is_interrupt_context() -> bool {
                IN_ISR.load(core::sync::atomic::Ordering::SeqCst)
            }

            unsafe fn request_context_switch() {
                SWITCH_REQUESTS.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
            }

            unsafe fn initialize_stack(
                _thread: &'static $crate::ThreadCb<Self>,
                _stack: $crate::Stack,
                _entry: fn(usize),
                _arg: usize,
            ) {
            }

            unsafe fn dispatch_first_thread() -> ! {
                unreachable!("the test port cannot dispatch")
            }

            unsafe fn exit_and_dispatch(_thread: &'static $crate::ThreadCb<Self>) -> ! {
                unreachable!("the test port cannot dispatch")
            }
        }

        unsafe impl $crate::KernelCfg2 for $Sys {
            fn state() -> &'static $crate::KernelState<$Sys> {
                &KERNEL_STATE
            }

            fn timer_stack() -> $crate::Stack {
                unsafe {
                    $crate::Stack::from_raw_parts(
                        core::ptr::addr_of_mut!(TIMER_STACK_MEM) as *mut u32,
                        64,
                    )
                }
            }

            fn idle_stack() -> $crate::Stack {
                unsafe {
                    $crate::Stack::from_raw_parts(
                        core::ptr::addr_of_mut!(IDLE_STACK_MEM) as *mut u32,
                        64,
                    )
                }
            }
        }

        #[allow(dead_code)]
        fn switch_requests() -> usize {
            SWITCH_REQUESTS.load(core::sync::atomic::Ordering::SeqCst)
        }

        #[allow(dead_code)]
        fn enter_isr() {
            IN_ISR.store(true, core::sync::atomic::Ordering::SeqCst);
        }

        #[allow(dead_code)]
        fn leave_isr() {
            IN_ISR.store(false, core::sync::atomic::Ordering::SeqCst);
        }
    };
}

pub(crate) use define_test_kernel;

/// Initialize and "start" the kernel without dispatching: the system
/// threads are created and the scheduler is left in the `Running` state
/// with the timer thread elected.
pub(crate) fn boot<Traits: KernelTraits>() {
    kernel::initialize::<Traits>().unwrap();
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    kernel::start_core(lock.borrow_mut()).unwrap();
}

/// Play the port's context-switch handler: commit `next` to `current`.
pub(crate) fn commit_switch<Traits: KernelTraits>() {
    unsafe {
        Traits::enter_cpu_lock();
        let _ = kernel::exchange_running_thread::<Traits>();
        Traits::leave_cpu_lock();
    }
}

/// Allocate a stack for a test thread.
pub(crate) fn test_stack() -> Stack {
    let mem = Box::leak(Box::new([0u32; 64]));
    unsafe { Stack::from_raw_parts(mem.as_mut_ptr(), mem.len()) }
}

/// A do-nothing thread entry point.
pub(crate) fn noop_entry(_: usize) {}

/// The thread the scheduler currently considers running.
pub(crate) fn current<Traits: KernelTraits>() -> &'static ThreadCb<Traits> {
    kernel::current_thread::<Traits>().unwrap().unwrap()
}

/// Force the `(current, next)` pair onto a Ready thread, bypassing the
/// election. Used to stage a scenario's starting point.
pub(crate) fn force_run<Traits: KernelTraits>(t: &'static ThreadCb<Traits>) {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let st = Traits::state();

    let mut run = st.run.get(&*lock);
    if let Some(old) = run.next {
        if old.0.state.get(&*lock).contains(ThreadState::RUNNING) {
            old.0.state.replace(&mut *lock, ThreadState::READY);
        }
    }
    t.state.replace(&mut *lock, ThreadState::RUNNING);
    run.current = Some(Ident(t));
    run.next = Some(Ident(t));
    st.run.replace(&mut *lock, run);
}

/// Suspend the timer thread `boot` left running, and commit the resulting
/// switch, so application threads can be elected.
pub(crate) fn park_timer_thread<Traits: KernelTraits>() {
    crate::thread::suspend(&Traits::state().timer_thread).unwrap();
    commit_switch::<Traits>();
}

/// Read back a thread's wait-result slot.
pub(crate) fn wait_result<Traits: KernelTraits>(
    t: &'static ThreadCb<Traits>,
) -> Result<crate::wait::WaitValue, crate::error::WaitError> {
    let lock = klock::lock_cpu::<Traits>().unwrap();
    t.wait.result.get(&*lock)
}
