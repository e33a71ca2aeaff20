//! Thread ready set: per-priority queues segregated by effective priority,
//! plus a bitmap indexing the non-empty queues.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    thread::{ThreadCb, ThreadRef},
    utils::{
        intrusive_list::{ListAccessorCell, Static, StaticListHead},
        Init, PrioBitmap,
    },
    PortThreading, PRIORITY_LEVELS,
};

/// Get a `ListAccessorCell` used to access one ready queue.
macro_rules! ready_list {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new($head, &Static, |t: &ThreadCb<_>| &t.link, $key)
    };
}

/// The ready set.
///
/// Invariant: `queues[p]` is non-empty iff bit `p` of `bitmap` is set.
/// The running thread stays linked in its queue; `Running` is a state tag,
/// not a membership change.
pub(crate) struct ReadyQueue<Traits: PortThreading> {
    queues: [CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>; PRIORITY_LEVELS],
    bitmap: CpuLockCell<Traits, PrioBitmap>,
}

impl<Traits: PortThreading> Init for ReadyQueue<Traits> {
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

impl<Traits: PortThreading> ReadyQueue<Traits> {
    /// Append the thread to the queue for its current priority.
    pub(crate) fn push_back(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, t: ThreadRef<Traits>) {
        let pri = t.0.priority.get(&*lock) as usize;
        ready_list!(&self.queues[pri], lock.borrow_mut()).push_back(t);
        self.bitmap.write(&mut *lock).set(pri);
    }

    /// Remove the thread from the queue for its current priority. No-op if
    /// the thread is not linked.
    pub(crate) fn remove(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, t: ThreadRef<Traits>) {
        let pri = t.0.priority.get(&*lock) as usize;
        let now_empty = {
            let mut accessor = ready_list!(&self.queues[pri], lock.borrow_mut());
            if !accessor.remove(t) {
                return;
            }
            accessor.is_empty()
        };
        if now_empty {
            self.bitmap.write(&mut *lock).clear(pri);
        }
    }

    /// The head of the queue for the given priority level.
    pub(crate) fn front(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        pri: usize,
    ) -> Option<ThreadRef<Traits>> {
        ready_list!(&self.queues[pri], lock.borrow_mut()).front()
    }

    /// The head of the highest-priority non-empty queue: the thread that
    /// should run next.
    pub(crate) fn highest(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<ThreadRef<Traits>> {
        let pri = self.bitmap.read(&*lock).find_set()?;
        self.front(lock.borrow_mut(), pri)
    }

    /// Move the thread to the tail of its queue (yield / round-robin).
    pub(crate) fn rotate(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, t: ThreadRef<Traits>) {
        let pri = t.0.priority.get(&*lock) as usize;
        let mut accessor = ready_list!(&self.queues[pri], lock.borrow_mut());
        if accessor.remove(t) {
            accessor.push_back(t);
        }
    }

    /// Does the queue for the given priority hold more than one thread?
    pub(crate) fn has_multiple(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        pri: usize,
    ) -> bool {
        let accessor = ready_list!(&self.queues[pri], lock.borrow_mut());
        match (accessor.front(), accessor.back()) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }
}
