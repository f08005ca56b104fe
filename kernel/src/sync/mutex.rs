//! Guest mutexes with priority inheritance.
//!
//! A mutex boosts its holder to the best priority among the threads blocked on it. Boosts
//! propagate along `pending_mutexes`: when a boosted holder is itself waiting on another mutex,
//! that mutex's holder is boosted too.
//!
//! Relocking a mutex the caller already holds is governed by `MutexRecursion`. With `Recursive`
//! (the default) it bumps the lock count and each lock needs its own release. With `Reject` the
//! wait fails with `InvalidCombination` and nothing changes.

use log::debug;

use crate::errors::{KernelError, KResult};
use crate::object::{ObjectId, ProcessId, ThreadId};
use crate::process::LimitCategory;
use crate::scheduler::THREADPRIO_LOWEST;
use crate::wait::WaitQueue;
use crate::Kernel;

pub struct KMutex {
    pub lock_count: u32,
    pub holding_thread: Option<ThreadId>,
    /// Best priority among the waiters, lent to the holder.
    pub priority: u32,
    pub name: String,
    pub waiters: WaitQueue,
}

impl KMutex {
    pub fn new(name: String) -> KMutex {
        KMutex {
            lock_count: 0,
            holding_thread: None,
            priority: THREADPRIO_LOWEST,
            name,
            waiters: WaitQueue::new(),
        }
    }
}

impl Kernel {
    pub fn create_mutex(&mut self, owner: ProcessId, locked_by: Option<ThreadId>) -> KResult<ObjectId> {
        let charge = self.reserve_charge(owner, LimitCategory::Mutex)?;
        let mutex = self.objects.insert_charged(KMutex::new(String::from("Mutex")), Some(charge));
        if let Some(tid) = locked_by {
            self.mutex_acquire(mutex, tid);
        }
        Ok(mutex)
    }

    pub(crate) fn mutex_acquire(&mut self, mutex: ObjectId, tid: ThreadId) {
        let first_lock = {
            let data = self.objects.get_mut::<KMutex>(mutex).expect("Acquiring a mutex that does not exist");
            data.lock_count += 1;
            if data.lock_count == 1 {
                data.holding_thread = Some(tid);
                true
            } else {
                debug_assert_eq!(data.holding_thread, Some(tid));
                false
            }
        };

        if first_lock {
            self.thread_mut(tid).held_mutexes.push(mutex);
            self.update_mutex_priority(mutex);
            self.update_thread_priority(tid);
        }
    }

    /// Releases one lock level. Only the holder may release.
    pub fn release_mutex(&mut self, tid: ThreadId, mutex: ObjectId) -> KResult<()> {
        let data = self.objects.get_mut::<KMutex>(mutex).ok_or(KernelError::InvalidHandle)?;
        if data.lock_count == 0 || data.holding_thread != Some(tid) {
            return Err(KernelError::PermissionDenied)
        }

        data.lock_count -= 1;
        if data.lock_count == 0 {
            self.mutex_force_release(mutex);
        }
        Ok(())
    }

    /// Drops ownership regardless of the lock count and hands the mutex to the best waiter.
    pub(crate) fn mutex_force_release(&mut self, mutex: ObjectId) {
        let holder = match self.objects.get_mut::<KMutex>(mutex) {
            Some(data) => {
                data.lock_count = 0;
                data.holding_thread.take()
            },
            None => return,
        };

        if let Some(holder) = holder {
            if let Some(thread) = self.objects.get_mut::<crate::thread::KThread>(holder) {
                thread.held_mutexes.retain(|m| *m != mutex);
            }
            self.update_thread_priority(holder);
        }

        self.wakeup_all_waiting_threads(mutex);
    }

    pub(crate) fn release_thread_mutexes(&mut self, tid: ThreadId) {
        let held = std::mem::take(&mut self.thread_mut(tid).held_mutexes);
        for mutex in held {
            debug!("{:?} dies holding {:?}", tid, mutex);
            self.mutex_force_release(mutex);
        }
    }

    pub(crate) fn update_mutex_priority(&mut self, mutex: ObjectId) {
        let (holder, best) = match self.objects.get::<KMutex>(mutex) {
            Some(data) => {
                let holder = data.holding_thread;
                let best = data.waiters.iter()
                    .filter(|tid| Some(*tid) != holder)
                    .filter_map(|tid| self.try_thread(tid))
                    .map(|thread| thread.current_priority)
                    .min()
                    .unwrap_or(THREADPRIO_LOWEST);
                if best == data.priority {
                    return
                }
                (holder, best)
            },
            None => return,
        };

        if let Some(data) = self.objects.get_mut::<KMutex>(mutex) {
            data.priority = best;
        }
        if let Some(holder) = holder {
            self.update_thread_priority(holder);
        }
    }

    /// Recomputes a thread's effective priority from its nominal priority and held mutexes.
    pub(crate) fn update_thread_priority(&mut self, tid: ThreadId) {
        let thread = match self.try_thread(tid) {
            Some(thread) => thread,
            None => return,
        };

        let best = thread.held_mutexes.iter()
            .filter_map(|mutex| self.objects.get::<KMutex>(*mutex))
            .map(|mutex| mutex.priority)
            .fold(thread.nominal_priority, u32::min);

        if best == thread.current_priority {
            return
        }

        debug!("{:?} priority {} -> {}", tid, thread.current_priority, best);
        let pending = thread.pending_mutexes.clone();
        self.set_current_priority(tid, best);
        for mutex in pending {
            self.update_mutex_priority(mutex);
        }
    }
}
