//! Condition variables paired with guest mutexes.
//!
//! A waiter gives up its mutex and blocks in WaitConditionVariable. When signaled or timed out it
//! must reacquire the mutex before it runs again; if the mutex is taken it moves to WaitMutex and
//! the result of the condition wait is carried in `deferred_resume` until the mutex is handed over.

use crate::errors::{KernelError, KResult};
use crate::object::{ObjectId, ProcessId, ThreadId};
use crate::sync::KMutex;
use crate::thread::{ThreadResume, ThreadStatus};
use crate::wait::{Completion, Timeout};
use crate::Kernel;

pub struct KConditionVariable {
    pub name: String,
    /// Blocked threads and the mutex each must reacquire, in arrival order.
    pub waiters: Vec<(ThreadId, ObjectId)>,
}

impl Kernel {
    pub fn create_condition_variable(&mut self, owner: ProcessId) -> KResult<ObjectId> {
        // Condition variables have no limit category but still need a live owner
        self.process(owner);
        Ok(self.objects.insert(KConditionVariable {
            name: String::from("ConditionVariable"),
            waiters: vec![],
        }))
    }

    pub fn condvar_wait(&mut self, tid: ThreadId, condvar: ObjectId, mutex: ObjectId, timeout: Timeout) -> KResult<Completion> {
        self.objects.get::<KConditionVariable>(condvar).ok_or(KernelError::InvalidHandle)?;
        let data = self.objects.get::<KMutex>(mutex).ok_or(KernelError::InvalidHandle)?;
        if data.holding_thread != Some(tid) {
            return Err(KernelError::PermissionDenied)
        }
        if data.lock_count != 1 {
            return Err(KernelError::InvalidCombination)
        }
        if timeout == Timeout::Instant {
            return Err(KernelError::Timeout)
        }

        self.suspend_thread(tid, ThreadStatus::WaitConditionVariable);
        self.mutex_force_release(mutex);

        self.objects.retain(condvar);
        self.objects.retain(mutex);
        self.thread_mut(tid).cv_wait = Some((condvar, mutex));
        if let Some(data) = self.objects.get_mut::<KConditionVariable>(condvar) {
            data.waiters.push((tid, mutex));
        }

        self.schedule_wakeup(tid, timeout);
        Ok(Completion::Suspended)
    }

    /// Wakes up to `count` waiters in priority order; a negative count wakes all of them.
    pub fn condvar_signal(&mut self, condvar: ObjectId, count: i32) -> KResult<()> {
        self.objects.get::<KConditionVariable>(condvar).ok_or(KernelError::InvalidHandle)?;

        let mut remaining = if count < 0 { usize::MAX } else { count as usize };
        while remaining > 0 {
            let next = match self.best_condvar_waiter(condvar) {
                Some(next) => next,
                None => break,
            };
            remaining -= 1;

            let (tid, mutex) = next;
            self.cancel_wakeup(tid);
            self.detach_condvar_waiter(tid);
            self.condvar_reacquire(tid, mutex, ThreadResume::Normal);
        }
        Ok(())
    }

    fn best_condvar_waiter(&self, condvar: ObjectId) -> Option<(ThreadId, ObjectId)> {
        let data = self.objects.get::<KConditionVariable>(condvar)?;
        let mut best: Option<(u32, (ThreadId, ObjectId))> = None;
        for (tid, mutex) in &data.waiters {
            let priority = self.thread(*tid).current_priority;
            if best.map_or(true, |(p, _)| priority < p) {
                best = Some((priority, (*tid, *mutex)));
            }
        }
        best.map(|(_, waiter)| waiter)
    }

    /// Unlinks a thread from its condition variable. The mutex reference is kept for the caller.
    fn detach_condvar_waiter(&mut self, tid: ThreadId) -> Option<ObjectId> {
        let (condvar, mutex) = self.thread_mut(tid).cv_wait.take()?;
        if let Some(data) = self.objects.get_mut::<KConditionVariable>(condvar) {
            data.waiters.retain(|(t, _)| *t != tid);
        }
        self.release_object(condvar);
        Some(mutex)
    }

    /// Takes the mutex for a thread leaving a condition wait, or queues it on the mutex.
    /// Consumes the thread's reference to `mutex`.
    fn condvar_reacquire(&mut self, tid: ThreadId, mutex: ObjectId, resume: ThreadResume) {
        if !self.should_wait(mutex, tid) {
            self.acquire(mutex, tid);
            self.release_object(mutex);
            self.thread_mut(tid).resume = Some(resume);
            self.make_ready(tid);
        } else {
            let thread = self.thread_mut(tid);
            thread.status = ThreadStatus::WaitMutex;
            thread.wait_objects = vec![mutex];
            thread.deferred_resume = Some(resume);
            self.add_waiting_thread(mutex, tid);
        }
    }

    pub(crate) fn condvar_timeout(&mut self, tid: ThreadId) {
        if let Some(mutex) = self.detach_condvar_waiter(tid) {
            self.condvar_reacquire(tid, mutex, ThreadResume::TimeoutReached);
        }
    }

    pub(crate) fn cancel_condvar_wait(&mut self, tid: ThreadId) {
        if let Some(mutex) = self.detach_condvar_waiter(tid) {
            self.release_object(mutex);
        }
    }
}
