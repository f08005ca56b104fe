//! WaitSynchronization and the wake-up protocol shared by every waitable object.

use log::trace;

use crate::config::MutexRecursion;
use crate::errors::{KernelError, KResult};
use crate::object::{KObject, ObjectId, ObjectKind, ThreadId};
use crate::process::ProcessStatus;
use crate::thread::{ThreadResume, ThreadStatus};
use crate::timing::ns_to_cycles;
use crate::Kernel;

/// Threads blocked on an object, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct WaitQueue(Vec<ThreadId>);

impl WaitQueue {
    pub fn new() -> WaitQueue {
        WaitQueue(vec![])
    }

    pub fn add(&mut self, thread: ThreadId) {
        if !self.0.contains(&thread) {
            self.0.push(thread);
        }
    }

    pub fn remove(&mut self, thread: ThreadId) {
        self.0.retain(|t| *t != thread);
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.0.contains(&thread)
    }

    pub fn iter(&self) -> impl Iterator<Item=ThreadId> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Timeout {
    Instant, // ns == 0
    After(u64),
    Forever
}

impl Timeout {
    /// Guest timeouts are signed nanoseconds; negative means forever.
    pub fn from_ns(ns: i64) -> Timeout {
        if ns >= 0 {
            if ns == 0 {
                Timeout::Instant
            } else {
                Timeout::After(ns as u64)
            }
        } else {
            Timeout::Forever
        }
    }
}

/// Outcome of a syscall that may block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Finished without blocking. `index` is the signaled object for any-mode waits.
    Immediate {
        index: Option<usize>,
    },
    /// The thread is blocked; its result arrives through `ThreadResume`.
    Suspended,
}

impl Kernel {
    /// Whether `tid` would have to wait to acquire `object` right now.
    pub fn should_wait(&self, object: ObjectId, tid: ThreadId) -> bool {
        match self.objects.get_raw(object) {
            Some(KObject::Mutex(mutex)) => mutex.lock_count > 0 && mutex.holding_thread != Some(tid),
            Some(KObject::Semaphore(semaphore)) => semaphore.count <= 0,
            Some(KObject::Event(event)) => !event.signaled,
            Some(KObject::Timer(timer)) => !timer.signaled,
            Some(KObject::Thread(thread)) => thread.status != ThreadStatus::Dead,
            Some(KObject::Process(process)) => process.status != ProcessStatus::Exited,
            Some(KObject::ServerPort(port)) => port.pending_sessions.is_empty(),
            Some(KObject::ServerSession(session)) => {
                // A closed session never waits so the receiver can report the closure
                session.client.is_some() &&
                    (session.pending_requests.is_empty() || session.currently_handling.is_some())
            },
            Some(other) => panic!("should_wait on non-waitable {:?}", other),
            None => false,
        }
    }

    /// Takes ownership of one unit of `object` for `tid`. Only valid when `should_wait` is false.
    pub(crate) fn acquire(&mut self, object: ObjectId, tid: ThreadId) {
        match self.objects.kind(object) {
            Some(ObjectKind::Mutex) => self.mutex_acquire(object, tid),
            Some(ObjectKind::Semaphore) => {
                if let Some(semaphore) = self.objects.get_mut::<crate::sync::KSemaphore>(object) {
                    semaphore.count -= 1;
                }
            },
            Some(ObjectKind::Event) => {
                if let Some(event) = self.objects.get_mut::<crate::sync::KEvent>(object) {
                    if event.reset_type == crate::sync::ResetType::OneShot {
                        event.signaled = false;
                    }
                }
            },
            Some(ObjectKind::Timer) => {
                if let Some(timer) = self.objects.get_mut::<crate::sync::KTimer>(object) {
                    if timer.reset_type == crate::sync::ResetType::OneShot {
                        timer.signaled = false;
                    }
                }
            },
            Some(ObjectKind::ServerSession) => self.server_session_acquire(object),
            _ => {},
        }
    }

    pub(crate) fn add_waiting_thread(&mut self, object: ObjectId, tid: ThreadId) {
        if let Some(queue) = self.objects.get_raw_mut(object).and_then(KObject::wait_queue_mut) {
            queue.add(tid);
        }
        if self.objects.kind(object) == Some(ObjectKind::Mutex) {
            let thread = self.thread_mut(tid);
            if !thread.pending_mutexes.contains(&object) {
                thread.pending_mutexes.push(object);
            }
            self.update_mutex_priority(object);
        }
    }

    pub(crate) fn remove_waiting_thread(&mut self, object: ObjectId, tid: ThreadId) {
        if let Some(queue) = self.objects.get_raw_mut(object).and_then(KObject::wait_queue_mut) {
            queue.remove(tid);
        }
        if self.objects.kind(object) == Some(ObjectKind::Mutex) {
            if let Some(thread) = self.objects.get_mut::<crate::thread::KThread>(tid) {
                thread.pending_mutexes.retain(|m| *m != object);
            }
            self.update_mutex_priority(object);
        }
    }

    /// Blocks `tid` on a list of objects, or completes immediately if they are available.
    pub fn wait_synchronization(&mut self, tid: ThreadId, objects: &[ObjectId], wait_all: bool, timeout: Timeout) -> KResult<Completion> {
        for object in objects {
            match self.objects.kind(*object) {
                Some(kind) if kind.is_waitable() => {},
                _ => return Err(KernelError::InvalidHandle),
            }
        }

        if self.config.mutex_recursion == MutexRecursion::Reject {
            let relocking = objects.iter().any(|object| {
                matches!(self.objects.get::<crate::sync::KMutex>(*object),
                    Some(mutex) if mutex.lock_count > 0 && mutex.holding_thread == Some(tid))
            });
            if relocking {
                return Err(KernelError::InvalidCombination)
            }
        }

        if wait_all {
            if objects.iter().all(|object| !self.should_wait(*object, tid)) {
                for object in objects {
                    self.acquire(*object, tid);
                }
                return Ok(Completion::Immediate { index: None })
            }
        } else if let Some(index) = objects.iter().position(|object| !self.should_wait(*object, tid)) {
            self.acquire(objects[index], tid);
            return Ok(Completion::Immediate { index: Some(index) })
        }

        if timeout == Timeout::Instant {
            return Err(KernelError::Timeout)
        }

        let single_mutex = objects.len() == 1 && self.objects.kind(objects[0]) == Some(ObjectKind::Mutex);
        let status = if single_mutex {
            ThreadStatus::WaitMutex
        } else {
            ThreadStatus::WaitSynchronization { wait_all }
        };

        trace!("{:?} waits on {:?} (all: {}, {:?})", tid, objects, wait_all, timeout);

        self.suspend_thread(tid, status);
        self.thread_mut(tid).wait_objects = objects.to_vec();
        for object in objects {
            self.objects.retain(*object);
            self.add_waiting_thread(*object, tid);
        }
        self.schedule_wakeup(tid, timeout);

        Ok(Completion::Suspended)
    }

    /// The best waiter that could acquire `object` now: lowest priority value, then arrival order.
    fn next_eligible_waiter(&self, object: ObjectId) -> Option<ThreadId> {
        let queue = self.objects.get_raw(object)?.wait_queue()?;

        let mut best: Option<(u32, ThreadId)> = None;
        for tid in queue.iter() {
            let thread = match self.try_thread(tid) {
                Some(thread) => thread,
                None => continue,
            };

            let eligible = match thread.status {
                ThreadStatus::WaitSynchronization { wait_all: true } => {
                    thread.wait_objects.iter().all(|o| !self.should_wait(*o, tid))
                },
                ThreadStatus::WaitSynchronization { wait_all: false } | ThreadStatus::WaitMutex => {
                    !self.should_wait(object, tid)
                },
                _ => false,
            };

            if eligible && best.map_or(true, |(priority, _)| thread.current_priority < priority) {
                best = Some((thread.current_priority, tid));
            }
        }

        best.map(|(_, tid)| tid)
    }

    /// Hands `object` to eligible waiters until none remain.
    pub fn wakeup_all_waiting_threads(&mut self, object: ObjectId) {
        while let Some(tid) = self.next_eligible_waiter(object) {
            let thread = self.thread(tid);
            let wait_all = thread.status == ThreadStatus::WaitSynchronization { wait_all: true };
            let index = thread.wait_objects.iter().position(|o| *o == object);

            let resume = if wait_all {
                for o in thread.wait_objects.clone() {
                    self.acquire(o, tid);
                }
                ThreadResume::Signaled { index: None }
            } else {
                self.acquire(object, tid);
                ThreadResume::Signaled { index }
            };

            trace!("{:?} woken by {:?}", tid, object);
            self.resume_from_wait(tid, resume);
        }
    }

    /// Detaches a blocked thread from everything it waits on and makes it ready.
    pub(crate) fn resume_from_wait(&mut self, tid: ThreadId, resume: ThreadResume) {
        let objects = std::mem::take(&mut self.thread_mut(tid).wait_objects);
        for object in objects {
            self.remove_waiting_thread(object, tid);
            self.release_object(object);
        }

        self.cancel_wakeup(tid);

        let thread = self.thread_mut(tid);
        let resume = thread.deferred_resume.take().unwrap_or(resume);
        thread.resume = Some(resume);
        self.make_ready(tid);
    }

    pub(crate) fn schedule_wakeup(&mut self, tid: ThreadId, timeout: Timeout) {
        if let Timeout::After(ns) = timeout {
            let event = self.thread_wakeup_event;
            self.timing.schedule_event(ns_to_cycles(ns), event, tid.raw() as u64);
        }
    }

    pub(crate) fn cancel_wakeup(&mut self, tid: ThreadId) {
        let event = self.thread_wakeup_event;
        self.timing.remove_event(event, tid.raw() as u64);
    }
}
