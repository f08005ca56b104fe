use log::{debug, warn};

use crate::errors::{KernelError, KResult};
use crate::object::{ObjectId, ProcessId, ThreadId};
use crate::process::{LimitCategory, ProcessStatus};
use crate::scheduler::THREADPRIO_LOWEST;
use crate::wait::{Timeout, WaitQueue};
use crate::Kernel;

const CPSR_USER_MODE: u32 = 0b10000;
const CPSR_THUMB: u32 = 1 << 5;

/// Register snapshot of a thread that is not on the core.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuContext {
    pub r: [u32; 16],
    pub cpsr: u32,
    pub fpu: [u32; 64],
    pub fpscr: u32,
}

impl CpuContext {
    pub fn zero() -> CpuContext {
        CpuContext {
            r: [0; 16],
            cpsr: 0,
            fpu: [0; 64],
            fpscr: 0,
        }
    }

    pub fn pc(&self) -> u32 {
        self.r[15]
    }

    pub fn sp(&self) -> u32 {
        self.r[13]
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        CpuContext::zero()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Ready,
    WaitSynchronization { wait_all: bool },
    WaitMutex,
    WaitArbiter,
    WaitIpc,
    WaitConditionVariable,
    Sleeping,
    Dormant,
    Dead,
}

impl ThreadStatus {
    pub fn is_waiting(self) -> bool {
        matches!(self,
            ThreadStatus::WaitSynchronization { .. } |
            ThreadStatus::WaitMutex |
            ThreadStatus::WaitArbiter |
            ThreadStatus::WaitIpc |
            ThreadStatus::WaitConditionVariable |
            ThreadStatus::Sleeping
        )
    }
}

/// What a blocked syscall returns once the thread runs again.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadResume {
    Normal,
    Signaled {
        index: Option<usize>,
    },
    TimeoutReached,
    Error {
        result: KernelError,
        index: Option<usize>,
    },
}

pub struct ThreadInitializer {
    pub name: String,
    pub entrypoint: u32,
    pub stack_top: u32,
    pub arg: u32,
    pub priority: u32,
    pub processor_id: i32,
}

pub struct KThread {
    pub id: ThreadId,
    pub owner: ProcessId,
    pub name: String,
    /// Guest visible thread id (GetThreadId).
    pub thread_id: u32,
    pub entrypoint: u32,
    pub stack_top: u32,
    pub arg: u32,
    pub processor_id: i32,
    pub nominal_priority: u32,
    pub current_priority: u32,
    pub status: ThreadStatus,
    pub context: CpuContext,
    pub tls_address: u32,
    pub wait_objects: Vec<ObjectId>,
    pub held_mutexes: Vec<ObjectId>,
    /// Mutexes this thread is blocked on; the priority inheritance chain.
    pub pending_mutexes: Vec<ObjectId>,
    pub arbiter_wait: Option<(ObjectId, u32)>,
    pub cv_wait: Option<(ObjectId, ObjectId)>,
    pub ipc_session: Option<ObjectId>,
    pub resume: Option<ThreadResume>,
    pub(crate) deferred_resume: Option<ThreadResume>,
    pub waiters: WaitQueue,
}

impl KThread {
    pub fn command_buffer_address(&self) -> u32 {
        self.tls_address + crate::ipc::COMMAND_BUFFER_OFFSET
    }

    pub fn static_buffer_descriptor_address(&self) -> u32 {
        self.tls_address + crate::ipc::STATIC_BUFFER_DESCRIPTOR_OFFSET
    }
}

impl Kernel {
    pub fn thread(&self, tid: ThreadId) -> &KThread {
        self.objects.get::<KThread>(tid).unwrap_or_else(|| panic!("{:?} is not a live thread", tid))
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> &mut KThread {
        self.objects.get_mut::<KThread>(tid).unwrap_or_else(|| panic!("{:?} is not a live thread", tid))
    }

    pub fn try_thread(&self, tid: ThreadId) -> Option<&KThread> {
        self.objects.get::<KThread>(tid)
    }

    /// Creates a dormant thread in `process`.
    ///
    /// The returned id carries one reference owned by the caller; the thread keeps another one
    /// for itself until it terminates. Nothing is changed when a check fails.
    pub fn create_thread(&mut self, process: ProcessId, init: ThreadInitializer) -> KResult<ThreadId> {
        if init.priority > THREADPRIO_LOWEST {
            return Err(KernelError::OutOfRange)
        }

        let owner = self.process(process);
        if owner.status == ProcessStatus::Exited {
            return Err(KernelError::InvalidHandle)
        }
        if (init.priority as u64) < owner.limits.max(LimitCategory::Priority) {
            return Err(KernelError::NotAuthorized)
        }

        self.process_mut(process).limits.reserve(LimitCategory::Thread, 1)?;

        let tls_address = match self.process_mut(process).allocate_tls() {
            Ok(address) => address,
            Err(err) => {
                self.process_mut(process).limits.release(LimitCategory::Thread, 1);
                return Err(err)
            }
        };

        let mut context = CpuContext::zero();
        context.r[0] = init.arg;
        context.r[13] = init.stack_top;
        context.r[15] = init.entrypoint & !1;
        context.cpsr = CPSR_USER_MODE | if (init.entrypoint & 1) != 0 { CPSR_THUMB } else { 0 };

        let thread_id = self.next_thread_id;
        self.next_thread_id += 1;

        let tid = self.objects.insert_with(|id| KThread {
            id,
            owner: process,
            name: init.name,
            thread_id,
            entrypoint: init.entrypoint,
            stack_top: init.stack_top,
            arg: init.arg,
            processor_id: init.processor_id,
            nominal_priority: init.priority,
            current_priority: init.priority,
            status: ThreadStatus::Dormant,
            context,
            tls_address,
            wait_objects: vec![],
            held_mutexes: vec![],
            pending_mutexes: vec![],
            arbiter_wait: None,
            cv_wait: None,
            ipc_session: None,
            resume: None,
            deferred_resume: None,
            waiters: WaitQueue::new(),
        });

        // One reference for the caller, one held while the thread is alive
        self.objects.retain(tid);
        self.objects.retain(process);
        self.process_mut(process).threads.push(tid);

        debug!("created thread {:?} ({}) in {:?} at priority {}", tid, self.thread(tid).name, process, init.priority);

        Ok(tid)
    }

    pub fn start_thread(&mut self, tid: ThreadId) {
        let thread = self.thread(tid);
        assert_eq!(thread.status, ThreadStatus::Dormant, "Starting a thread twice");
        let owner = thread.owner;
        let process = self.process_mut(owner);
        if process.status == ProcessStatus::Created {
            process.status = ProcessStatus::Running;
        }
        self.make_ready(tid);
    }

    /// Unlinks a thread from whatever it waits on, releases its mutexes and marks it Dead.
    pub fn terminate_thread(&mut self, tid: ThreadId) {
        let status = match self.try_thread(tid) {
            Some(thread) => thread.status,
            None => return,
        };
        if status == ThreadStatus::Dead {
            return
        }

        debug!("terminating thread {:?} from {:?}", tid, status);

        match status {
            ThreadStatus::Ready => {
                let priority = self.thread(tid).current_priority;
                self.scheduler.ready.remove(priority, tid);
            },
            ThreadStatus::WaitSynchronization { .. } | ThreadStatus::WaitMutex => {
                let objects = std::mem::take(&mut self.thread_mut(tid).wait_objects);
                for object in objects {
                    self.remove_waiting_thread(object, tid);
                    self.release_object(object);
                }
            },
            ThreadStatus::WaitArbiter => self.cancel_arbiter_wait(tid),
            ThreadStatus::WaitConditionVariable => self.cancel_condvar_wait(tid),
            ThreadStatus::WaitIpc => self.cancel_ipc_wait(tid),
            ThreadStatus::Running | ThreadStatus::Sleeping | ThreadStatus::Dormant | ThreadStatus::Dead => {},
        }

        self.cancel_wakeup(tid);
        self.release_thread_mutexes(tid);

        let thread = self.thread_mut(tid);
        thread.status = ThreadStatus::Dead;
        thread.deferred_resume = None;
        let owner = thread.owner;
        let tls_address = thread.tls_address;

        let process = self.process_mut(owner);
        process.free_tls(tls_address);
        process.limits.release(LimitCategory::Thread, 1);
        process.threads.retain(|t| *t != tid);
        let last_thread = process.threads.is_empty();

        self.wakeup_all_waiting_threads(tid);
        self.forget_current(tid);

        if last_thread {
            self.finalize_process(owner);
        }

        self.release_object(tid);
    }

    pub fn exit_thread(&mut self, tid: ThreadId) {
        self.terminate_thread(tid)
    }

    /// Puts a thread to sleep. A zero or negative duration is a yield.
    pub fn sleep_thread(&mut self, tid: ThreadId, ns: i64) {
        if ns <= 0 {
            if self.current_thread_id() == Some(tid) {
                self.yield_current();
            }
            return
        }

        self.suspend_thread(tid, ThreadStatus::Sleeping);
        self.schedule_wakeup(tid, Timeout::After(ns as u64));
    }

    pub fn set_thread_priority(&mut self, tid: ThreadId, priority: u32) -> KResult<()> {
        if priority > THREADPRIO_LOWEST {
            return Err(KernelError::OutOfRange)
        }
        let owner = self.thread(tid).owner;
        if (priority as u64) < self.process(owner).limits.max(LimitCategory::Priority) {
            return Err(KernelError::NotAuthorized)
        }

        self.thread_mut(tid).nominal_priority = priority;
        self.update_thread_priority(tid);
        Ok(())
    }

    pub fn take_resume(&mut self, tid: ThreadId) -> Option<ThreadResume> {
        self.objects.get_mut::<KThread>(tid).and_then(|thread| thread.resume.take())
    }

    pub(crate) fn on_thread_wakeup(&mut self, tid: ThreadId) {
        let status = match self.try_thread(tid) {
            Some(thread) => thread.status,
            None => return,
        };

        match status {
            ThreadStatus::WaitSynchronization { .. } | ThreadStatus::WaitMutex => {
                self.resume_from_wait(tid, ThreadResume::TimeoutReached);
            },
            ThreadStatus::WaitArbiter => {
                self.cancel_arbiter_wait(tid);
                self.resume_from_wait(tid, ThreadResume::TimeoutReached);
            },
            ThreadStatus::WaitConditionVariable => self.condvar_timeout(tid),
            ThreadStatus::Sleeping => self.resume_from_wait(tid, ThreadResume::Normal),
            _ => warn!("stale wakeup for {:?} in {:?}", tid, status),
        }
    }
}
