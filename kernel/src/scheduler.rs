use std::collections::VecDeque;

use log::debug;

use crate::object::{ProcessId, ThreadId};
use crate::thread::ThreadStatus;
use crate::Kernel;

pub const THREADPRIO_HIGHEST: u32 = 0;
pub const THREADPRIO_LOWEST: u32 = 63;
const PRIORITY_LEVELS: usize = THREADPRIO_LOWEST as usize + 1;

/// One FIFO per priority level plus a bitmask of non-empty levels.
pub struct ReadyQueue {
    levels: Vec<VecDeque<ThreadId>>,
    occupied: u64,
}

impl ReadyQueue {
    pub fn new() -> ReadyQueue {
        ReadyQueue {
            levels: (0..PRIORITY_LEVELS).map(|_| VecDeque::new()).collect(),
            occupied: 0,
        }
    }

    pub fn push_back(&mut self, priority: u32, thread: ThreadId) {
        debug_assert!(!self.contains(thread), "{:?} queued twice", thread);
        self.levels[priority as usize].push_back(thread);
        self.occupied |= 1 << priority;
    }

    pub fn push_front(&mut self, priority: u32, thread: ThreadId) {
        debug_assert!(!self.contains(thread), "{:?} queued twice", thread);
        self.levels[priority as usize].push_front(thread);
        self.occupied |= 1 << priority;
    }

    pub fn remove(&mut self, priority: u32, thread: ThreadId) -> bool {
        let level = &mut self.levels[priority as usize];
        let removed = match level.iter().position(|t| *t == thread) {
            Some(index) => level.remove(index).is_some(),
            None => false,
        };
        if level.is_empty() {
            self.occupied &= !(1 << priority);
        }
        removed
    }

    pub fn first(&self) -> Option<(u32, ThreadId)> {
        if self.occupied == 0 {
            return None
        }
        let priority = self.occupied.trailing_zeros();
        self.levels[priority as usize].front().map(|thread| (priority, *thread))
    }

    pub fn pop_first(&mut self) -> Option<ThreadId> {
        let (priority, _) = self.first()?;
        let level = &mut self.levels[priority as usize];
        let thread = level.pop_front();
        if level.is_empty() {
            self.occupied &= !(1 << priority);
        }
        thread
    }

    /// Pops the first thread with a strictly better (numerically lower) priority.
    pub fn pop_first_better(&mut self, priority: u32) -> Option<ThreadId> {
        match self.first() {
            Some((first, _)) if first < priority => self.pop_first(),
            _ => None,
        }
    }

    pub fn has_priority_at_most(&self, priority: u32) -> bool {
        matches!(self.first(), Some((first, _)) if first <= priority)
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.levels.iter().any(|level| level.contains(&thread))
    }

    pub fn iter(&self) -> impl Iterator<Item=(u32, ThreadId)> + '_ {
        self.levels.iter().enumerate()
            .flat_map(|(priority, level)| level.iter().map(move |thread| (priority as u32, *thread)))
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        ReadyQueue::new()
    }
}

pub struct Scheduler {
    pub(crate) ready: ReadyQueue,
    current: Option<ThreadId>,
    reschedule_pending: bool,
    switches: u64,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            ready: ReadyQueue::new(),
            current: None,
            reschedule_pending: false,
            switches: 0,
        }
    }

    pub fn ready_queue(&self) -> &ReadyQueue {
        &self.ready
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Kernel {
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.scheduler.current
    }

    pub fn current_process_id(&self) -> Option<ProcessId> {
        self.scheduler.current
            .and_then(|tid| self.objects.get::<crate::thread::KThread>(tid))
            .map(|thread| thread.owner)
    }

    pub fn prepare_reschedule(&mut self) {
        self.scheduler.reschedule_pending = true;
    }

    pub fn reschedule_pending(&self) -> bool {
        self.scheduler.reschedule_pending
    }

    pub fn have_ready_threads(&self) -> bool {
        !self.scheduler.ready.is_empty()
    }

    /// Marks a thread Ready and queues it at the back of its priority level.
    pub(crate) fn make_ready(&mut self, tid: ThreadId) {
        let thread = self.thread_mut(tid);
        assert!(
            thread.status != ThreadStatus::Ready && thread.status != ThreadStatus::Running && thread.status != ThreadStatus::Dead,
            "{:?} made ready from {:?}", tid, thread.status
        );
        thread.status = ThreadStatus::Ready;
        let priority = thread.current_priority;
        self.scheduler.ready.push_back(priority, tid);
        self.prepare_reschedule();
    }

    /// Takes a thread off the core or out of the ready queue and gives it a blocked status.
    pub(crate) fn suspend_thread(&mut self, tid: ThreadId, status: ThreadStatus) {
        let thread = self.thread_mut(tid);
        let previous = thread.status;
        let priority = thread.current_priority;
        assert!(
            previous == ThreadStatus::Running || previous == ThreadStatus::Ready,
            "{:?} suspended from {:?}", tid, previous
        );
        thread.status = status;
        if previous == ThreadStatus::Ready {
            self.scheduler.ready.remove(priority, tid);
        }
        self.prepare_reschedule();
    }

    /// Picks the thread that should own the core and switches to it.
    ///
    /// A running thread keeps the core unless a strictly better thread is ready. Returns the new
    /// current thread, or `None` when the core should idle.
    pub fn reschedule(&mut self) -> Option<ThreadId> {
        self.scheduler.reschedule_pending = false;

        let current = self.scheduler.current.filter(|tid| self.objects.contains(*tid));
        let running = current.filter(|tid| self.thread(*tid).status == ThreadStatus::Running);

        let next = match running {
            Some(tid) => {
                let priority = self.thread(tid).current_priority;
                match self.scheduler.ready.pop_first_better(priority) {
                    Some(next) => Some(next),
                    None => return Some(tid),
                }
            },
            None => self.scheduler.ready.pop_first(),
        };

        self.switch_context(running, next);
        next
    }

    fn switch_context(&mut self, previous: Option<ThreadId>, next: Option<ThreadId>) {
        if let Some(previous) = previous {
            // Preempted threads keep their place at the head of their level
            let thread = self.thread_mut(previous);
            thread.status = ThreadStatus::Ready;
            let priority = thread.current_priority;
            self.scheduler.ready.push_front(priority, previous);
        }

        if let Some(next) = next {
            let thread = self.thread_mut(next);
            assert_eq!(thread.status, ThreadStatus::Ready, "Switching to a thread that is not ready");
            thread.status = ThreadStatus::Running;
        }

        if self.scheduler.current != next {
            self.scheduler.switches += 1;
            debug!("switch {:?} -> {:?}", self.scheduler.current, next);
        }
        self.scheduler.current = next;
    }

    /// Round-robin among equals: moves the running thread behind every other ready thread of
    /// the same priority.
    pub fn yield_current(&mut self) {
        let tid = match self.scheduler.current {
            Some(tid) if self.objects.contains(tid) => tid,
            _ => return,
        };

        let thread = self.thread(tid);
        if thread.status != ThreadStatus::Running {
            return
        }

        let priority = thread.current_priority;
        if !self.scheduler.ready.has_priority_at_most(priority) {
            return
        }

        self.thread_mut(tid).status = ThreadStatus::Ready;
        self.scheduler.ready.push_back(priority, tid);
        self.prepare_reschedule();
    }

    /// Changes the effective priority, keeping the ready queue consistent.
    pub(crate) fn set_current_priority(&mut self, tid: ThreadId, priority: u32) {
        assert!(priority <= THREADPRIO_LOWEST);
        let thread = self.thread_mut(tid);
        let old = thread.current_priority;
        if old == priority {
            return
        }
        thread.current_priority = priority;
        if thread.status == ThreadStatus::Ready {
            self.scheduler.ready.remove(old, tid);
            self.scheduler.ready.push_back(priority, tid);
        }
        self.prepare_reschedule();
    }

    pub(crate) fn forget_current(&mut self, tid: ThreadId) {
        if self.scheduler.current == Some(tid) {
            self.prepare_reschedule();
        }
    }
}
