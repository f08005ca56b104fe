//! Kernel objects, scheduling and IPC of the emulated console OS.
//!
//! All state lives in [`Kernel`] and is driven from a single host thread. Objects sit in one arena
//! and refer to each other by id, so nothing here is reference counted by the host.

pub mod config;
pub mod errors;
pub mod external;
pub mod handle_table;
pub mod hle_ipc;
pub mod ipc;
pub mod memory;
pub mod object;
pub mod process;
pub mod scheduler;
pub mod session;
pub mod shared_memory;
pub mod sync;
pub mod thread;
pub mod timing;
pub mod wait;

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use log::{debug, trace};

pub use config::{ConfigError, KernelConfig, LimitsConfig, MemoryConfig, MutexRecursion};
pub use errors::{KernelError, KResult, ResultCode};
pub use external::ExternalRequests;
pub use hle_ipc::{HLERequestContext, SessionRequestHandler, SharedRequestHandler};
pub use memory::{MemoryPermission, MemoryRegion, MemoryState};
pub use object::{KObject, KObjectData, ObjectId, ObjectKind, ObjectManager, ProcessId, ThreadId};
pub use process::{LimitCategory, ProcessStatus, ResourceLimits};
pub use sync::{ArbitrationType, ResetType};
pub use thread::{CpuContext, ThreadInitializer, ThreadResume, ThreadStatus};
pub use wait::{Completion, Timeout};

use memory::KMM;
use object::DestroyedObject;
use scheduler::Scheduler;
use timing::{EventType, Timing};

#[derive(Copy, Clone, Ord, PartialOrd, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU32);

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.0.get())
    }
}

const fn pseudo_handle(value: u32) -> Handle {
    match NonZeroU32::new(value) {
        Some(value) => Handle(value),
        None => panic!("Pseudo handles are never zero"),
    }
}

impl Handle {
    /// Always resolves to the calling thread.
    pub const CURRENT_THREAD: Handle = pseudo_handle(0xFFFF8000);
    /// Always resolves to the calling process.
    pub const CURRENT_PROCESS: Handle = pseudo_handle(0xFFFF8001);

    pub fn from_raw(value: u32) -> Option<Handle> {
        NonZeroU32::new(value).map(Handle)
    }

    pub fn raw(&self) -> u32 {
        self.0.get()
    }

    pub fn is_pseudo(&self) -> bool {
        *self == Handle::CURRENT_THREAD || *self == Handle::CURRENT_PROCESS
    }
}

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) objects: ObjectManager,
    pub(crate) processes: Vec<ProcessId>,
    pub(crate) scheduler: Scheduler,
    pub(crate) timing: Timing,
    pub(crate) kmm: KMM,
    pub(crate) named_ports: HashMap<String, ObjectId>,
    pub(crate) interrupts: HashMap<u32, ObjectId>,
    pub(crate) external: Arc<ExternalRequests>,
    pub(crate) thread_wakeup_event: EventType,
    pub(crate) timer_event: EventType,
    pub(crate) next_thread_id: u32,
    pub(crate) next_process_id: u32,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Kernel {
        let mut timing = Timing::new(config.slice_length);

        let thread_wakeup_event = timing.register_event("ThreadWakeupCallback", Box::new(|kernel, userdata, _late| {
            if let Some(tid) = ThreadId::from_raw(userdata as u32) {
                kernel.on_thread_wakeup(tid);
            }
        }));
        let timer_event = timing.register_event("TimerCallback", Box::new(|kernel, userdata, late| {
            if let Some(timer) = ObjectId::from_raw(userdata as u32) {
                kernel.timer_signal(timer, late);
            }
        }));

        let kmm = KMM::with_sizes(config.memory.application, config.memory.system, config.memory.base);

        Kernel {
            config,
            objects: ObjectManager::new(),
            processes: vec![],
            scheduler: Scheduler::new(),
            timing,
            kmm,
            named_ports: HashMap::new(),
            interrupts: HashMap::new(),
            external: ExternalRequests::new(),
            thread_wakeup_event,
            timer_event,
            next_thread_id: 1,
            next_process_id: 1,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    pub fn kmm(&self) -> &KMM {
        &self.kmm
    }

    /// Creates a process with the configured application limits in the APPLICATION region.
    pub fn create_application_process(&mut self, name: &str) -> ProcessId {
        let limits = ResourceLimits::from(&self.config.application_limits);
        self.create_process(name, limits, MemoryRegion::App)
    }

    pub fn retain_object(&mut self, object: ObjectId) {
        self.objects.retain(object);
    }

    /// Drops one reference and runs the destruction hooks once the last one is gone.
    pub fn release_object(&mut self, object: ObjectId) {
        if let Some(destroyed) = self.objects.release(object) {
            self.destroy_object(destroyed);
        }
    }

    fn destroy_object(&mut self, destroyed: DestroyedObject) {
        let DestroyedObject { id, charge, object } = destroyed;
        trace!("destroying {:?} ({:?})", id, object.kind());

        match object {
            KObject::Thread(thread) => {
                self.release_object(thread.owner);
            },
            KObject::Mutex(mutex) => {
                if let Some(holder) = mutex.holding_thread {
                    if let Some(thread) = self.objects.get_mut::<thread::KThread>(holder) {
                        thread.held_mutexes.retain(|m| *m != id);
                        self.update_thread_priority(holder);
                    }
                }
            },
            KObject::Timer(_) => {
                let event = self.timer_event;
                self.timing.remove_event(event, id.raw() as u64);
            },
            KObject::SharedMemory(shared_memory) => {
                if let Some(physical) = &shared_memory.physical {
                    self.kmm.free(physical);
                }
            },
            KObject::ServerPort(port) => self.destroy_server_port(port),
            KObject::ClientPort(port) => self.destroy_client_port(port),
            KObject::ServerSession(session) => self.destroy_server_session(id, session),
            KObject::ClientSession(session) => self.destroy_client_session(id, session),
            KObject::Process(_) |
            KObject::Semaphore(_) |
            KObject::Event(_) |
            KObject::ConditionVariable(_) |
            KObject::AddressArbiter(_) => {},
        }

        if let Some(charge) = charge {
            if let Some(process) = self.objects.get_mut::<process::KProcess>(charge.process) {
                process.limits.release(charge.category, charge.amount);
            }
        }
    }

    /// Resolves a handle of `pid`, including the pseudo handles for the calling thread and process.
    pub fn lookup_handle(&self, pid: ProcessId, tid: ThreadId, handle: Option<Handle>) -> KResult<ObjectId> {
        let handle = handle.ok_or(KernelError::InvalidHandle)?;
        if handle == Handle::CURRENT_THREAD {
            return Ok(tid)
        }
        if handle == Handle::CURRENT_PROCESS {
            return Ok(pid)
        }
        let process = self.objects.get::<process::KProcess>(pid).ok_or(KernelError::InvalidHandle)?;
        process.handle_table.get(&handle)
    }

    /// Like `lookup_handle`, but the object must be of kind `T`.
    pub fn lookup_object<T: KObjectData>(&self, pid: ProcessId, tid: ThreadId, handle: Option<Handle>) -> KResult<ObjectId> {
        let object = self.lookup_handle(pid, tid, handle)?;
        if self.objects.kind(object) != Some(T::KIND) {
            return Err(KernelError::InvalidHandle)
        }
        Ok(object)
    }

    /// Gives `pid` a new handle to `object`. The handle holds its own reference.
    pub fn create_handle(&mut self, pid: ProcessId, object: ObjectId) -> KResult<Handle> {
        self.objects.retain(object);
        self.adopt_handle(pid, object)
    }

    /// Gives `pid` a new handle that takes over the caller's reference to `object`. The reference
    /// is dropped if no handle could be created.
    pub fn adopt_handle(&mut self, pid: ProcessId, object: ObjectId) -> KResult<Handle> {
        let result = match self.objects.get_mut::<process::KProcess>(pid) {
            Some(process) => process.handle_table.create(object),
            None => Err(KernelError::InvalidHandle),
        };
        match result {
            Ok(handle) => {
                trace!("{:?} -> {:?} in {:?}", handle, object, pid);
                Ok(handle)
            },
            Err(err) => {
                debug!("could not create a handle to {:?} in {:?}: {}", object, pid, err);
                self.release_object(object);
                Err(err)
            }
        }
    }

    pub fn close_handle(&mut self, pid: ProcessId, handle: Handle) -> KResult<()> {
        let process = self.objects.get_mut::<process::KProcess>(pid).ok_or(KernelError::InvalidHandle)?;
        let object = process.handle_table.close(&handle)?;
        self.release_object(object);
        Ok(())
    }

    pub fn duplicate_handle(&mut self, pid: ProcessId, tid: ThreadId, handle: Option<Handle>) -> KResult<Handle> {
        let object = self.lookup_handle(pid, tid, handle)?;
        self.create_handle(pid, object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::KEvent;

    fn kernel_with_process() -> (Kernel, ProcessId) {
        let mut kernel = Kernel::new(KernelConfig::default());
        let pid = kernel.create_application_process("test");
        (kernel, pid)
    }

    #[test]
    fn pseudo_handles_resolve_to_caller() {
        let (kernel, pid) = kernel_with_process();
        let tid = pid;
        assert_eq!(kernel.lookup_handle(pid, tid, Some(Handle::CURRENT_PROCESS)), Ok(pid));
        assert!(Handle::CURRENT_THREAD.is_pseudo());
        assert_eq!(kernel.lookup_handle(pid, tid, None), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn handles_hold_references() {
        let (mut kernel, pid) = kernel_with_process();
        let event = kernel.create_event(pid, ResetType::OneShot).unwrap();
        let handle = kernel.adopt_handle(pid, event).unwrap();
        let copy = kernel.duplicate_handle(pid, pid, Some(handle)).unwrap();
        assert_ne!(handle, copy);
        assert_eq!(kernel.objects().refcount(event), 2);

        kernel.close_handle(pid, handle).unwrap();
        assert!(kernel.objects().get::<KEvent>(event).is_some());
        kernel.close_handle(pid, copy).unwrap();
        assert!(!kernel.objects().contains(event));
        assert_eq!(kernel.process(pid).limits.current(LimitCategory::Event), 0);
        assert_eq!(kernel.close_handle(pid, copy), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn typed_lookup_checks_kind() {
        let (mut kernel, pid) = kernel_with_process();
        let event = kernel.create_event(pid, ResetType::Sticky).unwrap();
        let handle = kernel.adopt_handle(pid, event).unwrap();
        assert_eq!(kernel.lookup_object::<KEvent>(pid, pid, Some(handle)), Ok(event));
        assert_eq!(kernel.lookup_object::<sync::KMutex>(pid, pid, Some(handle)), Err(KernelError::InvalidHandle));
    }
}
