//! Syscalls in handle space.
//!
//! Each function resolves the caller's handles to kernel objects, runs the kernel operation and
//! hands new objects back as handles in the caller's process. Register decoding is left to the
//! execution side.

use log::{debug, trace, warn};

use kumquat_kernel::memory::MemoryInfo;
use kumquat_kernel::process::KProcess;
use kumquat_kernel::session::{KClientPort, KClientSession, KServerPort, KServerSession, MAX_PORT_NAME_LENGTH};
use kumquat_kernel::shared_memory::KSharedMemory;
use kumquat_kernel::sync::{KAddressArbiter, KEvent, KMutex, KSemaphore, KTimer};
use kumquat_kernel::thread::KThread;
use kumquat_kernel::{
    ArbitrationType, Completion, Handle, KResult, Kernel, KernelError, MemoryPermission, ObjectId,
    ProcessId, ResetType, ThreadId, ThreadInitializer, ThreadResume, Timeout,
};

/// Most objects a single WaitSynchronizationN may name.
pub const MAX_WAIT_OBJECTS: usize = 256;

fn owner(kernel: &Kernel, tid: ThreadId) -> ProcessId {
    kernel.thread(tid).owner
}

fn lookup<T: kumquat_kernel::KObjectData>(kernel: &Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<ObjectId> {
    kernel.lookup_object::<T>(owner(kernel, tid), tid, handle)
}

/// Gives the caller a handle to a freshly created object, taking over the creation reference.
fn new_handle(kernel: &mut Kernel, tid: ThreadId, object: ObjectId) -> KResult<Handle> {
    let pid = owner(kernel, tid);
    kernel.adopt_handle(pid, object)
}

pub fn control_memory(kernel: &mut Kernel, tid: ThreadId, operation: u32, addr0: u32, addr1: u32, size: u32, permissions: u32) -> KResult<u32> {
    trace!("ControlMemory({:#X}, {:#010X}, {:#010X}, {:#X}, {:#X})", operation, addr0, addr1, size, permissions);
    let pid = owner(kernel, tid);
    kernel.control_memory(pid, operation, addr0, addr1, size, MemoryPermission::from_bits_truncate(permissions))
}

pub fn query_memory(kernel: &Kernel, tid: ThreadId, address: u32) -> MemoryInfo {
    trace!("QueryMemory({:#010X})", address);
    kernel.process(owner(kernel, tid)).address_space.query(address)
}

pub fn exit_process(kernel: &mut Kernel, tid: ThreadId) {
    trace!("ExitProcess()");
    let pid = owner(kernel, tid);
    kernel.terminate_process(pid);
}

pub fn create_thread(kernel: &mut Kernel, tid: ThreadId, entrypoint: u32, arg: u32, stack_top: u32, priority: u32, processor_id: i32) -> KResult<Handle> {
    trace!("CreateThread({:#010X}, {:#X}, {:#010X}, {}, {})", entrypoint, arg, stack_top, priority, processor_id);

    let pid = owner(kernel, tid);
    let name = format!("thread@{:08X}", entrypoint);
    let thread = kernel.create_thread(pid, ThreadInitializer {
        name,
        entrypoint,
        stack_top,
        arg,
        priority,
        processor_id,
    })?;

    match kernel.adopt_handle(pid, thread) {
        Ok(handle) => {
            kernel.start_thread(thread);
            Ok(handle)
        },
        Err(err) => {
            // The thread still holds its own reference until it is torn down
            kernel.terminate_thread(thread);
            Err(err)
        }
    }
}

pub fn exit_thread(kernel: &mut Kernel, tid: ThreadId) {
    trace!("ExitThread()");
    kernel.exit_thread(tid);
}

pub fn sleep_thread(kernel: &mut Kernel, tid: ThreadId, ns: i64) {
    trace!("SleepThread({})", ns);
    kernel.sleep_thread(tid, ns);
}

pub fn get_thread_priority(kernel: &Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<u32> {
    let thread = lookup::<KThread>(kernel, tid, handle)?;
    Ok(kernel.thread(thread).nominal_priority)
}

pub fn set_thread_priority(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>, priority: u32) -> KResult<()> {
    trace!("SetThreadPriority({:?}, {})", handle, priority);
    let thread = lookup::<KThread>(kernel, tid, handle)?;
    kernel.set_thread_priority(thread, priority)
}

pub fn create_mutex(kernel: &mut Kernel, tid: ThreadId, initially_locked: bool) -> KResult<Handle> {
    trace!("CreateMutex({})", initially_locked);
    let pid = owner(kernel, tid);
    let mutex = kernel.create_mutex(pid, if initially_locked { Some(tid) } else { None })?;
    new_handle(kernel, tid, mutex)
}

pub fn release_mutex(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<()> {
    trace!("ReleaseMutex({:?})", handle);
    let mutex = lookup::<KMutex>(kernel, tid, handle)?;
    kernel.release_mutex(tid, mutex)
}

pub fn create_semaphore(kernel: &mut Kernel, tid: ThreadId, initial_count: i32, max_count: i32) -> KResult<Handle> {
    trace!("CreateSemaphore({}, {})", initial_count, max_count);
    let pid = owner(kernel, tid);
    let semaphore = kernel.create_semaphore(pid, initial_count, max_count)?;
    new_handle(kernel, tid, semaphore)
}

pub fn release_semaphore(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>, release_count: i32) -> KResult<i32> {
    trace!("ReleaseSemaphore({:?}, {})", handle, release_count);
    let semaphore = lookup::<KSemaphore>(kernel, tid, handle)?;
    kernel.release_semaphore(semaphore, release_count)
}

pub fn create_event(kernel: &mut Kernel, tid: ThreadId, reset_type: u32) -> KResult<Handle> {
    trace!("CreateEvent({})", reset_type);
    let reset_type = ResetType::from_raw(reset_type)?;
    let pid = owner(kernel, tid);
    let event = kernel.create_event(pid, reset_type)?;
    new_handle(kernel, tid, event)
}

pub fn signal_event(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<()> {
    trace!("SignalEvent({:?})", handle);
    let event = lookup::<KEvent>(kernel, tid, handle)?;
    kernel.signal_event(event)
}

pub fn clear_event(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<()> {
    trace!("ClearEvent({:?})", handle);
    let event = lookup::<KEvent>(kernel, tid, handle)?;
    kernel.clear_event(event)
}

pub fn create_timer(kernel: &mut Kernel, tid: ThreadId, reset_type: u32) -> KResult<Handle> {
    trace!("CreateTimer({})", reset_type);
    let reset_type = ResetType::from_raw(reset_type)?;
    let pid = owner(kernel, tid);
    let timer = kernel.create_timer(pid, reset_type)?;
    new_handle(kernel, tid, timer)
}

pub fn set_timer(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>, initial: i64, interval: i64) -> KResult<()> {
    trace!("SetTimer({:?}, {}, {})", handle, initial, interval);
    let timer = lookup::<KTimer>(kernel, tid, handle)?;
    kernel.set_timer(timer, initial, interval)
}

pub fn cancel_timer(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<()> {
    trace!("CancelTimer({:?})", handle);
    let timer = lookup::<KTimer>(kernel, tid, handle)?;
    kernel.cancel_timer(timer)
}

pub fn clear_timer(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<()> {
    trace!("ClearTimer({:?})", handle);
    let timer = lookup::<KTimer>(kernel, tid, handle)?;
    kernel.clear_timer(timer)
}

pub fn create_memory_block(kernel: &mut Kernel, tid: ThreadId, address: u32, size: u32, my_permissions: u32, other_permissions: u32) -> KResult<Handle> {
    trace!("CreateMemoryBlock({:#010X}, {:#X}, {:#X}, {:#X})", address, size, my_permissions, other_permissions);
    let pid = owner(kernel, tid);
    let block = kernel.create_shared_memory(
        pid,
        address,
        size,
        MemoryPermission::from_bits_truncate(my_permissions),
        MemoryPermission::from_bits_truncate(other_permissions),
    )?;
    new_handle(kernel, tid, block)
}

pub fn map_memory_block(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>, address: u32, permissions: u32) -> KResult<()> {
    trace!("MapMemoryBlock({:?}, {:#010X}, {:#X})", handle, address, permissions);
    let block = lookup::<KSharedMemory>(kernel, tid, handle)?;
    let pid = owner(kernel, tid);
    kernel.map_shared_memory(block, pid, address, MemoryPermission::from_bits_truncate(permissions))
}

pub fn unmap_memory_block(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>, address: u32) -> KResult<()> {
    trace!("UnmapMemoryBlock({:?}, {:#010X})", handle, address);
    let block = lookup::<KSharedMemory>(kernel, tid, handle)?;
    let pid = owner(kernel, tid);
    kernel.unmap_shared_memory(block, pid, address)
}

pub fn create_address_arbiter(kernel: &mut Kernel, tid: ThreadId) -> KResult<Handle> {
    trace!("CreateAddressArbiter()");
    let pid = owner(kernel, tid);
    let arbiter = kernel.create_address_arbiter(pid)?;
    new_handle(kernel, tid, arbiter)
}

pub fn arbitrate_address(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>, address: u32, ty: u32, value: i32, timeout_ns: i64) -> KResult<Completion> {
    trace!("ArbitrateAddress({:?}, {:#010X}, {}, {}, {})", handle, address, ty, value, timeout_ns);
    let arbiter = lookup::<KAddressArbiter>(kernel, tid, handle)?;
    let ty = ArbitrationType::from_raw(ty)?;
    kernel.arbitrate_address(tid, arbiter, address, ty, value, timeout_ns)
}

pub fn close_handle(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<()> {
    trace!("CloseHandle({:?})", handle);
    let handle = handle.ok_or(KernelError::InvalidHandle)?;
    if handle.is_pseudo() {
        return Err(KernelError::InvalidHandle)
    }
    let pid = owner(kernel, tid);
    kernel.close_handle(pid, handle)
}

fn lookup_waitable(kernel: &Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<ObjectId> {
    let pid = owner(kernel, tid);
    kernel.lookup_handle(pid, tid, handle)
}

pub fn wait_synchronization_1(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>, timeout: i64) -> KResult<Completion> {
    trace!("WaitSynchronization1({:?}, {})", handle, timeout);
    let object = lookup_waitable(kernel, tid, handle)?;
    kernel.wait_synchronization(tid, &[object], false, Timeout::from_ns(timeout))
}

pub fn wait_synchronization_n(kernel: &mut Kernel, tid: ThreadId, handles: &[Option<Handle>], wait_all: bool, timeout: i64) -> KResult<Completion> {
    trace!("WaitSynchronizationN({:X?}, {}, {})", handles, wait_all, timeout);
    if handles.len() > MAX_WAIT_OBJECTS {
        return Err(KernelError::OutOfRange)
    }

    let objects = handles.iter()
        .map(|handle| lookup_waitable(kernel, tid, *handle))
        .collect::<KResult<Vec<_>>>()?;

    kernel.wait_synchronization(tid, &objects, wait_all, Timeout::from_ns(timeout))
}

pub fn duplicate_handle(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<Handle> {
    trace!("DuplicateHandle({:?})", handle);
    let pid = owner(kernel, tid);
    kernel.duplicate_handle(pid, tid, handle)
}

pub fn get_system_tick(kernel: &Kernel) -> u64 {
    kernel.system_tick()
}

pub fn connect_to_port(kernel: &mut Kernel, tid: ThreadId, name: &str) -> KResult<Handle> {
    trace!("ConnectToPort({:?})", name);
    let session = kernel.connect_to_named_port(name)?;
    new_handle(kernel, tid, session)
}

pub fn send_sync_request(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<Completion> {
    trace!("SendSyncRequest({:?})", handle);
    let session = lookup::<KClientSession>(kernel, tid, handle)?;
    kernel.send_sync_request(tid, session)
}

pub fn get_process_id(kernel: &Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<u32> {
    let process = lookup::<KProcess>(kernel, tid, handle)?;
    Ok(kernel.process(process).process_id)
}

pub fn get_thread_id(kernel: &Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<u32> {
    let thread = lookup::<KThread>(kernel, tid, handle)?;
    Ok(kernel.thread(thread).thread_id)
}

/// CreatePort. A named port is registered on the kernel and only the server end is returned.
pub fn create_port(kernel: &mut Kernel, tid: ThreadId, name: Option<&str>, max_sessions: u32) -> KResult<(Handle, Option<Handle>)> {
    trace!("CreatePort({:?}, {})", name, max_sessions);

    if let Some(name) = name {
        if name.len() > MAX_PORT_NAME_LENGTH {
            return Err(KernelError::PortNameTooLong)
        }
    }

    let (server, client) = kernel.create_port_pair(name.unwrap_or(""), max_sessions, None);

    let client_handle = match name {
        Some(name) => {
            let registered = kernel.register_named_port(name, client);
            kernel.release_object(client);
            if let Err(err) = registered {
                kernel.release_object(server);
                return Err(err)
            }
            None
        },
        None => match new_handle(kernel, tid, client) {
            Ok(handle) => Some(handle),
            Err(err) => {
                kernel.release_object(server);
                return Err(err)
            }
        },
    };

    match new_handle(kernel, tid, server) {
        Ok(server_handle) => Ok((server_handle, client_handle)),
        Err(err) => {
            if let Some(handle) = client_handle {
                if let Err(err) = close_handle(kernel, tid, Some(handle)) {
                    debug!("could not roll back {:?}: {}", handle, err);
                }
            }
            Err(err)
        }
    }
}

pub fn create_session_to_port(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<Handle> {
    trace!("CreateSessionToPort({:?})", handle);
    let port = lookup::<KClientPort>(kernel, tid, handle)?;
    let session = kernel.connect_to_port(port)?;
    new_handle(kernel, tid, session)
}

/// CreateSession: returns (server, client).
pub fn create_session(kernel: &mut Kernel, tid: ThreadId) -> KResult<(Handle, Handle)> {
    trace!("CreateSession()");
    let (server, client) = kernel.create_session_pair("", None);

    let server_handle = match new_handle(kernel, tid, server) {
        Ok(handle) => handle,
        Err(err) => {
            kernel.release_object(client);
            return Err(err)
        }
    };
    match new_handle(kernel, tid, client) {
        Ok(client_handle) => Ok((server_handle, client_handle)),
        Err(err) => {
            if let Err(err) = close_handle(kernel, tid, Some(server_handle)) {
                debug!("could not roll back {:?}: {}", server_handle, err);
            }
            Err(err)
        }
    }
}

pub fn accept_session(kernel: &mut Kernel, tid: ThreadId, handle: Option<Handle>) -> KResult<Handle> {
    trace!("AcceptSession({:?})", handle);
    let port = lookup::<KServerPort>(kernel, tid, handle)?;
    let session = kernel.accept_session(port)?;
    new_handle(kernel, tid, session)
}

/// The first half of ReplyAndReceive: reply to `reply_target`, then wait on `handles`.
pub fn reply_and_receive_pre(kernel: &mut Kernel, tid: ThreadId, handles: &[Option<Handle>], reply_target: Option<Handle>) -> KResult<Completion> {
    trace!("ReplyAndReceive({:X?}, {:?})", handles, reply_target);

    let objects = handles.iter()
        .map(|handle| lookup_waitable(kernel, tid, *handle))
        .collect::<KResult<Vec<_>>>()?;

    let reply_target = match reply_target {
        Some(handle) => Some(lookup::<KServerSession>(kernel, tid, Some(handle))?),
        None => None,
    };

    kernel.reply_and_receive(tid, &objects, reply_target)
}

/// The second half of ReplyAndReceive, once the thread knows which object woke it. Receiving on
/// a server session copies the request into the caller's command buffer.
pub fn reply_and_receive_post(kernel: &mut Kernel, tid: ThreadId, handles: &[Option<Handle>], index: usize) -> KResult<()> {
    let handle = handles.get(index).copied().ok_or(KernelError::OutOfRange)?;
    let object = lookup_waitable(kernel, tid, handle)?;
    kernel.finish_receive(tid, object)
}

/// Resolves a ReplyAndReceive that had to block.
pub fn reply_and_receive_resume(kernel: &mut Kernel, tid: ThreadId, handles: &[Option<Handle>], resume: ThreadResume) -> (Option<usize>, KResult<()>) {
    match resume {
        ThreadResume::Signaled { index: Some(index) } => (Some(index), reply_and_receive_post(kernel, tid, handles, index)),
        ThreadResume::Signaled { index: None } | ThreadResume::Normal => (None, Ok(())),
        ThreadResume::TimeoutReached => (None, Err(KernelError::Timeout)),
        ThreadResume::Error { result, index } => (index, Err(result)),
    }
}

pub fn bind_interrupt(kernel: &mut Kernel, tid: ThreadId, interrupt: u32, handle: Option<Handle>, priority: i32, is_manual_clear: bool) -> KResult<()> {
    trace!("BindInterrupt({:#X}, {:?}, {}, {})", interrupt, handle, priority, is_manual_clear);
    let event = lookup::<KEvent>(kernel, tid, handle)?;
    kernel.bind_interrupt(interrupt, event)
}

pub fn unbind_interrupt(kernel: &mut Kernel, tid: ThreadId, interrupt: u32, handle: Option<Handle>) -> KResult<()> {
    trace!("UnbindInterrupt({:#X}, {:?})", interrupt, handle);
    let event = lookup::<KEvent>(kernel, tid, handle)?;
    kernel.unbind_interrupt(interrupt, event)
}

/// Logs and refuses a syscall number nothing implements.
pub fn unimplemented(number: u32) -> KernelError {
    warn!("unimplemented syscall {:#04X}", number);
    KernelError::NotImplemented
}
