//! Guest execution: the register level syscall ABI and the run loop that drives an
//! [`ExecutionEngine`] against the kernel.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use log::{trace, warn};

use kumquat_hle::kernel;
use kumquat_hle::svc;

use kernel::errors::result_word;
use kernel::memory::Memory;
use kernel::session::MAX_PORT_NAME_LENGTH;
use kernel::{Completion, Handle, KResult, Kernel, KernelError, ThreadId, ThreadResume};

mod guest_abstraction;
pub mod scripted;
pub mod system;

pub use crate::guest_abstraction::*;
pub use crate::system::{PerfStats, ResultStatus, System};

pub mod svc_number {
    pub const CONTROL_MEMORY: u32 = 0x01;
    pub const QUERY_MEMORY: u32 = 0x02;
    pub const EXIT_PROCESS: u32 = 0x03;
    pub const CREATE_THREAD: u32 = 0x08;
    pub const EXIT_THREAD: u32 = 0x09;
    pub const SLEEP_THREAD: u32 = 0x0A;
    pub const GET_THREAD_PRIORITY: u32 = 0x0B;
    pub const SET_THREAD_PRIORITY: u32 = 0x0C;
    pub const CREATE_MUTEX: u32 = 0x13;
    pub const RELEASE_MUTEX: u32 = 0x14;
    pub const CREATE_SEMAPHORE: u32 = 0x15;
    pub const RELEASE_SEMAPHORE: u32 = 0x16;
    pub const CREATE_EVENT: u32 = 0x17;
    pub const SIGNAL_EVENT: u32 = 0x18;
    pub const CLEAR_EVENT: u32 = 0x19;
    pub const CREATE_TIMER: u32 = 0x1A;
    pub const SET_TIMER: u32 = 0x1B;
    pub const CANCEL_TIMER: u32 = 0x1C;
    pub const CLEAR_TIMER: u32 = 0x1D;
    pub const CREATE_MEMORY_BLOCK: u32 = 0x1E;
    pub const MAP_MEMORY_BLOCK: u32 = 0x1F;
    pub const UNMAP_MEMORY_BLOCK: u32 = 0x20;
    pub const CREATE_ADDRESS_ARBITER: u32 = 0x21;
    pub const ARBITRATE_ADDRESS: u32 = 0x22;
    pub const CLOSE_HANDLE: u32 = 0x23;
    pub const WAIT_SYNCHRONIZATION_1: u32 = 0x24;
    pub const WAIT_SYNCHRONIZATION_N: u32 = 0x25;
    pub const DUPLICATE_HANDLE: u32 = 0x27;
    pub const GET_SYSTEM_TICK: u32 = 0x28;
    pub const CONNECT_TO_PORT: u32 = 0x2D;
    pub const SEND_SYNC_REQUEST: u32 = 0x32;
    pub const GET_PROCESS_ID: u32 = 0x35;
    pub const GET_THREAD_ID: u32 = 0x37;
    pub const CREATE_PORT: u32 = 0x47;
    pub const CREATE_SESSION_TO_PORT: u32 = 0x48;
    pub const CREATE_SESSION: u32 = 0x49;
    pub const ACCEPT_SESSION: u32 = 0x4A;
    pub const REPLY_AND_RECEIVE: u32 = 0x4F;
    pub const BIND_INTERRUPT: u32 = 0x50;
    pub const UNBIND_INTERRUPT: u32 = 0x51;
}

/// Syscalls that blocked and need more than the resume value to finish.
#[derive(Default)]
pub struct PendingCalls {
    /// Handle lists of threads blocked in ReplyAndReceive.
    reply_and_receive: HashMap<ThreadId, Vec<Option<Handle>>>,
}

impl PendingCalls {
    pub fn new() -> PendingCalls {
        PendingCalls::default()
    }

    pub fn forget(&mut self, tid: ThreadId) {
        self.reply_and_receive.remove(&tid);
    }

    pub fn len(&self) -> usize {
        self.reply_and_receive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reply_and_receive.is_empty()
    }
}

fn make_ns(low: u32, high: u32) -> i64 {
    ((high as u64) << 32 | low as u64) as i64
}

fn handle(value: RegValue) -> Option<Handle> {
    Handle::from_raw(value.u32())
}

fn raw_handle(handle: Option<Handle>) -> u32 {
    handle.map(|handle| handle.raw()).unwrap_or(0)
}

fn set_result(regs: &mut impl Regs, result: KResult<()>) {
    regs.sr(0, result_word(&result).into());
}

/// Writes r0 and, when the syscall produced one, r1.
fn set_result_value(regs: &mut impl Regs, result: KResult<u32>) {
    match result {
        Ok(value) => {
            regs.sr(0, 0.into());
            regs.sr(1, value.into());
        },
        Err(err) => regs.sr(0, err.raw().into()),
    }
}

fn complete(regs: &mut impl Regs, result: KResult<Completion>) -> SvcResult {
    match result {
        Ok(Completion::Immediate { index }) => {
            regs.sr(0, 0.into());
            if let Some(index) = index {
                regs.sr(1, (index as u32).into());
            }
            SvcResult::Continue
        },
        Ok(Completion::Suspended) => {
            regs.sr(0, 0.into());
            SvcResult::Reschedule
        },
        Err(err) => {
            regs.sr(0, err.raw().into());
            SvcResult::Continue
        }
    }
}

fn caller_memory(kernel: &Kernel, tid: ThreadId) -> &dyn Memory {
    let owner = kernel.thread(tid).owner;
    &kernel.process(owner).address_space
}

fn read_handles(kernel: &Kernel, tid: ThreadId, address: u32, count: RegValue) -> KResult<Vec<Option<Handle>>> {
    let count = count.i32();
    if count < 0 || count as usize > svc::MAX_WAIT_OBJECTS {
        return Err(KernelError::OutOfRange)
    }

    let mut data = vec![0u8; count as usize * 4];
    caller_memory(kernel, tid).read(address, &mut data)?;
    Ok(data.chunks_exact(4).map(|word| Handle::from_raw(LittleEndian::read_u32(word))).collect())
}

/// Reads a NUL terminated port name.
fn read_port_name(kernel: &Kernel, tid: ThreadId, address: u32) -> KResult<String> {
    let memory = caller_memory(kernel, tid);
    let mut name = vec![];
    for offset in 0..=MAX_PORT_NAME_LENGTH as u32 {
        match memory.read_u8(address.wrapping_add(offset))? {
            0 => return String::from_utf8(name).map_err(|_| KernelError::NotFound),
            byte => name.push(byte),
        }
    }
    Err(KernelError::PortNameTooLong)
}

/// Runs syscall `number` for `tid` with its arguments and results in `regs`.
pub fn handle_svc(kernel: &mut Kernel, pending: &mut PendingCalls, tid: ThreadId, number: u32, regs: &mut impl Regs) -> SvcResult {
    use self::svc_number::*;

    trace!("svc {:#04X} from {:?}", number, tid);

    let mut result = SvcResult::Continue;

    match number {
        CONTROL_MEMORY => {
            let value = svc::control_memory(kernel, tid, regs.r(0).u32(), regs.r(1).u32(), regs.r(2).u32(), regs.r(3).u32(), regs.r(4).u32());
            set_result_value(regs, value);
        },
        QUERY_MEMORY => {
            let info = svc::query_memory(kernel, tid, regs.r(2).u32());
            regs.sr(0, 0.into());
            regs.sr(1, info.base_address.into());
            regs.sr(2, info.size.into());
            regs.sr(3, info.permissions.bits().into());
            regs.sr(4, (info.state as u32).into());
            // Page flags
            regs.sr(5, 0.into());
        },
        EXIT_PROCESS => {
            svc::exit_process(kernel, tid);
            pending.forget(tid);
            result = SvcResult::Reschedule;
        },
        CREATE_THREAD => {
            let priority = regs.r(0).u32();
            let entrypoint = regs.r(1).u32();
            let arg = regs.r(2).u32();
            let stack_top = regs.r(3).u32();
            let processor_id = regs.r(4).i32();
            let thread = svc::create_thread(kernel, tid, entrypoint, arg, stack_top, priority, processor_id);
            set_result_value(regs, thread.map(|handle| handle.raw()));
        },
        EXIT_THREAD => {
            svc::exit_thread(kernel, tid);
            pending.forget(tid);
            result = SvcResult::Reschedule;
        },
        SLEEP_THREAD => {
            svc::sleep_thread(kernel, tid, make_ns(regs.r(0).u32(), regs.r(1).u32()));
            result = SvcResult::Reschedule;
        },
        GET_THREAD_PRIORITY => {
            let priority = svc::get_thread_priority(kernel, tid, handle(regs.r(1)));
            set_result_value(regs, priority);
        },
        SET_THREAD_PRIORITY => {
            let res = svc::set_thread_priority(kernel, tid, handle(regs.r(0)), regs.r(1).u32());
            set_result(regs, res);
        },
        CREATE_MUTEX => {
            let mutex = svc::create_mutex(kernel, tid, regs.r(1).u32() != 0);
            set_result_value(regs, mutex.map(|handle| handle.raw()));
        },
        RELEASE_MUTEX => {
            let res = svc::release_mutex(kernel, tid, handle(regs.r(0)));
            set_result(regs, res);
        },
        CREATE_SEMAPHORE => {
            let semaphore = svc::create_semaphore(kernel, tid, regs.r(1).i32(), regs.r(2).i32());
            set_result_value(regs, semaphore.map(|handle| handle.raw()));
        },
        RELEASE_SEMAPHORE => {
            let count = svc::release_semaphore(kernel, tid, handle(regs.r(1)), regs.r(2).i32());
            set_result_value(regs, count.map(|count| count as u32));
        },
        CREATE_EVENT => {
            let event = svc::create_event(kernel, tid, regs.r(1).u32());
            set_result_value(regs, event.map(|handle| handle.raw()));
        },
        SIGNAL_EVENT => {
            let res = svc::signal_event(kernel, tid, handle(regs.r(0)));
            set_result(regs, res);
        },
        CLEAR_EVENT => {
            let res = svc::clear_event(kernel, tid, handle(regs.r(0)));
            set_result(regs, res);
        },
        CREATE_TIMER => {
            let timer = svc::create_timer(kernel, tid, regs.r(1).u32());
            set_result_value(regs, timer.map(|handle| handle.raw()));
        },
        SET_TIMER => {
            let initial = make_ns(regs.r(2).u32(), regs.r(3).u32());
            let interval = make_ns(regs.r(1).u32(), regs.r(4).u32());
            let res = svc::set_timer(kernel, tid, handle(regs.r(0)), initial, interval);
            set_result(regs, res);
        },
        CANCEL_TIMER => {
            let res = svc::cancel_timer(kernel, tid, handle(regs.r(0)));
            set_result(regs, res);
        },
        CLEAR_TIMER => {
            let res = svc::clear_timer(kernel, tid, handle(regs.r(0)));
            set_result(regs, res);
        },
        CREATE_MEMORY_BLOCK => {
            let other_permissions = regs.r(0).u32();
            let block = svc::create_memory_block(kernel, tid, regs.r(1).u32(), regs.r(2).u32(), regs.r(3).u32(), other_permissions);
            set_result_value(regs, block.map(|handle| handle.raw()));
        },
        MAP_MEMORY_BLOCK => {
            let res = svc::map_memory_block(kernel, tid, handle(regs.r(0)), regs.r(1).u32(), regs.r(2).u32());
            set_result(regs, res);
        },
        UNMAP_MEMORY_BLOCK => {
            let res = svc::unmap_memory_block(kernel, tid, handle(regs.r(0)), regs.r(1).u32());
            set_result(regs, res);
        },
        CREATE_ADDRESS_ARBITER => {
            let arbiter = svc::create_address_arbiter(kernel, tid);
            set_result_value(regs, arbiter.map(|handle| handle.raw()));
        },
        ARBITRATE_ADDRESS => {
            let timeout = make_ns(regs.r(4).u32(), regs.r(5).u32());
            let completion = svc::arbitrate_address(kernel, tid, handle(regs.r(0)), regs.r(1).u32(), regs.r(2).u32(), regs.r(3).i32(), timeout);
            result = complete(regs, completion);
        },
        CLOSE_HANDLE => {
            let res = svc::close_handle(kernel, tid, handle(regs.r(0)));
            set_result(regs, res);
        },
        WAIT_SYNCHRONIZATION_1 => {
            let timeout = make_ns(regs.r(2).u32(), regs.r(3).u32());
            let completion = svc::wait_synchronization_1(kernel, tid, handle(regs.r(0)), timeout);
            result = complete(regs, completion);
        },
        WAIT_SYNCHRONIZATION_N => {
            let timeout = make_ns(regs.r(0).u32(), regs.r(4).u32());
            let wait_all = regs.r(3).u32() != 0;
            let completion = read_handles(kernel, tid, regs.r(1).u32(), regs.r(2))
                .and_then(|handles| svc::wait_synchronization_n(kernel, tid, &handles, wait_all, timeout));
            result = complete(regs, completion);
        },
        DUPLICATE_HANDLE => {
            let duplicate = svc::duplicate_handle(kernel, tid, handle(regs.r(1)));
            set_result_value(regs, duplicate.map(|handle| handle.raw()));
        },
        GET_SYSTEM_TICK => {
            let ticks = svc::get_system_tick(kernel);
            regs.sr(0, (ticks as u32).into());
            regs.sr(1, ((ticks >> 32) as u32).into());
        },
        CONNECT_TO_PORT => {
            let session = read_port_name(kernel, tid, regs.r(1).u32())
                .and_then(|name| svc::connect_to_port(kernel, tid, &name));
            set_result_value(regs, session.map(|handle| handle.raw()));
        },
        SEND_SYNC_REQUEST => {
            let completion = svc::send_sync_request(kernel, tid, handle(regs.r(0)));
            result = complete(regs, completion);
        },
        GET_PROCESS_ID => {
            let process_id = svc::get_process_id(kernel, tid, handle(regs.r(1)));
            set_result_value(regs, process_id);
        },
        GET_THREAD_ID => {
            let thread_id = svc::get_thread_id(kernel, tid, handle(regs.r(1)));
            set_result_value(regs, thread_id);
        },
        CREATE_PORT => {
            let name_address = regs.r(2).u32();
            let max_sessions = regs.r(3).u32();
            let ports = if name_address == 0 {
                svc::create_port(kernel, tid, None, max_sessions)
            } else {
                read_port_name(kernel, tid, name_address)
                    .and_then(|name| svc::create_port(kernel, tid, Some(&name), max_sessions))
            };
            match ports {
                Ok((server, client)) => {
                    regs.sr(0, 0.into());
                    regs.sr(1, server.raw().into());
                    regs.sr(2, raw_handle(client).into());
                },
                Err(err) => regs.sr(0, err.raw().into()),
            }
        },
        CREATE_SESSION_TO_PORT => {
            let session = svc::create_session_to_port(kernel, tid, handle(regs.r(1)));
            set_result_value(regs, session.map(|handle| handle.raw()));
        },
        CREATE_SESSION => {
            match svc::create_session(kernel, tid) {
                Ok((server, client)) => {
                    regs.sr(0, 0.into());
                    regs.sr(1, server.raw().into());
                    regs.sr(2, client.raw().into());
                },
                Err(err) => regs.sr(0, err.raw().into()),
            }
        },
        ACCEPT_SESSION => {
            let session = svc::accept_session(kernel, tid, handle(regs.r(1)));
            set_result_value(regs, session.map(|handle| handle.raw()));
        },
        REPLY_AND_RECEIVE => {
            let handles = match read_handles(kernel, tid, regs.r(1).u32(), regs.r(2)) {
                Ok(handles) => handles,
                Err(err) => {
                    regs.sr(0, err.raw().into());
                    return result
                }
            };
            let reply_target = handle(regs.r(3));

            match svc::reply_and_receive_pre(kernel, tid, &handles, reply_target) {
                Ok(Completion::Immediate { index: Some(index) }) => {
                    let received = svc::reply_and_receive_post(kernel, tid, &handles, index);
                    set_result(regs, received);
                    regs.sr(1, (index as u32).into());
                },
                Ok(Completion::Immediate { index: None }) => regs.sr(0, 0.into()),
                Ok(Completion::Suspended) => {
                    regs.sr(0, 0.into());
                    pending.reply_and_receive.insert(tid, handles);
                    result = SvcResult::Reschedule;
                },
                Err(err) => regs.sr(0, err.raw().into()),
            }
        },
        BIND_INTERRUPT => {
            let res = svc::bind_interrupt(kernel, tid, regs.r(0).u32(), handle(regs.r(1)), regs.r(2).i32(), regs.r(3).u32() != 0);
            set_result(regs, res);
        },
        UNBIND_INTERRUPT => {
            let res = svc::unbind_interrupt(kernel, tid, regs.r(0).u32(), handle(regs.r(1)));
            set_result(regs, res);
        },
        number => {
            let err = svc::unimplemented(number);
            regs.sr(0, err.raw().into());
        }
    }

    result
}

/// Finishes the syscall `tid` blocked in, now that the kernel has woken it with `resume`.
pub fn resume_svc(kernel: &mut Kernel, pending: &mut PendingCalls, tid: ThreadId, resume: ThreadResume, regs: &mut impl Regs) {
    if let Some(handles) = pending.reply_and_receive.remove(&tid) {
        let (index, received) = svc::reply_and_receive_resume(kernel, tid, &handles, resume);
        set_result(regs, received);
        if let Some(index) = index {
            regs.sr(1, (index as u32).into());
        }
        return
    }

    match resume {
        ThreadResume::Normal => regs.sr(0, 0.into()),
        ThreadResume::Signaled { index } => {
            regs.sr(0, 0.into());
            if let Some(index) = index {
                regs.sr(1, (index as u32).into());
            }
        },
        ThreadResume::TimeoutReached => regs.sr(0, KernelError::Timeout.raw().into()),
        ThreadResume::Error { result, index } => {
            warn!("{:?} woke with {}", tid, result);
            regs.sr(0, result.raw().into());
            if let Some(index) = index {
                regs.sr(1, (index as u32).into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_join_both_halves() {
        assert_eq!(make_ns(0, 0), 0);
        assert_eq!(make_ns(0x3B9ACA00, 0), 1_000_000_000);
        assert_eq!(make_ns(0xFFFFFFFF, 0xFFFFFFFF), -1);
        assert_eq!(make_ns(0, 1), 1 << 32);
    }

    #[test]
    fn register_values_reinterpret() {
        let value = RegValue::from(-2);
        assert_eq!(value.u32(), 0xFFFFFFFE);
        assert_eq!(u32::from(value), 0xFFFFFFFE);
        assert_eq!(i32::from(RegValue::from(0x80000000u32)), i32::MIN);
    }
}
