//! `ndm:u`, the network daemon manager. Only daemon bookkeeping; nothing is networked.

use log::debug;

use kumquat_kernel::{HLERequestContext, KResult, Kernel, KernelError, ResultCode};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum DaemonStatus {
    Busy = 0,
    Idle = 1,
    Suspending = 2,
    Suspended = 3,
}

const DAEMON_COUNT: usize = 4;
const DEFAULT_DAEMON_MASK: u32 = 0xF;

pub struct Ndm {
    daemon_bit_mask: u32,
    default_daemon_bit_mask: u32,
    daemon_status: [DaemonStatus; DAEMON_COUNT],
    exclusive_state: u32,
}

crate::declare_service! {
    Ndm: "ndm:u", max_sessions 6;
    0x00010042 => "EnterExclusiveState" => Ndm::enter_exclusive_state,
    0x00020002 => "LeaveExclusiveState" => Ndm::leave_exclusive_state,
    0x00030000 => "QueryExclusiveMode" => Ndm::query_exclusive_mode,
    0x00060040 => "SuspendDaemons" => Ndm::suspend_daemons,
    0x00070040 => "ResumeDaemons" => Ndm::resume_daemons,
    0x00080040 => "SuspendScheduler",
    0x00090000 => "ResumeScheduler",
    0x000D0040 => "QueryStatus" => Ndm::query_status,
    0x00140040 => "OverrideDefaultDaemons" => Ndm::override_default_daemons,
    0x00150000 => "ResetDefaultDaemons" => Ndm::reset_default_daemons,
    0x00160000 => "GetDefaultDaemons" => Ndm::get_default_daemons,
}

impl Default for Ndm {
    fn default() -> Self {
        Ndm {
            daemon_bit_mask: DEFAULT_DAEMON_MASK,
            default_daemon_bit_mask: DEFAULT_DAEMON_MASK,
            daemon_status: [DaemonStatus::Idle; DAEMON_COUNT],
            exclusive_state: 0,
        }
    }
}

impl Ndm {
    pub fn new() -> Ndm {
        Ndm::default()
    }

    pub fn daemon_status(&self, daemon: usize) -> Option<DaemonStatus> {
        self.daemon_status.get(daemon).copied()
    }

    fn enter_exclusive_state(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        self.exclusive_state = context.pop_u32()?;
        let _pid = context.pop_pid()?;
        debug!("ndm::EnterExclusiveState({})", self.exclusive_state);
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn leave_exclusive_state(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let _pid = context.pop_pid()?;
        self.exclusive_state = 0;
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn query_exclusive_mode(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        context.respond(ResultCode::SUCCESS)
            .push_u32(self.exclusive_state);
        Ok(())
    }

    fn suspend_daemons(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let mask = context.pop_u32()?;
        self.daemon_bit_mask &= !mask;
        for (index, status) in self.daemon_status.iter_mut().enumerate() {
            if mask & (1 << index) != 0 {
                *status = DaemonStatus::Suspended;
            }
        }
        debug!("ndm::SuspendDaemons({:#X}) -> {:#X}", mask, self.daemon_bit_mask);
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn resume_daemons(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let mask = context.pop_u32()?;
        self.daemon_bit_mask |= mask & DEFAULT_DAEMON_MASK;
        for (index, status) in self.daemon_status.iter_mut().enumerate() {
            if mask & (1 << index) != 0 {
                *status = DaemonStatus::Idle;
            }
        }
        debug!("ndm::ResumeDaemons({:#X}) -> {:#X}", mask, self.daemon_bit_mask);
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn query_status(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let daemon = context.pop_u32()? as usize;
        let status = self.daemon_status(daemon).ok_or(KernelError::OutOfRange)?;
        context.respond(ResultCode::SUCCESS)
            .push_u32(status as u32);
        Ok(())
    }

    fn override_default_daemons(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let mask = context.pop_u32()?;
        if mask & !DEFAULT_DAEMON_MASK != 0 {
            return Err(KernelError::OutOfRange)
        }
        self.default_daemon_bit_mask = mask;
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn reset_default_daemons(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        self.default_daemon_bit_mask = DEFAULT_DAEMON_MASK;
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn get_default_daemons(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        context.respond(ResultCode::SUCCESS)
            .push_u32(self.default_daemon_bit_mask);
        Ok(())
    }
}
