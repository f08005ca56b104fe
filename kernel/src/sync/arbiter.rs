use log::trace;

use crate::errors::{KernelError, KResult};
use crate::memory::Memory;
use crate::object::{ObjectId, ProcessId, ThreadId};
use crate::process::LimitCategory;
use crate::thread::{ThreadResume, ThreadStatus};
use crate::wait::{Completion, Timeout};
use crate::Kernel;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArbitrationType {
    Signal,
    WaitIfLessThan,
    DecrementAndWaitIfLessThan,
    WaitIfLessThanTimeout,
    DecrementAndWaitIfLessThanTimeout,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArbitrationAction {
    Signal,
    Decrement
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArbitrationFail {
    Wait,
    WaitTimeout
}

impl ArbitrationType {
    pub fn from_raw(x: u32) -> KResult<ArbitrationType> {
        match x {
            0 => Ok(ArbitrationType::Signal),
            1 => Ok(ArbitrationType::WaitIfLessThan),
            2 => Ok(ArbitrationType::DecrementAndWaitIfLessThan),
            3 => Ok(ArbitrationType::WaitIfLessThanTimeout),
            4 => Ok(ArbitrationType::DecrementAndWaitIfLessThanTimeout),
            _ => Err(KernelError::InvalidEnumValue)
        }
    }

    /// Decides what to do with the word at the arbitrated address. The word is only read when
    /// the type needs it.
    pub fn arbitrate(self, memory_value: impl FnOnce() -> KResult<i32>, value: i32) -> KResult<(Option<ArbitrationAction>, Result<(), ArbitrationFail>)> {
        Ok(match self {
            ArbitrationType::Signal => (Some(ArbitrationAction::Signal), Ok(())),
            ArbitrationType::WaitIfLessThan => (None, if memory_value()? < value { Err(ArbitrationFail::Wait) } else { Ok(()) }),
            ArbitrationType::DecrementAndWaitIfLessThan =>
                if memory_value()? < value {
                    (Some(ArbitrationAction::Decrement), Err(ArbitrationFail::Wait))
                } else {
                    (None, Ok(()))
                },
            ArbitrationType::WaitIfLessThanTimeout => (None, if memory_value()? < value { Err(ArbitrationFail::WaitTimeout) } else { Ok(()) }),
            ArbitrationType::DecrementAndWaitIfLessThanTimeout =>
                if memory_value()? < value {
                    (Some(ArbitrationAction::Decrement), Err(ArbitrationFail::WaitTimeout))
                } else {
                    (None, Ok(()))
                },
        })
    }
}

pub struct KAddressArbiter {
    pub owner: ProcessId,
    pub name: String,
    pub waiters: Vec<(ThreadId, u32)>,
}

impl Kernel {
    pub fn create_address_arbiter(&mut self, owner: ProcessId) -> KResult<ObjectId> {
        let charge = self.reserve_charge(owner, LimitCategory::AddressArbiter)?;
        Ok(self.objects.insert_charged(KAddressArbiter {
            owner,
            name: String::from("AddressArbiter"),
            waiters: vec![],
        }, Some(charge)))
    }

    pub fn arbitrate_address(&mut self, tid: ThreadId, arbiter: ObjectId, address: u32, ty: ArbitrationType, value: i32, timeout_ns: i64) -> KResult<Completion> {
        let owner = self.objects.get::<KAddressArbiter>(arbiter).ok_or(KernelError::InvalidHandle)?.owner;

        let (action, outcome) = {
            let memory = &self.process(owner).address_space;
            ty.arbitrate(|| memory.read_u32(address).map(|v| v as i32), value)?
        };

        trace!("arbitrate {:?} at {:#010X} value {} -> {:?} {:?}", ty, address, value, action, outcome);

        match action {
            Some(ArbitrationAction::Signal) => self.arbiter_signal(arbiter, address, value),
            Some(ArbitrationAction::Decrement) => {
                let memory = &self.process(owner).address_space;
                let current = memory.read_u32(address)?;
                memory.write_u32(address, current.wrapping_sub(1))?;
            },
            None => {},
        }

        let timeout = match outcome {
            Ok(()) => return Ok(Completion::Immediate { index: None }),
            Err(ArbitrationFail::Wait) => Timeout::Forever,
            Err(ArbitrationFail::WaitTimeout) => Timeout::from_ns(timeout_ns),
        };

        if timeout == Timeout::Instant {
            return Err(KernelError::Timeout)
        }

        self.suspend_thread(tid, ThreadStatus::WaitArbiter);
        self.objects.retain(arbiter);
        self.thread_mut(tid).arbiter_wait = Some((arbiter, address));
        if let Some(data) = self.objects.get_mut::<KAddressArbiter>(arbiter) {
            data.waiters.push((tid, address));
        }
        self.schedule_wakeup(tid, timeout);

        Ok(Completion::Suspended)
    }

    /// Wakes up to `count` threads waiting on `address`, best priority first.
    fn arbiter_signal(&mut self, arbiter: ObjectId, address: u32, count: i32) {
        let mut remaining = if count < 0 { usize::MAX } else { count as usize };
        while remaining > 0 {
            let next = {
                let data = match self.objects.get::<KAddressArbiter>(arbiter) {
                    Some(data) => data,
                    None => return,
                };
                data.waiters.iter()
                    .filter(|(_, addr)| *addr == address)
                    .map(|(tid, _)| *tid)
                    .min_by_key(|tid| self.thread(*tid).current_priority)
            };
            let tid = match next {
                Some(tid) => tid,
                None => return,
            };
            remaining -= 1;

            self.cancel_arbiter_wait(tid);
            self.resume_from_wait(tid, ThreadResume::Normal);
        }
    }

    pub(crate) fn cancel_arbiter_wait(&mut self, tid: ThreadId) {
        if let Some((arbiter, _)) = self.thread_mut(tid).arbiter_wait.take() {
            if let Some(data) = self.objects.get_mut::<KAddressArbiter>(arbiter) {
                data.waiters.retain(|(t, _)| *t != tid);
            }
            self.release_object(arbiter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_never_reads_memory() {
        let result = ArbitrationType::Signal.arbitrate(|| panic!("read"), 1).unwrap();
        assert_eq!(result, (Some(ArbitrationAction::Signal), Ok(())));
    }

    #[test]
    fn decrement_only_when_waiting() {
        let waits = ArbitrationType::DecrementAndWaitIfLessThan.arbitrate(|| Ok(0), 1).unwrap();
        assert_eq!(waits, (Some(ArbitrationAction::Decrement), Err(ArbitrationFail::Wait)));
        let passes = ArbitrationType::DecrementAndWaitIfLessThan.arbitrate(|| Ok(5), 1).unwrap();
        assert_eq!(passes, (None, Ok(())));
    }

    #[test]
    fn timeout_variants_report_timeout_failure() {
        let result = ArbitrationType::WaitIfLessThanTimeout.arbitrate(|| Ok(-3), 0).unwrap();
        assert_eq!(result.1, Err(ArbitrationFail::WaitTimeout));
    }

    #[test]
    fn memory_errors_propagate() {
        let result = ArbitrationType::WaitIfLessThan.arbitrate(|| Err(KernelError::InvalidAddress), 0);
        assert_eq!(result, Err(KernelError::InvalidAddress));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(ArbitrationType::from_raw(5), Err(KernelError::InvalidEnumValue));
    }
}
