use log::trace;

use crate::errors::{KernelError, KResult};
use crate::object::{ObjectId, ProcessId};
use crate::process::LimitCategory;
use crate::sync::ResetType;
use crate::timing::ns_to_cycles;
use crate::wait::WaitQueue;
use crate::Kernel;

pub struct KTimer {
    pub reset_type: ResetType,
    pub signaled: bool,
    pub initial_delay: u64,
    pub interval_delay: u64,
    pub name: String,
    pub waiters: WaitQueue,
}

impl KTimer {
    pub fn new(reset_type: ResetType) -> KTimer {
        KTimer {
            reset_type,
            signaled: false,
            initial_delay: 0,
            interval_delay: 0,
            name: String::from("Timer"),
            waiters: WaitQueue::new(),
        }
    }
}

impl Kernel {
    pub fn create_timer(&mut self, owner: ProcessId, reset_type: ResetType) -> KResult<ObjectId> {
        let charge = self.reserve_charge(owner, LimitCategory::Timer)?;
        Ok(self.objects.insert_charged(KTimer::new(reset_type), Some(charge)))
    }

    /// Arms the timer to fire after `initial_ns`, then every `interval_ns` if that is non-zero.
    pub fn set_timer(&mut self, timer: ObjectId, initial_ns: i64, interval_ns: i64) -> KResult<()> {
        if initial_ns < 0 || interval_ns < 0 {
            return Err(KernelError::OutOfRange)
        }

        let data = self.objects.get_mut::<KTimer>(timer).ok_or(KernelError::InvalidHandle)?;
        data.initial_delay = initial_ns as u64;
        data.interval_delay = interval_ns as u64;

        let event = self.timer_event;
        self.timing.remove_event(event, timer.raw() as u64);

        if initial_ns == 0 {
            self.timer_signal(timer, 0);
        } else {
            self.timing.schedule_event(ns_to_cycles(initial_ns as u64), event, timer.raw() as u64);
        }
        Ok(())
    }

    pub fn cancel_timer(&mut self, timer: ObjectId) -> KResult<()> {
        self.objects.get::<KTimer>(timer).ok_or(KernelError::InvalidHandle)?;
        let event = self.timer_event;
        self.timing.remove_event(event, timer.raw() as u64);
        Ok(())
    }

    pub fn clear_timer(&mut self, timer: ObjectId) -> KResult<()> {
        self.objects.get_mut::<KTimer>(timer).ok_or(KernelError::InvalidHandle)?.signaled = false;
        Ok(())
    }

    /// Fires the timer, re-arming periodic timers so lateness does not accumulate.
    pub(crate) fn timer_signal(&mut self, timer: ObjectId, cycles_late: u64) {
        let (reset_type, interval) = match self.objects.get_mut::<KTimer>(timer) {
            Some(data) => {
                data.signaled = true;
                (data.reset_type, data.interval_delay)
            },
            None => return,
        };

        trace!("timer {:?} fired {} cycles late", timer, cycles_late);
        self.wakeup_all_waiting_threads(timer);

        if reset_type == ResetType::Pulse {
            if let Some(data) = self.objects.get_mut::<KTimer>(timer) {
                data.signaled = false;
            }
        }

        if interval != 0 {
            let event = self.timer_event;
            let delay = ns_to_cycles(interval).saturating_sub(cycles_late);
            self.timing.schedule_event(delay, event, timer.raw() as u64);
        }
    }
}
