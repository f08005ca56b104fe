use crate::errors::{KernelError, KResult};
use crate::object::{ObjectId, ProcessId};
use crate::process::LimitCategory;
use crate::sync::ResetType;
use crate::wait::WaitQueue;
use crate::Kernel;

pub struct KEvent {
    pub reset_type: ResetType,
    pub signaled: bool,
    pub name: String,
    pub waiters: WaitQueue,
}

impl KEvent {
    pub fn new(reset_type: ResetType) -> KEvent {
        KEvent {
            reset_type,
            signaled: false,
            name: String::from("Event"),
            waiters: WaitQueue::new(),
        }
    }
}

impl Kernel {
    pub fn create_event(&mut self, owner: ProcessId, reset_type: ResetType) -> KResult<ObjectId> {
        let charge = self.reserve_charge(owner, LimitCategory::Event)?;
        Ok(self.objects.insert_charged(KEvent::new(reset_type), Some(charge)))
    }

    /// Signals the event. OneShot events stay signaled until a waiter consumes them, Sticky
    /// events until cleared, and Pulse events only for the waiters present right now.
    pub fn signal_event(&mut self, event: ObjectId) -> KResult<()> {
        self.objects.get_mut::<KEvent>(event).ok_or(KernelError::InvalidHandle)?.signaled = true;
        self.wakeup_all_waiting_threads(event);

        if let Some(data) = self.objects.get_mut::<KEvent>(event) {
            if data.reset_type == ResetType::Pulse {
                data.signaled = false;
            }
        }
        Ok(())
    }

    pub fn clear_event(&mut self, event: ObjectId) -> KResult<()> {
        self.objects.get_mut::<KEvent>(event).ok_or(KernelError::InvalidHandle)?.signaled = false;
        Ok(())
    }
}
