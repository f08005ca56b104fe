use crate::errors::{KernelError, KResult};
use crate::object::{ObjectId, ProcessId};
use crate::process::LimitCategory;
use crate::wait::WaitQueue;
use crate::Kernel;

pub struct KSemaphore {
    pub count: i32,
    pub max_count: i32,
    pub name: String,
    pub waiters: WaitQueue,
}

impl Kernel {
    pub fn create_semaphore(&mut self, owner: ProcessId, initial_count: i32, max_count: i32) -> KResult<ObjectId> {
        if initial_count > max_count {
            return Err(KernelError::InvalidCombination)
        }
        if initial_count < 0 {
            return Err(KernelError::OutOfRange)
        }

        let charge = self.reserve_charge(owner, LimitCategory::Semaphore)?;
        Ok(self.objects.insert_charged(KSemaphore {
            count: initial_count,
            max_count,
            name: String::from("Semaphore"),
            waiters: WaitQueue::new(),
        }, Some(charge)))
    }

    /// Adds `release_count` to the semaphore and returns the count it had before.
    pub fn release_semaphore(&mut self, semaphore: ObjectId, release_count: i32) -> KResult<i32> {
        let data = self.objects.get_mut::<KSemaphore>(semaphore).ok_or(KernelError::InvalidHandle)?;
        if release_count < 0 || data.max_count - data.count < release_count {
            return Err(KernelError::OutOfRange)
        }

        let previous = data.count;
        data.count += release_count;
        self.wakeup_all_waiting_threads(semaphore);
        Ok(previous)
    }
}
