//! Guest synchronization objects.

mod arbiter;
mod condvar;
mod event;
mod mutex;
mod semaphore;
mod timer;

pub use self::arbiter::{ArbitrationAction, ArbitrationFail, ArbitrationType, KAddressArbiter};
pub use self::condvar::KConditionVariable;
pub use self::event::KEvent;
pub use self::mutex::KMutex;
pub use self::semaphore::KSemaphore;
pub use self::timer::KTimer;

use crate::errors::{KernelError, KResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetType {
    OneShot,
    Sticky,
    Pulse
}

impl ResetType {
    pub fn from_raw(id: u32) -> KResult<ResetType> {
        match id {
            0 => Ok(ResetType::OneShot),
            1 => Ok(ResetType::Sticky),
            2 => Ok(ResetType::Pulse),
            _ => Err(KernelError::InvalidEnumValue)
        }
    }
}
