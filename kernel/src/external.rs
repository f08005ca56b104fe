//! Requests from host threads.
//!
//! Kernel state belongs to the emulation thread. Other host threads only queue requests here, and
//! the run loop applies them between slices.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::errors::{KernelError, KResult};
use crate::object::{ObjectId, ObjectKind};
use crate::Kernel;

#[derive(Default)]
struct Pending {
    interrupts: Vec<u32>,
    shutdown: bool,
}

/// Shared with host threads through an `Arc`.
#[derive(Default)]
pub struct ExternalRequests {
    pending: Mutex<Pending>,
}

impl ExternalRequests {
    pub fn new() -> Arc<ExternalRequests> {
        Arc::new(ExternalRequests::default())
    }

    pub fn raise_interrupt(&self, interrupt: u32) {
        self.pending.lock().interrupts.push(interrupt);
    }

    pub fn request_shutdown(&self) {
        self.pending.lock().shutdown = true;
    }

    /// Takes queued interrupts in raise order, and whether shutdown was requested.
    pub fn drain(&self) -> (Vec<u32>, bool) {
        let mut pending = self.pending.lock();
        let interrupts = std::mem::take(&mut pending.interrupts);
        (interrupts, pending.shutdown)
    }
}

impl Kernel {
    pub fn external_requests(&self) -> Arc<ExternalRequests> {
        self.external.clone()
    }

    /// BindInterrupt: signal `event` whenever `interrupt` is raised.
    pub fn bind_interrupt(&mut self, interrupt: u32, event: ObjectId) -> KResult<()> {
        if self.objects.kind(event) != Some(ObjectKind::Event) {
            return Err(KernelError::InvalidHandle)
        }
        if self.interrupts.contains_key(&interrupt) {
            return Err(KernelError::AlreadyRegistered)
        }
        self.objects.retain(event);
        self.interrupts.insert(interrupt, event);
        debug!("bound interrupt {:#X} to {:?}", interrupt, event);
        Ok(())
    }

    pub fn unbind_interrupt(&mut self, interrupt: u32, event: ObjectId) -> KResult<()> {
        match self.interrupts.get(&interrupt) {
            Some(bound) if *bound == event => {},
            _ => return Err(KernelError::NotFound),
        }
        self.interrupts.remove(&interrupt);
        self.release_object(event);
        Ok(())
    }

    /// Applies queued host requests. Returns true when shutdown was requested.
    pub fn process_external_requests(&mut self) -> bool {
        let (interrupts, shutdown) = self.external.drain();
        for interrupt in interrupts {
            match self.interrupts.get(&interrupt).copied() {
                Some(event) => {
                    if let Err(err) = self.signal_event(event) {
                        warn!("interrupt {:#X} could not signal {:?}: {}", interrupt, event, err);
                    }
                },
                None => debug!("dropping unbound interrupt {:#X}", interrupt),
            }
        }
        shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_keeps_shutdown_sticky() {
        let requests = ExternalRequests::new();
        requests.raise_interrupt(0x2A);
        requests.raise_interrupt(0x28);
        assert_eq!(requests.drain(), (vec![0x2A, 0x28], false));
        requests.request_shutdown();
        assert_eq!(requests.drain(), (vec![], true));
        assert_eq!(requests.drain(), (vec![], true));
    }

    #[test]
    fn raise_from_another_thread() {
        let requests = ExternalRequests::new();
        let remote = requests.clone();
        std::thread::spawn(move || remote.raise_interrupt(7)).join().unwrap();
        assert_eq!(requests.drain().0, vec![7]);
    }
}
