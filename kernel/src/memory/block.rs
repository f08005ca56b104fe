use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::Memory;
use crate::errors::{KernelError, KResult};

/// A shareable run of host bytes backing one or more guest mappings.
#[derive(Clone)]
pub struct MemoryBlock(Rc<RefCell<Box<[u8]>>>);

impl MemoryBlock {
    pub fn new(size: u32) -> MemoryBlock {
        MemoryBlock(Rc::new(RefCell::new(vec![0u8; size as usize].into_boxed_slice())))
    }

    pub fn len(&self) -> u32 {
        self.0.borrow().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles refer to the same host bytes.
    pub fn ptr_eq(&self, other: &MemoryBlock) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn range(&self, offset: u32, len: usize) -> KResult<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(KernelError::InvalidAddress)?;
        if end > self.0.borrow().len() {
            return Err(KernelError::InvalidAddress)
        }
        Ok(start..end)
    }
}

impl Memory for MemoryBlock {
    fn read(&self, addr: u32, bytes: &mut [u8]) -> KResult<()> {
        let range = self.range(addr, bytes.len())?;
        bytes.copy_from_slice(&self.0.borrow()[range]);
        Ok(())
    }

    fn write(&self, addr: u32, bytes: &[u8]) -> KResult<()> {
        let range = self.range(addr, bytes.len())?;
        self.0.borrow_mut()[range].copy_from_slice(bytes);
        Ok(())
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MemoryBlock({:#X} bytes)", self.len())
    }
}
