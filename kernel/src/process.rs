use log::{debug, info};

use crate::config::LimitsConfig;
use crate::errors::{KernelError, KResult};
use crate::handle_table::HandleTable;
use crate::memory::{AddressSpace, MemoryBlock, MemoryPermission, MemoryRegion, MemoryState, PhysicalAllocation, PAGE_SIZE};
use crate::memory::kmm::FCRAM_PADDR;
use crate::object::{ProcessId, ResourceCharge, ThreadId};
use crate::wait::WaitQueue;
use crate::Kernel;

pub const TLS_AREA_VADDR: u32 = 0x1FF82000;
pub const TLS_ENTRY_SIZE: u32 = 0x200;
pub const TLS_SLOTS_PER_PAGE: u32 = PAGE_SIZE / TLS_ENTRY_SIZE;
pub const MAX_TLS_PAGES: u32 = 0x7E000 / PAGE_SIZE;

pub const HEAP_VADDR: u32 = 0x08000000;
pub const HEAP_VADDR_END: u32 = 0x10000000;
pub const LINEAR_HEAP_VADDR: u32 = 0x14000000;
pub const LINEAR_HEAP_VADDR_END: u32 = 0x1C000000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LimitCategory {
    Priority = 0,
    Commit,
    Thread,
    Event,
    Mutex,
    Semaphore,
    Timer,
    SharedMemory,
    AddressArbiter,
    CpuTime,
}

pub const LIMIT_CATEGORY_COUNT: usize = 10;

impl LimitCategory {
    pub fn from_raw(raw: u32) -> KResult<LimitCategory> {
        use LimitCategory::*;
        Ok(match raw {
            0 => Priority,
            1 => Commit,
            2 => Thread,
            3 => Event,
            4 => Mutex,
            5 => Semaphore,
            6 => Timer,
            7 => SharedMemory,
            8 => AddressArbiter,
            9 => CpuTime,
            _ => return Err(KernelError::InvalidEnumValue),
        })
    }
}

/// Per-category maximums and current usage.
///
/// `Priority` is special: its maximum is the best (numerically lowest) priority threads of the
/// process may use, and nothing is ever reserved against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    max: [u64; LIMIT_CATEGORY_COUNT],
    current: [u64; LIMIT_CATEGORY_COUNT],
}

impl ResourceLimits {
    pub fn new(max: [u64; LIMIT_CATEGORY_COUNT]) -> ResourceLimits {
        ResourceLimits {
            max,
            current: [0; LIMIT_CATEGORY_COUNT],
        }
    }

    pub fn unlimited() -> ResourceLimits {
        let mut max = [u64::MAX; LIMIT_CATEGORY_COUNT];
        max[LimitCategory::Priority as usize] = 0;
        ResourceLimits::new(max)
    }

    /// The limits the console gives an application.
    pub fn application() -> ResourceLimits {
        ResourceLimits::new([0x18, 0x4000000, 0x20, 0x20, 0x20, 0x8, 0x8, 0x10, 0x2, 0x1E])
    }

    pub fn max(&self, category: LimitCategory) -> u64 {
        self.max[category as usize]
    }

    pub fn current(&self, category: LimitCategory) -> u64 {
        self.current[category as usize]
    }

    /// Reserves `amount` units; fails without changing anything if that would exceed the maximum.
    pub fn reserve(&mut self, category: LimitCategory, amount: u64) -> KResult<()> {
        let index = category as usize;
        match self.current[index].checked_add(amount) {
            Some(total) if total <= self.max[index] => {
                self.current[index] = total;
                Ok(())
            },
            _ => Err(KernelError::ResourceLimitExceeded),
        }
    }

    pub fn release(&mut self, category: LimitCategory, amount: u64) {
        let index = category as usize;
        assert!(self.current[index] >= amount, "Releasing more {:?} than was reserved", category);
        self.current[index] -= amount;
    }
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(config: &LimitsConfig) -> ResourceLimits {
        ResourceLimits::new([
            config.priority as u64,
            config.commit as u64,
            config.threads as u64,
            config.events as u64,
            config.mutexes as u64,
            config.semaphores as u64,
            config.timers as u64,
            config.shared_memories as u64,
            config.address_arbiters as u64,
            config.cpu_time as u64,
        ])
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Created,
    Running,
    Exited,
}

struct TlsPage {
    address: u32,
    used: u8,
}

/// Heap memory committed through ControlMemory.
#[derive(Debug, Clone)]
pub struct HeapAllocation {
    pub address: u32,
    pub physical: PhysicalAllocation,
}

pub struct KProcess {
    pub process_id: u32,
    pub name: String,
    pub handle_table: HandleTable,
    pub limits: ResourceLimits,
    pub address_space: AddressSpace,
    pub threads: Vec<ThreadId>,
    pub status: ProcessStatus,
    pub memory_region: MemoryRegion,
    pub heap: Vec<HeapAllocation>,
    tls_pages: Vec<TlsPage>,
    pub waiters: WaitQueue,
}

impl KProcess {
    /// Hands out a 0x200-byte thread local storage slot, mapping a new TLS page when needed.
    pub fn allocate_tls(&mut self) -> KResult<u32> {
        for page in &mut self.tls_pages {
            if page.used != 0xFF {
                let slot = (!page.used).trailing_zeros();
                page.used |= 1 << slot;
                return Ok(page.address + slot * TLS_ENTRY_SIZE)
            }
        }

        let index = self.tls_pages.len() as u32;
        if index >= MAX_TLS_PAGES {
            return Err(KernelError::ResourceLimitExceeded)
        }

        let address = TLS_AREA_VADDR + index * PAGE_SIZE;
        self.address_space.map(address, PAGE_SIZE, MemoryBlock::new(PAGE_SIZE), 0, MemoryPermission::READ_WRITE, MemoryState::Locked)?;
        self.tls_pages.push(TlsPage { address, used: 1 });
        Ok(address)
    }

    pub fn free_tls(&mut self, address: u32) {
        let page_address = address & !(PAGE_SIZE - 1);
        let slot = (address - page_address) / TLS_ENTRY_SIZE;
        if let Some(page) = self.tls_pages.iter_mut().find(|page| page.address == page_address) {
            page.used &= !(1 << slot);
        }
    }
}

pub mod memory_operation {
    pub const FREE: u32 = 1;
    pub const RESERVE: u32 = 2;
    pub const COMMIT: u32 = 3;
    pub const MAP: u32 = 4;
    pub const UNMAP: u32 = 5;
    pub const PROTECT: u32 = 6;
    pub const OPERATION_MASK: u32 = 0xFF;

    pub const LINEAR: u32 = 0x10000;
}

impl Kernel {
    pub fn process(&self, pid: ProcessId) -> &KProcess {
        self.objects.get::<KProcess>(pid).unwrap_or_else(|| panic!("{:?} is not a live process", pid))
    }

    pub fn process_mut(&mut self, pid: ProcessId) -> &mut KProcess {
        self.objects.get_mut::<KProcess>(pid).unwrap_or_else(|| panic!("{:?} is not a live process", pid))
    }

    pub fn processes(&self) -> &[ProcessId] {
        &self.processes
    }

    /// Creates an empty process. The caller owns the returned reference; the kernel's process
    /// list keeps its own until the process exits.
    pub fn create_process(&mut self, name: &str, limits: ResourceLimits, memory_region: MemoryRegion) -> ProcessId {
        let process_id = self.next_process_id;
        self.next_process_id += 1;

        let pid = self.objects.insert(KProcess {
            process_id,
            name: name.to_owned(),
            handle_table: HandleTable::with_capacity(self.config.handle_table_size),
            limits,
            address_space: AddressSpace::new(),
            threads: vec![],
            status: ProcessStatus::Created,
            memory_region,
            heap: vec![],
            tls_pages: vec![],
            waiters: WaitQueue::new(),
        });

        self.objects.retain(pid);
        self.processes.push(pid);

        info!("created process {} ({:?}) with id {}", name, pid, process_id);
        pid
    }

    pub(crate) fn reserve_charge(&mut self, pid: ProcessId, category: LimitCategory) -> KResult<ResourceCharge> {
        self.process_mut(pid).limits.reserve(category, 1)?;
        Ok(ResourceCharge { process: pid, category, amount: 1 })
    }

    /// Terminates every thread of the process; the process exits with its last thread.
    pub fn terminate_process(&mut self, pid: ProcessId) {
        let process = match self.objects.get::<KProcess>(pid) {
            Some(process) => process,
            None => return,
        };
        if process.status == ProcessStatus::Exited {
            return
        }

        let threads = process.threads.clone();
        debug!("terminating {:?} with {} threads", pid, threads.len());

        if threads.is_empty() {
            self.finalize_process(pid);
            return
        }

        // The process list reference keeps the process alive through the cascade
        for tid in threads {
            self.terminate_thread(tid);
        }
    }

    pub(crate) fn finalize_process(&mut self, pid: ProcessId) {
        let process = self.process_mut(pid);
        if process.status == ProcessStatus::Exited {
            return
        }
        process.status = ProcessStatus::Exited;
        let objects = process.handle_table.clear();
        let heap = std::mem::take(&mut process.heap);

        info!("process {} ({:?}) exited", process.name, pid);

        self.wakeup_all_waiting_threads(pid);

        for object in objects {
            self.release_object(object);
        }

        for allocation in heap {
            self.kmm.free(&allocation.physical);
            let process = self.process_mut(pid);
            if let Err(err) = process.address_space.unmap(allocation.address, allocation.physical.size) {
                debug!("heap at {:#010X} in {:?} was already unmapped: {}", allocation.address, pid, err);
            }
            process.limits.release(LimitCategory::Commit, allocation.physical.size as u64);
        }

        if let Some(index) = self.processes.iter().position(|p| *p == pid) {
            self.processes.remove(index);
            self.release_object(pid);
        }
    }

    /// ControlMemory: commits, frees, aliases and reprotects heap memory.
    pub fn control_memory(&mut self, pid: ProcessId, operation: u32, addr0: u32, addr1: u32, size: u32, permissions: MemoryPermission) -> KResult<u32> {
        use self::memory_operation::*;

        if addr0 & (PAGE_SIZE - 1) != 0 || addr1 & (PAGE_SIZE - 1) != 0 {
            return Err(KernelError::MisalignedAddress)
        }
        if size & (PAGE_SIZE - 1) != 0 {
            return Err(KernelError::MisalignedSize)
        }

        let linear = operation & LINEAR != 0;
        let permissions = permissions & !MemoryPermission::DONT_CARE;

        match operation & OPERATION_MASK {
            COMMIT if linear => self.commit_linear(pid, size, permissions),
            COMMIT => {
                check_heap_range(addr0, size)?;
                self.commit_heap(pid, addr0, size, permissions)?;
                Ok(addr0)
            },
            FREE => {
                self.free_heap(pid, addr0, size)?;
                Ok(addr0)
            },
            MAP => {
                check_heap_range(addr0, size)?;
                let process = self.process_mut(pid);
                let (backing, offset) = process.address_space.backing_at(addr1, size)?;
                process.address_space.map(addr0, size, backing, offset, permissions, MemoryState::Alias)?;
                Ok(addr0)
            },
            UNMAP => {
                let process = self.process_mut(pid);
                match process.address_space.query(addr0).state {
                    MemoryState::Alias => {},
                    _ => return Err(KernelError::InvalidAddressState),
                }
                process.address_space.unmap(addr0, size)?;
                Ok(addr0)
            },
            PROTECT => {
                self.process_mut(pid).address_space.reprotect(addr0, size, permissions)?;
                Ok(addr0)
            },
            _ => Err(KernelError::InvalidCombination),
        }
    }

    fn commit_heap(&mut self, pid: ProcessId, address: u32, size: u32, permissions: MemoryPermission) -> KResult<()> {
        let physical = self.allocate_commit(pid, size)?;
        self.map_commit(pid, address, physical, permissions, MemoryState::Private)
    }

    fn commit_linear(&mut self, pid: ProcessId, size: u32, permissions: MemoryPermission) -> KResult<u32> {
        let physical = self.allocate_commit(pid, size)?;
        let address = LINEAR_HEAP_VADDR + (physical.paddr - FCRAM_PADDR);
        self.map_commit(pid, address, physical, permissions, MemoryState::Continuous)?;
        Ok(address)
    }

    /// Charges the Commit limit and takes pages from the process's memory region.
    fn allocate_commit(&mut self, pid: ProcessId, size: u32) -> KResult<PhysicalAllocation> {
        let region = self.process(pid).memory_region;
        self.process_mut(pid).limits.reserve(LimitCategory::Commit, size as u64)?;

        match self.kmm.allocate_linear(region, size) {
            Some(physical) => Ok(physical),
            None => {
                self.process_mut(pid).limits.release(LimitCategory::Commit, size as u64);
                Err(KernelError::ResourceLimitExceeded)
            }
        }
    }

    fn map_commit(&mut self, pid: ProcessId, address: u32, physical: PhysicalAllocation, permissions: MemoryPermission, state: MemoryState) -> KResult<()> {
        let process = self.process_mut(pid);
        if let Err(err) = process.address_space.map(address, physical.size, physical.backing.clone(), 0, permissions, state) {
            process.limits.release(LimitCategory::Commit, physical.size as u64);
            self.kmm.free(&physical);
            return Err(err)
        }

        debug!("{:?} committed {:#X} bytes at {:#010X} (paddr {:#010X})", pid, physical.size, address, physical.paddr);
        process.heap.push(HeapAllocation { address, physical });
        Ok(())
    }

    fn free_heap(&mut self, pid: ProcessId, address: u32, size: u32) -> KResult<()> {
        let process = self.process_mut(pid);
        let index = process.heap.iter()
            .position(|allocation| allocation.address == address)
            .ok_or(KernelError::InvalidAddressState)?;
        if process.heap[index].physical.size != size {
            return Err(KernelError::InvalidAddressState)
        }

        process.address_space.unmap(address, size)?;
        let allocation = process.heap.remove(index);
        process.limits.release(LimitCategory::Commit, size as u64);
        self.kmm.free(&allocation.physical);
        Ok(())
    }
}

fn check_heap_range(address: u32, size: u32) -> KResult<()> {
    match address.checked_add(size) {
        Some(end) if address >= HEAP_VADDR && end <= HEAP_VADDR_END => Ok(()),
        _ => Err(KernelError::InvalidAddress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_fails_without_mutation() {
        let mut limits = ResourceLimits::application();
        for _ in 0..0x20 {
            limits.reserve(LimitCategory::Thread, 1).unwrap();
        }
        assert_eq!(limits.reserve(LimitCategory::Thread, 1), Err(KernelError::ResourceLimitExceeded));
        assert_eq!(limits.current(LimitCategory::Thread), 0x20);
        limits.release(LimitCategory::Thread, 1);
        assert_eq!(limits.reserve(LimitCategory::Thread, 1), Ok(()));
    }

    #[test]
    fn unlimited_allows_any_priority() {
        let limits = ResourceLimits::unlimited();
        assert_eq!(limits.max(LimitCategory::Priority), 0);
        assert_eq!(limits.max(LimitCategory::Event), u64::MAX);
    }

    #[test]
    fn limit_categories_round_trip_raw_values() {
        assert_eq!(LimitCategory::from_raw(9), Ok(LimitCategory::CpuTime));
        assert_eq!(LimitCategory::from_raw(10), Err(KernelError::InvalidEnumValue));
    }
}
