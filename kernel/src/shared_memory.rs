use log::debug;

use crate::errors::{KernelError, KResult};
use crate::memory::{is_page_aligned, MemoryBlock, MemoryPermission, MemoryState, PhysicalAllocation};
use crate::object::{ObjectId, ProcessId};
use crate::process::LimitCategory;
use crate::Kernel;

pub struct KSharedMemory {
    pub owner: ProcessId,
    pub name: String,
    pub size: u32,
    /// Where the owner sees the block, if it was created over existing memory.
    pub base_address: u32,
    pub owner_permissions: MemoryPermission,
    pub other_permissions: MemoryPermission,
    pub backing: MemoryBlock,
    pub backing_offset: u32,
    /// Pages taken from the owner's region when the block was created without an address.
    pub physical: Option<PhysicalAllocation>,
}

impl KSharedMemory {
    fn permissions_for(&self, process: ProcessId) -> MemoryPermission {
        if process == self.owner {
            self.owner_permissions
        } else {
            self.other_permissions
        }
    }
}

impl Kernel {
    /// CreateMemoryBlock. With `address == 0` the block gets fresh pages from the owner's region;
    /// otherwise it shares the owner's existing memory at `address`.
    pub fn create_shared_memory(&mut self, owner: ProcessId, address: u32, size: u32, owner_permissions: MemoryPermission, other_permissions: MemoryPermission) -> KResult<ObjectId> {
        if !is_page_aligned(address) {
            return Err(KernelError::MisalignedAddress)
        }
        if size == 0 || !is_page_aligned(size) {
            return Err(KernelError::MisalignedSize)
        }
        if other_permissions.contains(MemoryPermission::EXECUTE) || owner_permissions.contains(MemoryPermission::EXECUTE) {
            return Err(KernelError::InvalidCombination)
        }

        let (backing, backing_offset, physical) = if address == 0 {
            let region = self.process(owner).memory_region;
            let physical = self.kmm.allocate_linear(region, size).ok_or(KernelError::ResourceLimitExceeded)?;
            (physical.backing.clone(), 0, Some(physical))
        } else {
            let (backing, offset) = self.process(owner).address_space.backing_at(address, size)?;
            (backing, offset, None)
        };

        let charge = match self.reserve_charge(owner, LimitCategory::SharedMemory) {
            Ok(charge) => charge,
            Err(err) => {
                if let Some(physical) = &physical {
                    self.kmm.free(physical);
                }
                return Err(err)
            }
        };

        let id = self.objects.insert_charged(KSharedMemory {
            owner,
            name: String::from("SharedMemory"),
            size,
            base_address: address,
            owner_permissions,
            other_permissions,
            backing,
            backing_offset,
            physical,
        }, Some(charge));

        debug!("created shared memory {:?} ({:#X} bytes) for {:?}", id, size, owner);
        Ok(id)
    }

    /// MapMemoryBlock. The requested permissions must be a subset of what the block grants the
    /// mapping process. `address == 0` maps at the block's own base address.
    pub fn map_shared_memory(&mut self, shared_memory: ObjectId, target: ProcessId, address: u32, permissions: MemoryPermission) -> KResult<()> {
        let data = self.objects.get::<KSharedMemory>(shared_memory).ok_or(KernelError::InvalidHandle)?;
        let granted = data.permissions_for(target);
        let permissions = permissions & !MemoryPermission::DONT_CARE;
        if !granted.contains(MemoryPermission::DONT_CARE) && !granted.contains(permissions) {
            return Err(KernelError::InvalidCombination)
        }

        let address = match address {
            0 if data.base_address != 0 => data.base_address,
            0 => return Err(KernelError::InvalidAddress),
            address => address,
        };
        let size = data.size;
        let backing = data.backing.clone();
        let offset = data.backing_offset;

        self.process_mut(target).address_space.map(address, size, backing, offset, permissions, MemoryState::Shared)
    }

    pub fn unmap_shared_memory(&mut self, shared_memory: ObjectId, target: ProcessId, address: u32) -> KResult<()> {
        let data = self.objects.get::<KSharedMemory>(shared_memory).ok_or(KernelError::InvalidHandle)?;
        let size = data.size;
        let backing = data.backing.clone();

        let space = &mut self.process_mut(target).address_space;
        match space.backing_at(address, size) {
            Ok((mapped, _)) if mapped.ptr_eq(&backing) => {},
            _ => return Err(KernelError::InvalidAddressState),
        }
        space.unmap(address, size).map(|_| ())
    }
}
