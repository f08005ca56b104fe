use std::collections::BTreeMap;
use std::ops::Bound::Included;

use super::{is_page_aligned, Memory, MemoryBlock, MemoryPermission, MemoryState};
use crate::errors::{KernelError, KResult};

/// A mapped range: `size` bytes of `backing` starting at `offset`.
#[derive(Debug, Clone)]
pub struct Vma {
    pub size: u32,
    pub backing: MemoryBlock,
    pub offset: u32,
    pub permissions: MemoryPermission,
    pub state: MemoryState,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryInfo {
    pub base_address: u32,
    pub size: u32,
    pub permissions: MemoryPermission,
    pub state: MemoryState,
}

/// A process's view of guest memory, keyed by the base address of each mapping.
#[derive(Default)]
pub struct AddressSpace {
    vmas: BTreeMap<u32, Vma>,
}

struct MemoryLookup<'a> {
    base: u32,
    item: &'a Vma,
    offset: u32, // Offset from start of item, in bytes
}

impl AddressSpace {
    pub fn new() -> AddressSpace {
        AddressSpace {
            vmas: BTreeMap::new(),
        }
    }

    fn lookup(&self, addr: u32) -> Option<MemoryLookup> {
        let (base, item) = self.vmas.range((Included(&0), Included(&addr))).next_back()?;
        let offset = addr - base;
        if offset < item.size {
            Some(MemoryLookup { base: *base, item, offset })
        } else {
            None
        }
    }

    fn overlaps(&self, addr: u32, size: u32) -> bool {
        let end = addr as u64 + size as u64;
        if self.lookup(addr).is_some() {
            return true
        }
        self.vmas.range(addr..).next().map_or(false, |(base, _)| (*base as u64) < end)
    }

    pub fn map(&mut self, addr: u32, size: u32, backing: MemoryBlock, offset: u32, permissions: MemoryPermission, state: MemoryState) -> KResult<()> {
        if !is_page_aligned(addr) {
            return Err(KernelError::MisalignedAddress)
        }
        if size == 0 || !is_page_aligned(size) {
            return Err(KernelError::MisalignedSize)
        }
        if addr.checked_add(size - 1).is_none() || offset as u64 + size as u64 > backing.len() as u64 {
            return Err(KernelError::InvalidAddress)
        }
        if self.overlaps(addr, size) {
            return Err(KernelError::InvalidAddressState)
        }

        self.vmas.insert(addr, Vma { size, backing, offset, permissions, state });
        Ok(())
    }

    /// Removes the mapping that starts at `addr`. The size must match the mapping exactly.
    pub fn unmap(&mut self, addr: u32, size: u32) -> KResult<Vma> {
        match self.vmas.get(&addr) {
            Some(vma) if vma.size == size => {},
            Some(_) => return Err(KernelError::InvalidAddressState),
            None => return Err(KernelError::InvalidAddress),
        }
        self.vmas.remove(&addr).ok_or(KernelError::InvalidAddress)
    }

    pub fn reprotect(&mut self, addr: u32, size: u32, permissions: MemoryPermission) -> KResult<()> {
        match self.vmas.get_mut(&addr) {
            Some(vma) if vma.size == size => {
                vma.permissions = permissions;
                Ok(())
            },
            Some(_) => Err(KernelError::InvalidAddressState),
            None => Err(KernelError::InvalidAddress),
        }
    }

    /// Describes the mapping containing `addr`, or the free gap around it.
    pub fn query(&self, addr: u32) -> MemoryInfo {
        if let Some(MemoryLookup { base, item, .. }) = self.lookup(addr) {
            return MemoryInfo {
                base_address: base,
                size: item.size,
                permissions: item.permissions,
                state: item.state,
            }
        }

        let gap_start = self.vmas.range(..=addr).next_back()
            .map(|(base, vma)| base + vma.size)
            .unwrap_or(0);
        let gap_end = self.vmas.range(addr..).next()
            .map(|(base, _)| *base as u64)
            .unwrap_or(1 << 32);

        MemoryInfo {
            base_address: gap_start,
            size: (gap_end - gap_start as u64).min(u32::MAX as u64) as u32,
            permissions: MemoryPermission::empty(),
            state: MemoryState::Free,
        }
    }

    /// Checks that `[addr, addr + size)` is fully mapped with at least `permissions`.
    pub fn check_range(&self, addr: u32, size: u32, permissions: MemoryPermission) -> KResult<()> {
        if addr.checked_add(size).is_none() {
            return Err(KernelError::InvalidAddress)
        }

        let end = addr + size;
        let mut cursor = addr;
        while cursor < end {
            let MemoryLookup { item, offset, .. } = self.lookup(cursor).ok_or(KernelError::InvalidAddress)?;
            if !item.permissions.contains(permissions) {
                return Err(KernelError::InvalidAddress)
            }
            cursor = cursor.saturating_add(item.size - offset);
        }
        Ok(())
    }

    /// The backing of a range that lies inside a single mapping, and its offset in that backing.
    pub fn backing_at(&self, addr: u32, size: u32) -> KResult<(MemoryBlock, u32)> {
        let MemoryLookup { item, offset, .. } = self.lookup(addr).ok_or(KernelError::InvalidAddress)?;
        if size > item.size - offset {
            return Err(KernelError::InvalidAddress)
        }
        Ok((item.backing.clone(), item.offset + offset))
    }

    /// First page-aligned free range of `size` bytes inside `[start, end)`.
    pub fn find_free(&self, start: u32, end: u32, size: u32) -> Option<u32> {
        let mut candidate = start;
        for (base, vma) in self.vmas.range(..end) {
            let vma_end = base + vma.size;
            if vma_end <= candidate {
                continue
            }
            if *base >= candidate && base - candidate >= size {
                break
            }
            candidate = vma_end;
        }

        if candidate as u64 + size as u64 <= end as u64 {
            Some(candidate)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item=(u32, &Vma)> + '_ {
        self.vmas.iter().map(|(base, vma)| (*base, vma))
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    fn for_each_span(&self, mut addr: u32, len: usize, mut f: impl FnMut(&Vma, u32, std::ops::Range<usize>) -> KResult<()>) -> KResult<()> {
        let mut rem = len as u32;
        let mut slice_offset = 0u32;

        while rem > 0 {
            let MemoryLookup { item, offset, .. } = self.lookup(addr).ok_or(KernelError::InvalidAddress)?;
            let item_bytes = item.size - offset; // Number of bytes it can fulfill
            let max = if item_bytes > rem { rem } else { item_bytes };

            f(item, item.offset + offset, (slice_offset as usize)..((slice_offset + max) as usize))?;

            addr = addr.checked_add(max).ok_or(KernelError::InvalidAddress)?;
            slice_offset += max;
            rem -= max;
        }
        Ok(())
    }
}

impl Memory for AddressSpace {
    fn read(&self, addr: u32, bytes: &mut [u8]) -> KResult<()> {
        let len = bytes.len();
        self.for_each_span(addr, len, |vma, backing_offset, range| {
            vma.backing.read(backing_offset, &mut bytes[range])
        })
    }

    fn write(&self, addr: u32, bytes: &[u8]) -> KResult<()> {
        self.for_each_span(addr, bytes.len(), |vma, backing_offset, range| {
            vma.backing.write(backing_offset, &bytes[range])
        })
    }
}
