//! Physical memory regions of FCRAM.
//!
//! Each region keeps a first-fit free list of page runs. Neighbouring runs are merged when freed,
//! so the list never holds two adjacent runs.

use std::collections::BTreeMap;

use log::trace;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{MemoryBlock, PAGE_SIZE};

pub const FCRAM_PADDR: u32 = 0x20000000;

pub const APPLICATION_REGION_SIZE: u32 = 0x04000000;
pub const SYSTEM_REGION_SIZE: u32 = 0x02C00000;
pub const BASE_REGION_SIZE: u32 = 0x01400000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRegion {
    App, System, Base
}

/// A run of physical pages handed out by the allocator, with the host bytes backing it.
#[derive(Debug, Clone)]
pub struct PhysicalAllocation {
    pub paddr: u32,
    pub size: u32,
    pub region: MemoryRegion,
    pub backing: MemoryBlock,
}

#[derive(Default)]
pub struct RegionDesc {
    start: u32,
    size: u32,
    /// Free runs: start page -> length in pages.
    free: BTreeMap<u32, u32>,
    used_pages: u32,
}

impl RegionDesc {
    fn new(start: u32, size: u32) -> RegionDesc {
        let mut free = BTreeMap::new();
        free.insert(start / PAGE_SIZE, size / PAGE_SIZE);
        RegionDesc { start, size, free, used_pages: 0 }
    }

    fn allocate(&mut self, pages: u32) -> Option<u32> {
        let (&first, &len) = self.free.iter().find(|(_, len)| **len >= pages)?;
        self.free.remove(&first);
        if len > pages {
            self.free.insert(first + pages, len - pages);
        }
        self.used_pages += pages;
        Some(first)
    }

    fn free(&mut self, mut page: u32, mut pages: u32) {
        let region_start = self.start / PAGE_SIZE;
        let region_end = region_start + self.size / PAGE_SIZE;
        assert!(page >= region_start && page + pages <= region_end, "Freeing pages outside of the region");
        assert!(self.free.range(page..page + pages).next().is_none(), "Double free of page {:#X}", page);

        // Merge left
        if let Some((&prev, &prev_len)) = self.free.range(..page).next_back() {
            assert!(prev + prev_len <= page, "Double free of page {:#X}", page);
            if prev + prev_len == page {
                self.free.remove(&prev);
                page = prev;
                pages += prev_len;
            }
        }

        // Merge right
        if let Some(next_len) = self.free.remove(&(page + pages)) {
            pages += next_len;
        }

        self.free.insert(page, pages);
    }
}

macro_rules! select_region {
    ($kmm:expr, $region:expr) => {
        {
            let kmm = $kmm;
            match $region {
                MemoryRegion::App => &kmm.region_app,
                MemoryRegion::System => &kmm.region_system,
                MemoryRegion::Base => &kmm.region_base,
            }
        }
    };
}

/// The kernel memory manager: hands out physical pages from the three FCRAM regions.
pub struct KMM {
    region_app: Mutex<RegionDesc>,
    region_system: Mutex<RegionDesc>,
    region_base: Mutex<RegionDesc>,
}

impl KMM {
    pub fn new() -> KMM {
        KMM::with_sizes(APPLICATION_REGION_SIZE, SYSTEM_REGION_SIZE, BASE_REGION_SIZE)
    }

    pub fn with_sizes(app: u32, system: u32, base: u32) -> KMM {
        assert!(app % PAGE_SIZE == 0 && system % PAGE_SIZE == 0 && base % PAGE_SIZE == 0);
        KMM {
            region_app: Mutex::new(RegionDesc::new(FCRAM_PADDR, app)),
            region_system: Mutex::new(RegionDesc::new(FCRAM_PADDR + app, system)),
            region_base: Mutex::new(RegionDesc::new(FCRAM_PADDR + app + system, base)),
        }
    }

    /// Allocates `size` bytes (rounded up to pages) of physically contiguous memory.
    pub fn allocate_linear(&self, region: MemoryRegion, size: u32) -> Option<PhysicalAllocation> {
        let pages = (size.checked_add(PAGE_SIZE - 1)? / PAGE_SIZE).max(1);
        let page = select_region!(self, region).lock().allocate(pages)?;
        let paddr = page * PAGE_SIZE;
        trace!("allocated {:#X} pages at {:#010X} from {:?}", pages, paddr, region);
        Some(PhysicalAllocation {
            paddr,
            size: pages * PAGE_SIZE,
            region,
            backing: MemoryBlock::new(pages * PAGE_SIZE),
        })
    }

    pub fn free(&self, allocation: &PhysicalAllocation) {
        let pages = allocation.size / PAGE_SIZE;
        let mut region = select_region!(self, allocation.region).lock();
        region.free(allocation.paddr / PAGE_SIZE, pages);
        region.used_pages -= pages;
    }

    pub fn used(&self, region: MemoryRegion) -> u32 {
        select_region!(self, region).lock().used_pages * PAGE_SIZE
    }

    pub fn size(&self, region: MemoryRegion) -> u32 {
        select_region!(self, region).lock().size
    }

    pub fn free_runs(&self, region: MemoryRegion) -> usize {
        select_region!(self, region).lock().free.len()
    }
}

impl Default for KMM {
    fn default() -> Self {
        KMM::new()
    }
}
