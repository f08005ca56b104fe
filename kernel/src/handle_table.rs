// Per-process handle tables

use std::collections::VecDeque;

use crate::errors::{KernelError, KResult};
use crate::object::ObjectId;
use crate::Handle;

pub const DEFAULT_HANDLE_TABLE_SIZE: usize = 4096;
pub const MAX_HANDLE_TABLE_SIZE: usize = 0x7FFF;

const SLOT_BITS: u32 = 15;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;
const MAX_GENERATION: u16 = 0x7FFF;

struct Slot {
    generation: u16,
    object: Option<ObjectId>,
}

/// Maps handles to object ids.
///
/// A handle encodes `generation << 15 | slot`. Closing a handle bumps the slot's generation before
/// the slot is recycled, so stale copies of a closed handle never resolve to the new occupant.
/// The table never touches reference counts; the kernel does that around it.
pub struct HandleTable {
    slots: Vec<Slot>,
    free: VecDeque<u16>,
    capacity: usize,
    used: usize,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable::with_capacity(DEFAULT_HANDLE_TABLE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> HandleTable {
        assert!(capacity > 0 && capacity <= MAX_HANDLE_TABLE_SIZE, "Invalid handle table size {}", capacity);
        HandleTable {
            slots: Vec::new(),
            free: VecDeque::new(),
            capacity,
            used: 0,
        }
    }

    fn encode(slot: u16, generation: u16) -> Handle {
        Handle::from_raw((generation as u32) << SLOT_BITS | slot as u32).expect("Generation is never zero")
    }

    fn decode(handle: &Handle) -> (usize, u16) {
        let raw = handle.raw();
        ((raw & SLOT_MASK) as usize, (raw >> SLOT_BITS) as u16)
    }

    pub fn create(&mut self, object: ObjectId) -> KResult<Handle> {
        let slot = if let Some(slot) = self.free.pop_front() {
            slot
        } else if self.slots.len() < self.capacity {
            self.slots.push(Slot { generation: 1, object: None });
            (self.slots.len() - 1) as u16
        } else {
            return Err(KernelError::ResourceLimitExceeded)
        };

        let entry = &mut self.slots[slot as usize];
        debug_assert!(entry.object.is_none());
        entry.object = Some(object);
        self.used += 1;

        Ok(HandleTable::encode(slot, entry.generation))
    }

    pub fn get(&self, handle: &Handle) -> KResult<ObjectId> {
        let (slot, generation) = HandleTable::decode(handle);
        match self.slots.get(slot) {
            Some(Slot { generation: current, object: Some(object) }) if *current == generation => Ok(*object),
            _ => Err(KernelError::InvalidHandle),
        }
    }

    pub fn close(&mut self, handle: &Handle) -> KResult<ObjectId> {
        let (slot, generation) = HandleTable::decode(handle);
        let entry = match self.slots.get_mut(slot) {
            Some(entry) if entry.generation == generation && entry.object.is_some() => entry,
            _ => return Err(KernelError::InvalidHandle),
        };

        let object = entry.object.take().ok_or(KernelError::InvalidHandle)?;
        entry.generation = if entry.generation >= MAX_GENERATION { 1 } else { entry.generation + 1 };
        self.free.push_back(slot as u16);
        self.used -= 1;

        Ok(object)
    }

    /// Empties the table, returning every object that had a handle.
    pub fn clear(&mut self) -> Vec<ObjectId> {
        let mut objects = Vec::with_capacity(self.used);
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if let Some(object) = entry.object.take() {
                objects.push(object);
                entry.generation = if entry.generation >= MAX_GENERATION { 1 } else { entry.generation + 1 };
                self.free.push_back(index as u16);
            }
        }
        self.used = 0;
        objects
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item=(Handle, ObjectId)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, entry)| {
            entry.object.map(|object| (HandleTable::encode(index as u16, entry.generation), object))
        })
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        HandleTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(raw: u32) -> ObjectId {
        ObjectId::from_raw(raw).unwrap()
    }

    #[test]
    fn closed_handle_is_stale_after_recycle() {
        let mut table = HandleTable::with_capacity(1);
        let first = table.create(id(1)).unwrap();
        assert_eq!(table.close(&first), Ok(id(1)));
        let second = table.create(id(2)).unwrap();

        assert_ne!(first, second);
        assert_eq!(table.get(&first), Err(KernelError::InvalidHandle));
        assert_eq!(table.get(&second), Ok(id(2)));
        assert_eq!(table.close(&first), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn full_table_reports_limit() {
        let mut table = HandleTable::with_capacity(2);
        table.create(id(1)).unwrap();
        table.create(id(1)).unwrap();
        assert_eq!(table.create(id(3)), Err(KernelError::ResourceLimitExceeded));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn generation_wraps_to_one() {
        let mut table = HandleTable::with_capacity(1);
        for _ in 0..(MAX_GENERATION as u32 + 3) {
            let handle = table.create(id(7)).unwrap();
            assert_ne!(handle.raw() >> SLOT_BITS, 0);
            table.close(&handle).unwrap();
        }
    }

    #[test]
    fn clear_returns_live_objects() {
        let mut table = HandleTable::new();
        let a = table.create(id(1)).unwrap();
        let b = table.create(id(2)).unwrap();
        table.close(&a).unwrap();
        assert_eq!(table.clear(), vec![id(2)]);
        assert!(table.get(&b).is_err());
        assert!(table.is_empty());
    }

    proptest! {
        #[test]
        fn live_handles_always_resolve(ops in proptest::collection::vec(any::<(bool, u8)>(), 1..200)) {
            let mut table = HandleTable::with_capacity(16);
            let mut live: Vec<(Handle, ObjectId)> = vec![];
            let mut dead: Vec<Handle> = vec![];

            for (create, pick) in ops {
                if create || live.is_empty() {
                    let object = id(pick as u32 + 1);
                    match table.create(object) {
                        Ok(handle) => live.push((handle, object)),
                        Err(err) => {
                            prop_assert_eq!(live.len(), 16);
                            prop_assert_eq!(err, KernelError::ResourceLimitExceeded);
                        }
                    }
                } else {
                    let (handle, object) = live.remove(pick as usize % live.len());
                    prop_assert_eq!(table.close(&handle), Ok(object));
                    dead.push(handle);
                }

                for (handle, object) in &live {
                    prop_assert_eq!(table.get(handle), Ok(*object));
                }
                for handle in &dead {
                    if !live.iter().any(|(live_handle, _)| live_handle == handle) {
                        prop_assert_eq!(table.get(handle), Err(KernelError::InvalidHandle));
                    }
                }
                prop_assert_eq!(table.len(), live.len());
            }
        }
    }
}
