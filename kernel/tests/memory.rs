mod common;

use kumquat_kernel::memory::Memory;
use kumquat_kernel::process::memory_operation::{COMMIT, FREE, LINEAR, MAP, PROTECT, RESERVE, UNMAP};
use kumquat_kernel::process::{HEAP_VADDR, LINEAR_HEAP_VADDR};
use kumquat_kernel::{KernelError, LimitCategory, MemoryPermission, MemoryRegion, MemoryState};

#[test]
fn commit_and_free_heap() {
    let mut kernel = common::kernel();
    let pid = kernel.create_application_process("heap");
    let used = kernel.kmm().used(MemoryRegion::App);

    assert_eq!(kernel.control_memory(pid, COMMIT, HEAP_VADDR, 0, 0x3000, MemoryPermission::READ_WRITE), Ok(HEAP_VADDR));
    assert_eq!(kernel.process(pid).limits.current(LimitCategory::Commit), 0x3000);
    assert_eq!(kernel.kmm().used(MemoryRegion::App), used + 0x3000);

    let memory = &kernel.process(pid).address_space;
    memory.write_u32(HEAP_VADDR + 0x2FFC, 0xDEADBEEF).unwrap();
    assert_eq!(memory.read_u32(HEAP_VADDR + 0x2FFC), Ok(0xDEADBEEF));
    assert_eq!(memory.query(HEAP_VADDR + 0x1000).state, MemoryState::Private);

    assert_eq!(kernel.control_memory(pid, FREE, HEAP_VADDR, 0, 0x1000, MemoryPermission::empty()), Err(KernelError::InvalidAddressState));
    assert_eq!(kernel.control_memory(pid, FREE, HEAP_VADDR, 0, 0x3000, MemoryPermission::empty()), Ok(HEAP_VADDR));
    assert_eq!(kernel.process(pid).limits.current(LimitCategory::Commit), 0);
    assert_eq!(kernel.kmm().used(MemoryRegion::App), used);
    assert_eq!(kernel.process(pid).address_space.query(HEAP_VADDR).state, MemoryState::Free);
}

#[test]
fn linear_commit_maps_by_physical_address() {
    let mut kernel = common::kernel();
    let pid = kernel.create_application_process("linear");
    let address = kernel.control_memory(pid, COMMIT | LINEAR, 0, 0, 0x2000, MemoryPermission::READ_WRITE).unwrap();
    assert!(address >= LINEAR_HEAP_VADDR);
    assert_eq!(kernel.process(pid).address_space.query(address).state, MemoryState::Continuous);
}

#[test]
fn commit_respects_the_limit() {
    let mut kernel = common::kernel();
    let limits = kumquat_kernel::LimitsConfig { commit: 0x2000, ..Default::default() };
    let pid = kernel.create_process("small", kumquat_kernel::ResourceLimits::from(&limits), MemoryRegion::App);

    kernel.control_memory(pid, COMMIT, HEAP_VADDR, 0, 0x2000, MemoryPermission::READ_WRITE).unwrap();
    assert_eq!(kernel.control_memory(pid, COMMIT, HEAP_VADDR + 0x2000, 0, 0x1000, MemoryPermission::READ_WRITE), Err(KernelError::ResourceLimitExceeded));
    assert_eq!(kernel.process(pid).address_space.query(HEAP_VADDR + 0x2000).state, MemoryState::Free);
}

#[test]
fn control_memory_validates_arguments() {
    let mut kernel = common::kernel();
    let pid = kernel.create_application_process("args");
    let rw = MemoryPermission::READ_WRITE;
    assert_eq!(kernel.control_memory(pid, COMMIT, HEAP_VADDR + 1, 0, 0x1000, rw), Err(KernelError::MisalignedAddress));
    assert_eq!(kernel.control_memory(pid, COMMIT, HEAP_VADDR, 0, 0x800, rw), Err(KernelError::MisalignedSize));
    assert_eq!(kernel.control_memory(pid, COMMIT, 0x1000, 0, 0x1000, rw), Err(KernelError::InvalidAddress));
    assert_eq!(kernel.control_memory(pid, RESERVE, HEAP_VADDR, 0, 0x1000, rw), Err(KernelError::InvalidCombination));
}

#[test]
fn alias_and_protect() {
    let mut kernel = common::kernel();
    let pid = kernel.create_application_process("alias");
    let rw = MemoryPermission::READ_WRITE;
    kernel.control_memory(pid, COMMIT, HEAP_VADDR, 0, 0x1000, rw).unwrap();
    kernel.control_memory(pid, MAP, HEAP_VADDR + 0x100000, HEAP_VADDR, 0x1000, rw).unwrap();

    kernel.process(pid).address_space.write_u8(HEAP_VADDR + 5, 0x5A).unwrap();
    assert_eq!(kernel.process(pid).address_space.read_u8(HEAP_VADDR + 0x100005), Ok(0x5A));

    kernel.control_memory(pid, PROTECT, HEAP_VADDR + 0x100000, 0, 0x1000, MemoryPermission::READ).unwrap();
    assert_eq!(kernel.process(pid).address_space.query(HEAP_VADDR + 0x100000).permissions, MemoryPermission::READ);

    assert_eq!(kernel.control_memory(pid, UNMAP, HEAP_VADDR, 0, 0x1000, rw), Err(KernelError::InvalidAddressState));
    kernel.control_memory(pid, UNMAP, HEAP_VADDR + 0x100000, 0, 0x1000, rw).unwrap();
}

#[test]
fn shared_memory_between_processes() {
    let mut kernel = common::kernel();
    let owner = kernel.create_application_process("owner");
    let other = kernel.create_application_process("other");

    assert_eq!(
        kernel.create_shared_memory(owner, 0, 0x1000, MemoryPermission::READ_WRITE, MemoryPermission::EXECUTE),
        Err(KernelError::InvalidCombination)
    );
    let block = kernel.create_shared_memory(owner, 0, 0x1000, MemoryPermission::READ_WRITE, MemoryPermission::READ).unwrap();

    kernel.map_shared_memory(block, owner, 0x10000000, MemoryPermission::READ_WRITE).unwrap();
    assert_eq!(kernel.map_shared_memory(block, other, 0x10000000, MemoryPermission::READ_WRITE), Err(KernelError::InvalidCombination));
    kernel.map_shared_memory(block, other, 0x10000000, MemoryPermission::READ).unwrap();

    kernel.process(owner).address_space.write_u32(0x10000010, 0x1234).unwrap();
    assert_eq!(kernel.process(other).address_space.read_u32(0x10000010), Ok(0x1234));

    assert_eq!(kernel.unmap_shared_memory(block, other, 0x10001000), Err(KernelError::InvalidAddressState));
    kernel.unmap_shared_memory(block, other, 0x10000000).unwrap();
    assert_eq!(kernel.process(other).address_space.query(0x10000000).state, MemoryState::Free);

    let used = kernel.kmm().used(MemoryRegion::App);
    kernel.release_object(block);
    assert_eq!(kernel.kmm().used(MemoryRegion::App), used - 0x1000);
    assert_eq!(kernel.process(owner).limits.current(LimitCategory::SharedMemory), 0);
}
