#![allow(dead_code)]

use kumquat_kernel::memory::Memory;
use kumquat_kernel::{Kernel, KernelConfig, MemoryRegion, ProcessId, ResourceLimits, ThreadId, ThreadInitializer};

pub fn kernel() -> Kernel {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::new(KernelConfig::default())
}

pub fn process(kernel: &mut Kernel, name: &str) -> ProcessId {
    kernel.create_process(name, ResourceLimits::unlimited(), MemoryRegion::App)
}

pub fn initializer(name: &str, priority: u32) -> ThreadInitializer {
    ThreadInitializer {
        name: name.to_owned(),
        entrypoint: 0x00100000,
        stack_top: 0x10000000,
        arg: 0,
        priority,
        processor_id: 0,
    }
}

/// Creates a thread and makes it ready.
pub fn spawn(kernel: &mut Kernel, pid: ProcessId, name: &str, priority: u32) -> ThreadId {
    let tid = kernel.create_thread(pid, initializer(name, priority)).expect("thread creation failed");
    kernel.start_thread(tid);
    tid
}

pub fn write_command(kernel: &Kernel, tid: ThreadId, words: &[u32]) {
    let thread = kernel.thread(tid);
    let memory = &kernel.process(thread.owner).address_space;
    let base = thread.command_buffer_address();
    for (index, word) in words.iter().enumerate() {
        memory.write_u32(base + index as u32 * 4, *word).unwrap();
    }
}

pub fn read_command(kernel: &Kernel, tid: ThreadId, count: usize) -> Vec<u32> {
    let thread = kernel.thread(tid);
    let memory = &kernel.process(thread.owner).address_space;
    let base = thread.command_buffer_address();
    (0..count).map(|index| memory.read_u32(base + index as u32 * 4).unwrap()).collect()
}
