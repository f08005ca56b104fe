#![allow(dead_code)]

use kumquat_hle::kernel::memory::Memory;
use kumquat_hle::kernel::process::memory_operation;
use kumquat_hle::kernel::{Handle, Kernel, KernelConfig, MemoryPermission, MemoryRegion, ProcessId, ResourceLimits, ThreadId, ThreadInitializer};
use kumquat_hle::{ServiceManager, SystemSettings};

pub const HEAP_BASE: u32 = 0x08000000;

pub fn kernel() -> Kernel {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::new(KernelConfig::default())
}

/// A kernel with `srv:` and the default services installed.
pub fn kernel_with_services() -> (Kernel, ServiceManager) {
    let mut kernel = kernel();
    let mut services = ServiceManager::install(&mut kernel).expect("srv: could not be installed");
    services.install_default_services(&mut kernel, &SystemSettings::default()).expect("default services could not be installed");
    (kernel, services)
}

pub fn process(kernel: &mut Kernel, name: &str) -> ProcessId {
    kernel.create_process(name, ResourceLimits::unlimited(), MemoryRegion::App)
}

/// Creates a ready thread in a fresh process with one committed heap page.
pub fn spawn_process(kernel: &mut Kernel, name: &str) -> ThreadId {
    let pid = process(kernel, name);
    kernel.control_memory(pid, memory_operation::COMMIT, HEAP_BASE, 0, 0x1000, MemoryPermission::READ_WRITE).unwrap();
    let tid = kernel.create_thread(pid, ThreadInitializer {
        name: format!("{}-main", name),
        entrypoint: 0x00100000,
        stack_top: 0x10000000,
        arg: 0,
        priority: 0x30,
        processor_id: 0,
    }).unwrap();
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

/// Writes `words`, sends them over `session` and returns the first `reply_words` of the answer.
pub fn request(kernel: &mut Kernel, tid: ThreadId, session: Handle, words: &[u32], reply_words: usize) -> Vec<u32> {
    write_command(kernel, tid, words);
    kumquat_hle::svc::send_sync_request(kernel, tid, Some(session)).expect("request was not delivered");
    read_command(kernel, tid, reply_words)
}
