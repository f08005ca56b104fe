mod common;

use kumquat_kernel::memory::Memory;
use kumquat_kernel::sync::{KEvent, KMutex, KSemaphore};
use kumquat_kernel::timing::ns_to_cycles;
use kumquat_kernel::{ArbitrationType, Completion, KernelError, MemoryPermission, ResetType, ThreadResume, ThreadStatus, Timeout};

#[test]
fn wait_any_reports_the_signaled_object() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "any");
    let tid = common::spawn(&mut kernel, pid, "waiter", 20);
    let events: Vec<_> = (0..3).map(|_| kernel.create_event(pid, ResetType::OneShot).unwrap()).collect();

    assert_eq!(kernel.wait_synchronization(tid, &events, false, Timeout::Forever), Ok(Completion::Suspended));
    kernel.signal_event(events[1]).unwrap();

    assert_eq!(kernel.thread(tid).status, ThreadStatus::Ready);
    assert_eq!(kernel.take_resume(tid), Some(ThreadResume::Signaled { index: Some(1) }));
    // The one-shot event was consumed by the waiter
    assert!(!kernel.objects().get::<KEvent>(events[1]).unwrap().signaled);
    for event in &events {
        assert!(kernel.objects().get::<KEvent>(*event).unwrap().waiters.is_empty());
    }
}

#[test]
fn wait_all_needs_every_object() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "all");
    let tid = common::spawn(&mut kernel, pid, "waiter", 20);
    let first = kernel.create_event(pid, ResetType::OneShot).unwrap();
    let second = kernel.create_event(pid, ResetType::OneShot).unwrap();

    kernel.wait_synchronization(tid, &[first, second], true, Timeout::Forever).unwrap();
    kernel.signal_event(first).unwrap();
    assert_eq!(kernel.thread(tid).status, ThreadStatus::WaitSynchronization { wait_all: true });
    assert!(kernel.objects().get::<KEvent>(first).unwrap().signaled);

    kernel.signal_event(second).unwrap();
    assert_eq!(kernel.take_resume(tid), Some(ThreadResume::Signaled { index: None }));
    assert!(!kernel.objects().get::<KEvent>(first).unwrap().signaled);
    assert!(!kernel.objects().get::<KEvent>(second).unwrap().signaled);
}

#[test]
fn available_objects_complete_without_blocking() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "now");
    let tid = common::spawn(&mut kernel, pid, "waiter", 20);
    let busy = kernel.create_event(pid, ResetType::OneShot).unwrap();
    let ready = kernel.create_semaphore(pid, 1, 1).unwrap();

    assert_eq!(kernel.wait_synchronization(tid, &[busy, ready], false, Timeout::Forever), Ok(Completion::Immediate { index: Some(1) }));
    assert_eq!(kernel.objects().get::<KSemaphore>(ready).unwrap().count, 0);
    assert_eq!(kernel.wait_synchronization(tid, &[ready], false, Timeout::Instant), Err(KernelError::Timeout));
    assert_eq!(kernel.thread(tid).status, ThreadStatus::Ready);
}

#[test]
fn timed_out_waiter_ignores_later_signals() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "timeout");
    let tid = common::spawn(&mut kernel, pid, "waiter", 20);
    let first = kernel.create_event(pid, ResetType::OneShot).unwrap();
    let second = kernel.create_event(pid, ResetType::OneShot).unwrap();

    kernel.wait_synchronization(tid, &[first, second], false, Timeout::After(10_000)).unwrap();
    kernel.timing_mut().add_ticks(ns_to_cycles(10_000));
    kernel.advance_timing();

    assert_eq!(kernel.take_resume(tid), Some(ThreadResume::TimeoutReached));
    assert!(kernel.objects().get::<KEvent>(first).unwrap().waiters.is_empty());
    assert!(kernel.objects().get::<KEvent>(second).unwrap().waiters.is_empty());

    kernel.signal_event(first).unwrap();
    assert_eq!(kernel.take_resume(tid), None);
    assert_eq!(kernel.thread(tid).status, ThreadStatus::Ready);
    assert!(kernel.objects().get::<KEvent>(first).unwrap().signaled);
}

/// Three equal priority waiters queue up as b, a, c. One wake-up must reach b.
fn equal_priority_waiters(kernel: &mut kumquat_kernel::Kernel, name: &str) -> (kumquat_kernel::ProcessId, [kumquat_kernel::ThreadId; 3]) {
    let pid = common::process(kernel, name);
    let a = common::spawn(kernel, pid, "a", 20);
    let b = common::spawn(kernel, pid, "b", 20);
    let c = common::spawn(kernel, pid, "c", 20);
    (pid, [b, a, c])
}

#[test]
fn equal_priority_event_waiters_wake_in_arrival_order() {
    let mut kernel = common::kernel();
    let (pid, [b, a, c]) = equal_priority_waiters(&mut kernel, "event fifo");
    let event = kernel.create_event(pid, ResetType::OneShot).unwrap();
    for tid in [b, a, c] {
        assert_eq!(kernel.wait_synchronization(tid, &[event], false, Timeout::Forever), Ok(Completion::Suspended));
    }

    kernel.signal_event(event).unwrap();
    assert_eq!(kernel.thread(b).status, ThreadStatus::Ready);
    assert_eq!(kernel.thread(a).status, ThreadStatus::WaitSynchronization { wait_all: false });
    assert_eq!(kernel.thread(c).status, ThreadStatus::WaitSynchronization { wait_all: false });
}

#[test]
fn equal_priority_mutex_waiters_acquire_in_arrival_order() {
    let mut kernel = common::kernel();
    let (pid, [b, a, c]) = equal_priority_waiters(&mut kernel, "mutex fifo");
    let owner = common::spawn(&mut kernel, pid, "owner", 20);
    let mutex = kernel.create_mutex(pid, Some(owner)).unwrap();
    for tid in [b, a, c] {
        assert_eq!(kernel.wait_synchronization(tid, &[mutex], false, Timeout::Forever), Ok(Completion::Suspended));
    }

    kernel.release_mutex(owner, mutex).unwrap();
    assert_eq!(kernel.objects().get::<KMutex>(mutex).unwrap().holding_thread, Some(b));
    assert_eq!(kernel.thread(b).status, ThreadStatus::Ready);
    assert_eq!(kernel.thread(a).status, ThreadStatus::WaitMutex);
    assert_eq!(kernel.thread(c).status, ThreadStatus::WaitMutex);
}

#[test]
fn equal_priority_semaphore_waiters_acquire_in_arrival_order() {
    let mut kernel = common::kernel();
    let (pid, [b, a, c]) = equal_priority_waiters(&mut kernel, "semaphore fifo");
    let semaphore = kernel.create_semaphore(pid, 0, 3).unwrap();
    for tid in [b, a, c] {
        assert_eq!(kernel.wait_synchronization(tid, &[semaphore], false, Timeout::Forever), Ok(Completion::Suspended));
    }

    assert_eq!(kernel.release_semaphore(semaphore, 1), Ok(0));
    assert_eq!(kernel.thread(b).status, ThreadStatus::Ready);
    assert_eq!(kernel.thread(a).status, ThreadStatus::WaitSynchronization { wait_all: false });
    assert_eq!(kernel.thread(c).status, ThreadStatus::WaitSynchronization { wait_all: false });
    assert_eq!(kernel.objects().get::<KSemaphore>(semaphore).unwrap().count, 0);
}

#[test]
fn semaphore_counts_are_bounded() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "sem");
    assert_eq!(kernel.create_semaphore(pid, 3, 2), Err(KernelError::InvalidCombination));
    assert_eq!(kernel.create_semaphore(pid, -1, 2), Err(KernelError::OutOfRange));

    let semaphore = kernel.create_semaphore(pid, 0, 2).unwrap();
    let tid = common::spawn(&mut kernel, pid, "waiter", 20);
    kernel.wait_synchronization(tid, &[semaphore], false, Timeout::Forever).unwrap();

    assert_eq!(kernel.release_semaphore(semaphore, 3), Err(KernelError::OutOfRange));
    assert_eq!(kernel.release_semaphore(semaphore, 2), Ok(0));
    assert_eq!(kernel.take_resume(tid), Some(ThreadResume::Signaled { index: Some(0) }));
    assert_eq!(kernel.objects().get::<KSemaphore>(semaphore).unwrap().count, 1);
}

#[test]
fn periodic_timer_fires_every_interval() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "timer");
    let tid = common::spawn(&mut kernel, pid, "waiter", 20);
    let timer = kernel.create_timer(pid, ResetType::OneShot).unwrap();

    kernel.set_timer(timer, 1_000_000, 2_000_000).unwrap();
    for period in 0..3 {
        kernel.wait_synchronization(tid, &[timer], false, Timeout::Forever).unwrap();
        kernel.idle();
        kernel.advance_timing();
        assert_eq!(kernel.system_tick(), ns_to_cycles(1_000_000) + period * ns_to_cycles(2_000_000));
        assert_eq!(kernel.take_resume(tid), Some(ThreadResume::Signaled { index: Some(0) }));
    }

    kernel.cancel_timer(timer).unwrap();
    kernel.wait_synchronization(tid, &[timer], false, Timeout::Forever).unwrap();
    kernel.idle();
    kernel.advance_timing();
    assert!(kernel.thread(tid).status.is_waiting());
}

#[test]
fn condition_variable_reacquires_the_mutex() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "cv");
    let waiter = common::spawn(&mut kernel, pid, "waiter", 20);
    let signaler = common::spawn(&mut kernel, pid, "signaler", 30);
    let mutex = kernel.create_mutex(pid, Some(waiter)).unwrap();
    let condvar = kernel.create_condition_variable(pid).unwrap();

    assert_eq!(kernel.condvar_wait(signaler, condvar, mutex, Timeout::Forever), Err(KernelError::PermissionDenied));
    assert_eq!(kernel.condvar_wait(waiter, condvar, mutex, Timeout::Forever), Ok(Completion::Suspended));

    // The signaler takes the mutex, so the woken waiter has to queue on it
    assert_eq!(kernel.wait_synchronization(signaler, &[mutex], false, Timeout::Forever), Ok(Completion::Immediate { index: Some(0) }));
    kernel.condvar_signal(condvar, 1).unwrap();
    assert_eq!(kernel.thread(waiter).status, ThreadStatus::WaitMutex);

    kernel.release_mutex(signaler, mutex).unwrap();
    assert_eq!(kernel.thread(waiter).status, ThreadStatus::Ready);
    assert_eq!(kernel.take_resume(waiter), Some(ThreadResume::Normal));
    assert_eq!(kernel.objects().get::<kumquat_kernel::sync::KMutex>(mutex).unwrap().holding_thread, Some(waiter));
}

#[test]
fn arbiter_wakes_by_priority() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "arb");
    kernel.control_memory(pid, kumquat_kernel::process::memory_operation::COMMIT, 0x08000000, 0, 0x1000, MemoryPermission::READ_WRITE).unwrap();
    let address = 0x08000010;
    kernel.process(pid).address_space.write_u32(address, 0).unwrap();

    let arbiter = kernel.create_address_arbiter(pid).unwrap();
    let low = common::spawn(&mut kernel, pid, "low", 40);
    let high = common::spawn(&mut kernel, pid, "high", 10);

    // Value 0 is not less than 0, so no wait
    assert_eq!(kernel.arbitrate_address(low, arbiter, address, ArbitrationType::WaitIfLessThan, 0, 0), Ok(Completion::Immediate { index: None }));
    assert_eq!(kernel.arbitrate_address(low, arbiter, address, ArbitrationType::WaitIfLessThan, 1, 0), Ok(Completion::Suspended));
    assert_eq!(kernel.arbitrate_address(high, arbiter, address, ArbitrationType::WaitIfLessThan, 1, 0), Ok(Completion::Suspended));

    let signaler = common::spawn(&mut kernel, pid, "signaler", 20);
    kernel.arbitrate_address(signaler, arbiter, address, ArbitrationType::Signal, 1, 0).unwrap();
    assert_eq!(kernel.thread(high).status, ThreadStatus::Ready);
    assert_eq!(kernel.thread(low).status, ThreadStatus::WaitArbiter);

    kernel.arbitrate_address(signaler, arbiter, address, ArbitrationType::Signal, -1, 0).unwrap();
    assert_eq!(kernel.thread(low).status, ThreadStatus::Ready);
}

#[test]
fn arbiter_timeout_variant_expires() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "arb");
    kernel.control_memory(pid, kumquat_kernel::process::memory_operation::COMMIT, 0x08000000, 0, 0x1000, MemoryPermission::READ_WRITE).unwrap();
    let arbiter = kernel.create_address_arbiter(pid).unwrap();
    let tid = common::spawn(&mut kernel, pid, "waiter", 20);

    let ty = ArbitrationType::WaitIfLessThanTimeout;
    assert_eq!(kernel.arbitrate_address(tid, arbiter, 0x08000000, ty, 1, 0), Err(KernelError::Timeout));
    assert_eq!(kernel.arbitrate_address(tid, arbiter, 0x08000000, ty, 1, 50_000), Ok(Completion::Suspended));
    kernel.idle();
    kernel.advance_timing();
    assert_eq!(kernel.take_resume(tid), Some(ThreadResume::TimeoutReached));
}
