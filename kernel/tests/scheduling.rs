mod common;

use kumquat_kernel::{KernelError, LimitCategory, LimitsConfig, MemoryRegion, ResourceLimits, ThreadStatus};
use kumquat_kernel::sync::KMutex;
use kumquat_kernel::timing::ns_to_cycles;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Create(u32),
    Terminate(usize),
    Yield,
}

fn op() -> impl Strategy<Value=Op> {
    prop_oneof![
        (0u32..64).prop_map(Op::Create),
        any::<usize>().prop_map(Op::Terminate),
        Just(Op::Yield),
    ]
}

proptest! {
    #[test]
    fn scheduler_always_runs_the_best_ready_thread(ops in proptest::collection::vec(op(), 1..80)) {
        let mut kernel = common::kernel();
        let pid = common::process(&mut kernel, "sched");
        // Keeps the process alive while every started thread dies
        let _anchor = kernel.create_thread(pid, common::initializer("anchor", 63)).unwrap();

        let mut threads = vec![];
        for op in ops {
            match op {
                Op::Create(priority) => {
                    threads.push(common::spawn(&mut kernel, pid, "worker", priority));
                },
                Op::Terminate(index) if !threads.is_empty() => {
                    let tid = threads.remove(index % threads.len());
                    kernel.terminate_thread(tid);
                },
                Op::Terminate(_) => {},
                Op::Yield => kernel.yield_current(),
            }

            let chosen = kernel.reschedule();

            let ready = kernel.scheduler().ready_queue();
            for (priority, tid) in ready.iter() {
                let thread = kernel.thread(tid);
                prop_assert_eq!(thread.status, ThreadStatus::Ready);
                prop_assert_eq!(thread.current_priority, priority);
            }

            match chosen {
                Some(tid) => {
                    let thread = kernel.thread(tid);
                    prop_assert_eq!(thread.status, ThreadStatus::Running);
                    if let Some((best, _)) = ready.first() {
                        prop_assert!(thread.current_priority <= best);
                    }
                },
                None => prop_assert!(ready.is_empty()),
            }
        }
    }
}

#[test]
fn priority_inheritance_follows_the_waiter() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "pi");
    let a = common::spawn(&mut kernel, pid, "A", 10);
    let b = common::spawn(&mut kernel, pid, "B", 1);

    let mutex = kernel.create_mutex(pid, Some(a)).unwrap();
    assert_eq!(kernel.reschedule(), Some(b));

    kernel.wait_synchronization(b, &[mutex], false, kumquat_kernel::Timeout::Forever).unwrap();
    assert_eq!(kernel.thread(b).status, ThreadStatus::WaitMutex);
    assert_eq!(kernel.thread(a).current_priority, 1);
    assert_eq!(kernel.reschedule(), Some(a));

    kernel.release_mutex(a, mutex).unwrap();
    assert_eq!(kernel.thread(a).current_priority, 10);
    assert_eq!(kernel.thread(b).status, ThreadStatus::Ready);
    assert_eq!(kernel.take_resume(b), Some(kumquat_kernel::ThreadResume::Signaled { index: Some(0) }));
    assert_eq!(kernel.reschedule(), Some(b));
}

#[test]
fn inheritance_propagates_through_chains() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "chain");
    let low = common::spawn(&mut kernel, pid, "low", 40);
    let mid = common::spawn(&mut kernel, pid, "mid", 30);
    let high = common::spawn(&mut kernel, pid, "high", 5);

    let outer = kernel.create_mutex(pid, Some(low)).unwrap();
    let inner = kernel.create_mutex(pid, Some(mid)).unwrap();

    kernel.wait_synchronization(mid, &[outer], false, kumquat_kernel::Timeout::Forever).unwrap();
    assert_eq!(kernel.thread(low).current_priority, 30);

    kernel.wait_synchronization(high, &[inner], false, kumquat_kernel::Timeout::Forever).unwrap();
    assert_eq!(kernel.thread(mid).current_priority, 5);
    assert_eq!(kernel.thread(low).current_priority, 5);

    kernel.terminate_thread(high);
    assert_eq!(kernel.thread(mid).current_priority, 30);
    assert_eq!(kernel.thread(low).current_priority, 30);
}

#[test]
fn terminated_owner_hands_its_mutex_to_the_waiter() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "abandon");
    let owner = common::spawn(&mut kernel, pid, "owner", 30);
    let waiter = common::spawn(&mut kernel, pid, "waiter", 20);

    let mutex = kernel.create_mutex(pid, Some(owner)).unwrap();
    kernel.wait_synchronization(waiter, &[mutex], false, kumquat_kernel::Timeout::Forever).unwrap();
    assert_eq!(kernel.thread(waiter).status, ThreadStatus::WaitMutex);

    kernel.terminate_thread(owner);
    let data = kernel.objects().get::<KMutex>(mutex).unwrap();
    assert_eq!(data.holding_thread, Some(waiter));
    assert_eq!(data.lock_count, 1);
    assert_eq!(kernel.thread(waiter).status, ThreadStatus::Ready);
    assert_eq!(kernel.take_resume(waiter), Some(kumquat_kernel::ThreadResume::Signaled { index: Some(0) }));
    assert!(kernel.thread(waiter).held_mutexes.contains(&mutex));
}

#[test]
fn thread_quota_failure_changes_nothing() {
    let mut kernel = common::kernel();
    let limits = LimitsConfig { threads: 1, priority: 0, ..LimitsConfig::default() };
    let pid = kernel.create_process("quota", ResourceLimits::from(&limits), MemoryRegion::App);

    common::spawn(&mut kernel, pid, "first", 20);
    let handles = kernel.process(pid).handle_table.len();
    let ready = kernel.scheduler().ready_queue().len();

    let result = kernel.create_thread(pid, common::initializer("second", 20));
    assert_eq!(result, Err(KernelError::ResourceLimitExceeded));
    assert_eq!(kernel.process(pid).handle_table.len(), handles);
    assert_eq!(kernel.scheduler().ready_queue().len(), ready);
    assert_eq!(kernel.process(pid).limits.current(LimitCategory::Thread), 1);
}

#[test]
fn priority_above_the_limit_is_refused() {
    let mut kernel = common::kernel();
    let pid = kernel.create_application_process("app");
    assert_eq!(kernel.create_thread(pid, common::initializer("boss", 0x10)), Err(KernelError::NotAuthorized));
    assert_eq!(kernel.create_thread(pid, common::initializer("bad", 64)), Err(KernelError::OutOfRange));
}

#[test]
fn yield_rotates_equal_priorities() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "rr");
    let first = common::spawn(&mut kernel, pid, "first", 20);
    let second = common::spawn(&mut kernel, pid, "second", 20);

    assert_eq!(kernel.reschedule(), Some(first));
    kernel.sleep_thread(first, 0);
    assert_eq!(kernel.reschedule(), Some(second));
    kernel.yield_current();
    assert_eq!(kernel.reschedule(), Some(first));
}

#[test]
fn sleeping_thread_wakes_after_its_duration() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "sleep");
    let tid = common::spawn(&mut kernel, pid, "sleeper", 20);
    assert_eq!(kernel.reschedule(), Some(tid));

    kernel.sleep_thread(tid, 1_000_000);
    assert_eq!(kernel.reschedule(), None);

    kernel.idle();
    assert_eq!(kernel.system_tick(), ns_to_cycles(1_000_000));
    kernel.advance_timing();
    assert_eq!(kernel.thread(tid).status, ThreadStatus::Ready);
    assert_eq!(kernel.take_resume(tid), Some(kumquat_kernel::ThreadResume::Normal));
}

#[test]
fn terminating_the_last_thread_exits_the_process() {
    let mut kernel = common::kernel();
    let pid = common::process(&mut kernel, "short");
    let tid = common::spawn(&mut kernel, pid, "only", 20);
    let event = kernel.create_event(pid, kumquat_kernel::ResetType::Sticky).unwrap();
    kernel.adopt_handle(pid, event).unwrap();

    kernel.terminate_process(pid);
    assert_eq!(kernel.thread(tid).status, ThreadStatus::Dead);
    assert_eq!(kernel.process(pid).status, kumquat_kernel::ProcessStatus::Exited);
    assert!(!kernel.objects().contains(event));
    assert!(!kernel.processes().contains(&pid));
}
