mod common;

use kumquat_hle::kernel::ipc::make_header;
use kumquat_hle::kernel::{Completion, Handle, KernelError, ThreadResume};
use kumquat_hle::svc;

#[test]
fn pseudo_handles_resolve_but_cannot_be_closed() {
    let mut kernel = common::kernel();
    let tid = common::spawn_process(&mut kernel, "app");
    let pid = kernel.thread(tid).owner;

    assert_eq!(svc::get_process_id(&kernel, tid, Some(Handle::CURRENT_PROCESS)), Ok(kernel.process(pid).process_id));
    assert_eq!(svc::get_thread_id(&kernel, tid, Some(Handle::CURRENT_THREAD)), Ok(kernel.thread(tid).thread_id));
    assert_eq!(svc::close_handle(&mut kernel, tid, Some(Handle::CURRENT_THREAD)), Err(KernelError::InvalidHandle));
    assert_eq!(svc::close_handle(&mut kernel, tid, None), Err(KernelError::InvalidHandle));
}

#[test]
fn handles_are_typed() {
    let mut kernel = common::kernel();
    let tid = common::spawn_process(&mut kernel, "app");

    let event = svc::create_event(&mut kernel, tid, 0).unwrap();
    assert_eq!(svc::release_semaphore(&mut kernel, tid, Some(event), 1), Err(KernelError::InvalidHandle));
    assert_eq!(svc::create_event(&mut kernel, tid, 7), Err(KernelError::InvalidEnumValue));

    let duplicate = svc::duplicate_handle(&mut kernel, tid, Some(event)).unwrap();
    assert_ne!(duplicate, event);
    svc::close_handle(&mut kernel, tid, Some(event)).unwrap();
    svc::signal_event(&mut kernel, tid, Some(duplicate)).unwrap();
    assert_eq!(svc::wait_synchronization_1(&mut kernel, tid, Some(duplicate), 0), Ok(Completion::Immediate { index: Some(0) }));
    assert_eq!(svc::signal_event(&mut kernel, tid, Some(event)), Err(KernelError::InvalidHandle));
}

#[test]
fn wait_synchronization_n_bounds_the_handle_count() {
    let mut kernel = common::kernel();
    let tid = common::spawn_process(&mut kernel, "app");
    let event = svc::create_event(&mut kernel, tid, 1).unwrap();

    let handles = vec![Some(event); svc::MAX_WAIT_OBJECTS + 1];
    assert_eq!(svc::wait_synchronization_n(&mut kernel, tid, &handles, false, 0), Err(KernelError::OutOfRange));

    let semaphore = svc::create_semaphore(&mut kernel, tid, 1, 1).unwrap();
    assert_eq!(svc::wait_synchronization_n(&mut kernel, tid, &[Some(event), Some(semaphore)], false, 0), Ok(Completion::Immediate { index: Some(1) }));
    assert_eq!(svc::wait_synchronization_n(&mut kernel, tid, &[Some(event), Some(semaphore)], true, 0), Err(KernelError::Timeout));
}

#[test]
fn named_ports_hand_back_only_the_server() {
    let mut kernel = common::kernel();
    let server = common::spawn_process(&mut kernel, "server");
    let client = common::spawn_process(&mut kernel, "client");

    let (server_port, client_port) = svc::create_port(&mut kernel, server, Some("test"), 1).unwrap();
    assert_eq!(client_port, None);
    assert_eq!(svc::create_port(&mut kernel, server, Some("test"), 1), Err(KernelError::AlreadyRegistered));
    assert_eq!(svc::create_port(&mut kernel, server, Some("much:too:long"), 1), Err(KernelError::PortNameTooLong));

    let session = svc::connect_to_port(&mut kernel, client, "test").unwrap();
    assert_eq!(svc::connect_to_port(&mut kernel, client, "test"), Err(KernelError::MaxConnectionsReached));
    let server_session = svc::accept_session(&mut kernel, server, Some(server_port)).unwrap();

    assert_eq!(svc::reply_and_receive_pre(&mut kernel, server, &[Some(server_session)], None), Ok(Completion::Suspended));
    common::write_command(&kernel, client, &[make_header(9, 0, 0)]);
    assert_eq!(svc::send_sync_request(&mut kernel, client, Some(session)), Ok(Completion::Suspended));

    let resume = kernel.take_resume(server).unwrap();
    let (index, result) = svc::reply_and_receive_resume(&mut kernel, server, &[Some(server_session)], resume);
    assert_eq!((index, result), (Some(0), Ok(())));
    assert_eq!(common::read_command(&kernel, server, 1), vec![make_header(9, 0, 0)]);

    common::write_command(&kernel, server, &[make_header(9, 1, 0), 0]);
    assert_eq!(svc::reply_and_receive_pre(&mut kernel, server, &[Some(server_session)], Some(server_session)), Ok(Completion::Suspended));
    assert_eq!(kernel.take_resume(client), Some(ThreadResume::Normal));
}

#[test]
fn unnamed_sessions_connect_directly() {
    let mut kernel = common::kernel();
    let tid = common::spawn_process(&mut kernel, "app");

    let (server, client) = svc::create_session(&mut kernel, tid).unwrap();
    assert_ne!(server, client);
    svc::close_handle(&mut kernel, tid, Some(client)).unwrap();

    // The closed session is immediately readable so the receiver notices the closure
    assert_eq!(svc::reply_and_receive_pre(&mut kernel, tid, &[Some(server)], None), Ok(Completion::Immediate { index: Some(0) }));
    assert_eq!(svc::reply_and_receive_post(&mut kernel, tid, &[Some(server)], 0), Err(KernelError::SessionClosed));
}

#[test]
fn interrupts_signal_bound_events() {
    let mut kernel = common::kernel();
    let tid = common::spawn_process(&mut kernel, "app");
    let event = svc::create_event(&mut kernel, tid, 0).unwrap();

    svc::bind_interrupt(&mut kernel, tid, 0x2A, Some(event), 0, false).unwrap();
    assert_eq!(svc::bind_interrupt(&mut kernel, tid, 0x2A, Some(event), 0, false), Err(KernelError::AlreadyRegistered));

    kernel.external_requests().raise_interrupt(0x2A);
    kernel.process_external_requests();
    assert_eq!(svc::wait_synchronization_1(&mut kernel, tid, Some(event), 0), Ok(Completion::Immediate { index: Some(0) }));

    svc::unbind_interrupt(&mut kernel, tid, 0x2A, Some(event)).unwrap();
    kernel.external_requests().raise_interrupt(0x2A);
    kernel.process_external_requests();
    assert_eq!(svc::wait_synchronization_1(&mut kernel, tid, Some(event), 0), Err(KernelError::Timeout));
}

#[test]
fn new_threads_start_ready() {
    let mut kernel = common::kernel();
    let tid = common::spawn_process(&mut kernel, "app");

    let handle = svc::create_thread(&mut kernel, tid, 0x00100100, 7, 0x0FFF0000, 0x20, -2).unwrap();
    assert_eq!(svc::get_thread_priority(&kernel, tid, Some(handle)), Ok(0x20));
    svc::set_thread_priority(&mut kernel, tid, Some(handle), 0x3F).unwrap();
    assert_eq!(svc::get_thread_priority(&kernel, tid, Some(handle)), Ok(0x3F));
    assert_eq!(svc::create_thread(&mut kernel, tid, 0x00100100, 7, 0x0FFF0000, 0x40, -2), Err(KernelError::OutOfRange));
}

#[test]
fn unknown_syscalls_are_not_implemented() {
    assert_eq!(svc::unimplemented(0x7F), KernelError::NotImplemented);
}
