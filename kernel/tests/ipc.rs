mod common;

use std::cell::RefCell;
use std::rc::Rc;

use kumquat_kernel::hle_ipc::HLERequestContext;
use kumquat_kernel::ipc::{descriptor, make_header};
use kumquat_kernel::memory::Memory;
use kumquat_kernel::{Completion, Handle, KResult, Kernel, KernelError, ObjectId, ResetType, ResultCode, SessionRequestHandler, ThreadResume, ThreadStatus, Timeout};

/// Answers every request with the normal words and handles it was sent.
#[derive(Default)]
struct Echo {
    connected: u32,
    disconnected: u32,
}

impl SessionRequestHandler for Echo {
    fn handle_sync_request(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        if context.command_id() == 0xFF {
            return Err(KernelError::InvalidCombination)
        }
        if context.command_id() == 0xFE {
            // Unhandled: the kernel answers NotImplemented
            return Ok(())
        }
        let value = context.pop_u32()?;
        let objects = context.pop_objects()?;
        context.respond(ResultCode::SUCCESS)
            .push_u32(value)
            .push_objects(false, objects);
        Ok(())
    }

    fn client_connected(&mut self, _kernel: &mut Kernel, _server_session: ObjectId) {
        self.connected += 1;
    }

    fn client_disconnected(&mut self, _kernel: &mut Kernel, _server_session: ObjectId) {
        self.disconnected += 1;
    }
}

fn echo_kernel() -> (Kernel, Rc<RefCell<Echo>>) {
    let mut kernel = common::kernel();
    let echo = Rc::new(RefCell::new(Echo::default()));
    let (_server, client) = kernel.create_port_pair("echo", 2, Some(echo.clone()));
    kernel.register_named_port("echo", client).unwrap();
    (kernel, echo)
}

#[test]
fn echo_round_trip_returns_equivalent_handle() {
    let (mut kernel, echo) = echo_kernel();
    let pid = common::process(&mut kernel, "client");
    let tid = common::spawn(&mut kernel, pid, "main", 30);

    let event = kernel.create_event(pid, ResetType::OneShot).unwrap();
    let handle = kernel.adopt_handle(pid, event).unwrap();
    let session = kernel.connect_to_named_port("echo").unwrap();
    assert_eq!(echo.borrow().connected, 1);

    common::write_command(&kernel, tid, &[make_header(1, 1, 2), 42, descriptor::copy_handles(1), handle.raw()]);
    assert_eq!(kernel.send_sync_request(tid, session), Ok(Completion::Immediate { index: None }));

    let response = common::read_command(&kernel, tid, 5);
    assert_eq!(response[0], make_header(1, 2, 2));
    assert_eq!(response[1], 0);
    assert_eq!(response[2], 42);
    assert_eq!(response[3], descriptor::copy_handles(1));

    let echoed = Handle::from_raw(response[4]).unwrap();
    assert_eq!(kernel.lookup_handle(pid, tid, Some(echoed)), Ok(event));
    assert_eq!(kernel.lookup_handle(pid, tid, Some(handle)), Ok(event));
    assert_eq!(kernel.objects().refcount(event), 2);

    kernel.release_object(session);
    assert_eq!(echo.borrow().disconnected, 1);
}

#[test]
fn handler_errors_and_silence_become_responses() {
    let (mut kernel, _echo) = echo_kernel();
    let pid = common::process(&mut kernel, "client");
    let tid = common::spawn(&mut kernel, pid, "main", 30);
    let session = kernel.connect_to_named_port("echo").unwrap();

    common::write_command(&kernel, tid, &[make_header(0xFF, 0, 0)]);
    kernel.send_sync_request(tid, session).unwrap();
    assert_eq!(common::read_command(&kernel, tid, 2), vec![make_header(0xFF, 1, 0), KernelError::InvalidCombination.raw()]);

    common::write_command(&kernel, tid, &[make_header(0xFE, 0, 0)]);
    kernel.send_sync_request(tid, session).unwrap();
    assert_eq!(common::read_command(&kernel, tid, 2), vec![make_header(0xFE, 1, 0), KernelError::NotImplemented.raw()]);
}

#[test]
fn named_port_lookup_and_session_limits() {
    let (mut kernel, _echo) = echo_kernel();
    assert_eq!(kernel.connect_to_named_port("missing"), Err(KernelError::NotFound));
    assert_eq!(kernel.connect_to_named_port("much:too:long"), Err(KernelError::PortNameTooLong));

    let first = kernel.connect_to_named_port("echo").unwrap();
    let _second = kernel.connect_to_named_port("echo").unwrap();
    assert_eq!(kernel.connect_to_named_port("echo"), Err(KernelError::MaxConnectionsReached));

    kernel.release_object(first);
    assert!(kernel.connect_to_named_port("echo").is_ok());
}

struct GuestPair {
    kernel: Kernel,
    server_thread: kumquat_kernel::ThreadId,
    client_thread: kumquat_kernel::ThreadId,
    server_session: ObjectId,
    client_session: ObjectId,
}

fn guest_pair() -> GuestPair {
    let mut kernel = common::kernel();
    let server_process = common::process(&mut kernel, "server");
    let client_process = common::process(&mut kernel, "client");
    let server_thread = common::spawn(&mut kernel, server_process, "server", 20);
    let client_thread = common::spawn(&mut kernel, client_process, "client", 30);

    let (server_port, client_port) = kernel.create_port_pair("guest", 1, None);
    let client_session = kernel.connect_to_port(client_port).unwrap();
    let server_session = kernel.accept_session(server_port).unwrap();
    assert_eq!(kernel.accept_session(server_port), Err(KernelError::NoPendingSessions));

    GuestPair { kernel, server_thread, client_thread, server_session, client_session }
}

#[test]
fn guest_server_receives_and_replies() {
    let GuestPair { mut kernel, server_thread, client_thread, server_session, client_session } = guest_pair();

    assert_eq!(kernel.reply_and_receive(server_thread, &[server_session], None), Ok(Completion::Suspended));

    common::write_command(&kernel, client_thread, &[make_header(7, 1, 2), 99, descriptor::calling_pid(), 0]);
    assert_eq!(kernel.send_sync_request(client_thread, client_session), Ok(Completion::Suspended));
    assert_eq!(kernel.thread(client_thread).status, ThreadStatus::WaitIpc);

    assert_eq!(kernel.take_resume(server_thread), Some(ThreadResume::Signaled { index: Some(0) }));
    kernel.finish_receive(server_thread, server_session).unwrap();
    let request = common::read_command(&kernel, server_thread, 4);
    let client_pid = kernel.process(kernel.thread(client_thread).owner).process_id;
    assert_eq!(request, vec![make_header(7, 1, 2), 99, descriptor::calling_pid(), client_pid]);

    common::write_command(&kernel, server_thread, &[make_header(7, 2, 0), 0, 100]);
    assert_eq!(kernel.reply_and_receive(server_thread, &[server_session], Some(server_session)), Ok(Completion::Suspended));
    assert_eq!(kernel.take_resume(client_thread), Some(ThreadResume::Normal));
    assert_eq!(common::read_command(&kernel, client_thread, 3), vec![make_header(7, 2, 0), 0, 100]);

    // Closing the client wakes the server so it can observe the closure
    kernel.release_object(client_session);
    assert_eq!(kernel.take_resume(server_thread), Some(ThreadResume::Signaled { index: Some(0) }));
    assert_eq!(kernel.finish_receive(server_thread, server_session), Err(KernelError::SessionClosed));
}

#[test]
fn closing_the_server_fails_pending_requests() {
    let GuestPair { mut kernel, server_thread: _, client_thread, server_session, client_session } = guest_pair();

    common::write_command(&kernel, client_thread, &[make_header(1, 0, 0)]);
    kernel.send_sync_request(client_thread, client_session).unwrap();

    kernel.release_object(server_session);
    assert_eq!(kernel.take_resume(client_thread), Some(ThreadResume::Error { result: KernelError::SessionClosed, index: None }));
    assert_eq!(kernel.send_sync_request(client_thread, client_session), Err(KernelError::SessionClosed));
}

#[test]
fn mapped_buffers_are_visible_to_the_server() {
    let GuestPair { mut kernel, server_thread, client_thread, server_session, client_session } = guest_pair();
    let client_process = kernel.thread(client_thread).owner;
    let server_process = kernel.thread(server_thread).owner;
    kernel.control_memory(client_process, kumquat_kernel::process::memory_operation::COMMIT, 0x08000000, 0, 0x2000, kumquat_kernel::MemoryPermission::READ_WRITE).unwrap();
    kernel.process(client_process).address_space.write(0x08000FF0, b"hello, server!").unwrap();

    kernel.reply_and_receive(server_thread, &[server_session], None).unwrap();
    common::write_command(&kernel, client_thread, &[make_header(2, 0, 2), descriptor::mapped_buffer(14, 3), 0x08000FF0]);
    kernel.send_sync_request(client_thread, client_session).unwrap();
    kernel.take_resume(server_thread);
    kernel.finish_receive(server_thread, server_session).unwrap();

    let request = common::read_command(&kernel, server_thread, 3);
    assert_eq!(request[1], descriptor::mapped_buffer(14, 3));
    let mut bytes = [0u8; 14];
    kernel.process(server_process).address_space.read(request[2], &mut bytes).unwrap();
    assert_eq!(&bytes, b"hello, server!");
    kernel.process(server_process).address_space.write(request[2], b"HELLO").unwrap();

    common::write_command(&kernel, server_thread, &[make_header(2, 1, 2), 0, descriptor::mapped_buffer(14, 3), request[2]]);
    kernel.reply(server_thread, server_session).unwrap();

    assert_eq!(kernel.take_resume(client_thread), Some(ThreadResume::Normal));
    assert_eq!(common::read_command(&kernel, client_thread, 4)[3], 0x08000FF0);
    let mut bytes = [0u8; 5];
    kernel.process(client_process).address_space.read(0x08000FF0, &mut bytes).unwrap();
    assert_eq!(&bytes, b"HELLO");
    assert!(kernel.process(server_process).address_space.check_range(request[2], 14, kumquat_kernel::MemoryPermission::READ).is_err());
}

#[test]
fn waiting_on_a_closed_session_completes() {
    let GuestPair { mut kernel, server_thread, client_thread: _, server_session, client_session } = guest_pair();
    kernel.release_object(client_session);
    assert_eq!(kernel.wait_synchronization(server_thread, &[server_session], false, Timeout::Forever), Ok(Completion::Immediate { index: Some(0) }));
}

#[test]
fn rejected_hle_request_keeps_moved_handles() {
    let (mut kernel, _echo) = echo_kernel();
    let pid = common::process(&mut kernel, "client");
    let tid = common::spawn(&mut kernel, pid, "main", 30);
    let event = kernel.create_event(pid, ResetType::OneShot).unwrap();
    let handle = kernel.adopt_handle(pid, event).unwrap();
    let session = kernel.connect_to_named_port("echo").unwrap();

    // The mapped buffer points at memory the client never committed
    common::write_command(&kernel, tid, &[
        make_header(1, 1, 4), 42,
        descriptor::move_handles(1), handle.raw(),
        descriptor::mapped_buffer(4, 3), 0x08000000,
    ]);
    assert!(kernel.send_sync_request(tid, session).is_err());
    assert_eq!(kernel.lookup_handle(pid, tid, Some(handle)), Ok(event));
    assert_eq!(kernel.objects().refcount(event), 1);

    common::write_command(&kernel, tid, &[make_header(1, 1, 2), 42, descriptor::move_handles(1), handle.raw()]);
    kernel.send_sync_request(tid, session).unwrap();
    assert!(kernel.lookup_handle(pid, tid, Some(handle)).is_err());
    let echoed = Handle::from_raw(common::read_command(&kernel, tid, 5)[4]).unwrap();
    assert_eq!(kernel.lookup_handle(pid, tid, Some(echoed)), Ok(event));
}

#[test]
fn rejected_guest_request_keeps_moved_handles() {
    let GuestPair { mut kernel, server_thread, client_thread, server_session, client_session } = guest_pair();
    let client_process = kernel.thread(client_thread).owner;
    let server_process = kernel.thread(server_thread).owner;
    let event = kernel.create_event(client_process, ResetType::OneShot).unwrap();
    let handle = kernel.adopt_handle(client_process, event).unwrap();
    let server_handles = kernel.process(server_process).handle_table.len();

    // The server never set up a static buffer, so the copy does not fit
    let source = kernel.thread(client_thread).command_buffer_address();
    kernel.reply_and_receive(server_thread, &[server_session], None).unwrap();
    common::write_command(&kernel, client_thread, &[
        make_header(3, 0, 4),
        descriptor::move_handles(1), handle.raw(),
        descriptor::static_buffer(4, 0), source,
    ]);
    kernel.send_sync_request(client_thread, client_session).unwrap();
    kernel.take_resume(server_thread);
    assert_eq!(kernel.finish_receive(server_thread, server_session), Err(KernelError::InvalidBufferDescriptor));

    assert_eq!(kernel.take_resume(client_thread), Some(ThreadResume::Error { result: KernelError::InvalidBufferDescriptor, index: None }));
    assert_eq!(kernel.lookup_handle(client_process, client_thread, Some(handle)), Ok(event));
    assert_eq!(kernel.process(server_process).handle_table.len(), server_handles);

    kernel.reply_and_receive(server_thread, &[server_session], None).unwrap();
    common::write_command(&kernel, client_thread, &[make_header(3, 0, 2), descriptor::move_handles(1), handle.raw()]);
    kernel.send_sync_request(client_thread, client_session).unwrap();
    kernel.take_resume(server_thread);
    kernel.finish_receive(server_thread, server_session).unwrap();

    let moved = Handle::from_raw(common::read_command(&kernel, server_thread, 3)[2]).unwrap();
    assert_eq!(kernel.lookup_handle(server_process, server_thread, Some(moved)), Ok(event));
    assert!(kernel.lookup_handle(client_process, client_thread, Some(handle)).is_err());
}
