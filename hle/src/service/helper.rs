use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::rc::Rc;

use log::{error, trace};

use kumquat_kernel::{HLERequestContext, KResult, Kernel, ObjectId, SessionRequestHandler};

pub type HandlerFn<S> = fn(&mut S, &mut Kernel, &mut HLERequestContext) -> KResult<()>;

/// One entry of a service's command table, keyed by the full header word.
pub struct FunctionInfo<S> {
    pub header: u32,
    pub handler: Option<HandlerFn<S>>,
    pub name: &'static str,
}

/// A host implemented service reachable through `srv:`.
pub trait Service: Sized + 'static {
    const PORT_NAME: &'static str;
    const MAX_SESSIONS: u32;

    fn functions() -> Vec<FunctionInfo<Self>>;

    fn client_connected(&mut self, _kernel: &mut Kernel, _server_session: ObjectId) {}

    fn client_disconnected(&mut self, _kernel: &mut Kernel, _server_session: ObjectId) {}
}

/// Dispatches requests to a `Service` by header.
pub struct ServiceFramework<S: Service> {
    service: S,
    handlers: BTreeMap<u32, FunctionInfo<S>>,
}

impl<S: Service> ServiceFramework<S> {
    pub fn new(service: S) -> ServiceFramework<S> {
        let mut handlers = BTreeMap::new();
        for info in S::functions() {
            let previous = handlers.insert(info.header, info);
            assert!(previous.is_none(), "{}: duplicate command header", S::PORT_NAME);
        }
        ServiceFramework {
            service,
            handlers,
        }
    }

    pub fn shared(service: S) -> Rc<RefCell<ServiceFramework<S>>> {
        Rc::new(RefCell::new(ServiceFramework::new(service)))
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    pub fn function_name(&self, header: u32) -> Option<&'static str> {
        self.handlers.get(&header).map(|info| info.name)
    }
}

impl<S: Service> SessionRequestHandler for ServiceFramework<S> {
    fn handle_sync_request(&mut self, kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let header = context.command_buffer()[0];
        let info = self.handlers.get(&header);

        match info.and_then(|info| info.handler.map(|handler| (info.name, handler))) {
            Some((name, handler)) => {
                trace!("{}::{}", S::PORT_NAME, name);
                handler(&mut self.service, kernel, context)
            },
            None => {
                report_unimplemented(S::PORT_NAME, context.command_buffer(), info.map(|info| info.name));
                Ok(())
            }
        }
    }

    fn client_connected(&mut self, kernel: &mut Kernel, server_session: ObjectId) {
        self.service.client_connected(kernel, server_session)
    }

    fn client_disconnected(&mut self, kernel: &mut Kernel, server_session: ObjectId) {
        self.service.client_disconnected(kernel, server_session)
    }
}

pub fn format_unimplemented(port_name: &str, cmd_buf: &[u32], name: Option<&str>) -> String {
    let header = cmd_buf.first().copied().unwrap_or(0);
    let function_name = match name {
        Some(name) => name.to_owned(),
        None => format!("{:#08x}", header),
    };

    let mut message = format!("unimplemented function '{}': port='{}' cmd_buf={{[0]={:#x}", function_name, port_name, header);
    for (index, word) in cmd_buf.iter().enumerate().skip(1) {
        let _ = write!(message, ", [{}]={:#x}", index, word);
    }
    message.push('}');
    message
}

/// Logs a command with no handler. The kernel answers the client with NotImplemented.
pub fn report_unimplemented(port_name: &str, cmd_buf: &[u32], name: Option<&str>) {
    error!("{}", format_unimplemented(port_name, cmd_buf, name));
}

/// Packs up to eight bytes of a service name into the two words srv: commands carry.
pub fn pack_name(name: &str) -> (u32, u32, u32) {
    let mut raw = [0u8; 8];
    let len = name.len().min(8);
    raw[..len].copy_from_slice(&name.as_bytes()[..len]);
    (
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        len as u32,
    )
}

/// Implements `Service` from a port name and a command table.
///
/// ```ignore
/// declare_service! {
///     Ndm: "ndm:u", max_sessions 1;
///     0x00060040 => "SuspendDaemons" => Ndm::suspend_daemons,
///     0x00140040 => "OverrideDefaultDaemons",
/// }
/// ```
///
/// `max_sessions N, on_disconnect path;` also routes session teardown to `path`.
#[macro_export]
macro_rules! declare_service {
    (@handler) => { None };
    (@handler $handler:path) => { Some($handler) };
    (@impl $ty:ty, $port:expr, $max:expr, [$($hook:tt)*], $($header:expr => $name:expr $(=> $handler:path)?),* $(,)*) => {
        impl $crate::service::helper::Service for $ty {
            const PORT_NAME: &'static str = $port;
            const MAX_SESSIONS: u32 = $max;

            fn functions() -> Vec<$crate::service::helper::FunctionInfo<Self>> {
                vec![
                    $($crate::service::helper::FunctionInfo {
                        header: $header,
                        handler: $crate::declare_service!(@handler $($handler)?),
                        name: $name,
                    }),*
                ]
            }

            $($hook)*
        }
    };
    ($ty:ty : $port:expr, max_sessions $max:expr, on_disconnect $disconnect:path; $($rest:tt)*) => {
        $crate::declare_service!(@impl $ty, $port, $max, [
            fn client_disconnected(&mut self, kernel: &mut $crate::kernel::Kernel, server_session: $crate::kernel::ObjectId) {
                $disconnect(self, kernel, server_session)
            }
        ], $($rest)*);
    };
    ($ty:ty : $port:expr, max_sessions $max:expr; $($rest:tt)*) => {
        $crate::declare_service!(@impl $ty, $port, $max, [], $($rest)*);
    };
}
