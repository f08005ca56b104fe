//! Host implemented services and the `srv:` port that hands them out.

pub mod apt;
pub mod cfg;
pub mod helper;
pub mod ndm;
pub mod srv;

use std::cell::RefCell;
use std::rc::Rc;

use log::info;

use kumquat_kernel::{KResult, Kernel, MemoryRegion, ProcessId, ResourceLimits, SharedRequestHandler};

pub use self::apt::Apt;
pub use self::cfg::{Cfg, SystemSettings};
pub use self::helper::{Service, ServiceFramework};
pub use self::ndm::Ndm;
pub use self::srv::Srv;

/// Name of the process owning every object host services create.
pub const HLE_PROCESS_NAME: &str = "hle";

pub struct ServiceManager {
    srv: Rc<RefCell<ServiceFramework<Srv>>>,
    process: ProcessId,
}

impl ServiceManager {
    /// Creates the host service process and publishes `srv:` as a named port.
    pub fn install(kernel: &mut Kernel) -> KResult<ServiceManager> {
        let process = kernel.create_process(HLE_PROCESS_NAME, ResourceLimits::unlimited(), MemoryRegion::Base);

        let srv = ServiceFramework::shared(Srv::new(process));
        let handler: SharedRequestHandler = srv.clone();
        let (server, client) = kernel.create_port_pair(Srv::PORT_NAME, Srv::MAX_SESSIONS, Some(handler));
        // Sessions find the handler through the client port, the server end is never waited on
        kernel.release_object(server);
        let result = kernel.register_named_port(Srv::PORT_NAME, client);
        kernel.release_object(client);
        result?;

        info!("installed {}", Srv::PORT_NAME);
        Ok(ServiceManager {
            srv,
            process,
        })
    }

    /// Registers `service` with `srv:` under its port name.
    pub fn register<S: Service>(&mut self, kernel: &mut Kernel, service: S) -> KResult<Rc<RefCell<ServiceFramework<S>>>> {
        let framework = ServiceFramework::shared(service);
        let handler: SharedRequestHandler = framework.clone();
        let (server, client) = kernel.create_port_pair(S::PORT_NAME, S::MAX_SESSIONS, Some(handler));
        kernel.release_object(server);
        self.srv.borrow_mut().service_mut().register_port(kernel, S::PORT_NAME, client)?;
        Ok(framework)
    }

    /// Registers the services every application expects to find.
    pub fn install_default_services(&mut self, kernel: &mut Kernel, settings: &SystemSettings) -> KResult<()> {
        let apt = Apt::new(kernel, self.process, settings.model.is_new())?;
        self.register(kernel, apt)?;
        self.register(kernel, Cfg::new(settings.clone()))?;
        self.register(kernel, Ndm::new())?;
        Ok(())
    }

    pub fn srv(&self) -> &Rc<RefCell<ServiceFramework<Srv>>> {
        &self.srv
    }

    pub fn service_names(&self) -> Vec<String> {
        self.srv.borrow().service().service_names().map(str::to_owned).collect()
    }

    /// The process host services create their objects in.
    pub fn process(&self) -> ProcessId {
        self.process
    }
}
