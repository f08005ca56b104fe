//! `srv:`, the service manager.
//!
//! Services are registered by name, either by the host or by guest processes through
//! RegisterService, and clients open sessions to them with GetServiceHandle. Notifications are
//! delivered per session through a semaphore the client obtains with EnableNotification.

use std::collections::{BTreeMap, HashMap, VecDeque};

use log::{debug, info, warn};

use kumquat_kernel::{HLERequestContext, KResult, Kernel, KernelError, ObjectId, ProcessId, ResultCode};

/// Notifications queued per client before new ones are dropped.
pub const MAX_PENDING_NOTIFICATIONS: usize = 0x10;
const MAX_SERVICE_NAME_LENGTH: u32 = 8;

#[derive(Default)]
struct ClientInfo {
    process_id: Option<u32>,
    notification_semaphore: Option<ObjectId>,
    subscriptions: Vec<u32>,
    pending_notifications: VecDeque<u32>,
}

pub struct Srv {
    /// Owner of the objects srv: creates on behalf of its clients.
    process: ProcessId,
    /// Client ports by service name, each holding a reference.
    services: BTreeMap<String, ObjectId>,
    clients: HashMap<ObjectId, ClientInfo>,
}

crate::declare_service! {
    Srv: "srv:", max_sessions 64, on_disconnect Srv::forget_client;
    0x00010002 => "RegisterClient" => Srv::register_client,
    0x00020000 => "EnableNotification" => Srv::enable_notification,
    0x00030100 => "RegisterService" => Srv::register_service,
    0x000400C0 => "UnregisterService" => Srv::unregister_service,
    0x00050100 => "GetServiceHandle" => Srv::get_service_handle,
    0x000600C2 => "RegisterPort",
    0x000700C0 => "UnregisterPort",
    0x00080100 => "GetPort",
    0x00090040 => "Subscribe" => Srv::subscribe,
    0x000A0040 => "Unsubscribe" => Srv::unsubscribe,
    0x000B0000 => "ReceiveNotification" => Srv::receive_notification,
    0x000C0080 => "PublishToSubscriber" => Srv::publish_to_subscriber,
    0x000D0040 => "PublishAndGetSubscriber",
    0x000E00C0 => "IsServiceRegistered" => Srv::is_service_registered,
}

/// Reads the (name, name, length) triple srv: commands start with.
fn pop_service_name(context: &mut HLERequestContext) -> KResult<String> {
    let mut raw = [0u8; 8];
    raw[..4].copy_from_slice(&context.pop_u32()?.to_le_bytes());
    raw[4..].copy_from_slice(&context.pop_u32()?.to_le_bytes());
    let len = context.pop_u32()?;

    if len > MAX_SERVICE_NAME_LENGTH {
        return Err(KernelError::InvalidNameSize)
    }
    let name = &raw[..len as usize];
    if name.contains(&0) {
        return Err(KernelError::NameContainsNul)
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

impl Srv {
    pub fn new(process: ProcessId) -> Srv {
        Srv {
            process,
            services: BTreeMap::new(),
            clients: HashMap::new(),
        }
    }

    /// Publishes a client port under `name`, taking over the caller's reference to it.
    pub fn register_port(&mut self, kernel: &mut Kernel, name: &str, client_port: ObjectId) -> KResult<()> {
        if name.len() as u32 > MAX_SERVICE_NAME_LENGTH {
            kernel.release_object(client_port);
            return Err(KernelError::InvalidNameSize)
        }
        if self.services.contains_key(name) {
            kernel.release_object(client_port);
            return Err(KernelError::AlreadyRegistered)
        }
        info!("registered service {}", name);
        self.services.insert(name.to_owned(), client_port);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> KResult<ObjectId> {
        self.services.get(name).copied().ok_or(KernelError::ServiceNotRegistered)
    }

    pub fn service_names(&self) -> impl Iterator<Item=&str> + '_ {
        self.services.keys().map(String::as_str)
    }

    /// The process id a session announced through RegisterClient.
    pub fn client_process_id(&self, server_session: ObjectId) -> Option<u32> {
        self.clients.get(&server_session).and_then(|client| client.process_id)
    }

    fn client(&mut self, context: &HLERequestContext) -> &mut ClientInfo {
        self.clients.entry(context.session()).or_default()
    }

    fn register_client(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let pid = context.pop_pid()?;
        debug!("srv::RegisterClient(pid {})", pid);
        self.client(context).process_id = Some(pid);
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn enable_notification(&mut self, kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let semaphore = match self.client(context).notification_semaphore {
            Some(semaphore) => semaphore,
            None => {
                let semaphore = kernel.create_semaphore(self.process, 0, MAX_PENDING_NOTIFICATIONS as i32)?;
                self.client(context).notification_semaphore = Some(semaphore);
                semaphore
            }
        };

        context.respond(ResultCode::SUCCESS)
            .push_objects(false, vec![Some(semaphore)]);
        Ok(())
    }

    fn register_service(&mut self, kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let name = pop_service_name(context)?;
        let max_sessions = context.pop_u32()?;
        debug!("srv::RegisterService({:?}, {})", name, max_sessions);

        if self.services.contains_key(&name) {
            return Err(KernelError::AlreadyRegistered)
        }

        let (server, client) = kernel.create_port_pair(&name, max_sessions, None);
        self.register_port(kernel, &name, client)?;

        context.respond(ResultCode::SUCCESS)
            .push_objects(true, vec![Some(server)]);
        Ok(())
    }

    fn unregister_service(&mut self, kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let name = pop_service_name(context)?;
        debug!("srv::UnregisterService({:?})", name);

        let port = self.services.remove(&name).ok_or(KernelError::ServiceNotRegistered)?;
        kernel.release_object(port);
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn get_service_handle(&mut self, kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let name = pop_service_name(context)?;
        let flags = context.pop_u32()?;
        debug!("srv::GetServiceHandle({:?}, {:#X})", name, flags);

        let port = match self.lookup(&name) {
            Ok(port) => port,
            Err(err) => {
                // Requests run to completion, so waiting for a later registration is not possible
                warn!("srv::GetServiceHandle: {:?} is not registered", name);
                return Err(err)
            }
        };

        let session = kernel.connect_to_port(port)?;
        context.respond(ResultCode::SUCCESS)
            .push_objects(true, vec![Some(session)]);
        Ok(())
    }

    fn subscribe(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let notification = context.pop_u32()?;
        debug!("srv::Subscribe({:#X})", notification);
        let client = self.client(context);
        if !client.subscriptions.contains(&notification) {
            client.subscriptions.push(notification);
        }
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn unsubscribe(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let notification = context.pop_u32()?;
        debug!("srv::Unsubscribe({:#X})", notification);
        self.client(context).subscriptions.retain(|n| *n != notification);
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn receive_notification(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let notification = self.client(context).pending_notifications.pop_front().unwrap_or(0);
        context.respond(ResultCode::SUCCESS)
            .push_u32(notification);
        Ok(())
    }

    fn publish_to_subscriber(&mut self, kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let notification = context.pop_u32()?;
        let flags = context.pop_u32()?;
        debug!("srv::PublishToSubscriber({:#X}, {:#X})", notification, flags);
        self.publish(kernel, notification);
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn is_service_registered(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let name = pop_service_name(context)?;
        let registered = self.services.contains_key(&name);
        context.respond(ResultCode::SUCCESS)
            .push_u32(registered as u32);
        Ok(())
    }

    /// Queues `notification` for every subscribed client and signals their semaphores.
    pub fn publish(&mut self, kernel: &mut Kernel, notification: u32) {
        for client in self.clients.values_mut() {
            if !client.subscriptions.contains(&notification) {
                continue
            }
            if client.pending_notifications.len() >= MAX_PENDING_NOTIFICATIONS {
                warn!("dropping notification {:#X}, client queue is full", notification);
                continue
            }
            client.pending_notifications.push_back(notification);
            if let Some(semaphore) = client.notification_semaphore {
                if let Err(err) = kernel.release_semaphore(semaphore, 1) {
                    debug!("notification semaphore {:?} not released: {}", semaphore, err);
                }
            }
        }
    }

    fn forget_client(&mut self, kernel: &mut Kernel, server_session: ObjectId) {
        if let Some(client) = self.clients.remove(&server_session) {
            if let Some(semaphore) = client.notification_semaphore {
                kernel.release_object(semaphore);
            }
        }
    }
}
