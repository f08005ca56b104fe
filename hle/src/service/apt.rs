//! `APT:U`, the applet manager, reduced to what an application needs to get through startup.

use log::{debug, warn};

use kumquat_kernel::{HLERequestContext, KResult, Kernel, ObjectId, ProcessId, ResetType, ResultCode};

pub const APPID_HOME_MENU: u32 = 0x101;
pub const APPID_APPLICATION: u32 = 0x300;

/// InquireNotification: nothing is pending.
const SIGNAL_NONE: u32 = 0;

pub struct Apt {
    /// Handed out by GetLockHandle.
    lock: ObjectId,
    notification_event: ObjectId,
    parameter_event: ObjectId,
    new_3ds: bool,
    registered_applets: Vec<u32>,
}

crate::declare_service! {
    Apt: "APT:U", max_sessions 1;
    0x00010040 => "GetLockHandle" => Apt::get_lock_handle,
    0x00020080 => "Initialize" => Apt::initialize,
    0x00030040 => "Enable" => Apt::enable,
    0x00050040 => "GetAppletManInfo" => Apt::get_applet_man_info,
    0x00090040 => "IsRegistered" => Apt::is_registered,
    0x000B0040 => "InquireNotification" => Apt::inquire_notification,
    0x000C0104 => "SendParameter",
    0x000D0080 => "ReceiveParameter",
    0x000E0080 => "GlanceParameter",
    0x00430040 => "NotifyToWait" => Apt::notify_to_wait,
    0x00440000 => "GetSharedFont",
    0x01020000 => "CheckNew3DS" => Apt::check_new_3ds,
}

impl Apt {
    /// Creates the lock and events APT hands to applications, owned by `process`.
    pub fn new(kernel: &mut Kernel, process: ProcessId, new_3ds: bool) -> KResult<Apt> {
        let lock = kernel.create_mutex(process, None)?;
        let notification_event = kernel.create_event(process, ResetType::OneShot)?;
        let parameter_event = kernel.create_event(process, ResetType::OneShot)?;

        Ok(Apt {
            lock,
            notification_event,
            parameter_event,
            new_3ds,
            registered_applets: vec![],
        })
    }

    fn get_lock_handle(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let attributes = context.pop_u32()?;
        warn!("(STUBBED) APT::GetLockHandle(attributes {:#010X})", attributes);

        context.respond(ResultCode::SUCCESS)
            .push_u32(attributes)
            .push_u32(0)
            .push_objects(false, vec![Some(self.lock)]);
        Ok(())
    }

    fn initialize(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let app_id = context.pop_u32()?;
        let attributes = context.pop_u32()?;
        debug!("APT::Initialize(app_id {:#010X}, attributes {:#010X})", app_id, attributes);

        if !self.registered_applets.contains(&app_id) {
            self.registered_applets.push(app_id);
        }

        context.respond(ResultCode::SUCCESS)
            .push_objects(false, vec![Some(self.notification_event), Some(self.parameter_event)]);
        Ok(())
    }

    fn enable(&mut self, kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let attributes = context.pop_u32()?;
        debug!("APT::Enable(attributes {:#010X})", attributes);

        // The application waits for its first parameter (the wakeup) once enabled
        kernel.signal_event(self.parameter_event)?;
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn get_applet_man_info(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let unknown = context.pop_u32()?;
        warn!("(STUBBED) APT::GetAppletManInfo({:#010X})", unknown);

        context.respond(ResultCode::SUCCESS)
            .push_u32(0)
            .push_u32(0)
            .push_u32(APPID_HOME_MENU)
            .push_u32(APPID_APPLICATION);
        Ok(())
    }

    fn is_registered(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let app_id = context.pop_u32()?;
        let registered = self.registered_applets.contains(&app_id);
        context.respond(ResultCode::SUCCESS)
            .push_u32(registered as u32);
        Ok(())
    }

    fn inquire_notification(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let app_id = context.pop_u32()?;
        debug!("APT::InquireNotification({:#010X})", app_id);
        context.respond(ResultCode::SUCCESS)
            .push_u32(SIGNAL_NONE);
        Ok(())
    }

    fn notify_to_wait(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let app_id = context.pop_u32()?;
        warn!("(STUBBED) APT::NotifyToWait({:#010X})", app_id);
        context.respond(ResultCode::SUCCESS);
        Ok(())
    }

    fn check_new_3ds(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        context.respond(ResultCode::SUCCESS)
            .push_u32(self.new_3ds as u32);
        Ok(())
    }
}
