//! `cfg:u`: system settings as the console's config savedata exposes them.

use log::{debug, error};
use serde::{Deserialize, Serialize};

use kumquat_kernel::errors::{level, summary};
use kumquat_kernel::{HLERequestContext, KResult, Kernel, ResultCode};

const CONFIG_MODULE: u32 = 64;
const DESCRIPTION_INVALID_SIZE: u32 = 1004;
const DESCRIPTION_NOT_FOUND: u32 = 1018;

pub const USERNAME_BLOCK: u32 = 0x000A0000;
pub const LANGUAGE_BLOCK: u32 = 0x000A0002;
pub const COUNTRY_INFO_BLOCK: u32 = 0x000B0000;
pub const SOUND_OUTPUT_MODE_BLOCK: u32 = 0x00070001;
pub const CONSOLE_MODEL_BLOCK: u32 = 0x000F0004;

/// UTF-16 code units in the username block, terminator included.
const USERNAME_UNITS: usize = 14;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Japan = 0,
    Usa = 1,
    Europe = 2,
    Australia = 3,
    China = 4,
    Korea = 5,
    Taiwan = 6,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Japanese = 0,
    English = 1,
    French = 2,
    German = 3,
    Italian = 4,
    Spanish = 5,
    SimplifiedChinese = 6,
    Korean = 7,
    Dutch = 8,
    Portuguese = 9,
    Russian = 10,
    TraditionalChinese = 11,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemModel {
    Nintendo3ds = 0,
    Nintendo3dsXl = 1,
    New3ds = 2,
    Nintendo2ds = 3,
    New3dsXl = 4,
}

impl SystemModel {
    pub fn is_new(self) -> bool {
        matches!(self, SystemModel::New3ds | SystemModel::New3dsXl)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundOutputMode {
    Mono = 0,
    Stereo = 1,
    Surround = 2,
}

/// What `cfg:u` reports to applications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub region: Region,
    pub language: Language,
    pub username: String,
    pub model: SystemModel,
    pub country: u8,
    pub sound_output_mode: SoundOutputMode,
}

impl Default for SystemSettings {
    fn default() -> Self {
        SystemSettings {
            region: Region::Usa,
            language: Language::English,
            username: String::from("KUMQUAT"),
            model: SystemModel::Nintendo3ds,
            country: 49,
            sound_output_mode: SoundOutputMode::Stereo,
        }
    }
}

impl SystemSettings {
    /// The contents of config block `block_id`, which must be exactly `size` bytes long.
    pub fn config_block(&self, block_id: u32, size: u32) -> Result<Vec<u8>, ResultCode> {
        let data = match block_id {
            USERNAME_BLOCK => {
                let mut units: Vec<u16> = self.username.encode_utf16().take(USERNAME_UNITS - 1).collect();
                units.resize(USERNAME_UNITS, 0);
                units.iter().flat_map(|unit| unit.to_le_bytes()).collect()
            },
            LANGUAGE_BLOCK => vec![self.language as u8],
            COUNTRY_INFO_BLOCK => vec![0, 0, 0, self.country],
            SOUND_OUTPUT_MODE_BLOCK => vec![self.sound_output_mode as u8],
            CONSOLE_MODEL_BLOCK => vec![self.model as u8, 0, 0, 0],
            _ => {
                error!("config block {:#010X} with size {} was not found", block_id, size);
                return Err(ResultCode::new(DESCRIPTION_NOT_FOUND, CONFIG_MODULE, summary::WRONG_ARGUMENT, level::PERMANENT))
            }
        };

        if data.len() as u32 != size {
            error!("invalid size {} for config block {:#010X}", size, block_id);
            return Err(ResultCode::new(DESCRIPTION_INVALID_SIZE, CONFIG_MODULE, summary::WRONG_ARGUMENT, level::PERMANENT))
        }
        Ok(data)
    }
}

pub struct Cfg {
    settings: SystemSettings,
}

crate::declare_service! {
    Cfg: "cfg:u", max_sessions 32;
    0x00010082 => "GetConfigInfoBlk2" => Cfg::get_config_info_blk2,
    0x00020000 => "SecureInfoGetRegion" => Cfg::secure_info_get_region,
    0x00030040 => "GenHashConsoleUnique",
    0x00040000 => "GetRegionCanadaUSA" => Cfg::get_region_canada_usa,
    0x00050000 => "GetSystemModel" => Cfg::get_system_model,
    0x00060000 => "GetModelNintendo2DS" => Cfg::get_model_nintendo_2ds,
    0x00090040 => "GetCountryCodeString",
    0x000A0040 => "GetCountryCodeID",
}

impl Cfg {
    pub fn new(settings: SystemSettings) -> Cfg {
        Cfg {
            settings,
        }
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    fn get_config_info_blk2(&mut self, kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        let size = context.pop_u32()?;
        let block_id = context.pop_u32()?;
        let buffer = context.pop_mapped_buffer()?;
        debug!("cfg::GetConfigInfoBlk2({:#010X}, {})", block_id, size);

        match self.settings.config_block(block_id, size) {
            Ok(data) => {
                buffer.write(kernel, 0, &data)?;
                context.respond(ResultCode::SUCCESS)
                    .push_mapped_buffer(buffer);
            },
            Err(code) => {
                context.respond(code)
                    .push_mapped_buffer(buffer);
            }
        }
        Ok(())
    }

    fn secure_info_get_region(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        context.respond(ResultCode::SUCCESS)
            .push_u32(self.settings.region as u32);
        Ok(())
    }

    fn get_region_canada_usa(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        context.respond(ResultCode::SUCCESS)
            .push_u32((self.settings.region == Region::Usa) as u32);
        Ok(())
    }

    fn get_system_model(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        context.respond(ResultCode::SUCCESS)
            .push_u32(self.settings.model as u32);
        Ok(())
    }

    fn get_model_nintendo_2ds(&mut self, _kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()> {
        context.respond(ResultCode::SUCCESS)
            .push_u32((self.settings.model != SystemModel::Nintendo2ds) as u32);
        Ok(())
    }
}
