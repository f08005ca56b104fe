//! Kernel configuration, loaded from TOML by the frontend.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handle_table::MAX_HANDLE_TABLE_SIZE;
use crate::memory::kmm::{APPLICATION_REGION_SIZE, BASE_REGION_SIZE, SYSTEM_REGION_SIZE};
use crate::memory::PAGE_SIZE;
use crate::scheduler::THREADPRIO_LOWEST;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),
    #[error("slice length must be at least one cycle")]
    ZeroSliceLength,
    #[error("handle table size {0} is outside 1..={max}", max = MAX_HANDLE_TABLE_SIZE)]
    HandleTableSize(usize),
    #[error("priority limit {0} is above the lowest priority")]
    PriorityLimit(u32),
    #[error("{region} region size {size:#X} is not a non-zero multiple of the page size")]
    RegionSize { region: &'static str, size: u32 },
}

/// What WaitSynchronization does when a thread waits on a mutex it already holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutexRecursion {
    /// Bump the lock count, like the console kernel.
    Recursive,
    /// Fail with InvalidCombination.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub priority: u32,
    pub commit: u32,
    pub threads: u32,
    pub events: u32,
    pub mutexes: u32,
    pub semaphores: u32,
    pub timers: u32,
    pub shared_memories: u32,
    pub address_arbiters: u32,
    pub cpu_time: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            priority: 0x18,
            commit: 0x4000000,
            threads: 0x20,
            events: 0x20,
            mutexes: 0x20,
            semaphores: 0x8,
            timers: 0x8,
            shared_memories: 0x10,
            address_arbiters: 0x2,
            cpu_time: 0x1E,
        }
    }
}

/// FCRAM region sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub application: u32,
    pub system: u32,
    pub base: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            application: APPLICATION_REGION_SIZE,
            system: SYSTEM_REGION_SIZE,
            base: BASE_REGION_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Upper bound on cycles executed before timed events are checked.
    pub slice_length: u64,
    /// Rotate equal priority threads when a slice ends.
    pub round_robin: bool,
    pub mutex_recursion: MutexRecursion,
    pub handle_table_size: usize,
    pub application_limits: LimitsConfig,
    pub memory: MemoryConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            slice_length: crate::timing::MAX_SLICE_LENGTH,
            round_robin: true,
            mutex_recursion: MutexRecursion::Recursive,
            handle_table_size: crate::handle_table::DEFAULT_HANDLE_TABLE_SIZE,
            application_limits: LimitsConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl KernelConfig {
    pub fn from_toml_str(text: &str) -> Result<KernelConfig, ConfigError> {
        let config: KernelConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slice_length == 0 {
            return Err(ConfigError::ZeroSliceLength)
        }
        if self.handle_table_size == 0 || self.handle_table_size > MAX_HANDLE_TABLE_SIZE {
            return Err(ConfigError::HandleTableSize(self.handle_table_size))
        }
        if self.application_limits.priority > THREADPRIO_LOWEST {
            return Err(ConfigError::PriorityLimit(self.application_limits.priority))
        }
        for (region, size) in [("application", self.memory.application), ("system", self.memory.system), ("base", self.memory.base)] {
            if size == 0 || size % PAGE_SIZE != 0 {
                return Err(ConfigError::RegionSize { region, size })
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(KernelConfig::from_toml_str("").unwrap(), KernelConfig::default());
    }

    #[test]
    fn partial_tables_keep_defaults() {
        let config = KernelConfig::from_toml_str(r#"
            slice_length = 5000
            mutex_recursion = "reject"

            [application_limits]
            threads = 4
        "#).unwrap();
        assert_eq!(config.slice_length, 5000);
        assert_eq!(config.mutex_recursion, MutexRecursion::Reject);
        assert_eq!(config.application_limits.threads, 4);
        assert_eq!(config.application_limits.events, 0x20);
        assert!(config.round_robin);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(KernelConfig::from_toml_str("slice_length = 0"), Err(ConfigError::ZeroSliceLength)));
        assert!(matches!(KernelConfig::from_toml_str("handle_table_size = 40000"), Err(ConfigError::HandleTableSize(40000))));
        assert!(matches!(KernelConfig::from_toml_str("[memory]\nbase = 100"), Err(ConfigError::RegionSize { region: "base", .. })));
        assert!(matches!(KernelConfig::from_toml_str("round_robin = 3"), Err(ConfigError::Parse(_))));
    }
}
