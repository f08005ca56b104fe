//! Scenario files: what the frontend boots when it has no real application to load.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use kumquat_guest::scripted::Step;
use kumquat_kernel::memory::PAGE_SIZE;
use kumquat_kernel::process::{HEAP_VADDR, HEAP_VADDR_END};
use kumquat_hle::SystemSettings;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to parse scenario")]
    Parse(#[from] toml::de::Error),
    #[error("no program is placed at the application entrypoint {0:#010X}")]
    MissingEntrypoint(u32),
    #[error("two programs are placed at {0:#010X}")]
    DuplicateProgram(u32),
    #[error("heap size {0:#X} is not a multiple of the page size or does not fit the heap region")]
    HeapSize(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Application {
    pub name: String,
    pub entrypoint: u32,
    pub priority: u32,
    /// Bytes committed at the start of the heap region before the main thread starts.
    pub heap_size: u32,
}

impl Default for Application {
    fn default() -> Self {
        Application {
            name: String::from("scenario"),
            entrypoint: 0x00100000,
            priority: 0x30,
            heap_size: PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub entrypoint: u32,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub settings: SystemSettings,
    pub application: Application,
    pub programs: Vec<Program>,
}

impl Scenario {
    pub fn from_toml_str(text: &str) -> Result<Scenario, ScenarioError> {
        let scenario: Scenario = toml::from_str(text)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        let mut entrypoints: Vec<u32> = self.programs.iter().map(|program| program.entrypoint).collect();
        entrypoints.sort_unstable();
        if let Some(pair) = entrypoints.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ScenarioError::DuplicateProgram(pair[0]))
        }

        if !entrypoints.contains(&self.application.entrypoint) {
            return Err(ScenarioError::MissingEntrypoint(self.application.entrypoint))
        }

        let heap_size = self.application.heap_size;
        if heap_size % PAGE_SIZE != 0 || heap_size > HEAP_VADDR_END - HEAP_VADDR {
            return Err(ScenarioError::HeapSize(heap_size))
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_scenario() {
        let scenario = Scenario::from_toml_str(r#"
            [[programs]]
            entrypoint = 0x00100000
            steps = [
                { op = "record", label = "hello" },
                { op = "halt" },
            ]
        "#).unwrap();

        assert_eq!(scenario.application, Application::default());
        assert_eq!(scenario.settings, SystemSettings::default());
        assert_eq!(scenario.programs[0].steps.len(), 2);
    }

    #[test]
    fn rejects_missing_entrypoint() {
        let err = Scenario::from_toml_str(r#"
            [application]
            entrypoint = 0x00300000

            [[programs]]
            entrypoint = 0x00100000
            steps = []
        "#).unwrap_err();
        assert!(matches!(err, ScenarioError::MissingEntrypoint(0x00300000)));
    }

    #[test]
    fn rejects_duplicate_programs() {
        let err = Scenario::from_toml_str(r#"
            [[programs]]
            entrypoint = 0x00100000
            steps = []

            [[programs]]
            entrypoint = 0x00100000
            steps = []
        "#).unwrap_err();
        assert!(matches!(err, ScenarioError::DuplicateProgram(0x00100000)));
    }

    #[test]
    fn rejects_unaligned_heaps() {
        let err = Scenario::from_toml_str(r#"
            [application]
            heap_size = 0x1800

            [[programs]]
            entrypoint = 0x00100000
            steps = []
        "#).unwrap_err();
        assert!(matches!(err, ScenarioError::HeapSize(0x1800)));
    }

    #[test]
    fn demo_scenario_is_valid() {
        Scenario::from_toml_str(include_str!("../scenarios/demo.toml")).unwrap();
    }
}
