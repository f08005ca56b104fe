//! An [`ExecutionEngine`] that runs step lists instead of ARM code.
//!
//! Each program is placed at an entrypoint and every step occupies four bytes of address space,
//! so threads can be created with ordinary entrypoints and the program counter stays meaningful.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use kumquat_kernel::memory::Memory;
use kumquat_kernel::CpuContext;

use crate::{EngineExit, ExecutionEngine};

const STEP_SIZE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Burns cycles without side effects.
    Compute { cycles: u64 },
    Set { reg: u8, value: u32 },
    Move { dst: u8, src: u8 },
    Svc { number: u32 },
    Store { address: u32, value: u32 },
    StoreReg { address: u32, reg: u8 },
    /// Writes `text` followed by a NUL.
    WriteString { address: u32, text: String },
    /// Appends r0-r3 to the trace under `label`.
    Record { label: String },
    /// Continues at step index `to` of the same program.
    Jump { to: u32 },
    Halt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub label: String,
    /// TLS address of the thread that recorded the entry.
    pub tls: u32,
    pub regs: [u32; 4],
}

pub struct ScriptedEngine {
    programs: BTreeMap<u32, Rc<Vec<Step>>>,
    context: CpuContext,
    tls: u32,
    trace: Vec<TraceEntry>,
    reschedule_requested: bool,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        ScriptedEngine::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> ScriptedEngine {
        ScriptedEngine {
            programs: BTreeMap::new(),
            context: CpuContext::zero(),
            tls: 0,
            trace: vec![],
            reschedule_requested: false,
        }
    }

    /// Places `steps` at `entrypoint`, replacing any program already there.
    pub fn load_program(&mut self, entrypoint: u32, steps: Vec<Step>) {
        debug!("loaded {} steps at {:#010X}", steps.len(), entrypoint);
        self.programs.insert(entrypoint, Rc::new(steps));
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn take_trace(&mut self) -> Vec<TraceEntry> {
        std::mem::take(&mut self.trace)
    }

    /// Labels of every recorded entry, oldest first.
    pub fn labels(&self) -> Vec<&str> {
        self.trace.iter().map(|entry| entry.label.as_str()).collect()
    }

    fn program_at(&self, pc: u32) -> Option<(u32, Rc<Vec<Step>>)> {
        self.programs.range(..=pc).next_back()
            .map(|(entry, program)| (*entry, program.clone()))
    }

    fn reg(&self, reg: u8) -> Option<u32> {
        self.context.r.get(reg as usize).copied()
    }

    fn set_reg(&mut self, reg: u8, value: u32) -> bool {
        match self.context.r.get_mut(reg as usize) {
            Some(slot) => {
                *slot = value;
                true
            },
            None => false,
        }
    }
}

impl ExecutionEngine for ScriptedEngine {
    fn load_context(&mut self, context: &CpuContext, tls: u32) {
        self.context = context.clone();
        self.tls = tls;
    }

    fn save_context(&self, context: &mut CpuContext) {
        *context = self.context.clone();
    }

    fn run(&mut self, memory: &dyn Memory, budget: u64) -> EngineExit {
        let mut cycles = 0;

        loop {
            if cycles >= budget || self.reschedule_requested {
                self.reschedule_requested = false;
                return EngineExit::BudgetExhausted { cycles }
            }

            let pc = self.context.pc();
            let (entry, program) = match self.program_at(pc) {
                Some(found) => found,
                None => return EngineExit::Fault { address: pc, cycles },
            };

            let offset = pc - entry;
            if offset % STEP_SIZE != 0 {
                return EngineExit::Fault { address: pc, cycles }
            }
            let index = (offset / STEP_SIZE) as usize;
            let step = match program.get(index) {
                Some(step) => step,
                None if index == program.len() => return EngineExit::Halted { cycles },
                None => return EngineExit::Fault { address: pc, cycles },
            };

            trace!("{:#010X}: {:?}", pc, step);
            self.context.r[15] = pc + STEP_SIZE;
            cycles += 1;

            match step {
                Step::Compute { cycles: amount } => cycles += amount.saturating_sub(1),
                Step::Set { reg, value } => {
                    if !self.set_reg(*reg, *value) {
                        return EngineExit::Fault { address: pc, cycles }
                    }
                },
                Step::Move { dst, src } => {
                    let moved = self.reg(*src).map(|value| self.set_reg(*dst, value));
                    if moved != Some(true) {
                        return EngineExit::Fault { address: pc, cycles }
                    }
                },
                Step::Svc { number } => return EngineExit::Svc { number: *number, cycles },
                Step::Store { address, value } => {
                    if memory.write_u32(*address, *value).is_err() {
                        return EngineExit::Fault { address: *address, cycles }
                    }
                },
                Step::StoreReg { address, reg } => {
                    let value = match self.reg(*reg) {
                        Some(value) => value,
                        None => return EngineExit::Fault { address: pc, cycles },
                    };
                    if memory.write_u32(*address, value).is_err() {
                        return EngineExit::Fault { address: *address, cycles }
                    }
                },
                Step::WriteString { address, text } => {
                    let mut bytes = text.as_bytes().to_vec();
                    bytes.push(0);
                    if memory.write(*address, &bytes).is_err() {
                        return EngineExit::Fault { address: *address, cycles }
                    }
                },
                Step::Record { label } => {
                    let r = &self.context.r;
                    self.trace.push(TraceEntry {
                        label: label.clone(),
                        tls: self.tls,
                        regs: [r[0], r[1], r[2], r[3]],
                    });
                },
                Step::Jump { to } => self.context.r[15] = entry + to * STEP_SIZE,
                Step::Halt => {
                    self.context.r[15] = pc;
                    return EngineExit::Halted { cycles }
                },
            }
        }
    }

    fn prepare_reschedule(&mut self) {
        self.reschedule_requested = true;
    }
}
