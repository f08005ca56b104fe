use std::fmt;
use std::fmt::Debug;

use kumquat_kernel::memory::Memory;
use kumquat_kernel::CpuContext;

/// A register value, read as whichever signedness the syscall expects.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct RegValue(u32);

impl RegValue {
    pub fn u32(self) -> u32 {
        self.0
    }

    pub fn i32(self) -> i32 {
        self.0 as i32
    }
}

impl From<RegValue> for u32 {
    fn from(value: RegValue) -> u32 {
        value.0
    }
}

impl From<u32> for RegValue {
    fn from(value: u32) -> RegValue {
        RegValue(value)
    }
}

impl From<RegValue> for i32 {
    fn from(value: RegValue) -> i32 {
        value.0 as i32
    }
}

impl From<i32> for RegValue {
    fn from(value: i32) -> RegValue {
        RegValue(value as u32)
    }
}

impl Debug for RegValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

pub trait Regs {
    fn r(&self, reg: u8) -> RegValue;
    fn sr(&mut self, reg: u8, value: RegValue);
    fn set_cpsr(&mut self, value: u32);
}

impl Regs for CpuContext {
    fn r(&self, reg: u8) -> RegValue {
        self.r[reg as usize].into()
    }

    fn sr(&mut self, reg: u8, value: RegValue) {
        self.r[reg as usize] = value.u32();
    }

    fn set_cpsr(&mut self, value: u32) {
        self.cpsr = value;
    }
}

/// Why the engine handed control back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineExit {
    /// The guest executed `svc number`. The program counter is already past the instruction.
    Svc { number: u32, cycles: u64 },
    BudgetExhausted { cycles: u64 },
    /// The thread has nothing left to execute.
    Halted { cycles: u64 },
    Fault { address: u32, cycles: u64 },
}

impl EngineExit {
    /// Cycles executed before the exit.
    pub fn cycles(&self) -> u64 {
        match *self {
            EngineExit::Svc { cycles, .. } |
            EngineExit::BudgetExhausted { cycles } |
            EngineExit::Halted { cycles } |
            EngineExit::Fault { cycles, .. } => cycles,
        }
    }
}

/// The CPU. Runs one thread at a time against the memory of that thread's process.
pub trait ExecutionEngine {
    fn load_context(&mut self, context: &CpuContext, tls: u32);
    fn save_context(&self, context: &mut CpuContext);

    /// Executes until a syscall, a halt, a fault, or until `budget` cycles have run. An engine
    /// may overshoot the budget by the length of its last block.
    fn run(&mut self, memory: &dyn Memory, budget: u64) -> EngineExit;

    /// Asks the engine to return as soon as possible.
    fn prepare_reschedule(&mut self);
}

pub enum SvcResult {
    Continue,
    Reschedule
}
