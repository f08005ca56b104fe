//! The run loop: picks a thread, hands it to the engine, services its syscalls and keeps
//! core timing moving.

use clocksource::Clocksource;
use log::{debug, error, info};

use kumquat_hle::kernel;
use kumquat_hle::{ServiceManager, SystemSettings};

use kernel::process::{memory_operation, HEAP_VADDR_END};
use kernel::timing::BASE_CLOCK_RATE_ARM11;
use kernel::{KResult, Kernel, KernelConfig, MemoryPermission, ProcessId, ProcessStatus, ThreadId, ThreadInitializer};

use crate::{handle_svc, resume_svc, EngineExit, ExecutionEngine, PendingCalls, SvcResult};

/// Emulated cycles in one 60Hz frame.
pub const CYCLES_PER_FRAME: u64 = BASE_CLOCK_RATE_ARM11 / 60;

pub const STACK_SIZE: u32 = 0x4000;
pub const STACK_TOP: u32 = HEAP_VADDR_END;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResultStatus {
    Success,
    ShutdownRequested,
    ErrorNotInitialized,
    ErrorLoader,
    FatalError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerfStats {
    pub frames: u64,
    pub slices: u64,
    pub svc_calls: u64,
    /// Host time spent in `run_frame`.
    pub host_ns: u64,
    pub last_frame_host_ns: u64,
}

impl PerfStats {
    pub fn average_frame_ns(&self) -> u64 {
        self.host_ns.checked_div(self.frames).unwrap_or(0)
    }
}

pub struct System<E: ExecutionEngine> {
    kernel: Kernel,
    engine: E,
    services: ServiceManager,
    application: Option<ProcessId>,
    /// Thread whose registers are currently in the engine.
    loaded: Option<ThreadId>,
    pending: PendingCalls,
    status: ResultStatus,
    clock: Clocksource,
    stats: PerfStats,
}

impl<E: ExecutionEngine> System<E> {
    /// Boots a kernel with `srv:` and the default services installed.
    pub fn new(config: KernelConfig, settings: &SystemSettings, engine: E) -> KResult<System<E>> {
        let mut kernel = Kernel::new(config);
        let mut services = ServiceManager::install(&mut kernel)?;
        services.install_default_services(&mut kernel, settings)?;
        kernel.advance_timing();

        Ok(System {
            kernel,
            engine,
            services,
            application: None,
            loaded: None,
            pending: PendingCalls::new(),
            status: ResultStatus::Success,
            clock: Clocksource::new(),
            stats: PerfStats::default(),
        })
    }

    /// Creates the application process with a committed stack and starts its main thread.
    pub fn create_application(&mut self, name: &str, entrypoint: u32, priority: u32) -> KResult<ThreadId> {
        let result = self.spawn_application(name, entrypoint, priority);
        if let Err(err) = &result {
            error!("could not load {}: {}", name, err);
            self.status = ResultStatus::ErrorLoader;
        }
        result
    }

    fn spawn_application(&mut self, name: &str, entrypoint: u32, priority: u32) -> KResult<ThreadId> {
        let pid = self.kernel.create_application_process(name);
        self.application = Some(pid);

        self.kernel.control_memory(pid, memory_operation::COMMIT, STACK_TOP - STACK_SIZE, 0, STACK_SIZE, MemoryPermission::READ_WRITE)?;

        let tid = self.kernel.create_thread(pid, ThreadInitializer {
            name: format!("{}-main", name),
            entrypoint,
            stack_top: STACK_TOP,
            arg: 0,
            priority,
            processor_id: 0,
        })?;
        self.kernel.start_thread(tid);
        // The thread holds itself alive until it exits
        self.kernel.release_object(tid);

        info!("started {} at {:#010X}", name, entrypoint);
        Ok(tid)
    }

    /// Runs until the current slice ends, the running thread blocks, or the system stops.
    pub fn run_slice(&mut self) -> ResultStatus {
        if self.status != ResultStatus::Success {
            return self.status
        }
        let application = match self.application {
            Some(application) => application,
            None => return ResultStatus::ErrorNotInitialized,
        };

        if self.kernel.process_external_requests() {
            info!("shutdown requested");
            self.status = ResultStatus::ShutdownRequested;
            return self.status
        }

        if self.kernel.timing().downcount() == 0 {
            self.kernel.advance_timing();
        }

        match self.kernel.reschedule() {
            Some(tid) => self.execute(tid),
            None => self.kernel.idle(),
        }

        if self.kernel.timing().downcount() == 0 {
            self.kernel.advance_timing();
        }
        self.stats.slices += 1;

        if self.status == ResultStatus::Success && self.kernel.process(application).status == ProcessStatus::Exited {
            info!("application exited");
            self.status = ResultStatus::ShutdownRequested;
        }
        self.status
    }

    fn execute(&mut self, tid: ThreadId) {
        let resume = self.kernel.take_resume(tid);
        if self.loaded != Some(tid) || resume.is_some() {
            if let Some(resume) = resume {
                let mut context = self.kernel.thread(tid).context.clone();
                resume_svc(&mut self.kernel, &mut self.pending, tid, resume, &mut context);
                self.kernel.thread_mut(tid).context = context;
            }
            let thread = self.kernel.thread(tid);
            self.engine.load_context(&thread.context, thread.tls_address);
            self.loaded = Some(tid);
        }

        let budget = self.kernel.timing().downcount();
        let owner = self.kernel.thread(tid).owner;
        let exit = self.engine.run(&self.kernel.process(owner).address_space, budget);

        self.kernel.timing_mut().add_ticks(exit.cycles());
        self.engine.save_context(&mut self.kernel.thread_mut(tid).context);

        match exit {
            EngineExit::Svc { number, .. } => {
                self.stats.svc_calls += 1;

                let mut context = self.kernel.thread(tid).context.clone();
                let result = handle_svc(&mut self.kernel, &mut self.pending, tid, number, &mut context);
                if self.kernel.try_thread(tid).is_some() {
                    self.kernel.thread_mut(tid).context = context;
                }
                // Results went to the kernel's copy, the engine picks them up on the next load
                self.loaded = None;

                if let SvcResult::Reschedule = result {
                    self.kernel.prepare_reschedule();
                }
            },
            EngineExit::BudgetExhausted { .. } => {
                if self.kernel.config().round_robin && self.kernel.timing().downcount() == 0 {
                    self.kernel.yield_current();
                }
            },
            EngineExit::Halted { .. } => {
                debug!("{:?} halted", tid);
                self.pending.forget(tid);
                self.loaded = None;
                self.kernel.exit_thread(tid);
            },
            EngineExit::Fault { address, .. } => {
                let pc = self.kernel.thread(tid).context.pc();
                error!("{:?} faulted accessing {:#010X} (pc {:#010X})", tid, address, pc);
                self.status = ResultStatus::FatalError;
            },
        }
    }

    /// Runs slices until a frame's worth of cycles has passed.
    pub fn run_frame(&mut self) -> ResultStatus {
        let start = self.clock.time();
        let target = self.kernel.timing().ticks() + CYCLES_PER_FRAME;

        let mut status = self.status;
        while self.kernel.timing().ticks() < target {
            status = self.run_slice();
            if status != ResultStatus::Success {
                break
            }
        }

        let elapsed = self.clock.time().saturating_sub(start);
        self.stats.frames += 1;
        self.stats.host_ns += elapsed;
        self.stats.last_frame_host_ns = elapsed;
        status
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn stats(&self) -> &PerfStats {
        &self.stats
    }

    pub fn application(&self) -> Option<ProcessId> {
        self.application
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ServiceManager {
        &mut self.services
    }
}
