mod scenario;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use kumquat_guest::scripted::ScriptedEngine;
use kumquat_guest::{ResultStatus, System};
use kumquat_kernel::process::{memory_operation, HEAP_VADDR};
use kumquat_kernel::timing::cycles_to_ns;
use kumquat_kernel::{KernelConfig, MemoryPermission};

use crate::scenario::Scenario;

/// Runs a scripted guest scenario against the emulated kernel and its host services.
#[derive(Parser, Debug)]
#[command(name = "kumquat", version)]
struct Args {
    /// Kernel configuration (TOML). Defaults apply to anything left out.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frames to run before stopping, unless the application exits first
    #[arg(short, long, default_value_t = 60)]
    frames: u64,

    /// Filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    scenario: PathBuf,
}

fn load_config(path: Option<&Path>) -> Result<KernelConfig> {
    let path = match path {
        Some(path) => path,
        None => return Ok(KernelConfig::default()),
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    KernelConfig::from_toml_str(&text)
        .with_context(|| format!("invalid kernel configuration in {}", path.display()))
}

fn load_scenario(path: &Path) -> Result<Scenario> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    Scenario::from_toml_str(&text)
        .with_context(|| format!("invalid scenario {}", path.display()))
}

fn boot(config: KernelConfig, scenario: &Scenario) -> Result<System<ScriptedEngine>> {
    let mut engine = ScriptedEngine::new();
    for program in &scenario.programs {
        engine.load_program(program.entrypoint, program.steps.clone());
    }

    let mut system = System::new(config, &scenario.settings, engine)
        .context("could not boot the kernel")?;

    let application = &scenario.application;
    system.create_application(&application.name, application.entrypoint, application.priority)
        .with_context(|| format!("could not load {}", application.name))?;

    if application.heap_size != 0 {
        let pid = system.application().context("no application process")?;
        system.kernel_mut()
            .control_memory(pid, memory_operation::COMMIT, HEAP_VADDR, 0, application.heap_size, MemoryPermission::READ_WRITE)
            .context("could not commit the application heap")?;
    }

    Ok(system)
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .format_timestamp_millis()
        .init();

    let config = load_config(args.config.as_deref())?;
    let scenario = load_scenario(&args.scenario)?;
    let mut system = boot(config, &scenario)?;

    info!("running {} for up to {} frames", scenario.application.name, args.frames);

    let mut status = ResultStatus::Success;
    for _ in 0..args.frames {
        status = system.run_frame();
        if status != ResultStatus::Success {
            break
        }
    }

    let ticks = system.kernel().timing().ticks();
    let stats = system.stats();
    println!("status:          {:?}", status);
    println!("frames:          {}", stats.frames);
    println!("emulated cycles: {} ({} us)", ticks, cycles_to_ns(ticks) / 1000);
    println!("idle cycles:     {}", system.kernel().timing().idled_cycles());
    println!("context switches: {}", system.kernel().scheduler().switches());
    println!("syscalls:        {}", stats.svc_calls);
    println!("host time/frame: {} us", stats.average_frame_ns() / 1000);

    for entry in system.engine().trace() {
        println!("  [{:#010X}] {:<16} r0={:#010X} r1={:#010X} r2={:#010X} r3={:#010X}",
            entry.tls, entry.label, entry.regs[0], entry.regs[1], entry.regs[2], entry.regs[3]);
    }

    match status {
        ResultStatus::Success | ResultStatus::ShutdownRequested => Ok(()),
        ResultStatus::ErrorNotInitialized => bail!("no application was loaded"),
        ResultStatus::ErrorLoader => bail!("the application could not be loaded"),
        ResultStatus::FatalError => {
            warn!("stopped after a guest fault");
            bail!("the guest faulted")
        }
    }
}
