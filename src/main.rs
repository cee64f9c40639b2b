//! GPU Cell Simulation
//!
//! Runs the cell simulator for a number of steps and writes viz and step
//! snapshots into an output directory.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use cell_model::{step_file_name, VizOptions, DEFAULT_CAPACITY, DEFAULT_DELTA_TIME, STEP_EXTENSION, VIZ_EXTENSION};
use cell_simulation::{NagaCompiler, SimulationConfig, Simulator, WaitHooks};
use clap::Parser;

/// GPU cell simulator
#[derive(Parser)]
#[command(name = "cellsim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of steps to run
    #[arg(short = 'n', long, default_value_t = 100)]
    steps: u64,

    /// Directory for snapshot files
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Cell slots allocated on host and GPU
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: u32,

    /// Seconds per step
    #[arg(long, default_value_t = DEFAULT_DELTA_TIME)]
    delta_time: f32,

    /// Write snapshots every N steps (0 disables export)
    #[arg(long, default_value_t = 1)]
    export_every: u64,

    /// Write uncompressed viz snapshots
    #[arg(long)]
    no_compress: bool,

    /// Enable validation layers and driver diagnostics
    #[arg(long)]
    diagnostics: bool,

    /// Capture the first step if a graphics debugger is attached
    #[arg(long)]
    capture: bool,

    /// WGSL compute kernel to run instead of the built-in advection
    #[arg(short, long)]
    kernel: Option<PathBuf>,

    /// Resume from a saved .cm5_step file
    #[arg(long)]
    resume: Option<PathBuf>,
}

/// Logs how long the host blocked on each step.
#[derive(Default)]
struct WaitTimer {
    started: Option<Instant>,
}

impl WaitHooks for WaitTimer {
    fn wait_begin(&mut self) {
        self.started = Some(Instant::now());
    }

    fn wait_end(&mut self) {
        if let Some(started) = self.started.take() {
            log::debug!("Waited {:.3} ms for the GPU", started.elapsed().as_secs_f64() * 1e3);
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = SimulationConfig {
        capacity: cli.capacity,
        delta_time: cli.delta_time,
        diagnostics: cli.diagnostics,
        capture: cli.capture,
        ..SimulationConfig::default()
    };

    let mut sim = match &cli.kernel {
        Some(path) => {
            let source = fs::read_to_string(path)?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "kernel".to_owned());
            Simulator::with_kernel(config, &NagaCompiler, &source, &name)?
        }
        None => Simulator::with_default_kernel(config)?,
    };
    sim.set_wait_hooks(Box::new(WaitTimer::default()));

    if let Some(path) = &cli.resume {
        sim.load_step_file(path)?;
    }

    fs::create_dir_all(&cli.output)?;
    let viz = VizOptions {
        compress: !cli.no_compress,
        ..VizOptions::default()
    };

    let started = Instant::now();
    let mut gpu_seconds = 0.0;
    for _ in 0..cli.steps {
        let report = sim.step()?;
        gpu_seconds += report.elapsed_seconds;

        let index = sim.step_index();
        if cli.export_every > 0 && index % cli.export_every == 0 {
            sim.write_viz_file(&cli.output.join(step_file_name(index, VIZ_EXTENSION)), viz)?;
            sim.write_step_file(&cli.output.join(step_file_name(index, STEP_EXTENSION)))?;
        }
        if index % 10 == 0 {
            log::info!(
                "Step {index}: {} cells, last step {:.3} ms",
                report.cell_count,
                sim.last_step_time() * 1e3
            );
        }
    }

    log::info!(
        "Ran {} steps in {:.2} s ({:.2} s measured per-step on {})",
        cli.steps,
        started.elapsed().as_secs_f64(),
        gpu_seconds,
        if sim.has_gpu_timestamps() { "GPU" } else { "host" }
    );
    Ok(())
}

fn main() -> ExitCode {
    // Initialize logger (RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    log::info!("Starting cell simulation...");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
