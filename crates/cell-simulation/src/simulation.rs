//! GPU-based cell simulation manager

use std::path::Path;

use cell_model::{HostState, VizOptions};

use crate::compiler::{NagaCompiler, ProgramBinary, ShaderCompiler};
use crate::context::GpuContext;
use crate::device::GpuDevice;
use crate::engine::{StepEngine, StepReport};
use crate::error::{Result, SimError};
use crate::hooks::{FrameCapture, GraphicsDebuggerCapture, NoCapture, NoWaitHooks, WaitHooks};
use crate::params::SimulationConfig;
use crate::pipeline::{BindingLayout, ComputePipeline};
use crate::state::StateStore;

/// Forward-Euler advection kernel used when no kernel is supplied
pub const DEFAULT_KERNEL: &str = include_str!("shaders/advect.wgsl");

/// Copies every attribute through unchanged
pub const IDENTITY_KERNEL: &str = include_str!("shaders/identity.wgsl");

/// Owns the whole GPU stack and the host mirror.
///
/// Fields are torn down in reverse order of creation when dropped: engine,
/// state buffers, pipeline, device, then context.
pub struct Simulator {
    config: SimulationConfig,
    host: HostState,
    engine: StepEngine,
    pipeline: ComputePipeline,
    state: StateStore,
    capture: Box<dyn FrameCapture>,
    hooks: Box<dyn WaitHooks>,
    device: GpuDevice,
    context: GpuContext,
    step_index: u64,
    last_step_time: f64,
    capture_next: bool,
    failure: Option<&'static str>,
}

impl Simulator {
    /// Build a simulator around a compiled kernel, seeded with the default scene.
    pub fn new(config: SimulationConfig, program: &ProgramBinary) -> Result<Self> {
        log::info!("Initializing Simulator (capacity {})...", config.capacity);

        let context = GpuContext::create(config.diagnostics)?;
        let device = GpuDevice::create(&context)?;

        log::info!("Loading compute program {}...", program.name);
        let pipeline = ComputePipeline::build(&device, program, &BindingLayout::state_in_out())?;
        let state = StateStore::allocate(&device, config.capacity)?;
        let engine = StepEngine::new(&device, config.readback)?;
        let host = HostState::seeded(config.capacity)?;

        let capture: Box<dyn FrameCapture> = if config.capture {
            Box::new(GraphicsDebuggerCapture::detect(&device))
        } else {
            Box::new(NoCapture)
        };

        log::info!(
            "Simulator ready: {} cells, GPU timing {}",
            host.cell_count(),
            if engine.has_gpu_timestamps() { "on" } else { "off" }
        );

        Ok(Self {
            capture_next: config.capture,
            config,
            host,
            engine,
            pipeline,
            state,
            capture,
            hooks: Box::new(NoWaitHooks),
            device,
            context,
            step_index: 0,
            last_step_time: 0.0,
            failure: None,
        })
    }

    /// Compile `source` with `compiler` and build a simulator around it.
    pub fn with_kernel(
        config: SimulationConfig,
        compiler: &dyn ShaderCompiler,
        source: &str,
        name: &str,
    ) -> Result<Self> {
        let program = compiler.compile(source, name)?;
        Self::new(config, &program)
    }

    /// Simulator running the built-in advection kernel.
    pub fn with_default_kernel(config: SimulationConfig) -> Result<Self> {
        Self::with_kernel(config, &NagaCompiler, DEFAULT_KERNEL, "advect")
    }

    pub fn set_wait_hooks(&mut self, hooks: Box<dyn WaitHooks>) {
        self.hooks = hooks;
    }

    pub fn set_frame_capture(&mut self, capture: Box<dyn FrameCapture>) {
        self.capture = capture;
    }

    /// Capture the next step if a debugger is attached.
    pub fn capture_next_step(&mut self) {
        self.capture_next = true;
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn host_state(&self) -> &HostState {
        &self.host
    }

    /// Mutable host state; the next step uploads it.
    pub fn host_state_mut(&mut self) -> &mut HostState {
        self.engine.mark_upload_pending();
        &mut self.host
    }

    /// Replace the host state with a saved step file.
    pub fn load_step_file(&mut self, path: &Path) -> Result<()> {
        let restored = HostState::read_step_file(path)?;
        self.host_state_mut().replace_with(&restored)?;
        log::info!(
            "Restored {} cells from {}",
            restored.cell_count(),
            path.display()
        );
        Ok(())
    }

    /// Advance one timestep.
    ///
    /// A failed step poisons the simulator: later calls return
    /// [`SimError::Poisoned`] carrying the first failure's code.
    pub fn step(&mut self) -> Result<StepReport> {
        if let Some(code) = self.failure {
            return Err(SimError::Poisoned { code });
        }

        let capturing = self.capture_next && self.capture.is_supported();
        self.capture_next = false;
        if capturing {
            self.capture.begin(&self.device);
        }

        let result = self.engine.step(
            &mut self.device,
            &self.state,
            &self.pipeline,
            &mut self.host,
            self.hooks.as_mut(),
            self.config.delta_time,
        );

        if capturing {
            self.capture.end(&self.device);
        }

        match result {
            Ok(report) => {
                self.step_index += 1;
                self.last_step_time = report.elapsed_seconds;
                Ok(report)
            }
            Err(err) => {
                log::error!("Step {} failed: {err}", self.step_index);
                self.failure = Some(err.code());
                Err(err)
            }
        }
    }

    /// Every slot of the device state the next step reads, including slots
    /// past the live range. Host edits not yet uploaded are not included.
    pub fn download_device_state(&mut self) -> Result<HostState> {
        if let Some(code) = self.failure {
            return Err(SimError::Poisoned { code });
        }
        self.engine.download_input(&mut self.device, &self.state)
    }

    /// Number of successful steps so far
    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    /// Duration of the last step in seconds
    pub fn last_step_time(&self) -> f64 {
        self.last_step_time
    }

    pub fn is_poisoned(&self) -> bool {
        self.failure.is_some()
    }

    pub fn write_viz_file(&self, path: &Path, options: VizOptions) -> Result<()> {
        Ok(cell_model::write_viz_file(&self.host, path, options)?)
    }

    pub fn write_step_file(&self, path: &Path) -> Result<()> {
        Ok(cell_model::write_step_file(&self.host, path)?)
    }

    pub fn device_info(&self) -> &wgpu::AdapterInfo {
        self.device.info()
    }

    pub fn has_gpu_timestamps(&self) -> bool {
        self.engine.has_gpu_timestamps()
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.engine.destroy();
        self.state.release();
        self.pipeline.destroy();
        self.device.destroy();
        self.context.destroy();
        log::debug!("Simulator shut down after {} steps", self.step_index);
    }
}
