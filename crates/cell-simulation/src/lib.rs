//! # Cell Simulation Engine
//!
//! GPU-resident cell simulation: device bootstrap, double-buffered attribute
//! state, and the per-step upload / compute / readback protocol around a
//! user-supplied compute kernel.

pub mod buffer;
pub mod compiler;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod params;
pub mod pipeline;
pub mod simulation;
pub mod state;
pub mod timing;

pub use buffer::{GpuBuffer, Residency};
pub use compiler::{NagaCompiler, ProgramBinary, ShaderCompiler};
pub use context::{DiagnosticFilter, Disposition, GpuContext, Severity};
pub use device::{select_adapter, CommandStream, GpuDevice};
pub use engine::{plan_step, workgroup_count, StepCommand, StepEngine, StepInputs, StepPhase, StepReport};
pub use error::{CallSite, Result, SimError};
pub use hooks::{FrameCapture, GraphicsDebuggerCapture, NoCapture, NoWaitHooks, WaitHooks};
pub use params::*;
pub use pipeline::{BindingLayout, BindingSet, ComputePipeline, PushConstantRange, StorageBinding};
pub use simulation::*;
pub use state::{attribute_range, PingPong, StateSet, StateStore};
pub use timing::{TimestampCalibration, TimestampQueries};
