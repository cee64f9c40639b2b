//! Push constants and simulator configuration

use bytemuck::{Pod, Zeroable};
use cell_model::{DEFAULT_CAPACITY, DEFAULT_DELTA_TIME};

/// Per-dispatch constants pushed to the kernel (matches `StepConstants` in WGSL)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct StepConstants {
    pub cell_count: u32,
    pub delta_time: f32,
}

pub const STEP_CONSTANTS_SIZE: u32 = std::mem::size_of::<StepConstants>() as u32;

/// Construction-time settings for a [`crate::Simulator`]
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    /// Cell slots allocated on host and device; fixed for the simulator's lifetime
    pub capacity: u32,
    /// Seconds per step, pushed to the kernel
    pub delta_time: f32,
    /// Request validation layers and route driver messages through `log`
    pub diagnostics: bool,
    /// Copy the output set back into the host mirror after every step
    pub readback: bool,
    /// Bracket the first step with a graphics debugger capture if one is attached
    pub capture: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            delta_time: DEFAULT_DELTA_TIME,
            diagnostics: false,
            readback: true,
            capture: false,
        }
    }
}
