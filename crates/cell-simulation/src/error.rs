//! Simulator error taxonomy

use std::fmt;
use std::panic::Location;

use cell_model::ModelError;
use thiserror::Error;

use crate::buffer::Residency;

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    /// No adapter is reachable on any backend.
    #[error("no GPU driver is available")]
    DriverUnavailable,

    /// Adapters exist but none match the selection policy.
    #[error("no suitable GPU adapter found")]
    NoSuitableDevice,

    /// The selected adapter cannot run compute work.
    #[error("the selected adapter has no compute-capable queue")]
    NoComputeQueue,

    #[error("no memory type for {residency:?} buffer with usage {usage:?}")]
    NoCompatibleMemoryType {
        residency: Residency,
        usage: wgpu::BufferUsages,
    },

    /// A required device feature is not supported.
    #[error("required device feature {0} is not supported")]
    MissingFeature(&'static str),

    #[error("driver call failed with {code} at {location}: {detail}")]
    DriverCallFailed {
        code: &'static str,
        detail: String,
        location: CallSite,
    },

    #[error("failed to compile {name}:\n{log}")]
    CompileFailed { name: String, log: String },

    #[error("invalid binding layout: {0}")]
    InvalidBindingLayout(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// A previous step failed; the simulator refuses further work.
    #[error("simulator is unusable after a failed step ({code})")]
    Poisoned { code: &'static str },
}

impl SimError {
    /// Driver failure attributed to the caller's source location.
    #[track_caller]
    pub fn driver(code: &'static str, detail: impl Into<String>) -> Self {
        Self::DriverCallFailed {
            code,
            detail: detail.into(),
            location: CallSite::from(Location::caller()),
        }
    }

    /// Map an error popped from a wgpu error scope.
    pub fn from_wgpu_at(err: wgpu::Error, location: &'static Location<'static>) -> Self {
        Self::DriverCallFailed {
            code: wgpu_error_code(&err),
            detail: err.to_string(),
            location: CallSite::from(location),
        }
    }

    /// Short machine-readable name of the failure.
    pub fn code(&self) -> &'static str {
        match self {
            SimError::DriverUnavailable => "DRIVER_UNAVAILABLE",
            SimError::NoSuitableDevice => "NO_SUITABLE_DEVICE",
            SimError::NoComputeQueue => "NO_COMPUTE_QUEUE",
            SimError::NoCompatibleMemoryType { .. } => "NO_COMPATIBLE_MEMORY_TYPE",
            SimError::MissingFeature(_) => "MISSING_FEATURE",
            SimError::DriverCallFailed { code, .. } => *code,
            SimError::CompileFailed { .. } => "COMPILE_FAILED",
            SimError::InvalidBindingLayout(_) => "INVALID_BINDING_LAYOUT",
            SimError::Model(ModelError::CapacityExceeded { .. }) => "CAPACITY_EXCEEDED",
            SimError::Model(ModelError::IoFailure { .. }) => "IO_FAILURE",
            SimError::Model(ModelError::MalformedSnapshot(_)) => "MALFORMED_SNAPSHOT",
            SimError::Poisoned { code } => *code,
        }
    }
}

/// Code reported for an error raised by wgpu.
pub fn wgpu_error_code(err: &wgpu::Error) -> &'static str {
    match err {
        wgpu::Error::OutOfMemory { .. } => "OUT_OF_DEVICE_MEMORY",
        wgpu::Error::Validation { .. } => "VALIDATION_FAILED",
        _ => "INTERNAL",
    }
}

/// Source location of a failing driver call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl From<&'static Location<'static>> for CallSite {
    fn from(location: &'static Location<'static>) -> Self {
        Self {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
