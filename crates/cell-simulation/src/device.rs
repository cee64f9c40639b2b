//! Logical device, queue and command stream

use std::panic::Location;
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::{DiagnosticFilter, GpuContext, Severity};
use crate::error::{wgpu_error_code, Result, SimError};
use crate::params::STEP_CONSTANTS_SIZE;
use crate::timing::TimestampCalibration;

/// Pick an adapter: the first discrete GPU, otherwise the last integrated or
/// virtual one.
pub fn select_adapter(types: &[wgpu::DeviceType]) -> Option<usize> {
    types
        .iter()
        .position(|ty| *ty == wgpu::DeviceType::DiscreteGpu)
        .or_else(|| {
            types.iter().rposition(|ty| {
                matches!(
                    ty,
                    wgpu::DeviceType::IntegratedGpu | wgpu::DeviceType::VirtualGpu
                )
            })
        })
}

/// The single command stream of a device.
///
/// wgpu encoders are single-use, so resetting the stream means starting a new
/// encoder; the previous one is consumed by `finish`.
#[derive(Debug, Default)]
pub struct CommandStream {
    recorded: u64,
    alive: bool,
}

impl CommandStream {
    fn new() -> Self {
        Self {
            recorded: 0,
            alive: true,
        }
    }

    #[track_caller]
    pub fn begin(&mut self, device: &wgpu::Device) -> Result<wgpu::CommandEncoder> {
        if !self.alive {
            return Err(SimError::driver(
                "INVALID_HANDLE",
                "command stream was released",
            ));
        }
        self.recorded += 1;
        Ok(device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Step Encoder"),
        }))
    }

    /// Mark the stream dead and return how many command buffers it began.
    fn release(&mut self) -> u64 {
        self.alive = false;
        self.recorded
    }
}

/// First driver error raised outside an error scope, kept until a step
/// checks for it. Shared with the callbacks installed on the device.
#[derive(Debug, Clone, Default)]
struct UncapturedErrors {
    first: Arc<Mutex<Option<(&'static str, String)>>>,
}

impl UncapturedErrors {
    fn record(&self, code: &'static str, detail: String) {
        log::error!("GPU uncaptured error ({code}): {detail}");
        let mut first = self.first.lock().unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            *first = Some((code, detail));
        }
    }

    fn take(&self) -> Option<(&'static str, String)> {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A logical device with its one queue.
pub struct GpuDevice {
    info: wgpu::AdapterInfo,
    device: Option<wgpu::Device>,
    queue: Option<wgpu::Queue>,
    features: wgpu::Features,
    commands: CommandStream,
    timestamps: Option<TimestampCalibration>,
    diagnostics: Option<DiagnosticFilter>,
    uncaptured: UncapturedErrors,
}

impl GpuDevice {
    /// Select an adapter from `context` and open a device on it.
    pub fn create(context: &GpuContext) -> Result<Self> {
        let adapters = context.adapters();
        let types: Vec<_> = adapters.iter().map(|a| a.get_info().device_type).collect();
        let index = select_adapter(&types).ok_or(SimError::NoSuitableDevice)?;
        let adapter = &adapters[index];
        let info = adapter.get_info();

        if !adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(SimError::NoComputeQueue);
        }

        let supported = adapter.features();
        if !supported.contains(wgpu::Features::PUSH_CONSTANTS) {
            return Err(SimError::MissingFeature("PUSH_CONSTANTS"));
        }

        let timestamp_features =
            wgpu::Features::TIMESTAMP_QUERY | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS;
        let mut required_features = wgpu::Features::PUSH_CONSTANTS;
        if supported.contains(timestamp_features) {
            required_features |= timestamp_features;
        } else {
            log::warn!("Timestamp queries unavailable, step timing falls back to the host clock");
        }
        if supported.contains(wgpu::Features::MAPPABLE_PRIMARY_BUFFERS)
            && info.device_type == wgpu::DeviceType::IntegratedGpu
        {
            required_features |= wgpu::Features::MAPPABLE_PRIMARY_BUFFERS;
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Cell Simulation Device"),
            required_features,
            required_limits: wgpu::Limits {
                max_push_constant_size: STEP_CONSTANTS_SIZE,
                ..wgpu::Limits::default()
            }
            .using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::Performance,
            experimental_features: wgpu::ExperimentalFeatures::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| SimError::driver("INITIALIZATION_FAILED", e.to_string()))?;

        let uncaptured = UncapturedErrors::default();
        let sink = uncaptured.clone();
        device.on_uncaptured_error(Arc::new(move |err: wgpu::Error| {
            sink.record(wgpu_error_code(&err), err.to_string());
        }));
        let sink = uncaptured.clone();
        device.set_device_lost_callback(move |reason, message| {
            if reason != wgpu::DeviceLostReason::Destroyed {
                sink.record("DEVICE_LOST", message);
            }
        });

        let timestamps = required_features
            .contains(timestamp_features)
            .then(|| TimestampCalibration::new(queue.get_timestamp_period()));

        log::info!("✓ Using GPU: {} ({:?})", info.name, info.backend);

        Ok(Self {
            info,
            features: device.features(),
            device: Some(device),
            queue: Some(queue),
            commands: CommandStream::new(),
            timestamps,
            diagnostics: context.diagnostics().copied(),
            uncaptured,
        })
    }

    pub fn info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    pub fn features(&self) -> wgpu::Features {
        self.features
    }

    pub fn timestamps(&self) -> Option<TimestampCalibration> {
        self.timestamps
    }

    #[track_caller]
    pub fn device(&self) -> Result<&wgpu::Device> {
        self.device
            .as_ref()
            .ok_or_else(|| SimError::driver("DEVICE_LOST", "device was destroyed"))
    }

    #[track_caller]
    pub fn queue(&self) -> Result<&wgpu::Queue> {
        self.queue
            .as_ref()
            .ok_or_else(|| SimError::driver("DEVICE_LOST", "device was destroyed"))
    }

    /// Device and command stream together, for recording a step.
    #[track_caller]
    pub fn recorder(&mut self) -> Result<(&wgpu::Device, &mut CommandStream)> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| SimError::driver("DEVICE_LOST", "device was destroyed"))?;
        Ok((device, &mut self.commands))
    }

    /// Run `f` inside validation and out-of-memory error scopes and turn any
    /// captured error into a [`SimError`] located at the caller.
    #[track_caller]
    pub fn checked<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        let location = Location::caller();
        let device = self.device()?;

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(device);
        let validation = pollster::block_on(device.pop_error_scope());
        let out_of_memory = pollster::block_on(device.pop_error_scope());

        match validation.or(out_of_memory) {
            None => Ok(value),
            Some(err) => {
                self.report(&err.to_string());
                Err(SimError::from_wgpu_at(err, location))
            }
        }
    }

    /// Fail with the first driver error raised outside an error scope since
    /// the last check, such as a failed map or a lost device.
    #[track_caller]
    pub fn check_uncaptured(&self) -> Result<()> {
        match self.uncaptured.take() {
            None => Ok(()),
            Some((code, detail)) => {
                self.report(&detail);
                Err(SimError::driver(code, detail))
            }
        }
    }

    fn report(&self, message: &str) {
        if let Some(filter) = &self.diagnostics {
            filter.route(Severity::Error, message);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.device.is_some()
    }

    /// Release the command stream, then the queue and device.
    pub fn destroy(&mut self) {
        let recorded = self.commands.release();
        self.queue = None;
        if let Some(device) = self.device.take() {
            device.destroy();
            log::debug!(
                "Device {} destroyed after {recorded} command buffers",
                self.info.name
            );
        }
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpu::DeviceType as T;

    #[test]
    fn discrete_gpu_wins() {
        assert_eq!(
            select_adapter(&[T::IntegratedGpu, T::DiscreteGpu, T::DiscreteGpu]),
            Some(1)
        );
    }

    #[test]
    fn last_integrated_or_virtual_is_fallback() {
        assert_eq!(
            select_adapter(&[T::IntegratedGpu, T::Cpu, T::VirtualGpu, T::Other]),
            Some(2)
        );
        assert_eq!(select_adapter(&[T::IntegratedGpu, T::Cpu]), Some(0));
    }

    #[test]
    fn software_only_is_unsuitable() {
        assert_eq!(select_adapter(&[T::Cpu, T::Other]), None);
        assert_eq!(select_adapter(&[]), None);
    }

    #[test]
    fn released_stream_is_marked_dead() {
        let mut stream = CommandStream::default();
        assert_eq!(stream.release(), 0);
        assert!(!stream.alive);
    }

    #[test]
    fn uncaptured_errors_keep_the_first_until_taken() {
        let errors = UncapturedErrors::default();
        assert_eq!(errors.take(), None);

        let handler = errors.clone();
        handler.record("VALIDATION_FAILED", "map of a destroyed buffer".into());
        handler.record("DEVICE_LOST", "driver reset".into());

        assert_eq!(
            errors.take(),
            Some(("VALIDATION_FAILED", "map of a destroyed buffer".to_owned()))
        );
        assert_eq!(errors.take(), None);
    }

    #[test]
    fn uncaptured_errors_are_shared_across_threads() {
        let errors = UncapturedErrors::default();
        let handler = errors.clone();
        std::thread::spawn(move || handler.record("OUT_OF_DEVICE_MEMORY", "Out of Memory".into()))
            .join()
            .unwrap();
        assert_eq!(errors.take().map(|(code, _)| code), Some("OUT_OF_DEVICE_MEMORY"));
    }
}
