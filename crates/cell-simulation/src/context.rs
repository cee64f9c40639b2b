//! GPU instance, adapter discovery and driver diagnostics

use crate::error::{Result, SimError};

/// Driver messages containing this are loader noise and never reported.
const BENIGN_LOADER_MESSAGE: &str = "loaderAddLayerProperties";

/// Owns the wgpu instance and the adapters it can reach.
#[derive(Default)]
pub struct GpuContext {
    instance: Option<wgpu::Instance>,
    adapters: Vec<wgpu::Adapter>,
    diagnostics: Option<DiagnosticFilter>,
}

impl GpuContext {
    /// Create the instance and enumerate adapters on every backend.
    ///
    /// With `enable_diagnostics` the instance requests validation and debug
    /// labels; if the platform has no validation layer this degrades silently.
    pub fn create(enable_diagnostics: bool) -> Result<Self> {
        let flags = if enable_diagnostics {
            wgpu::InstanceFlags::debugging().with_env()
        } else {
            wgpu::InstanceFlags::default().with_env()
        };

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::all());
        if adapters.is_empty() {
            return Err(SimError::DriverUnavailable);
        }

        let diagnostics = enable_diagnostics.then(DiagnosticFilter::default);
        for adapter in &adapters {
            let info = adapter.get_info();
            let message = format!(
                "Found adapter {} ({:?}, {:?})",
                info.name, info.device_type, info.backend
            );
            match &diagnostics {
                Some(filter) => {
                    filter.route(Severity::Verbose, &message);
                }
                None => log::debug!("{message}"),
            }
        }
        if let Some(filter) = &diagnostics {
            if !flags.contains(wgpu::InstanceFlags::VALIDATION) {
                filter.route(
                    Severity::Warning,
                    "validation disabled by environment, diagnostics limited to error scopes",
                );
            }
        }

        log::info!("GPU context created with {} adapter(s)", adapters.len());
        Ok(Self {
            instance: Some(instance),
            adapters,
            diagnostics,
        })
    }

    pub fn adapters(&self) -> &[wgpu::Adapter] {
        &self.adapters
    }

    pub fn diagnostics(&self) -> Option<&DiagnosticFilter> {
        self.diagnostics.as_ref()
    }

    pub fn is_alive(&self) -> bool {
        self.instance.is_some()
    }

    /// Drop diagnostics, adapters and instance, in that order.
    pub fn destroy(&mut self) {
        self.diagnostics = None;
        self.adapters.clear();
        if self.instance.take().is_some() {
            log::debug!("GPU context destroyed");
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Severity of a driver message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

/// What the filter decided to do with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Known loader noise
    Ignored,
    /// Below the reporting threshold
    Suppressed,
    Logged,
    /// An error from the driver means this crate misused the API.
    ContractViolation,
}

/// Routes driver messages to `log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticFilter {
    pub min_severity: Severity,
}

impl Default for DiagnosticFilter {
    fn default() -> Self {
        Self {
            min_severity: Severity::Warning,
        }
    }
}

impl DiagnosticFilter {
    pub fn classify(&self, severity: Severity, message: &str) -> Disposition {
        if severity == Severity::Warning && message.contains(BENIGN_LOADER_MESSAGE) {
            Disposition::Ignored
        } else if severity == Severity::Error {
            Disposition::ContractViolation
        } else if severity >= self.min_severity {
            Disposition::Logged
        } else {
            Disposition::Suppressed
        }
    }

    /// Report a message. Errors panic in debug builds.
    pub fn route(&self, severity: Severity, message: &str) -> Disposition {
        let disposition = self.classify(severity, message);
        match disposition {
            Disposition::Ignored | Disposition::Suppressed => {}
            Disposition::Logged => match severity {
                Severity::Warning => log::warn!("[driver] {message}"),
                Severity::Info => log::info!("[driver] {message}"),
                _ => log::debug!("[driver] {message}"),
            },
            Disposition::ContractViolation => {
                log::error!("[driver] {message}");
                debug_assert!(false, "driver reported an error: {message}");
            }
        }
        disposition
    }
}
