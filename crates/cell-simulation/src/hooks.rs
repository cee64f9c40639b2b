//! Host-side hooks around a step: the fence wait and frame capture

use crate::device::GpuDevice;

/// Called immediately around the single blocking wait of each step.
pub trait WaitHooks {
    fn wait_begin(&mut self) {}
    fn wait_end(&mut self) {}
}

/// Default hooks: do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWaitHooks;

impl WaitHooks for NoWaitHooks {}

/// Best-effort capture of a step's GPU work by an attached graphics debugger.
pub trait FrameCapture {
    fn is_supported(&self) -> bool;
    fn begin(&mut self, device: &GpuDevice);
    fn end(&mut self, device: &GpuDevice);
}

/// Capture disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl FrameCapture for NoCapture {
    fn is_supported(&self) -> bool {
        false
    }

    fn begin(&mut self, _device: &GpuDevice) {}

    fn end(&mut self, _device: &GpuDevice) {}
}

/// Drives the graphics debugger capture that wgpu forwards to the backend
/// (RenderDoc on Vulkan/DX12, Xcode on Metal).
#[derive(Debug, Default)]
pub struct GraphicsDebuggerCapture {
    supported: bool,
    active: bool,
}

impl GraphicsDebuggerCapture {
    /// Supported only when a debugger is already injected into the process.
    pub fn detect(device: &GpuDevice) -> Self {
        let supported = device.is_alive() && debugger_attached(device.info().backend);
        if supported {
            log::info!("Graphics debugger detected, frame capture enabled");
        } else {
            log::debug!("No graphics debugger attached, frame capture disabled");
        }
        Self {
            supported,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl FrameCapture for GraphicsDebuggerCapture {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn begin(&mut self, device: &GpuDevice) {
        if !self.supported || self.active {
            return;
        }
        if let Ok(device) = device.device() {
            // SAFETY: no capture is open on this device (`active` is false).
            unsafe { device.start_graphics_debugger_capture() };
            self.active = true;
            log::debug!("Frame capture started");
        }
    }

    fn end(&mut self, device: &GpuDevice) {
        if !self.active {
            return;
        }
        if let Ok(device) = device.device() {
            // SAFETY: paired with the `start` call that set `active`.
            unsafe { device.stop_graphics_debugger_capture() };
            log::debug!("Frame capture finished");
        }
        self.active = false;
    }
}

/// Whether a capture layer is loaded for `backend`.
#[cfg(target_os = "linux")]
fn debugger_attached(backend: wgpu::Backend) -> bool {
    if !matches!(backend, wgpu::Backend::Vulkan | wgpu::Backend::Gl) {
        return false;
    }
    std::fs::read_to_string("/proc/self/maps")
        .map(|maps| maps_mention_renderdoc(&maps))
        .unwrap_or(false)
}

#[cfg(target_os = "macos")]
fn debugger_attached(backend: wgpu::Backend) -> bool {
    backend == wgpu::Backend::Metal && std::env::var_os("MTL_CAPTURE_ENABLED").is_some()
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn debugger_attached(_backend: wgpu::Backend) -> bool {
    std::env::var_os("RENDERDOC_CAPFILE").is_some()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn maps_mention_renderdoc(maps: &str) -> bool {
    maps.lines().any(|line| line.contains("librenderdoc"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingHooks {
        begins: u32,
        ends: u32,
    }

    impl WaitHooks for CountingHooks {
        fn wait_begin(&mut self) {
            self.begins += 1;
        }

        fn wait_end(&mut self) {
            self.ends += 1;
        }
    }

    #[test]
    fn default_hooks_are_noops() {
        let mut hooks: Box<dyn WaitHooks> = Box::new(NoWaitHooks);
        hooks.wait_begin();
        hooks.wait_end();

        let mut counting = CountingHooks::default();
        counting.wait_begin();
        counting.wait_end();
        assert_eq!((counting.begins, counting.ends), (1, 1));
    }

    #[test]
    fn unsupported_capture_reports_itself() {
        assert!(!NoCapture.is_supported());
        let capture = GraphicsDebuggerCapture::default();
        assert!(!capture.is_supported());
        assert!(!capture.is_active());
    }

    #[test]
    fn renderdoc_is_found_in_process_maps() {
        let maps = "7f00-7f10 r-xp 00000000 08:01 42 /usr/lib/librenderdoc.so\n";
        assert!(maps_mention_renderdoc(maps));
        assert!(!maps_mention_renderdoc("7f00-7f10 r-xp 00000000 08:01 42 /usr/lib/libc.so.6\n"));
    }
}
