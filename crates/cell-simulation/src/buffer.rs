//! Buffer allocation with residency resolution

use crate::device::GpuDevice;
use crate::error::{Result, SimError};

/// Where a buffer's memory should live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    /// Fast GPU memory, never mapped
    DeviceLocal,
    /// Mappable by the host
    HostVisible,
}

/// Resolve the final usage flags for a buffer of the given residency.
///
/// First compatible class wins:
/// - device-local accepts any usage without `MAP_*`
/// - host-visible accepts a subset of `COPY_DST` (readback, gains `MAP_READ`)
///   or a subset of `COPY_SRC` (staging, gains `MAP_WRITE`)
/// - any other host-visible usage needs `MAPPABLE_PRIMARY_BUFFERS`
pub fn resolve_usage(
    usage: wgpu::BufferUsages,
    residency: Residency,
    features: wgpu::Features,
) -> Result<wgpu::BufferUsages> {
    let mapping = wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::MAP_WRITE;
    let incompatible = || SimError::NoCompatibleMemoryType { residency, usage };

    match residency {
        Residency::DeviceLocal if usage.intersects(mapping) => Err(incompatible()),
        Residency::DeviceLocal => Ok(usage),
        Residency::HostVisible => {
            let plain = usage - mapping;
            if wgpu::BufferUsages::COPY_DST.contains(plain) && !usage.contains(wgpu::BufferUsages::MAP_WRITE) {
                Ok(plain | wgpu::BufferUsages::MAP_READ)
            } else if wgpu::BufferUsages::COPY_SRC.contains(plain) && !usage.contains(wgpu::BufferUsages::MAP_READ) {
                Ok(plain | wgpu::BufferUsages::MAP_WRITE)
            } else if features.contains(wgpu::Features::MAPPABLE_PRIMARY_BUFFERS) {
                Ok(if usage.intersects(mapping) {
                    usage
                } else {
                    usage | wgpu::BufferUsages::MAP_READ
                })
            } else {
                Err(incompatible())
            }
        }
    }
}

/// A buffer together with its backing memory.
///
/// `Default` is the released state; [`GpuBuffer::destroy`] returns to it.
#[derive(Debug, Default)]
pub struct GpuBuffer {
    buffer: Option<wgpu::Buffer>,
    size: u64,
    residency: Option<Residency>,
    label: String,
}

impl GpuBuffer {
    #[track_caller]
    pub fn create(
        device: &GpuDevice,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
        residency: Residency,
    ) -> Result<Self> {
        let usage = resolve_usage(usage, residency, device.features())?;
        let buffer = device.checked(|device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        })?;

        log::debug!("Allocated {label} ({size} bytes, {residency:?}, {usage:?})");
        Ok(Self {
            buffer: Some(buffer),
            size,
            residency: Some(residency),
            label: label.to_owned(),
        })
    }

    /// The live handle, or a driver error if the buffer was released.
    #[track_caller]
    pub fn handle(&self) -> Result<&wgpu::Buffer> {
        self.buffer
            .as_ref()
            .ok_or_else(|| SimError::driver("INVALID_HANDLE", format!("buffer '{}' is not allocated", self.label)))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn residency(&self) -> Option<Residency> {
        self.residency
    }

    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn destroy(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            buffer.destroy();
        }
        self.size = 0;
        self.residency = None;
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpu::BufferUsages as U;

    #[test]
    fn device_local_rejects_mapping() {
        let storage = U::STORAGE | U::COPY_SRC | U::COPY_DST;
        assert_eq!(
            resolve_usage(storage, Residency::DeviceLocal, wgpu::Features::empty()).unwrap(),
            storage
        );
        assert!(matches!(
            resolve_usage(U::MAP_READ | U::COPY_DST, Residency::DeviceLocal, wgpu::Features::empty()),
            Err(SimError::NoCompatibleMemoryType {
                residency: Residency::DeviceLocal,
                ..
            })
        ));
    }

    #[test]
    fn host_visible_picks_first_compatible_class() {
        let none = wgpu::Features::empty();
        assert_eq!(
            resolve_usage(U::COPY_DST, Residency::HostVisible, none).unwrap(),
            U::COPY_DST | U::MAP_READ
        );
        assert_eq!(
            resolve_usage(U::COPY_SRC, Residency::HostVisible, none).unwrap(),
            U::COPY_SRC | U::MAP_WRITE
        );
        assert_eq!(
            resolve_usage(U::MAP_READ | U::COPY_DST, Residency::HostVisible, none).unwrap(),
            U::COPY_DST | U::MAP_READ
        );
    }

    #[test]
    fn host_visible_storage_needs_mappable_primary_buffers() {
        let usage = U::STORAGE | U::COPY_DST;
        assert!(resolve_usage(usage, Residency::HostVisible, wgpu::Features::empty()).is_err());
        assert_eq!(
            resolve_usage(
                usage,
                Residency::HostVisible,
                wgpu::Features::MAPPABLE_PRIMARY_BUFFERS
            )
            .unwrap(),
            usage | U::MAP_READ
        );
    }

    #[test]
    fn destroy_is_idempotent_on_empty_buffer() {
        let mut buffer = GpuBuffer::default();
        buffer.destroy();
        buffer.destroy();
        assert!(!buffer.is_allocated());
        assert_eq!(buffer.size(), 0);
        assert!(buffer.handle().is_err());
    }
}
