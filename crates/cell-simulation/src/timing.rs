//! GPU timestamp queries bracketing a step

use crate::buffer::{GpuBuffer, Residency};
use crate::device::GpuDevice;
use crate::error::Result;

/// Number of timestamps written per step (begin, end)
pub const TIMESTAMP_COUNT: u32 = 2;
const TIMESTAMP_BYTES: u64 = TIMESTAMP_COUNT as u64 * 8;

/// Converts raw counter values into seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestampCalibration {
    /// Nanoseconds per tick
    pub period_ns: f32,
    /// Counter width; bits above it are garbage
    pub valid_bits: u32,
}

impl TimestampCalibration {
    /// wgpu always reports full 64-bit timestamps.
    pub fn new(period_ns: f32) -> Self {
        Self {
            period_ns,
            valid_bits: 64,
        }
    }

    pub fn mask(&self) -> u64 {
        if self.valid_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.valid_bits) - 1
        }
    }

    /// Ticks between two raw values, tolerating one wrap of the counter.
    pub fn elapsed_ticks(&self, begin: u64, end: u64) -> u64 {
        let mask = self.mask();
        (end & mask).wrapping_sub(begin & mask) & mask
    }

    pub fn elapsed_seconds(&self, begin: u64, end: u64) -> f64 {
        self.elapsed_ticks(begin, end) as f64 * self.period_ns as f64 * 1e-9
    }
}

/// Query set plus the buffers its results travel through.
pub struct TimestampQueries {
    query_set: wgpu::QuerySet,
    resolve: GpuBuffer,
    staging: GpuBuffer,
    calibration: TimestampCalibration,
}

impl TimestampQueries {
    pub fn create(device: &GpuDevice, calibration: TimestampCalibration) -> Result<Self> {
        let query_set = device.checked(|device| {
            device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("Step Timestamps"),
                ty: wgpu::QueryType::Timestamp,
                count: TIMESTAMP_COUNT,
            })
        })?;
        let resolve = GpuBuffer::create(
            device,
            "Timestamp Resolve",
            TIMESTAMP_BYTES,
            wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            Residency::DeviceLocal,
        )?;
        let staging = GpuBuffer::create(
            device,
            "Timestamp Staging",
            TIMESTAMP_BYTES,
            wgpu::BufferUsages::COPY_DST,
            Residency::HostVisible,
        )?;

        Ok(Self {
            query_set,
            resolve,
            staging,
            calibration,
        })
    }

    pub fn write(&self, encoder: &mut wgpu::CommandEncoder, index: u32) {
        encoder.write_timestamp(&self.query_set, index);
    }

    /// Resolve both queries and copy them to the mappable staging buffer.
    pub fn resolve(&self, encoder: &mut wgpu::CommandEncoder) -> Result<()> {
        let resolve = self.resolve.handle()?;
        encoder.resolve_query_set(&self.query_set, 0..TIMESTAMP_COUNT, resolve, 0);
        encoder.copy_buffer_to_buffer(resolve, 0, self.staging.handle()?, 0, TIMESTAMP_BYTES);
        Ok(())
    }

    pub fn staging(&self) -> &GpuBuffer {
        &self.staging
    }

    /// Elapsed seconds from the mapped staging bytes.
    pub fn decode(&self, bytes: &[u8]) -> f64 {
        let read = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        self.calibration.elapsed_seconds(read(0), read(8))
    }

    pub fn destroy(&mut self) {
        self.resolve.destroy();
        self.staging.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_difference_survives_wrap() {
        let calibration = TimestampCalibration {
            period_ns: 1.0,
            valid_bits: 24,
        };
        assert_eq!(calibration.mask(), 0x00FF_FFFF);
        assert_eq!(calibration.elapsed_ticks(0xABFF_FFF0, 0xCD00_0010), 32);
    }

    #[test]
    fn full_width_counter_is_plain_difference() {
        let calibration = TimestampCalibration::new(2.5);
        assert_eq!(calibration.mask(), u64::MAX);
        assert_eq!(calibration.elapsed_ticks(1_000, 5_000), 4_000);
        assert!((calibration.elapsed_seconds(1_000, 5_000) - 1e-5).abs() < 1e-12);
    }

    #[test]
    fn garbage_high_bits_are_ignored() {
        let calibration = TimestampCalibration {
            period_ns: 10.0,
            valid_bits: 36,
        };
        let begin = 0xDEAD_0000_0000_0100;
        let end = 0xBEEF_0000_0000_0200;
        assert_eq!(calibration.elapsed_ticks(begin, end), 0x100);
    }
}
