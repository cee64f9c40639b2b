//! Double-buffered attribute storage on the device

use cell_model::Attribute;

use crate::buffer::{GpuBuffer, Residency};
use crate::device::GpuDevice;
use crate::error::{Result, SimError};
use crate::pipeline::ComputePipeline;

/// One of the two device-local attribute sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSet {
    A,
    B,
}

impl StateSet {
    pub fn other(self) -> Self {
        match self {
            StateSet::A => StateSet::B,
            StateSet::B => StateSet::A,
        }
    }

    pub fn index(self) -> usize {
        match self {
            StateSet::A => 0,
            StateSet::B => 1,
        }
    }
}

/// Which set the next dispatch reads from; the other one is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPong {
    input: StateSet,
}

impl Default for PingPong {
    fn default() -> Self {
        Self { input: StateSet::A }
    }
}

impl PingPong {
    pub fn input(&self) -> StateSet {
        self.input
    }

    pub fn output(&self) -> StateSet {
        self.input.other()
    }

    /// Last step's output becomes the next step's input.
    pub fn swap(&mut self) {
        self.input = self.input.other();
    }
}

/// Bytes covered by the first `count` elements of an attribute
pub fn attribute_range(attribute: Attribute, count: u32) -> u64 {
    count as u64 * attribute.element_size()
}

/// One buffer per GPU attribute, indexed by [`Attribute::index`]
#[derive(Debug, Default)]
pub struct AttributeSet {
    buffers: [GpuBuffer; 4],
}

impl AttributeSet {
    fn allocate(
        device: &GpuDevice,
        prefix: &str,
        capacity: u32,
        usage: wgpu::BufferUsages,
        residency: Residency,
    ) -> Result<Self> {
        let mut set = Self::default();
        for attribute in Attribute::ALL {
            set.buffers[attribute.index()] = GpuBuffer::create(
                device,
                &format!("{prefix} {}", attribute.name()),
                // wgpu rejects zero-sized bindings
                attribute_range(attribute, capacity.max(1)),
                usage,
                residency,
            )?;
        }
        Ok(set)
    }

    pub fn buffer(&self, attribute: Attribute) -> &GpuBuffer {
        &self.buffers[attribute.index()]
    }

    fn release(&mut self) {
        for buffer in &mut self.buffers {
            buffer.destroy();
        }
    }
}

/// Device-side simulation state: two ping-pong sets and the readback set.
#[derive(Debug, Default)]
pub struct StateStore {
    capacity: u32,
    readback: AttributeSet,
    ping_pong: [AttributeSet; 2],
}

impl StateStore {
    pub fn allocate(device: &GpuDevice, capacity: u32) -> Result<Self> {
        let readback = AttributeSet::allocate(
            device,
            "Readback",
            capacity,
            wgpu::BufferUsages::COPY_DST,
            Residency::HostVisible,
        )?;
        let storage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        let a = AttributeSet::allocate(device, "State A", capacity, storage, Residency::DeviceLocal)?;
        let b = AttributeSet::allocate(device, "State B", capacity, storage, Residency::DeviceLocal)?;

        log::info!("State buffers created for {capacity} cells");
        Ok(Self {
            capacity,
            readback,
            ping_pong: [a, b],
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn set(&self, set: StateSet) -> &AttributeSet {
        &self.ping_pong[set.index()]
    }

    pub fn readback(&self) -> &AttributeSet {
        &self.readback
    }

    /// Bind groups for set 0 (input) and set 1 (output), sized to `cell_count`.
    #[track_caller]
    pub fn bind_descriptors(
        &self,
        device: &GpuDevice,
        pipeline: &ComputePipeline,
        input: StateSet,
        output: StateSet,
        cell_count: u32,
    ) -> Result<[wgpu::BindGroup; 2]> {
        if input == output {
            return Err(SimError::driver(
                "INVALID_BINDING",
                format!("state set {input:?} bound as both input and output"),
            ));
        }

        let group = |index: usize, set: StateSet, label: &str| -> Result<wgpu::BindGroup> {
            let layout = pipeline.set_layout(index)?;
            let attributes = self.set(set);
            let handles = Attribute::ALL
                .iter()
                .map(|attribute| attributes.buffer(*attribute).handle())
                .collect::<Result<Vec<_>>>()?;
            let entries: Vec<_> = Attribute::ALL
                .iter()
                .zip(&handles)
                .map(|(attribute, buffer)| wgpu::BindGroupEntry {
                    binding: attribute.binding(),
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(attribute_range(*attribute, cell_count)),
                    }),
                })
                .collect();

            device.checked(|device| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(label),
                    layout,
                    entries: &entries,
                })
            })
        };

        Ok([
            group(0, input, "Input Bind Group")?,
            group(1, output, "Output Bind Group")?,
        ])
    }

    /// Destroy every buffer in all three sets.
    pub fn release(&mut self) {
        self.readback.release();
        for set in &mut self.ping_pong {
            set.release();
        }
    }
}
