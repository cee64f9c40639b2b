//! Compute pipeline construction from a binding layout and a program binary

use cell_model::Attribute;

use crate::compiler::ProgramBinary;
use crate::device::GpuDevice;
use crate::error::{Result, SimError};
use crate::params::STEP_CONSTANTS_SIZE;

/// One storage buffer binding visible to the compute stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageBinding {
    pub binding: u32,
    pub read_only: bool,
}

/// Bindings of one bind group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSet {
    pub bindings: Vec<StorageBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
}

/// Shape of the resources a kernel expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingLayout {
    pub sets: Vec<BindingSet>,
    pub push_constants: Vec<PushConstantRange>,
}

impl BindingLayout {
    /// Set 0 reads the input attributes, set 1 writes the output attributes,
    /// and the step constants are pushed.
    pub fn state_in_out() -> Self {
        let set = |read_only| BindingSet {
            bindings: Attribute::ALL
                .iter()
                .map(|attribute| StorageBinding {
                    binding: attribute.binding(),
                    read_only,
                })
                .collect(),
        };
        Self {
            sets: vec![set(true), set(false)],
            push_constants: vec![PushConstantRange {
                offset: 0,
                size: STEP_CONSTANTS_SIZE,
            }],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sets.is_empty() || self.sets.len() > 2 {
            return Err(SimError::InvalidBindingLayout(format!(
                "expected one or two binding sets, got {}",
                self.sets.len()
            )));
        }
        for (index, set) in self.sets.iter().enumerate() {
            let mut seen: Vec<u32> = set.bindings.iter().map(|b| b.binding).collect();
            seen.sort_unstable();
            if seen.windows(2).any(|pair| pair[0] == pair[1]) {
                return Err(SimError::InvalidBindingLayout(format!(
                    "set {index} repeats a binding index"
                )));
            }
        }
        for range in &self.push_constants {
            if range.size == 0 || range.offset % 4 != 0 || range.size % 4 != 0 {
                return Err(SimError::InvalidBindingLayout(format!(
                    "push constant range {}..{} is not 4-byte aligned",
                    range.offset,
                    range.offset + range.size
                )));
            }
        }
        Ok(())
    }

    fn set_layout_entries(set: &BindingSet) -> Vec<wgpu::BindGroupLayoutEntry> {
        set.bindings
            .iter()
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding: binding.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: binding.read_only,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect()
    }
}

/// A compute pipeline together with the layouts it was built from.
#[derive(Debug, Default)]
pub struct ComputePipeline {
    pipeline: Option<wgpu::ComputePipeline>,
    layout: Option<wgpu::PipelineLayout>,
    set_layouts: Vec<wgpu::BindGroupLayout>,
    name: String,
}

impl ComputePipeline {
    /// Build the pipeline with entry point `main`. The shader module only lives
    /// for the duration of this call.
    pub fn build(device: &GpuDevice, program: &ProgramBinary, layout: &BindingLayout) -> Result<Self> {
        layout.validate()?;
        let name = program.name.as_str();
        log::info!("Creating {name} pipeline...");

        let set_layouts = layout
            .sets
            .iter()
            .enumerate()
            .map(|(index, set)| {
                device.checked(|device| {
                    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some(&format!("{name} Bind Group Layout {index}")),
                        entries: &BindingLayout::set_layout_entries(set),
                    })
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let push_constant_ranges: Vec<_> = layout
            .push_constants
            .iter()
            .map(|range| wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: range.offset..range.offset + range.size,
            })
            .collect();

        let pipeline_layout = device.checked(|device| {
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{name} Pipeline Layout")),
                bind_group_layouts: &set_layouts.iter().collect::<Vec<_>>(),
                push_constant_ranges: &push_constant_ranges,
            })
        })?;

        let pipeline = device.checked(|device| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(name),
                source: program.source(),
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&format!("{name} Pipeline")),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            })
        })?;

        log::info!("Pipeline {name} created");
        Ok(Self {
            pipeline: Some(pipeline),
            layout: Some(pipeline_layout),
            set_layouts,
            name: name.to_owned(),
        })
    }

    #[track_caller]
    pub fn raw(&self) -> Result<&wgpu::ComputePipeline> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| SimError::driver("INVALID_HANDLE", format!("pipeline '{}' was destroyed", self.name)))
    }

    #[track_caller]
    pub fn set_layout(&self, index: usize) -> Result<&wgpu::BindGroupLayout> {
        self.set_layouts
            .get(index)
            .ok_or_else(|| SimError::driver("INVALID_HANDLE", format!("pipeline '{}' has no set {index}", self.name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_built(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Drop the pipeline, then its layouts.
    pub fn destroy(&mut self) {
        self.pipeline = None;
        self.layout = None;
        self.set_layouts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_layout_is_read_in_write_out() {
        let layout = BindingLayout::state_in_out();
        layout.validate().unwrap();

        assert_eq!(layout.sets.len(), 2);
        assert!(layout.sets[0].bindings.iter().all(|b| b.read_only));
        assert!(layout.sets[1].bindings.iter().all(|b| !b.read_only));
        assert_eq!(
            layout.sets[1].bindings.iter().map(|b| b.binding).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(layout.push_constants, vec![PushConstantRange { offset: 0, size: 8 }]);
    }

    #[test]
    fn set_count_is_bounded() {
        let mut layout = BindingLayout::state_in_out();
        layout.sets.push(layout.sets[0].clone());
        assert!(matches!(layout.validate(), Err(SimError::InvalidBindingLayout(_))));

        layout.sets.clear();
        assert!(layout.validate().is_err());

        let single = BindingLayout {
            sets: vec![BindingLayout::state_in_out().sets.remove(1)],
            push_constants: Vec::new(),
        };
        single.validate().unwrap();
    }

    #[test]
    fn duplicate_bindings_and_misaligned_ranges_are_rejected() {
        let mut layout = BindingLayout::state_in_out();
        layout.sets[0].bindings[1].binding = 0;
        assert!(layout.validate().is_err());

        let mut layout = BindingLayout::state_in_out();
        layout.push_constants[0].size = 6;
        assert!(layout.validate().is_err());
    }

    #[test]
    fn destroy_is_idempotent_on_empty_pipeline() {
        let mut pipeline = ComputePipeline::default();
        pipeline.destroy();
        pipeline.destroy();
        assert!(!pipeline.is_built());
        assert!(pipeline.raw().is_err());
        assert!(pipeline.set_layout(0).is_err());
    }
}
