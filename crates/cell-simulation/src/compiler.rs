//! Shader compilation collaborator: kernel source text to SPIR-V words

use std::borrow::Cow;

use crate::error::{Result, SimError};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A compiled compute program, ready to wrap in a shader module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramBinary {
    pub name: String,
    pub words: Vec<u32>,
}

impl ProgramBinary {
    /// Wrap precompiled SPIR-V words, checking the magic number.
    pub fn from_words(name: impl Into<String>, words: Vec<u32>) -> Result<Self> {
        let name = name.into();
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(SimError::CompileFailed {
                name,
                log: "not a SPIR-V module".into(),
            });
        }
        Ok(Self { name, words })
    }

    pub(crate) fn source(&self) -> wgpu::ShaderSource<'_> {
        wgpu::ShaderSource::SpirV(Cow::Borrowed(&self.words))
    }
}

/// Turns kernel source into a [`ProgramBinary`].
pub trait ShaderCompiler {
    fn compile(&self, source: &str, name: &str) -> Result<ProgramBinary>;
}

/// WGSL to SPIR-V through naga.
#[derive(Debug, Default, Clone, Copy)]
pub struct NagaCompiler;

impl ShaderCompiler for NagaCompiler {
    fn compile(&self, source: &str, name: &str) -> Result<ProgramBinary> {
        let failed = |log: String| SimError::CompileFailed {
            name: name.to_owned(),
            log,
        };

        let module = naga::front::wgsl::parse_str(source).map_err(|e| failed(e.emit_to_string(source)))?;

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::PUSH_CONSTANT,
        );
        let info = validator
            .validate(&module)
            .map_err(|e| failed(e.emit_to_string(source)))?;

        let words = naga::back::spv::write_vec(&module, &info, &naga::back::spv::Options::default(), None)
            .map_err(|e| failed(e.to_string()))?;

        log::debug!("Compiled {name} ({} words)", words.len());
        ProgramBinary::from_words(name, words)
    }
}
