//! Shader binding types.

use bitflags::bitflags;

bitflags! {
    /// Shader stages a binding is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStage: u32 {
        /// Vertex shader stage.
        const VERTEX = 1 << 0;
        /// Fragment shader stage.
        const FRAGMENT = 1 << 1;
        /// Compute shader stage.
        const COMPUTE = 1 << 2;
    }
}

impl Default for ShaderStage {
    fn default() -> Self {
        Self::empty()
    }
}

/// The kind of resource a binding slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingType {
    /// A uniform buffer binding.
    UniformBuffer,
    /// A sampler binding.
    Sampler,
    /// A sampled texture binding.
    SampledTexture,
    /// A storage buffer binding.
    StorageBuffer,
}
