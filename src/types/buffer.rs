//! Buffer types and descriptors.

use bitflags::bitflags;

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be mapped for reading on the CPU.
        const MAP_READ = 1 << 0;
        /// Buffer can be mapped for writing on the CPU.
        const MAP_WRITE = 1 << 1;
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 2;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 3;
        /// Buffer can be used as an index buffer.
        const INDEX = 1 << 4;
        /// Buffer can be used as a vertex buffer.
        const VERTEX = 1 << 5;
        /// Buffer can be used as a uniform buffer.
        const UNIFORM = 1 << 6;
        /// Buffer can be used as a storage buffer.
        const STORAGE = 1 << 7;
    }
}

impl BufferUsage {
    /// Whether this usage requires host-visible memory.
    pub fn is_mappable(self) -> bool {
        self.intersects(Self::MAP_READ | Self::MAP_WRITE)
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a buffer.
///
/// Assumed already validated by the front end.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Allowed usage flags.
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
