//! GPU backend abstraction layer.
//!
//! The device, texture and buffer traits describe what the rest of the crate
//! needs from a backend; the `vulkan` module is the native implementation.
//! Resource lifetimes and submission ordering are part of the contract:
//! dropping a resource must never free it while submitted work can still
//! reference it, and serials returned by [`GpuDevice::submit`] complete in
//! the order they were assigned.

pub mod vulkan;

use crate::error::GpuError;
use crate::serial::Serial;
use crate::types::{BufferDescriptor, BufferUsage, TextureDescriptor, TextureFormat, TextureUsage};

/// Options for device bring-up.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    /// Enable the Khronos validation layer when available.
    pub validation: bool,
    /// Override the memory suballocation block size.
    pub memory_block_size: Option<u64>,
}

/// A texture whose usage transitions are tracked by the backend.
pub trait GpuTexture {
    /// Record a barrier making `target` usage safe and remember it.
    fn transition_usage(&mut self, target: TextureUsage) -> Result<(), GpuError>;

    /// The usage of the last recorded barrier.
    fn current_usage(&self) -> TextureUsage;

    /// Every usage the texture may ever be transitioned to.
    fn allowed_usage(&self) -> TextureUsage;

    /// The texture's format.
    fn format(&self) -> TextureFormat;
}

/// A buffer whose usage transitions are tracked by the backend.
pub trait GpuBuffer {
    /// Record a barrier making `target` usage safe and remember it.
    fn transition_usage(&mut self, target: BufferUsage) -> Result<(), GpuError>;

    /// The usage of the last recorded barrier.
    fn current_usage(&self) -> BufferUsage;

    /// Every usage the buffer may ever be transitioned to.
    fn allowed_usage(&self) -> BufferUsage;

    /// Size of the buffer in bytes.
    fn size(&self) -> u64;
}

/// A device with one submission queue and an execution timeline.
pub trait GpuDevice {
    /// Texture resource type of this backend.
    type Texture: GpuTexture;
    /// Buffer resource type of this backend.
    type Buffer: GpuBuffer;

    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Create a texture resource.
    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<Self::Texture, GpuError>;

    /// Create a buffer resource.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<Self::Buffer, GpuError>;

    /// Submit all commands recorded since the last submit.
    ///
    /// Returns the submission's serial, or `None` when nothing was recorded.
    fn submit(&self) -> Result<Option<Serial>, GpuError>;

    /// Observe GPU progress and reclaim completed resources.
    fn tick(&self) -> Result<(), GpuError>;

    /// Block until all submitted work completes, then reclaim resources.
    fn wait_idle(&self) -> Result<(), GpuError>;

    /// Serial of the most recent submission.
    fn last_submitted_serial(&self) -> Serial;

    /// Watermark of completed GPU work.
    fn completed_serial(&self) -> Serial;
}

impl GpuTexture for vulkan::VulkanTexture {
    fn transition_usage(&mut self, target: TextureUsage) -> Result<(), GpuError> {
        VulkanTexture::transition_usage(self, target)
    }

    fn current_usage(&self) -> TextureUsage {
        VulkanTexture::current_usage(self)
    }

    fn allowed_usage(&self) -> TextureUsage {
        VulkanTexture::allowed_usage(self)
    }

    fn format(&self) -> TextureFormat {
        VulkanTexture::format(self)
    }
}

impl GpuBuffer for vulkan::VulkanBuffer {
    fn transition_usage(&mut self, target: BufferUsage) -> Result<(), GpuError> {
        VulkanBuffer::transition_usage(self, target)
    }

    fn current_usage(&self) -> BufferUsage {
        VulkanBuffer::current_usage(self)
    }

    fn allowed_usage(&self) -> BufferUsage {
        VulkanBuffer::allowed_usage(self)
    }

    fn size(&self) -> u64 {
        VulkanBuffer::size(self)
    }
}

use vulkan::{VulkanBuffer, VulkanDevice, VulkanTexture};

impl GpuDevice for VulkanDevice {
    type Texture = VulkanTexture;
    type Buffer = VulkanBuffer;

    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<VulkanTexture, GpuError> {
        VulkanDevice::create_texture(self, descriptor)
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<VulkanBuffer, GpuError> {
        VulkanDevice::create_buffer(self, descriptor)
    }

    fn submit(&self) -> Result<Option<Serial>, GpuError> {
        self.submit_pending_commands()
    }

    fn tick(&self) -> Result<(), GpuError> {
        VulkanDevice::tick(self)
    }

    fn wait_idle(&self) -> Result<(), GpuError> {
        VulkanDevice::wait_idle(self)
    }

    fn last_submitted_serial(&self) -> Serial {
        VulkanDevice::last_submitted_serial(self)
    }

    fn completed_serial(&self) -> Serial {
        VulkanDevice::completed_serial(self)
    }
}

/// Create the default device for this platform.
pub fn create_device(config: &DeviceConfig) -> Result<VulkanDevice, GpuError> {
    let device = VulkanDevice::new(config)?;
    log::info!("Using Vulkan backend (ash)");
    Ok(device)
}
