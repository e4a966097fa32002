//! # gpu-hal
//!
//! Backend-agnostic GPU command and resource layer with a native Vulkan
//! backend.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`Serial`] / [`SerialQueue`] - The device's execution timeline and
//!   serial-ordered bookkeeping queues built on it
//! - [`backend`] - Device, texture and buffer traits plus the Vulkan
//!   implementation: submission tracking, fenced deferred destruction,
//!   device-memory suballocation and usage-transition barriers
//! - [`handle`] - Ref-counted wrappers for externally owned API handles
//! - [`layout_cache`] - Structural deduplication of bind group layouts
//!
//! ## Example
//!
//! ```ignore
//! use gpu_hal::{backend, DeviceConfig, TextureDescriptor, TextureFormat, TextureUsage};
//!
//! let device = backend::create_device(&DeviceConfig::default())?;
//! let mut texture = device.create_texture(&TextureDescriptor::new_2d(
//!     256,
//!     256,
//!     TextureFormat::Rgba8Unorm,
//!     TextureUsage::COPY_DST | TextureUsage::TEXTURE_BINDING,
//! ))?;
//! texture.transition_usage(TextureUsage::COPY_DST)?;
//! // Record a copy, then:
//! let serial = device.submit_pending_commands()?;
//! device.tick()?;
//! ```

pub mod backend;
pub mod error;
pub mod handle;
pub mod layout_cache;
pub mod serial;
pub mod types;

// Re-export main types for convenience
pub use backend::vulkan::{VulkanBuffer, VulkanDevice, VulkanTexture};
pub use backend::{DeviceConfig, GpuBuffer, GpuDevice, GpuTexture};
pub use error::GpuError;
pub use handle::{ExternalHandle, OwnedHandle};
pub use layout_cache::{BindGroupLayout, BindGroupLayoutCache, BindGroupLayoutInfo};
pub use serial::{Serial, SerialQueue};
pub use types::{
    BindingType, BufferDescriptor, BufferUsage, Extent3d, ShaderStage, TextureDescriptor,
    TextureDimension, TextureFormat, TextureUsage,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library.
///
/// This should be called before using any GPU functionality.
pub fn init() {
    log::info!("gpu-hal v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_fresh_serial_queue_is_empty() {
        let queue: SerialQueue<u32> = SerialQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.last_serial(), None);
    }
}
