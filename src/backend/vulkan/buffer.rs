//! Vulkan buffer resource and usage transitions.
//!
//! Buffers follow the same protocol as textures minus the layout component:
//! a transition derives source and destination access and stage scopes from
//! the usage bits and records one `vkCmdPipelineBarrier` with a buffer memory
//! barrier covering the whole buffer.

use std::sync::Arc;

use ash::vk;

use crate::error::GpuError;
use crate::types::{BufferDescriptor, BufferUsage};

use super::allocator::MemoryAllocation;
use super::deleter::DeferredHandle;
use super::DeviceShared;

fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();

    if usage.contains(BufferUsage::COPY_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }

    flags
}

/// Memory-access kinds a buffer in `usage` may perform, unioned over bits.
fn access_flags(usage: BufferUsage) -> vk::AccessFlags {
    let mut flags = vk::AccessFlags::empty();

    if usage.contains(BufferUsage::MAP_READ) {
        flags |= vk::AccessFlags::HOST_READ;
    }
    if usage.contains(BufferUsage::MAP_WRITE) {
        flags |= vk::AccessFlags::HOST_WRITE;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        flags |= vk::AccessFlags::TRANSFER_READ;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        flags |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::AccessFlags::INDEX_READ;
    }
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::AccessFlags::UNIFORM_READ;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }

    flags
}

/// Pipeline stages that may touch a buffer in `usage`.
fn pipeline_stage_flags(usage: BufferUsage) -> vk::PipelineStageFlags {
    if usage.is_empty() {
        return vk::PipelineStageFlags::TOP_OF_PIPE;
    }

    let mut flags = vk::PipelineStageFlags::empty();

    if usage.intersects(BufferUsage::MAP_READ | BufferUsage::MAP_WRITE) {
        flags |= vk::PipelineStageFlags::HOST;
    }
    if usage.intersects(BufferUsage::COPY_SRC | BufferUsage::COPY_DST) {
        flags |= vk::PipelineStageFlags::TRANSFER;
    }
    if usage.intersects(BufferUsage::INDEX | BufferUsage::VERTEX) {
        flags |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if usage.intersects(BufferUsage::UNIFORM | BufferUsage::STORAGE) {
        flags |= vk::PipelineStageFlags::VERTEX_SHADER
            | vk::PipelineStageFlags::FRAGMENT_SHADER
            | vk::PipelineStageFlags::COMPUTE_SHADER;
    }

    flags
}

/// A buffer backed by a `VkBuffer` and a suballocated memory region.
///
/// Mappable buffers (MAP_READ or MAP_WRITE usage) are placed in host-visible,
/// host-coherent memory; everything else prefers device-local.
pub struct VulkanBuffer {
    device: Arc<DeviceShared>,
    handle: vk::Buffer,
    allocation: Option<MemoryAllocation>,
    size: u64,
    allowed_usage: BufferUsage,
    current_usage: BufferUsage,
}

impl std::fmt::Debug for VulkanBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("allowed_usage", &self.allowed_usage)
            .field("current_usage", &self.current_usage)
            .finish_non_exhaustive()
    }
}

impl VulkanBuffer {
    pub(crate) fn create(
        device: Arc<DeviceShared>,
        descriptor: &BufferDescriptor,
    ) -> Result<Self, GpuError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(buffer_usage_flags(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.raw().create_buffer(&create_info, None) }.map_err(|e| {
            GpuError::ResourceCreationFailed(format!("vkCreateBuffer failed: {e:?}"))
        })?;

        let requirements = unsafe { device.raw().get_buffer_memory_requirements(handle) };
        let allocation = device
            .allocate_memory(requirements, descriptor.usage.is_mappable())
            .map_err(|e| {
                unsafe { device.raw().destroy_buffer(handle, None) };
                e
            })?;

        unsafe {
            device
                .raw()
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        }
        .map_err(|e| {
            GpuError::ResourceCreationFailed(format!("vkBindBufferMemory failed: {e:?}"))
        })?;

        Ok(Self {
            device,
            handle,
            allocation: Some(allocation),
            size: descriptor.size,
            allowed_usage: descriptor.usage,
            current_usage: BufferUsage::empty(),
        })
    }

    /// The raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Every usage the buffer may ever be transitioned to.
    pub fn allowed_usage(&self) -> BufferUsage {
        self.allowed_usage
    }

    /// The usage of the last recorded barrier.
    pub fn current_usage(&self) -> BufferUsage {
        self.current_usage
    }

    /// Record a barrier into the pending command buffer that makes `target`
    /// usage safe, then remember `target` as the current usage.
    pub fn transition_usage(&mut self, target: BufferUsage) -> Result<(), GpuError> {
        debug_assert!(
            self.allowed_usage.contains(target),
            "transition target outside the buffer's allowed usage"
        );
        let commands = self.device.pending_command_buffer()?;
        self.record_barrier(commands, self.current_usage, target);
        self.current_usage = target;
        Ok(())
    }

    /// Record a usage-transition barrier covering the whole buffer.
    pub fn record_barrier(
        &self,
        commands: vk::CommandBuffer,
        current_usage: BufferUsage,
        target_usage: BufferUsage,
    ) {
        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(access_flags(current_usage))
            .dst_access_mask(access_flags(target_usage))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.handle)
            .offset(0)
            .size(vk::WHOLE_SIZE);

        unsafe {
            self.device.raw().cmd_pipeline_barrier(
                commands,
                pipeline_stage_flags(current_usage),
                pipeline_stage_flags(target_usage),
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.device.free_allocation(allocation);
        }
        self.device
            .delete_when_unused(DeferredHandle::Buffer(self.handle));
    }
}
