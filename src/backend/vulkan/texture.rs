//! Vulkan texture resource and usage transitions.
//!
//! A texture remembers the usage the last recorded barrier put it in. When a
//! recorded sequence needs it in a different role, the transition protocol
//! derives the barrier parameters (access scopes, pipeline stage scopes,
//! image layouts, aspect mask) purely from the usage bits and the format,
//! and writes one `vkCmdPipelineBarrier` into the pending command buffer.
//!
//! Barriers are emitted one per transition without coalescing. That can
//! produce redundant back-to-back barriers; each one is still correct in
//! isolation.

use std::sync::Arc;

use ash::vk;

use crate::error::GpuError;
use crate::types::{TextureDescriptor, TextureDimension, TextureFormat, TextureUsage};

use super::allocator::MemoryAllocation;
use super::deleter::DeferredHandle;
use super::DeviceShared;

fn image_type(dimension: TextureDimension) -> vk::ImageType {
    match dimension {
        TextureDimension::D1 => vk::ImageType::TYPE_1D,
        TextureDimension::D2 => vk::ImageType::TYPE_2D,
        TextureDimension::D3 => vk::ImageType::TYPE_3D,
    }
}

fn image_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8Uint => vk::Format::R8G8B8A8_UINT,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::Depth32FloatStencil8 => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

// Needs the format to choose between the color and depth attachment bits.
fn image_usage_flags(usage: TextureUsage, format: TextureFormat) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();

    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::TEXTURE_BINDING) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE_BINDING) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.is_depth_stencil() {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
    }

    flags
}

/// Memory-access kinds a texture in `usage` may perform.
///
/// Unioned bit by bit over the usage mask, so it works for both the source
/// and destination side of a barrier.
fn access_flags(usage: TextureUsage, format: TextureFormat) -> vk::AccessFlags {
    let mut flags = vk::AccessFlags::empty();

    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::AccessFlags::TRANSFER_READ;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if usage.contains(TextureUsage::TEXTURE_BINDING) {
        flags |= vk::AccessFlags::SHADER_READ;
    }
    if usage.contains(TextureUsage::STORAGE_BINDING) {
        flags |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.is_depth_stencil() {
            flags |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        } else {
            flags |= vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        }
    }
    if usage.contains(TextureUsage::PRESENT) {
        // No precise scope covers presentation; stay conservative.
        flags |= vk::AccessFlags::MEMORY_READ;
    }

    flags
}

/// Pipeline stages that may touch a texture in `usage`.
fn pipeline_stage_flags(usage: TextureUsage, format: TextureFormat) -> vk::PipelineStageFlags {
    if usage.is_empty() {
        // Only happens right after creation (and for the source side of the
        // first barrier): nothing has to finish before the transition.
        return vk::PipelineStageFlags::TOP_OF_PIPE;
    }

    let mut flags = vk::PipelineStageFlags::empty();

    if usage.intersects(TextureUsage::COPY_SRC | TextureUsage::COPY_DST) {
        flags |= vk::PipelineStageFlags::TRANSFER;
    }
    if usage.intersects(TextureUsage::TEXTURE_BINDING | TextureUsage::STORAGE_BINDING) {
        flags |= vk::PipelineStageFlags::VERTEX_SHADER
            | vk::PipelineStageFlags::FRAGMENT_SHADER
            | vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.is_depth_stencil() {
            flags |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        } else {
            flags |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        }
    }
    if usage.contains(TextureUsage::PRESENT) {
        flags |= vk::PipelineStageFlags::ALL_COMMANDS;
    }

    flags
}

/// The single canonical layout for a texture in `usage`.
///
/// A usage combining several bits maps to GENERAL: the barrier transitions
/// the whole resource atomically and no per-subresource state is tracked, so
/// only the fully general layout is valid for every bit at once.
fn image_layout(usage: TextureUsage, format: TextureFormat) -> vk::ImageLayout {
    if usage.is_empty() {
        return vk::ImageLayout::UNDEFINED;
    }
    if !usage.has_zero_or_one_bits() {
        return vk::ImageLayout::GENERAL;
    }

    if usage == TextureUsage::COPY_DST {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    } else if usage == TextureUsage::TEXTURE_BINDING {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else if usage == TextureUsage::COPY_SRC {
        // Copy sources use GENERAL: copies require the whole image in one
        // known layout, and parts of it may have been left in GENERAL by a
        // combined usage earlier.
        vk::ImageLayout::GENERAL
    } else if usage == TextureUsage::STORAGE_BINDING {
        // Writable storage images must use GENERAL.
        vk::ImageLayout::GENERAL
    } else if usage == TextureUsage::PRESENT {
        vk::ImageLayout::PRESENT_SRC_KHR
    } else if usage == TextureUsage::RENDER_ATTACHMENT {
        if format.is_depth_stencil() {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        }
    } else {
        unreachable!("unknown texture usage bit")
    }
}

/// Which aspects of the image a transition covers, from the format alone.
fn aspect_flags(format: TextureFormat) -> vk::ImageAspectFlags {
    let mut flags = vk::ImageAspectFlags::empty();
    if format.has_depth() {
        flags |= vk::ImageAspectFlags::DEPTH;
    }
    if format.has_stencil() {
        flags |= vk::ImageAspectFlags::STENCIL;
    }
    if flags.is_empty() {
        flags = vk::ImageAspectFlags::COLOR;
    }
    flags
}

/// A texture backed by a `VkImage` and a suballocated memory region.
pub struct VulkanTexture {
    device: Arc<DeviceShared>,
    handle: vk::Image,
    allocation: Option<MemoryAllocation>,
    format: TextureFormat,
    mip_level_count: u32,
    allowed_usage: TextureUsage,
    current_usage: TextureUsage,
}

impl std::fmt::Debug for VulkanTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanTexture")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("allowed_usage", &self.allowed_usage)
            .field("current_usage", &self.current_usage)
            .finish_non_exhaustive()
    }
}

impl VulkanTexture {
    /// Create the image, allocate memory for it and bind the two together.
    ///
    /// The descriptor is assumed validated by the front end; no format or
    /// usage checking happens here.
    pub(crate) fn create(
        device: Arc<DeviceShared>,
        descriptor: &TextureDescriptor,
    ) -> Result<Self, GpuError> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(image_type(descriptor.dimension))
            .format(image_format(descriptor.format))
            .extent(vk::Extent3D {
                width: descriptor.size.width,
                height: descriptor.size.height,
                depth: descriptor.size.depth,
            })
            .mip_levels(descriptor.mip_level_count)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage_flags(descriptor.usage, descriptor.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = unsafe { device.raw().create_image(&create_info, None) }.map_err(|e| {
            GpuError::ResourceCreationFailed(format!("vkCreateImage failed: {e:?}"))
        })?;

        let requirements = unsafe { device.raw().get_image_memory_requirements(handle) };
        let allocation = device.allocate_memory(requirements, false).map_err(|e| {
            unsafe { device.raw().destroy_image(handle, None) };
            e
        })?;

        unsafe {
            device
                .raw()
                .bind_image_memory(handle, allocation.memory(), allocation.offset())
        }
        .map_err(|e| GpuError::ResourceCreationFailed(format!("vkBindImageMemory failed: {e:?}")))?;

        Ok(Self {
            device,
            handle,
            allocation: Some(allocation),
            format: descriptor.format,
            mip_level_count: descriptor.mip_level_count,
            allowed_usage: descriptor.usage,
            current_usage: TextureUsage::empty(),
        })
    }

    /// The raw image handle.
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    /// The texture's format.
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Every usage the texture may ever be transitioned to.
    pub fn allowed_usage(&self) -> TextureUsage {
        self.allowed_usage
    }

    /// The usage of the last recorded barrier.
    pub fn current_usage(&self) -> TextureUsage {
        self.current_usage
    }

    /// The aspects this texture's barriers cover.
    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        aspect_flags(self.format)
    }

    /// Record a barrier into the pending command buffer that makes `target`
    /// usage safe, then remember `target` as the current usage.
    pub fn transition_usage(&mut self, target: TextureUsage) -> Result<(), GpuError> {
        debug_assert!(
            self.allowed_usage.contains(target),
            "transition target outside the texture's allowed usage"
        );
        let commands = self.device.pending_command_buffer()?;
        self.record_barrier(commands, self.current_usage, target);
        self.current_usage = target;
        Ok(())
    }

    /// Record a usage-transition barrier into `commands`.
    ///
    /// Transitions the whole resource; subresource-granular state is not
    /// tracked.
    pub fn record_barrier(
        &self,
        commands: vk::CommandBuffer,
        current_usage: TextureUsage,
        target_usage: TextureUsage,
    ) {
        let format = self.format;
        let src_stages = pipeline_stage_flags(current_usage, format);
        let dst_stages = pipeline_stage_flags(target_usage, format);

        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(access_flags(current_usage, format))
            .dst_access_mask(access_flags(target_usage, format))
            .old_layout(image_layout(current_usage, format))
            .new_layout(image_layout(target_usage, format))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.handle)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_flags(format),
                base_mip_level: 0,
                level_count: self.mip_level_count,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe {
            self.device.raw().cmd_pipeline_barrier(
                commands,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        // Memory is freed after the image is destroyed; both wait on the same
        // serial, so queue order keeps that safe.
        if let Some(allocation) = self.allocation.take() {
            self.device.free_allocation(allocation);
        }
        self.device
            .delete_when_unused(DeferredHandle::Image(self.handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const COLOR: TextureFormat = TextureFormat::Rgba8Unorm;
    const DEPTH: TextureFormat = TextureFormat::Depth32Float;
    const DEPTH_STENCIL: TextureFormat = TextureFormat::Depth24PlusStencil8;

    #[test]
    fn test_unused_texture_has_no_wait_source_scope() {
        assert_eq!(
            pipeline_stage_flags(TextureUsage::empty(), COLOR),
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
        assert_eq!(
            access_flags(TextureUsage::empty(), COLOR),
            vk::AccessFlags::empty()
        );
        assert_eq!(
            image_layout(TextureUsage::empty(), COLOR),
            vk::ImageLayout::UNDEFINED
        );
    }

    #[rstest]
    #[case(TextureUsage::COPY_DST, vk::ImageLayout::TRANSFER_DST_OPTIMAL)]
    #[case(TextureUsage::TEXTURE_BINDING, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]
    #[case(TextureUsage::COPY_SRC, vk::ImageLayout::GENERAL)]
    #[case(TextureUsage::STORAGE_BINDING, vk::ImageLayout::GENERAL)]
    #[case(TextureUsage::PRESENT, vk::ImageLayout::PRESENT_SRC_KHR)]
    #[case(TextureUsage::RENDER_ATTACHMENT, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)]
    fn test_single_bit_usage_maps_to_specific_layout(
        #[case] usage: TextureUsage,
        #[case] expected: vk::ImageLayout,
    ) {
        assert_eq!(image_layout(usage, COLOR), expected);
    }

    #[rstest]
    #[case(TextureUsage::COPY_DST | TextureUsage::TEXTURE_BINDING)]
    #[case(TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING)]
    #[case(TextureUsage::COPY_SRC | TextureUsage::COPY_DST | TextureUsage::STORAGE_BINDING)]
    fn test_combined_usage_maps_to_general_layout(#[case] usage: TextureUsage) {
        assert_eq!(image_layout(usage, COLOR), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn test_attachment_scopes_depend_on_format() {
        assert_eq!(
            image_layout(TextureUsage::RENDER_ATTACHMENT, DEPTH),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            pipeline_stage_flags(TextureUsage::RENDER_ATTACHMENT, DEPTH),
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        );
        assert_eq!(
            pipeline_stage_flags(TextureUsage::RENDER_ATTACHMENT, COLOR),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            access_flags(TextureUsage::RENDER_ATTACHMENT, DEPTH),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn test_access_flags_union_over_bits() {
        let usage = TextureUsage::COPY_SRC | TextureUsage::STORAGE_BINDING;
        assert_eq!(
            access_flags(usage, COLOR),
            vk::AccessFlags::TRANSFER_READ
                | vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE
        );
    }

    #[rstest]
    #[case(COLOR, vk::ImageAspectFlags::COLOR)]
    #[case(DEPTH, vk::ImageAspectFlags::DEPTH)]
    #[case(
        DEPTH_STENCIL,
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    )]
    fn test_aspect_mask_from_format(
        #[case] format: TextureFormat,
        #[case] expected: vk::ImageAspectFlags,
    ) {
        assert_eq!(aspect_flags(format), expected);
    }

    #[test]
    fn test_transition_mapping_is_deterministic() {
        let usage = TextureUsage::COPY_DST | TextureUsage::TEXTURE_BINDING;
        for _ in 0..3 {
            assert_eq!(access_flags(usage, COLOR), access_flags(usage, COLOR));
            assert_eq!(
                pipeline_stage_flags(usage, COLOR),
                pipeline_stage_flags(usage, COLOR)
            );
            assert_eq!(image_layout(usage, COLOR), image_layout(usage, COLOR));
        }
    }

    #[test]
    fn test_image_usage_flags_pick_attachment_kind_by_format() {
        assert_eq!(
            image_usage_flags(TextureUsage::RENDER_ATTACHMENT, COLOR),
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        );
        assert_eq!(
            image_usage_flags(TextureUsage::RENDER_ATTACHMENT, DEPTH),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        );
    }
}
