//! Native Vulkan backend.
//!
//! All work goes to a single graphics+compute queue. Commands are recorded
//! into a pending command buffer that anyone can append to; submitting it
//! assigns the next serial, guards it with a fence and immediately opens a
//! fresh recording buffer. Ticking polls the fences in submission order,
//! advances the completed watermark and lets the deferred-destruction and
//! memory subsystems reclaim everything tagged at or below it.

pub mod allocator;
pub mod deleter;
mod device;
pub mod submission;

mod buffer;
mod texture;

pub use buffer::VulkanBuffer;
pub use texture::VulkanTexture;

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::GpuError;
use crate::serial::{Serial, SerialQueue};
use crate::types::{BufferDescriptor, TextureDescriptor};

use allocator::{MemoryAllocation, MemoryAllocator};
use deleter::{DeferredHandle, FencedDeleter};
use submission::{SubmissionTracker, Timeline};

use super::DeviceConfig;

/// A command buffer together with the pool it was allocated from.
///
/// Pools are reset wholesale when their submission completes, so each
/// submission gets a pool of its own.
#[derive(Debug, Clone, Copy)]
struct CommandPoolAndBuffer {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

/// Everything that changes at submit or tick time, behind one lock.
#[derive(Debug)]
struct SubmissionState {
    pending: Option<CommandPoolAndBuffer>,
    tracker: SubmissionTracker<vk::Fence>,
    unused_fences: Vec<vk::Fence>,
    commands_in_flight: SerialQueue<CommandPoolAndBuffer>,
    unused_commands: Vec<CommandPoolAndBuffer>,
}

/// Device state shared between the public device handle and every resource
/// created from it.
///
/// Resources hold an `Arc` to this, so the raw device outlives everything
/// that still needs it for destruction.
pub(crate) struct DeviceShared {
    raw: ash::Device,
    instance: ash::Instance,
    _entry: ash::Entry,
    physical_device: vk::PhysicalDevice,
    queue: vk::Queue,
    queue_family: u32,
    timeline: Timeline,
    submission: Mutex<SubmissionState>,
    allocator: Mutex<MemoryAllocator>,
    deleter: Mutex<FencedDeleter>,
}

impl DeviceShared {
    fn new(config: &DeviceConfig) -> Result<Self, GpuError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GpuError::InitializationFailed(format!("Failed to load Vulkan library: {e}"))
        })?;
        let instance = device::create_instance(&entry, config.validation)?;

        let physical_device = match device::select_physical_device(&instance) {
            Ok(device) => device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let queue_family = match device::find_queue_family(&instance, physical_device) {
            Ok(family) => family,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let raw = match device::create_logical_device(&instance, physical_device, queue_family) {
            Ok(device) => device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let queue = unsafe { raw.get_device_queue(queue_family, 0) };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let allocator = match config.memory_block_size {
            Some(block_size) => MemoryAllocator::with_block_size(memory_properties, block_size),
            None => MemoryAllocator::new(memory_properties),
        };

        Ok(Self {
            raw,
            instance,
            _entry: entry,
            physical_device,
            queue,
            queue_family,
            timeline: Timeline::new(),
            submission: Mutex::new(SubmissionState {
                pending: None,
                tracker: SubmissionTracker::new(),
                unused_fences: Vec::new(),
                commands_in_flight: SerialQueue::new(),
                unused_commands: Vec::new(),
            }),
            allocator: Mutex::new(allocator),
            deleter: Mutex::new(FencedDeleter::new()),
        })
    }

    pub(crate) fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub(crate) fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Reserve device memory for a resource.
    pub(crate) fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        mappable: bool,
    ) -> Result<MemoryAllocation, GpuError> {
        self.allocator.lock().allocate(&self.raw, requirements, mappable)
    }

    /// Hand a memory region back, tagged so it is reclaimed only after the
    /// pending submission completes.
    pub(crate) fn free_allocation(&self, allocation: MemoryAllocation) {
        self.allocator
            .lock()
            .free(allocation, self.timeline.pending_serial());
    }

    /// Queue `handle` for fenced destruction, destroying it immediately if
    /// the GPU can never have seen it.
    pub(crate) fn delete_when_unused(&self, handle: DeferredHandle) {
        let immediate = self
            .deleter
            .lock()
            .delete_when_unused(handle, &self.timeline);
        if let Some(handle) = immediate {
            unsafe { handle.destroy(&self.raw) };
        }
    }

    /// The command buffer currently open for recording, creating and
    /// beginning one if none is.
    pub(crate) fn pending_command_buffer(&self) -> Result<vk::CommandBuffer, GpuError> {
        let mut state = self.submission.lock();
        if let Some(commands) = state.pending {
            return Ok(commands.buffer);
        }

        let commands = self.acquire_commands(&mut state)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.raw.begin_command_buffer(commands.buffer, &begin_info) }.map_err(|e| {
            GpuError::Internal(format!("vkBeginCommandBuffer failed: {e:?}"))
        })?;

        state.pending = Some(commands);
        Ok(commands.buffer)
    }

    /// Reuse a recycled pool+buffer pair or create a fresh one.
    fn acquire_commands(
        &self,
        state: &mut SubmissionState,
    ) -> Result<CommandPoolAndBuffer, GpuError> {
        if let Some(commands) = state.unused_commands.pop() {
            return Ok(commands);
        }

        let pool_info =
            vk::CommandPoolCreateInfo::default().queue_family_index(self.queue_family);
        let pool = unsafe { self.raw.create_command_pool(&pool_info, None) }.map_err(|e| {
            GpuError::ResourceCreationFailed(format!("vkCreateCommandPool failed: {e:?}"))
        })?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = match unsafe { self.raw.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { self.raw.destroy_command_pool(pool, None) };
                return Err(GpuError::ResourceCreationFailed(format!(
                    "vkAllocateCommandBuffers failed: {e:?}"
                )));
            }
        };

        Ok(CommandPoolAndBuffer { pool, buffer })
    }

    fn acquire_fence(&self, state: &mut SubmissionState) -> Result<vk::Fence, GpuError> {
        if let Some(fence) = state.unused_fences.pop() {
            return Ok(fence);
        }
        let info = vk::FenceCreateInfo::default();
        unsafe { self.raw.create_fence(&info, None) }.map_err(|e| {
            GpuError::ResourceCreationFailed(format!("vkCreateFence failed: {e:?}"))
        })
    }

    /// Submit the pending command buffer, if any.
    ///
    /// The submission gets the pending serial and a fresh fence; a new
    /// recording buffer is opened immediately so callers never observe a
    /// device without one. Returns the assigned serial, or `None` when no
    /// commands were recorded since the last submit.
    pub(crate) fn submit_pending_commands(&self) -> Result<Option<Serial>, GpuError> {
        let mut state = self.submission.lock();
        let Some(commands) = state.pending.take() else {
            return Ok(None);
        };

        unsafe { self.raw.end_command_buffer(commands.buffer) }
            .map_err(|e| GpuError::SubmissionFailed(format!("vkEndCommandBuffer failed: {e:?}")))?;

        let fence = self.acquire_fence(&mut state)?;
        let buffers = [commands.buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&buffers);
        unsafe { self.raw.queue_submit(self.queue, &[submit_info], fence) }.map_err(|e| {
            GpuError::SubmissionFailed(format!("vkQueueSubmit failed: {e:?}"))
        })?;

        let serial = state.tracker.submit(fence, &self.timeline);
        state.commands_in_flight.enqueue(commands, serial);
        log::trace!("submitted commands as serial {serial}");

        // Open the next recording buffer right away.
        let next = self.acquire_commands(&mut state)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.raw.begin_command_buffer(next.buffer, &begin_info) }
            .map_err(|e| GpuError::Internal(format!("vkBeginCommandBuffer failed: {e:?}")))?;
        state.pending = Some(next);

        Ok(Some(serial))
    }

    /// Observe GPU progress and reclaim everything it unblocks.
    pub(crate) fn tick(&self) -> Result<(), GpuError> {
        let mut state = self.submission.lock();

        let retired = state.tracker.poll(&self.timeline, |&fence| {
            unsafe { self.raw.get_fence_status(fence) }
                .map_err(|e| GpuError::Internal(format!("vkGetFenceStatus failed: {e:?}")))
        })?;

        self.recycle(&mut state, retired)?;
        drop(state);

        let completed = self.timeline.completed();
        self.allocator.lock().tick(&self.raw, completed);
        unsafe { self.deleter.lock().tick(&self.raw, completed) };
        Ok(())
    }

    /// Return retired fences and completed command pools to their free lists.
    fn recycle(
        &self,
        state: &mut SubmissionState,
        retired: Vec<vk::Fence>,
    ) -> Result<(), GpuError> {
        if !retired.is_empty() {
            unsafe { self.raw.reset_fences(&retired) }
                .map_err(|e| GpuError::Internal(format!("vkResetFences failed: {e:?}")))?;
            state.unused_fences.extend(retired);
        }

        let completed = self.timeline.completed();
        let finished: Vec<_> = state.commands_in_flight.drain_up_to(completed).collect();
        for commands in finished {
            unsafe {
                self.raw
                    .reset_command_pool(commands.pool, vk::CommandPoolResetFlags::empty())
            }
            .map_err(|e| GpuError::Internal(format!("vkResetCommandPool failed: {e:?}")))?;
            state.unused_commands.push(commands);
        }
        Ok(())
    }

    /// Block until the GPU has finished all submitted work, then reclaim
    /// everything.
    pub(crate) fn wait_idle(&self) -> Result<(), GpuError> {
        unsafe { self.raw.device_wait_idle() }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
            other => GpuError::Internal(format!("vkDeviceWaitIdle failed: {other:?}")),
        })?;

        let mut state = self.submission.lock();
        // The device is idle: every in-flight fence has signaled.
        let retired = state
            .tracker
            .poll(&self.timeline, |_| Ok::<_, GpuError>(true))?;
        self.recycle(&mut state, retired)?;
        drop(state);

        let completed = self.timeline.completed();
        self.allocator.lock().tick(&self.raw, completed);
        unsafe { self.deleter.lock().tick(&self.raw, completed) };
        Ok(())
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.raw.device_wait_idle() {
                log::warn!("device_wait_idle failed during teardown: {:?}", e);
            }

            let mut state = self.submission.lock();
            if let Some(commands) = state.pending.take() {
                self.raw.destroy_command_pool(commands.pool, None);
            }
            let retired = state
                .tracker
                .poll(&self.timeline, |_| Ok::<_, ()>(true))
                .unwrap_or_default();
            for fence in retired {
                self.raw.destroy_fence(fence, None);
            }
            for fence in state.unused_fences.drain(..) {
                self.raw.destroy_fence(fence, None);
            }
            let in_flight: Vec<_> = state.commands_in_flight.drain_all().collect();
            for commands in in_flight.into_iter().chain(state.unused_commands.drain(..)) {
                self.raw.destroy_command_pool(commands.pool, None);
            }
            drop(state);

            self.deleter.lock().drain(&self.raw);
            self.allocator.lock().drain(&self.raw);

            self.raw.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// The public handle to a Vulkan device and its single submission queue.
///
/// Cheap to clone; all clones share the same device state.
#[derive(Clone)]
pub struct VulkanDevice {
    shared: Arc<DeviceShared>,
}

impl VulkanDevice {
    /// Bring up a Vulkan instance, pick a GPU and create the logical device.
    pub fn new(config: &DeviceConfig) -> Result<Self, GpuError> {
        Ok(Self {
            shared: Arc::new(DeviceShared::new(config)?),
        })
    }

    /// The raw `ash` device, for recording commands the core does not wrap.
    pub fn raw(&self) -> &ash::Device {
        self.shared.raw()
    }

    /// The physical device in use.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.shared.physical_device
    }

    /// The command buffer currently open for recording.
    pub fn pending_command_buffer(&self) -> Result<vk::CommandBuffer, GpuError> {
        self.shared.pending_command_buffer()
    }

    /// Submit the pending command buffer; returns its serial, or `None` when
    /// nothing was recorded.
    pub fn submit_pending_commands(&self) -> Result<Option<Serial>, GpuError> {
        self.shared.submit_pending_commands()
    }

    /// Poll fences, advance the completed watermark and reclaim resources.
    pub fn tick(&self) -> Result<(), GpuError> {
        self.shared.tick()
    }

    /// Block until all submitted work completes, then reclaim resources.
    pub fn wait_idle(&self) -> Result<(), GpuError> {
        self.shared.wait_idle()
    }

    /// Serial of the most recent submission.
    pub fn last_submitted_serial(&self) -> Serial {
        self.shared.timeline().last_submitted()
    }

    /// Watermark of completed GPU work.
    pub fn completed_serial(&self) -> Serial {
        self.shared.timeline().completed()
    }

    /// Create a texture per `descriptor`.
    pub fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<VulkanTexture, GpuError> {
        VulkanTexture::create(Arc::clone(&self.shared), descriptor)
    }

    /// Create a buffer per `descriptor`.
    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<VulkanBuffer, GpuError> {
        VulkanBuffer::create(Arc::clone(&self.shared), descriptor)
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("last_submitted", &self.last_submitted_serial())
            .field("completed", &self.completed_serial())
            .finish_non_exhaustive()
    }
}
