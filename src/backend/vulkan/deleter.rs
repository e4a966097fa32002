//! Fenced deferred destruction of Vulkan handles.
//!
//! The GPU executes submitted work long after the owning Rust value has been
//! dropped, so raw driver handles cannot be destroyed in `Drop`. Instead they
//! are tagged with the serial of the *next* submission — the last one that
//! could possibly reference them — and destroyed once the device observes
//! that serial as completed.

use ash::vk;

use crate::serial::{Serial, SerialQueue};

use super::submission::Timeline;

/// A raw Vulkan handle awaiting destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredHandle {
    /// An image handle.
    Image(vk::Image),
    /// An image view handle.
    ImageView(vk::ImageView),
    /// A buffer handle.
    Buffer(vk::Buffer),
    /// A sampler handle.
    Sampler(vk::Sampler),
    /// A semaphore handle.
    Semaphore(vk::Semaphore),
    /// A fence handle.
    Fence(vk::Fence),
    /// A command pool handle.
    CommandPool(vk::CommandPool),
}

impl DeferredHandle {
    /// Destroy the underlying driver object.
    ///
    /// # Safety
    ///
    /// The GPU must no longer reference the handle, and the handle must not
    /// be destroyed twice.
    pub unsafe fn destroy(self, device: &ash::Device) {
        unsafe {
            match self {
                Self::Image(image) => device.destroy_image(image, None),
                Self::ImageView(view) => device.destroy_image_view(view, None),
                Self::Buffer(buffer) => device.destroy_buffer(buffer, None),
                Self::Sampler(sampler) => device.destroy_sampler(sampler, None),
                Self::Semaphore(semaphore) => device.destroy_semaphore(semaphore, None),
                Self::Fence(fence) => device.destroy_fence(fence, None),
                Self::CommandPool(pool) => device.destroy_command_pool(pool, None),
            }
        }
    }
}

/// Records handles whose owners died while GPU work may still reference them,
/// and destroys them once that work has provably finished.
#[derive(Debug, Default)]
pub struct FencedDeleter {
    pending: SerialQueue<DeferredHandle>,
}

impl FencedDeleter {
    /// Create a deleter with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `handle` for destruction after the pending submission completes.
    ///
    /// The handle is tagged with the serial the pending submission will
    /// receive, which is guaranteed not to have completed yet. If nothing was
    /// ever submitted the GPU cannot reference the handle, so it is handed
    /// back to the caller for immediate destruction instead of being queued.
    #[must_use = "a returned handle was never used by the GPU and must be destroyed by the caller"]
    pub fn delete_when_unused(
        &mut self,
        handle: DeferredHandle,
        timeline: &Timeline,
    ) -> Option<DeferredHandle> {
        if timeline.last_submitted().is_zero() {
            return Some(handle);
        }
        debug_assert!(timeline.pending_serial() > timeline.completed());
        self.pending.enqueue(handle, timeline.pending_serial());
        None
    }

    /// Destroy every queued handle whose tag is ≤ `completed`.
    ///
    /// # Safety
    ///
    /// `completed` must not exceed the serial of the last submission the GPU
    /// has actually finished.
    pub unsafe fn tick(&mut self, device: &ash::Device, completed: Serial) {
        for handle in self.pending.drain_up_to(completed) {
            unsafe { handle.destroy(device) };
        }
    }

    /// Destroy every queued handle regardless of tag.
    ///
    /// # Safety
    ///
    /// The device must be idle (e.g. after `vkDeviceWaitIdle`).
    pub unsafe fn drain(&mut self, device: &ash::Device) {
        let count = self.pending.len();
        for handle in self.pending.drain_all() {
            unsafe { handle.destroy(device) };
        }
        if count > 0 {
            log::debug!("destroyed {count} deferred handles at teardown");
        }
    }

    /// Number of handles still awaiting destruction.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The tag of the oldest queued handle.
    pub fn oldest_serial(&self) -> Option<Serial> {
        self.pending.first_serial()
    }

    #[cfg(test)]
    fn drain_collect(&mut self, completed: Serial) -> Vec<DeferredHandle> {
        self.pending.drain_up_to(completed).collect()
    }
}
