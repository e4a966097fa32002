//! Driver-free lifecycle tests.
//!
//! Exercises the timeline, submission tracking, deferred destruction and
//! memory reclamation together, with plain integers standing in for fences
//! and raw handle values standing in for driver objects.

use ash::vk::{self, Handle};

use gpu_hal::backend::vulkan::allocator::{MemoryAllocator, MemoryDevice};
use gpu_hal::backend::vulkan::deleter::{DeferredHandle, FencedDeleter};
use gpu_hal::backend::vulkan::submission::{SubmissionTracker, Timeline};
use gpu_hal::{GpuError, Serial};

use std::cell::{Cell, RefCell};

#[derive(Default)]
struct RecordingDevice {
    next_handle: Cell<u64>,
    freed: RefCell<Vec<vk::DeviceMemory>>,
}

impl MemoryDevice for RecordingDevice {
    unsafe fn allocate_device_memory(
        &self,
        _size: u64,
        _memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, GpuError> {
        let raw = self.next_handle.get() + 1;
        self.next_handle.set(raw);
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    unsafe fn free_device_memory(&self, memory: vk::DeviceMemory) {
        self.freed.borrow_mut().push(memory);
    }
}

fn memory_properties() -> vk::PhysicalDeviceMemoryProperties {
    let mut properties = vk::PhysicalDeviceMemoryProperties {
        memory_type_count: 1,
        ..Default::default()
    };
    properties.memory_types[0] = vk::MemoryType {
        property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        heap_index: 0,
    };
    properties
}

fn requirements(size: u64) -> vk::MemoryRequirements {
    vk::MemoryRequirements {
        size,
        alignment: 256,
        memory_type_bits: 0b1,
    }
}

#[test]
fn handle_dropped_before_first_submission_is_destroyed_immediately() {
    let timeline = Timeline::new();
    let mut deleter = FencedDeleter::new();

    let handle = DeferredHandle::Image(vk::Image::from_raw(42));
    // Nothing was ever submitted: the GPU cannot reference the handle.
    assert_eq!(deleter.delete_when_unused(handle, &timeline), Some(handle));
    assert_eq!(deleter.pending_count(), 0);
}

#[test]
fn serials_advance_and_complete_in_submission_order() {
    let timeline = Timeline::new();
    let mut tracker: SubmissionTracker<u32> = SubmissionTracker::new();

    assert_eq!(tracker.submit(0, &timeline), Serial::from_raw(1));
    assert_eq!(tracker.submit(1, &timeline), Serial::from_raw(2));
    assert_eq!(tracker.submit(2, &timeline), Serial::from_raw(3));
    assert_eq!(timeline.last_submitted(), Serial::from_raw(3));
    assert_eq!(timeline.completed(), Serial::ZERO);

    // Only the first two fences have signaled. The poll must stop at the
    // third and report exactly serial 2 as the watermark.
    let retired = tracker
        .poll(&timeline, |&fence| Ok::<_, ()>(fence < 2))
        .unwrap();
    assert_eq!(retired, vec![0, 1]);
    assert_eq!(timeline.completed(), Serial::from_raw(2));
}

#[test]
fn dropped_resource_is_reclaimed_exactly_when_its_serial_completes() {
    let timeline = Timeline::new();
    let mut tracker: SubmissionTracker<u32> = SubmissionTracker::new();
    let mut deleter = FencedDeleter::new();
    let device = RecordingDevice::default();
    let mut allocator = MemoryAllocator::with_block_size(memory_properties(), 4096);

    // A resource created, used by submission 1, then dropped while
    // submission 2 is still recording.
    let allocation = allocator.allocate(&device, requirements(4096), false).unwrap();
    tracker.submit(0, &timeline); // serial 1

    let image = DeferredHandle::Image(vk::Image::from_raw(7));
    assert!(deleter.delete_when_unused(image, &timeline).is_none());
    allocator.free(allocation, timeline.pending_serial());
    let tag = timeline.pending_serial();
    assert_eq!(tag, Serial::from_raw(2));

    // Serial 1 completes. The drop was tagged with serial 2, so nothing may
    // be reclaimed yet.
    tracker.poll(&timeline, |_| Ok::<_, ()>(true)).unwrap();
    assert_eq!(timeline.completed(), Serial::from_raw(1));
    allocator.tick(&device, timeline.completed());
    assert_eq!(deleter.pending_count(), 1);
    assert_eq!(allocator.block_count(), 1);
    assert!(device.freed.borrow().is_empty());

    // The tagged submission happens and completes; now everything goes.
    tracker.submit(1, &timeline); // serial 2
    tracker.poll(&timeline, |_| Ok::<_, ()>(true)).unwrap();
    assert_eq!(timeline.completed(), Serial::from_raw(2));
    allocator.tick(&device, timeline.completed());
    assert_eq!(allocator.block_count(), 0);
    assert_eq!(device.freed.borrow().len(), 1);
    // The queued handle's tag is now at or below the watermark, so the next
    // deleter tick on the real device would destroy it.
    assert_eq!(deleter.oldest_serial(), Some(Serial::from_raw(2)));
    assert!(deleter.oldest_serial().unwrap() <= timeline.completed());
}

#[test]
fn allocator_reuses_reclaimed_regions() {
    let timeline = Timeline::new();
    let mut tracker: SubmissionTracker<u32> = SubmissionTracker::new();
    let device = RecordingDevice::default();
    let mut allocator = MemoryAllocator::with_block_size(memory_properties(), 8192);

    let keep = allocator.allocate(&device, requirements(1024), false).unwrap();
    let dead = allocator.allocate(&device, requirements(1024), false).unwrap();
    assert_eq!(allocator.block_count(), 1);

    tracker.submit(0, &timeline);
    allocator.free(dead, timeline.pending_serial());
    tracker.submit(1, &timeline);
    tracker.poll(&timeline, |_| Ok::<_, ()>(true)).unwrap();
    allocator.tick(&device, timeline.completed());

    // The reclaimed region satisfies a new request without a second block.
    let reused = allocator.allocate(&device, requirements(1024), false).unwrap();
    assert_eq!(allocator.block_count(), 1);
    assert_eq!(reused.memory(), keep.memory());
}
