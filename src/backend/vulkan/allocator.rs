//! Device memory suballocation.
//!
//! Creating a `VkDeviceMemory` object per resource is expensive, so the
//! allocator carves resource memory out of fixed-size blocks, one block list
//! per Vulkan memory type. Regions freed by dying resources are tagged with
//! the pending submission's serial and only returned to the free lists once
//! that serial completes; a block whose regions are all free again is
//! released back to the driver.

use ash::vk;

use crate::error::GpuError;
use crate::serial::{Serial, SerialQueue};

/// Default suballocation block size.
///
/// Large enough to amortize `vkAllocateMemory`, small enough to keep
/// fragmentation waste bounded. Requests larger than this get a dedicated
/// block.
const DEFAULT_BLOCK_SIZE: u64 = 4 << 20;

/// The raw device-memory operations the allocator drives.
///
/// Implemented for [`ash::Device`]; the allocator itself never talks to the
/// driver through anything else.
pub trait MemoryDevice {
    /// Allocate a raw device memory object.
    ///
    /// # Safety
    ///
    /// `memory_type_index` must be a valid index for the device.
    unsafe fn allocate_device_memory(
        &self,
        size: u64,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, GpuError>;

    /// Free a raw device memory object.
    ///
    /// # Safety
    ///
    /// `memory` must come from [`allocate_device_memory`] on the same device
    /// and no longer back any live resource.
    ///
    /// [`allocate_device_memory`]: MemoryDevice::allocate_device_memory
    unsafe fn free_device_memory(&self, memory: vk::DeviceMemory);
}

impl MemoryDevice for ash::Device {
    unsafe fn allocate_device_memory(
        &self,
        size: u64,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, GpuError> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { self.allocate_memory(&info, None) }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                GpuError::OutOfMemory
            }
            other => {
                GpuError::ResourceCreationFailed(format!("vkAllocateMemory failed: {other:?}"))
            }
        })
    }

    unsafe fn free_device_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.free_memory(memory, None) };
    }
}

/// A region of device memory bound to one resource.
///
/// Owned exclusively by that resource until handed back through
/// [`MemoryAllocator::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAllocation {
    memory: vk::DeviceMemory,
    offset: u64,
    size: u64,
}

impl MemoryAllocation {
    /// The backing memory object, for `vkBind*Memory`.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Byte offset of the region inside the backing memory object.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    offset: u64,
    size: u64,
}

impl Region {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Free-region tracking for one memory block.
///
/// Regions are kept sorted by offset and coalesced on free; allocation is
/// best-fit over the free regions and never returns overlapping ranges.
#[derive(Debug)]
struct BlockFreeList {
    size: u64,
    free: Vec<Region>,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

impl BlockFreeList {
    fn new(size: u64) -> Self {
        Self {
            size,
            free: vec![Region { offset: 0, size }],
        }
    }

    /// Reserve `size` bytes at the given alignment, returning the offset.
    fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        // Best fit: the smallest free region the aligned request still fits.
        let mut best: Option<(usize, u64)> = None;
        for (index, region) in self.free.iter().enumerate() {
            let aligned = align_up(region.offset, alignment);
            if aligned + size > region.end() {
                continue;
            }
            if best.map_or(true, |(b, _)| region.size < self.free[b].size) {
                best = Some((index, aligned));
            }
        }

        let (index, aligned) = best?;
        let region = self.free.remove(index);
        let tail = Region {
            offset: aligned + size,
            size: region.end() - (aligned + size),
        };
        if tail.size > 0 {
            self.free.insert(index, tail);
        }
        // Alignment padding in front of the allocation stays on the free list.
        let head = Region {
            offset: region.offset,
            size: aligned - region.offset,
        };
        if head.size > 0 {
            self.free.insert(index, head);
        }
        Some(aligned)
    }

    /// Return a region to the free list, coalescing with neighbors.
    fn free(&mut self, offset: u64, size: u64) {
        let index = self.free.partition_point(|r| r.offset < offset);
        debug_assert!(
            index == 0 || self.free[index - 1].end() <= offset,
            "double free or overlapping free"
        );
        debug_assert!(
            index == self.free.len() || offset + size <= self.free[index].offset,
            "double free or overlapping free"
        );

        self.free.insert(index, Region { offset, size });
        // Merge with the following region, then the preceding one.
        if index + 1 < self.free.len() && self.free[index].end() == self.free[index + 1].offset {
            self.free[index].size += self.free[index + 1].size;
            self.free.remove(index + 1);
        }
        if index > 0 && self.free[index - 1].end() == self.free[index].offset {
            self.free[index - 1].size += self.free[index].size;
            self.free.remove(index);
        }
    }

    fn is_fully_free(&self) -> bool {
        self.free.len() == 1 && self.free[0].size == self.size
    }

    fn free_bytes(&self) -> u64 {
        self.free.iter().map(|r| r.size).sum()
    }
}

#[derive(Debug)]
struct MemoryBlock {
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    free_list: BlockFreeList,
}

/// Suballocates device memory for resources and reclaims regions once the
/// GPU is done with them.
#[derive(Debug)]
pub struct MemoryAllocator {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    block_size: u64,
    blocks: Vec<MemoryBlock>,
    released: SerialQueue<MemoryAllocation>,
}

impl MemoryAllocator {
    /// Create an allocator for a device with the given memory properties.
    pub fn new(memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self::with_block_size(memory_properties, DEFAULT_BLOCK_SIZE)
    }

    /// Create an allocator with an explicit block size.
    pub fn with_block_size(
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        block_size: u64,
    ) -> Self {
        Self {
            memory_properties,
            block_size,
            blocks: Vec::new(),
            released: SerialQueue::new(),
        }
    }

    /// Pick a memory type compatible with `requirements`.
    ///
    /// Mappable allocations need host-visible, host-coherent memory; others
    /// prefer device-local but accept any compatible type.
    fn find_memory_type(
        &self,
        requirements: &vk::MemoryRequirements,
        mappable: bool,
    ) -> Option<u32> {
        let required = if mappable {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };

        let candidates = (0..self.memory_properties.memory_type_count).filter(|&i| {
            requirements.memory_type_bits & (1 << i) != 0
        });
        let mut fallback = None;
        for i in candidates {
            let flags = self.memory_properties.memory_types[i as usize].property_flags;
            if flags.contains(required) {
                return Some(i);
            }
            if !mappable && fallback.is_none() {
                fallback = Some(i);
            }
        }
        fallback
    }

    /// Reserve a region of device memory satisfying `requirements`.
    ///
    /// Fails only when no compatible memory type exists or the driver is out
    /// of memory; there is no partial allocation and no retry.
    pub fn allocate(
        &mut self,
        device: &impl MemoryDevice,
        requirements: vk::MemoryRequirements,
        mappable: bool,
    ) -> Result<MemoryAllocation, GpuError> {
        let memory_type_index = self
            .find_memory_type(&requirements, mappable)
            .ok_or(GpuError::OutOfMemory)?;

        // Try the existing blocks of this type first.
        for block in &mut self.blocks {
            if block.memory_type_index != memory_type_index {
                continue;
            }
            if let Some(offset) = block
                .free_list
                .allocate(requirements.size, requirements.alignment)
            {
                return Ok(MemoryAllocation {
                    memory: block.memory,
                    offset,
                    size: requirements.size,
                });
            }
        }

        // No room anywhere: bring up a new block. Oversized requests get a
        // block of their own exact size.
        let block_size = self.block_size.max(requirements.size);
        let memory = unsafe { device.allocate_device_memory(block_size, memory_type_index)? };
        log::debug!(
            "allocated new {block_size} byte memory block (type {memory_type_index})"
        );

        let mut free_list = BlockFreeList::new(block_size);
        let offset = free_list
            .allocate(requirements.size, requirements.alignment)
            .ok_or_else(|| {
                GpuError::Internal("fresh memory block cannot satisfy its first request".into())
            })?;
        self.blocks.push(MemoryBlock {
            memory,
            memory_type_index,
            free_list,
        });

        Ok(MemoryAllocation {
            memory,
            offset,
            size: requirements.size,
        })
    }

    /// Give up a region, to be reclaimed once `tag` completes.
    ///
    /// `tag` is the serial of the pending submission: the last one that could
    /// reference the region. The region returns to its block's free list at
    /// the corresponding [`tick`]; the backing block is only released to the
    /// driver when every one of its regions is free.
    ///
    /// [`tick`]: MemoryAllocator::tick
    pub fn free(&mut self, allocation: MemoryAllocation, tag: Serial) {
        self.released.enqueue(allocation, tag);
    }

    /// Reclaim every region whose tag is ≤ `completed` and release blocks
    /// that became fully free.
    pub fn tick(&mut self, device: &impl MemoryDevice, completed: Serial) {
        for allocation in self.released.drain_up_to(completed) {
            let block = self
                .blocks
                .iter_mut()
                .find(|b| b.memory == allocation.memory)
                .expect("freed allocation does not belong to any block");
            block.free_list.free(allocation.offset, allocation.size);
        }

        self.blocks.retain(|block| {
            if block.free_list.is_fully_free() {
                unsafe { device.free_device_memory(block.memory) };
                false
            } else {
                true
            }
        });
    }

    /// Reclaim everything and release all blocks, regardless of serials.
    ///
    /// # Safety
    ///
    /// The device must be idle and no live resource may still be bound to
    /// any region.
    pub unsafe fn drain(&mut self, device: &impl MemoryDevice) {
        let _ = self.released.drain_all();
        for block in self.blocks.drain(..) {
            unsafe { device.free_device_memory(block.memory) };
        }
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Free bytes across all blocks (excluding regions pending reclamation).
    pub fn free_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.free_list.free_bytes()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::{Cell, RefCell};

    #[test]
    fn test_free_list_alloc_free_restores_capacity() {
        let mut list = BlockFreeList::new(1024);
        let offset = list.allocate(256, 16).unwrap();
        assert_eq!(list.free_bytes(), 768);
        list.free(offset, 256);
        assert_eq!(list.free_bytes(), 1024);
        assert!(list.is_fully_free());
    }

    #[test]
    fn test_free_list_never_overlaps() {
        let mut list = BlockFreeList::new(1024);
        let a = list.allocate(100, 64).unwrap();
        let b = list.allocate(100, 64).unwrap();
        assert!(a + 100 <= b || b + 100 <= a);
        assert_eq!(a % 64, 0);
        assert_eq!(b % 64, 0);
    }

    #[test]
    fn test_free_list_respects_alignment_padding() {
        let mut list = BlockFreeList::new(1024);
        // Leave the list with an unaligned free region start.
        let a = list.allocate(10, 1).unwrap();
        assert_eq!(a, 0);
        let b = list.allocate(64, 64).unwrap();
        assert_eq!(b % 64, 0);
        // The padding between 10 and 64 must still be allocatable.
        let c = list.allocate(32, 2).unwrap();
        assert!(c >= 10 && c + 32 <= 64);
    }

    #[test]
    fn test_free_list_coalesces_neighbors() {
        let mut list = BlockFreeList::new(1024);
        let a = list.allocate(256, 1).unwrap();
        let b = list.allocate(256, 1).unwrap();
        let c = list.allocate(256, 1).unwrap();
        list.free(a, 256);
        list.free(c, 256);
        list.free(b, 256);
        assert!(list.is_fully_free());
        // A fully coalesced list can satisfy a block-sized request again.
        assert_eq!(list.allocate(1024, 1), Some(0));
    }

    #[test]
    fn test_free_list_best_fit_prefers_snug_region() {
        let mut list = BlockFreeList::new(1024);
        let a = list.allocate(64, 1).unwrap(); // [0, 64)
        let _b = list.allocate(512, 1).unwrap(); // [64, 576)
        list.free(a, 64); // free: [0, 64) and [576, 1024)
        let c = list.allocate(64, 1).unwrap();
        assert_eq!(c, 0, "best fit should reuse the snug 64 byte hole");
    }

    // Records raw-memory traffic so allocator behavior is observable without
    // a driver.
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

    fn single_type_properties() -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 1,
            ..Default::default()
        };
        properties.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        };
        properties
    }

    fn requirements(size: u64, alignment: u64) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits: 0b1,
        }
    }

    #[test]
    fn test_two_allocations_share_a_block_without_overlap() {
        let device = RecordingDevice::default();
        let mut allocator = MemoryAllocator::with_block_size(single_type_properties(), 4096);

        let a = allocator
            .allocate(&device, requirements(1024, 256), false)
            .unwrap();
        let b = allocator
            .allocate(&device, requirements(1024, 256), false)
            .unwrap();

        assert_eq!(allocator.block_count(), 1);
        assert_eq!(a.memory(), b.memory());
        assert!(a.offset() + a.size() <= b.offset() || b.offset() + b.size() <= a.offset());
    }

    #[test]
    fn test_free_is_deferred_until_tick() {
        let device = RecordingDevice::default();
        let mut allocator = MemoryAllocator::with_block_size(single_type_properties(), 4096);

        let a = allocator
            .allocate(&device, requirements(4096, 1), false)
            .unwrap();
        let before = allocator.free_bytes();
        allocator.free(a, Serial::from_raw(2));

        // Serial 2 has not completed: the region must stay reserved.
        allocator.tick(&device, Serial::from_raw(1));
        assert_eq!(allocator.free_bytes(), before);
        assert_eq!(allocator.block_count(), 1);

        // Completion reclaims the region; the fully free block is released.
        allocator.tick(&device, Serial::from_raw(2));
        assert_eq!(allocator.block_count(), 0);
        assert_eq!(device.freed.borrow().len(), 1);
    }

    #[test]
    fn test_alloc_free_tick_leaves_capacity_unchanged() {
        let device = RecordingDevice::default();
        let mut allocator = MemoryAllocator::with_block_size(single_type_properties(), 8192);

        // A second allocation keeps the block alive across the tick.
        let _keep = allocator
            .allocate(&device, requirements(512, 1), false)
            .unwrap();
        let capacity = allocator.free_bytes();

        let a = allocator
            .allocate(&device, requirements(1024, 1), false)
            .unwrap();
        allocator.free(a, Serial::from_raw(1));
        allocator.tick(&device, Serial::from_raw(1));

        assert_eq!(allocator.free_bytes(), capacity);
        assert_eq!(allocator.block_count(), 1);
    }

    #[test]
    fn test_oversized_request_creates_new_block() {
        let device = RecordingDevice::default();
        let mut allocator = MemoryAllocator::with_block_size(single_type_properties(), 4096);

        let small = allocator
            .allocate(&device, requirements(1024, 1), false)
            .unwrap();
        // Larger than any existing free region: must grow, not fail.
        let big = allocator
            .allocate(&device, requirements(16384, 1), false)
            .unwrap();

        assert_eq!(allocator.block_count(), 2);
        assert_ne!(small.memory(), big.memory());
        assert_eq!(big.size(), 16384);
    }

    #[test]
    fn test_no_compatible_memory_type_is_out_of_memory() {
        let device = RecordingDevice::default();
        let mut allocator = MemoryAllocator::new(single_type_properties());

        let incompatible = vk::MemoryRequirements {
            size: 64,
            alignment: 1,
            memory_type_bits: 0b10, // only type 1, which does not exist
        };
        assert_eq!(
            allocator.allocate(&device, incompatible, false),
            Err(GpuError::OutOfMemory)
        );
    }
}
