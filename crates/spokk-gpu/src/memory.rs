//! Device memory blocks and allocations.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

/// Lifetime hint for an allocation.
///
/// Frame-scoped memory is only valid while one pipelined frame is in flight;
/// device-scoped memory lives until it is explicitly freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AllocationScope {
    Frame,
    #[default]
    Device,
}

/// Parameters of a device memory allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest {
    pub requirements: vk::MemoryRequirements,
    pub properties: vk::MemoryPropertyFlags,
    pub scope: AllocationScope,
    /// Whether the memory will back a buffer or a linear-tiled image.
    pub linear: bool,
}

impl AllocationRequest {
    pub fn new(requirements: vk::MemoryRequirements, properties: vk::MemoryPropertyFlags) -> Self {
        Self {
            requirements,
            properties,
            scope: AllocationScope::Device,
            linear: true,
        }
    }

    pub fn with_scope(mut self, scope: AllocationScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_linear(mut self, linear: bool) -> Self {
        self.linear = linear;
        self
    }
}

/// One device memory object, mapped for its whole lifetime if its memory
/// type is host-visible.
pub struct DeviceMemoryBlock {
    device: Arc<dyn GpuDevice>,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    mapped: Option<NonNull<u8>>,
}

// SAFETY: the mapping is owned by this block and stays valid until the block
// is freed. Host writes through it require `&mut` on the owning allocation.
unsafe impl Send for DeviceMemoryBlock {}
// SAFETY: shared references only expose the pointer value, never the bytes.
unsafe impl Sync for DeviceMemoryBlock {}

impl DeviceMemoryBlock {
    /// Allocate `size` bytes from a memory type.
    ///
    /// Host-visible memory is mapped in full. If the mapping fails the memory
    /// is released before the error is returned.
    pub fn allocate(
        device: &Arc<dyn GpuDevice>,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> Result<Self> {
        let memory = device.allocate_memory(size, memory_type_index)?;

        let mapped = if device.memory_types().is_host_visible(memory_type_index) {
            match device.map_memory(memory) {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    device.free_memory(memory);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        tracing::trace!(
            size,
            memory_type_index,
            mapped = mapped.is_some(),
            "Allocated device memory block"
        );

        Ok(Self {
            device: Arc::clone(device),
            memory,
            size,
            memory_type_index,
            mapped,
        })
    }

    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Host address of the start of the block, if mapped.
    pub fn mapped(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Release the memory now. Dropping the block has the same effect.
    pub fn free(self) {
        drop(self);
    }
}

impl Drop for DeviceMemoryBlock {
    fn drop(&mut self) {
        // Freeing implicitly unmaps.
        self.device.free_memory(self.memory);
        tracing::trace!(size = self.size, "Freed device memory block");
    }
}

impl std::fmt::Debug for DeviceMemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemoryBlock")
            .field("memory", &self.memory)
            .field("size", &self.size)
            .field("memory_type_index", &self.memory_type_index)
            .field("mapped", &self.mapped.is_some())
            .finish()
    }
}

/// Identifies a range handed out by a pooling allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubAllocation {
    /// Arena slot of the owning block.
    pub block: u32,
    /// Unique id of the range within its block.
    pub id: u64,
}

/// Where an allocation's memory came from and who gets it back.
#[derive(Debug)]
pub enum AllocationOrigin {
    /// The allocation owns its block outright.
    Dedicated(DeviceMemoryBlock),
    /// A range inside a block owned by a pooling allocator.
    SubAllocated(SubAllocation),
    /// An allocation made through gpu-allocator.
    Managed(gpu_allocator::vulkan::Allocation),
}

/// A `(memory, offset, size)` range with an optional host mapping.
///
/// Move-only. Return it to the allocator that produced it; dropping a
/// dedicated allocation frees its block, dropping any other kind leaks the
/// range until the owning allocator is destroyed.
#[derive(Debug)]
pub struct DeviceMemoryAllocation {
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    block_size: vk::DeviceSize,
    memory_type_index: u32,
    mapped: Option<NonNull<u8>>,
    // nonCoherentAtomSize flush and invalidate ranges are rounded to.
    atom_size: vk::DeviceSize,
    origin: AllocationOrigin,
}

// SAFETY: see `DeviceMemoryBlock`. Host access to the mapped range requires
// `&mut self`.
unsafe impl Send for DeviceMemoryAllocation {}
// SAFETY: `&self` only hands out shared byte views.
unsafe impl Sync for DeviceMemoryAllocation {}

impl DeviceMemoryAllocation {
    /// An allocation spanning all of `block`.
    pub fn dedicated(block: DeviceMemoryBlock) -> Self {
        Self {
            memory: block.handle(),
            offset: 0,
            size: block.size(),
            block_size: block.size(),
            memory_type_index: block.memory_type_index(),
            mapped: block.mapped(),
            atom_size: 1,
            origin: AllocationOrigin::Dedicated(block),
        }
    }

    /// An allocation covering `range` of a block owned elsewhere. `range`
    /// must lie within the block.
    pub fn sub_allocated(
        block: &DeviceMemoryBlock,
        range: Range<vk::DeviceSize>,
        handle: SubAllocation,
    ) -> Result<Self> {
        if range.start > range.end || range.end > block.size() {
            return Err(GpuError::InvalidAllocation(format!(
                "sub-allocation {range:?} exceeds block of {} bytes",
                block.size()
            )));
        }
        let mapped = block.mapped().map(|ptr| {
            // SAFETY: `range.start` is within the mapped block.
            unsafe { NonNull::new_unchecked(ptr.as_ptr().add(range.start as usize)) }
        });
        Ok(Self {
            memory: block.handle(),
            offset: range.start,
            size: range.end - range.start,
            block_size: block.size(),
            memory_type_index: block.memory_type_index(),
            mapped,
            atom_size: 1,
            origin: AllocationOrigin::SubAllocated(handle),
        })
    }

    /// Wrap a gpu-allocator allocation.
    ///
    /// gpu-allocator does not expose the size of the memory object behind an
    /// allocation, so the recorded block extent ends with the allocation and
    /// flush ranges are never widened to `WHOLE_SIZE`. The allocator must
    /// reserve host-visible ranges in whole atoms (see
    /// [`Self::with_atom_size`]).
    pub fn managed(allocation: gpu_allocator::vulkan::Allocation, memory_type_index: u32) -> Self {
        // SAFETY: the memory handle is only used for binding and range flushes
        // while the allocation is alive.
        let memory = unsafe { allocation.memory() };
        let offset = allocation.offset();
        let size = allocation.size();
        let mapped = allocation.mapped_ptr().map(NonNull::cast::<u8>);
        Self {
            memory,
            offset,
            size,
            block_size: offset + size,
            memory_type_index,
            mapped,
            atom_size: 1,
            origin: AllocationOrigin::Managed(allocation),
        }
    }

    /// Round flush and invalidate ranges to multiples of `atom_size`
    /// (`nonCoherentAtomSize`).
    #[must_use]
    pub fn with_atom_size(mut self, atom_size: vk::DeviceSize) -> Self {
        self.atom_size = atom_size.max(1);
        self
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn range(&self) -> Range<vk::DeviceSize> {
        self.offset..self.offset + self.size
    }

    /// Size of the underlying memory object.
    pub fn block_size(&self) -> vk::DeviceSize {
        self.block_size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Host address of `offset`, if the memory is mapped.
    pub fn mapped(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    pub fn is_host_visible(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn origin(&self) -> &AllocationOrigin {
        &self.origin
    }

    /// Give up the allocation and return its origin to the allocator.
    pub fn into_origin(self) -> AllocationOrigin {
        self.origin
    }

    /// Host view of the allocation.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.mapped.map(|ptr| {
            // SAFETY: the mapping covers `size` bytes from `ptr` for as long as
            // the allocation lives, and `&self` excludes host writers.
            unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size as usize) }
        })
    }

    /// Mutable host view of the allocation.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        self.mapped.map(|ptr| {
            // SAFETY: as in `bytes`, with `&mut self` guaranteeing exclusivity.
            unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize) }
        })
    }

    /// Make host writes to the range visible to the device. No-op when the
    /// allocation is not mapped.
    pub fn flush(&self, device: &dyn GpuDevice) -> Result<()> {
        if self.mapped.is_some() {
            let (offset, size) = self.flush_range();
            device.flush_mapped_range(self.memory, offset, size)?;
        }
        Ok(())
    }

    /// Make device writes to the range visible to the host. No-op when the
    /// allocation is not mapped.
    pub fn invalidate(&self, device: &dyn GpuDevice) -> Result<()> {
        if self.mapped.is_some() {
            let (offset, size) = self.flush_range();
            device.invalidate_mapped_range(self.memory, offset, size)?;
        }
        Ok(())
    }

    fn flush_range(&self) -> (vk::DeviceSize, vk::DeviceSize) {
        let block_size = match self.origin {
            AllocationOrigin::Managed(_) => None,
            _ => Some(self.block_size),
        };
        atom_aligned_range(self.offset, self.size, block_size, self.atom_size)
    }
}

/// Widen `offset..offset + size` to whole atoms.
///
/// A range that reaches the end of a block of known size becomes
/// `WHOLE_SIZE`, which is valid whatever the block's length.
pub(crate) fn atom_aligned_range(
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    block_size: Option<vk::DeviceSize>,
    atom_size: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let atom = atom_size.max(1);
    let start = offset / atom * atom;
    let end = (offset + size).div_ceil(atom) * atom;
    match block_size {
        Some(block_size) if end >= block_size => (start, vk::WHOLE_SIZE),
        _ => (start, end - start),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeDevice, FailPoint};

    fn fake() -> (Arc<FakeDevice>, Arc<dyn GpuDevice>) {
        let fake = Arc::new(FakeDevice::new());
        let device: Arc<dyn GpuDevice> = fake.clone();
        (fake, device)
    }

    #[test]
    fn host_visible_blocks_are_mapped() {
        let (fake, device) = fake();
        let host = fake.host_visible_type();
        let block = DeviceMemoryBlock::allocate(&device, 1024, host).unwrap();
        assert!(block.mapped().is_some());
        assert_eq!(block.size(), 1024);
        assert_eq!(block.memory_type_index(), host);
    }

    #[test]
    fn device_local_blocks_are_not_mapped() {
        let (fake, device) = fake();
        let block = DeviceMemoryBlock::allocate(&device, 1024, fake.device_local_type()).unwrap();
        assert!(block.mapped().is_none());
        assert!(!fake.calls().iter().any(|c| matches!(c, Call::MapMemory(_))));
    }

    #[test]
    fn failed_mapping_releases_memory() {
        let (fake, device) = fake();
        fake.inject_failure(FailPoint::MapMemory);
        let result = DeviceMemoryBlock::allocate(&device, 256, fake.host_visible_type());
        assert!(result.is_err());
        assert_eq!(fake.live_memory_count(), 0);
    }

    #[test]
    fn dropping_a_block_frees_it() {
        let (fake, device) = fake();
        let block = DeviceMemoryBlock::allocate(&device, 64, fake.device_local_type()).unwrap();
        assert_eq!(fake.live_memory_count(), 1);
        block.free();
        assert_eq!(fake.live_memory_count(), 0);
        assert!(fake.violations().is_empty());
    }

    #[test]
    fn dedicated_allocation_spans_block() {
        let (fake, device) = fake();
        let block = DeviceMemoryBlock::allocate(&device, 512, fake.host_visible_type()).unwrap();
        let mut allocation = DeviceMemoryAllocation::dedicated(block);
        assert_eq!(allocation.offset(), 0);
        assert_eq!(allocation.size(), allocation.block_size());

        allocation.bytes_mut().unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
        allocation.flush(device.as_ref()).unwrap();
        assert_eq!(&fake.memory_contents(allocation.memory())[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn sub_allocation_maps_at_offset() {
        let (fake, device) = fake();
        let block = DeviceMemoryBlock::allocate(&device, 1024, fake.host_visible_type()).unwrap();
        let handle = SubAllocation { block: 0, id: 7 };
        let mut allocation =
            DeviceMemoryAllocation::sub_allocated(&block, 256..512, handle).unwrap();
        assert_eq!(allocation.size(), 256);
        allocation.bytes_mut().unwrap()[0] = 0xAB;
        assert_eq!(fake.memory_contents(block.handle())[256], 0xAB);

        allocation.flush(device.as_ref()).unwrap();
        assert!(fake.calls().contains(&Call::FlushMappedRange {
            memory: block.handle(),
            offset: 256,
            size: 256,
        }));
    }

    #[test]
    fn sub_allocation_outside_block_is_rejected() {
        let (fake, device) = fake();
        let block = DeviceMemoryBlock::allocate(&device, 1024, fake.host_visible_type()).unwrap();
        let handle = SubAllocation { block: 0, id: 1 };
        assert!(matches!(
            DeviceMemoryAllocation::sub_allocated(&block, 512..2048, handle),
            Err(GpuError::InvalidAllocation(_))
        ));
        #[allow(clippy::reversed_empty_ranges)]
        let reversed = 512..256;
        assert!(DeviceMemoryAllocation::sub_allocated(&block, reversed, handle).is_err());
    }

    #[test]
    fn flush_ranges_are_widened_to_whole_atoms() {
        let (fake, device) = fake();
        let block = DeviceMemoryBlock::allocate(&device, 1024, fake.host_visible_type()).unwrap();
        let handle = |id| SubAllocation { block: 0, id };
        let inner = DeviceMemoryAllocation::sub_allocated(&block, 100..150, handle(1))
            .unwrap()
            .with_atom_size(64);
        let tail = DeviceMemoryAllocation::sub_allocated(&block, 1000..1010, handle(2))
            .unwrap()
            .with_atom_size(64);

        inner.flush(device.as_ref()).unwrap();
        inner.invalidate(device.as_ref()).unwrap();
        tail.flush(device.as_ref()).unwrap();

        let calls = fake.calls();
        assert!(calls.contains(&Call::FlushMappedRange {
            memory: block.handle(),
            offset: 64,
            size: 128,
        }));
        assert!(calls.contains(&Call::InvalidateMappedRange {
            memory: block.handle(),
            offset: 64,
            size: 128,
        }));
        assert!(calls.contains(&Call::FlushMappedRange {
            memory: block.handle(),
            offset: 960,
            size: vk::WHOLE_SIZE,
        }));
    }

    #[test]
    fn unknown_block_extent_is_never_widened_to_whole_size() {
        assert_eq!(atom_aligned_range(256, 100, None, 64), (256, 128));
        assert_eq!(atom_aligned_range(256, 128, None, 64), (256, 128));
        assert_eq!(atom_aligned_range(256, 128, Some(384), 64), (256, vk::WHOLE_SIZE));
        assert_eq!(atom_aligned_range(10, 5, Some(4096), 1), (10, 5));
    }

    #[test]
    fn flush_is_noop_for_unmapped_memory() {
        let (fake, device) = fake();
        let block = DeviceMemoryBlock::allocate(&device, 128, fake.device_local_type()).unwrap();
        let allocation = DeviceMemoryAllocation::dedicated(block);
        allocation.flush(device.as_ref()).unwrap();
        allocation.invalidate(device.as_ref()).unwrap();
        assert!(allocation.bytes().is_none());
        assert!(!fake
            .calls()
            .iter()
            .any(|c| matches!(c, Call::FlushMappedRange { .. } | Call::InvalidateMappedRange { .. })));
    }
}
