//! Allocator policies.
//!
//! A [`DeviceAllocator`] turns an [`AllocationRequest`] into a
//! [`DeviceMemoryAllocation`] and takes it back later. Three policies ship:
//!
//! - [`DedicatedAllocator`]: one memory object per allocation. The default.
//! - [`PoolingAllocator`]: sub-allocates ranges from large blocks kept per
//!   memory type, resource kind, and scope.
//! - [`ManagedAllocator`]: delegates to gpu-allocator.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::memory::{
    AllocationOrigin, AllocationRequest, AllocationScope, DeviceMemoryAllocation,
    DeviceMemoryBlock, SubAllocation,
};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use std::ops::Range;
use std::sync::Arc;

/// A memory allocation policy.
pub trait DeviceAllocator: Send {
    /// Short policy name for logs.
    fn name(&self) -> &'static str;

    /// Allocate memory satisfying `request`.
    fn allocate(
        &mut self,
        device: &Arc<dyn GpuDevice>,
        request: &AllocationRequest,
    ) -> Result<DeviceMemoryAllocation>;

    /// Return an allocation produced by this allocator.
    fn free(
        &mut self,
        device: &Arc<dyn GpuDevice>,
        allocation: DeviceMemoryAllocation,
    ) -> Result<()>;

    /// Reclaim every frame-scoped allocation at once. Policies without frame
    /// pools ignore this.
    fn reset_frame_scope(&mut self) {}

    /// Release cached memory no allocation is using.
    fn trim(&mut self) {}
}

fn select_memory_type(device: &dyn GpuDevice, request: &AllocationRequest) -> Result<u32> {
    device
        .memory_types()
        .find_memory_type_index(request.requirements.memory_type_bits, request.properties)
        .ok_or(GpuError::NoMatchingMemoryType {
            type_bits: request.requirements.memory_type_bits,
            properties: request.properties,
        })
}

const fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

// ---------------------------------------------------------------------------
// Dedicated
// ---------------------------------------------------------------------------

/// One device memory object per allocation.
///
/// Simple and always correct, at the cost of one `vkAllocateMemory` per
/// resource. Drivers cap the number of live allocations, so large scenes
/// should switch to [`PoolingAllocator`].
#[derive(Debug, Default)]
pub struct DedicatedAllocator;

impl DeviceAllocator for DedicatedAllocator {
    fn name(&self) -> &'static str {
        "dedicated"
    }

    fn allocate(
        &mut self,
        device: &Arc<dyn GpuDevice>,
        request: &AllocationRequest,
    ) -> Result<DeviceMemoryAllocation> {
        let memory_type_index = select_memory_type(device.as_ref(), request)?;
        let block =
            DeviceMemoryBlock::allocate(device, request.requirements.size, memory_type_index)?;
        Ok(DeviceMemoryAllocation::dedicated(block))
    }

    fn free(
        &mut self,
        _device: &Arc<dyn GpuDevice>,
        allocation: DeviceMemoryAllocation,
    ) -> Result<()> {
        let (offset, size, block_size) =
            (allocation.offset(), allocation.size(), allocation.block_size());
        match allocation.into_origin() {
            AllocationOrigin::Dedicated(block) => {
                debug_assert_eq!(offset, 0);
                debug_assert_eq!(size, block_size);
                block.free();
                Ok(())
            }
            other => Err(GpuError::InvalidAllocation(format!(
                "dedicated allocator cannot free {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Pooling
// ---------------------------------------------------------------------------

/// Configuration for [`PoolingAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct PoolingAllocatorConfig {
    /// Size of each pool block. Larger requests get a block of their own.
    pub block_size: vk::DeviceSize,
    /// Minimum alignment and size granularity of every range. Keeping this
    /// at or above `nonCoherentAtomSize` makes per-range flushes valid.
    pub min_alignment: vk::DeviceSize,
    /// Release blocks as soon as their last range is freed.
    pub release_empty_blocks: bool,
}

impl Default for PoolingAllocatorConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024 * 1024,
            min_alignment: 256,
            release_empty_blocks: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    memory_type_index: u32,
    linear: bool,
    scope: AllocationScope,
}

struct PoolBlock {
    block: DeviceMemoryBlock,
    key: PoolKey,
    /// Sorted, disjoint, coalesced.
    free_ranges: Vec<Range<vk::DeviceSize>>,
    live: HashMap<u64, Range<vk::DeviceSize>>,
    /// Holds a single request larger than the configured block size.
    oversize: bool,
}

impl PoolBlock {
    fn new(block: DeviceMemoryBlock, key: PoolKey, oversize: bool) -> Self {
        let size = block.size();
        Self {
            block,
            key,
            free_ranges: vec![0..size],
            live: HashMap::new(),
            oversize,
        }
    }

    /// First fit over the free list.
    fn reserve(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<Range<vk::DeviceSize>> {
        let (index, start) = self.free_ranges.iter().enumerate().find_map(|(i, free)| {
            let start = align_up(free.start, alignment);
            (start + size <= free.end).then_some((i, start))
        })?;

        let free = self.free_ranges[index].clone();
        let mut remainder = Vec::with_capacity(2);
        if free.start < start {
            remainder.push(free.start..start);
        }
        if start + size < free.end {
            remainder.push(start + size..free.end);
        }
        self.free_ranges.splice(index..=index, remainder);
        Some(start..start + size)
    }

    fn release(&mut self, range: Range<vk::DeviceSize>) {
        let index = self
            .free_ranges
            .partition_point(|free| free.start < range.start);
        self.free_ranges.insert(index, range);

        // Merge with the successor, then the predecessor.
        if index + 1 < self.free_ranges.len()
            && self.free_ranges[index].end == self.free_ranges[index + 1].start
        {
            let next = self.free_ranges.remove(index + 1);
            self.free_ranges[index].end = next.end;
        }
        if index > 0 && self.free_ranges[index - 1].end == self.free_ranges[index].start {
            let current = self.free_ranges.remove(index);
            self.free_ranges[index - 1].end = current.end;
        }
    }

    fn reset(&mut self) {
        self.live.clear();
        self.free_ranges = vec![0..self.block.size()];
    }

    fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn used_bytes(&self) -> vk::DeviceSize {
        self.live.values().map(|r| r.end - r.start).sum()
    }
}

/// Usage summary of a [`PoolingAllocator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub block_count: usize,
    /// Bytes of device memory held by all blocks.
    pub reserved_bytes: vk::DeviceSize,
    /// Bytes handed out to live allocations.
    pub used_bytes: vk::DeviceSize,
    pub live_allocations: usize,
}

/// Sub-allocates ranges from large blocks.
///
/// Blocks are kept in an arena and never shared between memory types,
/// between linear and optimal resources, or between scopes. Frame-scoped
/// pools can be recycled wholesale with [`Self::reset_frame_scope`].
pub struct PoolingAllocator {
    config: PoolingAllocatorConfig,
    blocks: Vec<Option<PoolBlock>>,
    next_id: u64,
}

impl PoolingAllocator {
    pub fn new(config: PoolingAllocatorConfig) -> Self {
        Self {
            config,
            blocks: Vec::new(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &PoolingAllocatorConfig {
        &self.config
    }

    /// Recycle every frame-scoped block.
    ///
    /// All frame-scoped allocations become invalid. Call only once the GPU
    /// has finished with them, typically after waiting on the fence of the
    /// frame that used them.
    pub fn reset_frame_scope(&mut self) {
        let mut recycled = 0;
        for pool in self.blocks.iter_mut().flatten() {
            if pool.key.scope == AllocationScope::Frame && !pool.is_empty() {
                pool.reset();
                recycled += 1;
            }
        }
        tracing::trace!(recycled, "Reset frame-scoped pools");
    }

    /// Release every block with no live allocations.
    pub fn trim(&mut self) {
        let mut released = 0;
        for slot in &mut self.blocks {
            if slot.as_ref().is_some_and(PoolBlock::is_empty) {
                *slot = None;
                released += 1;
            }
        }
        if released > 0 {
            tracing::debug!(released, "Released empty pool blocks");
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.blocks
            .iter()
            .flatten()
            .fold(PoolStats::default(), |mut stats, pool| {
                stats.block_count += 1;
                stats.reserved_bytes += pool.block.size();
                stats.used_bytes += pool.used_bytes();
                stats.live_allocations += pool.live.len();
                stats
            })
    }

    fn insert_block(&mut self, pool: PoolBlock) -> u32 {
        if let Some(index) = self.blocks.iter().position(Option::is_none) {
            self.blocks[index] = Some(pool);
            index as u32
        } else {
            self.blocks.push(Some(pool));
            (self.blocks.len() - 1) as u32
        }
    }

    fn hand_out(
        &mut self,
        block_index: u32,
        range: Range<vk::DeviceSize>,
    ) -> Result<DeviceMemoryAllocation> {
        let id = self.next_id;
        let pool = self
            .blocks
            .get_mut(block_index as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| GpuError::InvalidState(format!("pool block {block_index} is vacant")))?;
        let allocation = DeviceMemoryAllocation::sub_allocated(
            &pool.block,
            range.clone(),
            SubAllocation {
                block: block_index,
                id,
            },
        )?;
        pool.live.insert(id, range);
        self.next_id += 1;
        Ok(allocation)
    }
}

impl Default for PoolingAllocator {
    fn default() -> Self {
        Self::new(PoolingAllocatorConfig::default())
    }
}

impl DeviceAllocator for PoolingAllocator {
    fn name(&self) -> &'static str {
        "pooling"
    }

    fn allocate(
        &mut self,
        device: &Arc<dyn GpuDevice>,
        request: &AllocationRequest,
    ) -> Result<DeviceMemoryAllocation> {
        let memory_type_index = select_memory_type(device.as_ref(), request)?;
        let key = PoolKey {
            memory_type_index,
            linear: request.linear,
            scope: request.scope,
        };
        let alignment = request
            .requirements
            .alignment
            .max(self.config.min_alignment)
            .max(1);
        let size = align_up(request.requirements.size.max(1), self.config.min_alignment);

        if size > self.config.block_size {
            let block = DeviceMemoryBlock::allocate(device, size, memory_type_index)?;
            tracing::debug!(size, memory_type_index, "Oversize request gets its own block");
            let index = self.insert_block(PoolBlock::new(block, key, true));
            return self.hand_out(index, 0..size);
        }

        let existing = self.blocks.iter_mut().enumerate().find_map(|(i, slot)| {
            let pool = slot.as_mut().filter(|p| p.key == key && !p.oversize)?;
            pool.reserve(size, alignment).map(|range| (i as u32, range))
        });
        if let Some((index, range)) = existing {
            return self.hand_out(index, range);
        }

        let block = DeviceMemoryBlock::allocate(device, self.config.block_size, memory_type_index)?;
        tracing::debug!(
            block_size = self.config.block_size,
            memory_type_index,
            linear = request.linear,
            scope = ?request.scope,
            "Created pool block"
        );
        let mut pool = PoolBlock::new(block, key, false);
        let range = pool.reserve(size, alignment).ok_or_else(|| {
            GpuError::AllocationFailed(format!("{size} bytes do not fit a fresh pool block"))
        })?;
        let index = self.insert_block(pool);
        self.hand_out(index, range)
    }

    fn free(
        &mut self,
        _device: &Arc<dyn GpuDevice>,
        allocation: DeviceMemoryAllocation,
    ) -> Result<()> {
        let memory = allocation.memory();
        let range = allocation.range();
        let handle = match allocation.into_origin() {
            AllocationOrigin::SubAllocated(handle) => handle,
            other => {
                return Err(GpuError::InvalidAllocation(format!(
                    "pooling allocator cannot free {other:?}"
                )))
            }
        };

        let release_empty = self.config.release_empty_blocks;
        let slot = self
            .blocks
            .get_mut(handle.block as usize)
            .ok_or_else(|| GpuError::InvalidAllocation(format!("unknown pool block {}", handle.block)))?;
        let pool = slot.as_mut().ok_or_else(|| {
            GpuError::InvalidAllocation(format!("pool block {} was released", handle.block))
        })?;
        if pool.block.handle() != memory {
            return Err(GpuError::InvalidAllocation(format!(
                "allocation memory does not belong to pool block {}",
                handle.block
            )));
        }
        match pool.live.get(&handle.id) {
            Some(live) if *live == range => {}
            Some(_) => {
                return Err(GpuError::InvalidAllocation(format!(
                    "range {range:?} does not match allocation {}",
                    handle.id
                )))
            }
            None => {
                return Err(GpuError::InvalidAllocation(format!(
                    "allocation {} is not live (double free or reset scope)",
                    handle.id
                )))
            }
        }
        pool.live.remove(&handle.id);
        pool.release(range);

        if pool.is_empty() && (pool.oversize || release_empty) {
            *slot = None;
            tracing::trace!(block = handle.block, "Released empty pool block");
        }
        Ok(())
    }

    fn reset_frame_scope(&mut self) {
        Self::reset_frame_scope(self);
    }

    fn trim(&mut self) {
        Self::trim(self);
    }
}

impl Drop for PoolingAllocator {
    fn drop(&mut self) {
        let stats = self.stats();
        if stats.live_allocations > 0 {
            tracing::warn!(
                live_allocations = stats.live_allocations,
                used_bytes = stats.used_bytes,
                "Pooling allocator dropped with live allocations"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Managed
// ---------------------------------------------------------------------------

/// Delegates to gpu-allocator.
///
/// Property flags are translated to a [`MemoryLocation`]; gpu-allocator
/// picks the memory type. Scope hints are ignored.
pub struct ManagedAllocator {
    allocator: Option<Allocator>,
    non_coherent_atom_size: vk::DeviceSize,
}

impl ManagedAllocator {
    /// Create an allocator for a Vulkan device.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid and outlive
    /// the allocator. `non_coherent_atom_size` is the physical device limit
    /// of the same name.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        non_coherent_atom_size: vk::DeviceSize,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            non_coherent_atom_size: non_coherent_atom_size.max(1),
        })
    }

    /// Release all gpu-allocator memory. Must run before the device is
    /// destroyed; dropping the allocator has the same effect.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }

    fn location_for(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
        if !properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            MemoryLocation::GpuOnly
        } else if properties.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::CpuToGpu
        }
    }

    // Host-visible ranges are reserved in whole atoms so flushes rounded to
    // the atom never reach into a neighbouring allocation.
    fn requirements_for(
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        atom_size: vk::DeviceSize,
    ) -> vk::MemoryRequirements {
        if !properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return requirements;
        }
        vk::MemoryRequirements {
            size: align_up(requirements.size.max(1), atom_size),
            alignment: requirements.alignment.max(atom_size),
            ..requirements
        }
    }

    // gpu-allocator picks a memory type from the location alone, so the
    // flags it landed on must be checked against the request.
    fn memory_type_for(
        device: &dyn GpuDevice,
        request: &AllocationRequest,
        granted: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        let type_bits = request.requirements.memory_type_bits;
        if !granted.contains(request.properties) {
            return Err(GpuError::NoMatchingMemoryType {
                type_bits,
                properties: request.properties,
            });
        }
        device
            .memory_types()
            .find_exact_memory_type_index(type_bits, granted)
            .ok_or(GpuError::NoMatchingMemoryType {
                type_bits,
                properties: granted,
            })
    }

    fn allocator_mut(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }
}

impl DeviceAllocator for ManagedAllocator {
    fn name(&self) -> &'static str {
        "managed"
    }

    fn allocate(
        &mut self,
        device: &Arc<dyn GpuDevice>,
        request: &AllocationRequest,
    ) -> Result<DeviceMemoryAllocation> {
        let atom_size = self.non_coherent_atom_size;
        let allocation = self
            .allocator_mut()?
            .allocate(&AllocationCreateDesc {
                name: "spokk",
                requirements: Self::requirements_for(
                    request.requirements,
                    request.properties,
                    atom_size,
                ),
                location: Self::location_for(request.properties),
                linear: request.linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        match Self::memory_type_for(device.as_ref(), request, allocation.memory_properties()) {
            Ok(memory_type_index) => Ok(DeviceMemoryAllocation::managed(allocation, memory_type_index)
                .with_atom_size(atom_size)),
            Err(e) => {
                tracing::warn!(
                    requested = ?request.properties,
                    granted = ?allocation.memory_properties(),
                    "gpu-allocator returned memory without the requested properties"
                );
                if let Err(free_error) = self.allocator_mut()?.free(allocation) {
                    tracing::error!("Failed to free rejected allocation: {free_error}");
                }
                Err(e)
            }
        }
    }

    fn free(
        &mut self,
        _device: &Arc<dyn GpuDevice>,
        allocation: DeviceMemoryAllocation,
    ) -> Result<()> {
        match allocation.into_origin() {
            AllocationOrigin::Managed(allocation) => self
                .allocator_mut()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string())),
            other => Err(GpuError::InvalidAllocation(format!(
                "managed allocator cannot free {other:?}"
            ))),
        }
    }
}

impl Drop for ManagedAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    fn fake() -> (Arc<FakeDevice>, Arc<dyn GpuDevice>) {
        let fake = Arc::new(FakeDevice::new());
        let device: Arc<dyn GpuDevice> = fake.clone();
        (fake, device)
    }

    fn host_request(size: u64, alignment: u64) -> AllocationRequest {
        AllocationRequest::new(
            vk::MemoryRequirements {
                size,
                alignment,
                memory_type_bits: u32::MAX,
            },
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    fn small_pool() -> PoolingAllocator {
        PoolingAllocator::new(PoolingAllocatorConfig {
            block_size: 4096,
            min_alignment: 256,
            release_empty_blocks: false,
        })
    }

    #[test]
    fn dedicated_allocations_own_their_memory() {
        let (fake, device) = fake();
        let mut allocator = DedicatedAllocator;
        let allocation = allocator.allocate(&device, &host_request(1000, 16)).unwrap();
        assert_eq!(allocation.offset(), 0);
        assert_eq!(allocation.size(), 1000);
        assert!(allocation.is_host_visible());
        assert_eq!(fake.live_memory_count(), 1);

        allocator.free(&device, allocation).unwrap();
        assert_eq!(fake.live_memory_count(), 0);
    }

    #[test]
    fn dedicated_reports_unmatched_memory_types() {
        let (_fake, device) = fake();
        let mut request = host_request(64, 4);
        request.requirements.memory_type_bits = 0;
        let err = DedicatedAllocator.allocate(&device, &request).unwrap_err();
        assert!(matches!(err, GpuError::NoMatchingMemoryType { type_bits: 0, .. }));
    }

    #[test]
    fn dedicated_rejects_foreign_allocations() {
        let (_fake, device) = fake();
        let mut pool = small_pool();
        let allocation = pool.allocate(&device, &host_request(128, 4)).unwrap();
        let err = DedicatedAllocator.free(&device, allocation).unwrap_err();
        assert!(matches!(err, GpuError::InvalidAllocation(_)));
    }

    #[test]
    fn pool_packs_ranges_into_one_block() {
        let (fake, device) = fake();
        let mut pool = small_pool();
        let a = pool.allocate(&device, &host_request(100, 4)).unwrap();
        let b = pool.allocate(&device, &host_request(300, 4)).unwrap();
        assert_eq!(fake.live_memory_count(), 1);
        assert_eq!(a.memory(), b.memory());
        assert_eq!(a.range(), 0..256);
        assert_eq!(b.range(), 256..768);
        assert_eq!(b.block_size(), 4096);

        let stats = pool.stats();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.used_bytes, 768);
        assert_eq!(stats.live_allocations, 2);

        pool.free(&device, a).unwrap();
        pool.free(&device, b).unwrap();
        assert_eq!(pool.stats().used_bytes, 0);
    }

    #[test]
    fn pool_honours_large_alignment() {
        let (_fake, device) = fake();
        let mut pool = small_pool();
        let _a = pool.allocate(&device, &host_request(256, 4)).unwrap();
        let b = pool.allocate(&device, &host_request(256, 1024)).unwrap();
        assert_eq!(b.offset() % 1024, 0);
        assert_eq!(b.offset(), 1024);
    }

    #[test]
    fn freed_ranges_coalesce_and_are_reused() {
        let (fake, device) = fake();
        let mut pool = small_pool();
        let a = pool.allocate(&device, &host_request(1024, 4)).unwrap();
        let b = pool.allocate(&device, &host_request(1024, 4)).unwrap();
        let c = pool.allocate(&device, &host_request(1024, 4)).unwrap();
        let d = pool.allocate(&device, &host_request(1024, 4)).unwrap();

        pool.free(&device, b).unwrap();
        pool.free(&device, a).unwrap();
        pool.free(&device, c).unwrap();

        // a, b, and c merged back into one 3 KiB range.
        let big = pool.allocate(&device, &host_request(3072, 4)).unwrap();
        assert_eq!(big.range(), 0..3072);
        assert_eq!(fake.live_memory_count(), 1);

        pool.free(&device, big).unwrap();
        pool.free(&device, d).unwrap();
    }

    #[test]
    fn full_blocks_spill_into_new_blocks() {
        let (fake, device) = fake();
        let mut pool = small_pool();
        let a = pool.allocate(&device, &host_request(4096, 4)).unwrap();
        let b = pool.allocate(&device, &host_request(256, 4)).unwrap();
        assert_ne!(a.memory(), b.memory());
        assert_eq!(fake.live_memory_count(), 2);
        pool.free(&device, a).unwrap();
        pool.free(&device, b).unwrap();
    }

    #[test]
    fn oversize_requests_get_released_blocks() {
        let (fake, device) = fake();
        let mut pool = small_pool();
        let big = pool.allocate(&device, &host_request(10_000, 4)).unwrap();
        assert_eq!(big.offset(), 0);
        assert_eq!(big.size(), 10_240);
        assert_eq!(fake.live_memory_count(), 1);

        pool.free(&device, big).unwrap();
        assert_eq!(fake.live_memory_count(), 0);
    }

    #[test]
    fn pools_are_split_by_kind_and_scope() {
        let (fake, device) = fake();
        let mut pool = small_pool();
        let buffer = pool.allocate(&device, &host_request(256, 4)).unwrap();
        let image = pool
            .allocate(&device, &host_request(256, 4).with_linear(false))
            .unwrap();
        let transient = pool
            .allocate(&device, &host_request(256, 4).with_scope(AllocationScope::Frame))
            .unwrap();
        assert_ne!(buffer.memory(), image.memory());
        assert_ne!(buffer.memory(), transient.memory());
        assert_eq!(fake.live_memory_count(), 3);
        for allocation in [buffer, image, transient] {
            pool.free(&device, allocation).unwrap();
        }
    }

    #[test]
    fn foreign_memory_is_rejected() {
        let (_fake, device) = fake();
        let mut pool = small_pool();
        let a = pool.allocate(&device, &host_request(256, 4)).unwrap();
        let forged = DeviceMemoryAllocation::sub_allocated(
            &DeviceMemoryBlock::allocate(&device, 4096, 1).unwrap(),
            a.range(),
            match a.origin() {
                AllocationOrigin::SubAllocated(handle) => *handle,
                _ => unreachable!(),
            },
        )
        .unwrap();
        // Wrong memory object for the recorded block.
        assert!(matches!(
            pool.free(&device, forged),
            Err(GpuError::InvalidAllocation(_))
        ));
        pool.free(&device, a).unwrap();
    }

    #[test]
    fn frame_scope_reset_recycles_ranges() {
        let (fake, device) = fake();
        let mut pool = small_pool();
        let frame = host_request(2048, 4).with_scope(AllocationScope::Frame);
        let first = pool.allocate(&device, &frame).unwrap();
        let second = pool.allocate(&device, &frame).unwrap();
        assert_eq!(second.offset(), 2048);

        pool.reset_frame_scope();
        assert_eq!(pool.stats().live_allocations, 0);

        // Returning a recycled allocation is an error, not a double release.
        assert!(pool.free(&device, first).is_err());
        drop(second);

        let again = pool.allocate(&device, &frame).unwrap();
        assert_eq!(again.offset(), 0);
        assert_eq!(fake.live_memory_count(), 1);
        pool.free(&device, again).unwrap();
    }

    #[test]
    fn trim_releases_empty_blocks() {
        let (fake, device) = fake();
        let mut pool = small_pool();
        let a = pool.allocate(&device, &host_request(256, 4)).unwrap();
        pool.free(&device, a).unwrap();
        assert_eq!(fake.live_memory_count(), 1);
        pool.trim();
        assert_eq!(fake.live_memory_count(), 0);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn released_slots_are_reused() {
        let (_fake, device) = fake();
        let mut pool = PoolingAllocator::new(PoolingAllocatorConfig {
            block_size: 4096,
            min_alignment: 256,
            release_empty_blocks: true,
        });
        let a = pool.allocate(&device, &host_request(256, 4)).unwrap();
        pool.free(&device, a).unwrap();
        assert_eq!(pool.stats().block_count, 0);
        let b = pool.allocate(&device, &host_request(256, 4)).unwrap();
        match b.origin() {
            AllocationOrigin::SubAllocated(handle) => assert_eq!(handle.block, 0),
            other => panic!("unexpected origin {other:?}"),
        }
        pool.free(&device, b).unwrap();
    }

    #[test]
    fn managed_location_follows_properties() {
        assert!(matches!(
            ManagedAllocator::location_for(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryLocation::GpuOnly
        ));
        assert!(matches!(
            ManagedAllocator::location_for(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            MemoryLocation::CpuToGpu
        ));
        assert!(matches!(
            ManagedAllocator::location_for(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
            ),
            MemoryLocation::GpuToCpu
        ));
    }

    #[test]
    fn managed_memory_lacking_requested_flags_is_rejected() {
        let (fake, device) = fake();
        let host_cached = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED;
        let coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let mut request = host_request(256, 4);
        request.properties = host_cached;

        // Uncached memory granted for a cached request.
        assert!(matches!(
            ManagedAllocator::memory_type_for(device.as_ref(), &request, coherent),
            Err(GpuError::NoMatchingMemoryType { properties, .. }) if properties == host_cached
        ));
        // Cached memory satisfies it, and the exact type is reported.
        assert_eq!(
            ManagedAllocator::memory_type_for(
                device.as_ref(),
                &request,
                coherent | vk::MemoryPropertyFlags::HOST_CACHED
            )
            .unwrap(),
            3
        );
        // Granted flags no permitted memory type has.
        request.requirements.memory_type_bits = 0b0001;
        request.properties = vk::MemoryPropertyFlags::empty();
        assert!(ManagedAllocator::memory_type_for(device.as_ref(), &request, coherent).is_err());
        assert!(fake.violations().is_empty());
    }

    #[test]
    fn managed_host_visible_requests_are_padded_to_whole_atoms() {
        let requirements = vk::MemoryRequirements {
            size: 100,
            alignment: 16,
            memory_type_bits: u32::MAX,
        };
        let padded = ManagedAllocator::requirements_for(
            requirements,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            64,
        );
        assert_eq!((padded.size, padded.alignment), (128, 64));

        let device_local = ManagedAllocator::requirements_for(
            requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            64,
        );
        assert_eq!((device_local.size, device_local.alignment), (100, 16));
    }
}
