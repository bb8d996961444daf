//! In-memory [`GpuDevice`] for tests.
//!
//! `FakeDevice` hands out unique handles, backs device memory with host
//! buffers, and records every call so tests can assert on ordering. Queue
//! submissions stay pending until a fence wait, `wait_idle`, or an explicit
//! [`FakeDevice::complete_next_submission`] retires them; retiring a
//! submission replays its recorded buffer updates into device memory.
//!
//! Misuse the real API would reject (double frees, resetting an in-flight
//! fence, oversized buffer updates, ...) is collected in
//! [`FakeDevice::violations`].

use crate::device::{GpuDevice, MemoryTypeTable, QueueInfo, SubmitBatch};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ptr::NonNull;

/// A recorded device call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AllocateMemory {
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        memory_type_index: u32,
    },
    FreeMemory(vk::DeviceMemory),
    MapMemory(vk::DeviceMemory),
    UnmapMemory(vk::DeviceMemory),
    FlushMappedRange {
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    InvalidateMappedRange {
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    CreateBuffer(vk::Buffer),
    DestroyBuffer(vk::Buffer),
    BindBufferMemory {
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    },
    CreateBufferView(vk::BufferView),
    DestroyBufferView(vk::BufferView),
    CreateImage(vk::Image),
    DestroyImage(vk::Image),
    BindImageMemory {
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    },
    CreateImageView(vk::ImageView),
    DestroyImageView(vk::ImageView),
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffer(vk::CommandBuffer),
    FreeCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    ResetCommandBuffer(vk::CommandBuffer),
    UpdateBuffer {
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: usize,
    },
    ImageBarrier {
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    CopyBufferToImage {
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
    },
    CreateDescriptorSetLayout(vk::DescriptorSetLayout),
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    CreateDescriptorPool(vk::DescriptorPool),
    DestroyDescriptorPool(vk::DescriptorPool),
    AllocateDescriptorSets(Vec<vk::DescriptorSet>),
    WriteBufferDescriptor {
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
    },
    Submit {
        queue: vk::Queue,
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    WaitIdle,
    AcquireNextImage {
        semaphore: vk::Semaphore,
        image_index: u32,
    },
    Present {
        image_index: u32,
        wait_semaphores: Vec<vk::Semaphore>,
    },
}

/// A call that fails once when it is next made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    AllocateMemory,
    MapMemory,
    CreateBuffer,
    BindBufferMemory,
    CreateBufferView,
    CreateImage,
    BindImageMemory,
    CreateImageView,
    BeginCommandBuffer,
    CreateDescriptorPool,
    AllocateDescriptorSets,
    QueueSubmit,
    AcquireOutOfDate,
    PresentOutOfDate,
    PresentSuboptimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

#[derive(Debug)]
enum RecordedCommand {
    UpdateBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: Vec<u8>,
    },
    CopyBufferToImage {
        buffer: vk::Buffer,
        image: vk::Image,
        regions: Vec<vk::BufferImageCopy>,
    },
}

struct FakeMemory {
    data: Box<[u8]>,
}

struct FakeBuffer {
    requirements: vk::MemoryRequirements,
    binding: Option<(vk::DeviceMemory, vk::DeviceSize)>,
}

struct FakeImage {
    requirements: vk::MemoryRequirements,
    binding: Option<(vk::DeviceMemory, vk::DeviceSize)>,
    // Layout as of the most recently recorded barrier.
    layout: vk::ImageLayout,
}

struct FakeDescriptorSet {
    pool: vk::DescriptorPool,
    buffers: HashMap<u32, vk::Buffer>,
}

struct FakeCommandBuffer {
    pool: vk::CommandPool,
    state: CommandBufferState,
    commands: Vec<RecordedCommand>,
}

struct PendingSubmit {
    command_buffers: Vec<vk::CommandBuffer>,
    fence: vk::Fence,
}

struct FakeState {
    next_handle: u64,
    calls: Vec<Call>,
    // Fail point and the number of matching calls to let through first.
    failures: Vec<(FailPoint, usize)>,
    violations: Vec<String>,
    memory: HashMap<vk::DeviceMemory, FakeMemory>,
    buffers: HashMap<vk::Buffer, FakeBuffer>,
    buffer_views: HashSet<vk::BufferView>,
    images: HashMap<vk::Image, FakeImage>,
    image_views: HashSet<vk::ImageView>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    command_pools: HashSet<vk::CommandPool>,
    command_buffers: HashMap<vk::CommandBuffer, FakeCommandBuffer>,
    descriptor_set_layouts: HashSet<vk::DescriptorSetLayout>,
    // Pool and its set capacity.
    descriptor_pools: HashMap<vk::DescriptorPool, u32>,
    descriptor_sets: HashMap<vk::DescriptorSet, FakeDescriptorSet>,
    pending: VecDeque<PendingSubmit>,
    auto_complete: bool,
    swapchain_image_count: u32,
    next_image: u32,
}

impl FakeState {
    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_failure(&mut self, point: FailPoint) -> bool {
        let Some(index) = self.failures.iter().position(|(p, _)| *p == point) else {
            return false;
        };
        let skip = &mut self.failures[index].1;
        if *skip > 0 {
            *skip -= 1;
            return false;
        }
        self.failures.remove(index);
        true
    }

    fn violation(&mut self, message: String) {
        self.violations.push(message);
    }

    fn retire_front(&mut self) -> bool {
        let Some(submit) = self.pending.pop_front() else {
            return false;
        };
        for command_buffer in &submit.command_buffers {
            let commands = match self.command_buffers.get_mut(command_buffer) {
                Some(cb) => {
                    cb.state = CommandBufferState::Executable;
                    std::mem::take(&mut cb.commands)
                }
                None => continue,
            };
            for command in &commands {
                self.execute(command);
            }
            if let Some(cb) = self.command_buffers.get_mut(command_buffer) {
                cb.commands = commands;
            }
        }
        if submit.fence != vk::Fence::null() {
            self.fences.insert(submit.fence, true);
        }
        true
    }

    fn execute(&mut self, command: &RecordedCommand) {
        match command {
            RecordedCommand::UpdateBuffer {
                buffer,
                offset,
                data,
            } => {
                let Some((memory, base)) = self.buffers.get(buffer).and_then(|b| b.binding) else {
                    self.violation(format!("update of unbound buffer {buffer:?}"));
                    return;
                };
                let start = (base + offset) as usize;
                let end = start + data.len();
                let target = self
                    .memory
                    .get_mut(&memory)
                    .filter(|m| end <= m.data.len());
                if let Some(m) = target {
                    m.data[start..end].copy_from_slice(data);
                } else {
                    self.violation(format!("update of {buffer:?} out of bounds"));
                }
            }
            RecordedCommand::CopyBufferToImage {
                buffer,
                image,
                regions,
            } => {
                let source = self.buffers.get(buffer).and_then(|b| b.binding);
                let target = self.images.get(image).and_then(|i| i.binding);
                let (Some((src_memory, src_base)), Some((dst_memory, dst_base))) = (source, target)
                else {
                    self.violation(format!("copy between unbound {buffer:?} and {image:?}"));
                    return;
                };
                // Tightly packed 4-byte texels on both sides.
                for region in regions {
                    let len = u64::from(region.image_extent.width)
                        * u64::from(region.image_extent.height)
                        * u64::from(region.image_extent.depth)
                        * u64::from(region.image_subresource.layer_count)
                        * 4;
                    let src = (src_base + region.buffer_offset) as usize;
                    let bytes = self
                        .memory
                        .get(&src_memory)
                        .and_then(|m| m.data.get(src..src + len as usize))
                        .map(<[u8]>::to_vec);
                    let dst = dst_base as usize;
                    let written = bytes.and_then(|bytes| {
                        let m = self.memory.get_mut(&dst_memory)?;
                        m.data.get_mut(dst..dst + bytes.len())?.copy_from_slice(&bytes);
                        Some(())
                    });
                    if written.is_none() {
                        self.violation(format!("copy into {image:?} out of bounds"));
                    }
                }
            }
        }
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, command: Option<RecordedCommand>) {
        let recorded = match self.command_buffers.get_mut(&command_buffer) {
            Some(cb) if cb.state == CommandBufferState::Recording => {
                cb.commands.extend(command);
                true
            }
            _ => false,
        };
        if !recorded {
            self.violation(format!("command recorded into non-recording {command_buffer:?}"));
        }
    }

    fn fence_is_pending(&self, fence: vk::Fence) -> bool {
        self.pending.iter().any(|p| p.fence == fence)
    }
}

/// In-memory device. See the module docs.
pub struct FakeDevice {
    memory_types: MemoryTypeTable,
    queues: Vec<QueueInfo>,
    buffer_alignment: vk::DeviceSize,
    state: Mutex<FakeState>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevice {
    /// A device with a typical discrete-GPU memory layout, one universal
    /// queue family and one transfer-only family.
    pub fn new() -> Self {
        Self::with_memory_types(MemoryTypeTable::from_flags([
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ]))
    }

    pub fn with_memory_types(memory_types: MemoryTypeTable) -> Self {
        let queues = vec![
            QueueInfo {
                queue: vk::Queue::from_raw(0x1000),
                family: 0,
                flags: vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE
                    | vk::QueueFlags::TRANSFER,
            },
            QueueInfo {
                queue: vk::Queue::from_raw(0x1001),
                family: 1,
                flags: vk::QueueFlags::TRANSFER,
            },
        ];
        Self {
            memory_types,
            queues,
            buffer_alignment: 256,
            state: Mutex::new(FakeState {
                next_handle: 0x10_0000,
                calls: Vec::new(),
                failures: Vec::new(),
                violations: Vec::new(),
                memory: HashMap::new(),
                buffers: HashMap::new(),
                buffer_views: HashSet::new(),
                images: HashMap::new(),
                image_views: HashSet::new(),
                fences: HashMap::new(),
                semaphores: HashSet::new(),
                command_pools: HashSet::new(),
                command_buffers: HashMap::new(),
                descriptor_set_layouts: HashSet::new(),
                descriptor_pools: HashMap::new(),
                descriptor_sets: HashMap::new(),
                pending: VecDeque::new(),
                auto_complete: true,
                swapchain_image_count: 3,
                next_image: 0,
            }),
        }
    }

    fn all_types_mask(&self) -> u32 {
        match self.memory_types.len() {
            len if len >= 32 => u32::MAX,
            len => (1u32 << len) - 1,
        }
    }

    pub fn with_swapchain_image_count(self, count: u32) -> Self {
        self.state.lock().swapchain_image_count = count.max(1);
        self
    }

    /// When disabled, fence waits only succeed for submissions already
    /// retired with [`Self::complete_next_submission`]; other waits time out.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.lock().auto_complete = enabled;
    }

    /// Make the next matching call fail.
    pub fn inject_failure(&self, point: FailPoint) {
        self.inject_failure_after(point, 0);
    }

    /// Make the matching call fail after `skip` successful ones.
    pub fn inject_failure_after(&self, point: FailPoint, skip: usize) {
        self.state.lock().failures.push((point, skip));
    }

    /// First host-visible memory type.
    pub fn host_visible_type(&self) -> u32 {
        self.memory_types
            .find_memory_type_index(u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE)
            .unwrap_or(0)
    }

    /// First memory type without host visibility.
    pub fn device_local_type(&self) -> u32 {
        (0..self.memory_types.len() as u32)
            .find(|&i| !self.memory_types.is_host_visible(i))
            .unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn live_memory_count(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_view_count(&self) -> usize {
        let state = self.state.lock();
        state.buffer_views.len() + state.image_views.len()
    }

    pub fn live_fence_count(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_command_buffer_count(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_command_pool_count(&self) -> usize {
        self.state.lock().command_pools.len()
    }

    pub fn live_descriptor_pool_count(&self) -> usize {
        self.state.lock().descriptor_pools.len()
    }

    pub fn live_descriptor_set_layout_count(&self) -> usize {
        self.state.lock().descriptor_set_layouts.len()
    }

    /// The buffer a descriptor set binding was last pointed at.
    pub fn descriptor_buffer(&self, set: vk::DescriptorSet, binding: u32) -> Option<vk::Buffer> {
        self.state
            .lock()
            .descriptor_sets
            .get(&set)
            .and_then(|s| s.buffers.get(&binding).copied())
    }

    /// Layout of an image as of the last recorded barrier.
    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state.lock().images.get(&image).map(|i| i.layout)
    }

    /// The memory an image is bound to.
    pub fn image_memory(&self, image: vk::Image) -> Option<vk::DeviceMemory> {
        self.state
            .lock()
            .images
            .get(&image)
            .and_then(|i| i.binding)
            .map(|(memory, _)| memory)
    }

    /// Total bytes of device memory currently allocated.
    pub fn allocated_bytes(&self) -> u64 {
        self.state
            .lock()
            .memory
            .values()
            .map(|m| m.data.len() as u64)
            .sum()
    }

    /// Snapshot of a memory object's contents.
    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.state
            .lock()
            .memory
            .get(&memory)
            .map(|m| m.data.to_vec())
            .unwrap_or_default()
    }

    pub fn fence_is_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Retire the oldest pending submission. Returns `false` if none was pending.
    pub fn complete_next_submission(&self) -> bool {
        self.state.lock().retire_front()
    }

    pub fn complete_all_submissions(&self) {
        let mut state = self.state.lock();
        while state.retire_front() {}
    }
}

impl GpuDevice for FakeDevice {
    fn memory_types(&self) -> &MemoryTypeTable {
        &self.memory_types
    }

    fn queues(&self) -> &[QueueInfo] {
        &self.queues
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::AllocateMemory) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        if memory_type_index as usize >= self.memory_types.len() {
            state.violation(format!("allocation from unknown memory type {memory_type_index}"));
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let memory = vk::DeviceMemory::from_raw(state.next_raw());
        state.memory.insert(
            memory,
            FakeMemory {
                data: vec![0u8; size as usize].into_boxed_slice(),
            },
        );
        state.calls.push(Call::AllocateMemory {
            memory,
            size,
            memory_type_index,
        });
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        state.calls.push(Call::FreeMemory(memory));
        if state.memory.remove(&memory).is_none() {
            state.violation(format!("free of unknown memory {memory:?}"));
        }
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>> {
        let mut state = self.state.lock();
        state.calls.push(Call::MapMemory(memory));
        if state.take_failure(FailPoint::MapMemory) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        match state.memory.get_mut(&memory) {
            Some(m) => NonNull::new(m.data.as_mut_ptr()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED),
            None => {
                state.violation(format!("map of unknown memory {memory:?}"));
                Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
            }
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().calls.push(Call::UnmapMemory(memory));
    }

    fn flush_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        self.state.lock().calls.push(Call::FlushMappedRange {
            memory,
            offset,
            size,
        });
        Ok(())
    }

    fn invalidate_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        self.state.lock().calls.push(Call::InvalidateMappedRange {
            memory,
            offset,
            size,
        });
        Ok(())
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::CreateBuffer) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let buffer = vk::Buffer::from_raw(state.next_raw());
        let alignment = self.buffer_alignment;
        let requirements = vk::MemoryRequirements {
            size: info.size.div_ceil(alignment) * alignment,
            alignment,
            memory_type_bits: self.all_types_mask(),
        };
        state.buffers.insert(
            buffer,
            FakeBuffer {
                requirements,
                binding: None,
            },
        );
        state.calls.push(Call::CreateBuffer(buffer));
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.calls.push(Call::DestroyBuffer(buffer));
        if state.buffers.remove(&buffer).is_none() {
            state.violation(format!("destroy of unknown buffer {buffer:?}"));
        }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|b| b.requirements)
            .unwrap_or_default()
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::BindBufferMemory {
            buffer,
            memory,
            offset,
        });
        if state.take_failure(FailPoint::BindBufferMemory) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let memory_len = state.memory.get(&memory).map(|m| m.data.len() as u64);
        let Some(entry) = state.buffers.get_mut(&buffer) else {
            state.violation(format!("bind of unknown buffer {buffer:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let requirements = entry.requirements;
        entry.binding = Some((memory, offset));
        match memory_len {
            Some(len) if offset % requirements.alignment == 0 && offset + requirements.size <= len => {
                Ok(())
            }
            _ => {
                state.violation(format!("invalid memory binding for buffer {buffer:?}"));
                Ok(())
            }
        }
    }

    fn create_buffer_view(
        &self,
        _info: &vk::BufferViewCreateInfo<'_>,
    ) -> VkResult<vk::BufferView> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::CreateBufferView) {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        let view = vk::BufferView::from_raw(state.next_raw());
        state.buffer_views.insert(view);
        state.calls.push(Call::CreateBufferView(view));
        Ok(view)
    }

    fn destroy_buffer_view(&self, view: vk::BufferView) {
        let mut state = self.state.lock();
        state.calls.push(Call::DestroyBufferView(view));
        if !state.buffer_views.remove(&view) {
            state.violation(format!("destroy of unknown buffer view {view:?}"));
        }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::CreateImage) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let image = vk::Image::from_raw(state.next_raw());
        let texels = u64::from(info.extent.width)
            * u64::from(info.extent.height)
            * u64::from(info.extent.depth)
            * u64::from(info.array_layers);
        let alignment = 4096;
        let requirements = vk::MemoryRequirements {
            size: (texels * 4).div_ceil(alignment) * alignment,
            alignment,
            memory_type_bits: self.all_types_mask(),
        };
        state.images.insert(
            image,
            FakeImage {
                requirements,
                binding: None,
                layout: info.initial_layout,
            },
        );
        state.calls.push(Call::CreateImage(image));
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        state.calls.push(Call::DestroyImage(image));
        if state.images.remove(&image).is_none() {
            state.violation(format!("destroy of unknown image {image:?}"));
        }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        self.state
            .lock()
            .images
            .get(&image)
            .map(|i| i.requirements)
            .unwrap_or_default()
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::BindImageMemory {
            image,
            memory,
            offset,
        });
        if state.take_failure(FailPoint::BindImageMemory) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let known_memory = state.memory.contains_key(&memory);
        match state.images.get_mut(&image) {
            Some(entry) if known_memory => entry.binding = Some((memory, offset)),
            _ => state.violation(format!("invalid memory binding for image {image:?}")),
        }
        Ok(())
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::CreateImageView) {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        let view = vk::ImageView::from_raw(state.next_raw());
        state.image_views.insert(view);
        state.calls.push(Call::CreateImageView(view));
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        state.calls.push(Call::DestroyImageView(view));
        if !state.image_views.remove(&view) {
            state.violation(format!("destroy of unknown image view {view:?}"));
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(state.next_raw());
        state.fences.insert(fence, signaled);
        state.calls.push(Call::CreateFence(fence));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.calls.push(Call::DestroyFence(fence));
        if state.fence_is_pending(fence) {
            state.violation(format!("destroy of in-flight fence {fence:?}"));
        }
        if state.fences.remove(&fence).is_none() {
            state.violation(format!("destroy of unknown fence {fence:?}"));
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::WaitFence(fence));
        loop {
            match state.fences.get(&fence).copied() {
                None => {
                    state.violation(format!("wait on unknown fence {fence:?}"));
                    return Err(vk::Result::ERROR_UNKNOWN);
                }
                Some(true) => return Ok(()),
                Some(false) => {
                    if !state.auto_complete || !state.fence_is_pending(fence) {
                        return Err(vk::Result::TIMEOUT);
                    }
                    state.retire_front();
                }
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::ResetFence(fence));
        if state.fence_is_pending(fence) {
            state.violation(format!("reset of in-flight fence {fence:?}"));
        }
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => {
                state.violation(format!("reset of unknown fence {fence:?}"));
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        Ok(self.fence_is_signaled(fence))
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(state.next_raw());
        state.semaphores.insert(semaphore);
        state.calls.push(Call::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.calls.push(Call::DestroySemaphore(semaphore));
        if !state.semaphores.remove(&semaphore) {
            state.violation(format!("destroy of unknown semaphore {semaphore:?}"));
        }
    }

    fn create_command_pool(
        &self,
        _queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = vk::CommandPool::from_raw(state.next_raw());
        state.command_pools.insert(pool);
        state.calls.push(Call::CreateCommandPool(pool));
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.calls.push(Call::DestroyCommandPool(pool));
        if !state.command_pools.remove(&pool) {
            state.violation(format!("destroy of unknown command pool {pool:?}"));
        }
        let pending_in_pool = state.command_buffers.values().any(|cb| {
            cb.pool == pool && cb.state == CommandBufferState::Pending
        });
        if pending_in_pool {
            state.violation(format!("destroy of command pool {pool:?} with pending work"));
        }
        state.command_buffers.retain(|_, cb| cb.pool != pool);
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        if !state.command_pools.contains(&pool) {
            state.violation(format!("allocation from unknown command pool {pool:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let command_buffer = vk::CommandBuffer::from_raw(state.next_raw());
        state.command_buffers.insert(
            command_buffer,
            FakeCommandBuffer {
                pool,
                state: CommandBufferState::Initial,
                commands: Vec::new(),
            },
        );
        state.calls.push(Call::AllocateCommandBuffer(command_buffer));
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        state.calls.push(Call::FreeCommandBuffer(command_buffer));
        match state.command_buffers.remove(&command_buffer) {
            Some(cb) if cb.pool != pool => {
                state.violation(format!("{command_buffer:?} freed to the wrong pool"));
            }
            Some(cb) if cb.state == CommandBufferState::Pending => {
                state.violation(format!("free of pending {command_buffer:?}"));
            }
            Some(_) => {}
            None => state.violation(format!("free of unknown {command_buffer:?}")),
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::BeginCommandBuffer(command_buffer));
        if state.take_failure(FailPoint::BeginCommandBuffer) {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        let previous = state.command_buffers.get_mut(&command_buffer).map(|cb| {
            let previous = cb.state;
            cb.state = CommandBufferState::Recording;
            cb.commands.clear();
            previous
        });
        match previous {
            Some(CommandBufferState::Pending) => {
                state.violation(format!("begin of pending {command_buffer:?}"));
            }
            Some(CommandBufferState::Recording) => {
                state.violation(format!("begin of recording {command_buffer:?}"));
            }
            Some(_) => {}
            None => {
                state.violation(format!("begin of unknown {command_buffer:?}"));
                return Err(vk::Result::ERROR_UNKNOWN);
            }
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::EndCommandBuffer(command_buffer));
        let recording = match state.command_buffers.get_mut(&command_buffer) {
            Some(cb) if cb.state == CommandBufferState::Recording => {
                cb.state = CommandBufferState::Executable;
                true
            }
            _ => false,
        };
        if !recording {
            state.violation(format!("end of {command_buffer:?} outside recording"));
        }
        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::ResetCommandBuffer(command_buffer));
        let previous = state.command_buffers.get_mut(&command_buffer).map(|cb| {
            let previous = cb.state;
            cb.state = CommandBufferState::Initial;
            cb.commands.clear();
            previous
        });
        match previous {
            Some(CommandBufferState::Pending) => {
                state.violation(format!("reset of pending {command_buffer:?}"));
            }
            Some(_) => {}
            None => state.violation(format!("reset of unknown {command_buffer:?}")),
        }
        Ok(())
    }

    fn cmd_update_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) {
        let mut state = self.state.lock();
        state.calls.push(Call::UpdateBuffer {
            command_buffer,
            buffer,
            offset,
            size: data.len(),
        });
        if data.len() > 65536 || data.len() % 4 != 0 || offset % 4 != 0 {
            state.violation(format!(
                "invalid buffer update of {} bytes at offset {offset}",
                data.len()
            ));
        }
        state.record(
            command_buffer,
            Some(RecordedCommand::UpdateBuffer {
                buffer,
                offset,
                data: data.to_vec(),
            }),
        );
    }

    fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    ) {
        let mut state = self.state.lock();
        let image = barrier.image;
        state.calls.push(Call::ImageBarrier {
            command_buffer,
            image,
            old_layout: barrier.old_layout,
            new_layout: barrier.new_layout,
        });
        let current = state.images.get_mut(&image).map(|entry| {
            let current = entry.layout;
            entry.layout = barrier.new_layout;
            current
        });
        match current {
            Some(current)
                if barrier.old_layout == vk::ImageLayout::UNDEFINED
                    || barrier.old_layout == current => {}
            Some(current) => state.violation(format!(
                "barrier on {image:?} from {:?} while in {current:?}",
                barrier.old_layout
            )),
            None => state.violation(format!("barrier on unknown {image:?}")),
        }
        state.record(command_buffer, None);
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        let mut state = self.state.lock();
        state.calls.push(Call::CopyBufferToImage {
            command_buffer,
            buffer,
            image,
            layout,
        });
        let current = state.images.get(&image).map(|i| i.layout);
        if current != Some(layout) || layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            state.violation(format!("copy into {image:?} in layout {current:?}"));
        }
        state.record(
            command_buffer,
            Some(RecordedCommand::CopyBufferToImage {
                buffer,
                image,
                regions: regions.to_vec(),
            }),
        );
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let layout = vk::DescriptorSetLayout::from_raw(state.next_raw());
        state.descriptor_set_layouts.insert(layout);
        state.calls.push(Call::CreateDescriptorSetLayout(layout));
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut state = self.state.lock();
        state.calls.push(Call::DestroyDescriptorSetLayout(layout));
        if !state.descriptor_set_layouts.remove(&layout) {
            state.violation(format!("destroy of unknown descriptor set layout {layout:?}"));
        }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::CreateDescriptorPool) {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        let pool = vk::DescriptorPool::from_raw(state.next_raw());
        state.descriptor_pools.insert(pool, max_sets);
        state.calls.push(Call::CreateDescriptorPool(pool));
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state.calls.push(Call::DestroyDescriptorPool(pool));
        if state.descriptor_pools.remove(&pool).is_none() {
            state.violation(format!("destroy of unknown descriptor pool {pool:?}"));
        }
        state.descriptor_sets.retain(|_, set| set.pool != pool);
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::AllocateDescriptorSets) {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let Some(capacity) = state.descriptor_pools.get(&pool).copied() else {
            state.violation(format!("allocation from unknown descriptor pool {pool:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let used = state.descriptor_sets.values().filter(|s| s.pool == pool).count();
        if used + layouts.len() > capacity as usize {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        if let Some(layout) = layouts
            .iter()
            .find(|l| !state.descriptor_set_layouts.contains(*l))
        {
            let message = format!("allocation with unknown layout {layout:?}");
            state.violation(message);
        }
        let sets: Vec<vk::DescriptorSet> = layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(state.next_raw()))
            .collect();
        for set in &sets {
            state.descriptor_sets.insert(
                *set,
                FakeDescriptorSet {
                    pool,
                    buffers: HashMap::new(),
                },
            );
        }
        state.calls.push(Call::AllocateDescriptorSets(sets.clone()));
        Ok(sets)
    }

    fn write_buffer_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        _descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _range: vk::DeviceSize,
    ) {
        let mut state = self.state.lock();
        state.calls.push(Call::WriteBufferDescriptor {
            set,
            binding,
            buffer,
        });
        if !state.buffers.contains_key(&buffer) {
            state.violation(format!("descriptor write of unknown buffer {buffer:?}"));
        }
        match state.descriptor_sets.get_mut(&set) {
            Some(entry) => {
                entry.buffers.insert(binding, buffer);
            }
            None => state.violation(format!("descriptor write to unknown set {set:?}")),
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::QueueSubmit) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        state.calls.push(Call::Submit {
            queue,
            command_buffers: batch.command_buffers.to_vec(),
            wait_semaphores: batch.wait_semaphores.to_vec(),
            signal_semaphores: batch.signal_semaphores.to_vec(),
            fence,
        });
        if batch.wait_semaphores.len() != batch.wait_stages.len() {
            state.violation("wait semaphore and stage counts differ".to_string());
        }
        if fence != vk::Fence::null() {
            match state.fences.get(&fence).copied() {
                Some(false) if !state.fence_is_pending(fence) => {}
                Some(_) => state.violation(format!("submit with signaled or in-flight fence {fence:?}")),
                None => state.violation(format!("submit with unknown fence {fence:?}")),
            }
        }
        for command_buffer in batch.command_buffers {
            let executable = match state.command_buffers.get_mut(command_buffer) {
                Some(cb) if cb.state == CommandBufferState::Executable => {
                    cb.state = CommandBufferState::Pending;
                    true
                }
                _ => false,
            };
            if !executable {
                state.violation(format!("submit of non-executable {command_buffer:?}"));
            }
        }
        state.pending.push_back(PendingSubmit {
            command_buffers: batch.command_buffers.to_vec(),
            fence,
        });
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::WaitIdle);
        while state.retire_front() {}
        Ok(())
    }

    fn acquire_next_image(
        &self,
        _swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::AcquireOutOfDate) {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let image_index = state.next_image;
        state.next_image = (image_index + 1) % state.swapchain_image_count;
        state.calls.push(Call::AcquireNextImage {
            semaphore,
            image_index,
        });
        Ok((image_index, false))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.calls.push(Call::Present {
            image_index,
            wait_semaphores: wait_semaphores.to_vec(),
        });
        if state.take_failure(FailPoint::PresentOutOfDate) {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        Ok(state.take_failure(FailPoint::PresentSuboptimal))
    }
}
