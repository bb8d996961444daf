//! Pipelined frames.
//!
//! Per-frame CPU resources (command buffers, uniform buffers, descriptor
//! sets) are replicated once per frame in flight and addressed by slot
//! index. A slot is reused only after the fence signaled by its previous
//! submission has been observed, which caps how far the CPU can run ahead
//! of the GPU at `frames_in_flight - 1` frames.
//!
//! Swapchain images are a separate, independently sized set: per-image
//! resources (framebuffers, "rendering complete" semaphores) are addressed
//! by the acquired image index, never by the slot index.

use crate::command::CommandPool;
use crate::context::DeviceContext;
use crate::descriptors::{DescriptorPool, DescriptorSetLayoutBuilder};
use crate::device::{GpuDevice, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::memory::AllocationScope;
use crate::resource::Buffer;
use crate::sync::{create_fence, create_semaphore, reset_fence, wait_for_fence};
use ash::vk;
use std::sync::Arc;

/// Default number of frames in flight.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Upper bound accepted by [`FrameConfig::validate`].
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Frame pipelining configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    /// Number of slots, `1..=MAX_FRAMES_IN_FLIGHT`.
    pub frames_in_flight: usize,
    /// Timeout for slot fence waits and image acquisition. A fence wait that
    /// expires is reported as [`GpuError::DeviceLost`].
    pub fence_timeout_ns: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: FRAMES_IN_FLIGHT,
            fence_timeout_ns: u64::MAX,
        }
    }
}

impl FrameConfig {
    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if (1..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "frames in flight must be between 1 and {MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )))
        }
    }
}

/// Fixed-size ring of per-frame values with a current position.
#[derive(Debug, Clone)]
pub struct FrameRing<T> {
    items: Vec<T>,
    index: usize,
}

impl<T> FrameRing<T> {
    /// Build a ring from its slots. A ring needs at least one slot.
    pub fn new(items: Vec<T>) -> Result<Self> {
        if items.is_empty() {
            return Err(GpuError::InvalidState(
                "a frame ring needs at least one slot".to_string(),
            ));
        }
        Ok(Self { items, index: 0 })
    }

    pub fn from_fn(len: usize, f: impl FnMut(usize) -> T) -> Result<Self> {
        Self::new((0..len).map(f).collect())
    }

    /// Build a ring from a fallible constructor. Values built before the
    /// first failure are dropped.
    pub fn try_from_fn(len: usize, f: impl FnMut(usize) -> Result<T>) -> Result<Self> {
        Self::new((0..len).map(f).collect::<Result<Vec<_>>>()?)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always `false`: rings are never empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Index of the current slot.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> &T {
        &self.items[self.index]
    }

    pub fn current_mut(&mut self) -> &mut T {
        &mut self.items[self.index]
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    /// Move to the next slot, wrapping around. Returns the new index.
    pub fn advance(&mut self) -> usize {
        self.index = (self.index + 1) % self.items.len();
        self.index
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }
}

impl<'a, T> IntoIterator for &'a FrameRing<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Synchronization and command state owned by one frame in flight.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    /// Signaled when the acquired swapchain image is ready.
    pub image_acquired: vk::Semaphore,
    /// Signaled when the slot's last submission has finished executing.
    pub submit_complete: vk::Fence,
    /// Null until [`FramePipeline::create_descriptor_sets`] runs.
    pub descriptor_set: vk::DescriptorSet,
}

impl FrameSlot {
    fn create(device: &dyn GpuDevice, pool: &CommandPool) -> Result<Self> {
        let command_buffer = pool.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;
        let image_acquired = match create_semaphore(device) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                pool.free_command_buffer(command_buffer);
                return Err(e);
            }
        };
        // Created signaled so the first wait on every slot returns at once.
        let submit_complete = match create_fence(device, true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_acquired);
                pool.free_command_buffer(command_buffer);
                return Err(e);
            }
        };
        Ok(Self {
            command_buffer,
            image_acquired,
            submit_complete,
            descriptor_set: vk::DescriptorSet::null(),
        })
    }

    fn destroy(&self, device: &dyn GpuDevice, pool: &CommandPool) {
        device.destroy_fence(self.submit_complete);
        device.destroy_semaphore(self.image_acquired);
        pool.free_command_buffer(self.command_buffer);
    }
}

/// A frame between [`FramePipeline::begin_frame`] and
/// [`FramePipeline::end_frame`].
#[derive(Debug)]
pub struct ActiveFrame {
    /// Slot index; selects per-frame CPU resources.
    pub slot: usize,
    /// Acquired swapchain image; selects per-image resources.
    pub image_index: u32,
    /// Slot command buffer, already in the recording state.
    pub command_buffer: vk::CommandBuffer,
    /// Slot descriptor set; null if the pipeline has none.
    pub descriptor_set: vk::DescriptorSet,
    pub frame_number: u64,
    suboptimal: bool,
}

impl ActiveFrame {
    /// Whether acquisition reported the swapchain as suboptimal.
    pub fn is_suboptimal(&self) -> bool {
        self.suboptimal
    }
}

/// Outcome of a successful present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// The image was presented but the swapchain should be recreated.
    Suboptimal,
}

struct FrameDescriptors {
    layout: vk::DescriptorSetLayout,
    // Owns the per-slot sets.
    pool: DescriptorPool,
}

/// Rotates frame slots through the wait / acquire / record / submit /
/// present cycle.
pub struct FramePipeline {
    device: Arc<dyn GpuDevice>,
    config: FrameConfig,
    slots: FrameRing<FrameSlot>,
    render_complete: Vec<vk::Semaphore>,
    // Acquire semaphores pulled out of rotation while a signal may still be
    // pending on them; destroyed once the device is idle.
    retired_semaphores: Vec<vk::Semaphore>,
    descriptors: Option<FrameDescriptors>,
    frame_number: u64,
    recording: bool,
    command_pool: CommandPool,
}

impl FramePipeline {
    /// Create the slots and one "rendering complete" semaphore per swapchain
    /// image. On failure nothing created here outlives the call.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        queue_family: u32,
        config: FrameConfig,
        swapchain_image_count: usize,
    ) -> Result<Self> {
        config.validate()?;
        let command_pool = CommandPool::new(
            device.clone(),
            queue_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        let mut slots = Vec::with_capacity(config.frames_in_flight);
        for _ in 0..config.frames_in_flight {
            match FrameSlot::create(device.as_ref(), &command_pool) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        slot.destroy(device.as_ref(), &command_pool);
                    }
                    return Err(e);
                }
            }
        }

        let render_complete = match create_semaphores(device.as_ref(), swapchain_image_count) {
            Ok(semaphores) => semaphores,
            Err(e) => {
                for slot in &slots {
                    slot.destroy(device.as_ref(), &command_pool);
                }
                return Err(e);
            }
        };

        tracing::info!(
            frames_in_flight = config.frames_in_flight,
            swapchain_images = swapchain_image_count,
            "Created frame pipeline"
        );

        Ok(Self {
            device,
            config,
            slots: FrameRing::new(slots)?,
            render_complete,
            retired_semaphores: Vec::new(),
            descriptors: None,
            frame_number: 0,
            recording: false,
            command_pool,
        })
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next [`Self::begin_frame`] will use.
    pub fn current_slot(&self) -> usize {
        self.slots.index()
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    /// Number of frames submitted so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn swapchain_image_count(&self) -> usize {
        self.render_complete.len()
    }

    /// Give every slot its own descriptor set with the layout described by
    /// `builder`, and return that layout for pipeline layout creation.
    ///
    /// Sets live until the pipeline is dropped; swapchain recreation leaves
    /// them untouched. On failure nothing created here outlives the call.
    pub fn create_descriptor_sets(
        &mut self,
        builder: &DescriptorSetLayoutBuilder<'_>,
    ) -> Result<vk::DescriptorSetLayout> {
        if self.descriptors.is_some() {
            return Err(GpuError::InvalidState(
                "frame descriptor sets already created".to_string(),
            ));
        }
        let count = self.slots.len();
        let max_sets = count as u32;
        let layout = builder.build(self.device.as_ref())?;
        let created = DescriptorPool::new(self.device.clone(), max_sets, &builder.pool_sizes(max_sets))
            .and_then(|pool| {
                let sets = pool.allocate(&vec![layout; count])?;
                Ok((pool, sets))
            });
        let (pool, sets) = match created {
            Ok(created) => created,
            Err(e) => {
                self.device.destroy_descriptor_set_layout(layout);
                return Err(e);
            }
        };

        for (slot, set) in self.slots.iter_mut().zip(sets) {
            slot.descriptor_set = set;
        }
        self.descriptors = Some(FrameDescriptors { layout, pool });
        tracing::debug!(sets = count, "Created frame descriptor sets");
        Ok(layout)
    }

    /// Layout of the per-slot descriptor sets, if they have been created.
    pub fn descriptor_set_layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.descriptors.as_ref().map(|d| d.layout)
    }

    /// Point `binding` of slot i's descriptor set at copy i of `buffers`.
    ///
    /// Waits for every slot first, since a set may not change while a
    /// submission that uses it is in flight.
    pub fn bind_uniform_buffer(&self, binding: u32, buffers: &PipelinedBuffer) -> Result<()> {
        self.bind_buffer(binding, vk::DescriptorType::UNIFORM_BUFFER, buffers)
    }

    /// Storage-buffer counterpart of [`Self::bind_uniform_buffer`].
    pub fn bind_storage_buffer(&self, binding: u32, buffers: &PipelinedBuffer) -> Result<()> {
        self.bind_buffer(binding, vk::DescriptorType::STORAGE_BUFFER, buffers)
    }

    fn bind_buffer(
        &self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffers: &PipelinedBuffer,
    ) -> Result<()> {
        if self.descriptors.is_none() {
            return Err(GpuError::InvalidState(
                "frame descriptor sets have not been created".to_string(),
            ));
        }
        if self.recording {
            return Err(GpuError::InvalidState(
                "cannot update frame descriptor sets while recording".to_string(),
            ));
        }
        if buffers.len() != self.slots.len() {
            return Err(GpuError::InvalidState(format!(
                "pipelined buffer has {} copies but there are {} frame slots",
                buffers.len(),
                self.slots.len()
            )));
        }
        self.wait_all()?;
        for (index, slot) in self.slots.iter().enumerate() {
            let buffer = buffers
                .buffer(index)
                .ok_or(GpuError::NullResource("pipelined buffer copy"))?;
            self.device.write_buffer_descriptor(
                slot.descriptor_set,
                binding,
                descriptor_type,
                buffer.handle(),
                0,
                buffer.size(),
            );
        }
        Ok(())
    }

    /// Wait for the current slot, acquire a swapchain image, and start
    /// recording the slot's command buffer.
    ///
    /// The slot fence is reset only once an image has been acquired, so an
    /// out-of-date swapchain leaves it signaled and the next attempt does not
    /// block.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_frame(&mut self, swapchain: vk::SwapchainKHR) -> Result<ActiveFrame> {
        if self.recording {
            return Err(GpuError::InvalidState(
                "begin_frame called while a frame is being recorded".to_string(),
            ));
        }
        let slot_index = self.slots.index();
        let slot = *self.slots.current();
        let device = self.device.as_ref();

        wait_for_fence(device, slot.submit_complete, self.config.fence_timeout_ns)?;

        let (image_index, suboptimal) =
            match device.acquire_next_image(swapchain, self.config.fence_timeout_ns, slot.image_acquired) {
                Ok(acquired) => acquired,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(GpuError::SwapchainOutOfDate),
                Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                    tracing::error!(slot = slot_index, "Swapchain image acquisition timed out");
                    return Err(GpuError::DeviceLost);
                }
                Err(e) => return Err(e.into()),
            };
        if image_index as usize >= self.render_complete.len() {
            // Nothing will ever wait on the semaphore the acquire just
            // signaled, so the slot must not hand it to the next acquire.
            let replacement = create_semaphore(device)?;
            let retired =
                std::mem::replace(&mut self.slots.current_mut().image_acquired, replacement);
            self.retired_semaphores.push(retired);
            return Err(GpuError::InvalidState(format!(
                "acquired image {image_index} but only {} swapchain images are tracked",
                self.render_complete.len()
            )));
        }

        reset_fence(device, slot.submit_complete)?;
        let begin = device
            .reset_command_buffer(slot.command_buffer)
            .and_then(|()| {
                device.begin_command_buffer(
                    slot.command_buffer,
                    vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                )
            });
        if let Err(e) = begin {
            self.rearm_current_fence();
            return Err(e.into());
        }

        self.recording = true;
        tracing::trace!(
            slot = slot_index,
            image_index,
            frame = self.frame_number,
            "Began frame"
        );
        Ok(ActiveFrame {
            slot: slot_index,
            image_index,
            command_buffer: slot.command_buffer,
            descriptor_set: slot.descriptor_set,
            frame_number: self.frame_number,
            suboptimal,
        })
    }

    /// Finish recording, submit, and present.
    ///
    /// The submission waits on the slot's acquire semaphore at `wait_stage`
    /// and signals the image's "rendering complete" semaphore and the slot
    /// fence. The pipeline advances to the next slot once the submission has
    /// been accepted, even if presentation then fails.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_frame(
        &mut self,
        frame: ActiveFrame,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        wait_stage: vk::PipelineStageFlags,
    ) -> Result<PresentStatus> {
        self.check_active(&frame)?;
        self.recording = false;

        let slot = *self.slots.current();
        let render_complete = self.render_complete[frame.image_index as usize];
        let device = self.device.as_ref();

        let command_buffers = [slot.command_buffer];
        let wait_semaphores = [slot.image_acquired];
        let wait_stages = [wait_stage];
        let signal_semaphores = [render_complete];
        let submitted = device.end_command_buffer(slot.command_buffer).and_then(|()| {
            device.queue_submit(
                queue,
                &SubmitBatch {
                    command_buffers: &command_buffers,
                    wait_semaphores: &wait_semaphores,
                    wait_stages: &wait_stages,
                    signal_semaphores: &signal_semaphores,
                },
                slot.submit_complete,
            )
        });
        if let Err(e) = submitted {
            self.rearm_current_fence();
            return Err(e.into());
        }

        self.slots.advance();
        self.frame_number += 1;

        match device.queue_present(queue, swapchain, frame.image_index, &signal_semaphores) {
            Ok(false) if !frame.suboptimal => Ok(PresentStatus::Optimal),
            Ok(_) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SwapchainOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a frame without submitting it.
    ///
    /// The acquired image is never presented, so the swapchain must be
    /// recreated (see [`Self::recreate_swapchain_resources`]) before the next
    /// frame.
    pub fn abandon_frame(&mut self, frame: ActiveFrame) -> Result<()> {
        self.check_active(&frame)?;
        self.recording = false;
        if let Err(e) = self.device.end_command_buffer(frame.command_buffer) {
            tracing::warn!("Failed to end abandoned command buffer: {e}");
        }
        self.rearm_current_fence();
        tracing::debug!(slot = frame.slot, "Abandoned frame");
        Ok(())
    }

    /// Wait until every slot's last submission has completed.
    pub fn wait_all(&self) -> Result<()> {
        for slot in &self.slots {
            wait_for_fence(self.device.as_ref(), slot.submit_complete, self.config.fence_timeout_ns)?;
        }
        Ok(())
    }

    /// Rebuild the resources that depend on the swapchain.
    ///
    /// Call after the device is idle and the swapchain has been recreated.
    /// The per-image semaphores are replaced to match `swapchain_image_count`;
    /// the per-slot acquire semaphores are replaced as well, since an
    /// abandoned or failed frame can leave one signaled.
    pub fn recreate_swapchain_resources(&mut self, swapchain_image_count: usize) -> Result<()> {
        if self.recording {
            return Err(GpuError::InvalidState(
                "cannot recreate swapchain resources while recording".to_string(),
            ));
        }
        self.wait_all()?;
        let device = self.device.as_ref();

        let render_complete = create_semaphores(device, swapchain_image_count)?;
        for semaphore in std::mem::replace(&mut self.render_complete, render_complete) {
            device.destroy_semaphore(semaphore);
        }
        for slot in self.slots.iter_mut() {
            let replacement = create_semaphore(device)?;
            device.destroy_semaphore(std::mem::replace(&mut slot.image_acquired, replacement));
        }
        for semaphore in self.retired_semaphores.drain(..) {
            device.destroy_semaphore(semaphore);
        }

        tracing::debug!(
            swapchain_images = swapchain_image_count,
            "Recreated swapchain-dependent frame resources"
        );
        Ok(())
    }

    fn check_active(&self, frame: &ActiveFrame) -> Result<()> {
        if !self.recording || frame.slot != self.slots.index() {
            return Err(GpuError::InvalidState(format!(
                "frame for slot {} is not the active frame",
                frame.slot
            )));
        }
        Ok(())
    }

    // The current slot's fence was reset but nothing was submitted to signal
    // it; replace it with a signaled one so the next wait returns.
    fn rearm_current_fence(&mut self) {
        let device = self.device.as_ref();
        match create_fence(device, true) {
            Ok(fence) => {
                let slot = self.slots.current_mut();
                device.destroy_fence(std::mem::replace(&mut slot.submit_complete, fence));
            }
            Err(e) => tracing::error!("Failed to re-arm frame fence: {e}"),
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.wait_all() {
            tracing::warn!("Frame slots still in flight at shutdown: {e}");
        }
        let device = self.device.as_ref();
        for semaphore in self.render_complete.drain(..) {
            device.destroy_semaphore(semaphore);
        }
        for semaphore in self.retired_semaphores.drain(..) {
            device.destroy_semaphore(semaphore);
        }
        for slot in &self.slots {
            slot.destroy(device, &self.command_pool);
        }
        if let Some(descriptors) = self.descriptors.take() {
            drop(descriptors.pool);
            self.device.destroy_descriptor_set_layout(descriptors.layout);
        }
    }
}

fn create_semaphores(device: &dyn GpuDevice, count: usize) -> Result<Vec<vk::Semaphore>> {
    let mut semaphores = Vec::with_capacity(count);
    for _ in 0..count {
        match create_semaphore(device) {
            Ok(semaphore) => semaphores.push(semaphore),
            Err(e) => {
                for semaphore in semaphores {
                    device.destroy_semaphore(semaphore);
                }
                return Err(e);
            }
        }
    }
    Ok(semaphores)
}

/// One buffer per frame slot, for data the CPU rewrites every frame.
///
/// Write only to the slot of the frame being recorded; the other copies may
/// still be read by the GPU.
pub struct PipelinedBuffer {
    buffers: Vec<Buffer>,
}

impl PipelinedBuffer {
    /// Create `count` identical buffers. If any creation fails, the buffers
    /// already created are destroyed.
    pub fn create(
        ctx: &DeviceContext,
        count: usize,
        info: &vk::BufferCreateInfo<'_>,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            match Buffer::create(ctx, info, properties, AllocationScope::Device) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    for buffer in &mut buffers {
                        buffer.destroy(ctx);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { buffers })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Handle of slot `index`, or null if out of range.
    pub fn handle(&self, index: usize) -> vk::Buffer {
        self.buffers
            .get(index)
            .map_or(vk::Buffer::null(), Buffer::handle)
    }

    pub fn buffer(&self, index: usize) -> Option<&Buffer> {
        self.buffers.get(index)
    }

    pub fn mapped_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.buffers.get_mut(index).and_then(Buffer::mapped_mut)
    }

    pub fn load(
        &mut self,
        ctx: &DeviceContext,
        index: usize,
        data: &[u8],
        dst_offset: vk::DeviceSize,
    ) -> Result<()> {
        let len = self.buffers.len();
        self.buffers
            .get_mut(index)
            .ok_or_else(|| GpuError::InvalidState(format!("slot {index} out of range (have {len})")))?
            .load(ctx, data, dst_offset)
    }

    /// Write a plain-data value at the start of slot `index`.
    pub fn write<T: bytemuck::Pod>(
        &mut self,
        ctx: &DeviceContext,
        index: usize,
        value: &T,
    ) -> Result<()> {
        self.load(ctx, index, bytemuck::bytes_of(value), 0)
    }

    pub fn flush(&self, ctx: &DeviceContext, index: usize) -> Result<()> {
        self.buffers
            .get(index)
            .ok_or_else(|| GpuError::InvalidState(format!("slot {index} out of range")))?
            .flush(ctx)
    }

    pub fn destroy(&mut self, ctx: &DeviceContext) {
        for buffer in &mut self.buffers {
            buffer.destroy(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FailPoint, FakeDevice};
    use hashbrown::HashMap;

    const SWAPCHAIN: vk::SwapchainKHR = vk::SwapchainKHR::null();
    const STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;

    fn pipeline(fake: &Arc<FakeDevice>, frames: usize) -> FramePipeline {
        FramePipeline::new(
            fake.clone(),
            0,
            FrameConfig::default().with_frames_in_flight(frames),
            3,
        )
        .unwrap()
    }

    fn graphics_queue(fake: &FakeDevice) -> vk::Queue {
        fake.queues()[0].queue
    }

    /// Run one empty frame, returning its slot and image index.
    fn run_frame(fake: &FakeDevice, frames: &mut FramePipeline) -> (usize, u32) {
        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        let used = (frame.slot, frame.image_index);
        let status = frames
            .end_frame(frame, graphics_queue(fake), SWAPCHAIN, STAGE)
            .unwrap();
        assert_eq!(status, PresentStatus::Optimal);
        used
    }

    #[test]
    fn ring_wraps_around() {
        let mut ring = FrameRing::from_fn(3, |i| i * 10).unwrap();
        assert_eq!(ring.len(), 3);
        assert_eq!(*ring.current(), 0);
        assert_eq!(ring.advance(), 1);
        assert_eq!(ring.advance(), 2);
        assert_eq!(ring.advance(), 0);
        *ring.current_mut() += 1;
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![1, 10, 20]);
        assert_eq!(ring.get(3), None);
    }

    #[test]
    fn ring_try_from_fn_propagates_errors() {
        let ring = FrameRing::try_from_fn(3, |i| {
            if i == 2 {
                Err(GpuError::Other("boom".to_string()))
            } else {
                Ok(i)
            }
        });
        assert!(matches!(ring, Err(GpuError::Other(message)) if message == "boom"));
    }

    #[test]
    fn empty_ring_is_rejected() {
        assert!(matches!(
            FrameRing::<u32>::new(Vec::new()),
            Err(GpuError::InvalidState(_))
        ));
        assert!(FrameRing::from_fn(0, |i| i).is_err());
    }

    #[test]
    fn config_is_validated() {
        assert!(FrameConfig::default().validate().is_ok());
        assert!(FrameConfig::default().with_frames_in_flight(0).validate().is_err());
        assert!(FrameConfig::default().with_frames_in_flight(4).validate().is_err());

        let fake = Arc::new(FakeDevice::new());
        let result = FramePipeline::new(
            fake.clone(),
            0,
            FrameConfig::default().with_frames_in_flight(0),
            3,
        );
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        assert_eq!(fake.live_command_pool_count(), 0);
    }

    #[test]
    fn slot_fence_is_waited_before_reuse_on_every_cycle() {
        for frames_in_flight in 1..=MAX_FRAMES_IN_FLIGHT {
            let fake = Arc::new(FakeDevice::new());
            let mut frames = pipeline(&fake, frames_in_flight);
            for _ in 0..3 * frames_in_flight + 1 {
                run_frame(&fake, &mut frames);
            }
            assert_eq!(frames.frame_number(), (3 * frames_in_flight + 1) as u64);

            let calls = fake.calls();
            let mut last_submit: HashMap<vk::Fence, usize> = HashMap::new();
            let mut fence_of_buffer: HashMap<vk::CommandBuffer, vk::Fence> = HashMap::new();
            let mut waits: Vec<(usize, vk::Fence)> = Vec::new();
            let waited_since = |waits: &[(usize, vk::Fence)], fence, since: usize, now: usize| {
                waits.iter().any(|&(at, f)| f == fence && at > since && at < now)
            };

            for (at, call) in calls.iter().enumerate() {
                match call {
                    Call::WaitFence(fence) => waits.push((at, *fence)),
                    Call::Submit {
                        command_buffers,
                        fence,
                        ..
                    } => {
                        last_submit.insert(*fence, at);
                        for cb in command_buffers {
                            fence_of_buffer.insert(*cb, *fence);
                        }
                    }
                    Call::ResetFence(fence) => {
                        if let Some(&submitted) = last_submit.get(fence) {
                            assert!(
                                waited_since(&waits, *fence, submitted, at),
                                "fence {fence:?} reset without a wait after its submission"
                            );
                        }
                    }
                    Call::ResetCommandBuffer(cb) => {
                        if let Some(fence) = fence_of_buffer.get(cb) {
                            let submitted = last_submit[fence];
                            assert!(
                                waited_since(&waits, *fence, submitted, at),
                                "{cb:?} reset before its slot fence was observed"
                            );
                        }
                    }
                    _ => {}
                }
            }
            assert!(fake.violations().is_empty(), "{:?}", fake.violations());
        }
    }

    #[test]
    fn slots_rotate_and_images_are_indexed_independently() {
        let fake = Arc::new(FakeDevice::new());
        let mut frames = pipeline(&fake, 2);
        let used: Vec<(usize, u32)> = (0..6).map(|_| run_frame(&fake, &mut frames)).collect();
        assert_eq!(
            used,
            vec![(0, 0), (1, 1), (0, 2), (1, 0), (0, 1), (1, 2)]
        );
    }

    #[test]
    fn submission_waits_on_acquire_and_signals_image_semaphore() {
        let fake = Arc::new(FakeDevice::new());
        let mut frames = pipeline(&fake, 2);
        let slot = *frames.slot(0).unwrap();
        fake.clear_calls();

        run_frame(&fake, &mut frames);

        let calls = fake.calls();
        let Some(Call::Submit {
            wait_semaphores,
            signal_semaphores,
            fence,
            command_buffers,
            ..
        }) = calls.iter().find(|c| matches!(c, Call::Submit { .. }))
        else {
            panic!("no submission recorded");
        };
        assert_eq!(wait_semaphores, &vec![slot.image_acquired]);
        assert_eq!(fence, &slot.submit_complete);
        assert_eq!(command_buffers, &vec![slot.command_buffer]);
        let Some(Call::Present {
            wait_semaphores: present_waits,
            ..
        }) = calls.iter().find(|c| matches!(c, Call::Present { .. }))
        else {
            panic!("no present recorded");
        };
        assert_eq!(present_waits, signal_semaphores);
    }

    #[test]
    fn in_flight_slots_keep_their_own_uniform_data() {
        let fake = Arc::new(FakeDevice::new());
        fake.set_auto_complete(false);
        let ctx = DeviceContext::with_default_allocator(fake.clone());
        let mut frames = pipeline(&fake, 2);
        let info = vk::BufferCreateInfo::default()
            .size(256)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER);
        let mut uniforms = PipelinedBuffer::create(
            &ctx,
            frames.frames_in_flight(),
            &info,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        let pattern_a = [0xAAu8; 256];
        let pattern_b = [0xBBu8; 256];
        let queue = graphics_queue(&fake);

        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        assert_eq!(frame.slot, 0);
        uniforms.load(&ctx, frame.slot, &pattern_a, 0).unwrap();
        frames.end_frame(frame, queue, SWAPCHAIN, STAGE).unwrap();

        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        assert_eq!(frame.slot, 1);
        uniforms.load(&ctx, frame.slot, &pattern_b, 0).unwrap();
        frames.end_frame(frame, queue, SWAPCHAIN, STAGE).unwrap();

        let slot0_fence = frames.slot(0).unwrap().submit_complete;
        assert!(!fake.fence_is_signaled(slot0_fence));
        let mut contents = [0u8; 256];
        uniforms.buffer(0).unwrap().read(&ctx, &mut contents, 0).unwrap();
        assert_eq!(contents, pattern_a);

        // Slot 0 cannot be reused until its submission retires.
        assert!(matches!(
            frames.begin_frame(SWAPCHAIN),
            Err(GpuError::DeviceLost)
        ));
        assert!(fake.complete_next_submission());
        assert!(fake.fence_is_signaled(slot0_fence));
        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        assert_eq!(frame.slot, 0);
        uniforms.buffer(0).unwrap().read(&ctx, &mut contents, 0).unwrap();
        assert_eq!(contents, pattern_a);
        uniforms.buffer(1).unwrap().read(&ctx, &mut contents, 0).unwrap();
        assert_eq!(contents, pattern_b);

        frames.end_frame(frame, queue, SWAPCHAIN, STAGE).unwrap();
        fake.complete_all_submissions();
        uniforms.destroy(&ctx);
        drop(frames);
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    #[test]
    fn out_of_date_acquire_leaves_fence_signaled() {
        let fake = Arc::new(FakeDevice::new());
        let mut frames = pipeline(&fake, 2);
        let fence = frames.slot(0).unwrap().submit_complete;
        fake.inject_failure(FailPoint::AcquireOutOfDate);

        assert!(matches!(
            frames.begin_frame(SWAPCHAIN),
            Err(GpuError::SwapchainOutOfDate)
        ));
        assert!(fake.fence_is_signaled(fence));
        assert!(!fake.calls().contains(&Call::ResetFence(fence)));

        // The retry goes through without blocking.
        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        assert_eq!(frame.slot, 0);
        frames
            .end_frame(frame, graphics_queue(&fake), SWAPCHAIN, STAGE)
            .unwrap();
    }

    #[test]
    fn fence_timeout_is_device_lost() {
        let fake = Arc::new(FakeDevice::new());
        fake.set_auto_complete(false);
        let mut frames = FramePipeline::new(
            fake.clone(),
            0,
            FrameConfig::default()
                .with_frames_in_flight(1)
                .with_fence_timeout_ns(1_000_000),
            3,
        )
        .unwrap();
        run_frame(&fake, &mut frames);
        assert!(matches!(
            frames.begin_frame(SWAPCHAIN),
            Err(GpuError::DeviceLost)
        ));
        fake.complete_all_submissions();
    }

    #[test]
    fn failed_submit_rearms_the_slot() {
        let fake = Arc::new(FakeDevice::new());
        let mut frames = pipeline(&fake, 2);
        let queue = graphics_queue(&fake);

        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        fake.inject_failure(FailPoint::QueueSubmit);
        assert!(frames.end_frame(frame, queue, SWAPCHAIN, STAGE).is_err());
        assert_eq!(frames.current_slot(), 0);
        assert_eq!(frames.frame_number(), 0);

        let fence = frames.slot(0).unwrap().submit_complete;
        assert!(fake.fence_is_signaled(fence));
        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        frames.end_frame(frame, queue, SWAPCHAIN, STAGE).unwrap();
        assert_eq!(frames.current_slot(), 1);
        assert_eq!(fake.live_fence_count(), 2);
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    #[test]
    fn present_results_are_reported() {
        let fake = Arc::new(FakeDevice::new());
        let mut frames = pipeline(&fake, 2);
        let queue = graphics_queue(&fake);

        fake.inject_failure(FailPoint::PresentSuboptimal);
        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        assert_eq!(
            frames.end_frame(frame, queue, SWAPCHAIN, STAGE).unwrap(),
            PresentStatus::Suboptimal
        );

        fake.inject_failure(FailPoint::PresentOutOfDate);
        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        assert!(matches!(
            frames.end_frame(frame, queue, SWAPCHAIN, STAGE),
            Err(GpuError::SwapchainOutOfDate)
        ));
        // The submission was accepted, so the ring still moved on.
        assert_eq!(frames.current_slot(), 0);
        assert_eq!(frames.frame_number(), 2);
    }

    #[test]
    fn begin_twice_is_rejected() {
        let fake = Arc::new(FakeDevice::new());
        let mut frames = pipeline(&fake, 2);
        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        assert!(matches!(
            frames.begin_frame(SWAPCHAIN),
            Err(GpuError::InvalidState(_))
        ));
        frames.abandon_frame(frame).unwrap();
        let fence = frames.slot(0).unwrap().submit_complete;
        assert!(fake.fence_is_signaled(fence));
        frames.recreate_swapchain_resources(3).unwrap();
        run_frame(&fake, &mut frames);
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    #[test]
    fn recreate_resizes_per_image_semaphores() {
        let fake = Arc::new(FakeDevice::new());
        let mut frames = pipeline(&fake, 2);
        assert_eq!(fake.live_semaphore_count(), 2 + 3);
        run_frame(&fake, &mut frames);

        let before = *frames.slot(0).unwrap();
        fake.wait_idle().unwrap();
        frames.recreate_swapchain_resources(4).unwrap();
        assert_eq!(frames.swapchain_image_count(), 4);
        assert_eq!(fake.live_semaphore_count(), 2 + 4);

        let after = *frames.slot(0).unwrap();
        assert_eq!(after.command_buffer, before.command_buffer);
        assert_eq!(after.submit_complete, before.submit_complete);
        assert_ne!(after.image_acquired, before.image_acquired);
    }

    #[test]
    fn acquired_index_beyond_tracked_images_is_rejected() {
        let fake = Arc::new(FakeDevice::new().with_swapchain_image_count(4));
        let mut frames = pipeline(&fake, 1);
        for _ in 0..3 {
            run_frame(&fake, &mut frames);
        }
        let fence = frames.slot(0).unwrap().submit_complete;
        let signaled_semaphore = frames.slot(0).unwrap().image_acquired;
        assert!(matches!(
            frames.begin_frame(SWAPCHAIN),
            Err(GpuError::InvalidState(_))
        ));
        assert!(fake.fence_is_signaled(fence));

        // The semaphore that acquire signaled must not be handed to the
        // next acquire.
        let replacement = frames.slot(0).unwrap().image_acquired;
        assert_ne!(replacement, signaled_semaphore);
        fake.clear_calls();
        run_frame(&fake, &mut frames);
        let acquired_with: Vec<_> = fake
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::AcquireNextImage { semaphore, .. } => Some(semaphore),
                _ => None,
            })
            .collect();
        assert_eq!(acquired_with, vec![replacement]);

        // Retired once the device is idle.
        frames.recreate_swapchain_resources(4).unwrap();
        assert!(fake.calls().contains(&Call::DestroySemaphore(signaled_semaphore)));
        drop(frames);
        assert_eq!(fake.live_semaphore_count(), 0);
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    fn uniform_copies(ctx: &DeviceContext, count: usize) -> PipelinedBuffer {
        let info = vk::BufferCreateInfo::default()
            .size(64)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER);
        PipelinedBuffer::create(ctx, count, &info, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap()
    }

    #[test]
    fn each_slot_descriptor_set_points_at_its_own_uniform_copy() {
        let fake = Arc::new(FakeDevice::new());
        let ctx = DeviceContext::with_default_allocator(fake.clone());
        let mut frames = pipeline(&fake, 3);
        let mut uniforms = uniform_copies(&ctx, 3);

        let layout = frames
            .create_descriptor_sets(
                &DescriptorSetLayoutBuilder::new().uniform_buffer(0, vk::ShaderStageFlags::ALL),
            )
            .unwrap();
        assert_eq!(frames.descriptor_set_layout(), Some(layout));
        frames.bind_uniform_buffer(0, &uniforms).unwrap();

        let sets: Vec<_> = (0..3).map(|i| frames.slot(i).unwrap().descriptor_set).collect();
        for (i, set) in sets.iter().enumerate() {
            assert_ne!(*set, vk::DescriptorSet::null());
            assert_eq!(fake.descriptor_buffer(*set, 0), Some(uniforms.handle(i)));
            for (j, other) in sets.iter().enumerate() {
                assert_eq!(i == j, set == other);
            }
        }

        for n in 0..8 {
            if n == 4 {
                frames.recreate_swapchain_resources(3).unwrap();
            }
            let frame = frames.begin_frame(SWAPCHAIN).unwrap();
            assert_eq!(frame.descriptor_set, sets[frame.slot]);
            assert_eq!(
                fake.descriptor_buffer(frame.descriptor_set, 0),
                Some(uniforms.handle(frame.slot))
            );
            frames
                .end_frame(frame, graphics_queue(&fake), SWAPCHAIN, STAGE)
                .unwrap();
        }

        drop(frames);
        uniforms.destroy(&ctx);
        assert_eq!(fake.live_descriptor_pool_count(), 0);
        assert_eq!(fake.live_descriptor_set_layout_count(), 0);
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    #[test]
    fn descriptor_binding_rejects_misuse() {
        let fake = Arc::new(FakeDevice::new());
        let ctx = DeviceContext::with_default_allocator(fake.clone());
        let mut frames = pipeline(&fake, 2);
        let mut two = uniform_copies(&ctx, 2);
        let mut three = uniform_copies(&ctx, 3);
        let builder = DescriptorSetLayoutBuilder::new().uniform_buffer(0, vk::ShaderStageFlags::ALL);

        assert!(matches!(
            frames.bind_uniform_buffer(0, &two),
            Err(GpuError::InvalidState(_))
        ));

        fake.inject_failure(FailPoint::CreateDescriptorPool);
        assert!(frames.create_descriptor_sets(&builder).is_err());
        assert_eq!(fake.live_descriptor_set_layout_count(), 0);
        assert_eq!(frames.slot(0).unwrap().descriptor_set, vk::DescriptorSet::null());

        frames.create_descriptor_sets(&builder).unwrap();
        assert!(matches!(
            frames.create_descriptor_sets(&builder),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            frames.bind_uniform_buffer(0, &three),
            Err(GpuError::InvalidState(_))
        ));

        let frame = frames.begin_frame(SWAPCHAIN).unwrap();
        assert!(matches!(
            frames.bind_uniform_buffer(0, &two),
            Err(GpuError::InvalidState(_))
        ));
        frames
            .end_frame(frame, graphics_queue(&fake), SWAPCHAIN, STAGE)
            .unwrap();
        frames.bind_uniform_buffer(0, &two).unwrap();

        drop(frames);
        two.destroy(&ctx);
        three.destroy(&ctx);
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    #[test]
    fn drop_releases_everything() {
        let fake = Arc::new(FakeDevice::new());
        let mut frames = pipeline(&fake, 3);
        for _ in 0..5 {
            run_frame(&fake, &mut frames);
        }
        drop(frames);
        assert_eq!(fake.live_fence_count(), 0);
        assert_eq!(fake.live_semaphore_count(), 0);
        assert_eq!(fake.live_command_buffer_count(), 0);
        assert_eq!(fake.live_command_pool_count(), 0);
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    #[test]
    fn pipelined_buffer_rolls_back_and_bounds_checks() {
        let fake = Arc::new(FakeDevice::new());
        let ctx = DeviceContext::with_default_allocator(fake.clone());
        let info = vk::BufferCreateInfo::default()
            .size(64)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER);
        let props = vk::MemoryPropertyFlags::HOST_VISIBLE;

        // The second buffer's memory allocation fails.
        fake.inject_failure_after(FailPoint::AllocateMemory, 1);
        assert!(PipelinedBuffer::create(&ctx, 2, &info, props).is_err());
        assert_eq!(fake.live_buffer_count(), 0);
        assert_eq!(fake.live_memory_count(), 0);

        let mut uniforms = PipelinedBuffer::create(&ctx, 2, &info, props).unwrap();
        assert_eq!(uniforms.len(), 2);
        assert_ne!(uniforms.handle(0), uniforms.handle(1));
        assert_eq!(uniforms.handle(2), vk::Buffer::null());
        assert!(matches!(
            uniforms.load(&ctx, 2, &[0; 4], 0),
            Err(GpuError::InvalidState(_))
        ));
        uniforms.mapped_mut(1).unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
        uniforms.flush(&ctx, 1).unwrap();
        uniforms.write(&ctx, 0, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let mut back = [0u8; 16];
        uniforms.buffer(0).unwrap().read(&ctx, &mut back, 0).unwrap();
        assert_eq!(bytemuck::cast::<[u8; 16], [f32; 4]>(back), [1.0, 2.0, 3.0, 4.0]);
        uniforms.destroy(&ctx);
        assert_eq!(fake.live_buffer_count(), 0);
    }
}
