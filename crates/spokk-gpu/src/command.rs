//! Command buffer management.

use crate::device::{GpuDevice, SubmitBatch};
use crate::error::Result;
use crate::sync::wait_for_fence;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    device: Arc<dyn GpuDevice>,
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let pool = device.create_command_pool(queue_family, flags)?;
        Ok(Self {
            device,
            pool,
            queue_family,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single command buffer.
    pub fn allocate_command_buffer(&self, level: vk::CommandBufferLevel) -> Result<vk::CommandBuffer> {
        Ok(self.device.allocate_command_buffer(self.pool, level)?)
    }

    /// Allocate multiple primary command buffers.
    ///
    /// On failure the buffers allocated so far are freed.
    pub fn allocate_command_buffers(&self, count: usize) -> Result<Vec<vk::CommandBuffer>> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY) {
                Ok(cb) => buffers.push(cb),
                Err(e) => {
                    for cb in buffers {
                        self.free_command_buffer(cb);
                    }
                    return Err(e);
                }
            }
        }
        Ok(buffers)
    }

    /// Return a command buffer to the pool. It must not be pending.
    pub fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.device.free_command_buffer(self.pool, command_buffer);
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.pool);
    }
}

/// Transient pool for blocking, fire-and-wait command buffers.
///
/// Safe to share across threads: pool access is serialized internally.
/// Submissions go to `queue`, which callers must not use concurrently from
/// other threads.
pub struct OneShotCommandPool {
    device: Arc<dyn GpuDevice>,
    pool: Mutex<vk::CommandPool>,
    queue: vk::Queue,
    queue_family: u32,
}

impl OneShotCommandPool {
    pub fn new(device: Arc<dyn GpuDevice>, queue: vk::Queue, queue_family: u32) -> Result<Self> {
        let pool = device.create_command_pool(queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?;
        Ok(Self {
            device,
            pool: Mutex::new(pool),
            queue,
            queue_family,
        })
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a primary command buffer and begin recording it for a single
    /// submission. If recording cannot begin, the buffer is freed.
    pub fn allocate_and_begin(&self) -> Result<vk::CommandBuffer> {
        let command_buffer = {
            let pool = self.pool.lock();
            self.device
                .allocate_command_buffer(*pool, vk::CommandBufferLevel::PRIMARY)?
        };

        if let Err(e) = self
            .device
            .begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        {
            let pool = self.pool.lock();
            self.device.free_command_buffer(*pool, command_buffer);
            return Err(e.into());
        }
        Ok(command_buffer)
    }

    /// End recording, submit, block until the GPU has finished, then free the
    /// buffer.
    ///
    /// The buffer is freed and `command_buffer` set to null whether or not
    /// the submission succeeded.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_submit_and_free(&self, command_buffer: &mut vk::CommandBuffer) -> Result<()> {
        let result = self.submit_and_wait(*command_buffer);
        {
            let pool = self.pool.lock();
            self.device.free_command_buffer(*pool, *command_buffer);
        }
        *command_buffer = vk::CommandBuffer::null();
        result
    }

    /// Record with `record`, then submit and wait.
    pub fn execute<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&dyn GpuDevice, vk::CommandBuffer),
    {
        let mut command_buffer = self.allocate_and_begin()?;
        record(self.device.as_ref(), command_buffer);
        self.end_submit_and_free(&mut command_buffer)
    }

    fn submit_and_wait(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.device.end_command_buffer(command_buffer)?;

        let fence = self.device.create_fence(false)?;
        let command_buffers = [command_buffer];
        if let Err(e) =
            self.device
                .queue_submit(self.queue, &SubmitBatch::commands(&command_buffers), fence)
        {
            self.device.destroy_fence(fence);
            return Err(e.into());
        }

        let result = wait_for_fence(self.device.as_ref(), fence, u64::MAX);
        if result.is_ok() {
            self.device.destroy_fence(fence);
        } else {
            // Still in flight as far as we know; never destroy a pending fence.
            tracing::warn!("One-shot submission did not complete; leaking its fence");
        }
        result
    }
}

impl Drop for OneShotCommandPool {
    fn drop(&mut self) {
        self.device.destroy_command_pool(*self.pool.get_mut());
    }
}
