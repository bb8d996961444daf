//! Buffers and images bound to allocator-managed memory.
//!
//! Both resources are built all-or-nothing: when any step of `create` fails,
//! everything created so far is released before the error is returned.
//! `destroy` is idempotent and must be called explicitly; dropping a live
//! resource leaks its handles and logs a warning.

use crate::command::OneShotCommandPool;
use crate::context::DeviceContext;
use crate::device::QueueInfo;
use crate::error::{GpuError, Result};
use crate::memory::{AllocationScope, DeviceMemoryAllocation};
use ash::vk;

/// Largest payload `vkCmdUpdateBuffer` accepts in one command.
pub const MAX_UPDATE_BUFFER_BYTES: usize = 65536;

/// A buffer, its memory, and an optional texel view.
pub struct Buffer {
    handle: vk::Buffer,
    view: vk::BufferView,
    memory: Option<DeviceMemoryAllocation>,
    size: vk::DeviceSize,
}

impl Buffer {
    /// Create a buffer and bind memory with the requested properties.
    pub fn create(
        ctx: &DeviceContext,
        info: &vk::BufferCreateInfo<'_>,
        properties: vk::MemoryPropertyFlags,
        scope: AllocationScope,
    ) -> Result<Self> {
        let device = ctx.device();
        let handle = device.create_buffer(info)?;
        match ctx.device_alloc_and_bind_to_buffer(handle, properties, scope) {
            Ok(memory) => {
                tracing::trace!(size = info.size, host_visible = memory.is_host_visible(), "Created buffer");
                Ok(Self {
                    handle,
                    view: vk::BufferView::null(),
                    memory: Some(memory),
                    size: info.size,
                })
            }
            Err(e) => {
                device.destroy_buffer(handle);
                Err(e)
            }
        }
    }

    /// Create a texel view over the whole buffer.
    pub fn create_view(&mut self, ctx: &DeviceContext, format: vk::Format) -> Result<()> {
        if self.is_null() {
            return Err(GpuError::NullResource("buffer"));
        }
        if self.view != vk::BufferView::null() {
            return Err(GpuError::InvalidState("buffer already has a view".to_string()));
        }
        let info = vk::BufferViewCreateInfo::default()
            .buffer(self.handle)
            .format(format)
            .offset(0)
            .range(vk::WHOLE_SIZE);
        self.view = ctx.device().create_buffer_view(&info)?;
        Ok(())
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn view(&self) -> vk::BufferView {
        self.view
    }

    /// Size requested at creation; the allocation may be larger.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory(&self) -> Option<&DeviceMemoryAllocation> {
        self.memory.as_ref()
    }

    /// Whether the buffer was never created or has been destroyed.
    pub fn is_null(&self) -> bool {
        self.handle == vk::Buffer::null()
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory
            .as_ref()
            .is_some_and(DeviceMemoryAllocation::is_host_visible)
    }

    /// Mutable host view of the buffer contents, if host-visible.
    ///
    /// Call [`Self::flush`] after writing unless the memory is coherent.
    pub fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        let size = self.size as usize;
        self.memory
            .as_mut()
            .and_then(DeviceMemoryAllocation::bytes_mut)
            .map(|bytes| &mut bytes[..size])
    }

    /// Make host writes visible to the device.
    pub fn flush(&self, ctx: &DeviceContext) -> Result<()> {
        match &self.memory {
            Some(memory) => memory.flush(ctx.device().as_ref()),
            None => Err(GpuError::NullResource("buffer")),
        }
    }

    /// Make device writes visible to the host.
    pub fn invalidate(&self, ctx: &DeviceContext) -> Result<()> {
        match &self.memory {
            Some(memory) => memory.invalidate(ctx.device().as_ref()),
            None => Err(GpuError::NullResource("buffer")),
        }
    }

    /// Copy `src` into the buffer at `dst_offset`.
    ///
    /// Host-visible buffers are written through their mapping (invalidate,
    /// copy, flush). Device-local buffers are updated with in-command-buffer
    /// updates on a transfer-capable queue; this path requires `dst_offset`
    /// and `src.len()` to be multiples of 4, and blocks until the GPU has
    /// finished.
    ///
    /// No queue family ownership transfer is recorded. When the transfer
    /// queue belongs to a dedicated family, a device-local buffer must either
    /// be created with `CONCURRENT` sharing across the families that use it
    /// or only ever be used on that transfer family.
    pub fn load(&mut self, ctx: &DeviceContext, src: &[u8], dst_offset: vk::DeviceSize) -> Result<()> {
        if self.is_null() {
            return Err(GpuError::NullResource("buffer"));
        }
        let end = dst_offset
            .checked_add(src.len() as u64)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "load of {} bytes at offset {dst_offset} overruns buffer of {} bytes",
                    src.len(),
                    self.size
                ))
            })?;
        if src.is_empty() {
            return Ok(());
        }

        let device = ctx.device().as_ref();
        if let Some(memory) = self.memory.as_mut().filter(|m| m.is_host_visible()) {
            memory.invalidate(device)?;
            if let Some(bytes) = memory.bytes_mut() {
                bytes[dst_offset as usize..end as usize].copy_from_slice(src);
            }
            memory.flush(device)?;
            return Ok(());
        }

        if dst_offset % 4 != 0 || src.len() % 4 != 0 {
            return Err(GpuError::UnsupportedTransfer(format!(
                "device-local load of {} bytes at offset {dst_offset} is not 4-byte aligned",
                src.len()
            )));
        }
        let queue = ctx.transfer_queue().ok_or_else(|| {
            GpuError::UnsupportedTransfer("no transfer-capable queue".to_string())
        })?;
        let pool = OneShotCommandPool::new(ctx.device().clone(), queue.queue, queue.family)?;
        let handle = self.handle;
        pool.execute(|device, command_buffer| {
            let mut offset = dst_offset;
            for chunk in src.chunks(MAX_UPDATE_BUFFER_BYTES) {
                device.cmd_update_buffer(command_buffer, handle, offset, chunk);
                offset += chunk.len() as u64;
            }
        })?;
        tracing::trace!(bytes = src.len(), "Loaded device-local buffer");
        Ok(())
    }

    /// Copy buffer contents at `src_offset` into `dst`. Host-visible only.
    pub fn read(&self, ctx: &DeviceContext, dst: &mut [u8], src_offset: vk::DeviceSize) -> Result<()> {
        let memory = self.memory.as_ref().ok_or(GpuError::NullResource("buffer"))?;
        let end = src_offset
            .checked_add(dst.len() as u64)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| GpuError::InvalidState("read overruns buffer".to_string()))?;
        memory.invalidate(ctx.device().as_ref())?;
        let bytes = memory.bytes().ok_or_else(|| {
            GpuError::UnsupportedTransfer("read from device-local buffer".to_string())
        })?;
        dst.copy_from_slice(&bytes[src_offset as usize..end as usize]);
        Ok(())
    }

    /// Release the memory, the view, and the buffer. Safe to call twice.
    pub fn destroy(&mut self, ctx: &DeviceContext) {
        let device = ctx.device();
        if let Some(memory) = self.memory.take() {
            if let Err(e) = ctx.device_free(memory) {
                tracing::warn!("Failed to free buffer memory: {e}");
            }
        }
        if self.view != vk::BufferView::null() {
            device.destroy_buffer_view(self.view);
            self.view = vk::BufferView::null();
        }
        if self.handle != vk::Buffer::null() {
            device.destroy_buffer(self.handle);
            self.handle = vk::Buffer::null();
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.is_null() {
            tracing::warn!(buffer = ?self.handle, "Buffer dropped without destroy(); leaking handle");
        }
    }
}

/// An image, its memory, and a view covering all of it.
pub struct Image {
    handle: vk::Image,
    view: vk::ImageView,
    memory: Option<DeviceMemoryAllocation>,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
}

impl Image {
    /// Create an image, bind memory, and create its default view.
    pub fn create(
        ctx: &DeviceContext,
        info: &vk::ImageCreateInfo<'_>,
        properties: vk::MemoryPropertyFlags,
        scope: AllocationScope,
    ) -> Result<Self> {
        let device = ctx.device();
        let handle = device.create_image(info)?;
        let linear = info.tiling == vk::ImageTiling::LINEAR;
        let memory = match ctx.device_alloc_and_bind_to_image(handle, properties, scope, linear) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_image(handle);
                return Err(e);
            }
        };
        let view = match device.create_image_view(&image_view_info(handle, info)) {
            Ok(view) => view,
            Err(e) => {
                if let Err(free_err) = ctx.device_free(memory) {
                    tracing::warn!("Failed to free image memory: {free_err}");
                }
                device.destroy_image(handle);
                return Err(e.into());
            }
        };
        Ok(Self {
            handle,
            view,
            memory: Some(memory),
            format: info.format,
            extent: info.extent,
            mip_levels: info.mip_levels.max(1),
            array_layers: info.array_layers.max(1),
        })
    }

    /// Create an image and fill it with `pixels` (see [`Self::load`]). If the
    /// upload fails the image is destroyed again.
    pub fn create_and_load(
        ctx: &DeviceContext,
        info: &vk::ImageCreateInfo<'_>,
        pixels: &[u8],
        properties: vk::MemoryPropertyFlags,
        scope: AllocationScope,
        final_layout: vk::ImageLayout,
        final_access: vk::AccessFlags,
    ) -> Result<Self> {
        let mut image = Self::create(ctx, info, properties, scope)?;
        if let Err(e) = image.load(ctx, pixels, final_layout, final_access) {
            image.destroy(ctx);
            return Err(e);
        }
        Ok(image)
    }

    /// Upload tightly packed texels into mip level 0 of every array layer,
    /// then leave all subresources in `final_layout`.
    ///
    /// The texels pass through a host-visible staging buffer and a blocking
    /// submission on a graphics queue. The image must have `TRANSFER_DST`
    /// usage; previous contents are discarded. Only single-aspect color
    /// formats with a known texel size are supported.
    pub fn load(
        &mut self,
        ctx: &DeviceContext,
        pixels: &[u8],
        final_layout: vk::ImageLayout,
        final_access: vk::AccessFlags,
    ) -> Result<()> {
        if self.is_null() {
            return Err(GpuError::NullResource("image"));
        }
        let texel_size = texel_size_of(self.format).ok_or_else(|| {
            GpuError::UnsupportedTransfer(format!("no staging layout for {:?}", self.format))
        })?;
        let expected = texel_size
            * u64::from(self.extent.width)
            * u64::from(self.extent.height)
            * u64::from(self.extent.depth)
            * u64::from(self.array_layers);
        if pixels.len() as u64 != expected {
            return Err(GpuError::InvalidState(format!(
                "image load of {} bytes, expected {expected}",
                pixels.len()
            )));
        }
        let queue = ctx
            .find_queue(vk::QueueFlags::GRAPHICS)
            .ok_or_else(|| GpuError::UnsupportedTransfer("no graphics queue".to_string()))?;

        let staging_info = vk::BufferCreateInfo::default()
            .size(expected)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let mut staging = Buffer::create(
            ctx,
            &staging_info,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            AllocationScope::Device,
        )?;
        let uploaded = staging
            .load(ctx, pixels, 0)
            .and_then(|()| self.copy_from_staging(ctx, queue, &staging, final_layout, final_access));
        staging.destroy(ctx);
        uploaded?;

        tracing::trace!(bytes = pixels.len(), layout = ?final_layout, "Loaded image");
        Ok(())
    }

    fn copy_from_staging(
        &self,
        ctx: &DeviceContext,
        queue: QueueInfo,
        staging: &Buffer,
        final_layout: vk::ImageLayout,
        final_access: vk::AccessFlags,
    ) -> Result<()> {
        let image = self.handle;
        let source = staging.handle();
        let aspect_mask = aspect_mask_for(self.format);
        let range = vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        };
        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: self.array_layers,
            })
            .image_extent(self.extent);
        let to_transfer = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range);
        let to_final = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(final_access)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(final_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range);

        let pool = OneShotCommandPool::new(ctx.device().clone(), queue.queue, queue.family)?;
        pool.execute(|device, command_buffer| {
            device.cmd_image_barrier(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                &to_transfer,
            );
            device.cmd_copy_buffer_to_image(
                command_buffer,
                source,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
            device.cmd_image_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                &to_final,
            );
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn memory(&self) -> Option<&DeviceMemoryAllocation> {
        self.memory.as_ref()
    }

    pub fn is_null(&self) -> bool {
        self.handle == vk::Image::null()
    }

    /// Release the memory, the view, and the image. Safe to call twice.
    pub fn destroy(&mut self, ctx: &DeviceContext) {
        let device = ctx.device();
        if let Some(memory) = self.memory.take() {
            if let Err(e) = ctx.device_free(memory) {
                tracing::warn!("Failed to free image memory: {e}");
            }
        }
        if self.view != vk::ImageView::null() {
            device.destroy_image_view(self.view);
            self.view = vk::ImageView::null();
        }
        if self.handle != vk::Image::null() {
            device.destroy_image(self.handle);
            self.handle = vk::Image::null();
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if !self.is_null() {
            tracing::warn!(image = ?self.handle, "Image dropped without destroy(); leaking handle");
        }
    }
}

/// Describe a view covering every mip level and array layer of an image.
pub fn image_view_info(image: vk::Image, info: &vk::ImageCreateInfo<'_>) -> vk::ImageViewCreateInfo<'static> {
    let layers = info.array_layers.max(1);
    let cube_compatible = info.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE);
    let view_type = match info.image_type {
        vk::ImageType::TYPE_1D if layers > 1 => vk::ImageViewType::TYPE_1D_ARRAY,
        vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
        vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
        _ if cube_compatible && layers == 6 => vk::ImageViewType::CUBE,
        _ if cube_compatible && layers % 6 == 0 => vk::ImageViewType::CUBE_ARRAY,
        _ if layers > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
        _ => vk::ImageViewType::TYPE_2D,
    };

    vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(info.format)
        .components(vk::ComponentMapping::default())
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_mask_for(info.format),
            base_mip_level: 0,
            level_count: info.mip_levels.max(1),
            base_array_layer: 0,
            layer_count: layers,
        })
}

/// Bytes per texel of the uncompressed color formats images can be loaded
/// from.
pub fn texel_size_of(format: vk::Format) -> Option<vk::DeviceSize> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB | vk::Format::R8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB | vk::Format::R16_SFLOAT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// Aspects present in a format.
pub fn aspect_mask_for(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FailPoint, FakeDevice};
    use std::sync::Arc;

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    fn context() -> (Arc<FakeDevice>, DeviceContext) {
        let fake = Arc::new(FakeDevice::new());
        let ctx = DeviceContext::with_default_allocator(fake.clone());
        (fake, ctx)
    }

    fn buffer_info(size: u64) -> vk::BufferCreateInfo<'static> {
        vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
    }

    fn image_info() -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width: 32,
                height: 32,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED)
    }

    #[test]
    fn host_visible_load_and_read_round_trip() {
        let (fake, ctx) = context();
        let mut buffer = Buffer::create(&ctx, &buffer_info(256), HOST, AllocationScope::Device).unwrap();
        assert!(buffer.is_host_visible());

        let payload: Vec<u8> = (0..64).collect();
        buffer.load(&ctx, &payload, 16).unwrap();

        let mut back = vec![0u8; 64];
        buffer.read(&ctx, &mut back, 16).unwrap();
        assert_eq!(back, payload);

        // Invalidate, copy, flush; no command buffers involved.
        let calls = fake.calls();
        let invalidate = calls
            .iter()
            .position(|c| matches!(c, Call::InvalidateMappedRange { .. }))
            .unwrap();
        let flush = calls
            .iter()
            .position(|c| matches!(c, Call::FlushMappedRange { .. }))
            .unwrap();
        assert!(invalidate < flush);
        assert!(!calls.iter().any(|c| matches!(c, Call::Submit { .. })));

        buffer.destroy(&ctx);
        assert!(fake.violations().is_empty());
    }

    #[test]
    fn device_local_load_uses_chunked_updates() {
        let (fake, ctx) = context();
        let size = 3 * MAX_UPDATE_BUFFER_BYTES as u64;
        let mut buffer = Buffer::create(
            &ctx,
            &buffer_info(size),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            AllocationScope::Device,
        )
        .unwrap();
        assert!(!buffer.is_host_visible());

        let payload: Vec<u8> = (0..(2 * MAX_UPDATE_BUFFER_BYTES + 8))
            .map(|i| (i % 251) as u8)
            .collect();
        buffer.load(&ctx, &payload, 4).unwrap();

        let updates: Vec<(u64, usize)> = fake
            .calls()
            .iter()
            .filter_map(|c| match c {
                Call::UpdateBuffer { offset, size, .. } => Some((*offset, *size)),
                _ => None,
            })
            .collect();
        assert_eq!(
            updates,
            vec![
                (4, MAX_UPDATE_BUFFER_BYTES),
                (4 + MAX_UPDATE_BUFFER_BYTES as u64, MAX_UPDATE_BUFFER_BYTES),
                (4 + 2 * MAX_UPDATE_BUFFER_BYTES as u64, 8),
            ]
        );

        let memory = buffer.memory().unwrap().memory();
        let contents = fake.memory_contents(memory);
        assert_eq!(&contents[4..4 + payload.len()], payload.as_slice());

        // The transient pool and its command buffer are gone again.
        assert_eq!(fake.live_command_pool_count(), 0);
        assert_eq!(fake.live_command_buffer_count(), 0);

        buffer.destroy(&ctx);
        assert!(fake.violations().is_empty());
    }

    #[test]
    fn device_local_load_requires_alignment() {
        let (_fake, ctx) = context();
        let mut buffer = Buffer::create(
            &ctx,
            &buffer_info(64),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            AllocationScope::Device,
        )
        .unwrap();
        assert!(matches!(
            buffer.load(&ctx, &[1, 2, 3], 0),
            Err(GpuError::UnsupportedTransfer(_))
        ));
        assert!(matches!(
            buffer.load(&ctx, &[1, 2, 3, 4], 2),
            Err(GpuError::UnsupportedTransfer(_))
        ));
        buffer.destroy(&ctx);
    }

    #[test]
    fn load_rejects_overruns_and_destroyed_buffers() {
        let (_fake, ctx) = context();
        let mut buffer = Buffer::create(&ctx, &buffer_info(64), HOST, AllocationScope::Device).unwrap();
        assert!(matches!(
            buffer.load(&ctx, &[0; 16], 56),
            Err(GpuError::InvalidState(_))
        ));
        buffer.destroy(&ctx);
        assert!(matches!(
            buffer.load(&ctx, &[0; 4], 0),
            Err(GpuError::NullResource(_))
        ));
    }

    #[test]
    fn failed_allocation_rolls_back_buffer() {
        let (fake, ctx) = context();
        fake.inject_failure(FailPoint::AllocateMemory);
        let result = Buffer::create(&ctx, &buffer_info(128), HOST, AllocationScope::Device);
        assert!(result.is_err());
        assert_eq!(fake.live_buffer_count(), 0);
        assert_eq!(fake.live_memory_count(), 0);
    }

    #[test]
    fn unsatisfiable_properties_roll_back_buffer() {
        let fake = Arc::new(FakeDevice::with_memory_types(
            crate::device::MemoryTypeTable::from_flags([vk::MemoryPropertyFlags::DEVICE_LOCAL]),
        ));
        let ctx = DeviceContext::with_default_allocator(fake.clone());
        let result = Buffer::create(&ctx, &buffer_info(128), HOST, AllocationScope::Device);
        assert!(matches!(result, Err(GpuError::NoMatchingMemoryType { .. })));
        assert_eq!(fake.live_buffer_count(), 0);
    }

    #[test]
    fn destroy_is_idempotent() {
        let (fake, ctx) = context();
        let mut buffer = Buffer::create(&ctx, &buffer_info(128), HOST, AllocationScope::Device).unwrap();
        buffer
            .create_view(&ctx, vk::Format::R32_SFLOAT)
            .unwrap();
        buffer.destroy(&ctx);
        buffer.destroy(&ctx);
        assert!(buffer.is_null());
        assert_eq!(fake.live_buffer_count(), 0);
        assert_eq!(fake.live_memory_count(), 0);
        assert_eq!(fake.live_view_count(), 0);
        assert!(fake.violations().is_empty());
    }

    #[test]
    fn mapped_view_is_limited_to_requested_size() {
        let (_fake, ctx) = context();
        let mut buffer = Buffer::create(&ctx, &buffer_info(100), HOST, AllocationScope::Device).unwrap();
        assert_eq!(buffer.mapped_mut().map(|m| m.len()), Some(100));
        assert_eq!(buffer.memory().map(DeviceMemoryAllocation::size), Some(256));
        buffer.destroy(&ctx);
    }

    #[test]
    fn image_create_and_destroy() {
        let (fake, ctx) = context();
        let mut image = Image::create(
            &ctx,
            &image_info(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            AllocationScope::Device,
        )
        .unwrap();
        assert!(!image.is_null());
        assert_ne!(image.view(), vk::ImageView::null());
        assert_eq!(image.format(), vk::Format::R8G8B8A8_UNORM);
        image.destroy(&ctx);
        image.destroy(&ctx);
        assert_eq!(fake.live_image_count(), 0);
        assert_eq!(fake.live_view_count(), 0);
        assert_eq!(fake.live_memory_count(), 0);
        assert!(fake.violations().is_empty());
    }

    #[test]
    fn image_rolls_back_on_every_failure() {
        for point in [
            FailPoint::CreateImage,
            FailPoint::AllocateMemory,
            FailPoint::BindImageMemory,
            FailPoint::CreateImageView,
        ] {
            let (fake, ctx) = context();
            fake.inject_failure(point);
            let result = Image::create(
                &ctx,
                &image_info(),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                AllocationScope::Device,
            );
            assert!(result.is_err(), "{point:?} should fail creation");
            assert_eq!(fake.live_image_count(), 0, "{point:?}");
            assert_eq!(fake.live_memory_count(), 0, "{point:?}");
            assert_eq!(fake.live_view_count(), 0, "{point:?}");
        }
    }

    fn texture_info() -> vk::ImageCreateInfo<'static> {
        image_info().usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
    }

    fn texels() -> Vec<u8> {
        (0..32 * 32 * 4).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn device_local_load_runs_on_the_transfer_family_without_ownership_transfer() {
        let (fake, ctx) = context();
        let mut buffer = Buffer::create(
            &ctx,
            &buffer_info(256),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            AllocationScope::Device,
        )
        .unwrap();
        buffer.load(&ctx, &[1, 2, 3, 4], 0).unwrap();

        let transfer = ctx.transfer_queue().unwrap();
        assert_eq!(transfer.family, 1);
        let calls = fake.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, Call::Submit { queue, .. } if *queue == transfer.queue)));
        assert!(!calls.iter().any(|c| matches!(c, Call::ImageBarrier { .. })));
        buffer.destroy(&ctx);
    }

    #[test]
    fn image_load_transitions_copies_and_transitions_again() {
        let (fake, ctx) = context();
        let pixels = texels();
        let mut image = Image::create_and_load(
            &ctx,
            &texture_info(),
            &pixels,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            AllocationScope::Device,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
        )
        .unwrap();
        let handle = image.handle();

        let calls = fake.calls();
        let position = |wanted: &dyn Fn(&Call) -> bool| calls.iter().position(|c| wanted(c)).unwrap();
        let staging = match &calls[position(&|c| matches!(c, Call::CreateBuffer(_)))] {
            Call::CreateBuffer(buffer) => *buffer,
            _ => unreachable!(),
        };
        let to_transfer = position(&|c| {
            matches!(c, Call::ImageBarrier { image, old_layout, new_layout, .. }
                if *image == handle
                    && *old_layout == vk::ImageLayout::UNDEFINED
                    && *new_layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        });
        let copy = position(&|c| {
            matches!(c, Call::CopyBufferToImage { buffer, image, layout, .. }
                if *buffer == staging
                    && *image == handle
                    && *layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        });
        let to_final = position(&|c| {
            matches!(c, Call::ImageBarrier { old_layout, new_layout, .. }
                if *old_layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL
                    && *new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        });
        let submit = position(&|c| matches!(c, Call::Submit { .. }));
        let staging_gone = position(&|c| *c == Call::DestroyBuffer(staging));
        assert!(to_transfer < copy && copy < to_final && to_final < submit && submit < staging_gone);

        // Layout transitions need a graphics queue.
        let graphics = ctx.find_queue(vk::QueueFlags::GRAPHICS).unwrap();
        assert!(matches!(&calls[submit], Call::Submit { queue, .. } if *queue == graphics.queue));

        assert_eq!(
            fake.image_layout(handle),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
        let memory = fake.image_memory(handle).unwrap();
        assert_eq!(&fake.memory_contents(memory)[..pixels.len()], pixels.as_slice());
        assert_eq!(fake.live_buffer_count(), 0);
        assert_eq!(fake.live_command_pool_count(), 0);

        image.destroy(&ctx);
        assert_eq!(fake.live_memory_count(), 0);
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    #[test]
    fn failed_image_load_destroys_everything() {
        for point in [
            FailPoint::CreateBuffer,
            FailPoint::MapMemory,
            FailPoint::BeginCommandBuffer,
            FailPoint::QueueSubmit,
        ] {
            let (fake, ctx) = context();
            fake.inject_failure(point);
            let result = Image::create_and_load(
                &ctx,
                &texture_info(),
                &texels(),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                AllocationScope::Device,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::SHADER_READ,
            );
            assert!(result.is_err(), "{point:?} should fail the load");
            assert_eq!(fake.live_image_count(), 0, "{point:?}");
            assert_eq!(fake.live_view_count(), 0, "{point:?}");
            assert_eq!(fake.live_buffer_count(), 0, "{point:?}");
            assert_eq!(fake.live_memory_count(), 0, "{point:?}");
            assert_eq!(fake.live_command_buffer_count(), 0, "{point:?}");
            assert_eq!(fake.live_command_pool_count(), 0, "{point:?}");
        }
    }

    #[test]
    fn image_load_rejects_wrong_sizes_and_formats() {
        let (fake, ctx) = context();
        let mut image = Image::create(
            &ctx,
            &texture_info(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            AllocationScope::Device,
        )
        .unwrap();
        let result = image.load(
            &ctx,
            &[0u8; 16],
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
        );
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        image.destroy(&ctx);

        let depth = texture_info().format(vk::Format::D24_UNORM_S8_UINT);
        let mut image = Image::create(
            &ctx,
            &depth,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            AllocationScope::Device,
        )
        .unwrap();
        let result = image.load(
            &ctx,
            &texels(),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        );
        assert!(matches!(result, Err(GpuError::UnsupportedTransfer(_))));
        image.destroy(&ctx);

        let result = image.load(
            &ctx,
            &texels(),
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::empty(),
        );
        assert!(matches!(result, Err(GpuError::NullResource(_))));
        assert_eq!(fake.live_buffer_count(), 0);
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    #[test]
    fn view_type_follows_image_shape() {
        let image = vk::Image::null();
        let cube = image_info()
            .flags(vk::ImageCreateFlags::CUBE_COMPATIBLE)
            .array_layers(6);
        assert_eq!(image_view_info(image, &cube).view_type, vk::ImageViewType::CUBE);

        let cube_array = cube.array_layers(12);
        assert_eq!(
            image_view_info(image, &cube_array).view_type,
            vk::ImageViewType::CUBE_ARRAY
        );

        let array = image_info().array_layers(4);
        let view = image_view_info(image, &array);
        assert_eq!(view.view_type, vk::ImageViewType::TYPE_2D_ARRAY);
        assert_eq!(view.subresource_range.layer_count, 4);

        let volume = image_info().image_type(vk::ImageType::TYPE_3D);
        assert_eq!(image_view_info(image, &volume).view_type, vk::ImageViewType::TYPE_3D);
    }

    #[test]
    fn aspect_follows_format() {
        assert_eq!(aspect_mask_for(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask_for(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_mask_for(vk::Format::B8G8R8A8_SRGB), vk::ImageAspectFlags::COLOR);
    }
}
