//! Per-frame context for rendering.

use ash::vk;
use spokk_gpu::ActiveFrame;

/// The frame being recorded.
pub struct FrameContext {
    /// Command buffer in the recording state.
    pub command_buffer: vk::CommandBuffer,
    /// Frame slot; index per-frame resources with it.
    pub slot: usize,
    /// The slot's descriptor set, or null if the app created none.
    pub descriptor_set: vk::DescriptorSet,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    pub swapchain_image: vk::Image,
    pub swapchain_image_view: vk::ImageView,
    pub extent: vk::Extent2D,
    /// Seconds since the previous frame.
    pub dt: f32,
    pub frame_number: u64,
}

impl FrameContext {
    pub(crate) fn new(
        frame: &ActiveFrame,
        swapchain_image: vk::Image,
        swapchain_image_view: vk::ImageView,
        extent: vk::Extent2D,
        dt: f32,
    ) -> Self {
        Self {
            command_buffer: frame.command_buffer,
            slot: frame.slot,
            descriptor_set: frame.descriptor_set,
            image_index: frame.image_index,
            swapchain_image,
            swapchain_image_view,
            extent,
            dt,
            frame_number: frame.frame_number,
        }
    }

    /// The whole swapchain image as a single color subresource.
    pub fn color_subresource_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }
}
