//! Clear sample application.

use std::path::PathBuf;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use tracing::info;

use spokk_app::{AppContext, DescriptorSetLayoutBuilder, FrameContext, PipelinedBuffer, SpokkApp};

/// Seconds for one trip around the color wheel.
const CYCLE_SECONDS: f32 = 6.0;

/// Per-frame parameters, laid out for a std140 uniform block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct FrameUniforms {
    pub clear_color: [f32; 4],
    pub time: f32,
    pub frame_number: u32,
    pub _pad: [u32; 2],
}

/// Fully saturated color at `phase` in `[0, 1)` around the hue wheel.
pub fn hue_to_rgb(phase: f32) -> [f32; 4] {
    let h = phase.rem_euclid(1.0) * 6.0;
    let channel = |offset: f32| (((h + offset) % 6.0 - 3.0).abs() - 1.0).clamp(0.0, 1.0);
    [channel(0.0), channel(4.0), channel(2.0), 1.0]
}

pub struct ClearApp {
    uniforms: PipelinedBuffer,
    time: f32,
}

impl SpokkApp for ClearApp {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let info = vk::BufferCreateInfo::default()
            .size(std::mem::size_of::<FrameUniforms>() as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER);
        let mut uniforms = PipelinedBuffer::create(
            &ctx.gpu,
            ctx.frames_in_flight(),
            &info,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;

        // Binding 0 of each slot's set reads that slot's uniform copy.
        let bound = ctx
            .frames
            .create_descriptor_sets(
                &DescriptorSetLayoutBuilder::new()
                    .uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS),
            )
            .and_then(|_| ctx.frames.bind_uniform_buffer(0, &uniforms));
        if let Err(e) = bound {
            uniforms.destroy(&ctx.gpu);
            return Err(e.into());
        }

        info!(
            allocator = ctx.gpu.allocator_name(),
            frames_in_flight = ctx.frames_in_flight(),
            "Clear sample ready"
        );
        Ok(Self {
            uniforms,
            time: 0.0,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.time += dt;
    }

    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let params = FrameUniforms {
            clear_color: hue_to_rgb(self.time / CYCLE_SECONDS),
            time: self.time,
            frame_number: frame.frame_number as u32,
            _pad: [0; 2],
        };
        self.uniforms.write(&ctx.gpu, frame.slot, &params)?;

        let device = ctx.device().raw();
        let cmd = frame.command_buffer;
        let range = FrameContext::color_subresource_range();

        // SAFETY: `cmd` is recording and the swapchain image belongs to this
        // frame until it is presented.
        unsafe {
            let to_transfer = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(frame.swapchain_image)
                .subresource_range(range);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_transfer),
            );

            device.cmd_clear_color_image(
                cmd,
                frame.swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue {
                    float32: params.clear_color,
                },
                std::slice::from_ref(&range),
            );

            let to_present = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(frame.swapchain_image)
                .subresource_range(range);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_present),
            );
        }

        Ok(())
    }

    fn on_shaders_changed(
        &mut self,
        _ctx: &mut AppContext,
        paths: &[PathBuf],
    ) -> anyhow::Result<()> {
        for path in paths {
            info!(path = %path.display(), "Shader changed");
        }
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        self.uniforms.destroy(&ctx.gpu);
    }
}
