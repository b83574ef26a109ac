// SPDX-License-Identifier: CEPL-1.0
//! Minimal scene: clears the frame and marks the four corners, so edge
//! artifacts during a live resize are easy to spot.
use ash::vk;
use lumen_render::{ColorInfo, ColorSpace, FrameTarget, GpuResult, RenderSize, Scene};
use tracing::debug;

use crate::{VkBackend, VkCommandList};

/// Side of a corner marker at scale 1.0, in pixels.
const MARKER_SIZE: f32 = 200.0;

pub struct ClearScene {
    /// sRGB-encoded RGBA.
    clear_color: [f32; 4],
    scale: f32,
}

impl ClearScene {
    pub fn new(clear_color: [f32; 4]) -> Self {
        Self {
            clear_color,
            scale: 1.0,
        }
    }
}

impl Scene<VkBackend> for ClearScene {
    fn on_size_changed(&mut self, size: RenderSize, scale: f32) {
        debug!(width = size.width, height = size.height, scale, "scene resized");
        self.scale = scale;
    }

    fn on_color_info_changed(&mut self, color: &ColorInfo, format_changed: bool) {
        debug!(kind = %color.kind, format_changed, "scene colour changed");
    }

    fn record(
        &mut self,
        list: &mut VkCommandList,
        frame: &FrameTarget<'_, VkBackend>,
    ) -> GpuResult<()> {
        let device = list.device();
        let cmd = list.command_buffer();
        let image = frame.view.image();
        let extent = frame.view.extent();

        let background = clear_value(self.clear_color, frame.color_space, frame.brightness_boost);
        let marker = clear_value([1.0; 4], frame.color_space, frame.brightness_boost);
        let rects = corner_rects(extent, self.scale);

        unsafe {
            transition(
                device,
                cmd,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            );

            let color_att = vk::RenderingAttachmentInfo {
                s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
                image_view: frame.view.view(),
                image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                clear_value: vk::ClearValue {
                    color: vk::ClearColorValue { float32: background },
                },
                ..Default::default()
            };
            let rendering_info = vk::RenderingInfo {
                s_type: vk::StructureType::RENDERING_INFO,
                render_area: vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                },
                layer_count: 1,
                color_attachment_count: 1,
                p_color_attachments: &color_att,
                ..Default::default()
            };
            device.cmd_begin_rendering(cmd, &rendering_info);

            if !rects.is_empty() {
                let attachment = vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    color_attachment: 0,
                    clear_value: vk::ClearValue {
                        color: vk::ClearColorValue { float32: marker },
                    },
                };
                device.cmd_clear_attachments(cmd, std::slice::from_ref(&attachment), &rects);
            }

            device.cmd_end_rendering(cmd);
            transition(
                device,
                cmd,
                image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        }
        Ok(())
    }
}

unsafe fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let to_present = new_layout == vk::ImageLayout::PRESENT_SRC_KHR;
    let (src_stage_mask, src_access_mask, dst_stage_mask, dst_access_mask) = if to_present {
        (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::empty(),
        )
    } else {
        // Same stage as the acquire-semaphore wait, so the layout change
        // happens after the presentation engine let go of the image.
        (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::empty(),
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        )
    };

    let barrier = vk::ImageMemoryBarrier2 {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
        src_stage_mask,
        src_access_mask,
        dst_stage_mask,
        dst_access_mask,
        old_layout,
        new_layout,
        image,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    let dep = vk::DependencyInfo {
        s_type: vk::StructureType::DEPENDENCY_INFO,
        image_memory_barrier_count: 1,
        p_image_memory_barriers: &barrier,
        ..Default::default()
    };
    device.cmd_pipeline_barrier2(cmd, &dep);
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Linear clear colour for the target. Both paths take linear values: the
/// SDR view is an sRGB format and scRGB is linear by definition. The boost
/// scales SDR content up to the display's reference white.
fn clear_value(srgb: [f32; 4], color_space: ColorSpace, boost: Option<f32>) -> [f32; 4] {
    let gain = match color_space {
        ColorSpace::ScRgbLinear => boost.unwrap_or(1.0),
        ColorSpace::SrgbNonLinear => 1.0,
    };
    let [r, g, b, a] = srgb;
    [
        srgb_to_linear(r) * gain,
        srgb_to_linear(g) * gain,
        srgb_to_linear(b) * gain,
        a,
    ]
}

/// Squares in the four corners, clamped so they never overlap.
fn corner_rects(extent: vk::Extent2D, scale: f32) -> Vec<vk::ClearRect> {
    let wanted = (MARKER_SIZE * scale).round().max(0.0) as u32;
    let side = wanted.min(extent.width / 2).min(extent.height / 2);
    if side == 0 {
        return Vec::new();
    }

    let right = (extent.width - side) as i32;
    let bottom = (extent.height - side) as i32;
    [(0, 0), (right, 0), (0, bottom), (right, bottom)]
        .into_iter()
        .map(|(x, y)| vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x, y },
                extent: vk::Extent2D {
                    width: side,
                    height: side,
                },
            },
            base_array_layer: 0,
            layer_count: 1,
        })
        .collect()
}
