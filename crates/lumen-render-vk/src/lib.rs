// SPDX-License-Identifier: CEPL-1.0
//! Vulkan implementation of the `lumen-render` backend traits.
//!
//! Requires Vulkan 1.3 (dynamic rendering, synchronization2 and timeline
//! semaphores). The fence timeline is a timeline semaphore; frame latency
//! uses `VK_KHR_present_wait` when the driver exposes it.
use ash::vk;
use lumen_render::{Backend, GpuError, GpuResult};

mod device;
mod instance;
mod scene;
mod surface;
mod swapchain;

pub use device::{VkCommandAllocator, VkCommandList, VkDevice, VkFence, VkPipelineState, VkQueue};
pub use instance::VkInstance;
pub use scene::ClearScene;
pub use swapchain::{VkImage, VkImageView, VkSwapchain};

pub struct VkBackend;

impl Backend for VkBackend {
    type Instance = VkInstance;
    type Device = VkDevice;
    type Queue = VkQueue;
    type Fence = VkFence;
    type CommandAllocator = VkCommandAllocator;
    type CommandList = VkCommandList;
    type Swapchain = VkSwapchain;
    type RenderTarget = VkImage;
    type RenderTargetView = VkImageView;
    type PipelineState = VkPipelineState;
}

/// Maps a Vulkan result code onto the core's error classes.
pub(crate) fn gpu_error(op: &'static str, result: vk::Result) -> GpuError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
        vk::Result::ERROR_OUT_OF_DATE_KHR => GpuError::SurfaceOutdated,
        other => GpuError::call(op, format!("{other:?}")),
    }
}

pub(crate) trait VkResultExt<T> {
    fn gpu(self, op: &'static str) -> GpuResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn gpu(self, op: &'static str) -> GpuResult<T> {
        self.map_err(|e| gpu_error(op, e))
    }
}
