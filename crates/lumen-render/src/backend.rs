// SPDX-License-Identifier: CEPL-1.0
//! The seam between the presentation core and a GPU API.
//!
//! A [`Backend`] names one concrete type per GPU object; the core only talks
//! to those objects through the traits below. Every call returns a
//! [`GpuResult`] and the backend maps its own device-removed/device-reset
//! codes to [`GpuError::DeviceLost`](crate::GpuError::DeviceLost).
use std::time::Duration;

use crate::color::{ColorSpace, PixelFormat};
use crate::error::GpuResult;

pub trait Backend: Sized + 'static {
    type Instance: Instance<Self>;
    type Device: Device<Self>;
    type Queue: Queue<Self>;
    type Fence: Fence;
    type CommandAllocator: CommandAllocator;
    type CommandList: CommandList<Self>;
    type Swapchain: Swapchain<Self>;
    type RenderTarget;
    type RenderTargetView;
    type PipelineState;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Hardware,
    /// WARP on D3D12, a CPU implementation on Vulkan.
    Software,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Enumeration order; stable until the adapter set changes.
    pub ordinal: u32,
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub kind: AdapterKind,
}

impl AdapterInfo {
    pub fn is_software(&self) -> bool {
        self.kind == AdapterKind::Software
    }
}

/// Adapter enumeration and device creation. Owns the window surface, so
/// swap chains created later present into the same window.
pub trait Instance<B: Backend> {
    fn enumerate_adapters(&mut self) -> GpuResult<Vec<AdapterInfo>>;
    fn create_device(&mut self, adapter: &AdapterInfo) -> GpuResult<B::Device>;
    /// Cheap capability probe: could `create_device` succeed on `adapter`?
    fn supports_device(&mut self, adapter: &AdapterInfo) -> bool;
    /// Whether the adapter set may have changed since the last enumeration.
    fn adapters_changed(&mut self) -> bool {
        true
    }
}

pub trait Device<B: Backend> {
    fn create_queue(&self) -> GpuResult<B::Queue>;
    fn create_fence(&self, initial_value: u64) -> GpuResult<B::Fence>;
    fn create_command_allocator(&self) -> GpuResult<B::CommandAllocator>;
    /// The list is returned closed; `reset` opens it for recording.
    fn create_command_list(&self, allocator: &B::CommandAllocator) -> GpuResult<B::CommandList>;
    fn create_swapchain(&self, queue: &B::Queue, desc: &SwapchainDesc) -> GpuResult<B::Swapchain>;
    fn create_render_target_view(
        &self,
        target: &B::RenderTarget,
        format: PixelFormat,
    ) -> GpuResult<B::RenderTargetView>;
}

pub trait Queue<B: Backend> {
    fn execute(&self, list: &B::CommandList) -> GpuResult<()>;
    /// Queue-side signal: `fence` reaches `value` once prior work retires.
    fn signal(&self, fence: &B::Fence, value: u64) -> GpuResult<()>;
}

pub trait Fence {
    fn completed_value(&self) -> GpuResult<u64>;
    /// Blocks until the completed value is at least `value`.
    fn wait(&self, value: u64) -> GpuResult<()>;
}

pub trait CommandAllocator {
    fn reset(&mut self) -> GpuResult<()>;
}

pub trait CommandList<B: Backend> {
    fn reset(
        &mut self,
        allocator: &B::CommandAllocator,
        initial_state: Option<&B::PipelineState>,
    ) -> GpuResult<()>;
    fn close(&mut self) -> GpuResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub buffer_count: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatencyWait {
    Ready,
    TimedOut,
}

pub trait Swapchain<B: Backend> {
    fn set_maximum_frame_latency(&mut self, frames: u32) -> GpuResult<()>;
    fn wait_frame_latency(&mut self, timeout: Duration) -> GpuResult<LatencyWait>;
    /// The buffer the next frame must render into. Repeated calls without a
    /// present return the same index.
    fn current_buffer_index(&mut self) -> GpuResult<u32>;
    /// Buffers actually in the ring. May exceed the requested count when
    /// the API enforces a larger minimum.
    fn buffer_count(&self) -> u32;
    fn buffer(&self, index: u32) -> GpuResult<B::RenderTarget>;
    fn present(&mut self, queue: &B::Queue, sync_interval: u32) -> GpuResult<()>;
    /// Every buffer and view obtained earlier must be released first.
    fn resize_buffers(&mut self, desc: &SwapchainDesc) -> GpuResult<()>;
    fn set_color_space(&mut self, color_space: ColorSpace) -> GpuResult<()>;
}
