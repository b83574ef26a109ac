// SPDX-License-Identifier: CEPL-1.0
//! Logical device, queue, timeline fence and command recording objects.
use std::cell::RefCell;
use std::rc::Rc;

use ash::khr::{present_wait, swapchain};
use ash::vk;
use lumen_render::{
    CommandAllocator, CommandList, Device, Fence, GpuError, GpuResult, PixelFormat, Queue,
    SwapchainDesc,
};

use crate::instance::InstanceShared;
use crate::swapchain::{VkImage, VkImageView, VkSwapchain};
use crate::{VkBackend, VkResultExt};

/// Binary semaphores linking acquire, submit and present for the image
/// currently in flight. The swapchain fills it, the queue consumes it.
#[derive(Debug, Default)]
pub(crate) struct FrameSync {
    /// Signalled by the last acquire; the next submission waits on it.
    pub(crate) acquired: Option<vk::Semaphore>,
    /// Signalled by the next submission that renders the acquired image.
    pub(crate) render_finished: Option<vk::Semaphore>,
    /// What the next present has to wait on.
    pub(crate) present_waits: Vec<vk::Semaphore>,
}

impl FrameSync {
    /// Semaphores a present must wait on. Falls back to the acquire
    /// semaphore when nothing was submitted for the image.
    pub(crate) fn take_present_waits(&mut self) -> Vec<vk::Semaphore> {
        self.render_finished = None;
        let mut waits = std::mem::take(&mut self.present_waits);
        if let Some(acquired) = self.acquired.take() {
            waits.push(acquired);
        }
        waits
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Optional device extensions that were enabled.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DeviceExtensions {
    pub(crate) present_wait: bool,
    /// `VK_EXT_swapchain_maintenance1`: per-present mode switching.
    pub(crate) swapchain_maintenance: bool,
}

pub(crate) struct DeviceShared {
    pub(crate) instance: Rc<InstanceShared>,
    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
    pub(crate) swapchain_loader: swapchain::Device,
    pub(crate) present_wait: Option<present_wait::Device>,
    pub(crate) swapchain_maintenance: bool,
    pub(crate) frame: RefCell<FrameSync>,
}

impl DeviceShared {
    pub(crate) fn new(
        instance: Rc<InstanceShared>,
        phys: vk::PhysicalDevice,
        device: ash::Device,
        queue_family: u32,
        extensions: DeviceExtensions,
    ) -> Self {
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let swapchain_loader = swapchain::Device::new(&instance.instance, &device);
        let present_wait = extensions
            .present_wait
            .then(|| present_wait::Device::new(&instance.instance, &device));
        Self {
            instance,
            phys,
            device,
            queue_family,
            queue,
            swapchain_loader,
            present_wait,
            swapchain_maintenance: extensions.swapchain_maintenance,
            frame: RefCell::new(FrameSync::default()),
        }
    }

    pub(crate) fn create_semaphore(&self) -> GpuResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        unsafe { self.device.create_semaphore(&info, None) }.gpu("create_semaphore")
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            // Errors here mean the device is already lost; nothing to wait for.
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

pub struct VkDevice {
    shared: Rc<DeviceShared>,
}

impl VkDevice {
    pub(crate) fn new(shared: Rc<DeviceShared>) -> Self {
        Self { shared }
    }

    /// The raw device, for scenes that build their own pipelines.
    pub fn handle(&self) -> &ash::Device {
        &self.shared.device
    }
}

impl Device<VkBackend> for VkDevice {
    fn create_queue(&self) -> GpuResult<VkQueue> {
        Ok(VkQueue {
            shared: self.shared.clone(),
        })
    }

    /// Timeline semaphore standing in for a monotonic fence.
    fn create_fence(&self, initial_value: u64) -> GpuResult<VkFence> {
        let mut type_info = vk::SemaphoreTypeCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_TYPE_CREATE_INFO,
            semaphore_type: vk::SemaphoreType::TIMELINE,
            initial_value,
            ..Default::default()
        };
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { self.shared.device.create_semaphore(&info, None) }
            .gpu("create_semaphore(timeline)")?;
        Ok(VkFence {
            shared: self.shared.clone(),
            semaphore,
        })
    }

    fn create_command_allocator(&self) -> GpuResult<VkCommandAllocator> {
        VkCommandAllocator::new(self.shared.clone())
    }

    fn create_command_list(&self, _allocator: &VkCommandAllocator) -> GpuResult<VkCommandList> {
        Ok(VkCommandList {
            shared: self.shared.clone(),
            cmd: vk::CommandBuffer::null(),
            recording: false,
        })
    }

    fn create_swapchain(&self, _queue: &VkQueue, desc: &SwapchainDesc) -> GpuResult<VkSwapchain> {
        VkSwapchain::new(self.shared.clone(), desc)
    }

    fn create_render_target_view(
        &self,
        target: &VkImage,
        format: PixelFormat,
    ) -> GpuResult<VkImageView> {
        VkImageView::new(self.shared.clone(), target, format)
    }
}

pub struct VkQueue {
    shared: Rc<DeviceShared>,
}

impl Queue<VkBackend> for VkQueue {
    /// Waits on the pending acquire and signals the image's render-finished
    /// semaphore, so the following present can wait on it.
    fn execute(&self, list: &VkCommandList) -> GpuResult<()> {
        if list.recording || list.cmd == vk::CommandBuffer::null() {
            return Err(GpuError::call("execute", "command list is not closed"));
        }

        let mut frame = self.shared.frame.borrow_mut();
        let wait = frame.acquired.take().map(|semaphore| vk::SemaphoreSubmitInfo {
            s_type: vk::StructureType::SEMAPHORE_SUBMIT_INFO,
            semaphore,
            stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ..Default::default()
        });
        let render_finished = frame.render_finished.take();
        let signal = render_finished.map(|semaphore| vk::SemaphoreSubmitInfo {
            s_type: vk::StructureType::SEMAPHORE_SUBMIT_INFO,
            semaphore,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            ..Default::default()
        });
        let cmd_info = vk::CommandBufferSubmitInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_SUBMIT_INFO,
            command_buffer: list.cmd,
            ..Default::default()
        };

        let waits = wait.as_slice();
        let signals = signal.as_slice();
        let submit = vk::SubmitInfo2 {
            s_type: vk::StructureType::SUBMIT_INFO_2,
            wait_semaphore_info_count: waits.len() as u32,
            p_wait_semaphore_infos: waits.as_ptr(),
            command_buffer_info_count: 1,
            p_command_buffer_infos: &cmd_info,
            signal_semaphore_info_count: signals.len() as u32,
            p_signal_semaphore_infos: signals.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.shared
                .device
                .queue_submit2(self.shared.queue, std::slice::from_ref(&submit), vk::Fence::null())
        }
        .gpu("queue_submit2")?;

        if let Some(semaphore) = render_finished {
            frame.present_waits.push(semaphore);
        }
        Ok(())
    }

    fn signal(&self, fence: &VkFence, value: u64) -> GpuResult<()> {
        let info = vk::SemaphoreSubmitInfo {
            s_type: vk::StructureType::SEMAPHORE_SUBMIT_INFO,
            semaphore: fence.semaphore,
            value,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            ..Default::default()
        };
        let submit = vk::SubmitInfo2 {
            s_type: vk::StructureType::SUBMIT_INFO_2,
            signal_semaphore_info_count: 1,
            p_signal_semaphore_infos: &info,
            ..Default::default()
        };
        unsafe {
            self.shared
                .device
                .queue_submit2(self.shared.queue, std::slice::from_ref(&submit), vk::Fence::null())
        }
        .gpu("queue_submit2(signal)")
    }
}

pub struct VkFence {
    shared: Rc<DeviceShared>,
    semaphore: vk::Semaphore,
}

impl Fence for VkFence {
    fn completed_value(&self) -> GpuResult<u64> {
        unsafe { self.shared.device.get_semaphore_counter_value(self.semaphore) }
            .gpu("get_semaphore_counter_value")
    }

    fn wait(&self, value: u64) -> GpuResult<()> {
        let info = vk::SemaphoreWaitInfo {
            s_type: vk::StructureType::SEMAPHORE_WAIT_INFO,
            semaphore_count: 1,
            p_semaphores: &self.semaphore,
            p_values: &value,
            ..Default::default()
        };
        unsafe { self.shared.device.wait_semaphores(&info, u64::MAX) }.gpu("wait_semaphores")
    }
}

impl Drop for VkFence {
    fn drop(&mut self) {
        unsafe { self.shared.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// A command pool with the one primary buffer recorded from it.
pub struct VkCommandAllocator {
    shared: Rc<DeviceShared>,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
}

impl VkCommandAllocator {
    fn new(shared: Rc<DeviceShared>) -> GpuResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: shared.queue_family,
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            ..Default::default()
        };
        let pool = unsafe { shared.device.create_command_pool(&pool_info, None) }
            .gpu("create_command_pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = match unsafe { shared.device.allocate_command_buffers(&alloc_info) } {
            Ok(bufs) => bufs[0],
            Err(e) => {
                unsafe { shared.device.destroy_command_pool(pool, None) };
                return Err(crate::gpu_error("allocate_command_buffers", e));
            }
        };
        Ok(Self { shared, pool, cmd })
    }
}

impl CommandAllocator for VkCommandAllocator {
    fn reset(&mut self) -> GpuResult<()> {
        unsafe {
            self.shared
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
        }
        .gpu("reset_command_pool")
    }
}

impl Drop for VkCommandAllocator {
    fn drop(&mut self) {
        // Frees the command buffer with it.
        unsafe { self.shared.device.destroy_command_pool(self.pool, None) };
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VkPipelineState {
    pub pipeline: vk::Pipeline,
}

/// Records into whichever allocator's buffer it was last reset against.
pub struct VkCommandList {
    shared: Rc<DeviceShared>,
    cmd: vk::CommandBuffer,
    recording: bool,
}

impl VkCommandList {
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn device(&self) -> &ash::Device {
        &self.shared.device
    }
}

impl CommandList<VkBackend> for VkCommandList {
    fn reset(
        &mut self,
        allocator: &VkCommandAllocator,
        initial_state: Option<&VkPipelineState>,
    ) -> GpuResult<()> {
        if self.recording {
            return Err(GpuError::call("reset", "command list is still recording"));
        }

        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe { self.shared.device.begin_command_buffer(allocator.cmd, &begin) }
            .gpu("begin_command_buffer")?;
        self.cmd = allocator.cmd;
        self.recording = true;

        if let Some(state) = initial_state {
            unsafe {
                self.shared.device.cmd_bind_pipeline(
                    self.cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    state.pipeline,
                )
            };
        }
        Ok(())
    }

    fn close(&mut self) -> GpuResult<()> {
        if !self.recording {
            return Err(GpuError::call("close", "command list is not recording"));
        }
        self.recording = false;
        unsafe { self.shared.device.end_command_buffer(self.cmd) }.gpu("end_command_buffer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_waits_on_render_finished_after_a_submit() {
        let mut sync = FrameSync {
            acquired: None,
            render_finished: None,
            present_waits: vec![vk::Semaphore::null()],
        };
        assert_eq!(sync.take_present_waits().len(), 1);
        assert!(sync.present_waits.is_empty());
    }

    #[test]
    fn present_without_submit_consumes_the_acquire() {
        let mut sync = FrameSync {
            acquired: Some(vk::Semaphore::null()),
            render_finished: Some(vk::Semaphore::null()),
            present_waits: Vec::new(),
        };
        assert_eq!(sync.take_present_waits().len(), 1);
        assert!(sync.acquired.is_none());
        assert!(sync.render_finished.is_none());
    }
}
