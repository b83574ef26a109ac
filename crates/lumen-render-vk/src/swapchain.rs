// SPDX-License-Identifier: CEPL-1.0
//! `VkSwapchainKHR` behind the core's swapchain contract.
//!
//! The core asks for "the current buffer" and expects the index to stay put
//! until the next present. Vulkan hands images out through
//! `vkAcquireNextImageKHR`, so the first `current_buffer_index` of a frame
//! acquires and later calls return the same index. Acquire and
//! render-finished semaphores are handed to the queue through the device's
//! [`FrameSync`](crate::device::FrameSync).
use std::rc::Rc;
use std::time::Duration;

use ash::vk;
use lumen_render::{
    ColorSpace, GpuError, GpuResult, LatencyWait, PixelFormat, Swapchain, SwapchainDesc,
};
use tracing::{debug, info, trace};

use crate::device::{DeviceShared, VkQueue};
use crate::surface::{
    color_space, extent_from_caps, image_count, pick_surface_format, pixel_format, pm_name,
    present_mode_for, switchable_modes, view_format,
};
use crate::{gpu_error, VkBackend, VkResultExt};

pub struct VkSwapchain {
    shared: Rc<DeviceShared>,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::Format,
    extent: vk::Extent2D,
    desc: SwapchainDesc,

    // One more acquire semaphore than images, used round-robin.
    acquire: Vec<vk::Semaphore>,
    next_acquire: usize,
    // One per image, signalled by the submit that renders it.
    render_finished: Vec<vk::Semaphore>,

    acquired: Option<u32>,
    outdated: bool,
    max_latency: u32,
    present_id: u64,
    /// Created with FIFO and IMMEDIATE; each present picks one.
    switchable: bool,
}

impl VkSwapchain {
    pub(crate) fn new(shared: Rc<DeviceShared>, desc: &SwapchainDesc) -> GpuResult<Self> {
        let mut swapchain = Self {
            shared,
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            desc: *desc,
            acquire: Vec::new(),
            next_acquire: 0,
            render_finished: Vec::new(),
            acquired: None,
            outdated: false,
            max_latency: desc.buffer_count.saturating_sub(1).max(1),
            present_id: 0,
            switchable: false,
        };
        swapchain.build()?;
        Ok(swapchain)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Creates the swapchain for `self.desc`, retiring the previous one.
    fn build(&mut self) -> GpuResult<()> {
        let inst = &self.shared.instance;
        let (phys, surface) = (self.shared.phys, inst.surface);

        let caps = unsafe {
            inst.surface_loader
                .get_physical_device_surface_capabilities(phys, surface)
        }
        .gpu("get_physical_device_surface_capabilities")?;
        let formats = unsafe {
            inst.surface_loader
                .get_physical_device_surface_formats(phys, surface)
        }
        .gpu("get_physical_device_surface_formats")?;
        let modes = unsafe {
            inst.surface_loader
                .get_physical_device_surface_present_modes(phys, surface)
        }
        .unwrap_or_default();

        let (surf_format, reason) = pick_surface_format(&formats, self.desc.color_space)
            .ok_or_else(|| GpuError::call("create_swapchain", "surface reports no formats"))?;
        let extent = extent_from_caps(&caps, self.desc.width, self.desc.height);
        let min_count = image_count(&caps, self.desc.buffer_count);

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        // FIFO is the only mode every driver has. Without per-present
        // switching an interval-0 present still lands on the next vblank.
        let present_mode = vk::PresentModeKHR::FIFO;
        let switch_modes = if self.shared.swapchain_maintenance {
            switchable_modes(&modes, &self.modes_compatible_with_fifo())
        } else {
            None
        };
        let mut modes_info = vk::SwapchainPresentModesCreateInfoEXT::default();
        if let Some(switch_modes) = &switch_modes {
            modes_info = modes_info.present_modes(switch_modes);
        }

        let mut swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface,
            min_image_count: min_count,
            image_format: surf_format.format,
            image_color_space: surf_format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: self.handle,
            ..Default::default()
        };
        if switch_modes.is_some() {
            swap_info = swap_info.push_next(&mut modes_info);
        }

        let loader = &self.shared.swapchain_loader;
        let handle = unsafe { loader.create_swapchain(&swap_info, None) }.gpu("create_swapchain")?;
        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(gpu_error("get_swapchain_images", e));
            }
        };

        let old = std::mem::replace(&mut self.handle, handle);
        if old != vk::SwapchainKHR::null() {
            unsafe { self.shared.swapchain_loader.destroy_swapchain(old, None) };
        }
        self.destroy_semaphores();
        self.images = images;
        self.format = surf_format.format;
        self.extent = extent;
        self.acquired = None;
        self.outdated = false;
        self.present_id = 0;
        self.switchable = switch_modes.is_some();
        self.shared.frame.borrow_mut().clear();

        for _ in 0..=self.images.len() {
            let semaphore = self.shared.create_semaphore()?;
            self.acquire.push(semaphore);
        }
        for _ in 0..self.images.len() {
            let semaphore = self.shared.create_semaphore()?;
            self.render_finished.push(semaphore);
        }

        info!(
            reason,
            format = ?surf_format.format,
            color_space = ?color_space(surf_format.color_space),
            present_mode = pm_name(present_mode),
            immediate_available = modes.contains(&vk::PresentModeKHR::IMMEDIATE),
            switchable = self.switchable,
            width = extent.width,
            height = extent.height,
            images = self.images.len(),
            "vulkan swapchain built"
        );
        Ok(())
    }

    /// Present modes the surface lets a FIFO swapchain switch to.
    fn modes_compatible_with_fifo(&self) -> Vec<vk::PresentModeKHR> {
        let inst = &self.shared.instance;
        let Some(caps2) = &inst.surface_caps2 else {
            return Vec::new();
        };

        let mut fifo = vk::SurfacePresentModeEXT::default().present_mode(vk::PresentModeKHR::FIFO);
        let surface_info = vk::PhysicalDeviceSurfaceInfo2KHR::default()
            .surface(inst.surface)
            .push_next(&mut fifo);
        let mut compatible = [vk::PresentModeKHR::default(); 8];
        let mut compat =
            vk::SurfacePresentModeCompatibilityEXT::default().present_modes(&mut compatible);
        let queried = {
            let mut caps = vk::SurfaceCapabilities2KHR::default().push_next(&mut compat);
            unsafe {
                caps2.get_physical_device_surface_capabilities2(
                    self.shared.phys,
                    &surface_info,
                    &mut caps,
                )
            }
        };
        let count = compat.present_mode_count as usize;
        match queried {
            Ok(()) => compatible[..count.min(compatible.len())].to_vec(),
            Err(e) => {
                debug!("present mode compatibility query failed: {e:?}");
                Vec::new()
            }
        }
    }

    fn destroy_semaphores(&mut self) {
        let device = &self.shared.device;
        for semaphore in self.acquire.drain(..).chain(self.render_finished.drain(..)) {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
        self.next_acquire = 0;
    }
}

impl Swapchain<VkBackend> for VkSwapchain {
    fn set_maximum_frame_latency(&mut self, frames: u32) -> GpuResult<()> {
        self.max_latency = frames.max(1);
        Ok(())
    }

    /// Waits until at most `max_latency - 1` earlier presents are still
    /// queued. Without `VK_KHR_present_wait` there is nothing to wait on.
    fn wait_frame_latency(&mut self, timeout: Duration) -> GpuResult<LatencyWait> {
        let Some(present_wait) = &self.shared.present_wait else {
            return Ok(LatencyWait::Ready);
        };
        let target = self
            .present_id
            .saturating_sub(u64::from(self.max_latency.saturating_sub(1)));
        if target == 0 {
            return Ok(LatencyWait::Ready);
        }

        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { present_wait.wait_for_present(self.handle, target, timeout_ns) } {
            Ok(()) => Ok(LatencyWait::Ready),
            Err(vk::Result::TIMEOUT) => Ok(LatencyWait::TimedOut),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.outdated = true;
                Ok(LatencyWait::Ready)
            }
            Err(e) => Err(gpu_error("wait_for_present", e)),
        }
    }

    fn current_buffer_index(&mut self) -> GpuResult<u32> {
        if self.outdated {
            return Err(GpuError::SurfaceOutdated);
        }
        if let Some(index) = self.acquired {
            return Ok(index);
        }

        let semaphore = self.acquire[self.next_acquire];
        let acquired = unsafe {
            self.shared.swapchain_loader.acquire_next_image(
                self.handle,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };
        let (index, suboptimal) = match acquired {
            Ok(pair) => pair,
            Err(e) => {
                if e == vk::Result::ERROR_OUT_OF_DATE_KHR {
                    self.outdated = true;
                }
                return Err(gpu_error("acquire_next_image", e));
            }
        };
        if suboptimal {
            trace!(index, "acquired a suboptimal image");
        }
        self.next_acquire = (self.next_acquire + 1) % self.acquire.len();

        let mut frame = self.shared.frame.borrow_mut();
        frame.acquired = Some(semaphore);
        frame.render_finished = self.render_finished.get(index as usize).copied();
        self.acquired = Some(index);
        Ok(index)
    }

    fn buffer_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn buffer(&self, index: u32) -> GpuResult<VkImage> {
        let image = self.images.get(index as usize).copied().ok_or_else(|| {
            GpuError::InvalidArgument(format!(
                "buffer {index} of a {}-image swapchain",
                self.images.len()
            ))
        })?;
        Ok(VkImage {
            image,
            format: self.format,
            extent: self.extent,
        })
    }

    fn present(&mut self, _queue: &VkQueue, sync_interval: u32) -> GpuResult<()> {
        let index = self
            .acquired
            .take()
            .ok_or_else(|| GpuError::call("queue_present", "no image acquired"))?;
        let waits = self.shared.frame.borrow_mut().take_present_waits();

        self.present_id += 1;
        let ids = [self.present_id];
        let mut present_id = vk::PresentIdKHR::default().present_ids(&ids);
        let mut present = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(std::slice::from_ref(&self.handle))
            .image_indices(std::slice::from_ref(&index));
        if self.shared.present_wait.is_some() {
            present = present.push_next(&mut present_id);
        }
        let modes = [present_mode_for(sync_interval, self.switchable)];
        let mut mode_info = vk::SwapchainPresentModeInfoEXT::default().present_modes(&modes);
        if self.switchable {
            present = present.push_next(&mut mode_info);
        } else if sync_interval == 0 {
            trace!("interval-0 present queued on FIFO");
        }

        match unsafe {
            self.shared
                .swapchain_loader
                .queue_present(self.shared.queue, &present)
        } {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("surface changed under the swapchain; rebuilding next frame");
                self.outdated = true;
                Ok(())
            }
            Err(e) => Err(gpu_error("queue_present", e)),
        }
    }

    fn resize_buffers(&mut self, desc: &SwapchainDesc) -> GpuResult<()> {
        self.desc = *desc;
        self.build()
    }

    fn set_color_space(&mut self, color_space: ColorSpace) -> GpuResult<()> {
        if color_space == self.desc.color_space {
            return Ok(());
        }
        self.desc.color_space = color_space;
        self.build()
    }
}

impl Drop for VkSwapchain {
    fn drop(&mut self) {
        unsafe {
            let _ = self.shared.device.device_wait_idle();
        }
        self.destroy_semaphores();
        self.shared.frame.borrow_mut().clear();
        unsafe {
            self.shared
                .swapchain_loader
                .destroy_swapchain(self.handle, None)
        };
    }
}

/// A swapchain image. Owned by the swapchain; this is only a reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VkImage {
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

pub struct VkImageView {
    shared: Rc<DeviceShared>,
    view: vk::ImageView,
    image: vk::Image,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl VkImageView {
    pub(crate) fn new(
        shared: Rc<DeviceShared>,
        target: &VkImage,
        requested: PixelFormat,
    ) -> GpuResult<Self> {
        let format = view_format(target.format, requested)
            .or_else(|| {
                // The surface fell back to another class (no scRGB surface).
                let actual = pixel_format(target.format)?;
                debug!(?requested, ?actual, "viewing in the surface's format");
                Some(target.format)
            })
            .ok_or_else(|| {
                GpuError::InvalidArgument(format!(
                    "no {requested:?} view of a {:?} image",
                    target.format
                ))
            })?;

        let info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: target.image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        let view = unsafe { shared.device.create_image_view(&info, None) }
            .gpu("create_image_view")?;
        Ok(Self {
            shared,
            view,
            image: target.image,
            format,
            extent: target.extent,
        })
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for VkImageView {
    fn drop(&mut self) {
        unsafe { self.shared.device.destroy_image_view(self.view, None) };
    }
}
