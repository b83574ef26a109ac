// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{c_char, c_void, CStr};
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use ash::ext::{debug_utils, surface_maintenance1, swapchain_colorspace, swapchain_maintenance1};
use ash::khr::{get_surface_capabilities2, present_id, present_wait, surface, swapchain};
use ash::{vk, Entry};
use lumen_render::{AdapterInfo, AdapterKind, GpuError, GpuResult, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info, warn};

use crate::device::{DeviceExtensions, DeviceShared, VkDevice};
use crate::{VkBackend, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance-level objects. Every device keeps this alive, so the surface
/// outlives all swapchains built on it.
pub(crate) struct InstanceShared {
    _entry: Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) surface_loader: surface::Instance,
    pub(crate) surface: vk::SurfaceKHR,
    /// Present-mode compatibility queries; needs `VK_EXT_surface_maintenance1`.
    pub(crate) surface_caps2: Option<get_surface_capabilities2::Instance>,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

/// What a physical device offers for presenting to our surface.
#[derive(Clone, Copy, Debug)]
struct DeviceCaps {
    phys: vk::PhysicalDevice,
    queue_family: u32,
    present_wait: bool,
    swapchain_maintenance: bool,
}

pub struct VkInstance {
    shared: Rc<InstanceShared>,
    physical: Vec<vk::PhysicalDevice>,
}

impl VkInstance {
    /// Loads Vulkan, creates the instance and a surface for the window.
    pub fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        // STRICT ORDER: instance, then the surface from it; devices are
        // probed against this surface later.
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        let entry = unsafe { Entry::load() }.context("loading the Vulkan library")?;

        let available = unsafe { entry.enumerate_instance_extension_properties(None) }
            .context("enumerate_instance_extension_properties")?;
        let has_ext = |name: &CStr| {
            available
                .iter()
                .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == name)
        };

        let mut exts: Vec<*const c_char> = ash_window::enumerate_required_extensions(dh)
            .context("enumerate_required_extensions")?
            .to_vec();
        if has_ext(swapchain_colorspace::NAME) {
            exts.push(swapchain_colorspace::NAME.as_ptr());
        }
        let surface_maintenance =
            has_ext(get_surface_capabilities2::NAME) && has_ext(surface_maintenance1::NAME);
        if surface_maintenance {
            exts.push(get_surface_capabilities2::NAME.as_ptr());
            exts.push(surface_maintenance1::NAME.as_ptr());
        }
        let want_debug = cfg!(debug_assertions) && has_ext(debug_utils::NAME);
        if want_debug {
            exts.push(debug_utils::NAME.as_ptr());
        }

        let mut layers: Vec<*const c_char> = Vec::new();
        if cfg!(debug_assertions) {
            let props = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
            let has_validation = props
                .iter()
                .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);
            if has_validation {
                layers.push(VALIDATION_LAYER.as_ptr());
            }
        }

        let name = c"Lumen";
        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: name.as_ptr(),
            application_version: 0,
            p_engine_name: name.as_ptr(),
            engine_version: 0,
            api_version: vk::API_VERSION_1_3,
            ..Default::default()
        };
        let create_info = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_extension_count: exts.len() as u32,
            pp_enabled_extension_names: exts.as_ptr(),
            enabled_layer_count: layers.len() as u32,
            pp_enabled_layer_names: layers.as_ptr(),
            ..Default::default()
        };
        let instance =
            unsafe { entry.create_instance(&create_info, None) }.context("create_instance")?;

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = match unsafe { ash_window::create_surface(&entry, &instance, dh, wh, None) } {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(anyhow!("ash_window::create_surface: {e:?}"));
            }
        };

        let debug = if want_debug {
            create_debug_messenger(&entry, &instance)
        } else {
            None
        };

        let surface_caps2 = surface_maintenance
            .then(|| get_surface_capabilities2::Instance::new(&entry, &instance));

        info!(
            validation = !layers.is_empty(),
            surface_maintenance,
            extensions = exts.len(),
            "vulkan instance ready"
        );

        Ok(Self {
            shared: Rc::new(InstanceShared {
                _entry: entry,
                instance,
                surface_loader,
                surface,
                surface_caps2,
                debug,
            }),
            physical: Vec::new(),
        })
    }

    fn probe(&self, adapter: &AdapterInfo) -> Option<DeviceCaps> {
        let phys = *self.physical.get(adapter.ordinal as usize)?;
        let instance = &self.shared.instance;

        let props = unsafe { instance.get_physical_device_properties(phys) };
        let version = (
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
        );
        if version < (1, 3) {
            debug!(adapter = %adapter.name, "vulkan {}.{} is too old", version.0, version.1);
            return None;
        }

        let ext_props = unsafe { instance.enumerate_device_extension_properties(phys) }.ok()?;
        let has = |name: &CStr| {
            ext_props
                .iter()
                .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == name)
        };
        if !has(swapchain::NAME) {
            return None;
        }
        let has_present_wait = has(present_id::NAME) && has(present_wait::NAME);
        let has_maintenance =
            self.shared.surface_caps2.is_some() && has(swapchain_maintenance1::NAME);

        let mut f12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut f13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut f_id = vk::PhysicalDevicePresentIdFeaturesKHR::default();
        let mut f_wait = vk::PhysicalDevicePresentWaitFeaturesKHR::default();
        let mut f_maint = vk::PhysicalDeviceSwapchainMaintenance1FeaturesEXT::default();
        {
            let mut f2 = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut f12)
                .push_next(&mut f13);
            if has_present_wait {
                f2 = f2.push_next(&mut f_id).push_next(&mut f_wait);
            }
            if has_maintenance {
                f2 = f2.push_next(&mut f_maint);
            }
            unsafe { instance.get_physical_device_features2(phys, &mut f2) };
        }
        if f12.timeline_semaphore == vk::FALSE
            || f13.dynamic_rendering == vk::FALSE
            || f13.synchronization2 == vk::FALSE
        {
            return None;
        }

        let families = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        let queue_family = families.iter().enumerate().find_map(|(i, q)| {
            let present = unsafe {
                self.shared.surface_loader.get_physical_device_surface_support(
                    phys,
                    i as u32,
                    self.shared.surface,
                )
            }
            .unwrap_or(false);
            (q.queue_flags.contains(vk::QueueFlags::GRAPHICS) && present).then_some(i as u32)
        })?;

        Some(DeviceCaps {
            phys,
            queue_family,
            present_wait: has_present_wait
                && f_id.present_id == vk::TRUE
                && f_wait.present_wait == vk::TRUE,
            swapchain_maintenance: has_maintenance && f_maint.swapchain_maintenance1 == vk::TRUE,
        })
    }
}

impl Instance<VkBackend> for VkInstance {
    fn enumerate_adapters(&mut self) -> GpuResult<Vec<AdapterInfo>> {
        let instance = &self.shared.instance;
        let physical =
            unsafe { instance.enumerate_physical_devices() }.gpu("enumerate_physical_devices")?;

        let adapters = physical
            .iter()
            .enumerate()
            .map(|(i, &phys)| adapter_info(instance, i as u32, phys))
            .collect();
        self.physical = physical;
        Ok(adapters)
    }

    fn create_device(&mut self, adapter: &AdapterInfo) -> GpuResult<VkDevice> {
        let caps = self.probe(adapter).ok_or_else(|| {
            GpuError::call(
                "create_device",
                format!("{} cannot present with Vulkan 1.3", adapter.name),
            )
        })?;

        let priorities = [1.0_f32];
        let queue_info = vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: caps.queue_family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        };

        let mut exts: Vec<*const c_char> = vec![swapchain::NAME.as_ptr()];
        if caps.present_wait {
            exts.push(present_id::NAME.as_ptr());
            exts.push(present_wait::NAME.as_ptr());
        }
        if caps.swapchain_maintenance {
            exts.push(swapchain_maintenance1::NAME.as_ptr());
        }

        let mut f12 = vk::PhysicalDeviceVulkan12Features {
            timeline_semaphore: vk::TRUE,
            ..Default::default()
        };
        let mut f13 = vk::PhysicalDeviceVulkan13Features {
            dynamic_rendering: vk::TRUE,
            synchronization2: vk::TRUE,
            ..Default::default()
        };
        let mut f_id = vk::PhysicalDevicePresentIdFeaturesKHR {
            present_id: vk::TRUE,
            ..Default::default()
        };
        let mut f_wait = vk::PhysicalDevicePresentWaitFeaturesKHR {
            present_wait: vk::TRUE,
            ..Default::default()
        };

        let mut f_maint = vk::PhysicalDeviceSwapchainMaintenance1FeaturesEXT {
            swapchain_maintenance1: vk::TRUE,
            ..Default::default()
        };

        let mut info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&exts)
            .push_next(&mut f12)
            .push_next(&mut f13);
        if caps.present_wait {
            info = info.push_next(&mut f_id).push_next(&mut f_wait);
        }
        if caps.swapchain_maintenance {
            info = info.push_next(&mut f_maint);
        }

        let device = unsafe { self.shared.instance.create_device(caps.phys, &info, None) }
            .gpu("create_device")?;

        info!(
            adapter = %adapter.name,
            queue_family = caps.queue_family,
            present_wait = caps.present_wait,
            swapchain_maintenance = caps.swapchain_maintenance,
            "vulkan device created"
        );

        let shared = DeviceShared::new(
            self.shared.clone(),
            caps.phys,
            device,
            caps.queue_family,
            DeviceExtensions {
                present_wait: caps.present_wait,
                swapchain_maintenance: caps.swapchain_maintenance,
            },
        );
        Ok(VkDevice::new(Rc::new(shared)))
    }

    fn supports_device(&mut self, adapter: &AdapterInfo) -> bool {
        self.probe(adapter).is_some()
    }

    fn adapters_changed(&mut self) -> bool {
        match unsafe { self.shared.instance.enumerate_physical_devices() } {
            Ok(now) => now != self.physical,
            Err(e) => {
                warn!("enumerate_physical_devices: {e:?}");
                true
            }
        }
    }
}

fn adapter_info(instance: &ash::Instance, ordinal: u32, phys: vk::PhysicalDevice) -> AdapterInfo {
    let props = unsafe { instance.get_physical_device_properties(phys) };
    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    AdapterInfo {
        ordinal,
        name,
        vendor_id: props.vendor_id,
        device_id: props.device_id,
        kind: adapter_kind(props.device_type),
    }
}

/// CPU implementations (lavapipe, SwiftShader) play the role of WARP.
pub(crate) fn adapter_kind(device_type: vk::PhysicalDeviceType) -> AdapterKind {
    if device_type == vk::PhysicalDeviceType::CPU {
        AdapterKind::Software
    } else {
        AdapterKind::Hardware
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else {
        debug!("[vulkan] {msg}");
    }
    vk::FALSE
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    match unsafe { loader.create_debug_utils_messenger(&ci, None) } {
        Ok(messenger) => Some((loader, messenger)),
        Err(e) => {
            warn!("debug messenger unavailable: {e:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_devices_are_software_adapters() {
        assert_eq!(adapter_kind(vk::PhysicalDeviceType::CPU), AdapterKind::Software);
        assert_eq!(
            adapter_kind(vk::PhysicalDeviceType::DISCRETE_GPU),
            AdapterKind::Hardware
        );
        assert_eq!(
            adapter_kind(vk::PhysicalDeviceType::INTEGRATED_GPU),
            AdapterKind::Hardware
        );
    }
}
