// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, physical device and logical device.
use std::ffi::{c_void, CStr, CString};

use anyhow::{Context, Result};
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use texquad_render::RendererOptions;
use tracing::{debug, error, info, warn};

use crate::SetupError;

const ENGINE_NAME: &CStr = c"texquad";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Family indices as discovered; any of them may be missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    /// TRANSFER without GRAPHICS.
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        supports_present: impl Fn(u32) -> bool,
    ) -> Self {
        let mut out = QueueFamilyIndices::default();
        let mut present = Vec::with_capacity(families.len());

        for (i, family) in families.iter().enumerate() {
            let i = i as u32;
            let usable = family.queue_count > 0;
            present.push(usable && supports_present(i));
            if !usable {
                continue;
            }
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            if graphics && out.graphics.is_none() {
                out.graphics = Some(i);
            }
            if !graphics
                && out.transfer.is_none()
                && family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            {
                out.transfer = Some(i);
            }
        }

        // Same family as graphics when it can present, else the first one that can.
        out.present = out
            .graphics
            .filter(|&g| present[g as usize])
            .or_else(|| present.iter().position(|&p| p).map(|i| i as u32));
        out
    }

    pub fn resolve(&self) -> Option<QueueFamilies> {
        Some(QueueFamilies {
            graphics: self.graphics?,
            present: self.present?,
            transfer: self.transfer,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub transfer: Option<u32>,
}

impl QueueFamilies {
    /// One entry per distinct family, in ascending order.
    pub fn unique(&self) -> Vec<u32> {
        let mut v = vec![self.graphics, self.present];
        v.extend(self.transfer);
        v.sort_unstable();
        v.dedup();
        v
    }

    /// Buffers are shared between graphics and the dedicated transfer family.
    pub fn buffer_sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        let mut v = vec![self.graphics];
        v.extend(self.transfer);
        sharing_for(v)
    }

    pub fn swapchain_sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        sharing_for(vec![self.graphics, self.present])
    }
}

fn sharing_for(mut families: Vec<u32>) -> (vk::SharingMode, Vec<u32>) {
    families.sort_unstable();
    families.dedup();
    if families.len() > 1 {
        (vk::SharingMode::CONCURRENT, families)
    } else {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    }
}

/// Higher is better; discrete GPUs win.
pub fn device_type_rank(ty: vk::PhysicalDeviceType) -> u32 {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

pub(crate) struct VkContext {
    _entry: Entry,
    pub instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,

    pub phys: vk::PhysicalDevice,
    pub props: vk::PhysicalDeviceProperties,
    pub mem_props: vk::PhysicalDeviceMemoryProperties,
    pub families: QueueFamilies,
    /// Device limit when samplerAnisotropy was enabled.
    pub max_anisotropy: Option<f32>,

    pub device: Device,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub transfer_queue: Option<vk::Queue>,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", ?types, "{msg}");
    } else {
        debug!(target: "vulkan", ?types, "{msg}");
    }
    vk::FALSE
}

unsafe fn has_validation_layer(entry: &Entry) -> Result<bool> {
    let layers = entry
        .enumerate_instance_layer_properties()
        .context("enumerate_instance_layer_properties")?;
    Ok(layers
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER))
}

/// Returns the instance and whether validation ended up enabled.
unsafe fn create_instance(
    entry: &Entry,
    display: RawDisplayHandle,
    app_name: &str,
    want_validation: bool,
) -> Result<(Instance, bool)> {
    let app = CString::new(app_name).context("application name contains NUL")?;
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: vk::make_api_version(0, 1, 0, 0),
        p_engine_name: ENGINE_NAME.as_ptr(),
        engine_version: vk::make_api_version(0, 1, 0, 0),
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut exts = ash_window::enumerate_required_extensions(display)
        .context("enumerate_required_extensions")?
        .to_vec();

    let validation = if want_validation {
        let available = has_validation_layer(entry)?;
        if !available {
            warn!("validation requested but {VALIDATION_LAYER:?} is not installed; continuing without it");
        }
        available
    } else {
        false
    };
    if validation {
        exts.push(debug_utils::NAME.as_ptr());
    }

    let layers = [VALIDATION_LAYER.as_ptr()];
    let (enabled_layer_count, pp_enabled_layer_names) = if validation {
        (layers.len() as u32, layers.as_ptr())
    } else {
        (0, std::ptr::null())
    };

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count,
        pp_enabled_layer_names,
        ..Default::default()
    };

    let instance = entry
        .create_instance(&create_info, None)
        .context("create_instance")?;
    Ok((instance, validation))
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
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
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .context("create_debug_utils_messenger")?;
    Ok((loader, messenger))
}

/// `None` when the device cannot drive this surface.
unsafe fn suitable_families(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
) -> Result<Option<QueueFamilies>> {
    let qprops = instance.get_physical_device_queue_family_properties(phys);
    let indices = QueueFamilyIndices::find(&qprops, |i| {
        surface_loader
            .get_physical_device_surface_support(phys, i, surface)
            .unwrap_or(false)
    });
    let Some(families) = indices.resolve() else {
        return Ok(None);
    };

    let exts = instance
        .enumerate_device_extension_properties(phys)
        .context("enumerate_device_extension_properties")?;
    if !exts
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME)
    {
        return Ok(None);
    }

    let formats = surface_loader.get_physical_device_surface_formats(phys, surface)?;
    let modes = surface_loader.get_physical_device_surface_present_modes(phys, surface)?;
    if formats.is_empty() || modes.is_empty() {
        return Ok(None);
    }
    Ok(Some(families))
}

unsafe fn pick_physical_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilies)> = None;

    for phys in instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?
    {
        let props = instance.get_physical_device_properties(phys);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        let Some(families) = suitable_families(instance, surface_loader, surface, phys)? else {
            debug!("skipping {name}: no graphics/present/swapchain support");
            continue;
        };
        let rank = device_type_rank(props.device_type);
        if best.as_ref().map_or(true, |(r, ..)| rank > *r) {
            best = Some((rank, phys, families));
        }
    }

    best.map(|(_, phys, families)| (phys, families))
        .ok_or_else(|| SetupError::NoSuitableDevice.into())
}

unsafe fn create_logical_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    families: &QueueFamilies,
    anisotropy: bool,
) -> Result<Device> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<_> = families
        .unique()
        .into_iter()
        .map(|family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    let features = vk::PhysicalDeviceFeatures {
        sampler_anisotropy: if anisotropy { vk::TRUE } else { vk::FALSE },
        ..Default::default()
    };
    let device_exts = [swapchain::NAME.as_ptr()];

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        p_enabled_features: &features,
        ..Default::default()
    };

    Ok(instance
        .create_device(phys, &dinfo, None)
        .context("create_device")?)
}

impl VkContext {
    // STRICT ORDER:
    // 1) instance (WSI extensions + optional debug utils)
    // 2) surface from THIS instance
    // 3) physical device + families queried against the surface
    // 4) logical device with one queue per distinct family
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        opts: &RendererOptions,
    ) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .as_raw();

        let entry = Entry::linked();
        let (instance, validation) = create_instance(&entry, dh, &opts.app_name, opts.validation)?;
        let debug = if validation {
            Some(create_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
            .context("ash_window::create_surface")?;

        let (phys, families) = pick_physical_device(&instance, &surface_loader, surface)?;
        let props = instance.get_physical_device_properties(phys);
        let mem_props = instance.get_physical_device_memory_properties(phys);
        let supported = instance.get_physical_device_features(phys);
        let anisotropy = supported.sampler_anisotropy == vk::TRUE;

        info!(
            "device: {} ({:?}), families: graphics={} present={} transfer={:?}, validation={}",
            CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy(),
            props.device_type,
            families.graphics,
            families.present,
            families.transfer,
            validation,
        );
        if families.transfer.is_none() {
            warn!("no dedicated transfer queue family; uploads go through the graphics queue");
        }

        let device = create_logical_device(&instance, phys, &families, anisotropy)?;
        let graphics_queue = device.get_device_queue(families.graphics, 0);
        let present_queue = device.get_device_queue(families.present, 0);
        let transfer_queue = families.transfer.map(|f| device.get_device_queue(f, 0));

        Ok(VkContext {
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys,
            props,
            mem_props,
            families,
            max_anisotropy: anisotropy.then_some(props.limits.max_sampler_anisotropy),
            device,
            graphics_queue,
            present_queue,
            transfer_queue,
        })
    }

    pub unsafe fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(self
            .surface_loader
            .get_physical_device_surface_capabilities(self.phys, self.surface)
            .context("get_physical_device_surface_capabilities")?)
    }

    /// Device, then surface, then messenger, instance last.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_device(None);
        self.surface_loader.destroy_surface(self.surface, None);
        if let Some((loader, messenger)) = self.debug.take() {
            loader.destroy_debug_utils_messenger(messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}
