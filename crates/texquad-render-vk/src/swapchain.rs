// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::khr::swapchain;
use ash::vk;
use texquad_render::{PresentPreference, RenderSize};
use tracing::info;

use crate::context::VkContext;
use crate::SetupError;

pub(crate) struct SwapchainBundle {
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    /// Filled by `create_framebuffers` once the render pass exists.
    pub framebuffers: Vec<vk::Framebuffer>,
}

/// sRGB BGRA8 when offered, otherwise whatever the driver lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

fn present_mode_order(pref: PresentPreference) -> &'static [vk::PresentModeKHR] {
    match pref {
        PresentPreference::Mailbox => &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
        PresentPreference::Fifo => &[vk::PresentModeKHR::FIFO],
        PresentPreference::Immediate => &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ],
    }
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    pref: PresentPreference,
) -> vk::PresentModeKHR {
    present_mode_order(pref)
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 == no maximum).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

// Info only
pub fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

impl SwapchainBundle {
    /// `old` may be null. The caller destroys the old bundle afterwards.
    pub unsafe fn create(
        ctx: &VkContext,
        loader: &swapchain::Device,
        want: RenderSize,
        pref: PresentPreference,
        old: vk::SwapchainKHR,
    ) -> Result<Self> {
        let caps = ctx.surface_capabilities()?;
        let formats = ctx
            .surface_loader
            .get_physical_device_surface_formats(ctx.phys, ctx.surface)
            .context("get_physical_device_surface_formats")?;
        let modes = ctx
            .surface_loader
            .get_physical_device_surface_present_modes(ctx.phys, ctx.surface)
            .context("get_physical_device_surface_present_modes")?;

        let surf_format = choose_surface_format(&formats).ok_or(SetupError::NoSurfaceFormat)?;
        let present_mode = choose_present_mode(&modes, pref);
        let extent = extent_from_caps(&caps, want);
        let min_count = image_count(&caps);
        let (sharing_mode, family_indices) = ctx.families.swapchain_sharing();

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface,
            min_image_count: min_count,
            image_format: surf_format.format,
            image_color_space: surf_format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: family_indices.len() as u32,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        };

        let swapchain = loader
            .create_swapchain(&swap_info, None)
            .context("create_swapchain")?;
        let images = loader
            .get_swapchain_images(swapchain)
            .context("get_swapchain_images")?;

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            let iv_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: surf_format.format,
                subresource_range: crate::color_range(),
                ..Default::default()
            };
            views.push(ctx.device.create_image_view(&iv_info, None)?);
        }

        let bundle = SwapchainBundle {
            swapchain,
            format: surf_format.format,
            extent,
            present_mode,
            images,
            views,
            framebuffers: Vec::new(),
        };
        info!("swapchain: {} (min {})", bundle.summary(), caps.min_image_count);
        Ok(bundle)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}x{}, format {:?}, present {}, images {}",
            self.extent.width,
            self.extent.height,
            self.format,
            pm_name(self.present_mode),
            self.images.len(),
        )
    }

    pub unsafe fn create_framebuffers(
        &mut self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
    ) -> Result<()> {
        let mut framebuffers = Vec::with_capacity(self.views.len());
        for view in &self.views {
            let fb_info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass,
                attachment_count: 1,
                p_attachments: view,
                width: self.extent.width,
                height: self.extent.height,
                layers: 1,
                ..Default::default()
            };
            framebuffers.push(device.create_framebuffer(&fb_info, None)?);
        }
        self.framebuffers = framebuffers;
        Ok(())
    }

    /// Framebuffers, then views, then the swapchain itself.
    pub unsafe fn destroy(&mut self, device: &ash::Device, loader: &swapchain::Device) {
        for fb in self.framebuffers.drain(..) {
            device.destroy_framebuffer(fb, None);
        }
        for iv in self.views.drain(..) {
            device.destroy_image_view(iv, None);
        }
        loader.destroy_swapchain(self.swapchain, None);
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
    }
}
