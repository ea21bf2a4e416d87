// SPDX-License-Identifier: CEPL-1.0
//! Sampled RGBA8 texture: decode, upload, view, sampler.
use std::path::Path;

use anyhow::{Context, Result};
use ash::vk;
use tracing::{info, warn};

use crate::context::VkContext;
use crate::memory::{
    copy_buffer_to_image, find_memory_type, transition_image_layout, GpuBuffer, Transfers,
};

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

const CHECKER_SIZE: u32 = 256;
const CHECKER_CELL: u32 = 32;

/// Tightly packed RGBA8, row-major, top row first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TexturePixels {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl TexturePixels {
    pub fn from_file(path: &Path) -> Result<Self> {
        let img = image::open(path)
            .with_context(|| format!("decode {}", path.display()))?
            .to_rgba8();
        let (width, height) = img.dimensions();
        Ok(TexturePixels {
            width,
            height,
            rgba: img.into_raw(),
        })
    }

    /// White/grey squares of `cell` pixels.
    pub fn checkerboard(size: u32, cell: u32) -> Self {
        let cell = cell.max(1);
        let mut rgba = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let v = if (x / cell + y / cell) % 2 == 0 { 255 } else { 96 };
                rgba.extend_from_slice(&[v, v, v, 255]);
            }
        }
        TexturePixels {
            width: size,
            height: size,
            rgba,
        }
    }

    /// Falls back to a checkerboard when `path` is unset or unreadable.
    pub fn load_or_fallback(path: Option<&Path>) -> Self {
        match path.map(Self::from_file) {
            Some(Ok(px)) => {
                info!("texture {}x{} loaded", px.width, px.height);
                px
            }
            Some(Err(e)) => {
                warn!("{e:#}; using a generated checkerboard");
                Self::checkerboard(CHECKER_SIZE, CHECKER_CELL)
            }
            None => {
                warn!("no texture configured; using a generated checkerboard");
                Self::checkerboard(CHECKER_SIZE, CHECKER_CELL)
            }
        }
    }
}

/// Linear filtering, repeat addressing; anisotropy only when the device feature is on.
pub fn sampler_info(max_anisotropy: Option<f32>) -> vk::SamplerCreateInfo<'static> {
    vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        anisotropy_enable: if max_anisotropy.is_some() { vk::TRUE } else { vk::FALSE },
        max_anisotropy: max_anisotropy.unwrap_or(1.0),
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        unnormalized_coordinates: vk::FALSE,
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::ALWAYS,
        min_lod: 0.0,
        max_lod: 0.0,
        ..Default::default()
    }
}

pub(crate) struct Texture {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

impl Texture {
    // ORDER: staging -> image(UNDEFINED) -> TRANSFER_DST -> copy -> SHADER_READ_ONLY
    pub unsafe fn upload(ctx: &VkContext, transfers: &Transfers, px: &TexturePixels) -> Result<Self> {
        let device = &ctx.device;
        let staging = GpuBuffer::staging(ctx, &px.rgba)?;

        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: TEXTURE_FORMAT,
            extent: vk::Extent3D {
                width: px.width,
                height: px.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = device.create_image(&img_ci, None).context("create_image(texture)")?;

        let req = device.get_image_memory_requirements(image);
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: find_memory_type(
                &ctx.mem_props,
                req.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?,
            ..Default::default()
        };
        let memory = device.allocate_memory(&alloc, None)?;
        device.bind_image_memory(image, memory, 0)?;

        transition_image_layout(
            ctx,
            transfers,
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        copy_buffer_to_image(ctx, transfers, staging.buffer, image, px.width, px.height)?;
        transition_image_layout(
            ctx,
            transfers,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        staging.destroy(device);

        let view_ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format: TEXTURE_FORMAT,
            subresource_range: crate::color_range(),
            ..Default::default()
        };
        let view = device.create_image_view(&view_ci, None)?;
        let sampler = device
            .create_sampler(&sampler_info(ctx.max_anisotropy), None)
            .context("create_sampler")?;

        Ok(Texture {
            image,
            memory,
            view,
            sampler,
        })
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_sampler(self.sampler, None);
        device.destroy_image_view(self.view, None);
        device.destroy_image(self.image, None);
        device.free_memory(self.memory, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let px = TexturePixels::checkerboard(8, 4);
        assert_eq!((px.width, px.height), (8, 8));
        assert_eq!(px.rgba.len(), 8 * 8 * 4);

        let at = |x: usize, y: usize| &px.rgba[(y * 8 + x) * 4..][..4];
        assert_eq!(at(0, 0), &[255, 255, 255, 255]);
        assert_eq!(at(3, 3), &[255, 255, 255, 255]);
        assert_eq!(at(4, 0), &[96, 96, 96, 255]);
        assert_eq!(at(0, 4), &[96, 96, 96, 255]);
        assert_eq!(at(4, 4), &[255, 255, 255, 255]);
    }

    #[test]
    fn missing_file_falls_back_to_checkerboard() {
        let path = std::env::temp_dir().join("texquad-no-such-texture.png");
        let px = TexturePixels::load_or_fallback(Some(&path));
        assert_eq!(px, TexturePixels::checkerboard(CHECKER_SIZE, CHECKER_CELL));
        let px = TexturePixels::load_or_fallback(None);
        assert_eq!(px.width, CHECKER_SIZE);
    }

    #[test]
    fn png_round_trips_through_decoder() {
        let path = std::env::temp_dir().join(format!("texquad-test-{}.png", std::process::id()));
        let mut img = image::RgbaImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
        img.put_pixel(1, 0, image::Rgba([0, 0, 255, 128]));
        img.save(&path).unwrap();

        let px = TexturePixels::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!((px.width, px.height), (2, 1));
        assert_eq!(px.rgba, vec![255, 0, 0, 255, 0, 0, 255, 128]);
    }

    #[test]
    fn anisotropy_follows_device_support() {
        let off = sampler_info(None);
        assert_eq!(off.anisotropy_enable, vk::FALSE);
        assert_eq!(off.max_anisotropy, 1.0);

        let on = sampler_info(Some(16.0));
        assert_eq!(on.anisotropy_enable, vk::TRUE);
        assert_eq!(on.max_anisotropy, 16.0);
        assert_eq!(on.address_mode_u, vk::SamplerAddressMode::REPEAT);
    }
}
