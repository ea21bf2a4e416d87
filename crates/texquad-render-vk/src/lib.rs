// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: one textured quad, render pass path, N frames in flight.
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use ash::khr::swapchain as khr_swapchain;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use texquad_render::{
    FrameOutcome, FramePacer, PresentPreference, RebuildFlags, RenderSize, RenderStatus,
    Renderer, RendererOptions,
};
use thiserror::Error;
use tracing::{debug, info, warn};

mod context;
mod frame;
mod memory;
mod mesh;
mod pipeline;
mod swapchain;
mod texture;

use context::VkContext;
use frame::FrameResources;
use memory::Transfers;
use mesh::Mesh;
use pipeline::GraphicsPipeline;
use swapchain::SwapchainBundle;
use texture::{Texture, TexturePixels};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no Vulkan device offers graphics, present and swapchain support for this surface")]
    NoSuitableDevice,
    #[error("surface reports no formats")]
    NoSurfaceFormat,
    #[error("no memory type in bits {type_bits:#x} has {flags:?}")]
    NoMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },
    #[error("unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
}

const TEARDOWN_FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

pub(crate) fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Everything the frame loop touches. Kept apart from the pacer so
/// `pacer.draw_frame(&mut gpu)` borrows disjoint fields.
pub(crate) struct Gpu {
    pub ctx: VkContext,
    pub swapchain_loader: khr_swapchain::Device,
    pub sc: SwapchainBundle,
    pub render_pass: vk::RenderPass,
    pub set_layout: vk::DescriptorSetLayout,
    pub pipeline: GraphicsPipeline,
    pub pipeline_cache: vk::PipelineCache,
    pub cache_path: PathBuf,
    pub transfers: Transfers,
    pub frames: FrameResources,
    /// Indexed by swapchain image.
    pub render_finished: Vec<vk::Semaphore>,
    pub mesh: Mesh,
    pub texture: Texture,

    pub clear: vk::ClearValue,
    pub present: PresentPreference,
    pub want: RenderSize,
    pub start: Instant,
}

pub struct VkRenderer {
    gpu: Gpu,
    pacer: FramePacer,
    paused: bool,
}

unsafe fn build_renderer(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
    opts: &RendererOptions,
) -> Result<VkRenderer> {
    // 1) Instance, surface, device, queues
    let ctx = VkContext::new(window, display, opts)?;
    let device = &ctx.device;

    // 2) Pipeline cache keyed by this device
    let cache_path = pipeline::pipeline_cache_path(&ctx.props);
    let pipeline_cache = pipeline::create_or_load_pipeline_cache(device, &cache_path)?;

    // 3) Swapchain, then the render pass for its format, then framebuffers
    let swapchain_loader = khr_swapchain::Device::new(&ctx.instance, device);
    let mut sc = SwapchainBundle::create(
        &ctx,
        &swapchain_loader,
        size,
        opts.present,
        vk::SwapchainKHR::null(),
    )?;
    let render_pass = pipeline::create_render_pass(device, sc.format)?;
    sc.create_framebuffers(device, render_pass)?;

    // 4) Descriptor layout + pipeline
    let set_layout = pipeline::create_descriptor_set_layout(device)?;
    let pipeline = pipeline::create_pipeline(device, pipeline_cache, render_pass, set_layout)?;

    // 5) Static data: quad buffers and the texture
    let transfers = Transfers::new(&ctx)?;
    let mesh = Mesh::upload_quad(&ctx, &transfers)?;
    let pixels = TexturePixels::load_or_fallback(opts.texture_path.as_deref());
    let texture = Texture::upload(&ctx, &transfers, &pixels)?;

    // 6) Per-slot and per-image sync
    let frames_in_flight = opts.frames_in_flight.max(1);
    let frames = FrameResources::new(&ctx, set_layout, &texture, frames_in_flight)?;
    let render_finished = frame::create_render_finished(device, sc.images.len())?;

    let pacer = FramePacer::new(frames_in_flight, sc.images.len());
    info!(
        "vk renderer ready: {} frames in flight, {} swapchain images",
        frames_in_flight,
        sc.images.len()
    );

    Ok(VkRenderer {
        gpu: Gpu {
            ctx,
            swapchain_loader,
            sc,
            render_pass,
            set_layout,
            pipeline,
            pipeline_cache,
            cache_path,
            transfers,
            frames,
            render_finished,
            mesh,
            texture,
            clear: vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: opts.clear_color,
                },
            },
            present: opts.present,
            want: size,
            start: Instant::now(),
        },
        pacer,
        paused: size.is_zero(),
    })
}

impl Gpu {
    // STRICT ORDER (recreate):
    // 1) device_wait_idle(): nothing may still reference the old images
    // 2) zero-sized surface: keep the old swapchain, the next resize retries
    // 3) create NEW swapchain with old_swapchain = current
    // 4) new render pass + pipeline ONLY if the color format changed
    // 5) framebuffers against the current render pass
    // 6) destroy the OLD bundle, then the old render pass/pipeline
    // 7) per-image render-finished semaphores for the new image count
    pub unsafe fn recreate_swapchain(&mut self) -> Result<usize> {
        let device = &self.ctx.device;

        // 1)
        device.device_wait_idle()?;

        // 2)
        let caps = self.ctx.surface_capabilities()?;
        if caps.current_extent.width == 0 || caps.current_extent.height == 0 {
            debug!("surface is 0x0, keeping current swapchain");
            return Ok(self.sc.images.len());
        }

        // 3)
        let mut fresh = SwapchainBundle::create(
            &self.ctx,
            &self.swapchain_loader,
            self.want,
            self.present,
            self.sc.swapchain,
        )?;

        // 4)
        let mut retired = None;
        if fresh.format != self.sc.format {
            info!("swapchain format {:?} -> {:?}, rebuilding pipeline", self.sc.format, fresh.format);
            let render_pass = pipeline::create_render_pass(device, fresh.format)?;
            let pipeline = pipeline::create_pipeline(
                device,
                self.pipeline_cache,
                render_pass,
                self.set_layout,
            )?;
            let old_rp = std::mem::replace(&mut self.render_pass, render_pass);
            let old_pipe = std::mem::replace(&mut self.pipeline, pipeline);
            retired = Some((old_rp, old_pipe));
        }

        // 5)
        fresh.create_framebuffers(device, self.render_pass)?;

        // 6)
        let mut old = std::mem::replace(&mut self.sc, fresh);
        old.destroy(device, &self.swapchain_loader);
        if let Some((rp, pipe)) = retired {
            pipe.destroy(device);
            device.destroy_render_pass(rp, None);
        }

        // 7)
        for sem in self.render_finished.drain(..) {
            device.destroy_semaphore(sem, None);
        }
        self.render_finished = frame::create_render_finished(device, self.sc.images.len())?;

        Ok(self.sc.images.len())
    }

    // STRICT TEARDOWN ORDER (caller has waited for the device):
    // per-slot objects, per-image semaphores, static data, transient pools,
    // swapchain bundle, pipeline, layouts, render pass, cache, then the context.
    unsafe fn destroy(&mut self) {
        let d = &self.ctx.device;

        // 1) PER-SLOT (fences, semaphores, mapped UBOs, command buffers)
        self.frames.destroy(d);

        // 2) PER-IMAGE render-finished semaphores
        for sem in self.render_finished.drain(..) {
            d.destroy_semaphore(sem, None);
        }

        // 3) STATIC DATA
        self.texture.destroy(d);
        self.mesh.destroy(d);
        self.transfers.destroy(d);

        // 4) SWAPCHAIN BUNDLE (framebuffers, views, swapchain)
        self.sc.destroy(d, &self.swapchain_loader);

        // 5) PIPELINE, LAYOUTS, RENDER PASS
        self.pipeline.destroy(d);
        d.destroy_descriptor_set_layout(self.set_layout, None);
        d.destroy_render_pass(self.render_pass, None);

        // 6) CACHE: persist before destroying
        if let Err(e) = pipeline::save_pipeline_cache(d, self.pipeline_cache, &self.cache_path) {
            warn!("pipeline cache not saved: {e:#}");
        }
        d.destroy_pipeline_cache(self.pipeline_cache, None);

        // 7) DEVICE, SURFACE, INSTANCE
        self.ctx.destroy();
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            let d = &self.gpu.ctx.device;

            // Wait every slot fence (bounded: a lost device must not hang the
            // exit path), then the whole device.
            let fences = self.gpu.frames.fences();
            if !fences.is_empty() {
                match d.wait_for_fences(&fences, true, TEARDOWN_FENCE_TIMEOUT_NS) {
                    Ok(()) => {}
                    Err(vk::Result::TIMEOUT) => {
                        warn!("teardown: frame fences still unsignaled after 1s")
                    }
                    Err(e) => warn!("teardown: wait_for_fences: {e:?}"),
                }
            }
            d.device_wait_idle().ok();

            self.gpu.destroy();
        }
    }
}

impl VkRenderer {
    pub fn frames_drawn(&self) -> u64 {
        self.pacer.frames_drawn()
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        opts: &RendererOptions,
    ) -> Result<Self> {
        unsafe { build_renderer(window, display, size, opts) }
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size.is_zero() {
            if !self.paused {
                info!("vk: resize to 0x0 → paused");
            }
            self.paused = true;
            return Ok(());
        }
        if self.paused {
            info!("vk: resize to {}x{} → resumed", size.width, size.height);
        }
        self.paused = false;
        self.gpu.want = size;
        self.pacer.request_rebuild(RebuildFlags::RESIZED);
        Ok(())
    }

    fn render(&mut self) -> Result<RenderStatus> {
        if self.paused {
            return Ok(RenderStatus::Paused);
        }

        // Minimized windows on some platforms only show up as a 0x0 surface.
        let caps = unsafe { self.gpu.ctx.surface_capabilities()? };
        if caps.current_extent.width == 0 || caps.current_extent.height == 0 {
            info!("vk: current_extent is 0x0 → paused");
            self.paused = true;
            return Ok(RenderStatus::Paused);
        }

        match self.pacer.draw_frame(&mut self.gpu)? {
            FrameOutcome::Presented { .. } => Ok(RenderStatus::Presented),
            FrameOutcome::Skipped { reason } => {
                debug!("frame skipped ({reason:?})");
                Ok(RenderStatus::Skipped)
            }
        }
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        // Command buffers are re-recorded every frame.
        self.gpu.clear = vk::ClearValue {
            color: vk::ClearColorValue { float32: rgba },
        };
    }

    fn set_present(&mut self, pref: PresentPreference) {
        if self.gpu.present == pref {
            return;
        }
        self.gpu.present = pref;
        self.pacer.request_rebuild(RebuildFlags::SETTINGS);
    }
}
