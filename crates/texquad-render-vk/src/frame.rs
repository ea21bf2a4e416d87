// SPDX-License-Identifier: CEPL-1.0
//! Per-slot GPU objects and the `FrameBackend` that drives them.
use std::ffi::c_void;
use std::mem::size_of;

use anyhow::{anyhow, Context, Result};
use ash::vk;
use texquad_math::MatricesUbo;
use texquad_render::{Acquired, FrameBackend, Presented};

use crate::context::VkContext;
use crate::memory::GpuBuffer;
use crate::texture::Texture;
use crate::Gpu;

pub(crate) struct FrameSlot {
    pub cmd: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub ubo: GpuBuffer,
    /// Persistently mapped; host-coherent.
    ubo_ptr: *mut c_void,
    pub descriptor_set: vk::DescriptorSet,
}

pub(crate) struct FrameResources {
    pub cmd_pool: vk::CommandPool,
    pub desc_pool: vk::DescriptorPool,
    pub slots: Vec<FrameSlot>,
}

impl FrameResources {
    pub unsafe fn new(
        ctx: &VkContext,
        set_layout: vk::DescriptorSetLayout,
        texture: &Texture,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let device = &ctx.device;
        let count = frames_in_flight as u32;

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: ctx.families.graphics,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let cmd_pool = device
            .create_command_pool(&pool_info, None)
            .context("create_command_pool(frames)")?;
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        let cmds = device.allocate_command_buffers(&alloc_info)?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: count,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: count,
            },
        ];
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: count,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        let desc_pool = device.create_descriptor_pool(&pool_ci, None)?;
        let layouts = vec![set_layout; frames_in_flight];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: desc_pool,
            descriptor_set_count: count,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = device.allocate_descriptor_sets(&alloc)?;

        let sem_ci = vk::SemaphoreCreateInfo::default();
        // Signaled so the first wait on every slot returns at once.
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let ubo_size = size_of::<MatricesUbo>() as vk::DeviceSize;
        let image_info = vk::DescriptorImageInfo {
            sampler: texture.sampler,
            image_view: texture.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };

        let mut slots = Vec::with_capacity(frames_in_flight);
        for (cmd, descriptor_set) in cmds.into_iter().zip(sets) {
            let ubo = GpuBuffer::new(
                ctx,
                ubo_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            let ubo_ptr = device.map_memory(ubo.memory, 0, ubo_size, vk::MemoryMapFlags::empty())?;

            let buffer_info = vk::DescriptorBufferInfo {
                buffer: ubo.buffer,
                offset: 0,
                range: ubo_size,
            };
            let writes = [
                vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: descriptor_set,
                    dst_binding: 0,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    p_buffer_info: &buffer_info,
                    ..Default::default()
                },
                vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: descriptor_set,
                    dst_binding: 1,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    p_image_info: &image_info,
                    ..Default::default()
                },
            ];
            device.update_descriptor_sets(&writes, &[]);

            slots.push(FrameSlot {
                cmd,
                image_available: device.create_semaphore(&sem_ci, None)?,
                in_flight: device.create_fence(&fence_ci, None)?,
                ubo,
                ubo_ptr,
                descriptor_set,
            });
        }

        Ok(FrameResources {
            cmd_pool,
            desc_pool,
            slots,
        })
    }

    pub fn fences(&self) -> Vec<vk::Fence> {
        self.slots.iter().map(|s| s.in_flight).collect()
    }

    /// Caller guarantees no submission from any slot is pending.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for s in self.slots.drain(..) {
            device.unmap_memory(s.ubo.memory);
            s.ubo.destroy(device);
            device.destroy_fence(s.in_flight, None);
            device.destroy_semaphore(s.image_available, None);
        }
        // Frees the sets and command buffers with them.
        device.destroy_descriptor_pool(self.desc_pool, None);
        device.destroy_command_pool(self.cmd_pool, None);
    }
}

impl FrameSlot {
    unsafe fn write_ubo(&self, ubo: &MatricesUbo) {
        let bytes = bytemuck::bytes_of(ubo);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ubo_ptr as *mut u8, bytes.len());
    }
}

/// One render-finished semaphore per swapchain image.
pub(crate) unsafe fn create_render_finished(
    device: &ash::Device,
    image_count: usize,
) -> Result<Vec<vk::Semaphore>> {
    let sem_ci = vk::SemaphoreCreateInfo::default();
    let mut sems = Vec::with_capacity(image_count);
    for _ in 0..image_count {
        sems.push(device.create_semaphore(&sem_ci, None)?);
    }
    Ok(sems)
}

impl Gpu {
    unsafe fn record_commands(&self, slot: &FrameSlot, image: u32) -> Result<()> {
        let d = &self.ctx.device;
        let cmd = slot.cmd;
        let extent = self.sc.extent;

        d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        d.begin_command_buffer(cmd, &begin)?;

        let clears = [self.clear];
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.render_pass,
            framebuffer: self.sc.framebuffers[image as usize],
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
        d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);

        // Y is already flipped in the projection.
        let vp = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        d.cmd_set_viewport(cmd, 0, std::slice::from_ref(&vp));
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        d.cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));

        d.cmd_bind_vertex_buffers(cmd, 0, &[self.mesh.vertices.buffer], &[0]);
        d.cmd_bind_index_buffer(cmd, self.mesh.indices.buffer, 0, vk::IndexType::UINT16);
        d.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.pipeline.layout,
            0,
            std::slice::from_ref(&slot.descriptor_set),
            &[],
        );
        d.cmd_draw_indexed(cmd, self.mesh.index_count, 1, 0, 0, 0);

        d.cmd_end_render_pass(cmd);
        d.end_command_buffer(cmd)?;
        Ok(())
    }
}

impl FrameBackend for Gpu {
    fn wait_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames.slots[slot].in_flight;
        unsafe {
            self.ctx
                .device
                .wait_for_fences(&[fence], true, u64::MAX)
                .context("wait_for_fences(in-flight)")?;
        }
        Ok(())
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames.slots[slot].in_flight;
        unsafe { self.ctx.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn acquire(&mut self, slot: usize) -> Result<Acquired> {
        let sem = self.frames.slots[slot].image_available;
        let res = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.sc.swapchain, u64::MAX, sem, vk::Fence::null())
        };
        match res {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(e) => Err(anyhow!("acquire_next_image: {e:?}")),
        }
    }

    fn record(&mut self, slot: usize, image: u32) -> Result<()> {
        let extent = self.sc.extent;
        let elapsed = self.start.elapsed().as_secs_f32();
        let s = &self.frames.slots[slot];
        unsafe {
            s.write_ubo(&MatricesUbo::for_frame(elapsed, extent.width, extent.height));
            self.record_commands(s, image)
        }
    }

    fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
        let s = &self.frames.slots[slot];
        let render_finished = self.render_finished[image as usize];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &s.image_available,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &s.cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &render_finished,
            ..Default::default()
        };
        unsafe {
            self.ctx
                .device
                .queue_submit(
                    self.ctx.graphics_queue,
                    std::slice::from_ref(&submit),
                    s.in_flight,
                )
                .context("queue_submit")?;
        }
        Ok(())
    }

    // Empty batch: no command buffers, no signal semaphores. The acquire
    // semaphore is consumed and the fence signals once the queue reaches it.
    fn release_slot(&mut self, slot: usize) -> Result<()> {
        let s = &self.frames.slots[slot];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &s.image_available,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.ctx
                .device
                .queue_submit(
                    self.ctx.graphics_queue,
                    std::slice::from_ref(&submit),
                    s.in_flight,
                )
                .context("queue_submit(release)")?;
        }
        Ok(())
    }

    fn present(&mut self, _slot: usize, image: u32) -> Result<Presented> {
        let render_finished = self.render_finished[image as usize];
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &render_finished,
            swapchain_count: 1,
            p_swapchains: &self.sc.swapchain,
            p_image_indices: &image,
            ..Default::default()
        };
        let res = unsafe {
            self.swapchain_loader
                .queue_present(self.ctx.present_queue, &present)
        };
        match res {
            Ok(false) => Ok(Presented::Optimal),
            Ok(true) => Ok(Presented::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::OutOfDate),
            Err(e) => Err(anyhow!("queue_present: {e:?}")),
        }
    }

    fn rebuild_swapchain(&mut self) -> Result<usize> {
        unsafe { self.recreate_swapchain() }
    }
}
