// SPDX-License-Identifier: CEPL-1.0
//! Buffers, memory types and one-shot transfer submissions.
use anyhow::{Context, Result};
use ash::vk;

use crate::context::VkContext;
use crate::SetupError;

pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32, SetupError> {
    (0..props.memory_type_count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize].property_flags.contains(flags)
        })
        .ok_or(SetupError::NoMemoryType { type_bits, flags })
}

pub(crate) struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    pub unsafe fn new(
        ctx: &VkContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let device = &ctx.device;
        let (sharing_mode, families) = ctx.families.buffer_sharing();
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode,
            queue_family_index_count: families.len() as u32,
            p_queue_family_indices: families.as_ptr(),
            ..Default::default()
        };
        let buffer = device.create_buffer(&bci, None).context("create_buffer")?;
        let req = device.get_buffer_memory_requirements(buffer);
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: find_memory_type(&ctx.mem_props, req.memory_type_bits, flags)?,
            ..Default::default()
        };
        let memory = device.allocate_memory(&mai, None).context("allocate_memory")?;
        device.bind_buffer_memory(buffer, memory, 0)?;
        Ok(GpuBuffer {
            buffer,
            memory,
            size,
        })
    }

    /// Host-visible, coherent, filled with `bytes`.
    pub unsafe fn staging(ctx: &VkContext, bytes: &[u8]) -> Result<Self> {
        let staging = GpuBuffer::new(
            ctx,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let ptr = ctx
            .device
            .map_memory(staging.memory, 0, staging.size, vk::MemoryMapFlags::empty())?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        ctx.device.unmap_memory(staging.memory);
        Ok(staging)
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
    }
}

/// Transient pools for setup-time copies. Buffer copies go to the dedicated
/// transfer queue when there is one; image work stays on graphics.
pub(crate) struct Transfers {
    graphics_pool: vk::CommandPool,
    transfer_pool: Option<vk::CommandPool>,
}

unsafe fn transient_pool(device: &ash::Device, family: u32) -> Result<vk::CommandPool> {
    let ci = vk::CommandPoolCreateInfo {
        s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
        queue_family_index: family,
        flags: vk::CommandPoolCreateFlags::TRANSIENT,
        ..Default::default()
    };
    Ok(device
        .create_command_pool(&ci, None)
        .context("create_command_pool(transient)")?)
}

impl Transfers {
    pub unsafe fn new(ctx: &VkContext) -> Result<Self> {
        let graphics_pool = transient_pool(&ctx.device, ctx.families.graphics)?;
        let transfer_pool = match ctx.families.transfer {
            Some(family) => Some(transient_pool(&ctx.device, family)?),
            None => None,
        };
        Ok(Transfers {
            graphics_pool,
            transfer_pool,
        })
    }

    fn copy_target(&self, ctx: &VkContext) -> (vk::CommandPool, vk::Queue) {
        match (self.transfer_pool, ctx.transfer_queue) {
            (Some(pool), Some(queue)) => (pool, queue),
            _ => (self.graphics_pool, ctx.graphics_queue),
        }
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        if let Some(pool) = self.transfer_pool {
            device.destroy_command_pool(pool, None);
        }
        device.destroy_command_pool(self.graphics_pool, None);
    }
}

/// Record with `f`, submit, wait for the queue, free the buffer.
unsafe fn one_shot(
    device: &ash::Device,
    pool: vk::CommandPool,
    queue: vk::Queue,
    f: impl FnOnce(vk::CommandBuffer),
) -> Result<()> {
    let ai = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = device.allocate_command_buffers(&ai)?[0];
    let bi = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    device.begin_command_buffer(cmd, &bi)?;
    f(cmd);
    device.end_command_buffer(cmd)?;

    let si = vk::SubmitInfo {
        s_type: vk::StructureType::SUBMIT_INFO,
        command_buffer_count: 1,
        p_command_buffers: &cmd,
        ..Default::default()
    };
    device
        .queue_submit(queue, std::slice::from_ref(&si), vk::Fence::null())
        .context("queue_submit(one-shot)")?;
    device.queue_wait_idle(queue)?;
    device.free_command_buffers(pool, std::slice::from_ref(&cmd));
    Ok(())
}

pub unsafe fn copy_buffer(
    ctx: &VkContext,
    transfers: &Transfers,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    let (pool, queue) = transfers.copy_target(ctx);
    one_shot(&ctx.device, pool, queue, |cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        ctx.device
            .cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region));
    })
}

/// Image must already be in TRANSFER_DST_OPTIMAL.
pub unsafe fn copy_buffer_to_image(
    ctx: &VkContext,
    transfers: &Transfers,
    src: vk::Buffer,
    image: vk::Image,
    width: u32,
    height: u32,
) -> Result<()> {
    one_shot(&ctx.device, transfers.graphics_pool, ctx.graphics_queue, |cmd| {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        ctx.device.cmd_copy_buffer_to_image(
            cmd,
            src,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&region),
        );
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier masks for the two transitions a sampled texture goes through.
pub fn layout_transition(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<LayoutTransition, SetupError> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => {
            Ok(LayoutTransition {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            })
        }
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(LayoutTransition {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => Err(SetupError::UnsupportedLayoutTransition { old, new }),
    }
}

pub unsafe fn transition_image_layout(
    ctx: &VkContext,
    transfers: &Transfers,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let t = layout_transition(old, new)?;
    one_shot(&ctx.device, transfers.graphics_pool, ctx.graphics_queue, |cmd| {
        let barrier = vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: t.src_access,
            dst_access_mask: t.dst_access,
            old_layout: old,
            new_layout: new,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range: crate::color_range(),
            ..Default::default()
        };
        ctx.device.cmd_pipeline_barrier(
            cmd,
            t.src_stage,
            t.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
    })
}

/// Host bytes -> staging -> `dst` (device-local). Blocks until done.
pub unsafe fn upload_via_staging(
    ctx: &VkContext,
    transfers: &Transfers,
    dst: &GpuBuffer,
    bytes: &[u8],
) -> Result<()> {
    let staging = GpuBuffer::staging(ctx, bytes)?;
    let res = copy_buffer(
        ctx,
        transfers,
        staging.buffer,
        dst.buffer,
        bytes.len() as vk::DeviceSize,
    );
    staging.destroy(&ctx.device);
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
        }
        props
    }

    #[test]
    fn picks_first_type_allowed_by_bits_and_flags() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = mem_props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            host,
            host | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
        assert_eq!(find_memory_type(&props, 0b111, host).unwrap(), 1);
        // type 1 excluded by the requirement bits
        assert_eq!(find_memory_type(&props, 0b101, host).unwrap(), 2);
    }

    #[test]
    fn no_matching_type_is_an_error() {
        let props = mem_props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(err, SetupError::NoMemoryType { type_bits: 1, .. }));
        // bits beyond memory_type_count are never considered
        assert!(find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::empty()).is_err());
    }

    #[test]
    fn upload_transition_masks() {
        let t = layout_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert!(t.src_access.is_empty());
        assert_eq!(t.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(t.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(t.dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn sample_transition_masks() {
        let t = layout_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(t.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(t.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(t.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn other_transitions_are_rejected() {
        let err = layout_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SetupError::UnsupportedLayoutTransition { old, new }
                if old == vk::ImageLayout::UNDEFINED
                    && new == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        ));
    }
}
