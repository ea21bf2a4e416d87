// SPDX-License-Identifier: CEPL-1.0
//! Render pass, descriptor layout, graphics pipeline and the on-disk pipeline cache.
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use tracing::{debug, info};

use crate::mesh::Vertex;

pub(crate) struct GraphicsPipeline {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl GraphicsPipeline {
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Single color attachment cleared on load and handed to present.
pub unsafe fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
    let color_att = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let att_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &att_ref,
        ..Default::default()
    };

    // The layout transition must not start before the acquire semaphore
    // (waited at COLOR_ATTACHMENT_OUTPUT) has signaled.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };

    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_att,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    Ok(device
        .create_render_pass(&rp_info, None)
        .context("create_render_pass")?)
}

/// binding 0: matrices (vertex), binding 1: texture (fragment).
pub unsafe fn create_descriptor_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::VERTEX,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        },
    ];
    let ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: bindings.len() as u32,
        p_bindings: bindings.as_ptr(),
        ..Default::default()
    };
    Ok(device
        .create_descriptor_set_layout(&ci, None)
        .context("create_descriptor_set_layout")?)
}

unsafe fn shader_module(device: &ash::Device, bytes: &[u8]) -> Result<vk::ShaderModule> {
    let code = read_spv(&mut Cursor::new(bytes))?;
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    Ok(device.create_shader_module(&ci, None)?)
}

/// Source-over blending, the same factors on color and alpha.
pub fn alpha_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::R
            | vk::ColorComponentFlags::G
            | vk::ColorComponentFlags::B
            | vk::ColorComponentFlags::A,
    }
}

// STRICT: the render pass fixes the color format. A swapchain format change
// means a new render pass and a new pipeline before the next record.
pub unsafe fn create_pipeline(
    device: &ash::Device,
    cache: vk::PipelineCache,
    render_pass: vk::RenderPass,
    set_layout: vk::DescriptorSetLayout,
) -> Result<GraphicsPipeline> {
    let vs_bytes = include_bytes!(concat!(env!("OUT_DIR"), "/quad.vert.spv"));
    let fs_bytes = include_bytes!(concat!(env!("OUT_DIR"), "/quad.frag.spv"));
    let vs = shader_module(device, vs_bytes).context("vertex shader module")?;
    let fs = shader_module(device, fs_bytes).context("fragment shader module")?;
    let entry = c"main";

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
    ];

    let vb = Vertex::binding_description();
    let va = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let color_blend_att = alpha_blend_attachment();
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        set_layout_count: 1,
        p_set_layouts: &set_layout,
        ..Default::default()
    };
    let layout = device
        .create_pipeline_layout(&layout_info, None)
        .context("create_pipeline_layout")?;

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    let result = device.create_graphics_pipelines(cache, std::slice::from_ref(&pipeline_info), None);
    device.destroy_shader_module(vs, None);
    device.destroy_shader_module(fs, None);

    let pipelines = match result {
        Ok(p) => p,
        Err((_, err)) => {
            device.destroy_pipeline_layout(layout, None);
            return Err(anyhow!("create_graphics_pipelines failed: {err:?}"));
        }
    };

    Ok(GraphicsPipeline {
        layout,
        pipeline: pipelines[0],
    })
}

fn hex_bytes(b: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(b.len() * 2);
    for x in b {
        let _ = write!(&mut s, "{x:02x}");
    }
    s
}

/// Local file keyed by vendor, device, driver and cache UUID.
pub fn pipeline_cache_path(props: &vk::PhysicalDeviceProperties) -> PathBuf {
    PathBuf::from(format!(
        "vk_pipeline_cache_{:04x}_{:04x}_{:08x}_{}.bin",
        props.vendor_id,
        props.device_id,
        props.driver_version,
        hex_bytes(&props.pipeline_cache_uuid)
    ))
}

pub unsafe fn create_or_load_pipeline_cache(
    device: &ash::Device,
    path: &Path,
) -> Result<vk::PipelineCache> {
    let data = fs::read(path).ok();
    let (p_initial_data, initial_data_size) = match &data {
        Some(bytes) => {
            debug!("pipeline cache: {} bytes from {}", bytes.len(), path.display());
            (bytes.as_ptr() as *const std::ffi::c_void, bytes.len())
        }
        None => (std::ptr::null(), 0),
    };

    let ci = vk::PipelineCacheCreateInfo {
        s_type: vk::StructureType::PIPELINE_CACHE_CREATE_INFO,
        initial_data_size,
        p_initial_data,
        ..Default::default()
    };
    match device.create_pipeline_cache(&ci, None) {
        Ok(cache) => Ok(cache),
        // Stale or foreign blob: start empty.
        Err(_) if data.is_some() => {
            info!("pipeline cache at {} rejected, starting empty", path.display());
            let empty = vk::PipelineCacheCreateInfo::default();
            Ok(device
                .create_pipeline_cache(&empty, None)
                .context("create_pipeline_cache")?)
        }
        Err(e) => Err(e).context("create_pipeline_cache"),
    }
}

pub unsafe fn save_pipeline_cache(
    device: &ash::Device,
    cache: vk::PipelineCache,
    path: &Path,
) -> Result<()> {
    let bytes = device
        .get_pipeline_cache_data(cache)
        .context("get_pipeline_cache_data")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, &bytes).with_context(|| format!("write {}", path.display()))?;
    debug!("pipeline cache: saved {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_encodes_device_identity() {
        let mut props = vk::PhysicalDeviceProperties {
            vendor_id: 0x10de,
            device_id: 0x2684,
            driver_version: 0x0123_4567,
            ..Default::default()
        };
        props.pipeline_cache_uuid[0] = 0xab;
        props.pipeline_cache_uuid[15] = 0x01;

        let name = pipeline_cache_path(&props);
        let name = name.to_str().unwrap();
        assert!(name.starts_with("vk_pipeline_cache_10de_2684_01234567_ab"));
        assert!(name.ends_with("01.bin"));
        // 16 uuid bytes -> 32 hex digits
        let uuid = name
            .trim_start_matches("vk_pipeline_cache_10de_2684_01234567_")
            .trim_end_matches(".bin");
        assert_eq!(uuid.len(), 32);
    }

    #[test]
    fn blending_is_source_over() {
        let b = alpha_blend_attachment();
        assert_eq!(b.blend_enable, vk::TRUE);
        assert_eq!(b.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(b.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(b.src_alpha_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(b.dst_alpha_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(b.alpha_blend_op, vk::BlendOp::ADD);
        assert_eq!(b.color_write_mask.as_raw(), 0b1111);
    }
}
