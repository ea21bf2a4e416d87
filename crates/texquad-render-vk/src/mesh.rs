// SPDX-License-Identifier: CEPL-1.0
use std::mem::{offset_of, size_of, size_of_val};

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::context::VkContext;
use crate::memory::{upload_via_staging, GpuBuffer, Transfers};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex {
        pos: [-0.5, -0.5, 0.0],
        color: [0.0, 1.0, 1.0],
        uv: [1.0, 1.0],
    },
    Vertex {
        pos: [0.5, -0.5, 0.0],
        color: [1.0, 0.0, 1.0],
        uv: [0.0, 1.0],
    },
    Vertex {
        pos: [0.5, 0.5, 0.0],
        color: [1.0, 1.0, 0.0],
        uv: [0.0, 0.0],
    },
    Vertex {
        pos: [-0.5, 0.5, 0.0],
        color: [1.0, 1.0, 1.0],
        uv: [1.0, 0.0],
    },
];

pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Locations 0..=2 match the vertex shader inputs.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, color) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, uv) as u32,
            },
        ]
    }
}

/// Device-local vertex + index buffers for the static quad.
pub(crate) struct Mesh {
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub index_count: u32,
}

impl Mesh {
    pub unsafe fn upload_quad(ctx: &VkContext, transfers: &Transfers) -> Result<Self> {
        let vbytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        let ibytes: &[u8] = bytemuck::cast_slice(&QUAD_INDICES);

        let vertices = GpuBuffer::new(
            ctx,
            size_of_val(&QUAD_VERTICES) as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        upload_via_staging(ctx, transfers, &vertices, vbytes)?;

        let indices = GpuBuffer::new(
            ctx,
            size_of_val(&QUAD_INDICES) as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        upload_via_staging(ctx, transfers, &indices, ibytes)?;

        Ok(Mesh {
            vertices,
            indices,
            index_count: QUAD_INDICES.len() as u32,
        })
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        self.indices.destroy(device);
        self.vertices.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(size_of::<Vertex>(), 32);
        assert_eq!(Vertex::binding_description().stride, 32);
        let offsets: Vec<u32> = Vertex::attribute_descriptions()
            .iter()
            .map(|a| a.offset)
            .collect();
        assert_eq!(offsets, vec![0, 12, 24]);
    }

    #[test]
    fn indices_form_two_triangles_over_four_vertices() {
        assert_eq!(QUAD_INDICES.len() % 3, 0);
        assert!(QUAD_INDICES
            .iter()
            .all(|&i| (i as usize) < QUAD_VERTICES.len()));
        assert_eq!(bytemuck::cast_slice::<u16, u8>(&QUAD_INDICES).len(), 12);
    }

    #[test]
    fn triangles_share_winding() {
        // z of the 2D cross product; equal signs mean equal winding.
        let cross = |t: &[u16]| {
            let [a, b, c] = [t[0], t[1], t[2]].map(|i| QUAD_VERTICES[i as usize].pos);
            (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
        };
        let first = cross(&QUAD_INDICES[0..3]);
        let second = cross(&QUAD_INDICES[3..6]);
        assert!(first != 0.0);
        assert_eq!(first.signum(), second.signum());
    }

    #[test]
    fn uvs_cover_the_unit_square_mirrored() {
        let uv = |i: usize| QUAD_VERTICES[i].uv;
        assert_eq!(uv(0), [1.0, 1.0]);
        assert_eq!(uv(2), [0.0, 0.0]);
        // left edge samples u = 1
        assert!(QUAD_VERTICES
            .iter()
            .filter(|v| v.pos[0] < 0.0)
            .all(|v| v.uv[0] == 1.0));
    }
}
