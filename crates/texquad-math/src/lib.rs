// SPDX-License-Identifier: CEPL-1.0
//! Per-frame transform block consumed by the quad's vertex shader.
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Degrees per second the quad spins about +Z.
pub const SPIN_DEG_PER_SEC: f32 = 90.0;

const FOV_Y_DEG: f32 = 45.0;
const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 10.0;

/// Matches `layout(set = 0, binding = 0) uniform Matrices` (std140, three mat4).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MatricesUbo {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

impl MatricesUbo {
    pub fn for_frame(elapsed_secs: f32, width: u32, height: u32) -> Self {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        MatricesUbo {
            model: spin_model(elapsed_secs).to_cols_array_2d(),
            view: camera_view().to_cols_array_2d(),
            proj: projection(aspect).to_cols_array_2d(),
        }
    }
}

pub fn spin_model(elapsed_secs: f32) -> Mat4 {
    Mat4::from_rotation_z(elapsed_secs * SPIN_DEG_PER_SEC.to_radians())
}

pub fn camera_view() -> Mat4 {
    Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z)
}

/// Right-handed perspective with 0..1 depth; clip-space Y is flipped for Vulkan.
pub fn projection(aspect: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(FOV_Y_DEG.to_radians(), aspect, Z_NEAR, Z_FAR);
    proj.y_axis.y *= -1.0;
    proj
}
