// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;

pub mod frame;

pub use frame::{Acquired, FrameBackend, FrameOutcome, FramePacer, Presented, RebuildFlags};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// What a single `Renderer::render` call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderStatus {
    Presented,
    /// Nothing drawn this call (swapchain rebuilt instead).
    Skipped,
    /// Surface is 0x0; stays paused until a non-zero resize.
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PresentPreference {
    #[default]
    Mailbox, // triple buffering when available
    Fifo,      // vsync
    Immediate, // tearing allowed
}

#[derive(Clone, Debug)]
pub struct RendererOptions {
    pub app_name: String,
    pub frames_in_flight: usize,
    pub present: PresentPreference,
    pub validation: bool,
    pub texture_path: Option<PathBuf>,
    pub clear_color: [f32; 4],
}

impl Default for RendererOptions {
    fn default() -> Self {
        RendererOptions {
            app_name: "texquad".to_owned(),
            frames_in_flight: 2,
            present: PresentPreference::Mailbox,
            validation: false,
            texture_path: None,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        opts: &RendererOptions,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<RenderStatus>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_present(&mut self, _pref: PresentPreference) {}
}
