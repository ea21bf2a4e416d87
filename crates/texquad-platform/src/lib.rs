// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use winit::dpi::{LogicalSize, PhysicalSize};
use winit::window::{Window, WindowAttributes};

pub fn window_attributes(title: &str, width: u32, height: u32, resizable: bool) -> WindowAttributes {
    Window::default_attributes()
        .with_title(title)
        .with_inner_size(LogicalSize::new(width, height))
        .with_resizable(resizable)
}

/// Framebuffer size in pixels; either side may be zero while minimized.
pub fn framebuffer_size(window: &Window) -> (u32, u32) {
    let PhysicalSize { width, height } = window.inner_size();
    tracing::debug!("framebuffer size {}x{}", width, height);
    (width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::dpi::Size;

    #[test]
    fn attributes_carry_title_size_and_resizability() {
        let attrs = window_attributes("quad", 800, 600, false);
        assert_eq!(attrs.title, "quad");
        assert!(!attrs.resizable);
        match attrs.inner_size {
            Some(Size::Logical(s)) => {
                assert_eq!(s.width, 800.0);
                assert_eq!(s.height, 600.0);
            }
            other => panic!("unexpected inner size {other:?}"),
        }
    }
}
