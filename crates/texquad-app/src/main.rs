// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod stats;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use texquad_core::{init_tracing, AppConfig, PresentModeCfg};
use texquad_platform::{framebuffer_size, window_attributes};
use texquad_render::{PresentPreference, RenderSize, RenderStatus, Renderer, RendererOptions};
use texquad_render_vk::VkRenderer;
use tracing::{error, info};

use texquad_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

use stats::FrameStats;

#[derive(Parser, Debug)]
#[command(author, version, about = "Spinning textured quad on Vulkan", long_about = None)]
struct Args {
    /// Config file; missing means defaults
    #[arg(long, default_value = "texquad.toml")]
    config: PathBuf,

    /// Frame slots cycled by the CPU (1..=3)
    #[arg(long)]
    frames_in_flight: Option<usize>,

    /// PNG/JPEG texture for the quad
    #[arg(long)]
    texture: Option<PathBuf>,

    #[arg(long, value_enum)]
    present: Option<PresentArg>,

    /// Enable the Khronos validation layer
    #[arg(long, overrides_with = "no_validation")]
    validation: bool,

    #[arg(long, overrides_with = "validation")]
    no_validation: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PresentArg {
    Mailbox,
    Fifo,
    Immediate,
}

impl From<PresentArg> for PresentModeCfg {
    fn from(p: PresentArg) -> Self {
        match p {
            PresentArg::Mailbox => PresentModeCfg::Mailbox,
            PresentArg::Fifo => PresentModeCfg::Fifo,
            PresentArg::Immediate => PresentModeCfg::Immediate,
        }
    }
}

impl Args {
    fn validation(&self) -> Option<bool> {
        match (self.validation, self.no_validation) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    /// CLI flags win over the file.
    fn apply(&self, cfg: &mut AppConfig) {
        if let Some(n) = self.frames_in_flight {
            cfg.render.frames_in_flight = n;
        }
        if let Some(t) = &self.texture {
            cfg.render.texture = Some(t.clone());
        }
        if let Some(p) = self.present {
            cfg.render.present = p.into();
        }
        if let Some(v) = self.validation() {
            cfg.render.validation = v;
        }
    }
}

fn present_pref(p: PresentModeCfg) -> PresentPreference {
    match p {
        PresentModeCfg::Mailbox => PresentPreference::Mailbox,
        PresentModeCfg::Fifo => PresentPreference::Fifo,
        PresentModeCfg::Immediate => PresentPreference::Immediate,
    }
}

fn next_present(p: PresentPreference) -> PresentPreference {
    match p {
        PresentPreference::Mailbox => PresentPreference::Fifo,
        PresentPreference::Fifo => PresentPreference::Immediate,
        PresentPreference::Immediate => PresentPreference::Mailbox,
    }
}

fn renderer_options(cfg: &AppConfig) -> RendererOptions {
    RendererOptions {
        app_name: cfg.window.title.clone(),
        frames_in_flight: cfg.render.frames_in_flight,
        present: present_pref(cfg.render.present),
        validation: cfg.render.validation,
        texture_path: cfg.render.texture.clone(),
        clear_color: cfg.render.clear_color,
    }
}

struct App {
    cfg: AppConfig,
    // Declared before `window`: the surface must go first.
    renderer: Option<VkRenderer>,
    window: Option<Window>,
    present: PresentPreference,
    paused: bool,
    exiting: bool,
    stats: FrameStats,
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(cfg: AppConfig) -> Self {
        let present = present_pref(cfg.render.present);
        App {
            cfg,
            renderer: None,
            window: None,
            present,
            paused: false,
            exiting: false,
            stats: FrameStats::new(Instant::now()),
            failure: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let w = &self.cfg.window;
        let window = event_loop
            .create_window(window_attributes(&w.title, w.width, w.height, w.resizable))
            .context("create_window")?;

        let (width, height) = framebuffer_size(&window);
        let size = RenderSize { width, height };
        let renderer = VkRenderer::new(&window, &window, size, &renderer_options(&self.cfg))
            .context("vk init")?;

        info!("window {}x{}, present {:?}", width, height, self.present);
        self.paused = size.is_zero();
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    /// Throw and exit: keep the error for `main`, tear down in order.
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.failure = Some(e);
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        if let Some(r) = self.renderer.take() {
            info!(
                "frames drawn: {} (timed {}, mean {:.2?})",
                r.frames_drawn(),
                self.stats.total(),
                self.stats.mean()
            );
        }
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() && !self.exiting {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
                return;
            }
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        info!("resumed → paused={}", self.paused);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        match &self.window {
            Some(window) if window.id() == window_id => {}
            _ => return,
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                let size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                let now_paused = size.is_zero();
                if self.paused != now_paused {
                    info!("Resized → {}x{} (paused={})", size.width, size.height, now_paused);
                    if now_paused {
                        self.stats.pause();
                    }
                }
                self.paused = now_paused;

                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(size) {
                        self.fail(event_loop, e);
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed
                    && !event.repeat
                    && event.physical_key == PhysicalKey::Code(KeyCode::KeyP)
                {
                    self.present = next_present(self.present);
                    info!("present preference → {:?}", self.present);
                    if let Some(r) = &mut self.renderer {
                        r.set_present(self.present);
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                let Some(r) = &mut self.renderer else {
                    return;
                };
                match r.render() {
                    Ok(status) => {
                        if status == RenderStatus::Paused {
                            info!("renderer paused (0x0 surface)");
                            self.paused = true;
                        }
                        if let Some(s) = self.stats.record(status, Instant::now()) {
                            info!(
                                "fps ~ {:.0} (frame {:.2} ms, mean {:.2} ms, total {})",
                                s.fps, s.latest_ms, s.mean_ms, s.total
                            );
                        }
                    }
                    Err(e) => self.fail(event_loop, e.context("render")),
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.paused {
            // minimized → sleep until the next event
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = AppConfig::load(&args.config)?;
    args.apply(&mut cfg);
    cfg.validate()?;

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
