// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Upper bound on per-frame resource sets the renderer will cycle through.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("render.frames_in_flight must be in 1..={max}, got {got}")]
    FramesInFlight { got: usize, max: usize },
    #[error("window size must be non-zero, got {width}x{height}")]
    WindowSize { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeCfg {
    #[default]
    Mailbox,
    Fifo,
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: "Vulkan Tutorial - Test".to_owned(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderCfg {
    pub frames_in_flight: usize,
    pub present: PresentModeCfg,
    pub validation: bool,
    pub clear_color: [f32; 4],
    pub texture: Option<PathBuf>,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            frames_in_flight: 2,
            present: PresentModeCfg::Mailbox,
            validation: cfg!(debug_assertions),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            texture: Some(PathBuf::from("assets/texture.png")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub window: WindowCfg,
    pub render: RenderCfg,
}

impl AppConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(s) => {
                let cfg = Self::from_toml_str(&s)?;
                info!("config loaded from {}", path.display());
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fif = self.render.frames_in_flight;
        if fif == 0 || fif > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::FramesInFlight {
                got: fif,
                max: MAX_FRAMES_IN_FLIGHT,
            });
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(ConfigError::WindowSize {
                width: self.window.width,
                height: self.window.height,
            });
        }
        Ok(())
    }
}
