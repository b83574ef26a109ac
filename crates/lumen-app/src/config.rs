// SPDX-License-Identifier: CEPL-1.0
//! `lumen.toml`.
use std::fs;
use std::path::Path;
use std::time::Duration;

use lumen_render::{ColorInfo, ColorKind, PresentOptions, RendererOptions};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq)]
pub struct AppCfg {
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub color: ColorCfg,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub max_in_flight_frames: u32,
    pub frame_latency_timeout_ms: u64,
    pub per_buffer_fence: bool,
    pub compositor_sync: bool,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: [0.8, 0.8, 0.6, 1.0],
            max_in_flight_frames: 2,
            frame_latency_timeout_ms: 1000,
            per_buffer_fence: true,
            compositor_sync: true,
        }
    }
}

impl RenderCfg {
    pub fn renderer_options(&self) -> RendererOptions {
        let max_in_flight_frames = if self.max_in_flight_frames == 0 {
            warn!("max_in_flight_frames = 0 is invalid; using 1");
            1
        } else {
            self.max_in_flight_frames
        };
        RendererOptions {
            max_in_flight_frames,
            present: PresentOptions {
                frame_latency_timeout: Duration::from_millis(self.frame_latency_timeout_ms),
                per_buffer_fence: self.per_buffer_fence,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColorKindCfg {
    #[default]
    Sdr,
    Wcg,
    Hdr,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct ColorCfg {
    pub kind: ColorKindCfg,
    pub max_luminance: f32,
    pub sdr_white_level: f32,
}

impl Default for ColorCfg {
    fn default() -> Self {
        ColorCfg {
            kind: ColorKindCfg::Sdr,
            max_luminance: 1.0,
            sdr_white_level: 1.0,
        }
    }
}

impl ColorCfg {
    pub fn color_info(&self) -> ColorInfo {
        let kind = match self.kind {
            ColorKindCfg::Sdr => ColorKind::StandardDynamicRange,
            ColorKindCfg::Wcg => ColorKind::WideColorGamut,
            ColorKindCfg::Hdr => ColorKind::HighDynamicRange,
        };
        ColorInfo {
            kind,
            max_luminance: self.max_luminance,
            sdr_white_level: self.sdr_white_level,
        }
    }
}

/// Missing files give the defaults; malformed ones too, with a warning.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(_) => {
            info!("{} not found; using defaults", path.display());
            AppCfg::default()
        }
    }
}

pub fn parse_cfg(s: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg, AppCfg::default());
        let opts = cfg.render.renderer_options();
        assert_eq!(opts.max_in_flight_frames, 2);
        assert_eq!(opts.present.frame_latency_timeout, Duration::from_millis(1000));
        assert!(opts.present.per_buffer_fence);
        assert_eq!(cfg.color.color_info(), ColorInfo::sdr());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_cfg(
            r#"
            [render]
            max_in_flight_frames = 3
            compositor_sync = false

            [color]
            kind = "hdr"
            max_luminance = 4.0
            sdr_white_level = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.max_in_flight_frames, 3);
        assert!(!cfg.render.compositor_sync);
        assert!(cfg.render.per_buffer_fence);
        assert_eq!(cfg.render.clear_color, [0.8, 0.8, 0.6, 1.0]);
        assert_eq!(cfg.color.color_info(), ColorInfo::hdr(4.0, 1.5));
    }

    #[test]
    fn unknown_colour_kind_is_an_error() {
        assert!(parse_cfg("[color]\nkind = \"dolby\"\n").is_err());
    }

    #[test]
    fn zero_in_flight_frames_is_clamped() {
        let cfg = parse_cfg("[render]\nmax_in_flight_frames = 0\n").unwrap();
        assert_eq!(cfg.render.renderer_options().max_in_flight_frames, 1);
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = load_cfg(Path::new("definitely/not/here/lumen.toml"));
        assert_eq!(cfg, AppCfg::default());
    }
}
