// SPDX-License-Identifier: CEPL-1.0
//! Display colour capability and what it implies for the swap chain.
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorKind {
    #[default]
    StandardDynamicRange,
    WideColorGamut,
    HighDynamicRange,
}

impl ColorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ColorKind::StandardDynamicRange => "sdr",
            ColorKind::WideColorGamut => "wcg",
            ColorKind::HighDynamicRange => "hdr",
        }
    }
}

impl fmt::Display for ColorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sdr" | "standard" => Ok(ColorKind::StandardDynamicRange),
            "wcg" | "wide" => Ok(ColorKind::WideColorGamut),
            "hdr" => Ok(ColorKind::HighDynamicRange),
            other => Err(format!("unknown colour kind {other:?} (expected sdr, wcg or hdr)")),
        }
    }
}

/// Buffer and view formats the core asks a backend for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgba16Float,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    /// Gamma 2.2, BT.709 primaries.
    SrgbNonLinear,
    /// Linear scRGB (gamma 1.0, BT.709 primaries, values above 1.0 allowed).
    ScRgbLinear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceFormat {
    pub buffer: PixelFormat,
    pub view: PixelFormat,
    pub color_space: ColorSpace,
}

/// Colour capability of the display the window currently sits on.
///
/// `max_luminance` and `sdr_white_level` are scales relative to 80 nits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorInfo {
    pub kind: ColorKind,
    pub max_luminance: f32,
    pub sdr_white_level: f32,
}

impl Default for ColorInfo {
    fn default() -> Self {
        Self::sdr()
    }
}

impl ColorInfo {
    pub const fn sdr() -> Self {
        Self {
            kind: ColorKind::StandardDynamicRange,
            max_luminance: 1.0,
            sdr_white_level: 1.0,
        }
    }

    pub const fn wide_color_gamut() -> Self {
        Self {
            kind: ColorKind::WideColorGamut,
            max_luminance: 1.0,
            sdr_white_level: 1.0,
        }
    }

    pub const fn hdr(max_luminance: f32, sdr_white_level: f32) -> Self {
        Self {
            kind: ColorKind::HighDynamicRange,
            max_luminance,
            sdr_white_level,
        }
    }

    /// Whether the swap chain needs the 16-bit float scRGB path.
    ///
    /// Wide colour gamut shares the float path with HDR even though its
    /// brightness boost stays at 1.0.
    pub fn uses_scrgb(&self) -> bool {
        self.kind != ColorKind::StandardDynamicRange
    }

    pub fn surface_format(&self) -> SurfaceFormat {
        if self.uses_scrgb() {
            SurfaceFormat {
                buffer: PixelFormat::Rgba16Float,
                view: PixelFormat::Rgba16Float,
                color_space: ColorSpace::ScRgbLinear,
            }
        } else {
            SurfaceFormat {
                buffer: PixelFormat::Rgba8Unorm,
                view: PixelFormat::Rgba8UnormSrgb,
                color_space: ColorSpace::SrgbNonLinear,
            }
        }
    }

    /// Per-draw brightness multiplier. `None` on the SDR path, where the
    /// shader has no boost term.
    pub fn brightness_boost(&self) -> Option<f32> {
        match self.kind {
            ColorKind::StandardDynamicRange => None,
            ColorKind::WideColorGamut => Some(1.0),
            ColorKind::HighDynamicRange => {
                Some((self.sdr_white_level + 1.0).min(self.max_luminance))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdr_uses_eight_bit_srgb() {
        let f = ColorInfo::sdr().surface_format();
        assert_eq!(f.buffer, PixelFormat::Rgba8Unorm);
        assert_eq!(f.view, PixelFormat::Rgba8UnormSrgb);
        assert_eq!(f.color_space, ColorSpace::SrgbNonLinear);
        assert_eq!(ColorInfo::sdr().brightness_boost(), None);
    }

    #[test]
    fn hdr_boost_is_clamped_to_max_luminance() {
        assert_eq!(ColorInfo::hdr(4.0, 1.5).brightness_boost(), Some(2.5));
        assert_eq!(ColorInfo::hdr(2.0, 1.5).brightness_boost(), Some(2.0));
    }

    #[test]
    fn wide_gamut_takes_float_format_but_unit_boost() {
        let wcg = ColorInfo {
            kind: ColorKind::WideColorGamut,
            max_luminance: 6.0,
            sdr_white_level: 3.0,
        };
        assert!(wcg.uses_scrgb());
        assert_eq!(wcg.surface_format().buffer, PixelFormat::Rgba16Float);
        assert_eq!(wcg.brightness_boost(), Some(1.0));
    }

    #[test]
    fn kind_parses_from_config_strings() {
        assert_eq!("HDR".parse::<ColorKind>(), Ok(ColorKind::HighDynamicRange));
        assert_eq!(" wcg ".parse::<ColorKind>(), Ok(ColorKind::WideColorGamut));
        assert_eq!("sdr".parse::<ColorKind>(), Ok(ColorKind::StandardDynamicRange));
        assert!("hdr10".parse::<ColorKind>().is_err());
    }
}
