// SPDX-License-Identifier: CEPL-1.0
//! Pure helpers for surface format, extent and image-count selection.
use ash::vk;
use lumen_render::{ColorSpace, PixelFormat};

/// Picks the surface format for the requested buffer format and colour
/// space. scRGB falls back to the SDR choice when the surface has no
/// linear extended-sRGB float format.
pub(crate) fn pick_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    color_space: ColorSpace,
) -> Option<(vk::SurfaceFormatKHR, &'static str)> {
    if color_space == ColorSpace::ScRgbLinear {
        let scrgb = formats.iter().copied().find(|f| {
            f.format == vk::Format::R16G16B16A16_SFLOAT
                && f.color_space == vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT
        });
        if let Some(f) = scrgb {
            return Some((f, "scrgb_fp16"));
        }
    }

    let srgb = |format: vk::Format| {
        formats
            .iter()
            .copied()
            .find(|f| f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
    };
    if let Some(f) = srgb(vk::Format::B8G8R8A8_SRGB) {
        return Some((f, "sdr_bgra8_srgb"));
    }
    if let Some(f) = srgb(vk::Format::R8G8B8A8_SRGB) {
        return Some((f, "sdr_rgba8_srgb"));
    }
    formats.first().map(|&f| (f, "driver_default"))
}

/// The core's view of a Vulkan format, if it is one the core knows.
pub(crate) fn pixel_format(format: vk::Format) -> Option<PixelFormat> {
    match format {
        vk::Format::B8G8R8A8_UNORM | vk::Format::R8G8B8A8_UNORM => Some(PixelFormat::Rgba8Unorm),
        vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB => Some(PixelFormat::Rgba8UnormSrgb),
        vk::Format::R16G16B16A16_SFLOAT => Some(PixelFormat::Rgba16Float),
        _ => None,
    }
}

pub(crate) fn color_space(cs: vk::ColorSpaceKHR) -> ColorSpace {
    if cs == vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT {
        ColorSpace::ScRgbLinear
    } else {
        ColorSpace::SrgbNonLinear
    }
}

/// Views are created in the image's own format; the 8-bit unorm/sRGB pair
/// is treated as one class since the surface picks the sRGB variant.
pub(crate) fn view_format(image: vk::Format, requested: PixelFormat) -> Option<vk::Format> {
    let eight_bit =
        |f: PixelFormat| matches!(f, PixelFormat::Rgba8Unorm | PixelFormat::Rgba8UnormSrgb);
    let actual = pixel_format(image)?;
    let compatible = actual == requested || (eight_bit(actual) && eight_bit(requested));
    compatible.then_some(image)
}

pub(crate) fn extent_from_caps(
    caps: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Requested ring size clamped to what the surface allows (0 means no max).
pub(crate) fn image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(caps.min_image_count);
    if caps.max_image_count == 0 {
        count
    } else {
        count.min(caps.max_image_count)
    }
}

/// Modes a FIFO swapchain can be created to switch between per present:
/// FIFO and IMMEDIATE, when the surface has IMMEDIATE and reports it
/// compatible with FIFO.
pub(crate) fn switchable_modes(
    surface_modes: &[vk::PresentModeKHR],
    compatible_with_fifo: &[vk::PresentModeKHR],
) -> Option<[vk::PresentModeKHR; 2]> {
    let immediate = vk::PresentModeKHR::IMMEDIATE;
    (surface_modes.contains(&immediate) && compatible_with_fifo.contains(&immediate))
        .then_some([vk::PresentModeKHR::FIFO, immediate])
}

/// The mode a single present asks for. Interval 0 only tears on a
/// swapchain that can switch; everything else stays on FIFO.
pub(crate) fn present_mode_for(sync_interval: u32, switchable: bool) -> vk::PresentModeKHR {
    if sync_interval == 0 && switchable {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub(crate) fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn sdr_prefers_bgra_srgb() {
        let formats = [
            sf(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            sf(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            sf(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let (f, reason) = pick_surface_format(&formats, ColorSpace::SrgbNonLinear).unwrap();
        assert_eq!(f.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(reason, "sdr_bgra8_srgb");
    }

    #[test]
    fn scrgb_needs_linear_extended_float() {
        let formats = [
            sf(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            sf(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        let (f, _) = pick_surface_format(&formats, ColorSpace::ScRgbLinear).unwrap();
        assert_eq!(f.format, vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(color_space(f.color_space), ColorSpace::ScRgbLinear);

        let (f, _) = pick_surface_format(&formats[..1], ColorSpace::ScRgbLinear).unwrap();
        assert_eq!(f.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn empty_format_list_gives_nothing() {
        assert!(pick_surface_format(&[], ColorSpace::SrgbNonLinear).is_none());
    }

    #[test]
    fn views_stay_in_the_image_format_class() {
        assert_eq!(
            view_format(vk::Format::B8G8R8A8_SRGB, PixelFormat::Rgba8UnormSrgb),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert_eq!(
            view_format(vk::Format::B8G8R8A8_SRGB, PixelFormat::Rgba8Unorm),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert_eq!(view_format(vk::Format::B8G8R8A8_SRGB, PixelFormat::Rgba16Float), None);
        assert_eq!(view_format(vk::Format::D32_SFLOAT, PixelFormat::Rgba16Float), None);
    }

    #[test]
    fn image_count_respects_surface_limits() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 4,
            ..Default::default()
        };
        assert_eq!(image_count(&caps, 2), 3);
        assert_eq!(image_count(&caps, 3), 3);
        assert_eq!(image_count(&caps, 8), 4);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(image_count(&unbounded, 8), 8);
    }

    #[test]
    fn immediate_switching_needs_surface_and_compatibility() {
        let fifo = vk::PresentModeKHR::FIFO;
        let immediate = vk::PresentModeKHR::IMMEDIATE;
        let mailbox = vk::PresentModeKHR::MAILBOX;

        assert_eq!(
            switchable_modes(&[fifo, immediate], &[fifo, immediate]),
            Some([fifo, immediate])
        );
        assert_eq!(switchable_modes(&[fifo, immediate], &[fifo, mailbox]), None);
        assert_eq!(switchable_modes(&[fifo, mailbox], &[fifo, immediate]), None);
        assert_eq!(switchable_modes(&[fifo], &[]), None);
    }

    #[test]
    fn only_interval_zero_on_a_switchable_swapchain_tears() {
        assert_eq!(present_mode_for(0, true), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(present_mode_for(1, true), vk::PresentModeKHR::FIFO);
        assert_eq!(present_mode_for(0, false), vk::PresentModeKHR::FIFO);
        assert_eq!(present_mode_for(1, false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn free_size_surfaces_clamp_the_request() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let e = extent_from_caps(&caps, 2560, 900);
        assert_eq!((e.width, e.height), (1920, 900));

        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let e = extent_from_caps(&fixed, 1024, 768);
        assert_eq!((e.width, e.height), (800, 600));
    }
}
