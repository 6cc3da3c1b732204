//! Adaptive widening of the foreground mask.
//!
//! The upstream clusterer tends to under-segment pale nodules. Before
//! partitioning, each foreground component gets a bounded dilation: in
//! a window ten times its bounding box, background pixels join the
//! foreground when they are bright and touch the foreground, or when
//! their red or green intensity clears a threshold. The green threshold
//! is loosened for green components in dark images.

use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::classify::{GREEN_OFFSET, RED_OFFSET, ensure_same_size, is_above_red_band};
use crate::region::connected_components;
use crate::types::{NoduleError, Pixel};

/// Bounding-box scale factor for the widening window.
const WINDOW_SCALE: u32 = 10;
/// Slope of the line separating greenish from reddish pixels when
/// averaging lightness.
const LIGHTNESS_SPLIT_SLOPE: f64 = 0.69;
/// Minimum grey value for a foreground-adjacent pixel to join.
const ADJACENT_GREY_MIN: u32 = 50;
/// Red intensity above which a pixel joins.
const RED_ADMIT: u8 = 120;
/// Green admission threshold when not loosened.
const DEFAULT_GREEN_ADMIT: u8 = 80;
/// Greenish pixels a component needs before its threshold is loosened.
const GREEN_COMPONENT_MIN: usize = 50;
/// Additions above this count are reported as significant.
const SIGNIFICANT_ADDITION: usize = 1000;

/// Bucket of the mean CIE L* lightness of greenish foreground pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LightSection {
    /// Below 85.
    One,
    /// 85 to below 90.
    Two,
    /// 90 to below 95.
    Three,
    /// 95 and above.
    Four,
}

impl LightSection {
    /// Bucket a mean lightness value.
    #[must_use]
    pub fn from_lightness(lightness: f64) -> Self {
        if lightness < 85.0 {
            Self::One
        } else if lightness < 90.0 {
            Self::Two
        } else if lightness < 95.0 {
            Self::Three
        } else {
            Self::Four
        }
    }

    /// Green admission threshold for a loosened component.
    #[must_use]
    pub const fn green_threshold(self) -> u8 {
        match self {
            Self::One => 70,
            Self::Two => 80,
            Self::Three => 90,
            Self::Four => 100,
        }
    }
}

/// What happened to one component's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentGrowth {
    /// Window `(x, y, width, height)` after scaling and clamping.
    pub window: (u32, u32, u32, u32),
    /// Green admission threshold used.
    pub green_threshold: u8,
    /// Pixels added through adjacency to foreground.
    pub added_adjacent: usize,
    /// Pixels added through the colour thresholds.
    pub added_by_colour: usize,
}

impl ComponentGrowth {
    /// Whether the colour thresholds admitted an unusually large number
    /// of pixels, which usually means the window caught root tissue.
    #[must_use]
    pub const fn is_significant(&self) -> bool {
        self.added_by_colour > SIGNIFICANT_ADDITION
    }
}

/// Result of [`improve_segmentation`].
#[derive(Debug, Clone)]
pub struct Widening {
    /// Widened foreground mask.
    pub mask: GrayImage,
    /// Mean L* of greenish foreground pixels (`NaN` if none).
    pub green_lightness: f64,
    /// Mean L* of the remaining foreground pixels (`NaN` if none).
    pub red_lightness: f64,
    /// Lightness bucket of the greenish pixels.
    pub section: LightSection,
    /// Per-component growth, in component order.
    pub components: Vec<ComponentGrowth>,
}

/// Widen the foreground (non-zero) of `mask` around each component.
///
/// Windows are processed in component order and the mask is updated in
/// place, so pixels admitted earlier count as foreground for later
/// adjacency checks.
///
/// # Errors
///
/// Returns [`NoduleError::DimensionMismatch`] if the image and mask
/// differ in size.
pub fn improve_segmentation(image: &RgbImage, mask: &GrayImage) -> Result<Widening, NoduleError> {
    ensure_same_size(image, mask)?;

    let components = connected_components(mask);
    let (green_lightness, red_lightness) = mean_lightness(image, &components);
    let section = LightSection::from_lightness(green_lightness);
    log::debug!(
        "mean lightness: green {green_lightness:.2} ({section:?}), red {red_lightness:.2}"
    );

    let mut widened = mask.clone();
    let mut growth = Vec::with_capacity(components.len());
    for component in &components {
        let loosen = section < LightSection::Two && green_pixel_count(image, component) > GREEN_COMPONENT_MIN;
        let green_threshold = if loosen {
            section.green_threshold()
        } else {
            DEFAULT_GREEN_ADMIT
        };
        let Some(window) = scaled_window(component, image.width(), image.height()) else {
            continue;
        };
        let grown = grow_window(image, &mut widened, window, green_threshold);
        if grown.is_significant() {
            log::warn!(
                "component window {:?} admitted {} pixels by colour",
                grown.window,
                grown.added_by_colour
            );
        }
        growth.push(grown);
    }

    Ok(Widening {
        mask: widened,
        green_lightness,
        red_lightness,
        section,
        components: growth,
    })
}

fn grow_window(
    image: &RgbImage,
    mask: &mut GrayImage,
    window: (u32, u32, u32, u32),
    green_threshold: u8,
) -> ComponentGrowth {
    let (x0, y0, w, h) = window;
    let mut added_adjacent = 0;
    let mut added_by_colour = 0;
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            if mask.get_pixel(x, y).0[0] != 0 {
                continue;
            }
            let Rgb([r, g, b]) = *image.get_pixel(x, y);
            let grey = (u32::from(r) + u32::from(g) + u32::from(b)) / 3;
            if grey > ADJACENT_GREY_MIN && touches_foreground(mask, x, y) {
                mask.put_pixel(x, y, Luma([255]));
                added_adjacent += 1;
            } else if r > RED_ADMIT || g > green_threshold {
                mask.put_pixel(x, y, Luma([255]));
                added_by_colour += 1;
            }
        }
    }
    ComponentGrowth {
        window,
        green_threshold,
        added_adjacent,
        added_by_colour,
    }
}

fn touches_foreground(mask: &GrayImage, x: u32, y: u32) -> bool {
    let (w, h) = mask.dimensions();
    let neighbours = [
        x.checked_add(1).filter(|&nx| nx < w).map(|nx| (nx, y)),
        x.checked_sub(1).map(|nx| (nx, y)),
        y.checked_add(1).filter(|&ny| ny < h).map(|ny| (x, ny)),
        y.checked_sub(1).map(|ny| (x, ny)),
    ];
    neighbours
        .into_iter()
        .flatten()
        .any(|(nx, ny)| mask.get_pixel(nx, ny).0[0] != 0)
}

/// Bounding box scaled about its centre, clamped to the image.
fn scaled_window(component: &[Pixel], width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let min_x = component.iter().map(|p| p.x).min()?;
    let max_x = component.iter().map(|p| p.x).max()?;
    let min_y = component.iter().map(|p| p.y).min()?;
    let max_y = component.iter().map(|p| p.y).max()?;
    let (bw, bh) = (max_x - min_x + 1, max_y - min_y + 1);

    let (sw, sh) = (bw.saturating_mul(WINDOW_SCALE), bh.saturating_mul(WINDOW_SCALE));
    let x = min_x.saturating_sub((sw - bw) / 2);
    let y = min_y.saturating_sub((sh - bh) / 2);
    let w = sw.min(width.saturating_sub(x));
    let h = sh.min(height.saturating_sub(y));
    (w > 0 && h > 0).then_some((x, y, w, h))
}

fn green_pixel_count(image: &RgbImage, component: &[Pixel]) -> usize {
    component
        .iter()
        .filter(|p| {
            let [r, g, _] = image.get_pixel(p.x, p.y).0;
            is_above_red_band(r, g)
        })
        .count()
}

#[allow(clippy::cast_precision_loss)]
fn mean_lightness(image: &RgbImage, components: &[Vec<Pixel>]) -> (f64, f64) {
    let split_offset = f64::midpoint(GREEN_OFFSET, RED_OFFSET).floor();
    let (mut green_sum, mut green_n) = (0.0, 0_usize);
    let (mut red_sum, mut red_n) = (0.0, 0_usize);
    for p in components.iter().flatten() {
        let rgb = *image.get_pixel(p.x, p.y);
        let [r, g, _] = rgb.0;
        let l = lightness(rgb);
        if f64::from(g) > f64::from(r).mul_add(LIGHTNESS_SPLIT_SLOPE, split_offset) {
            green_sum += l;
            green_n += 1;
        } else {
            red_sum += l;
            red_n += 1;
        }
    }
    (green_sum / green_n as f64, red_sum / red_n as f64)
}

/// CIE L* (0 to 100) of an sRGB colour under D65.
#[must_use]
pub fn lightness(Rgb([r, g, b]): Rgb<u8>) -> f64 {
    fn linear(c: u8) -> f64 {
        let c = f64::from(c) / 255.0;
        if c <= 0.040_45 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    }
    let y = 0.0722f64.mul_add(linear(b), 0.2126f64.mul_add(linear(r), 0.7152 * linear(g)));
    let f = if y > 216.0 / 24389.0 {
        y.cbrt()
    } else {
        (24389.0f64 / 27.0).mul_add(y, 16.0) / 116.0
    };
    116.0f64.mul_add(f, -16.0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lightness_endpoints() {
        assert!(lightness(Rgb([0, 0, 0])).abs() < 1e-6);
        assert!((lightness(Rgb([255, 255, 255])) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn sections_bucket_at_boundaries() {
        assert_eq!(LightSection::from_lightness(84.9), LightSection::One);
        assert_eq!(LightSection::from_lightness(85.0), LightSection::Two);
        assert_eq!(LightSection::from_lightness(94.9), LightSection::Three);
        assert_eq!(LightSection::from_lightness(95.0), LightSection::Four);
        assert_eq!(LightSection::One.green_threshold(), 70);
        assert_eq!(LightSection::Four.green_threshold(), 100);
    }

    #[test]
    fn window_is_scaled_about_centre_and_clamped() {
        let component = vec![Pixel::new(50, 50), Pixel::new(51, 51)];
        // 2x2 box → 20x20 window starting 9 pixels before it.
        assert_eq!(scaled_window(&component, 200, 200), Some((41, 41, 20, 20)));
        // Near the origin the window is clamped at zero and to the image.
        let corner = vec![Pixel::new(1, 1)];
        assert_eq!(scaled_window(&corner, 6, 8), Some((0, 0, 6, 8)));
    }

    #[test]
    fn dark_pixels_stay_background() {
        let image = RgbImage::from_pixel(20, 20, Rgb([10, 10, 10]));
        let mut mask = GrayImage::new(20, 20);
        mask.put_pixel(10, 10, Luma([255]));
        let widened = improve_segmentation(&image, &mask).unwrap();
        let foreground = widened.mask.pixels().filter(|p| p.0[0] != 0).count();
        assert_eq!(foreground, 1);
    }

    #[test]
    fn bright_neighbours_join_in_scan_order() {
        let mut image = RgbImage::from_pixel(20, 20, Rgb([10, 10, 10]));
        // Bright but not red or green enough: joins only via adjacency.
        for x in 8..=12 {
            image.put_pixel(x, 10, Rgb([100, 60, 100]));
        }
        let mut mask = GrayImage::new(20, 20);
        mask.put_pixel(10, 10, Luma([255]));

        let widened = improve_segmentation(&image, &mask).unwrap();
        // Scanning left to right, 11 and 12 chain off the seed; 9 touches
        // the seed, but 8 is visited before 9 joins.
        for x in 9..=12 {
            assert_ne!(widened.mask.get_pixel(x, 10).0[0], 0, "x = {x}");
        }
        assert_eq!(widened.mask.get_pixel(8, 10).0[0], 0);
        assert_eq!(widened.components[0].added_adjacent, 4);
    }

    #[test]
    fn red_pixels_in_window_join_without_adjacency() {
        let mut image = RgbImage::from_pixel(30, 30, Rgb([10, 10, 10]));
        image.put_pixel(2, 2, Rgb([200, 0, 0]));
        let mut mask = GrayImage::new(30, 30);
        mask.put_pixel(5, 5, Luma([255]));
        let widened = improve_segmentation(&image, &mask).unwrap();
        assert_ne!(widened.mask.get_pixel(2, 2).0[0], 0);
        assert_eq!(widened.components[0].added_by_colour, 1);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let image = RgbImage::new(3, 3);
        let mask = GrayImage::new(2, 3);
        assert!(improve_segmentation(&image, &mask).is_err());
    }
}
