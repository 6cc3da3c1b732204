//! Colour classification of nodule pixels.
//!
//! A foreground pixel is assigned to the green, red, or mixed class from
//! its red and green intensities alone. The bands are fixed: the
//! comparisons below are strict and must stay that way for counts to
//! reproduce.

use image::{GrayImage, Luma, RgbImage};

use crate::types::{Channel, Dimensions, NoduleError};

/// Offset of the green band above the `green = red` diagonal.
pub const GREEN_OFFSET: f64 = 25.0;
/// Slope of the green band's lower edge.
pub const GREEN_SLOPE: f64 = 1.0;
/// Green intensity above which a pixel is green regardless of red.
pub const GREEN_CEILING: f64 = 240.0;
/// Quadratic coefficient of the red band's upper edge.
pub const RED_QUADRATIC: f64 = 0.002;
/// Intercept of the red band's upper edge.
pub const RED_OFFSET: f64 = 45.0;
/// Red intensity above which a pixel is red unless already green.
pub const RED_CEILING: f64 = 180.0;

/// Classify a pixel into one of the three colour classes.
///
/// Checked in order: green if `green > red + 25` or `green > 240`; red if
/// `green < 0.002·red² + 45` or `red > 180`; mixed otherwise.
#[must_use]
pub fn classify(red: u8, green: u8) -> Channel {
    let (r, g) = (f64::from(red), f64::from(green));
    if g > r.mul_add(GREEN_SLOPE, GREEN_OFFSET) || g > GREEN_CEILING {
        Channel::Green
    } else if g < (r * r).mul_add(RED_QUADRATIC, RED_OFFSET) || r > RED_CEILING {
        Channel::Red
    } else {
        Channel::Mixed
    }
}

/// Split a mixed pixel into red or green along the red band's edge:
/// green iff `green > 0.002·red² + 45`.
#[must_use]
pub fn classify_red_green(red: u8, green: u8) -> Channel {
    if is_above_red_band(red, green) {
        Channel::Green
    } else {
        Channel::Red
    }
}

/// Whether a pixel sits above the red band's upper edge.
#[must_use]
pub fn is_above_red_band(red: u8, green: u8) -> bool {
    let (r, g) = (f64::from(red), f64::from(green));
    g > (r * r).mul_add(RED_QUADRATIC, RED_OFFSET)
}

/// Per-class foreground masks (`255` = foreground).
#[derive(Debug, Clone)]
pub struct ChannelMasks {
    /// Red foreground pixels.
    pub red: GrayImage,
    /// Green foreground pixels.
    pub green: GrayImage,
    /// Mixed foreground pixels.
    pub mixed: GrayImage,
}

impl ChannelMasks {
    /// Mask for one channel.
    #[must_use]
    pub const fn get(&self, channel: Channel) -> &GrayImage {
        match channel {
            Channel::Red => &self.red,
            Channel::Green => &self.green,
            Channel::Mixed => &self.mixed,
        }
    }

    /// Number of foreground pixels in one channel's mask.
    #[must_use]
    pub fn count(&self, channel: Channel) -> usize {
        self.get(channel).pixels().filter(|p| p.0[0] != 0).count()
    }
}

/// Partition the foreground of `mask` (non-zero pixels) into the three
/// colour classes using the colours of `image`.
///
/// # Errors
///
/// Returns [`NoduleError::DimensionMismatch`] if the image and mask
/// differ in size.
pub fn partition_foreground(
    image: &RgbImage,
    mask: &GrayImage,
) -> Result<ChannelMasks, NoduleError> {
    ensure_same_size(image, mask)?;

    let (width, height) = image.dimensions();
    let mut masks = ChannelMasks {
        red: GrayImage::new(width, height),
        green: GrayImage::new(width, height),
        mixed: GrayImage::new(width, height),
    };

    for (x, y, m) in mask.enumerate_pixels() {
        if m.0[0] == 0 {
            continue;
        }
        let [r, g, _] = image.get_pixel(x, y).0;
        let target = match classify(r, g) {
            Channel::Red => &mut masks.red,
            Channel::Green => &mut masks.green,
            Channel::Mixed => &mut masks.mixed,
        };
        target.put_pixel(x, y, Luma([255]));
    }

    log::debug!(
        "partitioned foreground: {} red, {} green, {} mixed pixels",
        masks.count(Channel::Red),
        masks.count(Channel::Green),
        masks.count(Channel::Mixed),
    );
    Ok(masks)
}

pub(crate) fn ensure_same_size(image: &RgbImage, mask: &GrayImage) -> Result<(), NoduleError> {
    if image.dimensions() == mask.dimensions() {
        return Ok(());
    }
    Err(NoduleError::DimensionMismatch {
        image: Dimensions {
            width: image.width(),
            height: image.height(),
        },
        mask: Dimensions {
            width: mask.width(),
            height: mask.height(),
        },
    })
}
