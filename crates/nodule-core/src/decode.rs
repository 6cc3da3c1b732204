//! Image decoding.
//!
//! Accepts raw image bytes (PNG, JPEG, BMP, TIFF) for the colour image
//! and for the foreground mask produced by the upstream segmenter. This
//! is the only place the engine touches encoded data.

use image::{GrayImage, Luma, RgbImage};

use crate::types::NoduleError;

/// Mask values above this are foreground.
pub const MASK_THRESHOLD: u8 = 127;

/// Decode raw image bytes into 8-bit RGB.
///
/// # Errors
///
/// Returns [`NoduleError::EmptyInput`] if `bytes` is empty.
/// Returns [`NoduleError::ImageDecode`] if the image format is
/// unrecognized or the data is corrupt.
#[must_use = "returns the decoded colour image"]
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, NoduleError> {
    if bytes.is_empty() {
        return Err(NoduleError::EmptyInput);
    }
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Decode a foreground mask into a binary image (`255` foreground, `0`
/// background).
///
/// The mask is converted to luminance and thresholded at
/// [`MASK_THRESHOLD`]. With `invert`, dark pixels are foreground
/// instead, for segmenters that paint objects black.
///
/// # Errors
///
/// Same as [`decode_rgb`].
#[must_use = "returns the decoded mask"]
pub fn decode_mask(bytes: &[u8], invert: bool) -> Result<GrayImage, NoduleError> {
    if bytes.is_empty() {
        return Err(NoduleError::EmptyInput);
    }
    let mut mask = image::load_from_memory(bytes)?.to_luma8();
    for Luma([v]) in mask.pixels_mut() {
        let foreground = (*v > MASK_THRESHOLD) != invert;
        *v = if foreground { 255 } else { 0 };
    }
    Ok(mask)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn png(img: &RgbImage) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgb8,
        )
        .ok();
        buf
    }

    #[test]
    fn empty_input_returns_error() {
        assert!(matches!(decode_rgb(&[]), Err(NoduleError::EmptyInput)));
        assert!(matches!(decode_mask(&[], false), Err(NoduleError::EmptyInput)));
    }

    #[test]
    fn corrupt_bytes_returns_image_decode_error() {
        let result = decode_rgb(&[0xFF, 0xFE, 0x00, 0x01]);
        assert!(matches!(result, Err(NoduleError::ImageDecode(_))));
    }

    #[test]
    fn rgb_survives_decoding() {
        let img = RgbImage::from_fn(3, 2, |x, y| {
            image::Rgb([
                u8::try_from(x * 80).unwrap(),
                u8::try_from(y * 90).unwrap(),
                7,
            ])
        });
        let decoded = decode_rgb(&png(&img)).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn mask_is_binarized_and_optionally_inverted() {
        let img = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                image::Rgb([250, 250, 250])
            } else {
                image::Rgb([10, 10, 10])
            }
        });
        let bytes = png(&img);
        let mask = decode_mask(&bytes, false).unwrap();
        assert_eq!((mask.get_pixel(0, 0).0[0], mask.get_pixel(1, 0).0[0]), (255, 0));
        let inverted = decode_mask(&bytes, true).unwrap();
        assert_eq!(
            (inverted.get_pixel(0, 0).0[0], inverted.get_pixel(1, 0).0[0]),
            (0, 255)
        );
    }
}
