//! Conversion between decoded images and row-major pixel arrays
//!
//! Arrays are `(height, width, channels)` with one `u8` per channel.
//! Images with an alpha channel become 4-channel arrays, everything else
//! becomes RGB.

use image::{DynamicImage, ImageBuffer, Pixel};
use ndarray::Array3;

use super::RenderError;

/// Convert a decoded image into an `(H, W, C)` array
pub fn image_to_array(image: &DynamicImage) -> Array3<u8> {
    if image.color().has_alpha() {
        array_from_buffer(&image.to_rgba8())
    } else {
        array_from_buffer(&image.to_rgb8())
    }
}

/// Convert an `(H, W, C)` array back into an image (C must be 3 or 4)
pub fn array_to_image(array: &Array3<u8>) -> Result<DynamicImage, RenderError> {
    match array.dim().2 {
        3 => Ok(DynamicImage::ImageRgb8(buffer_from_array(array)?)),
        4 => Ok(DynamicImage::ImageRgba8(buffer_from_array(array)?)),
        channels => Err(RenderError::UnsupportedChannels(channels)),
    }
}

/// Copy an array into an image buffer whose pixel type matches the channel count
pub(crate) fn buffer_from_array<P>(array: &Array3<u8>) -> Result<ImageBuffer<P, Vec<u8>>, RenderError>
where
    P: Pixel<Subpixel = u8>,
{
    let (height, width, channels) = array.dim();
    if channels != P::CHANNEL_COUNT as usize {
        return Err(RenderError::UnsupportedChannels(channels));
    }

    // Logical iteration order is row-major regardless of memory layout
    let raw: Vec<u8> = array.iter().copied().collect();

    ImageBuffer::from_raw(width as u32, height as u32, raw).ok_or(RenderError::Shape {
        height,
        width,
        channels,
    })
}

/// Copy an image buffer into a fresh `(H, W, C)` array
pub(crate) fn array_from_buffer<P>(buffer: &ImageBuffer<P, Vec<u8>>) -> Array3<u8>
where
    P: Pixel<Subpixel = u8>,
{
    let (width, height) = buffer.dimensions();
    let channels = P::CHANNEL_COUNT as usize;
    let raw = buffer.as_raw();
    let row_len = width as usize * channels;

    Array3::from_shape_fn((height as usize, width as usize, channels), |(y, x, c)| {
        raw[y * row_len + x * channels + c]
    })
}
