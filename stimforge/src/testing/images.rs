//! PNG builders for tests.

use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use std::io::Cursor;

/// Encodes an RGB image as PNG.
pub fn encode_png(image: &RgbImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// A single-colour PNG.
pub fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    encode_png(&RgbImage::from_pixel(width, height, Rgb(rgb)))
}

/// A PNG with a deterministic gradient derived from `seed`.
pub fn gradient_png(width: u32, height: u32, seed: u64) -> Vec<u8> {
    let shift = (seed % 97) as u32;
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            ((x * 7 + shift) % 256) as u8,
            ((y * 11 + shift) % 256) as u8,
            ((x + y + shift) % 256) as u8,
        ])
    });
    encode_png(&image)
}

/// A mask PNG, white inside `(x0, y0, x1, y1)` (exclusive upper bounds).
pub fn mask_png(width: u32, height: u32, roi: (u32, u32, u32, u32)) -> Vec<u8> {
    let (x0, y0, x1, y1) = roi;
    let mask = GrayImage::from_fn(width, height, |x, y| {
        if x >= x0 && x < x1 && y >= y0 && y < y1 {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(mask)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Repaints the masked pixels of `base` with `rgb`, leaving the rest intact.
pub fn paint_roi(base: &[u8], mask: &[u8], rgb: [u8; 3]) -> Vec<u8> {
    let mut image = image::load_from_memory(base).unwrap().to_rgb8();
    let mask = image::load_from_memory(mask).unwrap().to_luma8();
    for (pixel, m) in image.pixels_mut().zip(mask.pixels()) {
        if m.0[0] > 128 {
            *pixel = Rgb(rgb);
        }
    }
    encode_png(&image)
}

/// Shifts every pixel of `base` by `delta`, ignoring any mask.
pub fn drift_png(base: &[u8], delta: u8) -> Vec<u8> {
    let mut image = image::load_from_memory(base).unwrap().to_rgb8();
    for pixel in image.pixels_mut() {
        for channel in &mut pixel.0 {
            *channel = channel.wrapping_add(delta);
        }
    }
    encode_png(&image)
}
