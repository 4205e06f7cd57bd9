//! Out-of-mask difference metric behind the pixel-lock check.
//!
//! Mask convention: a mask pixel whose luminance is above the threshold is
//! inside the ROI and may change; every other pixel is locked to the Master
//! Anchor.

use crate::config::PixelLockConfig;
use crate::core::Anchor;
use crate::errors::ConsistencyError;
use image::{GrayImage, RgbImage};

/// Decodes an encoded image into RGB.
pub fn decode_rgb(bytes: &[u8], what: &str) -> Result<RgbImage, ConsistencyError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| ConsistencyError::Decode {
            what: what.to_string(),
            message: e.to_string(),
        })
}

/// Decodes an encoded mask into luminance.
pub fn decode_mask(bytes: &[u8]) -> Result<GrayImage, ConsistencyError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_luma8())
        .map_err(|e| ConsistencyError::Decode {
            what: "ROI mask".to_string(),
            message: e.to_string(),
        })
}

/// Fraction of mask pixels inside the ROI.
#[must_use]
pub fn mask_coverage(mask: &GrayImage, threshold: u8) -> f64 {
    let total = u64::from(mask.width()) * u64::from(mask.height());
    if total == 0 {
        return 0.0;
    }
    let inside = mask.pixels().filter(|p| p.0[0] > threshold).count() as u64;
    inside as f64 / total as f64
}

fn ensure_dimensions(what: &str, expected: (u32, u32), actual: (u32, u32)) -> Result<(), ConsistencyError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ConsistencyError::DimensionMismatch {
            what: what.to_string(),
            expected,
            actual,
        })
    }
}

/// Checks that a mask is aligned with the master and covers a plausible
/// share of the frame. Returns the coverage.
pub fn validate_mask(
    mask: &GrayImage,
    master_dimensions: (u32, u32),
    config: &PixelLockConfig,
) -> Result<f64, ConsistencyError> {
    ensure_dimensions("ROI mask", master_dimensions, mask.dimensions())?;
    let coverage = mask_coverage(mask, config.mask_threshold);
    if coverage < config.min_mask_coverage || coverage > config.max_mask_coverage {
        return Err(ConsistencyError::MaskCoverage {
            coverage,
            min: config.min_mask_coverage,
            max: config.max_mask_coverage,
        });
    }
    Ok(coverage)
}

/// Mean absolute RGB difference over the locked pixels, normalised to `[0, 1]`.
///
/// Returns `0.0` when the mask leaves no pixel locked.
pub fn out_of_mask_difference(
    master: &RgbImage,
    variant: &RgbImage,
    mask: &GrayImage,
    threshold: u8,
) -> Result<f64, ConsistencyError> {
    ensure_dimensions("variant", master.dimensions(), variant.dimensions())?;
    ensure_dimensions("ROI mask", master.dimensions(), mask.dimensions())?;

    let mut sum: u64 = 0;
    let mut locked: u64 = 0;
    for ((m, v), k) in master.pixels().zip(variant.pixels()).zip(mask.pixels()) {
        if k.0[0] > threshold {
            continue;
        }
        locked += 1;
        sum += m
            .0
            .iter()
            .zip(v.0.iter())
            .map(|(a, b)| u64::from(a.abs_diff(*b)))
            .sum::<u64>();
    }
    if locked == 0 {
        return Ok(0.0);
    }
    Ok(sum as f64 / (locked as f64 * 3.0 * 255.0))
}

/// Decodes both images and enforces the pixel-lock tolerance.
///
/// Returns the measured difference when it is within tolerance.
pub fn check_pixel_lock(
    anchor: Anchor,
    master: &RgbImage,
    variant_bytes: &[u8],
    mask: &GrayImage,
    config: &PixelLockConfig,
) -> Result<f64, ConsistencyError> {
    let variant = decode_rgb(variant_bytes, &format!("{anchor} variant"))?;
    let difference = out_of_mask_difference(master, &variant, mask, config.mask_threshold)?;
    if difference > config.tolerance {
        return Err(ConsistencyError::PixelLock {
            anchor,
            difference,
            tolerance: config.tolerance,
        });
    }
    Ok(difference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encode_png, mask_png, paint_roi, solid_png};
    use image::{ImageBuffer, Luma, Rgb};

    fn rect_mask(w: u32, h: u32, x0: u32, y0: u32, x1: u32, y1: u32) -> GrayImage {
        ImageBuffer::from_fn(w, h, |x, y| {
            if x >= x0 && x < x1 && y >= y0 && y < y1 {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn test_identical_images_have_zero_difference() {
        let master = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let mask = rect_mask(8, 8, 2, 2, 4, 4);

        let diff = out_of_mask_difference(&master, &master.clone(), &mask, 128).unwrap();
        assert!(diff.abs() < f64::EPSILON);
    }

    #[test]
    fn test_changes_inside_mask_are_ignored() {
        let master = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let mask = rect_mask(8, 8, 2, 2, 4, 4);
        let mut variant = master.clone();
        for y in 2..4 {
            for x in 2..4 {
                variant.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }

        let diff = out_of_mask_difference(&master, &variant, &mask, 128).unwrap();
        assert!(diff.abs() < f64::EPSILON);
    }

    #[test]
    fn test_changes_outside_mask_are_measured() {
        let master = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let variant = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        let mask = rect_mask(4, 4, 0, 0, 2, 2);

        let diff = out_of_mask_difference(&master, &variant, &mask, 128).unwrap();
        assert!((diff - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_dimension_mismatch() {
        let master = RgbImage::new(4, 4);
        let variant = RgbImage::new(4, 5);
        let mask = rect_mask(4, 4, 0, 0, 1, 1);

        assert!(matches!(
            out_of_mask_difference(&master, &variant, &mask, 128),
            Err(ConsistencyError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_mask_coverage_bounds() {
        let config = PixelLockConfig::default();
        let mask = rect_mask(10, 10, 0, 0, 5, 2);
        assert!((mask_coverage(&mask, 128) - 0.1).abs() < 1e-9);
        assert!(validate_mask(&mask, (10, 10), &config).is_ok());

        let empty = rect_mask(10, 10, 0, 0, 0, 0);
        assert!(matches!(
            validate_mask(&empty, (10, 10), &config),
            Err(ConsistencyError::MaskCoverage { .. })
        ));

        let full = rect_mask(10, 10, 0, 0, 10, 10);
        assert!(validate_mask(&full, (10, 10), &config).is_err());
        assert!(validate_mask(&mask, (12, 10), &config).is_err());
    }

    #[test]
    fn test_check_pixel_lock_on_encoded_images() {
        let config = PixelLockConfig::default();
        let master_bytes = solid_png(16, 16, [40, 80, 120]);
        let mask_bytes = mask_png(16, 16, (4, 4, 8, 8));
        let master = decode_rgb(&master_bytes, "master").unwrap();
        let mask = decode_mask(&mask_bytes).unwrap();

        let clean = paint_roi(&master_bytes, &mask_bytes, [250, 10, 10]);
        let diff = check_pixel_lock(Anchor::Start, &master, &clean, &mask, &config).unwrap();
        assert!(diff <= config.tolerance);

        let drifted = encode_png(&RgbImage::from_pixel(16, 16, [200, 200, 200].into()));
        let err = check_pixel_lock(Anchor::EndControl, &master, &drifted, &mask, &config).unwrap_err();
        assert!(matches!(err, ConsistencyError::PixelLock { anchor: Anchor::EndControl, .. }));
    }

    #[test]
    fn test_undecodable_variant() {
        let master = RgbImage::new(2, 2);
        let mask = rect_mask(2, 2, 0, 0, 1, 1);
        let err = check_pixel_lock(Anchor::Start, &master, b"not an image", &mask, &PixelLockConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConsistencyError::Decode { .. }));
    }
}
