//! Page preprocessing ahead of OCR.
//!
//! Pipeline: adaptive threshold (local mean over an 11x11 window, offset 2),
//! 3x3 median denoise, then deskew when the estimated text angle exceeds
//! 0.5 degrees. Operates on 8-bit grayscale buffers; color inputs are
//! converted before reaching this module.

use image::GrayImage;

/// Angles at or below this are left alone.
pub const DESKEW_MIN_ANGLE_DEGREES: f64 = 0.5;

const THRESHOLD_WINDOW: u32 = 11;
const THRESHOLD_OFFSET: i32 = 2;

/// Full preprocessing chain.
pub fn prepare(image: &GrayImage) -> GrayImage {
    let thresholded = adaptive_threshold(image, THRESHOLD_WINDOW, THRESHOLD_OFFSET);
    let denoised = median_denoise(&thresholded);
    let angle = estimate_skew_degrees(&denoised);
    if angle.abs() > DESKEW_MIN_ANGLE_DEGREES {
        rotate(&denoised, -angle)
    } else {
        denoised
    }
}

fn integral_image(image: &GrayImage) -> Vec<u64> {
    let (w, h) = image.dimensions();
    let (w, h) = (w as usize, h as usize);
    let mut integral = vec![0u64; (w + 1) * (h + 1)];
    for y in 0..h {
        let mut row_sum = 0u64;
        for x in 0..w {
            row_sum += image.get_pixel(x as u32, y as u32).0[0] as u64;
            integral[(y + 1) * (w + 1) + (x + 1)] = integral[y * (w + 1) + (x + 1)] + row_sum;
        }
    }
    integral
}

/// Binarize against the local mean; window edges clamp to the image.
pub fn adaptive_threshold(image: &GrayImage, window: u32, offset: i32) -> GrayImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }
    let integral = integral_image(image);
    let half = (window / 2) as i64;
    let stride = w as usize + 1;

    let mut out = GrayImage::new(w, h);
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let x0 = (x - half).max(0) as usize;
            let y0 = (y - half).max(0) as usize;
            let x1 = ((x + half).min(w as i64 - 1) + 1) as usize;
            let y1 = ((y + half).min(h as i64 - 1) + 1) as usize;
            let area = ((x1 - x0) * (y1 - y0)) as i64;
            let sum = (integral[y1 * stride + x1] + integral[y0 * stride + x0]) as i64
                - (integral[y0 * stride + x1] + integral[y1 * stride + x0]) as i64;
            let mean = sum / area.max(1);
            let pixel = image.get_pixel(x as u32, y as u32).0[0] as i64;
            let value = if pixel > mean - offset as i64 { 255 } else { 0 };
            out.put_pixel(x as u32, y as u32, image::Luma([value as u8]));
        }
    }
    out
}

/// 3x3 median filter; edge pixels clamp to the border.
pub fn median_denoise(image: &GrayImage) -> GrayImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }
    let mut out = GrayImage::new(w, h);
    let mut neighborhood = [0u8; 9];
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let mut i = 0;
            for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    let nx = (x + dx).clamp(0, w as i64 - 1) as u32;
                    let ny = (y + dy).clamp(0, h as i64 - 1) as u32;
                    neighborhood[i] = image.get_pixel(nx, ny).0[0];
                    i += 1;
                }
            }
            neighborhood.sort_unstable();
            out.put_pixel(x as u32, y as u32, image::Luma([neighborhood[4]]));
        }
    }
    out
}

/// Estimate the dominant text angle from the second central moments of the
/// dark (ink) pixels, folded into [-45, 45] degrees. Returns 0.0 when there
/// is no ink to measure.
pub fn estimate_skew_degrees(image: &GrayImage) -> f64 {
    let (w, h) = image.dimensions();
    let mut count = 0f64;
    let mut sum_x = 0f64;
    let mut sum_y = 0f64;
    for y in 0..h {
        for x in 0..w {
            if image.get_pixel(x, y).0[0] < 128 {
                count += 1.0;
                sum_x += x as f64;
                sum_y += y as f64;
            }
        }
    }
    if count < 2.0 {
        return 0.0;
    }
    let cx = sum_x / count;
    let cy = sum_y / count;

    let (mut mu20, mut mu02, mut mu11) = (0f64, 0f64, 0f64);
    for y in 0..h {
        for x in 0..w {
            if image.get_pixel(x, y).0[0] < 128 {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                mu20 += dx * dx;
                mu02 += dy * dy;
                mu11 += dx * dy;
            }
        }
    }
    if mu11.abs() < f64::EPSILON && (mu20 - mu02).abs() < f64::EPSILON {
        return 0.0;
    }
    let mut angle = 0.5 * (2.0 * mu11).atan2(mu20 - mu02).to_degrees();
    if angle > 45.0 {
        angle -= 90.0;
    } else if angle < -45.0 {
        angle += 90.0;
    }
    angle
}

/// Nearest-neighbor rotation about the image center; uncovered pixels fill
/// white so they read as background.
pub fn rotate(image: &GrayImage, degrees: f64) -> GrayImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }
    let radians = degrees.to_radians();
    let (sin, cos) = radians.sin_cos();
    let cx = (w as f64 - 1.0) / 2.0;
    let cy = (h as f64 - 1.0) / 2.0;

    let mut out = GrayImage::from_pixel(w, h, image::Luma([255]));
    for y in 0..h {
        for x in 0..w {
            // Inverse mapping: sample the source pixel that lands here.
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let sx = cos * dx + sin * dy + cx;
            let sy = -sin * dx + cos * dy + cy;
            let sx = sx.round();
            let sy = sy.round();
            if sx >= 0.0 && sx < w as f64 && sy >= 0.0 && sy < h as f64 {
                out.put_pixel(x, y, *image.get_pixel(sx as u32, sy as u32));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(w: u32, h: u32) -> GrayImage {
        GrayImage::from_pixel(w, h, image::Luma([255]))
    }

    /// Draw a horizontal dark bar, optionally sheared to simulate skew.
    fn page_with_bar(skew_per_column: f64) -> GrayImage {
        let mut img = blank(64, 64);
        for x in 10..54u32 {
            let y = 32 + ((x as f64 - 10.0) * skew_per_column) as i64;
            for dy in 0..2i64 {
                let yy = (y + dy).clamp(0, 63) as u32;
                img.put_pixel(x, yy, image::Luma([0]));
            }
        }
        img
    }

    #[test]
    fn test_adaptive_threshold_binarizes() {
        let img = page_with_bar(0.0);
        let out = adaptive_threshold(&img, 11, 2);
        let mut values: Vec<u8> = out.pixels().map(|p| p.0[0]).collect();
        values.sort_unstable();
        values.dedup();
        assert!(values.iter().all(|v| *v == 0 || *v == 255));
        assert!(out.pixels().any(|p| p.0[0] == 0));
    }

    #[test]
    fn test_median_removes_isolated_speck() {
        let mut img = blank(16, 16);
        img.put_pixel(8, 8, image::Luma([0]));
        let out = median_denoise(&img);
        assert_eq!(out.get_pixel(8, 8).0[0], 255);
    }

    #[test]
    fn test_level_page_has_no_measured_skew() {
        let img = page_with_bar(0.0);
        assert!(estimate_skew_degrees(&img).abs() < DESKEW_MIN_ANGLE_DEGREES);
    }

    #[test]
    fn test_sheared_bar_is_detected() {
        // ~11 degrees of shear.
        let img = page_with_bar(0.2);
        let angle = estimate_skew_degrees(&img);
        assert!(angle.abs() > DESKEW_MIN_ANGLE_DEGREES, "angle {}", angle);
    }

    #[test]
    fn test_rotate_identity_at_zero() {
        let img = page_with_bar(0.1);
        let out = rotate(&img, 0.0);
        assert_eq!(img, out);
    }

    #[test]
    fn test_prepare_keeps_dimensions() {
        let img = page_with_bar(0.3);
        let out = prepare(&img);
        assert_eq!(out.dimensions(), img.dimensions());
    }
}
