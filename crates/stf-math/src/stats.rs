//! Masked per-channel statistics over whole images.
//!
//! The similarity thresholds of the weighted-window engines and the
//! temporal pair-combination weights are derived from full-image statistics
//! (never from a stripe), which is what keeps predictions independent of the
//! tile partition.

use stf_core::Image;

/// Mean and sample standard deviation of one channel over the valid pixels.
///
/// Returns `(mean, stddev, count)`; both moments are 0 when fewer than two
/// valid pixels exist.
pub fn masked_mean_stddev(img: &Image, mask: Option<&Image>, channel: u32) -> (f64, f64, u64) {
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0u64;
    for y in 0..img.height() {
        for x in 0..img.width() {
            if let Some(m) = mask {
                if !m.bool_at(x, y, 0) {
                    continue;
                }
            }
            let v = img.value(x, y, channel);
            sum += v;
            sum_sq += v * v;
            n += 1;
        }
    }
    if n == 0 {
        return (0.0, 0.0, 0);
    }
    let mean = sum / n as f64;
    if n < 2 {
        return (mean, 0.0, n);
    }
    let var = (sum_sq - sum * sum / n as f64) / (n as f64 - 1.0);
    (mean, var.max(0.0).sqrt(), n)
}

/// Mean and sample standard deviation of the per-pixel difference `a − b`
/// in one channel over the valid pixels.
pub fn masked_diff_mean_stddev(
    a: &Image,
    b: &Image,
    mask: Option<&Image>,
    channel: u32,
) -> (f64, f64, u64) {
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0u64;
    for y in 0..a.height() {
        for x in 0..a.width() {
            if let Some(m) = mask {
                if !m.bool_at(x, y, 0) {
                    continue;
                }
            }
            let v = a.value(x, y, channel) - b.value(x, y, channel);
            sum += v;
            sum_sq += v * v;
            n += 1;
        }
    }
    if n == 0 {
        return (0.0, 0.0, 0);
    }
    let mean = sum / n as f64;
    if n < 2 {
        return (mean, 0.0, n);
    }
    let var = (sum_sq - sum * sum / n as f64) / (n as f64 - 1.0);
    (mean, var.max(0.0).sqrt(), n)
}

/// Sum of absolute per-pixel differences `|a − b|` in one channel over the
/// valid pixels.
pub fn masked_abs_diff_sum(a: &Image, b: &Image, mask: Option<&Image>, channel: u32) -> f64 {
    let mut sum = 0.0;
    for y in 0..a.height() {
        for x in 0..a.width() {
            if let Some(m) = mask {
                if !m.bool_at(x, y, 0) {
                    continue;
                }
            }
            sum += (a.value(x, y, channel) - b.value(x, y, channel)).abs();
        }
    }
    sum
}

/// Largest absolute per-pixel difference `|a − b|` in one channel over the
/// valid pixels.
pub fn masked_abs_diff_max(a: &Image, b: &Image, mask: Option<&Image>, channel: u32) -> f64 {
    let mut max = 0.0f64;
    for y in 0..a.height() {
        for x in 0..a.width() {
            if let Some(m) = mask {
                if !m.bool_at(x, y, 0) {
                    continue;
                }
            }
            max = max.max((a.value(x, y, channel) - b.value(x, y, channel)).abs());
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use stf_core::{Image, PixelKind};

    #[test]
    fn mean_stddev_unmasked() {
        let mut img = Image::new(2, 2, PixelKind::F64, 1).unwrap();
        for (i, v) in [2.0, 4.0, 4.0, 6.0].iter().enumerate() {
            img.set_pixel::<f64>(i as i32 % 2, i as i32 / 2, 0, *v);
        }
        let (mean, sd, n) = masked_mean_stddev(&img, None, 0);
        assert_eq!(n, 4);
        assert_abs_diff_eq!(mean, 4.0);
        // sample stddev of {2, 4, 4, 6}
        assert_abs_diff_eq!(sd, (8.0f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn mask_excludes_pixels() {
        let mut img = Image::new(3, 1, PixelKind::F64, 1).unwrap();
        img.set_pixel::<f64>(0, 0, 0, 10.0);
        img.set_pixel::<f64>(1, 0, 0, 1e9); // to be masked out
        img.set_pixel::<f64>(2, 0, 0, 20.0);
        let mut mask = Image::filled(3, 1, PixelKind::U8, 1, 255.0).unwrap();
        mask.set_pixel::<u8>(1, 0, 0, 0);

        let (mean, _, n) = masked_mean_stddev(&img, Some(&mask), 0);
        assert_eq!(n, 2);
        assert_abs_diff_eq!(mean, 15.0);
    }

    #[test]
    fn diff_stats() {
        let a = Image::filled(2, 2, PixelKind::F64, 1, 7.0).unwrap();
        let b = Image::filled(2, 2, PixelKind::F64, 1, 3.0).unwrap();
        let (mean, sd, _) = masked_diff_mean_stddev(&a, &b, None, 0);
        assert_abs_diff_eq!(mean, 4.0);
        assert_abs_diff_eq!(sd, 0.0);
        assert_abs_diff_eq!(masked_abs_diff_sum(&a, &b, None, 0), 16.0);
        assert_abs_diff_eq!(masked_abs_diff_max(&a, &b, None, 0), 4.0);
    }
}
