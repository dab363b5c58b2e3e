//! Synthetic fixtures and comparison helpers for the integration tests.
//!
//! The fixtures stand in for the artificial scene sets used during
//! development: deterministic textured scenes, block-change scenes whose
//! coarse counterparts are box-blurred copies, and mirrored-change triples
//! where the target scene lies exactly between the two pair scenes.

use stf_core::{Image, MultiResImages, PixelKind, Result};

/// Builds a single- or multi-channel image from a value function.
pub fn image_from_fn(
    width: i32,
    height: i32,
    kind: PixelKind,
    channels: u32,
    f: impl Fn(i32, i32, u32) -> f64,
) -> Image {
    let mut img = Image::new(width, height, kind, channels).expect("fixture geometry");
    for y in 0..height {
        for x in 0..width {
            for c in 0..channels {
                img.set_value(x, y, c, f(x, y, c));
            }
        }
    }
    img
}

/// A deterministic textured scene: smooth gradients plus a pseudo-random
/// speckle derived from the coordinates.
pub fn textured_scene(width: i32, height: i32, channels: u32, seed: i32) -> Image {
    image_from_fn(width, height, PixelKind::U16, channels, |x, y, c| {
        let base = 800.0 + 6.0 * f64::from(x) + 4.0 * f64::from(y) + 90.0 * f64::from(c);
        let speckle = f64::from((x * 31 + y * 17 + seed * 13 + c as i32 * 7) % 23) * 8.0;
        base + speckle
    })
}

/// 3×3 box blur with replicated borders, the stand-in for a coarse sensor.
pub fn box_blur3(img: &Image) -> Image {
    let (w, h, ch) = (img.width(), img.height(), img.channels());
    image_from_fn(w, h, img.kind(), ch, |x, y, c| {
        let mut sum = 0.0;
        for dy in -1..=1 {
            for dx in -1..=1 {
                let sx = (x + dx).clamp(0, w - 1);
                let sy = (y + dy).clamp(0, h - 1);
                sum += img.value(sx, sy, c);
            }
        }
        sum / 9.0
    })
}

/// L1 distance over all pixels and channels.
pub fn l1_error(a: &Image, b: &Image) -> f64 {
    assert_eq!(a.size(), b.size());
    assert_eq!(a.channels(), b.channels());
    let mut sum = 0.0;
    for y in 0..a.height() {
        for x in 0..a.width() {
            for c in 0..a.channels() {
                sum += (a.value(x, y, c) - b.value(x, y, c)).abs();
            }
        }
    }
    sum
}

/// L2 distance over all pixels and channels.
pub fn l2_error(a: &Image, b: &Image) -> f64 {
    let mut sum = 0.0;
    for y in 0..a.height() {
        for x in 0..a.width() {
            for c in 0..a.channels() {
                let d = a.value(x, y, c) - b.value(x, y, c);
                sum += d * d;
            }
        }
    }
    sum.sqrt()
}

/// Largest absolute per-value difference.
pub fn max_abs_diff(a: &Image, b: &Image) -> f64 {
    let mut max = 0.0f64;
    for y in 0..a.height() {
        for x in 0..a.width() {
            for c in 0..a.channels() {
                max = max.max((a.value(x, y, c) - b.value(x, y, c)).abs());
            }
        }
    }
    max
}

/// Whether two images agree in every value (and geometry).
pub fn images_equal(a: &Image, b: &Image) -> bool {
    a.size() == b.size() && a.channels() == b.channels() && max_abs_diff(a, b) == 0.0
}

/// A mirrored-change scene triple around a constant base:
/// `H(d1) = base − G`, `H(d2) = base`, `H(d3) = base + G` with a
/// checkerboard pattern `G`, coarse images as 3×3 blurs. Errors of the two
/// single-pair predictions cancel exactly in the blend, so the double-pair
/// prediction must win.
///
/// Returns the store (pairs at dates 1 and 3, coarse target at 2) and the
/// reference `H(d2)`.
pub fn mirrored_change_set(width: i32, height: i32) -> Result<(MultiResImages, Image)> {
    const BASE: f64 = 1000.0;
    let g = image_from_fn(width, height, PixelKind::F64, 1, |x, y, _| {
        if (x + y) % 2 == 0 {
            100.0
        } else {
            0.0
        }
    });
    let h1 = image_from_fn(width, height, PixelKind::F64, 1, |x, y, _| {
        BASE - g.value(x, y, 0)
    });
    let h3 = image_from_fn(width, height, PixelKind::F64, 1, |x, y, _| {
        BASE + g.value(x, y, 0)
    });
    let h2 = Image::filled(width, height, PixelKind::F64, 1, BASE)?;

    let l1 = box_blur3(&h1);
    let l3 = box_blur3(&h3);
    let l2 = Image::filled(width, height, PixelKind::F64, 1, BASE)?;

    let mut imgs = MultiResImages::new();
    imgs.set("high", 1, h1);
    imgs.set("low", 1, l1);
    imgs.set("low", 2, l2);
    imgs.set("high", 3, h3);
    imgs.set("low", 3, l3);
    Ok((imgs, h2))
}

/// A linear-evolution block scene: a square of `+2·amplitude` appears
/// between dates 1 and 3, the target date lies exactly halfway. Coarse
/// images are 3×3 blurs.
///
/// Returns the store and the reference `H(d2)`.
pub fn linear_block_set(size: i32, amplitude: f64) -> (MultiResImages, Image) {
    const BASE: f64 = 500.0;
    let block = |x: i32, y: i32| -> f64 {
        let lo = size / 3;
        let hi = 2 * size / 3;
        if x >= lo && x < hi && y >= lo && y < hi {
            amplitude
        } else {
            0.0
        }
    };
    let h1 = Image::filled(size, size, PixelKind::F32, 1, BASE).expect("fixture geometry");
    let h2 = image_from_fn(size, size, PixelKind::F32, 1, |x, y, _| BASE + block(x, y));
    let h3 = image_from_fn(size, size, PixelKind::F32, 1, |x, y, _| {
        BASE + 2.0 * block(x, y)
    });

    let l1 = box_blur3(&h1);
    let l2 = box_blur3(&h2);
    let l3 = box_blur3(&h3);

    let mut imgs = MultiResImages::new();
    imgs.set("high", 1, h1);
    imgs.set("low", 1, l1);
    imgs.set("low", 2, l2);
    imgs.set("high", 3, h3);
    imgs.set("low", 3, l3);
    (imgs, h2)
}
