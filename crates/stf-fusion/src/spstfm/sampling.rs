//! Training-sample selection.
//!
//! Training patches are drawn from the pair-difference images. Candidate
//! positions are ordered either randomly or by descending combined
//! high+low standard deviation; positions whose low-resolution patch
//! duplicates an earlier one and positions with too many invalid pixels
//! are removed. Invalid pixels inside accepted patches are replaced by the
//! mean of the valid difference values before the patch becomes a sample
//! column.

use super::patch::{extract_patch, mask_channel, patches_per_axis};
use super::SamplingStrategy;
use nalgebra::{DMatrix, DVector};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use stf_core::{Image, Rect, Result};
use tracing::debug;

/// All integers in [0, count), shuffled.
pub(crate) fn unique_random_vector(count: usize, rng: &mut impl Rng) -> Vec<usize> {
    let mut v: Vec<usize> = (0..count).collect();
    v.shuffle(rng);
    v
}

fn patch_stddev(patch: &DVector<f64>, mask_patch: Option<&DVector<f64>>) -> f64 {
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0u32;
    for (i, &v) in patch.iter().enumerate() {
        if let Some(m) = mask_patch {
            if m[i] == 0.0 {
                continue;
            }
        }
        sum += v;
        sum_sq += v * v;
        n += 1;
    }
    if n < 2 {
        return 0.0;
    }
    let nf = f64::from(n);
    ((sum_sq - sum * sum / nf) / (nf - 1.0)).max(0.0).sqrt()
}

fn mask_patch(
    mask: Option<&Image>,
    pxi: i32,
    pyi: i32,
    patch_size: u32,
    overlap: u32,
    area: Rect,
    channel: u32,
) -> Result<Option<DVector<f64>>> {
    match mask {
        None => Ok(None),
        Some(m) => Ok(Some(extract_patch(
            m,
            pxi,
            pyi,
            patch_size,
            overlap,
            area,
            mask_channel(m, channel),
        )?)),
    }
}

/// Patch indices sorted by descending combined standard deviation of the
/// high and low difference patches.
#[allow(clippy::too_many_arguments)]
pub(crate) fn most_variance(
    high_diff: &Image,
    low_diff: &Image,
    mask: Option<&Image>,
    patch_size: u32,
    overlap: u32,
    area: Rect,
    channel: u32,
) -> Result<Vec<usize>> {
    let npx = patches_per_axis(area.width, patch_size, overlap);
    let npy = patches_per_axis(area.height, patch_size, overlap);
    let mut spread = vec![0.0f64; npx * npy];
    for pyi in 0..npy {
        for pxi in 0..npx {
            let mp = mask_patch(mask, pxi as i32, pyi as i32, patch_size, overlap, area, channel)?;
            let hp = extract_patch(high_diff, pxi as i32, pyi as i32, patch_size, overlap, area, channel)?;
            let lp = extract_patch(low_diff, pxi as i32, pyi as i32, patch_size, overlap, area, channel)?;
            spread[pyi * npx + pxi] =
                patch_stddev(&hp, mp.as_ref()) + patch_stddev(&lp, mp.as_ref());
        }
    }

    let mut idx: Vec<usize> = (0..spread.len()).collect();
    idx.sort_by(|&a, &b| {
        spread[b]
            .partial_cmp(&spread[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(idx)
}

/// Positions of patches whose low-resolution content duplicates an earlier
/// patch.
///
/// Patches are bucketed by their normalized sum so only near-equal sums are
/// compared pairwise.
pub(crate) fn duplicate_patches(
    low_diff: &Image,
    mask: Option<&Image>,
    patch_size: u32,
    overlap: u32,
    area: Rect,
    channel: u32,
) -> Result<Vec<usize>> {
    let npx = patches_per_axis(area.width, patch_size, overlap);
    let npy = patches_per_axis(area.height, patch_size, overlap);
    let dim = (patch_size * patch_size) as f64;

    // value range for sum normalization, over valid pixels only
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for y in 0..low_diff.height() {
        for x in 0..low_diff.width() {
            if let Some(m) = mask {
                if !m.bool_at(x, y, mask_channel(m, channel)) {
                    continue;
                }
            }
            let v = low_diff.value(x, y, channel);
            min = min.min(v);
            max = max.max(v);
        }
    }
    if !(max > min) {
        return Ok(Vec::new()); // constant image: every patch equal, keep the first
    }
    const RANGE: f64 = 1e6;

    let masked_patch = |pxi: usize, pyi: usize| -> Result<DVector<f64>> {
        let mut p = extract_patch(low_diff, pxi as i32, pyi as i32, patch_size, overlap, area, channel)?;
        if let Some(mp) = mask_patch(mask, pxi as i32, pyi as i32, patch_size, overlap, area, channel)? {
            for (i, &m) in mp.iter().enumerate() {
                if m == 0.0 {
                    p[i] = 0.0;
                }
            }
        }
        Ok(p)
    };

    let mut buckets: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for pyi in 0..npy {
        for pxi in 0..npx {
            let p = masked_patch(pxi, pyi)?;
            let sum: f64 = p.iter().sum();
            let key = ((sum - dim * min) * (RANGE / (max - min) / dim)) as i64;
            buckets.entry(key).or_default().push(pyi * npx + pxi);
        }
    }

    const TOL: f64 = 1e-7;
    let mut duplicates = Vec::new();
    let keys: Vec<i64> = buckets.keys().copied().collect();
    for &key in &keys {
        // near-equal patches can land in the neighboring bucket
        let mut group = buckets.get(&key).cloned().unwrap_or_default();
        if let Some(next) = buckets.get(&(key + 1)) {
            group.extend_from_slice(next);
        }
        group.sort_unstable();
        for i in 0..group.len() {
            if duplicates.contains(&group[i]) {
                continue;
            }
            let pr = masked_patch(group[i] % npx, group[i] / npx)?;
            for &other in &group[i + 1..] {
                if duplicates.contains(&other) {
                    continue;
                }
                let pc = masked_patch(other % npx, other / npx)?;
                let equal = pr
                    .iter()
                    .zip(pc.iter())
                    .all(|(a, b)| (a - b).abs() <= TOL);
                if equal {
                    duplicates.push(other);
                }
            }
        }
    }
    duplicates.sort_unstable();
    duplicates.dedup();
    Ok(duplicates)
}

/// Positions whose mask patch has more invalid pixels than the tolerated
/// fraction.
pub(crate) fn mostly_invalid_patches(
    mask: Option<&Image>,
    tolerance: f64,
    patch_size: u32,
    overlap: u32,
    area: Rect,
    channel: u32,
) -> Result<Vec<usize>> {
    let Some(mask) = mask else {
        return Ok(Vec::new());
    };
    let npx = patches_per_axis(area.width, patch_size, overlap);
    let npy = patches_per_axis(area.height, patch_size, overlap);
    let dim = (patch_size * patch_size) as f64;
    let mc = mask_channel(mask, channel);

    let mut invalid = Vec::new();
    for pyi in 0..npy {
        for pxi in 0..npx {
            let p = extract_patch(mask, pxi as i32, pyi as i32, patch_size, overlap, area, mc)?;
            let bad = p.iter().filter(|&&v| v == 0.0).count() as f64;
            if bad / dim > tolerance {
                invalid.push(pyi * npx + pxi);
            }
        }
    }
    Ok(invalid)
}

/// Candidate patch positions for training, ordered by the strategy, with
/// duplicates and mostly-invalid positions removed.
#[allow(clippy::too_many_arguments)]
pub(crate) fn ordered_patch_indices(
    strategy: SamplingStrategy,
    high_diff: &Image,
    low_diff: &Image,
    mask: Option<&Image>,
    invalid_tolerance: f64,
    patch_size: u32,
    overlap: u32,
    area: Rect,
    channel: u32,
    rng: &mut impl Rng,
) -> Result<Vec<usize>> {
    let mut indices = match strategy {
        SamplingStrategy::Random => {
            let npx = patches_per_axis(area.width, patch_size, overlap);
            let npy = patches_per_axis(area.height, patch_size, overlap);
            unique_random_vector(npx * npy, rng)
        }
        SamplingStrategy::Variance => {
            most_variance(high_diff, low_diff, mask, patch_size, overlap, area, channel)?
        }
    };

    let duplicates = duplicate_patches(low_diff, mask, patch_size, overlap, area, channel)?;
    let invalid = mostly_invalid_patches(mask, invalid_tolerance, patch_size, overlap, area, channel)?;
    let before = indices.len();
    indices.retain(|i| !duplicates.contains(i) && !invalid.contains(i));
    if before != indices.len() {
        debug!(
            duplicates = duplicates.len(),
            invalid = invalid.len(),
            removed = before - indices.len(),
            "dropped patch positions before training"
        );
    }
    Ok(indices)
}

/// Builds the concatenated sample matrix (high block on top, low block
/// below) for the given patch positions.
///
/// Invalid pixels are replaced by the fill value; afterwards the blocks are
/// shifted by the means and scaled by the normalization factors.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_samples(
    high_diff: &Image,
    low_diff: &Image,
    mask: Option<&Image>,
    indices: &[usize],
    mean_high: f64,
    mean_low: f64,
    norm_high: f64,
    norm_low: f64,
    fill_high: f64,
    fill_low: f64,
    patch_size: u32,
    overlap: u32,
    area: Rect,
    channel: u32,
) -> Result<DMatrix<f64>> {
    let npx = patches_per_axis(area.width, patch_size, overlap);
    let dim = (patch_size * patch_size) as usize;
    let mut samples = DMatrix::<f64>::zeros(2 * dim, indices.len());

    for (col, &pi) in indices.iter().enumerate() {
        let pxi = (pi % npx) as i32;
        let pyi = (pi / npx) as i32;
        let mp = mask_patch(mask, pxi, pyi, patch_size, overlap, area, channel)?;
        let mut hp = extract_patch(high_diff, pxi, pyi, patch_size, overlap, area, channel)?;
        let mut lp = extract_patch(low_diff, pxi, pyi, patch_size, overlap, area, channel)?;
        if let Some(mp) = &mp {
            for (i, &m) in mp.iter().enumerate() {
                if m == 0.0 {
                    hp[i] = fill_high;
                    lp[i] = fill_low;
                }
            }
        }
        for i in 0..dim {
            samples[(i, col)] = (hp[i] - mean_high) / norm_high;
            samples[(dim + i, col)] = (lp[i] - mean_low) / norm_low;
        }
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use stf_core::PixelKind;

    fn diff_image(w: i32, h: i32, f: impl Fn(i32, i32) -> f64) -> Image {
        let mut img = Image::new(w, h, PixelKind::F64, 1).unwrap();
        for y in 0..h {
            for x in 0..w {
                img.set_pixel::<f64>(x, y, 0, f(x, y));
            }
        }
        img
    }

    #[test]
    fn unique_random_covers_all() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut v = unique_random_vector(100, &mut rng);
        v.sort_unstable();
        assert_eq!(v, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn variance_ordering_puts_structure_first() {
        // 10x10 with 2x2 patches of size 5: one textured quadrant
        let img = diff_image(10, 10, |x, y| {
            if x < 5 && y < 5 {
                ((x * 13 + 7 * y) % 5) as f64 * 20.0
            } else {
                1.0
            }
        });
        let flat = diff_image(10, 10, |_, _| 0.0);
        let area = Rect::new(0, 0, 10, 10);
        let idx = most_variance(&img, &flat, None, 5, 0, area, 0).unwrap();
        assert_eq!(idx.len(), 4);
        assert_eq!(idx[0], 0, "the textured patch must rank first");
    }

    #[test]
    fn duplicates_are_detected() {
        // two identical flat quadrants and two distinct ones
        let img = diff_image(10, 10, |x, y| {
            if y < 5 {
                1.0 // patches 0 and 1 identical
            } else {
                (x + 10 * y) as f64
            }
        });
        let area = Rect::new(0, 0, 10, 10);
        let dup = duplicate_patches(&img, None, 5, 0, area, 0).unwrap();
        assert_eq!(dup, vec![1]);
    }

    #[test]
    fn invalid_patches_are_sorted_out() {
        let mut mask = Image::filled(10, 10, PixelKind::U8, 1, 255.0).unwrap();
        // invalidate most of patch 3 (bottom right 5x5)
        for y in 5..10 {
            for x in 5..10 {
                if x + y < 18 {
                    mask.set_pixel::<u8>(x, y, 0, 0);
                }
            }
        }
        let area = Rect::new(0, 0, 10, 10);
        let bad = mostly_invalid_patches(Some(&mask), 0.15, 5, 0, area, 0).unwrap();
        assert_eq!(bad, vec![3]);
        // a loose tolerance keeps everything
        let none = mostly_invalid_patches(Some(&mask), 0.95, 5, 0, area, 0).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn samples_are_filled_and_normalized() {
        let high = diff_image(5, 5, |x, y| (x + y) as f64);
        let low = diff_image(5, 5, |x, y| (2 * x + y) as f64);
        let mut mask = Image::filled(5, 5, PixelKind::U8, 1, 255.0).unwrap();
        mask.set_pixel::<u8>(0, 0, 0, 0);
        let area = Rect::new(0, 0, 5, 5);

        let samples = build_samples(
            &high,
            &low,
            Some(&mask),
            &[0],
            1.0,
            0.0,
            2.0,
            1.0,
            -3.0,
            -5.0,
            5,
            0,
            area,
            0,
        )
        .unwrap();
        assert_eq!(samples.nrows(), 50);
        assert_eq!(samples.ncols(), 1);
        // masked pixel got the fill value, then normalization
        assert_eq!(samples[(0, 0)], (-3.0 - 1.0) / 2.0);
        assert_eq!(samples[(25, 0)], -5.0);
        // a valid pixel
        assert_eq!(samples[(1, 0)], (1.0 - 1.0) / 2.0);
    }
}
