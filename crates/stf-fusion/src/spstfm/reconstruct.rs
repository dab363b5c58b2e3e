//! Reconstruction: per-patch sparse coding against the trained dictionary
//! pair and overlap-averaged output assembly.
//!
//! For both pair dates the coarse difference patch toward the target date
//! is coded against the low-resolution dictionary block; the code applied
//! to the high-resolution block predicts the fine difference patch, which
//! is added back onto the fine pair patch. The two candidate patches are
//! blended with per-patch weights derived from the amount of coarse change
//! (more change on a side means less trust in it). Overlapping patch
//! contributions are averaged per output pixel and saturated into the
//! output kind.

use super::gpsr::{gpsr, GpsrOptions};
use super::patch::{
    extract_diff_patch, extract_patch, mask_channel, patch_origin, patches_per_axis,
};
use super::trainer::{high_block, low_block, ChannelStats};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use stf_core::{Image, Rect, Result};

/// Per-patch blend weights for the two pair dates, laid out npy × npx.
pub(crate) struct PatchWeights {
    pub w1: DMatrix<f64>,
    pub w3: DMatrix<f64>,
}

/// The weight rule of the paper: inverse-change weights inside the
/// tolerance band, winner-takes-all outside, equal split when nothing
/// changed at all.
fn weights_from_change(v1: f64, v3: f64, delta: f64) -> (f64, f64) {
    if v1 == 0.0 && v3 == 0.0 {
        return (0.5, 0.5);
    }
    if (v1 - v3).abs() > delta {
        return if v1 < v3 { (1.0, 0.0) } else { (0.0, 1.0) };
    }
    if v1 == 0.0 {
        return (1.0, 0.0);
    }
    if v3 == 0.0 {
        return (0.0, 1.0);
    }
    let w1 = v1 * v3 / (v1 * (v1 + v3));
    let w3 = v1 * v3 / (v3 * (v1 + v3));
    (w1, w3)
}

/// Weights from the average absolute coarse change per patch, one channel.
#[allow(clippy::too_many_arguments)]
pub(crate) fn init_weights_from_diff(
    low1: &Image,
    low2: &Image,
    low3: &Image,
    mask: Option<&Image>,
    patch_size: u32,
    overlap: u32,
    sample_area: Rect,
    channel: u32,
    delta: f64,
) -> Result<PatchWeights> {
    let npx = patches_per_axis(sample_area.width, patch_size, overlap);
    let npy = patches_per_axis(sample_area.height, patch_size, overlap);
    let dim = (patch_size * patch_size) as f64;

    // largest observed coarse change, over valid pixels of both pairs
    let mut max_diff = 0.0f64;
    for y in 0..low2.height() {
        for x in 0..low2.width() {
            if let Some(m) = mask {
                if !m.bool_at(x, y, mask_channel(m, channel)) {
                    continue;
                }
            }
            let v2 = low2.value(x, y, channel);
            max_diff = max_diff
                .max((v2 - low1.value(x, y, channel)).abs())
                .max((v2 - low3.value(x, y, channel)).abs());
        }
    }

    let mut w1 = DMatrix::zeros(npy, npx);
    let mut w3 = DMatrix::zeros(npy, npx);
    for pyi in 0..npy {
        for pxi in 0..npx {
            let (v1, v3) = if max_diff > 0.0 {
                let mut d1 = extract_diff_patch(
                    low2, low1, pxi as i32, pyi as i32, patch_size, overlap, sample_area, channel,
                )?;
                let mut d3 = extract_diff_patch(
                    low2, low3, pxi as i32, pyi as i32, patch_size, overlap, sample_area, channel,
                )?;
                if let Some(m) = mask {
                    let mp = extract_patch(
                        m,
                        pxi as i32,
                        pyi as i32,
                        patch_size,
                        overlap,
                        sample_area,
                        mask_channel(m, channel),
                    )?;
                    for (i, &mv) in mp.iter().enumerate() {
                        if mv == 0.0 {
                            d1[i] = 0.0;
                            d3[i] = 0.0;
                        }
                    }
                }
                (
                    d1.iter().map(|v| v.abs()).sum::<f64>() / (max_diff * dim),
                    d3.iter().map(|v| v.abs()).sum::<f64>() / (max_diff * dim),
                )
            } else {
                (0.0, 0.0)
            };
            let (a, b) = weights_from_change(v1, v3, delta);
            w1[(pyi, pxi)] = a;
            w3[(pyi, pxi)] = b;
        }
    }
    Ok(PatchWeights { w1, w3 })
}

/// Continuous build-up index of one pixel from the red/NIR/SWIR channels.
///
/// A normalized difference of SWIR against NIR; values above the threshold
/// count as built-up. The red channel participates through the configured
/// channel order and is reserved for damping vegetation response.
fn build_up_index(img: &Image, x: i32, y: i32, order: [u32; 3]) -> f64 {
    let nir = img.value(x, y, order[1]);
    let swir = img.value(x, y, order[2]);
    if swir + nir == 0.0 {
        return 0.0;
    }
    (swir - nir) / (swir + nir)
}

/// Weights from the count of changed build-up pixels per patch; used for
/// every channel of images carrying red/NIR/SWIR bands.
#[allow(clippy::too_many_arguments)]
pub(crate) fn init_weights_from_build_up(
    low1: &Image,
    low2: &Image,
    low3: &Image,
    order: [u32; 3],
    threshold: f64,
    patch_size: u32,
    overlap: u32,
    sample_area: Rect,
    delta: f64,
) -> Result<PatchWeights> {
    let (w, h) = (low2.width(), low2.height());
    let mut bu1 = Image::new(w, h, stf_core::PixelKind::U8, 1)?;
    let mut bu2 = Image::new(w, h, stf_core::PixelKind::U8, 1)?;
    let mut bu3 = Image::new(w, h, stf_core::PixelKind::U8, 1)?;
    for y in 0..h {
        for x in 0..w {
            bu1.set_pixel::<u8>(x, y, 0, (build_up_index(low1, x, y, order) > threshold) as u8);
            bu2.set_pixel::<u8>(x, y, 0, (build_up_index(low2, x, y, order) > threshold) as u8);
            bu3.set_pixel::<u8>(x, y, 0, (build_up_index(low3, x, y, order) > threshold) as u8);
        }
    }

    let npx = patches_per_axis(sample_area.width, patch_size, overlap);
    let npy = patches_per_axis(sample_area.height, patch_size, overlap);
    let dim = (patch_size * patch_size) as f64;

    let mut w1 = DMatrix::zeros(npy, npx);
    let mut w3 = DMatrix::zeros(npy, npx);
    for pyi in 0..npy {
        for pxi in 0..npx {
            let p1 = extract_patch(&bu1, pxi as i32, pyi as i32, patch_size, overlap, sample_area, 0)?;
            let p2 = extract_patch(&bu2, pxi as i32, pyi as i32, patch_size, overlap, sample_area, 0)?;
            let p3 = extract_patch(&bu3, pxi as i32, pyi as i32, patch_size, overlap, sample_area, 0)?;
            let changed1 = p1.iter().zip(p2.iter()).filter(|(a, b)| a != b).count();
            let changed3 = p3.iter().zip(p2.iter()).filter(|(a, b)| a != b).count();
            let (a, b) =
                weights_from_change(changed1 as f64 / dim, changed3 as f64 / dim, delta);
            w1[(pyi, pxi)] = a;
            w3[(pyi, pxi)] = b;
        }
    }
    Ok(PatchWeights { w1, w3 })
}

/// Inputs of one channel reconstruction.
pub(crate) struct ChannelReconstruction<'a> {
    pub high1: &'a Image,
    pub high3: &'a Image,
    pub low1: &'a Image,
    pub low2: &'a Image,
    pub low3: &'a Image,
    pub valid_mask: Option<&'a Image>,
    pub write_mask: Option<&'a Image>,
    pub dict: &'a DMatrix<f64>,
    pub weights: &'a PatchWeights,
    pub stats: ChannelStats,
    /// Fill value for invalid pixels of the date-1 difference patches.
    pub fill21: f64,
    /// Fill value for invalid pixels of the date-3 difference patches.
    pub fill23: f64,
    pub gpsr: GpsrOptions,
    pub patch_size: u32,
    pub overlap: u32,
    pub sample_area: Rect,
    pub pred_area: Rect,
    pub channel: u32,
}

impl ChannelReconstruction<'_> {
    /// Predicts the fine difference patch from one pair date and adds it
    /// onto the fine pair patch. An entirely invalid patch is not coded at
    /// all; the candidate then degenerates to the fine pair patch.
    fn candidate(
        &self,
        low_pair: &Image,
        high_pair: &Image,
        fill: f64,
        dict_high: &DMatrix<f64>,
        dict_low: &DMatrix<f64>,
        pxi: i32,
        pyi: i32,
    ) -> Result<DVector<f64>> {
        let mut diff = extract_diff_patch(
            self.low2,
            low_pair,
            pxi,
            pyi,
            self.patch_size,
            self.overlap,
            self.sample_area,
            self.channel,
        )?;
        let mut invalid = 0usize;
        if let Some(m) = self.valid_mask {
            let mp = extract_patch(
                m,
                pxi,
                pyi,
                self.patch_size,
                self.overlap,
                self.sample_area,
                mask_channel(m, self.channel),
            )?;
            for (i, &mv) in mp.iter().enumerate() {
                if mv == 0.0 {
                    diff[i] = fill;
                    invalid += 1;
                }
            }
        }
        let high_patch = extract_patch(
            high_pair,
            pxi,
            pyi,
            self.patch_size,
            self.overlap,
            self.sample_area,
            self.channel,
        )?;
        if invalid == diff.nrows() {
            // nothing valid to code against, keep the fine pair patch
            return Ok(high_patch);
        }

        let normalized = diff.map(|v| (v - self.stats.mean_low) / self.stats.norm_low);
        let (code, _) = gpsr(&normalized, dict_low, &self.gpsr);
        let high_diff =
            (dict_high * code).map(|v| v * self.stats.norm_high + self.stats.mean_high);
        Ok(high_patch + high_diff)
    }

    /// Runs the reconstruction for this channel, writing into `output`.
    pub fn run(&self, output: &mut Image) -> Result<()> {
        let npx = patches_per_axis(self.sample_area.width, self.patch_size, self.overlap);
        let npy = patches_per_axis(self.sample_area.height, self.patch_size, self.overlap);
        let dict_high = high_block(self.dict);
        let dict_low = low_block(self.dict);
        let dim = (self.patch_size * self.patch_size) as usize;

        let patches: Vec<Result<Option<(usize, DVector<f64>)>>> = (0..npx * npy)
            .into_par_iter()
            .map(|pi| {
                let pxi = (pi % npx) as i32;
                let pyi = (pi / npx) as i32;

                if let Some(wm) = self.write_mask {
                    let wp = extract_patch(
                        wm,
                        pxi,
                        pyi,
                        self.patch_size,
                        self.overlap,
                        self.sample_area,
                        0,
                    )?;
                    if wp.iter().all(|&v| v == 0.0) {
                        return Ok(None);
                    }
                }

                let c1 = self.candidate(
                    self.low1, self.high1, self.fill21, &dict_high, &dict_low, pxi, pyi,
                )?;
                let c3 = self.candidate(
                    self.low3, self.high3, self.fill23, &dict_high, &dict_low, pxi, pyi,
                )?;
                let w1 = self.weights.w1[(pyi as usize, pxi as usize)];
                let w3 = self.weights.w3[(pyi as usize, pxi as usize)];
                Ok(Some((pi, c1 * w1 + c3 * w3)))
            })
            .collect();

        // overlap-average all contributing patches per sample-area pixel
        let (sw, sh) = (self.sample_area.width, self.sample_area.height);
        let mut sums = vec![0.0f64; sw as usize * sh as usize];
        let mut counts = vec![0u32; sw as usize * sh as usize];
        for entry in patches {
            let Some((pi, patch)) = entry? else { continue };
            let pxi = (pi % npx) as i32;
            let pyi = (pi / npx) as i32;
            let origin = patch_origin(pxi, pyi, self.patch_size, self.overlap, self.sample_area);
            let rel_x = origin.x - self.sample_area.x;
            let rel_y = origin.y - self.sample_area.y;
            debug_assert_eq!(patch.nrows(), dim);
            for (i, &v) in patch.iter().enumerate() {
                let px = rel_x + (i % self.patch_size as usize) as i32;
                let py = rel_y + (i / self.patch_size as usize) as i32;
                let idx = (py * sw + px) as usize;
                sums[idx] += v;
                counts[idx] += 1;
            }
        }

        for y in self.pred_area.y..self.pred_area.bottom() {
            for x in self.pred_area.x..self.pred_area.right() {
                let sx = x - self.sample_area.x;
                let sy = y - self.sample_area.y;
                let idx = (sy * sw + sx) as usize;
                if counts[idx] == 0 {
                    continue; // patch was skipped via the prediction mask
                }
                output.set_value(
                    x - self.pred_area.x,
                    y - self.pred_area.y,
                    self.channel,
                    sums[idx] / f64::from(counts[idx]),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_weight_rule() {
        assert_eq!(weights_from_change(0.0, 0.0, 0.2), (0.5, 0.5));
        // far apart: the quieter side wins outright
        assert_eq!(weights_from_change(0.1, 0.5, 0.2), (1.0, 0.0));
        assert_eq!(weights_from_change(0.5, 0.1, 0.2), (0.0, 1.0));
        // inside the band: inverse-change weights, normalized
        let (w1, w3) = weights_from_change(0.2, 0.3, 0.2);
        assert!((w1 + w3 - 1.0).abs() < 1e-12);
        assert!(w1 > w3);
        // equal change splits evenly
        let (w1, w3) = weights_from_change(0.25, 0.25, 0.2);
        assert!((w1 - 0.5).abs() < 1e-12 && (w3 - 0.5).abs() < 1e-12);
        // a zero side inside the band takes everything
        assert_eq!(weights_from_change(0.0, 0.1, 0.2), (1.0, 0.0));
    }
}
