//! Fit-FC: regression model fitting, spatial filtering and residual
//! compensation.
//!
//! A single-pair method in three stages:
//!
//! 1. **RM** - per pixel, a linear model `L(target) = a·L(pair) + b` is
//!    fitted over every pixel of the surrounding window (no filtering),
//!    driven by the sliding-window sums. The model maps the fine pair image
//!    to a first prediction; the per-pixel residual of the coarse fit is
//!    kept in 64-bit float.
//! 2. **Residual filtering** - the residual is reduced by the resolution
//!    factor with area averaging and blown back up with bicubic
//!    interpolation. This couples all pixels of the sample area, which is
//!    why the engine must not be wrapped by the tile parallelizer; it
//!    parallelizes internally across channels and rows instead.
//! 3. **SF + RC** - per pixel, the N most similar neighbors (multi-channel
//!    RMSE against the center, ties broken by distance) contribute their
//!    regression prediction plus filtered residual through inverse-distance
//!    weights.

use crate::preamble;
use crate::DataFusor;
use rayon::prelude::*;
use std::sync::Arc;
use stf_core::{dispatch_kind, Error, Image, MultiResImages, PixelKind, Rect, Result, Scalar};
use stf_math::{area_cubic_roundtrip, fit_line, sliding_window_sums};
use tracing::warn;

/// Options of the [`FitFCFusor`].
#[derive(Debug, Clone)]
pub struct FitFCOptions {
    /// Tag of the fine-resolution images.
    pub high_tag: String,
    /// Tag of the coarse-resolution images.
    pub low_tag: String,
    /// Date of the input pair.
    pub pair_date: Option<i32>,
    /// Prediction area; the all-zero sentinel means the full image.
    pub prediction_area: Rect,
    /// Moving-window side length, odd and >= 3.
    pub window_size: i32,
    /// Number of best neighbors used in the filtering stage; clamped to the
    /// window pixel count.
    pub number_neighbors: u32,
    /// Ratio of coarse to fine ground resolution; 1 skips the residual
    /// filtering.
    pub resolution_factor: u32,
    /// Worker threads for the internal parallelization; 0 uses the global
    /// pool.
    pub threads: usize,
}

impl Default for FitFCOptions {
    fn default() -> Self {
        Self {
            high_tag: String::new(),
            low_tag: String::new(),
            pair_date: None,
            prediction_area: Rect::default(),
            window_size: 51,
            number_neighbors: 30,
            resolution_factor: 1,
            threads: 0,
        }
    }
}

/// The Fit-FC engine. See the [module documentation](self).
///
/// Deliberately *not* [`TileParallel`](crate::TileParallel): the bicubic
/// residual depends on the whole sample area.
#[derive(Clone, Default)]
pub struct FitFCFusor {
    imgs: Option<Arc<MultiResImages>>,
    opt: FitFCOptions,
    output: Image,
}

impl FitFCFusor {
    /// Creates an engine with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies and validates the options.
    pub fn process_options(&mut self, o: &FitFCOptions) -> Result<()> {
        preamble::check_tags(&o.high_tag, &o.low_tag)?;
        preamble::check_window_size(o.window_size)?;
        if o.pair_date.is_none() {
            return Err(Error::invalid_argument(
                "the input pair date is required for prediction",
            ));
        }
        if o.number_neighbors == 0 {
            return Err(Error::invalid_argument(
                "the number of neighbors must be positive",
            ));
        }
        if o.resolution_factor == 0 {
            return Err(Error::invalid_argument(
                "the resolution factor must be a positive integer",
            ));
        }
        self.opt = o.clone();
        Ok(())
    }

    /// The previously set options.
    pub fn options(&self) -> &FitFCOptions {
        &self.opt
    }
}

impl DataFusor for FitFCFusor {
    fn set_src_images(&mut self, imgs: Arc<MultiResImages>) {
        self.imgs = Some(imgs);
    }

    fn output(&self) -> &Image {
        &self.output
    }

    fn take_output(&mut self) -> Image {
        std::mem::take(&mut self.output)
    }

    fn predict(&mut self, date: i32, mask: Option<&Image>) -> Result<()> {
        let imgs = self
            .imgs
            .clone()
            .ok_or_else(|| Error::logic("predict called before set_src_images"))?;
        let Some(d1) = self.opt.pair_date else {
            return Err(Error::logic("predict called before process_options"));
        };

        let required = [
            (self.opt.high_tag.as_str(), d1),
            (self.opt.low_tag.as_str(), d1),
            (self.opt.low_tag.as_str(), date),
        ];
        let (size, kind, channels) = preamble::check_images_consistent(&imgs, &required)?;
        preamble::check_mask(mask, size, channels)?;

        let win = self.opt.window_size;
        if win > size.width || win > size.height {
            return Err(Error::size(
                format!("window size {win} exceeds the image extent {size}"),
                Some(size),
            ));
        }
        if self.opt.resolution_factor as i32 > size.width
            || self.opt.resolution_factor as i32 > size.height
        {
            return Err(Error::size(
                format!(
                    "resolution factor {} exceeds the image extent {size}",
                    self.opt.resolution_factor
                ),
                Some(size),
            ));
        }
        let max_neighbors = (win * win) as u32;
        let mut neighbors = self.opt.number_neighbors;
        if neighbors > max_neighbors {
            warn!(
                requested = neighbors,
                available = max_neighbors,
                "more neighbors requested than pixels in the window, using all of them"
            );
            neighbors = max_neighbors;
        }

        let mask = preamble::single_channel_mask(mask)?;
        let pred_area = preamble::resolve_prediction_area(self.opt.prediction_area, size)?;
        preamble::ensure_output(&mut self.output, pred_area.size(), kind, channels)?;

        // the residual filter is border sensitive, so read a full extra
        // window around the prediction area
        let sample_area = pred_area
            .inflate(win)
            .intersect(&Rect::from_size(size));
        let pred_rel = pred_area.translate(-sample_area.x, -sample_area.y);

        let high1 = imgs.get(&self.opt.high_tag, d1)?.shared_crop(sample_area)?;
        let low1 = imgs.get(&self.opt.low_tag, d1)?.shared_crop(sample_area)?;
        let low2 = imgs.get(&self.opt.low_tag, date)?.shared_crop(sample_area)?;
        let sample_mask = match &mask {
            None => None,
            Some(m) => Some(m.shared_crop(sample_area)?),
        };

        let mut run = || -> Result<()> {
            let (frm, residual) =
                regression_mapping(&high1, &low1, &low2, sample_mask.as_ref(), win)?;
            let residual = area_cubic_roundtrip(&residual, self.opt.resolution_factor)?;
            let dist_weights = distance_weights(win);
            filter_and_compensate(
                &mut self.output,
                &high1,
                &frm,
                &residual,
                sample_mask.as_ref(),
                &dist_weights,
                pred_rel,
                win,
                neighbors as usize,
            )
        };

        if self.opt.threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.opt.threads)
                .build()
                .map_err(|e| Error::runtime(format!("worker pool setup failed: {e}")))?;
            pool.install(run)
        } else {
            run()
        }
    }
}

/// Stage one: the regression model prediction and the coarse residual.
///
/// Returns the prediction (same kind as `high1`) and the residual image
/// (64-bit float, same channels). Channels are processed in parallel.
pub fn regression_mapping(
    high1: &Image,
    low1: &Image,
    low2: &Image,
    mask: Option<&Image>,
    window_size: i32,
) -> Result<(Image, Image)> {
    let (w, h, channels) = (high1.width(), high1.height(), high1.channels());
    let planes: Vec<Result<Vec<(f64, f64)>>> = (0..channels)
        .into_par_iter()
        .map(|c| {
            let mut plane = vec![(0.0f64, 0.0f64); w as usize * h as usize];
            sliding_window_sums(low1, low2, mask, window_size, c, |x, y, sums| {
                if let Some(m) = mask {
                    if !m.bool_at(x, y, 0) {
                        return; // masked output is unspecified
                    }
                }
                let h1v = high1.value(x, y, c);
                let l1v = low1.value(x, y, c);
                let l2v = low2.value(x, y, c);
                let (frm, res) = match fit_line(sums) {
                    Some((a, b)) => (a * h1v + b, l2v - (a * l1v + b)),
                    // all window x equal: identity mapping
                    None => (h1v, l2v - l1v),
                };
                plane[(y * w + x) as usize] = (frm, res);
            })?;
            Ok(plane)
        })
        .collect();

    let mut frm = Image::new(w, h, high1.kind(), channels)?;
    let mut residual = Image::new(w, h, PixelKind::F64, channels)?;
    for (c, plane) in planes.into_iter().enumerate() {
        let plane = plane?;
        for y in 0..h {
            for x in 0..w {
                let (f, r) = plane[(y * w + x) as usize];
                frm.set_value(x, y, c as u32, f);
                residual.set_pixel::<f64>(x, y, c as u32, r);
            }
        }
    }
    Ok((frm, residual))
}

/// Precomputed inverse relative distance weights for a window:
/// `1 / (1 + dist / (S/2))`, laid out row-major as an S×S plane.
pub fn distance_weights(window_size: i32) -> Vec<f64> {
    let s = window_size as usize;
    let half = window_size / 2;
    let mut out = vec![0.0; s * s];
    for j in 0..window_size {
        for i in 0..window_size {
            let dx = f64::from(i - half);
            let dy = f64::from(j - half);
            out[(j * window_size + i) as usize] =
                1.0 / ((dx * dx + dy * dy).sqrt() * 2.0 / f64::from(window_size) + 1.0);
        }
    }
    out
}

#[derive(Clone, Copy, PartialEq)]
struct Score {
    diff: f64,
    dist_sq: i64,
    x: i32,
    y: i32,
}

impl Score {
    fn better_than(&self, other: &Score) -> bool {
        self.diff < other.diff || (self.diff == other.diff && self.dist_sq < other.dist_sq)
    }
}

#[allow(clippy::too_many_arguments)]
fn filter_and_compensate(
    output: &mut Image,
    high1: &Image,
    frm: &Image,
    residual: &Image,
    mask: Option<&Image>,
    dist_weights: &[f64],
    pred_rel: Rect,
    window_size: i32,
    neighbors: usize,
) -> Result<()> {
    let channels = high1.channels() as usize;
    let half = window_size / 2;
    let bounds = Rect::new(0, 0, high1.width(), high1.height());

    let kind = output.kind();
    let rows: Vec<Vec<f64>> = (pred_rel.y..pred_rel.bottom())
        .into_par_iter()
        .map(|y| {
            let mut row = vec![f64::NAN; pred_rel.width as usize * channels];
            let mut scores: Vec<Score> = Vec::with_capacity((window_size * window_size) as usize);
            for x in pred_rel.x..pred_rel.right() {
                if let Some(m) = mask {
                    if !m.bool_at(x, y, 0) {
                        continue;
                    }
                }
                let win_origin_x = x - half;
                let win_origin_y = y - half;
                let win =
                    Rect::new(win_origin_x, win_origin_y, window_size, window_size).intersect(&bounds);

                let center: Vec<f64> = (0..channels)
                    .map(|c| high1.value(x, y, c as u32))
                    .collect();

                scores.clear();
                for v in win.y..win.bottom() {
                    for u in win.x..win.right() {
                        if let Some(m) = mask {
                            if !m.bool_at(u, v, 0) {
                                continue;
                            }
                        }
                        let mut diff = 0.0;
                        for (c, center_v) in center.iter().enumerate() {
                            let d = high1.value(u, v, c as u32) - center_v;
                            diff += d * d;
                        }
                        let dx = i64::from(u - x);
                        let dy = i64::from(v - y);
                        scores.push(Score {
                            diff,
                            dist_sq: dx * dx + dy * dy,
                            x: u,
                            y: v,
                        });
                    }
                }
                let n = neighbors.min(scores.len());
                scores.sort_by(|a, b| {
                    if a.better_than(b) {
                        std::cmp::Ordering::Less
                    } else if b.better_than(a) {
                        std::cmp::Ordering::Greater
                    } else {
                        std::cmp::Ordering::Equal
                    }
                });

                let mut sum_w = 0.0;
                let mut acc = vec![0.0f64; channels];
                for s in &scores[..n] {
                    let wi = (s.x - win_origin_x) as usize;
                    let wj = (s.y - win_origin_y) as usize;
                    let w = dist_weights[wj * window_size as usize + wi];
                    sum_w += w;
                    for (c, a) in acc.iter_mut().enumerate() {
                        *a += w
                            * (frm.value(s.x, s.y, c as u32)
                                + residual.value(s.x, s.y, c as u32));
                    }
                }
                for (c, a) in acc.iter().enumerate() {
                    row[(x - pred_rel.x) as usize * channels + c] = a / sum_w;
                }
            }
            row
        })
        .collect();

    dispatch_kind!(kind, T2 => {
        for (j, row) in rows.iter().enumerate() {
            for i in 0..pred_rel.width {
                for c in 0..channels {
                    let v = row[i as usize * channels + c];
                    if v.is_nan() {
                        continue; // masked, leave untouched
                    }
                    output.set_pixel::<T2>(i, j as i32, c as u32, <T2 as Scalar>::from_f64(v));
                }
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use stf_core::PixelKind;

    fn f64_image(values: &[f64], w: i32, h: i32) -> Image {
        Image::from_vec(w, h, 1, values.to_vec()).unwrap()
    }

    #[test]
    fn regression_recovers_affine_mapping() {
        let l1 = f64_image(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], 3, 3);
        let h1 = f64_image(&[1.0, 3.0, 5.0, 7.0, 9.0, 1.0, 2.0, 3.0, 4.0], 3, 3);
        let mut l2 = Image::new(3, 3, PixelKind::F64, 1).unwrap();
        for y in 0..3 {
            for x in 0..3 {
                l2.set_pixel::<f64>(x, y, 0, 3.0 * l1.pixel::<f64>(x, y, 0) + 2.0);
            }
        }

        let (frm, res) = regression_mapping(&h1, &l1, &l2, None, 3).unwrap();
        for y in 0..3 {
            for x in 0..3 {
                assert_abs_diff_eq!(
                    frm.pixel::<f64>(x, y, 0),
                    3.0 * h1.pixel::<f64>(x, y, 0) + 2.0,
                    epsilon = 1e-9
                );
                assert_abs_diff_eq!(res.pixel::<f64>(x, y, 0), 0.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn degenerate_window_falls_back_to_identity() {
        let l1 = Image::filled(3, 3, PixelKind::F64, 1, 4.0).unwrap();
        let h1 = f64_image(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], 3, 3);
        let l2 = Image::filled(3, 3, PixelKind::F64, 1, 9.0).unwrap();

        let (frm, res) = regression_mapping(&h1, &l1, &l2, None, 3).unwrap();
        for y in 0..3 {
            for x in 0..3 {
                assert_abs_diff_eq!(frm.pixel::<f64>(x, y, 0), h1.pixel::<f64>(x, y, 0));
                assert_abs_diff_eq!(res.pixel::<f64>(x, y, 0), 5.0);
            }
        }
    }

    #[test]
    fn distance_weights_symmetry() {
        let w = distance_weights(5);
        assert_eq!(w.len(), 25);
        assert_abs_diff_eq!(w[2 * 5 + 2], 1.0); // center
        assert_abs_diff_eq!(w[2 * 5], w[2 * 5 + 4]); // left == right
        assert_abs_diff_eq!(w[2], w[4 * 5 + 2]); // top == bottom
        assert!(w[0] < w[2 * 5 + 2]);
        // corner value: dist = sqrt(8), weight = 1/(sqrt(8)*2/5 + 1)
        assert_abs_diff_eq!(w[0], 1.0 / (8.0f64.sqrt() * 2.0 / 5.0 + 1.0), epsilon = 1e-12);
    }

    #[test]
    fn options_validation() {
        let mut f = FitFCFusor::new();
        let base = FitFCOptions {
            high_tag: "h".into(),
            low_tag: "l".into(),
            pair_date: Some(1),
            window_size: 3,
            ..FitFCOptions::default()
        };
        assert!(f.process_options(&base).is_ok());

        let mut o = base.clone();
        o.pair_date = None;
        assert!(f.process_options(&o).is_err());

        let mut o = base.clone();
        o.resolution_factor = 0;
        assert!(f.process_options(&o).is_err());

        let mut o = base;
        o.window_size = 2;
        assert!(f.process_options(&o).is_err());
    }
}
