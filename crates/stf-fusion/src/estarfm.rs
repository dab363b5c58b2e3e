//! ESTARFM: enhanced STARFM with local linear regression.
//!
//! Requires two fine/coarse pairs bracketing the target date. Candidate
//! neighbors must be spectrally similar to the center in *both* pair
//! images (intersection of the class tests); the central pixel itself is
//! always kept. Across the surviving neighbors and both pairs a per-channel
//! coarse→fine conversion slope is regressed, with fallbacks to the
//! identity when the fit is degenerate or untrustworthy (see
//! [`stf_math::regress_slope`]). The predictions from the two pairs are
//! blended by the amount of coarse change toward the target date.

use crate::preamble;
use crate::{DataFusor, TileParallel};
use std::sync::Arc;
use stf_core::{dispatch_kind, Error, Image, MultiResImages, Rect, Result, Storable};
use stf_math::{masked_abs_diff_sum, masked_mean_stddev, regress_slope};

/// Options of the [`EstarfmFusor`].
#[derive(Debug, Clone)]
pub struct EstarfmOptions {
    /// Tag of the fine-resolution images.
    pub high_tag: String,
    /// Tag of the coarse-resolution images.
    pub low_tag: String,
    /// Date of the first input pair.
    pub date1: Option<i32>,
    /// Date of the second input pair.
    pub date3: Option<i32>,
    /// Prediction area; the all-zero sentinel means the full image.
    pub prediction_area: Rect,
    /// Moving-window side length, odd and >= 3.
    pub window_size: i32,
    /// Number of spectral classes for the similarity threshold `2σ / classes`.
    pub number_classes: u32,
    /// Lower bound of the data range, used for clamping and for the
    /// uncertainty term. The range is inactive while `min >= max`.
    pub data_range_min: f64,
    /// Upper bound of the data range.
    pub data_range_max: f64,
    /// Scales the data-range span into the additive similarity uncertainty.
    pub uncertainty_factor: f64,
    /// Derive the similarity threshold from the window-local standard
    /// deviation instead of the global one.
    pub use_local_tolerance: bool,
    /// Blend regressed slopes toward 1 by their correlation quality instead
    /// of hard-failing poor fits.
    pub quality_weighted_regression: bool,
}

impl Default for EstarfmOptions {
    fn default() -> Self {
        Self {
            high_tag: String::new(),
            low_tag: String::new(),
            date1: None,
            date3: None,
            prediction_area: Rect::default(),
            window_size: 51,
            number_classes: 40,
            data_range_min: 0.0,
            data_range_max: 0.0,
            uncertainty_factor: 0.002,
            use_local_tolerance: false,
            quality_weighted_regression: false,
        }
    }
}

impl EstarfmOptions {
    fn data_range(&self) -> Option<(f64, f64)> {
        (self.data_range_min < self.data_range_max)
            .then_some((self.data_range_min, self.data_range_max))
    }
}

/// The ESTARFM engine. See the [module documentation](self).
#[derive(Clone, Default)]
pub struct EstarfmFusor {
    imgs: Option<Arc<MultiResImages>>,
    opt: EstarfmOptions,
    output: Image,
}

impl EstarfmFusor {
    /// Creates an engine with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies and validates the options.
    pub fn process_options(&mut self, o: &EstarfmOptions) -> Result<()> {
        preamble::check_tags(&o.high_tag, &o.low_tag)?;
        preamble::check_window_size(o.window_size)?;
        if o.date1.is_none() || o.date3.is_none() {
            return Err(Error::invalid_argument(
                "ESTARFM requires both pair dates to be set",
            ));
        }
        if o.number_classes == 0 {
            return Err(Error::invalid_argument(
                "the number of classes must be positive",
            ));
        }
        if o.uncertainty_factor < 0.0 {
            return Err(Error::invalid_argument(
                "the uncertainty factor must be non-negative",
            ));
        }
        self.opt = o.clone();
        Ok(())
    }

    /// The previously set options.
    pub fn options(&self) -> &EstarfmOptions {
        &self.opt
    }
}

struct EstarfmContext<'a> {
    high1: &'a Image,
    low1: &'a Image,
    high3: &'a Image,
    low3: &'a Image,
    low2: &'a Image,
    /// Global similarity thresholds per channel, one per pair.
    tau1: Vec<f64>,
    tau3: Vec<f64>,
    /// Additive uncertainty on the similarity thresholds.
    uncertainty: f64,
    /// Σ|L(pair) − L(target)| per channel, one per pair.
    temporal1: Vec<f64>,
    temporal3: Vec<f64>,
}

impl DataFusor for EstarfmFusor {
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
        let (Some(d1), Some(d3)) = (self.opt.date1, self.opt.date3) else {
            return Err(Error::logic("predict called before process_options"));
        };

        let required = [
            (self.opt.high_tag.as_str(), d1),
            (self.opt.low_tag.as_str(), d1),
            (self.opt.high_tag.as_str(), d3),
            (self.opt.low_tag.as_str(), d3),
            (self.opt.low_tag.as_str(), date),
        ];
        let (size, kind, channels) = preamble::check_images_consistent(&imgs, &required)?;
        preamble::check_mask(mask, size, channels)?;
        let mask = preamble::single_channel_mask(mask)?;
        let mask = mask.as_ref();

        let pred_area = preamble::resolve_prediction_area(self.opt.prediction_area, size)?;
        preamble::ensure_output(&mut self.output, pred_area.size(), kind, channels)?;

        let high1 = imgs.get(&self.opt.high_tag, d1)?;
        let low1 = imgs.get(&self.opt.low_tag, d1)?;
        let high3 = imgs.get(&self.opt.high_tag, d3)?;
        let low3 = imgs.get(&self.opt.low_tag, d3)?;
        let low2 = imgs.get(&self.opt.low_tag, date)?;

        let classes = f64::from(self.opt.number_classes);
        let uncertainty = self
            .opt
            .data_range()
            .map(|(lo, hi)| (hi - lo) * self.opt.uncertainty_factor)
            .unwrap_or(0.0);
        let mut ctx = EstarfmContext {
            high1,
            low1,
            high3,
            low3,
            low2,
            tau1: Vec::with_capacity(channels as usize),
            tau3: Vec::with_capacity(channels as usize),
            uncertainty,
            temporal1: Vec::with_capacity(channels as usize),
            temporal3: Vec::with_capacity(channels as usize),
        };
        for c in 0..channels {
            let (_, s1, _) = masked_mean_stddev(high1, mask, c);
            let (_, s3, _) = masked_mean_stddev(high3, mask, c);
            ctx.tau1.push(s1 * 2.0 / classes);
            ctx.tau3.push(s3 * 2.0 / classes);
            ctx.temporal1.push(masked_abs_diff_sum(low1, low2, mask, c));
            ctx.temporal3.push(masked_abs_diff_sum(low3, low2, mask, c));
        }

        dispatch_kind!(kind, T => predict_kernel::<T>(
            &mut self.output,
            &ctx,
            mask,
            pred_area,
            &self.opt,
        ));
        Ok(())
    }
}

impl TileParallel for EstarfmFusor {
    fn prediction_area(&self) -> Rect {
        self.opt.prediction_area
    }

    fn set_prediction_area(&mut self, area: Rect) {
        self.opt.prediction_area = area;
    }
}

/// Window-local sample standard deviation of one channel of `img`.
fn local_stddev<T: Storable>(img: &Image, win: Rect, c: u32, mask: Option<&Image>) -> f64 {
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0u32;
    for v in win.y..win.bottom() {
        for u in win.x..win.right() {
            if let Some(m) = mask {
                if !m.bool_at(u, v, 0) {
                    continue;
                }
            }
            let val = img.pixel::<T>(u, v, c).to_f64();
            sum += val;
            sum_sq += val * val;
            n += 1;
        }
    }
    if n < 2 {
        return 0.0;
    }
    let nf = f64::from(n);
    ((sum_sq - sum * sum / nf) / (nf - 1.0)).max(0.0).sqrt()
}

fn predict_kernel<T: Storable>(
    output: &mut Image,
    ctx: &EstarfmContext<'_>,
    mask: Option<&Image>,
    pred_area: Rect,
    opt: &EstarfmOptions,
) {
    let bounds = Rect::new(0, 0, ctx.low2.width(), ctx.low2.height());
    let half = opt.window_size / 2;
    let channels = ctx.low2.channels() as usize;
    let classes = f64::from(opt.number_classes);
    let range = opt.data_range();

    let mut similar: Vec<(i32, i32)> = Vec::new();
    let mut xs: Vec<f64> = Vec::new();
    let mut ys: Vec<f64> = Vec::new();

    for y in pred_area.y..pred_area.bottom() {
        for x in pred_area.x..pred_area.right() {
            if let Some(m) = mask {
                if !m.bool_at(x, y, 0) {
                    continue;
                }
            }
            let win = Rect::new(x - half, y - half, opt.window_size, opt.window_size)
                .intersect(&bounds);

            // similarity thresholds for this window
            let mut tau1 = vec![0.0; channels];
            let mut tau3 = vec![0.0; channels];
            for c in 0..channels {
                if opt.use_local_tolerance {
                    tau1[c] = local_stddev::<T>(ctx.high1, win, c as u32, mask) * 2.0 / classes
                        + ctx.uncertainty;
                    tau3[c] = local_stddev::<T>(ctx.high3, win, c as u32, mask) * 2.0 / classes
                        + ctx.uncertainty;
                } else {
                    tau1[c] = ctx.tau1[c] + ctx.uncertainty;
                    tau3[c] = ctx.tau3[c] + ctx.uncertainty;
                }
            }

            // class search, intersected across both pairs; the center is
            // always part of the set
            similar.clear();
            for v in win.y..win.bottom() {
                'candidates: for u in win.x..win.right() {
                    if u == x && v == y {
                        continue;
                    }
                    if let Some(m) = mask {
                        if !m.bool_at(u, v, 0) {
                            continue;
                        }
                    }
                    for c in 0..channels {
                        let d1 = ctx.high1.pixel::<T>(u, v, c as u32).to_f64()
                            - ctx.high1.pixel::<T>(x, y, c as u32).to_f64();
                        if d1.abs() > tau1[c] {
                            continue 'candidates;
                        }
                        let d3 = ctx.high3.pixel::<T>(u, v, c as u32).to_f64()
                            - ctx.high3.pixel::<T>(x, y, c as u32).to_f64();
                        if d3.abs() > tau3[c] {
                            continue 'candidates;
                        }
                    }
                    similar.push((u, v));
                }
            }
            similar.push((x, y));

            // inverse spectral-and-geometric weights, shared by both pairs
            let mut weights = vec![0.0f64; similar.len() * channels];
            for (i, &(u, v)) in similar.iter().enumerate() {
                let dx = f64::from(u - x);
                let dy = f64::from(v - y);
                let dist = 1.0 + (dx * dx + dy * dy).sqrt() / f64::from(half);
                for c in 0..channels {
                    let s1 = (ctx.high1.pixel::<T>(u, v, c as u32).to_f64()
                        - ctx.low1.pixel::<T>(u, v, c as u32).to_f64())
                    .abs();
                    let s3 = (ctx.high3.pixel::<T>(u, v, c as u32).to_f64()
                        - ctx.low3.pixel::<T>(u, v, c as u32).to_f64())
                    .abs();
                    weights[i * channels + c] = 1.0 / ((0.5 * (s1 + s3) + 1.0) * dist);
                }
            }

            for c in 0..channels {
                // coarse-to-fine conversion slope across neighbors and pairs
                xs.clear();
                ys.clear();
                for &(u, v) in &similar {
                    xs.push(ctx.low1.pixel::<T>(u, v, c as u32).to_f64());
                    ys.push(ctx.high1.pixel::<T>(u, v, c as u32).to_f64());
                    xs.push(ctx.low3.pixel::<T>(u, v, c as u32).to_f64());
                    ys.push(ctx.high3.pixel::<T>(u, v, c as u32).to_f64());
                }
                let slope = regress_slope(&xs, &ys, opt.quality_weighted_regression);

                let w_sum: f64 = similar
                    .iter()
                    .enumerate()
                    .map(|(i, _)| weights[i * channels + c])
                    .sum();

                let mut delta1 = 0.0;
                let mut delta3 = 0.0;
                for (i, &(u, v)) in similar.iter().enumerate() {
                    let w = weights[i * channels + c] / w_sum;
                    let l2v = ctx.low2.pixel::<T>(u, v, c as u32).to_f64();
                    delta1 += w * (l2v - ctx.low1.pixel::<T>(u, v, c as u32).to_f64());
                    delta3 += w * (l2v - ctx.low3.pixel::<T>(u, v, c as u32).to_f64());
                }
                let v1 = ctx.high1.pixel::<T>(x, y, c as u32).to_f64() + slope * delta1;
                let v3 = ctx.high3.pixel::<T>(x, y, c as u32).to_f64() + slope * delta3;

                let t1 = ctx.temporal1[c];
                let t3 = ctx.temporal3[c];
                let mut value = if t1 + t3 > 0.0 {
                    (t3 * v1 + t1 * v3) / (t1 + t3)
                } else {
                    0.5 * (v1 + v3)
                };
                if let Some((lo, hi)) = range {
                    value = value.clamp(lo, hi);
                }
                output.set_pixel::<T>(
                    x - pred_area.x,
                    y - pred_area.y,
                    c as u32,
                    T::from_f64(value),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stf_core::PixelKind;

    fn image(w: i32, h: i32, f: impl Fn(i32, i32) -> f64) -> Image {
        let mut img = Image::new(w, h, PixelKind::F32, 1).unwrap();
        for y in 0..h {
            for x in 0..w {
                img.set_pixel::<f32>(x, y, 0, f(x, y) as f32);
            }
        }
        img
    }

    fn options() -> EstarfmOptions {
        EstarfmOptions {
            high_tag: "high".into(),
            low_tag: "low".into(),
            date1: Some(1),
            date3: Some(3),
            window_size: 5,
            ..EstarfmOptions::default()
        }
    }

    #[test]
    fn both_dates_required() {
        let mut f = EstarfmFusor::new();
        let mut o = options();
        o.date3 = None;
        assert!(f.process_options(&o).is_err());
    }

    #[test]
    fn unchanged_scene_is_reproduced() {
        // identical pairs and an unchanged coarse scene: the prediction
        // must reproduce the fine scene
        let fine = image(9, 9, |x, y| 100.0 + (3 * x + 7 * y) as f64);
        let coarse = image(9, 9, |x, y| 50.0 + (3 * x + 7 * y) as f64);
        let mut imgs = MultiResImages::new();
        imgs.set("high", 1, fine.shared_copy());
        imgs.set("low", 1, coarse.shared_copy());
        imgs.set("high", 3, fine.shared_copy());
        imgs.set("low", 3, coarse.shared_copy());
        imgs.set("low", 2, coarse.shared_copy());

        let mut f = EstarfmFusor::new();
        f.set_src_images(Arc::new(imgs));
        f.process_options(&options()).unwrap();
        f.predict(2, None).unwrap();

        for y in 0..9 {
            for x in 0..9 {
                let got = f.output().pixel::<f32>(x, y, 0);
                let want = fine.pixel::<f32>(x, y, 0);
                assert!((got - want).abs() < 1e-3, "({x},{y}): {got} vs {want}");
            }
        }
    }

    #[test]
    fn five_channel_inputs_are_accepted() {
        let mut imgs = MultiResImages::new();
        for (tag, date) in [("high", 1), ("low", 1), ("high", 3), ("low", 3), ("low", 2)] {
            let mut img = Image::new(8, 8, PixelKind::U16, 5).unwrap();
            for c in 0..5 {
                for y in 0..8 {
                    for x in 0..8 {
                        img.set_pixel::<u16>(x, y, c, (10 * x + y + date + c as i32 * 3) as u16);
                    }
                }
            }
            imgs.set(tag, date, img);
        }

        let mut f = EstarfmFusor::new();
        f.set_src_images(Arc::new(imgs));
        f.process_options(&options()).unwrap();
        f.predict(2, None).unwrap();
        assert_eq!(f.output().channels(), 5);
    }
}
