//! STARFM: spatio-temporal adaptive reflectance fusion.
//!
//! For every output pixel a moving window is searched for spectrally
//! similar neighbors; the surviving candidates predict the center through a
//! combined distance/spectral/temporal weight. With two input pairs the two
//! per-pair predictions are blended by the amount of coarse change toward
//! the target date (less change, more trust).
//!
//! All filtering, weighting and prediction is channel-wise, so an
//! N-channel prediction equals N independent single-channel predictions.
//! The similarity thresholds and pair weights derive from full-image
//! statistics, which keeps the result independent of the tile partition.

use crate::preamble;
use crate::{DataFusor, PairDates, TileParallel};
use std::sync::Arc;
use stf_core::{dispatch_kind, Error, Image, MultiResImages, Rect, Result, Storable};
use stf_math::{masked_abs_diff_max, masked_abs_diff_sum, masked_mean_stddev};

/// Options of the [`StarfmFusor`].
#[derive(Debug, Clone)]
pub struct StarfmOptions {
    /// Tag of the fine-resolution images.
    pub high_tag: String,
    /// Tag of the coarse-resolution images.
    pub low_tag: String,
    /// One or two pair dates.
    pub pair_dates: PairDates,
    /// Prediction area; the all-zero sentinel means the full image.
    pub prediction_area: Rect,
    /// Moving-window side length, odd and >= 3.
    pub window_size: i32,
    /// Number of spectral classes used for the similarity threshold
    /// `2σ / classes`.
    pub number_classes: u32,
    /// Upper bound on the spectral difference |H − L| a candidate may have.
    pub spectral_uncertainty: f64,
    /// Upper bound on the temporal difference |L(pair) − L(target)| a
    /// candidate may have.
    pub temporal_uncertainty: f64,
    /// When a pair has exactly zero spectral (or temporal) difference over
    /// the whole image, copy the dominant term unchanged instead of
    /// weighting, avoiding division near zero.
    pub copy_on_zero_diff: bool,
}

impl Default for StarfmOptions {
    fn default() -> Self {
        Self {
            high_tag: String::new(),
            low_tag: String::new(),
            pair_dates: PairDates::Unset,
            prediction_area: Rect::default(),
            window_size: 51,
            number_classes: 40,
            spectral_uncertainty: 50.0,
            temporal_uncertainty: 50.0,
            copy_on_zero_diff: false,
        }
    }
}

/// The STARFM engine. See the [module documentation](self).
#[derive(Clone, Default)]
pub struct StarfmFusor {
    imgs: Option<Arc<MultiResImages>>,
    opt: StarfmOptions,
    output: Image,
}

impl StarfmFusor {
    /// Creates an engine with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies and validates the options.
    pub fn process_options(&mut self, o: &StarfmOptions) -> Result<()> {
        preamble::check_tags(&o.high_tag, &o.low_tag)?;
        preamble::check_window_size(o.window_size)?;
        if o.pair_dates == PairDates::Unset {
            return Err(Error::invalid_argument(
                "at least one pair date must be set before prediction",
            ));
        }
        if o.number_classes == 0 {
            return Err(Error::invalid_argument(
                "the number of classes must be positive",
            ));
        }
        if o.spectral_uncertainty <= 0.0 || o.temporal_uncertainty <= 0.0 {
            return Err(Error::invalid_argument(
                "spectral and temporal uncertainty must be positive",
            ));
        }
        self.opt = o.clone();
        Ok(())
    }

    /// The previously set options.
    pub fn options(&self) -> &StarfmOptions {
        &self.opt
    }
}

/// Per-pair, per-channel context shared by all window evaluations.
struct PairContext<'a> {
    high: &'a Image,
    low: &'a Image,
    /// Similarity threshold 2σ/classes per channel.
    tau: Vec<f64>,
    /// Σ|L(pair) − L(target)| per channel over the whole (masked) image.
    temporal_weight: Vec<f64>,
    /// Whether |H − L| is identically zero, per channel.
    spectral_zero: Vec<bool>,
    /// Whether |L(pair) − L(target)| is identically zero, per channel.
    temporal_zero: Vec<bool>,
}

impl DataFusor for StarfmFusor {
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
        let dates = self.opt.pair_dates.dates();
        if dates.is_empty() {
            return Err(Error::logic("predict called before process_options"));
        }

        let mut required: Vec<(&str, i32)> = Vec::new();
        for &d in &dates {
            required.push((self.opt.high_tag.as_str(), d));
            required.push((self.opt.low_tag.as_str(), d));
        }
        required.push((self.opt.low_tag.as_str(), date));
        let (size, kind, channels) = preamble::check_images_consistent(&imgs, &required)?;
        preamble::check_mask(mask, size, channels)?;
        let mask = preamble::single_channel_mask(mask)?;
        let mask = mask.as_ref();

        let pred_area = preamble::resolve_prediction_area(self.opt.prediction_area, size)?;
        preamble::ensure_output(&mut self.output, pred_area.size(), kind, channels)?;

        let low2 = imgs.get(&self.opt.low_tag, date)?;
        let mut pairs = Vec::with_capacity(dates.len());
        for &d in &dates {
            let high = imgs.get(&self.opt.high_tag, d)?;
            let low = imgs.get(&self.opt.low_tag, d)?;
            let mut ctx = PairContext {
                high,
                low,
                tau: Vec::with_capacity(channels as usize),
                temporal_weight: Vec::with_capacity(channels as usize),
                spectral_zero: Vec::with_capacity(channels as usize),
                temporal_zero: Vec::with_capacity(channels as usize),
            };
            for c in 0..channels {
                let (_, sigma, _) = masked_mean_stddev(high, mask, c);
                ctx.tau
                    .push(sigma * 2.0 / f64::from(self.opt.number_classes));
                ctx.temporal_weight
                    .push(masked_abs_diff_sum(low, low2, mask, c));
                ctx.spectral_zero
                    .push(masked_abs_diff_max(high, low, mask, c) == 0.0);
                ctx.temporal_zero
                    .push(masked_abs_diff_max(low, low2, mask, c) == 0.0);
            }
            pairs.push(ctx);
        }

        dispatch_kind!(kind, T => predict_kernel::<T>(
            &mut self.output,
            &pairs,
            low2,
            mask,
            pred_area,
            &self.opt,
        ));
        Ok(())
    }
}

impl TileParallel for StarfmFusor {
    fn prediction_area(&self) -> Rect {
        self.opt.prediction_area
    }

    fn set_prediction_area(&mut self, area: Rect) {
        self.opt.prediction_area = area;
    }
}

fn predict_kernel<T: Storable>(
    output: &mut Image,
    pairs: &[PairContext<'_>],
    low2: &Image,
    mask: Option<&Image>,
    pred_area: Rect,
    opt: &StarfmOptions,
) {
    let bounds = Rect::new(0, 0, low2.width(), low2.height());
    let half = opt.window_size / 2;
    let channels = low2.channels();

    for y in pred_area.y..pred_area.bottom() {
        for x in pred_area.x..pred_area.right() {
            if let Some(m) = mask {
                if !m.bool_at(x, y, 0) {
                    continue;
                }
            }
            let win = Rect::new(x - half, y - half, opt.window_size, opt.window_size)
                .intersect(&bounds);
            for c in 0..channels {
                let mut values = [0.0f64; 2];
                for (k, pair) in pairs.iter().enumerate() {
                    values[k] = predict_pair::<T>(pair, low2, mask, x, y, c, win, half, opt);
                }
                let v = match pairs.len() {
                    1 => values[0],
                    _ => {
                        let t1 = pairs[0].temporal_weight[c as usize];
                        let t3 = pairs[1].temporal_weight[c as usize];
                        if t1 + t3 > 0.0 {
                            (t3 * values[0] + t1 * values[1]) / (t1 + t3)
                        } else {
                            0.5 * (values[0] + values[1])
                        }
                    }
                };
                output.set_pixel::<T>(x - pred_area.x, y - pred_area.y, c, T::from_f64(v));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn predict_pair<T: Storable>(
    pair: &PairContext<'_>,
    low2: &Image,
    mask: Option<&Image>,
    x: i32,
    y: i32,
    c: u32,
    win: Rect,
    half: i32,
    opt: &StarfmOptions,
) -> f64 {
    if opt.copy_on_zero_diff && pair.spectral_zero[c as usize] {
        return low2.pixel::<T>(x, y, c).to_f64();
    }
    if opt.copy_on_zero_diff && pair.temporal_zero[c as usize] {
        return pair.high.pixel::<T>(x, y, c).to_f64();
    }

    let tau = pair.tau[c as usize];
    let center = pair.high.pixel::<T>(x, y, c).to_f64();
    let mut sum_w = 0.0;
    let mut sum_v = 0.0;
    for v in win.y..win.bottom() {
        for u in win.x..win.right() {
            if let Some(m) = mask {
                if !m.bool_at(u, v, 0) {
                    continue;
                }
            }
            let hv = pair.high.pixel::<T>(u, v, c).to_f64();
            if (hv - center).abs() > tau {
                continue;
            }
            let lv = pair.low.pixel::<T>(u, v, c).to_f64();
            let l2v = low2.pixel::<T>(u, v, c).to_f64();
            let spectral = (hv - lv).abs();
            let temporal = (lv - l2v).abs();
            if spectral >= opt.spectral_uncertainty || temporal >= opt.temporal_uncertainty {
                continue;
            }
            let dx = f64::from(u - x);
            let dy = f64::from(v - y);
            let dist = 1.0 + (dx * dx + dy * dy).sqrt() / f64::from(half);
            let w = 1.0 / ((spectral + 1.0) * (temporal + 1.0) * dist);
            sum_w += w;
            sum_v += w * (hv + l2v - lv);
        }
    }
    if sum_w > 0.0 {
        sum_v / sum_w
    } else {
        // no candidate survived: fall back to the central pixel
        let lv = pair.low.pixel::<T>(x, y, c).to_f64();
        let l2v = low2.pixel::<T>(x, y, c).to_f64();
        center + l2v - lv
    }
}
