//! SPSTFM: sparse-representation fusion over a jointly trained dictionary
//! pair.
//!
//! Training samples are patches of the pair-difference images
//! `H(d3) − H(d1)` and `L(d3) − L(d1)`. A concatenated dictionary holds
//! paired high/low-resolution atoms, so one sparse code reconstructs both
//! resolutions: codes are found with [GPSR-BB](gpsr), atoms are updated
//! with [K-SVD](ksvd). At prediction time the coarse difference patches
//! toward the target date are coded against the low-resolution block and
//! the high-resolution block predicts the fine difference, which is added
//! onto the fine pair image and blended across the two pair dates.
//!
//! The engine deliberately does not implement
//! [`TileParallel`](crate::TileParallel): the trained dictionary is global
//! context, so tile-splitting would change the result. Heavy stages (sparse
//! coding of samples and patches) parallelize internally instead.
//!
//! The trained dictionary is engine state: it can be extracted with
//! [`SpstfmFusor::dictionary`], injected with
//! [`SpstfmFusor::set_dictionary`], and reused across predictions via
//! [`DictionaryReuse`].

pub mod gpsr;
pub mod ksvd;
pub mod patch;

mod reconstruct;
mod sampling;
mod trainer;

pub use gpsr::GpsrOptions;
pub use trainer::TrainingTrace;

use crate::preamble;
use crate::DataFusor;
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use reconstruct::{init_weights_from_build_up, init_weights_from_diff, ChannelReconstruction};
use std::sync::Arc;
use stf_core::{Error, Image, MultiResImages, PixelKind, Rect, Result};
use trainer::{compute_channel_stats, normalize_init_dict, train_channel, ChannelStats};

/// How training patches are picked from the candidate positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingStrategy {
    /// Uniformly random order.
    Random,
    /// Descending combined high+low standard deviation.
    #[default]
    Variance,
}

/// What to do with a dictionary left over from an earlier call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DictionaryReuse {
    /// Start from a fresh dictionary initialized from the samples.
    #[default]
    Clear,
    /// Use the existing dictionary as the starting point and train on.
    Improve,
    /// Use the existing dictionary as is, without training.
    Use,
}

/// The error measure evaluated per training iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingStopFunction {
    /// Objective with the per-sample τ.
    #[default]
    Objective,
    /// Objective with the maximum τ.
    ObjectiveMaxTau,
    /// Reconstruction error over the random test set.
    TestSetError,
    /// Reconstruction error over the training set (needs low-resolution
    /// sparse coding).
    TrainSetError,
}

/// Which resolution drives sparse coding, atom updates or the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingResolution {
    /// The high-resolution block.
    High,
    /// The low-resolution block.
    #[default]
    Low,
    /// The concatenated matrix.
    Concat,
    /// Both blocks separately, results averaged.
    Average,
}

/// How the stop-function value is compared against the tolerance ε.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingStopCondition {
    /// `E < ε`
    ValueLess,
    /// `|E_prev − E| < ε`
    AbsChangeLess,
    /// `|E_prev − E| / |E_prev| < ε`
    AbsRelChangeLess,
    /// `E_prev − E < ε`
    #[default]
    ChangeLess,
    /// `(E_prev − E) / E_prev < ε`
    RelChangeLess,
}

/// The error set deciding which dictionary snapshot survives training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BestShotErrorSet {
    /// Keep the dictionary of the last iteration.
    None,
    /// Keep the snapshot with the lowest test-set error.
    TestSet,
    /// Keep the snapshot with the lowest training-set error.
    #[default]
    TrainSet,
}

/// How samples are shifted/scaled before training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleNormalization {
    /// No normalization.
    #[default]
    None,
    /// Use the high-resolution difference statistics for both blocks.
    High,
    /// Use the low-resolution difference statistics for both blocks.
    Low,
    /// Each block uses its own statistics. This lets the dictionary cope
    /// with differing dynamic ranges across the resolutions.
    Separate,
}

/// Atom scale handling at initialization and in the K-SVD update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DictionaryNormalization {
    /// Keep scales; the singular value goes into the atom.
    None,
    /// Scale all atoms by the norm of the first high-resolution atom,
    /// preserving the ratios between atoms.
    Fixed,
    /// Unit-norm every atom; the singular value goes into the coefficients.
    #[default]
    Independent,
    /// Scale each atom pair by the larger of the two norms, preserving the
    /// in-pair ratio.
    Pairwise,
}

/// Options of the [`SpstfmFusor`].
#[derive(Debug, Clone)]
pub struct SpstfmOptions {
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
    /// Side length P of the square patches, at least 2.
    pub patch_size: u32,
    /// Patch overlap, at most P/2.
    pub patch_overlap: u32,
    /// Number of atoms in the dictionary.
    pub dict_size: u32,
    /// Number of training samples drawn per channel.
    pub number_training_samples: u32,
    /// Minimum training iterations before the stop condition applies.
    pub min_train_iter: u32,
    /// Maximum training iterations; 0 disables training entirely.
    pub max_train_iter: u32,
    /// How training patches are ordered.
    pub sampling_strategy: SamplingStrategy,
    /// Tolerated fraction of invalid pixels per training patch.
    pub invalid_pixel_tolerance: f64,
    /// Handling of a dictionary kept from an earlier call.
    pub dictionary_reuse: DictionaryReuse,
    /// Error measure evaluated per training iteration.
    pub training_stop_function: TrainingStopFunction,
    /// Resolution of the objective stop functions.
    pub training_stop_resolution: TrainingResolution,
    /// Comparison of the stop value against the tolerance.
    pub training_stop_condition: TrainingStopCondition,
    /// Stop tolerance ε.
    pub training_stop_tolerance: f64,
    /// Number of random test samples for the test-set error.
    pub training_stop_test_samples: u32,
    /// Which snapshot of the dictionary survives training.
    pub best_shot_error_set: BestShotErrorSet,
    /// Resolution used for sparse coding during training.
    pub sparse_coeff_resolution: TrainingResolution,
    /// Resolution driving the coefficient update inside K-SVD.
    pub column_update_resolution: TrainingResolution,
    /// Use updated atoms and coefficients within one K-SVD sweep.
    pub ksvd_online_mode: bool,
    /// Atom normalization at dictionary initialization.
    pub dict_init_normalization: DictionaryNormalization,
    /// Atom normalization inside the K-SVD update.
    pub dict_ksvd_normalization: DictionaryNormalization,
    /// Mean subtraction of the samples.
    pub subtract_mean: SampleNormalization,
    /// Factor division of the samples.
    pub divide_normalization: SampleNormalization,
    /// Use the standard deviation (true) or the variance (false) as the
    /// division factor.
    pub stddev_normalization: bool,
    /// GPSR options of the training stage.
    pub gpsr_training: GpsrOptions,
    /// GPSR options of the reconstruction stage.
    pub gpsr_reconstruction: GpsrOptions,
    /// δ of the pair-weight rule: beyond this change difference the quieter
    /// side wins outright.
    pub weights_diff_tolerance: f64,
    /// Derive pair weights from build-up-index changes instead of raw
    /// differences (needs red/NIR/SWIR channels).
    pub use_build_up_index_weights: bool,
    /// Channel order (red, NIR, SWIR) for the build-up index.
    pub red_nir_swir_order: [u32; 3],
    /// Build-up classification threshold in [-1, 1].
    pub build_up_threshold: f64,
    /// Seed of the sampling randomness; device entropy when unset.
    pub random_seed: Option<u64>,
    /// Record the per-iteration stop-function values in the training trace.
    pub record_training_stats: bool,
}

impl Default for SpstfmOptions {
    fn default() -> Self {
        Self {
            high_tag: String::new(),
            low_tag: String::new(),
            date1: None,
            date3: None,
            prediction_area: Rect::default(),
            patch_size: 7,
            patch_overlap: 2,
            dict_size: 256,
            number_training_samples: 2000,
            min_train_iter: 10,
            max_train_iter: 20,
            sampling_strategy: SamplingStrategy::Variance,
            invalid_pixel_tolerance: 0.15,
            dictionary_reuse: DictionaryReuse::Clear,
            training_stop_function: TrainingStopFunction::Objective,
            training_stop_resolution: TrainingResolution::Low,
            training_stop_condition: TrainingStopCondition::ChangeLess,
            training_stop_tolerance: 1e-10,
            training_stop_test_samples: 4000,
            best_shot_error_set: BestShotErrorSet::TrainSet,
            sparse_coeff_resolution: TrainingResolution::Low,
            column_update_resolution: TrainingResolution::Low,
            ksvd_online_mode: true,
            dict_init_normalization: DictionaryNormalization::Independent,
            dict_ksvd_normalization: DictionaryNormalization::Independent,
            subtract_mean: SampleNormalization::None,
            divide_normalization: SampleNormalization::Separate,
            stddev_normalization: true,
            gpsr_training: GpsrOptions::training_defaults(),
            gpsr_reconstruction: GpsrOptions::reconstruction_defaults(),
            weights_diff_tolerance: 0.2,
            use_build_up_index_weights: false,
            red_nir_swir_order: [0, 1, 2],
            build_up_threshold: 0.0,
            random_seed: None,
            record_training_stats: false,
        }
    }
}

/// The SPSTFM engine. See the [module documentation](self).
#[derive(Default)]
pub struct SpstfmFusor {
    imgs: Option<Arc<MultiResImages>>,
    opt: SpstfmOptions,
    output: Image,
    dicts: Vec<Option<DMatrix<f64>>>,
    stats: Vec<ChannelStats>,
    trace: TrainingTrace,
}

impl SpstfmFusor {
    /// Creates an engine with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies and validates the options.
    pub fn process_options(&mut self, o: &SpstfmOptions) -> Result<()> {
        preamble::check_tags(&o.high_tag, &o.low_tag)?;
        if o.date1.is_none() || o.date3.is_none() {
            return Err(Error::invalid_argument(
                "SPSTFM requires both pair dates to be set",
            ));
        }
        if o.patch_size < 2 {
            return Err(Error::invalid_argument(format!(
                "patch size must be at least 2, got {}",
                o.patch_size
            )));
        }
        if o.patch_overlap > o.patch_size / 2 {
            return Err(Error::invalid_argument(format!(
                "patch overlap {} exceeds half the patch size {}",
                o.patch_overlap, o.patch_size
            )));
        }
        if o.dict_size == 0 {
            return Err(Error::invalid_argument("dictionary size must be positive"));
        }
        if o.number_training_samples == 0 {
            return Err(Error::invalid_argument(
                "the number of training samples must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&o.invalid_pixel_tolerance) {
            return Err(Error::invalid_argument(
                "the invalid pixel tolerance must lie in [0, 1]",
            ));
        }
        if !(-1.0..=1.0).contains(&o.build_up_threshold) {
            return Err(Error::invalid_argument(
                "the build-up threshold must lie in [-1, 1]",
            ));
        }
        for g in [&o.gpsr_training, &o.gpsr_reconstruction] {
            if g.tol_a < 0.0 || g.tol_d < 0.0 {
                return Err(Error::invalid_argument(
                    "GPSR tolerances must be non-negative",
                ));
            }
        }
        let needs_low = o.training_stop_function == TrainingStopFunction::TrainSetError
            || o.best_shot_error_set == BestShotErrorSet::TrainSet;
        if needs_low && o.sparse_coeff_resolution != TrainingResolution::Low {
            return Err(Error::invalid_argument(
                "the training-set error is only available with low-resolution sparse coding",
            ));
        }
        self.opt = o.clone();
        Ok(())
    }

    /// The previously set options.
    pub fn options(&self) -> &SpstfmOptions {
        &self.opt
    }

    /// The trained concatenated dictionary of `channel`, if one exists.
    ///
    /// Head rows hold the high-resolution atoms, tail rows the
    /// low-resolution atoms; each column is one paired atom.
    pub fn dictionary(&self, channel: usize) -> Option<&DMatrix<f64>> {
        self.dicts.get(channel).and_then(|d| d.as_ref())
    }

    /// Installs a (pre-trained) concatenated dictionary for `channel`.
    pub fn set_dictionary(&mut self, channel: usize, dict: DMatrix<f64>) {
        if self.dicts.len() <= channel {
            self.dicts.resize(channel + 1, None);
        }
        self.dicts[channel] = Some(dict);
    }

    /// The per-iteration stop-function values of the last training run
    /// (populated when `record_training_stats` is set).
    pub fn training_trace(&self) -> &TrainingTrace {
        &self.trace
    }

    fn check_masks(
        &self,
        size: stf_core::Size,
        channels: u32,
        valid_mask: Option<&Image>,
        pred_mask: Option<&Image>,
    ) -> Result<()> {
        preamble::check_mask(valid_mask, size, channels)?;
        if let Some(pm) = pred_mask {
            if pm.size() != size {
                return Err(Error::size(
                    format!("prediction mask size {} differs from {size}", pm.size()),
                    Some(pm.size()),
                ));
            }
            if pm.kind() != PixelKind::U8 || pm.channels() != 1 {
                return Err(Error::image_kind(
                    "the prediction mask must be a single-channel u8 mask".to_string(),
                    Some(pm.kind()),
                ));
            }
        }
        Ok(())
    }

    /// Trains the dictionary pair without reconstructing afterwards.
    ///
    /// The dictionary can then be extracted with
    /// [`dictionary`](Self::dictionary) or reused by a later
    /// [`predict`](DataFusor::predict) with [`DictionaryReuse::Use`].
    pub fn train(&mut self, valid_mask: Option<&Image>, pred_mask: Option<&Image>) -> Result<()> {
        let imgs = self
            .imgs
            .clone()
            .ok_or_else(|| Error::logic("train called before set_src_images"))?;
        let (Some(d1), Some(d3)) = (self.opt.date1, self.opt.date3) else {
            return Err(Error::logic("train called before process_options"));
        };
        let required = [
            (self.opt.high_tag.as_str(), d1),
            (self.opt.low_tag.as_str(), d1),
            (self.opt.high_tag.as_str(), d3),
            (self.opt.low_tag.as_str(), d3),
        ];
        let (size, _, channels) = preamble::check_images_consistent(&imgs, &required)?;
        self.check_masks(size, channels, valid_mask, pred_mask)?;
        self.train_impl(&imgs, valid_mask, pred_mask)
    }

    fn train_impl(
        &mut self,
        imgs: &MultiResImages,
        valid_mask: Option<&Image>,
        pred_mask: Option<&Image>,
    ) -> Result<()> {
        let _ = pred_mask; // restricts reconstruction, not sampling
        let (d1, d3) = match (self.opt.date1, self.opt.date3) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(Error::logic("pair dates missing")),
        };
        let high1 = imgs.get(&self.opt.high_tag, d1)?;
        let high3 = imgs.get(&self.opt.high_tag, d3)?;
        let low1 = imgs.get(&self.opt.low_tag, d1)?;
        let low3 = imgs.get(&self.opt.low_tag, d3)?;
        let channels = high1.channels();

        self.trace.clear();
        self.stats = vec![ChannelStats::default(); channels as usize];
        if self.dicts.len() < channels as usize {
            self.dicts.resize(channels as usize, None);
        }

        let high_diff = diff_image(high3, high1)?;
        let low_diff = diff_image(low3, low1)?;

        let pred_area =
            preamble::resolve_prediction_area(self.opt.prediction_area, high1.size())?;
        let sample_area =
            patch::calc_required_area(pred_area, self.opt.patch_size, self.opt.patch_overlap);

        let mut rng = match self.opt.random_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        let dim = (self.opt.patch_size * self.opt.patch_size) as usize;
        for c in 0..channels {
            let stats = compute_channel_stats(&high_diff, &low_diff, valid_mask, c, &self.opt);
            self.stats[c as usize] = stats;

            let have_dict = self.dicts[c as usize]
                .as_ref()
                .is_some_and(|d| d.nrows() == 2 * dim && d.ncols() == self.opt.dict_size as usize);
            if self.opt.dictionary_reuse == DictionaryReuse::Use && have_dict {
                continue;
            }

            let indices = sampling::ordered_patch_indices(
                self.opt.sampling_strategy,
                &high_diff,
                &low_diff,
                valid_mask,
                self.opt.invalid_pixel_tolerance,
                self.opt.patch_size,
                self.opt.patch_overlap,
                sample_area,
                c,
                &mut rng,
            )?;
            let n_train = (self.opt.number_training_samples as usize).min(indices.len());
            let keep_dict = self.opt.dictionary_reuse == DictionaryReuse::Improve && have_dict;
            if !keep_dict && n_train < self.opt.dict_size as usize {
                return Err(Error::invalid_argument(format!(
                    "only {n_train} usable training patches for a dictionary of {} atoms",
                    self.opt.dict_size
                )));
            }

            let build = |idx: &[usize]| {
                sampling::build_samples(
                    &high_diff,
                    &low_diff,
                    valid_mask,
                    idx,
                    stats.mean_high,
                    stats.mean_low,
                    stats.norm_high,
                    stats.norm_low,
                    stats.fill_high,
                    stats.fill_low,
                    self.opt.patch_size,
                    self.opt.patch_overlap,
                    sample_area,
                    c,
                )
            };
            let samples = build(&indices[..n_train])?;

            let needs_validation = self.opt.training_stop_function
                == TrainingStopFunction::TestSetError
                || self.opt.best_shot_error_set == BestShotErrorSet::TestSet
                || self.opt.record_training_stats;
            let validation = if needs_validation && self.opt.training_stop_test_samples > 0 {
                let mut rest: Vec<usize> = indices[n_train..].to_vec();
                use rand::seq::SliceRandom;
                rest.shuffle(&mut rng);
                rest.truncate(self.opt.training_stop_test_samples as usize);
                if rest.is_empty() {
                    None
                } else {
                    Some(build(&rest)?)
                }
            } else {
                None
            };

            let mut dict = if keep_dict {
                self.dicts[c as usize]
                    .take()
                    .unwrap_or_else(|| unreachable!("checked by have_dict"))
            } else {
                let mut d = DMatrix::zeros(2 * dim, self.opt.dict_size as usize);
                for k in 0..self.opt.dict_size as usize {
                    d.set_column(k, &samples.column(k).into_owned());
                }
                normalize_init_dict(&mut d, self.opt.dict_init_normalization);
                d
            };

            train_channel(
                &mut dict,
                &samples,
                validation.as_ref(),
                stats.norm_high,
                &self.opt,
                &mut self.trace,
            )?;
            self.dicts[c as usize] = Some(dict);
        }
        Ok(())
    }

    /// Predicts with an additional prediction mask restricting which
    /// patches are reconstructed (a patch is skipped only when every one of
    /// its pixels is masked out).
    pub fn predict_masked(
        &mut self,
        date: i32,
        valid_mask: Option<&Image>,
        pred_mask: Option<&Image>,
    ) -> Result<()> {
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
        self.check_masks(size, channels, valid_mask, pred_mask)?;

        // training is skipped per channel when a reusable dictionary exists
        self.train_impl(&imgs, valid_mask, pred_mask)?;

        let pred_area = preamble::resolve_prediction_area(self.opt.prediction_area, size)?;
        preamble::ensure_output(&mut self.output, pred_area.size(), kind, channels)?;
        let sample_area =
            patch::calc_required_area(pred_area, self.opt.patch_size, self.opt.patch_overlap);

        let high1 = imgs.get(&self.opt.high_tag, d1)?;
        let high3 = imgs.get(&self.opt.high_tag, d3)?;
        let low1 = imgs.get(&self.opt.low_tag, d1)?;
        let low3 = imgs.get(&self.opt.low_tag, d3)?;
        let low2 = imgs.get(&self.opt.low_tag, date)?;

        let shared_weights = if self.opt.use_build_up_index_weights && channels >= 3 {
            Some(init_weights_from_build_up(
                low1,
                low2,
                low3,
                self.opt.red_nir_swir_order,
                self.opt.build_up_threshold,
                self.opt.patch_size,
                self.opt.patch_overlap,
                sample_area,
                self.opt.weights_diff_tolerance,
            )?)
        } else {
            None
        };

        for c in 0..channels {
            let stats = self.stats[c as usize];
            let fill21 = masked_diff_mean(low2, low1, valid_mask, c);
            let fill23 = masked_diff_mean(low2, low3, valid_mask, c);
            let per_channel_weights;
            let weights = match &shared_weights {
                Some(w) => w,
                None => {
                    per_channel_weights = init_weights_from_diff(
                        low1,
                        low2,
                        low3,
                        valid_mask,
                        self.opt.patch_size,
                        self.opt.patch_overlap,
                        sample_area,
                        c,
                        self.opt.weights_diff_tolerance,
                    )?;
                    &per_channel_weights
                }
            };
            let dict = self.dicts[c as usize]
                .as_ref()
                .ok_or_else(|| Error::logic("prediction requires a trained dictionary"))?;

            let job = ChannelReconstruction {
                high1,
                high3,
                low1,
                low2,
                low3,
                valid_mask,
                write_mask: pred_mask,
                dict,
                weights,
                stats,
                fill21,
                fill23,
                gpsr: self.opt.gpsr_reconstruction,
                patch_size: self.opt.patch_size,
                overlap: self.opt.patch_overlap,
                sample_area,
                pred_area,
                channel: c,
            };
            job.run(&mut self.output)?;
        }
        Ok(())
    }
}

impl DataFusor for SpstfmFusor {
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
        self.predict_masked(date, mask, None)
    }
}

/// Materializes `a − b` as a 64-bit float image with the same channels.
fn diff_image(a: &Image, b: &Image) -> Result<Image> {
    let (w, h, ch) = (a.width(), a.height(), a.channels());
    let mut out = Image::new(w, h, PixelKind::F64, ch)?;
    for y in 0..h {
        for x in 0..w {
            for c in 0..ch {
                out.set_pixel::<f64>(x, y, c, a.value(x, y, c) - b.value(x, y, c));
            }
        }
    }
    Ok(out)
}

/// Mean of `a − b` over the valid pixels of one channel.
fn masked_diff_mean(a: &Image, b: &Image, mask: Option<&Image>, channel: u32) -> f64 {
    let mut sum = 0.0;
    let mut n = 0u64;
    for y in 0..a.height() {
        for x in 0..a.width() {
            if let Some(m) = mask {
                if !m.bool_at(x, y, patch::mask_channel(m, channel)) {
                    continue;
                }
            }
            sum += a.value(x, y, channel) - b.value(x, y, channel);
            n += 1;
        }
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_validation() {
        let mut f = SpstfmFusor::new();
        let base = SpstfmOptions {
            high_tag: "h".into(),
            low_tag: "l".into(),
            date1: Some(1),
            date3: Some(3),
            ..SpstfmOptions::default()
        };
        assert!(f.process_options(&base).is_ok());

        let mut o = base.clone();
        o.patch_size = 1;
        assert!(f.process_options(&o).is_err());

        let mut o = base.clone();
        o.patch_overlap = 4; // more than 7 / 2
        assert!(f.process_options(&o).is_err());

        let mut o = base.clone();
        o.date1 = None;
        assert!(f.process_options(&o).is_err());

        let mut o = base.clone();
        o.sparse_coeff_resolution = TrainingResolution::Concat;
        // default best shot uses the training set, which needs low codes
        assert!(f.process_options(&o).is_err());
        o.best_shot_error_set = BestShotErrorSet::None;
        o.training_stop_function = TrainingStopFunction::Objective;
        assert!(f.process_options(&o).is_ok());

        let mut o = base;
        o.invalid_pixel_tolerance = 1.5;
        assert!(f.process_options(&o).is_err());
    }

    #[test]
    fn dictionary_roundtrip() {
        let mut f = SpstfmFusor::new();
        assert!(f.dictionary(0).is_none());
        let d = DMatrix::from_element(8, 4, 0.25);
        f.set_dictionary(2, d.clone());
        assert!(f.dictionary(0).is_none());
        assert_eq!(f.dictionary(2), Some(&d));
    }
}
