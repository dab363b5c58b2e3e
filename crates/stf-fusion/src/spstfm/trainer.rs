//! Dictionary training: sample normalization, sparse coding of the training
//! set, K-SVD sweeps and the stop machinery.

use super::gpsr::gpsr;
use super::ksvd::{double_ksvd, ksvd};
use super::{
    BestShotErrorSet, DictionaryNormalization, SampleNormalization, SpstfmOptions,
    TrainingResolution, TrainingStopCondition, TrainingStopFunction,
};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use stf_core::{Image, Result};
use tracing::debug;

/// Recorded per-iteration stop-function values of one training run.
#[derive(Debug, Default, Clone)]
pub struct TrainingTrace {
    /// Objective with per-sample τ.
    pub objective: Vec<f64>,
    /// Objective with the maximum τ.
    pub objective_max_tau: Vec<f64>,
    /// Training-set reconstruction error (only with low-resolution codes).
    pub train_set_error: Vec<f64>,
    /// Test-set reconstruction error (only when a test set was drawn).
    pub test_set_error: Vec<f64>,
}

impl TrainingTrace {
    pub(crate) fn clear(&mut self) {
        self.objective.clear();
        self.objective_max_tau.clear();
        self.train_set_error.clear();
        self.test_set_error.clear();
    }
}

/// Per-channel normalization constants, derived from the difference images.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChannelStats {
    /// Subtracted from high samples before scaling.
    pub mean_high: f64,
    /// Subtracted from low samples before scaling.
    pub mean_low: f64,
    /// High samples divide by this factor.
    pub norm_high: f64,
    /// Low samples divide by this factor.
    pub norm_low: f64,
    /// Fill value for invalid pixels of high difference patches.
    pub fill_high: f64,
    /// Fill value for invalid pixels of low difference patches.
    pub fill_low: f64,
}

/// Derives the normalization constants of one channel from the pair
/// difference images.
pub(crate) fn compute_channel_stats(
    high_diff: &Image,
    low_diff: &Image,
    mask: Option<&Image>,
    channel: u32,
    opt: &SpstfmOptions,
) -> ChannelStats {
    let moments = |img: &Image| -> (f64, f64) {
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut n = 0u64;
        for y in 0..img.height() {
            for x in 0..img.width() {
                if let Some(m) = mask {
                    if !m.bool_at(x, y, super::patch::mask_channel(m, channel)) {
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
            return (0.0, 0.0);
        }
        let mean = sum / n as f64;
        if n < 2 {
            return (mean, 0.0);
        }
        let var = (sum_sq - sum * sum / n as f64) / (n as f64 - 1.0);
        (mean, var.max(0.0).sqrt())
    };
    let (h_mean, h_sd) = moments(high_diff);
    let (l_mean, l_sd) = moments(low_diff);

    let (h_factor, l_factor) = if opt.stddev_normalization {
        (h_sd, l_sd)
    } else {
        (h_sd * h_sd, l_sd * l_sd)
    };
    let one_if_zero = |v: f64| if v > 0.0 { v } else { 1.0 };

    let (mean_high, mean_low) = match opt.subtract_mean {
        SampleNormalization::None => (0.0, 0.0),
        SampleNormalization::High => (h_mean, h_mean),
        SampleNormalization::Low => (l_mean, l_mean),
        SampleNormalization::Separate => (h_mean, l_mean),
    };
    let (norm_high, norm_low) = match opt.divide_normalization {
        SampleNormalization::None => (1.0, 1.0),
        SampleNormalization::High => (one_if_zero(h_factor), one_if_zero(h_factor)),
        SampleNormalization::Low => (one_if_zero(l_factor), one_if_zero(l_factor)),
        SampleNormalization::Separate => (one_if_zero(h_factor), one_if_zero(l_factor)),
    };
    ChannelStats {
        mean_high,
        mean_low,
        norm_high,
        norm_low,
        fill_high: h_mean,
        fill_low: l_mean,
    }
}

/// The high-resolution block (head rows) of a concatenated matrix.
pub(crate) fn high_block(m: &DMatrix<f64>) -> DMatrix<f64> {
    m.rows(0, m.nrows() / 2).into_owned()
}

/// The low-resolution block (tail rows) of a concatenated matrix.
pub(crate) fn low_block(m: &DMatrix<f64>) -> DMatrix<f64> {
    m.rows(m.nrows() / 2, m.nrows() / 2).into_owned()
}

/// Normalizes a freshly initialized concatenated dictionary.
pub(crate) fn normalize_init_dict(dict: &mut DMatrix<f64>, mode: DictionaryNormalization) {
    let dim = dict.nrows() / 2;
    match mode {
        DictionaryNormalization::None => {}
        DictionaryNormalization::Fixed => {
            let n = dict.view((0, 0), (dim, 1)).norm();
            if n > 0.0 {
                *dict /= n;
            }
        }
        DictionaryNormalization::Pairwise => {
            for k in 0..dict.ncols() {
                let hn = dict.view((0, k), (dim, 1)).norm();
                let ln = dict.view((dim, k), (dim, 1)).norm();
                let m = hn.max(ln);
                if m > 0.0 {
                    let scaled = dict.column(k) / m;
                    dict.set_column(k, &scaled);
                }
            }
        }
        DictionaryNormalization::Independent => {
            for k in 0..dict.ncols() {
                let hn = dict.view((0, k), (dim, 1)).norm();
                let ln = dict.view((dim, k), (dim, 1)).norm();
                for r in 0..dim {
                    if hn > 0.0 {
                        dict[(r, k)] /= hn;
                    }
                    if ln > 0.0 {
                        dict[(dim + r, k)] /= ln;
                    }
                }
            }
        }
    }
}

/// Sparse codes of every sample column with respect to the dictionary in
/// the selected resolution. Returns the coefficient matrix (atoms × samples)
/// and the τ used per sample.
pub(crate) fn sparse_code_all(
    samples: &DMatrix<f64>,
    dict: &DMatrix<f64>,
    resolution: TrainingResolution,
    gpsr_opts: &super::gpsr::GpsrOptions,
) -> (DMatrix<f64>, Vec<f64>) {
    let atoms = dict.ncols();
    let n = samples.ncols();
    let dict_high = high_block(dict);
    let dict_low = low_block(dict);

    let columns: Vec<(DVector<f64>, f64)> = (0..n)
        .into_par_iter()
        .map(|j| {
            let col = samples.column(j).into_owned();
            let high = DVector::from_fn(col.nrows() / 2, |r, _| col[r]);
            let low = DVector::from_fn(col.nrows() / 2, |r, _| col[col.nrows() / 2 + r]);
            match resolution {
                TrainingResolution::Low => gpsr(&low, &dict_low, gpsr_opts),
                TrainingResolution::High => gpsr(&high, &dict_high, gpsr_opts),
                TrainingResolution::Concat => gpsr(&col, dict, gpsr_opts),
                TrainingResolution::Average => {
                    let (cl, tl) = gpsr(&low, &dict_low, gpsr_opts);
                    let (ch, th) = gpsr(&high, &dict_high, gpsr_opts);
                    ((cl + ch) * 0.5, 0.5 * (tl + th))
                }
            }
        })
        .collect();

    let mut coeff = DMatrix::<f64>::zeros(atoms, n);
    let mut taus = Vec::with_capacity(n);
    for (j, (col, tau)) in columns.into_iter().enumerate() {
        coeff.set_column(j, &col);
        taus.push(tau);
    }
    (coeff, taus)
}

/// Objective with one shared τ: `(‖P − DΛ‖²_F + τ‖Λ‖₁) / (N·n)`.
pub(crate) fn objective_simple(
    samples: &DMatrix<f64>,
    dict: &DMatrix<f64>,
    coeff: &DMatrix<f64>,
    tau: f64,
) -> f64 {
    let l2 = (samples - dict * coeff).norm();
    let l1: f64 = coeff.iter().map(|c| c.abs()).sum();
    (l2 * l2 + tau * l1) / samples.len() as f64
}

/// Objective with the per-sample τ the codes were found with.
pub(crate) fn objective_improved(
    samples: &DMatrix<f64>,
    dict: &DMatrix<f64>,
    coeff: &DMatrix<f64>,
    taus: &[f64],
) -> f64 {
    let l2 = (samples - dict * coeff).norm();
    let mut l1 = 0.0;
    for (j, tau) in taus.iter().enumerate() {
        l1 += coeff.column(j).iter().map(|c| c.abs()).sum::<f64>() * tau;
    }
    (l2 * l2 + l1) / samples.len() as f64
}

/// Simulated reconstruction error over a validation set: codes from the low
/// block, compared against the high block, L1-normalized and rescaled into
/// the original data range.
pub(crate) fn test_set_error(
    validation: &DMatrix<f64>,
    dict: &DMatrix<f64>,
    gpsr_opts: &super::gpsr::GpsrOptions,
    norm_high: f64,
) -> f64 {
    let dict_high = high_block(dict);
    let dict_low = low_block(dict);
    let dim = validation.nrows() / 2;
    let n = validation.ncols();

    let l1_sum: f64 = (0..n)
        .into_par_iter()
        .map(|j| {
            let low = DVector::from_fn(dim, |r, _| validation[(dim + r, j)]);
            let (code, _) = gpsr(&low, &dict_low, gpsr_opts);
            let predicted = &dict_high * code;
            (0..dim)
                .map(|r| (validation[(r, j)] - predicted[r]).abs())
                .sum::<f64>()
        })
        .sum();
    l1_sum * norm_high / (dim * n) as f64
}

/// Training-set reconstruction error using the codes already at hand.
pub(crate) fn train_set_error(
    samples: &DMatrix<f64>,
    dict: &DMatrix<f64>,
    coeff: &DMatrix<f64>,
    norm_high: f64,
) -> f64 {
    let dict_high = high_block(dict);
    let high = high_block(samples);
    let diff = &high - dict_high * coeff;
    let l1: f64 = diff.iter().map(|v| v.abs()).sum();
    l1 * norm_high / high.len() as f64
}

fn converged(
    condition: TrainingStopCondition,
    tolerance: f64,
    previous: Option<f64>,
    current: f64,
) -> bool {
    match condition {
        TrainingStopCondition::ValueLess => current < tolerance,
        TrainingStopCondition::AbsChangeLess => {
            previous.is_some_and(|p| (p - current).abs() < tolerance)
        }
        TrainingStopCondition::AbsRelChangeLess => {
            previous.is_some_and(|p| (p - current).abs() / p.abs() < tolerance)
        }
        TrainingStopCondition::ChangeLess => previous.is_some_and(|p| p - current < tolerance),
        TrainingStopCondition::RelChangeLess => {
            previous.is_some_and(|p| (p - current) / p < tolerance)
        }
    }
}

/// Runs the training loop for one channel, updating `dict` in place.
pub(crate) fn train_channel(
    dict: &mut DMatrix<f64>,
    samples: &DMatrix<f64>,
    validation: Option<&DMatrix<f64>>,
    norm_high: f64,
    opt: &SpstfmOptions,
    trace: &mut TrainingTrace,
) -> Result<()> {
    let dim = samples.nrows() / 2;
    let mut best: Option<(f64, DMatrix<f64>)> = None;
    let mut previous: Option<f64> = None;

    for it in 1..=opt.max_train_iter {
        let (mut coeff, taus) =
            sparse_code_all(samples, dict, opt.sparse_coeff_resolution, &opt.gpsr_training);

        if opt.column_update_resolution == TrainingResolution::Concat {
            *dict = ksvd(
                samples,
                dict,
                &mut coeff,
                opt.ksvd_online_mode,
                opt.dict_ksvd_normalization,
            );
        } else {
            let high_s = high_block(samples);
            let low_s = low_block(samples);
            let high_d = high_block(dict);
            let low_d = low_block(dict);
            let (new_high, new_low) = double_ksvd(
                &high_s,
                &high_d,
                &low_s,
                &low_d,
                &mut coeff,
                opt.column_update_resolution,
                opt.ksvd_online_mode,
                opt.dict_ksvd_normalization,
            );
            for k in 0..dict.ncols() {
                for r in 0..dim {
                    dict[(r, k)] = new_high[(r, k)];
                    dict[(dim + r, k)] = new_low[(r, k)];
                }
            }
        }

        let stop_value = stop_function_value(
            opt.training_stop_function,
            samples,
            validation,
            dict,
            &coeff,
            &taus,
            norm_high,
            opt,
        );

        // best-shot bookkeeping
        let best_metric = match opt.best_shot_error_set {
            BestShotErrorSet::None => None,
            BestShotErrorSet::TrainSet => Some(train_set_error(samples, dict, &coeff, norm_high)),
            BestShotErrorSet::TestSet => {
                validation.map(|v| test_set_error(v, dict, &opt.gpsr_training, norm_high))
            }
        };
        if let Some(metric) = best_metric {
            if best.as_ref().map_or(true, |(b, _)| metric < *b) {
                best = Some((metric, dict.clone()));
            }
        }

        if opt.record_training_stats {
            trace
                .objective
                .push(stop_resolution_objective(samples, dict, &coeff, &taus, false, opt));
            trace
                .objective_max_tau
                .push(stop_resolution_objective(samples, dict, &coeff, &taus, true, opt));
            if opt.sparse_coeff_resolution == TrainingResolution::Low {
                trace
                    .train_set_error
                    .push(train_set_error(samples, dict, &coeff, norm_high));
            }
            if let Some(v) = validation {
                trace
                    .test_set_error
                    .push(test_set_error(v, dict, &opt.gpsr_training, norm_high));
            }
        }

        debug!(iteration = it, stop_value, "dictionary training step");
        if it >= opt.min_train_iter
            && converged(
                opt.training_stop_condition,
                opt.training_stop_tolerance,
                previous,
                stop_value,
            )
        {
            break;
        }
        previous = Some(stop_value);
    }

    if let Some((_, best_dict)) = best {
        *dict = best_dict;
    }
    Ok(())
}

/// Evaluates an objective stop function in the configured resolution.
fn stop_resolution_objective(
    samples: &DMatrix<f64>,
    dict: &DMatrix<f64>,
    coeff: &DMatrix<f64>,
    taus: &[f64],
    use_max_tau: bool,
    opt: &SpstfmOptions,
) -> f64 {
    let eval = |s: &DMatrix<f64>, d: &DMatrix<f64>| -> f64 {
        if use_max_tau {
            let tau = taus.iter().fold(0.0f64, |m, &t| m.max(t));
            objective_simple(s, d, coeff, tau)
        } else {
            objective_improved(s, d, coeff, taus)
        }
    };
    match opt.training_stop_resolution {
        TrainingResolution::High => eval(&high_block(samples), &high_block(dict)),
        TrainingResolution::Low => eval(&low_block(samples), &low_block(dict)),
        TrainingResolution::Concat => eval(samples, dict),
        TrainingResolution::Average => {
            0.5 * (eval(&high_block(samples), &high_block(dict))
                + eval(&low_block(samples), &low_block(dict)))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn stop_function_value(
    function: TrainingStopFunction,
    samples: &DMatrix<f64>,
    validation: Option<&DMatrix<f64>>,
    dict: &DMatrix<f64>,
    coeff: &DMatrix<f64>,
    taus: &[f64],
    norm_high: f64,
    opt: &SpstfmOptions,
) -> f64 {
    match function {
        TrainingStopFunction::Objective => {
            stop_resolution_objective(samples, dict, coeff, taus, false, opt)
        }
        TrainingStopFunction::ObjectiveMaxTau => {
            stop_resolution_objective(samples, dict, coeff, taus, true, opt)
        }
        TrainingStopFunction::TrainSetError => train_set_error(samples, dict, coeff, norm_high),
        TrainingStopFunction::TestSetError => validation
            .map(|v| test_set_error(v, dict, &opt.gpsr_training, norm_high))
            .unwrap_or(f64::INFINITY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stf_core::PixelKind;

    #[test]
    fn stats_follow_normalization_modes() {
        let mut high = Image::new(4, 1, PixelKind::F64, 1).unwrap();
        let mut low = Image::new(4, 1, PixelKind::F64, 1).unwrap();
        for (x, (h, l)) in [(2.0, 10.0), (4.0, 10.0), (6.0, 20.0), (8.0, 20.0)]
            .iter()
            .enumerate()
        {
            high.set_pixel::<f64>(x as i32, 0, 0, *h);
            low.set_pixel::<f64>(x as i32, 0, 0, *l);
        }

        let mut opt = SpstfmOptions::default();
        opt.subtract_mean = SampleNormalization::Separate;
        opt.divide_normalization = SampleNormalization::Separate;
        opt.stddev_normalization = true;
        let s = compute_channel_stats(&high, &low, None, 0, &opt);
        assert_eq!(s.mean_high, 5.0);
        assert_eq!(s.mean_low, 15.0);
        assert!(s.norm_high > 0.0 && s.norm_low > 0.0);
        assert_eq!(s.fill_high, 5.0);
        assert_eq!(s.fill_low, 15.0);

        opt.subtract_mean = SampleNormalization::None;
        opt.divide_normalization = SampleNormalization::None;
        let s = compute_channel_stats(&high, &low, None, 0, &opt);
        assert_eq!(s.mean_high, 0.0);
        assert_eq!(s.norm_high, 1.0);
        assert_eq!(s.norm_low, 1.0);
    }

    #[test]
    fn init_normalization_modes() {
        let mut dict = DMatrix::from_fn(8, 3, |r, c| (r + c + 1) as f64);
        normalize_init_dict(&mut dict, DictionaryNormalization::Independent);
        for k in 0..3 {
            let hn = dict.view((0, k), (4, 1)).norm();
            let ln = dict.view((4, k), (4, 1)).norm();
            assert!((hn - 1.0).abs() < 1e-12);
            assert!((ln - 1.0).abs() < 1e-12);
        }

        let mut dict = DMatrix::from_fn(8, 3, |r, c| (r * 2 + c + 1) as f64);
        normalize_init_dict(&mut dict, DictionaryNormalization::Pairwise);
        for k in 0..3 {
            let hn = dict.view((0, k), (4, 1)).norm();
            let ln = dict.view((4, k), (4, 1)).norm();
            assert!(hn.max(ln) <= 1.0 + 1e-12);
            assert!((hn.max(ln) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn objectives_decrease_with_better_codes() {
        let dict = DMatrix::<f64>::identity(4, 4);
        let samples = DMatrix::from_column_slice(4, 1, &[1.0, 2.0, 0.0, 0.0]);
        let bad = DMatrix::from_column_slice(4, 1, &[0.0, 0.0, 0.0, 0.0]);
        let good = DMatrix::from_column_slice(4, 1, &[1.0, 2.0, 0.0, 0.0]);
        let o_bad = objective_simple(&samples, &dict, &bad, 0.01);
        let o_good = objective_simple(&samples, &dict, &good, 0.01);
        assert!(o_good < o_bad);
    }

    #[test]
    fn convergence_conditions() {
        use TrainingStopCondition::*;
        assert!(converged(ValueLess, 0.5, None, 0.4));
        assert!(!converged(ValueLess, 0.5, None, 0.6));
        assert!(!converged(AbsChangeLess, 0.1, None, 0.0));
        assert!(converged(AbsChangeLess, 0.1, Some(1.0), 0.95));
        assert!(converged(AbsRelChangeLess, 0.1, Some(1.0), 0.95));
        assert!(converged(ChangeLess, 1e-10, Some(1.0), 1.0));
        // an increase satisfies the signed conditions
        assert!(converged(ChangeLess, 1e-10, Some(1.0), 2.0));
        assert!(converged(RelChangeLess, 1e-10, Some(1.0), 2.0));
    }
}
