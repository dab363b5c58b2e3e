//! K-SVD dictionary updates.
//!
//! One sweep updates every atom in turn: the reconstruction error without
//! atom k, restricted to the samples that use it, is approximated by its
//! leading singular triple; the left singular vector replaces the atom and,
//! in online mode, the scaled right singular vector replaces the atom's
//! coefficient row. The [`double_ksvd`] variant runs separate SVDs for the
//! high- and low-resolution blocks of a paired dictionary, reconciles the
//! sign of the high-resolution atom and takes the shared coefficients from
//! either block or their average.
//!
//! The normalization mode decides whether the singular value scales the
//! atom or the coefficients, see
//! [`DictionaryNormalization`](super::DictionaryNormalization).

use super::{DictionaryNormalization, TrainingResolution};
use nalgebra::{DMatrix, DVector};

/// Copies the columns `idx` of `m`.
pub(crate) fn select_columns(m: &DMatrix<f64>, idx: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), idx.len(), |r, c| m[(r, idx[c])])
}

/// Copies `m` without column `k`.
fn drop_column(m: &DMatrix<f64>, k: usize) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), m.ncols() - 1, |r, c| {
        m[(r, if c < k { c } else { c + 1 })]
    })
}

/// Copies the rows of `m` without row `k`, restricted to the columns `idx`.
fn drop_row_select_columns(m: &DMatrix<f64>, k: usize, idx: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows() - 1, idx.len(), |r, c| {
        m[(if r < k { r } else { r + 1 }, idx[c])]
    })
}

/// Leading singular triple (u₁, s₁, v₁) of `m` via the thin SVD.
fn leading_triple(m: &DMatrix<f64>) -> (DVector<f64>, f64, DVector<f64>) {
    let svd = m.clone().svd(true, true);
    let u = svd.u.as_ref().map(|u| u.column(0).into_owned());
    let vt = svd.v_t.as_ref().map(|vt| vt.row(0).transpose());
    match (u, vt) {
        (Some(u), Some(v)) => (u, svd.singular_values[0], v),
        // the thin SVD of a non-empty matrix always yields both factors
        _ => (
            DVector::zeros(m.nrows()),
            0.0,
            DVector::zeros(m.ncols()),
        ),
    }
}

/// One K-SVD sweep over a (possibly concatenated) dictionary.
///
/// `coeff` holds the sparse codes of `samples` (atoms × samples) and is
/// updated in online mode. Returns the updated dictionary.
pub fn ksvd(
    samples: &DMatrix<f64>,
    dict: &DMatrix<f64>,
    coeff: &mut DMatrix<f64>,
    online: bool,
    normalization: DictionaryNormalization,
) -> DMatrix<f64> {
    let atoms = dict.ncols();
    debug_assert_eq!(samples.nrows(), dict.nrows());
    debug_assert_eq!(coeff.nrows(), atoms);
    debug_assert_eq!(coeff.ncols(), samples.ncols());

    let mut new_dict = dict.clone();
    for k in 0..atoms {
        let users: Vec<usize> = (0..coeff.ncols())
            .filter(|&j| coeff[(k, j)] != 0.0)
            .collect();
        if users.is_empty() {
            continue;
        }

        let samples_r = select_columns(samples, &users);
        let dict_r = if online {
            drop_column(&new_dict, k)
        } else {
            drop_column(dict, k)
        };
        let coeff_r = drop_row_select_columns(coeff, k, &users);
        let err = samples_r - dict_r * coeff_r;

        let (u, mut sv, v) = leading_triple(&err);
        new_dict.set_column(k, &u);
        if matches!(
            normalization,
            DictionaryNormalization::None | DictionaryNormalization::Fixed
        ) {
            let n = if normalization == DictionaryNormalization::Fixed {
                if k == 0 {
                    sv
                } else {
                    new_dict.column(0).norm()
                }
            } else {
                1.0
            };
            let scaled = new_dict.column(k) * (sv / n);
            new_dict.set_column(k, &scaled);
            sv = n;
        }

        if online {
            for (ci, &j) in users.iter().enumerate() {
                coeff[(k, j)] = v[ci] * sv;
            }
        }
    }
    new_dict
}

/// One K-SVD sweep over a high/low dictionary pair with shared coefficients.
///
/// `resolution` selects which block's singular triple updates the shared
/// coefficients (or their average); it must not be
/// [`TrainingResolution::Concat`] - use [`ksvd`] on the concatenated
/// matrices for that.
#[allow(clippy::too_many_arguments)]
pub fn double_ksvd(
    high_samples: &DMatrix<f64>,
    high_dict: &DMatrix<f64>,
    low_samples: &DMatrix<f64>,
    low_dict: &DMatrix<f64>,
    coeff: &mut DMatrix<f64>,
    resolution: TrainingResolution,
    online: bool,
    normalization: DictionaryNormalization,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let atoms = high_dict.ncols();
    debug_assert_eq!(low_dict.ncols(), atoms);
    debug_assert_eq!(coeff.nrows(), atoms);
    debug_assert!(resolution != TrainingResolution::Concat);

    let mut new_high = high_dict.clone();
    let mut new_low = low_dict.clone();
    for k in 0..atoms {
        let users: Vec<usize> = (0..coeff.ncols())
            .filter(|&j| coeff[(k, j)] != 0.0)
            .collect();
        if users.is_empty() {
            continue;
        }

        let coeff_r = drop_row_select_columns(coeff, k, &users);
        let high_dict_r = if online {
            drop_column(&new_high, k)
        } else {
            drop_column(high_dict, k)
        };
        let low_dict_r = if online {
            drop_column(&new_low, k)
        } else {
            drop_column(low_dict, k)
        };
        let high_r = select_columns(high_samples, &users) - high_dict_r * &coeff_r;
        let low_r = select_columns(low_samples, &users) - low_dict_r * &coeff_r;

        let (hu, hs, hv) = leading_triple(&high_r);
        let (lu, ls, lv) = leading_triple(&low_r);

        // keep the atom pair aligned: flip the high atom if the leading
        // right singular vectors disagree in sign
        let sign = if hv.dot(&lv) < 0.0 { -1.0 } else { 1.0 };
        new_high.set_column(k, &(hu * sign));
        new_low.set_column(k, &lu);

        let (mut hs, mut ls) = (hs, ls);
        match normalization {
            DictionaryNormalization::None | DictionaryNormalization::Fixed => {
                let n = if normalization == DictionaryNormalization::Fixed {
                    if k == 0 {
                        hs
                    } else {
                        new_high.column(0).norm()
                    }
                } else {
                    1.0
                };
                let scaled_h = new_high.column(k) * (hs / n);
                new_high.set_column(k, &scaled_h);
                let scaled_l = new_low.column(k) * (ls / n);
                new_low.set_column(k, &scaled_l);
                hs = n;
                ls = n;
            }
            DictionaryNormalization::Pairwise => {
                let m = hs.max(ls);
                if m > 0.0 {
                    let scaled_h = new_high.column(k) * (hs / m);
                    new_high.set_column(k, &scaled_h);
                    let scaled_l = new_low.column(k) * (ls / m);
                    new_low.set_column(k, &scaled_l);
                }
                hs = m;
                ls = m;
            }
            // independent: atoms stay unit norm, singular values go into
            // the coefficients
            DictionaryNormalization::Independent => {}
        }

        if online {
            let new_coeff: DVector<f64> = match resolution {
                TrainingResolution::Low => &lv * ls,
                TrainingResolution::High => &hv * (sign * hs),
                _ => &hv * (0.5 * hs * sign) + &lv * (0.5 * ls),
            };
            for (ci, &j) in users.iter().enumerate() {
                coeff[(k, j)] = new_coeff[ci];
            }
        }
    }
    (new_high, new_low)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frob_err(samples: &DMatrix<f64>, dict: &DMatrix<f64>, coeff: &DMatrix<f64>) -> f64 {
        (samples - dict * coeff).norm()
    }

    #[test]
    fn sweep_reduces_reconstruction_error() {
        // samples that are noisy multiples of two prototype atoms
        let dim = 6;
        let atoms = 4;
        let nsamples = 10;
        let dict = DMatrix::from_fn(dim, atoms, |r, c| {
            let v = ((r + 2 * c) % 3) as f64 - 1.0;
            v / (dim as f64).sqrt()
        });
        let samples = DMatrix::from_fn(dim, nsamples, |r, c| {
            let a = dict[(r, c % atoms)];
            let noise = ((r * 5 + c * 3) % 7) as f64 / 70.0;
            2.0 * a + noise
        });
        let mut coeff = DMatrix::from_fn(atoms, nsamples, |r, c| {
            if r == c % atoms {
                2.0
            } else {
                0.0
            }
        });

        let before = frob_err(&samples, &dict, &coeff);
        let updated = ksvd(&samples, &dict, &mut coeff, true, DictionaryNormalization::Independent);
        let after = frob_err(&samples, &updated, &coeff);
        assert!(
            after <= before + 1e-12,
            "K-SVD made the fit worse: {before} -> {after}"
        );
    }

    #[test]
    fn unused_atoms_are_kept() {
        let dict = DMatrix::<f64>::identity(4, 4);
        let samples = DMatrix::from_column_slice(4, 1, &[1.0, 0.0, 0.0, 0.0]);
        // only atom 0 is used
        let mut coeff = DMatrix::from_column_slice(4, 1, &[1.0, 0.0, 0.0, 0.0]);
        let updated = ksvd(&samples, &dict, &mut coeff, true, DictionaryNormalization::Independent);
        for k in 1..4 {
            assert_eq!(updated.column(k), dict.column(k));
        }
    }

    #[test]
    fn double_ksvd_flips_misaligned_pairs() {
        let dim = 4;
        let nsamples = 6;
        // low samples are the negated high samples, so the sign of the
        // rank-1 factors of the two blocks must be reconciled
        let high = DMatrix::from_fn(dim, nsamples, |r, c| ((r + 2 * c) % 3) as f64 - 1.0);
        let low = -high.clone();
        let high_dict = DMatrix::from_fn(dim, 1, |r, _| if r == 0 { 1.0 } else { 0.0 });
        let low_dict = high_dict.clone();
        let mut coeff = DMatrix::from_element(1, nsamples, 0.5);

        let (new_high, new_low) = double_ksvd(
            &high,
            &high_dict,
            &low,
            &low_dict,
            &mut coeff,
            TrainingResolution::Low,
            true,
            DictionaryNormalization::Independent,
        );
        // the atom pair must stay anti-parallel like the data
        let dot = new_high.column(0).dot(&new_low.column(0));
        assert!(dot <= 1e-9, "pair not reconciled, dot = {dot}");
    }

    #[test]
    fn pairwise_normalization_bounds_norms() {
        let dim = 4;
        let nsamples = 5;
        let high = DMatrix::from_fn(dim, nsamples, |r, c| ((r * c + r) % 5) as f64 / 3.0);
        let low = DMatrix::from_fn(dim, nsamples, |r, c| ((r + 3 * c) % 4) as f64 / 7.0);
        let dict = DMatrix::from_fn(dim, 3, |r, c| if (r + c) % 2 == 0 { 0.5 } else { -0.5 });
        let mut coeff = DMatrix::from_element(3, nsamples, 0.3);

        let (new_high, new_low) = double_ksvd(
            &high,
            &dict,
            &low,
            &dict,
            &mut coeff,
            TrainingResolution::Average,
            true,
            DictionaryNormalization::Pairwise,
        );
        for k in 0..3 {
            let hn = new_high.column(k).norm();
            let ln = new_low.column(k).norm();
            assert!(hn <= 1.0 + 1e-9 && ln <= 1.0 + 1e-9);
            assert!(hn.max(ln) > 0.9, "the larger of the pair should be unit");
        }
    }
}
