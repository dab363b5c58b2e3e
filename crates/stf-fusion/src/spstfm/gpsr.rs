//! GPSR-BB: gradient projection for sparse reconstruction with
//! Barzilai-Borwein step selection.
//!
//! Solves `min_λ ½‖y − Aλ‖² + τ‖λ‖₁` by splitting λ = u − v with u, v ≥ 0
//! and projecting gradient steps onto the non-negative orthant. The step
//! along the projected direction is chosen by monotone minimization and
//! clipped to [0, 1]; the BB update keeps α within fixed bounds. With
//! continuation, one warm-up sweep runs at doubled τ and a 10× looser
//! tolerance. An optional debiasing pass runs conjugate gradients on the
//! identified support.

use nalgebra::{DMatrix, DVector};
use tracing::warn;

/// Options of one GPSR invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsrOptions {
    /// Sparsity weight τ; a negative value selects `0.1·‖Aᵀy‖∞`.
    pub tau: f64,
    /// Relative objective-change tolerance of the main loop.
    pub tol_a: f64,
    /// Minimum main-loop iterations.
    pub min_iter_a: u32,
    /// Maximum main-loop iterations.
    pub max_iter_a: u32,
    /// Whether to run the debiasing pass.
    pub debias: bool,
    /// Residual tolerance of the debiasing pass, relative to its start.
    pub tol_d: f64,
    /// Minimum debias iterations.
    pub min_iter_d: u32,
    /// Maximum debias iterations.
    pub max_iter_d: u32,
    /// Warm-start sweep at 2τ and 10·tol_a.
    pub continuation: bool,
}

impl Default for GpsrOptions {
    fn default() -> Self {
        Self {
            tau: -1.0,
            tol_a: 1e-5,
            min_iter_a: 5,
            max_iter_a: 5000,
            debias: true,
            tol_d: 1e-1,
            min_iter_d: 1,
            max_iter_d: 200,
            continuation: true,
        }
    }
}

impl GpsrOptions {
    /// Defaults of the training stage (tighter main tolerance).
    pub fn training_defaults() -> Self {
        Self {
            tol_a: 1e-6,
            ..Self::default()
        }
    }

    /// Defaults of the reconstruction stage.
    pub fn reconstruction_defaults() -> Self {
        Self::default()
    }
}

const ALPHA_MIN: f64 = 1e-30;
const ALPHA_MAX: f64 = 1e30;

/// Finds sparse representation coefficients of `y` with respect to the
/// dictionary `a`.
///
/// Returns the coefficient vector and the τ that was effectively used.
pub fn gpsr(y: &DVector<f64>, a: &DMatrix<f64>, opt: &GpsrOptions) -> (DVector<f64>, f64) {
    let n = a.ncols();
    let dim = y.nrows();
    debug_assert_eq!(a.nrows(), dim, "y and the dictionary must agree in rows");

    let aty: DVector<f64> = a.transpose() * y;
    let final_tau = if opt.tau < 0.0 {
        0.1 * aty.iter().fold(0.0f64, |m, &v| m.max(v.abs()))
    } else {
        opt.tau
    };
    let mut tau = final_tau;
    let mut tol_a = opt.tol_a;
    if opt.continuation {
        tau *= 2.0;
        tol_a *= 10.0;
    }

    let mut alpha = 1.0;
    let mut x = DVector::<f64>::zeros(n);
    let mut u = DVector::<f64>::zeros(n);
    let mut v = DVector::<f64>::zeros(n);
    let mut res = y.clone();
    let mut ax = DVector::<f64>::zeros(dim);

    let objective = |res: &DVector<f64>, x: &DVector<f64>, tau: f64| {
        0.5 * res.dot(res) + tau * x.iter().map(|c| c.abs()).sum::<f64>()
    };
    let mut f_val = objective(&res, &x, tau);

    let mut it = 0u32;
    let mut nnz = 0usize;
    loop {
        // continuation: relax τ toward its final value
        if it > 0 {
            let gradq: DVector<f64> = a.transpose() * &res;
            let lo = gradq.iter().fold(f64::INFINITY, |m, &g| m.min(g));
            let hi = gradq.iter().fold(f64::NEG_INFINITY, |m, &g| m.max(g));
            tau = (0.2 * lo.abs()).max(0.2 * hi.abs()).max(final_tau);
            if tau == final_tau {
                tol_a = opt.tol_a;
            }
        }

        loop {
            // gradient of both split halves
            let term: DVector<f64> = a.transpose() * &ax - &aty;
            let grad_u = term.map(|t| tau + t);
            let grad_v = term.map(|t| tau - t);

            // projected search direction
            let du = u.zip_map(&grad_u, |ui, gi| (ui - alpha * gi).max(0.0) - ui);
            let dv = v.zip_map(&grad_v, |vi, gi| (vi - alpha * gi).max(0.0) - vi);
            let dx = &du - &dv;

            // monotone step length, clipped to [0, 1]
            let adx: DVector<f64> = a * &dx;
            let d_gd = adx.dot(&adx);
            let mut lambda =
                -(grad_u.dot(&du) + grad_v.dot(&dv)) / (f64::MIN_POSITIVE + d_gd);
            if lambda < 0.0 {
                warn!(lambda, d_gd, alpha, "negative step in sparse coding, resetting to 1");
                lambda = 1.0;
            }
            lambda = lambda.min(1.0);

            u.axpy(lambda, &du, 1.0);
            v.axpy(lambda, &dv, 1.0);
            let uv_min = u.zip_map(&v, f64::min);
            u -= &uv_min;
            v -= &uv_min;
            x = &u - &v;

            nnz = x.iter().filter(|&&c| c != 0.0).count();
            ax.axpy(lambda, &adx, 1.0);
            res = y - &ax;
            let f_old = f_val;
            f_val = objective(&res, &x, tau);

            // Barzilai-Borwein update
            let dd = du.dot(&du) + dv.dot(&dv);
            alpha = if d_gd <= 0.0 {
                ALPHA_MAX
            } else {
                (dd / d_gd).clamp(ALPHA_MIN, ALPHA_MAX)
            };

            it += 1;
            let keep_going = it <= opt.min_iter_a
                || ((f_val - f_old).abs() / f_old > tol_a && it <= opt.max_iter_a);
            if !keep_going {
                break;
            }
        }
        if tau <= final_tau {
            break;
        }
    }

    // debiasing on the identified support via conjugate gradients
    if opt.debias && nnz > 0 && nnz <= dim {
        let zero_idx: Vec<usize> = x
            .iter()
            .enumerate()
            .filter_map(|(i, &c)| (c == 0.0).then_some(i))
            .collect();
        res = -res; // res = Ax − y
        let mut rvec: DVector<f64> = a.transpose() * &res;
        for &i in &zero_idx {
            rvec[i] = 0.0;
        }
        let mut rtr = rvec.dot(&rvec);
        if rtr == 0.0 {
            return (x, final_tau);
        }
        let converge = opt.tol_d * rtr;
        let mut pvec = -rvec.clone();

        let mut it = 0u32;
        loop {
            let rwp: DVector<f64> = a * &pvec;
            let mut apv: DVector<f64> = a.transpose() * &rwp;
            for &i in &zero_idx {
                apv[i] = 0.0;
            }
            let alpha_cg = rtr / pvec.dot(&apv);
            if !alpha_cg.is_finite() {
                break;
            }
            x.axpy(alpha_cg, &pvec, 1.0);
            res.axpy(alpha_cg, &rwp, 1.0);
            rvec.axpy(alpha_cg, &apv, 1.0);

            let rtr_plus = rvec.dot(&rvec);
            let beta = rtr_plus / rtr;
            pvec = pvec * beta - &rvec;
            rtr = rtr_plus;

            it += 1;
            let keep_going = it < opt.min_iter_d || (rtr > converge && it < opt.max_iter_d);
            if !keep_going {
                break;
            }
        }
    }
    (x, final_tau)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A dictionary whose first columns are the standard basis, padded with
    /// mixed columns to make it overcomplete.
    fn overcomplete_dict(dim: usize, atoms: usize) -> DMatrix<f64> {
        DMatrix::from_fn(dim, atoms, |r, c| {
            if c < dim {
                if r == c {
                    1.0
                } else {
                    0.0
                }
            } else {
                // deterministic mixed atoms, normalized below
                let raw = ((r * 7 + c * 13) % 5) as f64 - 2.0;
                raw / 3.0
            }
        })
    }

    #[test]
    fn recovers_sparse_combination() {
        let dict = overcomplete_dict(8, 16);
        // y = 3·e2 − 2·e5
        let mut y = DVector::zeros(8);
        y[2] = 3.0;
        y[5] = -2.0;

        let (x, tau) = gpsr(&y, &dict, &GpsrOptions::default());
        assert!(tau > 0.0);

        let approx = &dict * &x;
        let err = (&approx - &y).norm();
        assert!(err < 0.2, "reconstruction error too large: {err}");

        let nnz = x.iter().filter(|&&c| c.abs() > 1e-6).count();
        assert!(nnz <= 8, "solution should be sparse, got {nnz} nonzeros");
    }

    #[test]
    fn continuation_reaches_same_solution() {
        let dict = overcomplete_dict(6, 12);
        let mut y = DVector::zeros(6);
        y[0] = 1.0;
        y[4] = 0.5;

        let with = GpsrOptions {
            continuation: true,
            ..GpsrOptions::default()
        };
        let without = GpsrOptions {
            continuation: false,
            ..GpsrOptions::default()
        };
        let (a, _) = gpsr(&y, &dict, &with);
        let (b, _) = gpsr(&y, &dict, &without);
        assert!(((&dict * &a) - &y).norm() < 0.2);
        assert!(((&dict * &b) - &y).norm() < 0.2);
    }

    #[test]
    fn zero_target_stays_zero() {
        let dict = overcomplete_dict(5, 10);
        let y = DVector::zeros(5);
        let (x, _) = gpsr(&y, &dict, &GpsrOptions::default());
        assert!(x.iter().all(|&c| c.abs() < 1e-9));
    }

    #[test]
    fn explicit_tau_is_respected() {
        let dict = overcomplete_dict(5, 10);
        let mut y = DVector::zeros(5);
        y[1] = 2.0;
        let opt = GpsrOptions {
            tau: 0.05,
            ..GpsrOptions::default()
        };
        let (_, tau) = gpsr(&y, &dict, &opt);
        assert_eq!(tau, 0.05);
    }
}
