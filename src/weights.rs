//! The reweighting core: normalized importance weights relating every
//! sample to every state, and the gradient / Hessian of the estimating
//! equations built from them.
//!
//! Conventions follow the MBAR paper [1]: `u_kn` is K×N (state-major),
//! the weight matrix is N×K (sample-major), and sample counts enter as
//! linear weights in the log-domain sums. All functions are pure
//! transforms returning fresh arrays; nothing here aliases its inputs.
//!
//! [1] Shirts MR and Chodera JD. J. Chem. Phys. 129:124105, 2008.
//! Equations (9), (C3), (C6) and (C9).

use crate::errors::NumericError;
use crate::logsumexp::{logsumexp, logsumexp_weighted};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;

/// Log of the mixture denominator for each sample,
/// $\log \sum_j N_j e^{f_j - u_{jn}}$.
///
/// This is the one place the crate parallelizes: each sample's reduction is
/// independent, so the columns are fanned out across the rayon pool.
pub(crate) fn log_denominators(
    u_kn: &Array2<f64>,
    n_k: &[f64],
    f_k: &Array1<f64>,
) -> Result<Array1<f64>, NumericError> {
    let n_tot = u_kn.len_of(Axis(1));

    let denominators = (0..n_tot)
        .into_par_iter()
        .map(|n| {
            let column = u_kn.index_axis(Axis(1), n);
            let terms: Vec<f64> = f_k
                .iter()
                .zip(column.iter())
                .map(|(f, u)| f - u)
                .collect();
            logsumexp_weighted(&terms, n_k)
                .map_err(|_| NumericError::ZeroWeightDenominator { sample: n })
        })
        .collect::<Result<Vec<f64>, NumericError>>()?;

    Ok(Array1::from(denominators))
}

/// The N×K matrix of normalized log weights, equation (9) of [1]:
/// $\log W_{nk} = f_k - u_{kn} - \log \sum_j N_j e^{f_j - u_{jn}}$.
pub(crate) fn log_weight_matrix(
    u_kn: &Array2<f64>,
    n_k: &[f64],
    f_k: &Array1<f64>,
) -> Result<Array2<f64>, NumericError> {
    let denominators = log_denominators(u_kn, n_k, f_k)?;
    Ok(log_weight_matrix_from_denominators(u_kn, f_k, &denominators))
}

/// As [`log_weight_matrix`], reusing already-computed denominators.
pub(crate) fn log_weight_matrix_from_denominators(
    u_kn: &Array2<f64>,
    f_k: &Array1<f64>,
    denominators: &Array1<f64>,
) -> Array2<f64> {
    let states = u_kn.len_of(Axis(0));
    let n_tot = u_kn.len_of(Axis(1));

    let mut log_w = Array2::zeros((n_tot, states));
    for n in 0..n_tot {
        for k in 0..states {
            log_w[[n, k]] = f_k[k] - u_kn[[k, n]] - denominators[n];
        }
    }
    log_w
}

/// The N×K weight matrix $W_{nk} = e^{\log W_{nk}}$.
pub(crate) fn weight_matrix(
    u_kn: &Array2<f64>,
    n_k: &[f64],
    f_k: &Array1<f64>,
) -> Result<Array2<f64>, NumericError> {
    Ok(log_weight_matrix(u_kn, n_k, f_k)?.mapv(f64::exp))
}

/// One self-consistent pass over the free energies, equation (C3) of [1]:
/// $f_k \leftarrow -\log \sum_n e^{-u_{kn} - \log d_n}$.
///
/// States with zero samples contribute nothing to the denominators but
/// still receive an updated estimate, which is how free energies of
/// unsampled states are recovered after the solve.
pub(crate) fn self_consistent_update(
    u_kn: &Array2<f64>,
    n_k: &[f64],
    f_k: &Array1<f64>,
) -> Result<Array1<f64>, NumericError> {
    let denominators = log_denominators(u_kn, n_k, f_k)?;
    let states = u_kn.len_of(Axis(0));
    let n_tot = u_kn.len_of(Axis(1));

    let mut updated = Array1::zeros(states);
    for k in 0..states {
        let terms: Vec<f64> = (0..n_tot)
            .map(|n| -denominators[n] - u_kn[[k, n]])
            .collect();
        updated[k] = -logsumexp(&terms)?;
    }
    Ok(updated)
}

/// Gradient of the MBAR objective, equation (C6) of [1]:
/// $g_k = -N_k (1 - e^{f_k + \log \sum_n e^{-u_{kn} - \log d_n}})$.
///
/// This is the difference between the observed and the reweighting-implied
/// sample count of each state; it vanishes at the solution.
pub(crate) fn gradient(
    u_kn: &Array2<f64>,
    n_k: &[f64],
    f_k: &Array1<f64>,
) -> Result<Array1<f64>, NumericError> {
    let updated = self_consistent_update(u_kn, n_k, f_k)?;
    let mut grad = Array1::zeros(f_k.len());
    for k in 0..f_k.len() {
        grad[k] = -n_k[k] * (1.0 - (f_k[k] - updated[k]).exp());
    }
    Ok(grad)
}

/// Hessian of the MBAR objective, equation (C9) of [1], as a function of the
/// weight matrix and sample counts:
/// $H_{ij} = N_i N_j \sum_n W_{ni} W_{nj} - \delta_{ij} N_i \sum_n W_{ni}$,
/// negated.
pub(crate) fn hessian(w_nk: &Array2<f64>, n_k: &[f64]) -> Array2<f64> {
    let states = w_nk.len_of(Axis(1));
    let column_sums = w_nk.sum_axis(Axis(0));

    let mut h = w_nk.t().dot(w_nk);
    for i in 0..states {
        for j in 0..states {
            h[[i, j]] *= n_k[i] * n_k[j];
        }
        h[[i, i]] -= column_sums[i] * n_k[i];
    }
    h.mapv_inplace(|x| -x);
    h
}

/// Subtracts a per-sample constant from `u_kn` so the objective evaluates
/// near zero at the current estimate. Weights, gradients and free-energy
/// differences are invariant under this shift; only floating-point
/// precision changes.
pub(crate) fn precondition(
    u_kn: &mut Array2<f64>,
    n_k: &[f64],
    f_k: &Array1<f64>,
) -> Result<(), NumericError> {
    let states = u_kn.len_of(Axis(0));
    let n_tot = u_kn.len_of(Axis(1));

    for n in 0..n_tot {
        let mut column_min = f64::INFINITY;
        for k in 0..states {
            column_min = column_min.min(u_kn[[k, n]]);
        }
        for k in 0..states {
            u_kn[[k, n]] -= column_min;
        }
    }

    let denominators = log_denominators(u_kn, n_k, f_k)?;
    let total: f64 = n_k.iter().sum();
    let mean_f = n_k
        .iter()
        .zip(f_k.iter())
        .map(|(n, f)| n * f)
        .sum::<f64>()
        / total;
    for n in 0..n_tot {
        let shift = denominators[n] - mean_f;
        for k in 0..states {
            u_kn[[k, n]] += shift;
        }
    }
    Ok(())
}
