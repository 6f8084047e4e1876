//! Expectation values of arbitrary observables under the converged weights,
//! with uncertainties propagated jointly with the free energies.
//!
//! Rather than treating an average as a post-hoc calculation, the observable
//! is folded into the estimator's own likelihood framework: each requested
//! average becomes an extra zero-count "state" whose unnormalized weights
//! are $A(x_n) W_{nk}$, the weight matrix is augmented with those columns,
//! and the asymptotic covariance of the augmented matrix yields the
//! uncertainty of the average together with its correlation with the free
//! energies. This is the approach of Section IV of the MBAR paper.
//!
//! Observables are shifted to be strictly positive before entering the log
//! domain and shifted back afterwards; expectation values are invariant
//! under the shift, and so are the resulting variances.

use crate::covariance;
use crate::errors::NumericError;
use crate::logsumexp::logsumexp;
use ndarray::{Array1, Array2, Axis};

/// An expectation estimate at a set of evaluation states.
#[derive(Debug, Clone)]
pub(crate) struct ExpectationOutput {
    pub mu: Array1<f64>,
    pub sigma: Array1<f64>,
    pub theta: Array2<f64>,
}

/// Free energies of perturbed (unsampled) target states.
#[derive(Debug, Clone)]
pub(crate) struct PerturbedOutput {
    pub f_l: Array1<f64>,
    pub df_l: Array1<f64>,
}

/// Computes $\langle A \rangle_t = \sum_n W_{nt} A_n$ and its one-sigma
/// uncertainty at each evaluation state.
///
/// Without `target_u_ln` the evaluation states are the K original states.
/// With it, each row is the reduced potential of an extrapolated target
/// state, and both values and uncertainties refer to those targets; the
/// target columns are formed by reusing the converged mixture denominators,
/// exactly as the weight matrix builder would with the extra rows appended.
pub(crate) fn expectations(
    log_w_nk: &Array2<f64>,
    log_denominator_n: &Array1<f64>,
    n_k: &[f64],
    a_n: &Array1<f64>,
    target_u_ln: Option<&Array2<f64>>,
) -> Result<ExpectationOutput, NumericError> {
    let n_tot = log_w_nk.len_of(Axis(0));
    let states = log_w_nk.len_of(Axis(1));

    for (sample, a) in a_n.iter().enumerate() {
        if !a.is_finite() {
            return Err(NumericError::NonFiniteObservable { sample });
        }
    }

    // Normalized log weights of the evaluation states.
    let eval_columns = match target_u_ln {
        Some(u_ln) => target_log_weights(u_ln, log_denominator_n)?,
        None => log_w_nk.clone(),
    };
    let eval_count = eval_columns.len_of(Axis(1));
    let target_count = if target_u_ln.is_some() { eval_count } else { 0 };

    // Shift the observable to be >= 1 so its log is defined everywhere.
    let a_min = a_n.iter().copied().fold(f64::INFINITY, f64::min);
    let shift = a_min - 1.0;
    let log_a: Vec<f64> = a_n.iter().map(|a| (a - shift).ln()).collect();

    // log of the shifted averages, one per evaluation state.
    let mut log_mu = Array1::zeros(eval_count);
    for t in 0..eval_count {
        let terms: Vec<f64> = (0..n_tot)
            .map(|n| log_a[n] + eval_columns[[n, t]])
            .collect();
        log_mu[t] = logsumexp(&terms)?;
    }

    // Augmented weight matrix: original states, then any target states,
    // then one observable column per evaluation state. Appended columns
    // carry zero sample counts.
    let augmented_count = states + target_count + eval_count;
    let mut w_aug = Array2::zeros((n_tot, augmented_count));
    for n in 0..n_tot {
        for k in 0..states {
            w_aug[[n, k]] = log_w_nk[[n, k]].exp();
        }
        for t in 0..target_count {
            w_aug[[n, states + t]] = eval_columns[[n, t]].exp();
        }
        for t in 0..eval_count {
            w_aug[[n, states + target_count + t]] =
                (log_a[n] + eval_columns[[n, t]] - log_mu[t]).exp();
        }
    }
    let mut n_aug = n_k.to_vec();
    n_aug.resize(augmented_count, 0.0);

    let theta = covariance::asymptotic_covariance(&w_aug, &n_aug)?;

    let mut mu = Array1::zeros(eval_count);
    let mut sigma = Array1::zeros(eval_count);
    for t in 0..eval_count {
        let state_index = if target_count > 0 { states + t } else { t };
        let observable_index = states + target_count + t;

        let shifted_mean = log_mu[t].exp();
        mu[t] = shifted_mean + shift;

        let variance = shifted_mean
            * shifted_mean
            * (theta.matrix[[observable_index, observable_index]]
                + theta.matrix[[state_index, state_index]]
                - 2.0 * theta.matrix[[observable_index, state_index]]);
        sigma[t] = variance.max(0.0).sqrt();
    }

    Ok(ExpectationOutput {
        mu,
        sigma,
        theta: theta.matrix,
    })
}

/// Free energies of target states never sampled, by reweighting against the
/// converged mixture: $f_l = -\log \sum_n e^{-u_{ln} - \log d_n}$.
/// Uncertainties are reported relative to the given reference state.
pub(crate) fn perturbed_free_energies(
    log_w_nk: &Array2<f64>,
    log_denominator_n: &Array1<f64>,
    n_k: &[f64],
    target_u_ln: &Array2<f64>,
    reference: usize,
) -> Result<PerturbedOutput, NumericError> {
    let n_tot = log_w_nk.len_of(Axis(0));
    let states = log_w_nk.len_of(Axis(1));
    let targets = target_u_ln.len_of(Axis(0));

    let eval_columns = target_log_weights(target_u_ln, log_denominator_n)?;
    let mut f_l = Array1::zeros(targets);
    for l in 0..targets {
        // The normalization constant recorded while building the column.
        let terms: Vec<f64> = (0..n_tot)
            .map(|n| -target_u_ln[[l, n]] - log_denominator_n[n])
            .collect();
        f_l[l] = -logsumexp(&terms)?;
    }

    let mut w_aug = Array2::zeros((n_tot, states + targets));
    for n in 0..n_tot {
        for k in 0..states {
            w_aug[[n, k]] = log_w_nk[[n, k]].exp();
        }
        for l in 0..targets {
            w_aug[[n, states + l]] = eval_columns[[n, l]].exp();
        }
    }
    let mut n_aug = n_k.to_vec();
    n_aug.resize(states + targets, 0.0);

    let theta = covariance::asymptotic_covariance(&w_aug, &n_aug)?;
    let mut df_l = Array1::zeros(targets);
    for l in 0..targets {
        let t = states + l;
        let variance = theta.matrix[[t, t]] + theta.matrix[[reference, reference]]
            - 2.0 * theta.matrix[[t, reference]];
        df_l[l] = variance.max(0.0).sqrt();
    }

    Ok(PerturbedOutput { f_l, df_l })
}

/// Normalized log-weight columns for target states, reusing the converged
/// per-sample mixture denominators.
fn target_log_weights(
    target_u_ln: &Array2<f64>,
    log_denominator_n: &Array1<f64>,
) -> Result<Array2<f64>, NumericError> {
    let targets = target_u_ln.len_of(Axis(0));
    let n_tot = target_u_ln.len_of(Axis(1));

    let mut columns = Array2::zeros((n_tot, targets));
    for l in 0..targets {
        let unnormalized: Vec<f64> = (0..n_tot)
            .map(|n| -target_u_ln[[l, n]] - log_denominator_n[n])
            .collect();
        let normalization = logsumexp(&unnormalized)?;
        for n in 0..n_tot {
            columns[[n, l]] = unnormalized[n] - normalization;
        }
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights;
    use ndarray::array;

    // Two identical states with f = (0, 0) exactly converged; every weight
    // is 1/N, so expectations reduce to plain sample means.
    fn uniform_setup() -> (Array2<f64>, Array1<f64>, Vec<f64>, Array2<f64>) {
        let u_kn = Array2::from_shape_vec(
            (2, 4),
            vec![0.5, 1.0, 1.5, 2.0, 0.5, 1.0, 1.5, 2.0],
        )
        .unwrap();
        let n_k = vec![2.0, 2.0];
        let f_k = array![0.0, 0.0];
        let denominators = weights::log_denominators(&u_kn, &n_k, &f_k).unwrap();
        let log_w = weights::log_weight_matrix_from_denominators(&u_kn, &f_k, &denominators);
        (u_kn, denominators, n_k, log_w)
    }

    #[test]
    fn constant_observable_returns_the_constant_with_zero_uncertainty() {
        let (_, denominators, n_k, log_w) = uniform_setup();
        let a_n = array![-3.25, -3.25, -3.25, -3.25];
        let out = expectations(&log_w, &denominators, &n_k, &a_n, None).unwrap();
        for t in 0..2 {
            assert!((out.mu[t] - (-3.25)).abs() < 1e-9);
            assert!(out.sigma[t] < 1e-7);
        }
    }

    #[test]
    fn uniform_weights_give_the_sample_mean() {
        let (_, denominators, n_k, log_w) = uniform_setup();
        let a_n = array![1.0, 2.0, 3.0, 6.0];
        let out = expectations(&log_w, &denominators, &n_k, &a_n, None).unwrap();
        for t in 0..2 {
            assert!((out.mu[t] - 3.0).abs() < 1e-10);
            assert!(out.sigma[t].is_finite());
        }
    }

    #[test]
    fn negative_observables_survive_the_log_domain_shift() {
        let (_, denominators, n_k, log_w) = uniform_setup();
        let a_n = array![-10.0, -20.0, -30.0, -40.0];
        let out = expectations(&log_w, &denominators, &n_k, &a_n, None).unwrap();
        for t in 0..2 {
            assert!((out.mu[t] - (-25.0)).abs() < 1e-9);
        }
    }

    #[test]
    fn target_state_identical_to_a_sampled_state_matches_it() {
        let (u_kn, denominators, n_k, log_w) = uniform_setup();
        let a_n = array![1.0, 2.0, 3.0, 6.0];

        let target = u_kn.index_axis(Axis(0), 0).to_owned().insert_axis(Axis(0));
        let with_target =
            expectations(&log_w, &denominators, &n_k, &a_n, Some(&target)).unwrap();
        let without = expectations(&log_w, &denominators, &n_k, &a_n, None).unwrap();

        assert_eq!(with_target.mu.len(), 1);
        assert!((with_target.mu[0] - without.mu[0]).abs() < 1e-10);
    }

    #[test]
    fn perturbed_free_energy_of_a_sampled_state_is_its_free_energy() {
        let (u_kn, denominators, n_k, log_w) = uniform_setup();
        // Both original states have f = 0; a target identical to state 0
        // must come out at 0 with ~zero uncertainty against reference 0.
        let target = u_kn.index_axis(Axis(0), 0).to_owned().insert_axis(Axis(0));
        let out =
            perturbed_free_energies(&log_w, &denominators, &n_k, &target, 0).unwrap();
        assert!(out.f_l[0].abs() < 1e-10);
        assert!(out.df_l[0] < 1e-7);
    }

    #[test]
    fn non_finite_observable_is_rejected() {
        let (_, denominators, n_k, log_w) = uniform_setup();
        let a_n = array![1.0, f64::NAN, 3.0, 6.0];
        let err = expectations(&log_w, &denominators, &n_k, &a_n, None).unwrap_err();
        assert!(matches!(
            err,
            NumericError::NonFiniteObservable { sample: 1 }
        ));
    }
}
