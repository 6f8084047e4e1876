//! Self-consistent / Newton solution of the estimating equations.
//!
//! The solve is an explicit state machine rather than buried control flow:
//! it moves through [`SolverState::Initializing`] and
//! [`SolverState::Iterating`] and terminates in `Converged`, `Stalled` or
//! `Diverged`. A `Stalled` attempt is retried exactly once with the
//! fixed-point-only strategy before the solve is declared `Diverged`; there
//! is no other retry policy.

use crate::errors::SolveError;
use crate::weights;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, Axis};

/// Update strategy used by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Race the fixed-point and Newton candidates each iteration and keep
    /// whichever has the smaller gradient norm. The first few iterations
    /// always take the fixed-point step (see
    /// `MBarBuilder::min_fixed_point_iterations`).
    Adaptive,
    /// Only take fixed-point steps. This is the downgrade strategy applied
    /// after a stalled adaptive attempt.
    FixedPointOnly,
}

/// Observable phases of one solve attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SolverState {
    /// Free energies seeded, iteration counter at zero.
    Initializing,
    /// Mid-iteration.
    Iterating {
        /// Current iteration index
        iteration: usize,
    },
    /// Terminal success: the estimate stopped changing.
    Converged {
        /// Number of iterations performed
        iterations: usize,
        /// Largest absolute change in `f_k` over the final iteration
        max_delta: f64,
        /// Euclidean norm of the gradient at the final estimate
        gradient_norm: f64,
    },
    /// The attempt ran out of iterations or produced a non-finite update.
    /// Recoverable by a single strategy downgrade.
    Stalled {
        /// Iteration at which the attempt stalled
        iteration: usize,
    },
    /// Terminal failure after the downgrade was spent.
    Diverged {
        /// Iteration at which the solve was abandoned
        iteration: usize,
    },
}

/// Per-solve configuration, copied from the estimator's builder fields.
#[derive(Debug, Clone)]
pub(crate) struct SolverOptions {
    pub tolerance: f64,
    pub gradient_tolerance: f64,
    pub maximum_iterations: usize,
    pub min_fixed_point_iterations: usize,
    pub verbose: bool,
}

/// Outcome of a converged solve.
#[derive(Debug, Clone)]
pub(crate) struct SolveReport {
    pub f_k: Array1<f64>,
    pub iterations: usize,
    pub strategy: Strategy,
    pub state: SolverState,
}

enum Attempt {
    Converged(SolveReport),
    Stalled {
        state: SolverState,
        last_f_k: Array1<f64>,
    },
}

/// Solves the estimating equations for states that carry samples.
///
/// `u_kn` must contain only rows for states with `n_k > 0`; the caller
/// scatters the result back into the full state vector and recovers
/// unsampled states with one self-consistent pass afterwards. The returned
/// estimate is centered on its first entry.
pub(crate) fn solve(
    u_kn: &Array2<f64>,
    n_k: &[f64],
    f_init: &Array1<f64>,
    options: &SolverOptions,
) -> Result<SolveReport, SolveError> {
    let states = u_kn.len_of(Axis(0));
    if states <= 1 {
        // A single state is its own reference; nothing to iterate.
        return Ok(SolveReport {
            f_k: Array1::zeros(states),
            iterations: 0,
            strategy: Strategy::Adaptive,
            state: SolverState::Converged {
                iterations: 0,
                max_delta: 0.0,
                gradient_norm: 0.0,
            },
        });
    }

    let mut f_k = f_init.clone();
    recenter(&mut f_k);

    let mut u_kn = u_kn.clone();
    weights::precondition(&mut u_kn, n_k, &f_k)?;

    match iterate(&u_kn, n_k, f_k, Strategy::Adaptive, options)? {
        Attempt::Converged(report) => Ok(report),
        Attempt::Stalled { state, last_f_k } => {
            if options.verbose {
                println!(
                    "Adaptive solve reached {:?}; retrying with fixed-point iteration only",
                    state
                );
            }
            match iterate(&u_kn, n_k, last_f_k, Strategy::FixedPointOnly, options)? {
                Attempt::Converged(report) => Ok(report),
                Attempt::Stalled { state, last_f_k } => {
                    // The downgrade is spent; the second stall is terminal.
                    let state = match state {
                        SolverState::Stalled { iteration } => SolverState::Diverged { iteration },
                        other => other,
                    };
                    Err(SolveError::Diverged {
                        state,
                        last_f_k: last_f_k.to_vec(),
                    })
                }
            }
        }
    }
}

fn iterate(
    u_kn: &Array2<f64>,
    n_k: &[f64],
    seed: Array1<f64>,
    strategy: Strategy,
    options: &SolverOptions,
) -> Result<Attempt, SolveError> {
    let mut f_k = seed;
    let mut state = SolverState::Initializing;
    let mut fixed_point_steps = 0usize;

    for iteration in 0..options.maximum_iterations {
        if options.verbose {
            println!("solver state: {:?}", state);
        }
        state = SolverState::Iterating { iteration };

        let mut fixed_point = weights::self_consistent_update(u_kn, n_k, &f_k)?;
        recenter(&mut fixed_point);

        let newton = if strategy == Strategy::Adaptive
            && fixed_point_steps >= options.min_fixed_point_iterations
        {
            newton_candidate(u_kn, n_k, &f_k)?
        } else {
            None
        };

        let gradient_fp = weights::gradient(u_kn, n_k, &fixed_point)?;
        let gnorm_fp = squared_norm(&gradient_fp);

        let (f_new, gnorm, took_newton) = match newton {
            Some(candidate) if candidate.iter().all(|f| f.is_finite()) => {
                let gradient_nr = weights::gradient(u_kn, n_k, &candidate)?;
                let gnorm_nr = squared_norm(&gradient_nr);
                if gnorm_nr < gnorm_fp {
                    (candidate, gnorm_nr, true)
                } else {
                    (fixed_point, gnorm_fp, false)
                }
            }
            _ => (fixed_point, gnorm_fp, false),
        };
        if !took_newton {
            fixed_point_steps += 1;
        }
        if options.verbose {
            println!(
                "iteration {}: {} step, squared gradient norm {:10.5e}",
                iteration,
                if took_newton { "Newton" } else { "fixed-point" },
                gnorm,
            );
        }

        if f_new.iter().any(|f| !f.is_finite()) {
            return Ok(Attempt::Stalled {
                state: SolverState::Stalled { iteration },
                last_f_k: f_k,
            });
        }

        let max_delta = f_k
            .iter()
            .zip(f_new.iter())
            .map(|(old, new)| (new - old).abs())
            .fold(0.0, f64::max);
        f_k = f_new;

        if max_delta < options.tolerance || gnorm.sqrt() < options.gradient_tolerance {
            return Ok(Attempt::Converged(SolveReport {
                f_k,
                iterations: iteration + 1,
                strategy,
                state: SolverState::Converged {
                    iterations: iteration + 1,
                    max_delta,
                    gradient_norm: gnorm.sqrt(),
                },
            }));
        }
    }

    Ok(Attempt::Stalled {
        state: SolverState::Stalled {
            iteration: options.maximum_iterations,
        },
        last_f_k: f_k,
    })
}

/// Full multivariate Newton step on the objective gradient. Returns `None`
/// when the Hessian is singular to working precision, in which case the
/// caller falls back to the fixed-point candidate for this iteration.
fn newton_candidate(
    u_kn: &Array2<f64>,
    n_k: &[f64],
    f_k: &Array1<f64>,
) -> Result<Option<Array1<f64>>, SolveError> {
    let states = f_k.len();
    let gradient = weights::gradient(u_kn, n_k, f_k)?;
    let w_nk = weights::weight_matrix(u_kn, n_k, f_k)?;
    let hessian = weights::hessian(&w_nk, n_k);

    let h = DMatrix::from_fn(states, states, |i, j| hessian[[i, j]]);
    let g = DVector::from_iterator(states, gradient.iter().copied());

    let step = match h.lu().solve(&g) {
        Some(step) => step,
        None => return Ok(None),
    };

    let mut candidate = Array1::zeros(states);
    for k in 0..states {
        candidate[k] = f_k[k] - (step[k] - step[0]);
    }
    Ok(Some(candidate))
}

fn recenter(f_k: &mut Array1<f64>) {
    let reference = f_k[0];
    f_k.mapv_inplace(|f| f - reference);
}

fn squared_norm(v: &Array1<f64>) -> f64 {
    v.iter().map(|x| x * x).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn options() -> SolverOptions {
        SolverOptions {
            tolerance: 1e-10,
            gradient_tolerance: 1e-9,
            maximum_iterations: 1000,
            min_fixed_point_iterations: 2,
            verbose: false,
        }
    }

    #[test]
    fn single_state_converges_at_iteration_zero() {
        let u_kn = Array2::from_shape_vec((1, 3), vec![0.4, 0.6, 0.2]).unwrap();
        let report = solve(&u_kn, &[3.0], &array![0.0], &options()).unwrap();
        assert_eq!(report.iterations, 0);
        assert_eq!(report.f_k, array![0.0]);
        assert!(matches!(
            report.state,
            SolverState::Converged { iterations: 0, .. }
        ));
    }

    #[test]
    fn identical_states_have_zero_free_energy_difference() {
        let u_kn = Array2::from_shape_vec(
            (2, 6),
            vec![
                0.3, 1.9, 0.8, 1.1, 0.2, 1.4, //
                0.3, 1.9, 0.8, 1.1, 0.2, 1.4,
            ],
        )
        .unwrap();
        let report = solve(&u_kn, &[3.0, 3.0], &array![0.0, 0.0], &options()).unwrap();
        assert!((report.f_k[1] - report.f_k[0]).abs() < 1e-10);
    }

    #[test]
    fn additive_shift_is_recovered_exactly() {
        // State 1 is state 0 plus a constant c everywhere, so f_1 - f_0 = c.
        let c = 2.5;
        let base = vec![0.3, 1.9, 0.8, 1.1, 0.2, 1.4, 0.9, 0.5];
        let mut rows = base.clone();
        rows.extend(base.iter().map(|u| u + c));
        let u_kn = Array2::from_shape_vec((2, 8), rows).unwrap();

        let report = solve(&u_kn, &[4.0, 4.0], &array![0.0, 0.0], &options()).unwrap();
        assert!((report.f_k[1] - report.f_k[0] - c).abs() < 1e-8);
    }

    #[test]
    fn warm_start_at_the_solution_terminates_in_one_iteration() {
        let c = 1.25;
        let base = vec![0.3, 1.9, 0.8, 1.1, 0.2, 1.4];
        let mut rows = base.clone();
        rows.extend(base.iter().map(|u| u + c));
        let u_kn = Array2::from_shape_vec((2, 6), rows).unwrap();

        let first = solve(&u_kn, &[3.0, 3.0], &array![0.0, 0.0], &options()).unwrap();
        let second = solve(&u_kn, &[3.0, 3.0], &first.f_k, &options()).unwrap();
        assert!(second.iterations <= 1);
        for (a, b) in first.f_k.iter().zip(second.f_k.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn iteration_cap_of_zero_reports_divergence_with_last_estimate() {
        let u_kn = Array2::from_shape_vec(
            (2, 4),
            vec![0.3, 1.9, 0.8, 1.1, 1.3, 0.9, 1.8, 0.1],
        )
        .unwrap();
        let mut opts = options();
        opts.maximum_iterations = 0;
        let err = solve(&u_kn, &[2.0, 2.0], &array![0.0, 0.0], &opts).unwrap_err();
        match err {
            SolveError::Diverged { state, last_f_k } => {
                assert_eq!(state, SolverState::Diverged { iteration: 0 });
                assert_eq!(last_f_k.len(), 2);
                assert!(last_f_k.iter().all(|f| f.is_finite()));
            }
            other => panic!("expected Diverged, got {:?}", other),
        }
    }

    #[test]
    fn converged_report_carries_the_terminal_state() {
        let u_kn = Array2::from_shape_vec(
            (2, 6),
            vec![
                0.3, 1.9, 0.8, 1.1, 0.2, 1.4, //
                0.8, 1.4, 1.3, 1.6, 0.7, 1.9,
            ],
        )
        .unwrap();
        let report = solve(&u_kn, &[3.0, 3.0], &array![0.0, 0.0], &options()).unwrap();
        match report.state {
            SolverState::Converged {
                iterations,
                max_delta,
                gradient_norm,
            } => {
                assert_eq!(iterations, report.iterations);
                assert!(max_delta < 1e-10 || gradient_norm < 1e-9);
            }
            other => panic!("expected Converged, got {:?}", other),
        }
    }

    #[test]
    fn second_stall_is_terminal_after_the_downgrade() {
        // One iteration is not enough for either attempt on this problem,
        // so the adaptive stall downgrades once and then gives up.
        let u_kn = Array2::from_shape_vec(
            (2, 4),
            vec![0.3, 1.9, 0.8, 1.1, 1.3, 0.9, 1.8, 0.1],
        )
        .unwrap();
        let mut opts = options();
        opts.maximum_iterations = 1;
        let err = solve(&u_kn, &[2.0, 2.0], &array![0.0, 0.0], &opts).unwrap_err();
        match err {
            SolveError::Diverged { state, .. } => {
                assert_eq!(state, SolverState::Diverged { iteration: 1 });
            }
            other => panic!("expected Diverged, got {:?}", other),
        }
    }
}
