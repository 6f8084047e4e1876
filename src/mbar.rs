//! The estimator itself: builder-validated construction, the solve entry
//! points, and every derived quantity (overlap, covariance, free-energy
//! differences, expectations, effective sample numbers).

use crate::covariance;
use crate::errors::*;
use crate::expectation;
use crate::solver::{self, SolverOptions, SolverState, Strategy};
use crate::weights;
use ndarray::{Array1, Array2, Axis};

/// Define the initial guess for free energies
///
/// `InitialFreeEnergies::Bar` works best when the states are ordered such
/// that adjacent states maximize the overlap between states. Its up to the
/// user to arrange the states in such an order, or at least close to such an
/// order. If you are uncertain what the order of states should be, or if it
/// does not make sense to think of states as adjacent, then choose
/// `InitialFreeEnergies::Zeros`.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialFreeEnergies {
    /// Use the specified free energy values
    Specified(Vec<f64>),
    /// Initialize all free energies to zero
    Zeros,
    /// Use BAR between the pairwise states to initialize the free energies.
    ///
    /// Each adjacent pair of sampled states is solved as a two-state problem
    /// and the resulting differences are chained. Assumes the samples are in
    /// `n_k` order (the first `n_k[0]` samples from state 0, the next
    /// `n_k[1]` from state 1, and so forth).
    Bar,
}

impl Default for InitialFreeEnergies {
    fn default() -> Self {
        Self::Zeros
    }
}

impl From<&[f64]> for InitialFreeEnergies {
    fn from(slice: &[f64]) -> Self {
        Self::Specified(Vec::from(slice))
    }
}

/// Multistate Bennett acceptance ratio method (MBAR) for the analysis of
/// multiple equilibrium samples.
///
/// # Notes
///
/// Note that this method assumes the data are uncorrelated.
///
/// Correlated data must be subsampled to extract uncorrelated (effectively
/// independent) samples.
///
/// # References
///
/// 1. Shirts MR and Chodera JD. Statistically optimal analysis of samples
/// from multiple equilibrium states. J. Chem. Phys. 129:124105, 2008
/// <http://dx.doi.org/10.1063/1.2978177>
#[derive(Builder, Debug)]
#[builder(build_fn(name = "build_inner", private))]
pub struct MBar {
    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    u_kn: Array2<f64>,

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    ///
    /// We assume that the states are ordered such that the first `n_k` are
    /// from the first state, the 2nd `n_k` the second state, and so forth.
    /// This only becomes important for BAR initialization --- MBAR itself
    /// does not care which samples are from which state.
    n_k: Array1<usize>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "1000")]
    maximum_iterations: usize,

    /// Convergence criterion: maximum absolute change in any `f_k` over one
    /// iteration, in natural-log units
    #[builder(default = "1.0e-10")]
    tolerance: f64,

    /// Alternative convergence criterion: Euclidean norm of the objective
    /// gradient
    #[builder(default = "1.0e-9")]
    gradient_tolerance: f64,

    /// Number of fixed-point iterations taken before the Newton candidate is
    /// considered. Trades robustness far from the solution against fast
    /// final convergence.
    #[builder(default = "2")]
    min_fixed_point_iterations: usize,

    /// Which state's free energy is pinned to zero. Only free-energy
    /// differences are meaningful; this fixes the additive constant.
    #[builder(default = "0")]
    reference_state: usize,

    /// Set to the initial dimensionless free energies to use as a guess
    #[builder(default)]
    initial_free_energies: InitialFreeEnergies,

    /// Set to true if verbose debug output is desired
    #[builder(setter(skip), default = "false")]
    verbose: bool,

    /// The converged output of the most recent successful solve.
    ///
    /// A failed solve never touches this field, so a previously converged
    /// result (if any) stays available.
    #[builder(setter(skip), default)]
    solution: Option<Solution>,
}

impl MBarBuilder {
    /// Build and validate the estimator and print progress to STDOUT
    pub fn build_verbose(&self) -> Result<MBar, ConstructionError> {
        let mut new = self.build_inner().map_err(ConstructionError::from)?;
        new.verbose = true;
        new.validated()
    }

    /// Build and validate the estimator
    pub fn build(&self) -> Result<MBar, ConstructionError> {
        self.build_inner()
            .map_err(ConstructionError::from)?
            .validated()
    }
}

/// The converged output of a solve: free energies, weights, and the
/// bookkeeping needed to derive everything else.
#[derive(Debug, Clone)]
pub struct Solution {
    f_k: Array1<f64>,
    log_w_nk: Array2<f64>,
    log_denominator_n: Array1<f64>,
    iterations: usize,
    strategy: Strategy,
    state: SolverState,
}

impl Solution {
    /// The relative dimensionless free energy of each state, with the
    /// reference state pinned to zero
    pub fn f_k(&self) -> &Array1<f64> {
        &self.f_k
    }

    /// The N×K matrix of normalized log weights $\ln W_{nk}$
    pub fn log_w_nk(&self) -> &Array2<f64> {
        &self.log_w_nk
    }

    /// A copy of the weight matrix $W_{nk}$
    pub fn w_nk(&self) -> Array2<f64> {
        self.log_w_nk.mapv(f64::exp)
    }

    /// Number of solver iterations it took to converge
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// The update strategy the accepted solve attempt ran under
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Terminal phase of the accepted solve attempt, carrying the final
    /// iteration count, free-energy change and gradient norm
    pub fn solver_state(&self) -> &SolverState {
        &self.state
    }
}

/// Asymptotic covariance of the free-energy estimates
#[derive(Debug, Clone)]
pub struct Covariance {
    /// Covariance $\Theta_{ij}$ of the log normalization-constant estimates.
    /// Only combinations corresponding to free-energy differences are
    /// physically meaningful.
    pub theta: Array2<f64>,
    /// Covariance of $f_i - f_r$ against $f_j - f_r$ for the configured
    /// reference state r; row and column r are identically zero.
    pub projected: Array2<f64>,
    /// Smallest over largest eigenvalue of $W^T W$. A tiny ratio means poor
    /// overlap and large (but legitimate) uncertainties, not an error.
    pub condition_number: f64,
}

/// Free energy differences between all pairs of states, with uncertainties
#[derive(Debug, Clone)]
pub struct FreeEnergyDifferences {
    /// `delta_f[i][j]` is the dimensionless free energy difference $f_j - f_i$
    pub delta_f: Array2<f64>,
    /// `d_delta_f[i][j]` is the one-sigma uncertainty in $f_j - f_i$
    pub d_delta_f: Array2<f64>,
}

/// Expectations for an observable
#[derive(Debug, Clone)]
pub struct Expectations {
    /// `mu[i]` is the estimate for the expectation of $A(x)$ at evaluation state `i`
    pub mu: Array1<f64>,
    /// `sigma[i]` is the uncertainty estimate at one standard deviation for `mu[i]`
    pub sigma: Array1<f64>,
    /// Covariance matrix of the augmented (state plus observable) weights
    pub theta: Array2<f64>,
}

/// Free energies of perturbed target states that were never sampled
#[derive(Debug, Clone)]
pub struct PerturbedFreeEnergies {
    /// `f_l[l]` is the dimensionless free energy of target state `l`, on the
    /// same scale as the solution's `f_k`
    pub f_l: Array1<f64>,
    /// `df_l[l]` is the one-sigma uncertainty of `f_l[l]` relative to the
    /// reference state
    pub df_l: Array1<f64>,
}

impl MBar {
    /// Get a new builder for the `MBar` struct. `MBar` can only be
    /// constructed via the builder.
    pub fn builder() -> MBarBuilder {
        MBarBuilder::default()
    }

    fn validated(self) -> Result<Self, ConstructionError> {
        let states = self.u_kn.len_of(Axis(0));
        let samples = self.u_kn.len_of(Axis(1));

        if self.n_k.len() != states {
            return Err(ConstructionError::StateCountMismatch {
                n_k: self.n_k.len(),
                states,
            });
        }

        let total: usize = self.n_k.iter().sum();
        if total == 0 {
            return Err(ConstructionError::NoSamples);
        }
        if total != samples {
            return Err(ConstructionError::SampleCountMismatch { total, samples });
        }

        for ((state, sample), u) in self.u_kn.indexed_iter() {
            if !u.is_finite() {
                return Err(ConstructionError::NonFinitePotential { state, sample });
            }
        }

        if self.reference_state >= states {
            return Err(ConstructionError::ReferenceOutOfRange {
                reference: self.reference_state,
                states,
            });
        }

        Ok(self)
    }

    /// $N_{tot}$, the total number of snapshots from all states
    pub fn n_tot(&self) -> usize {
        self.u_kn.len_of(Axis(1))
    }

    /// $K$, the total number of thermodynamic states
    pub fn k(&self) -> usize {
        self.u_kn.len_of(Axis(0))
    }

    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    pub fn u_kn(&self) -> &Array2<f64> {
        &self.u_kn
    }

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    pub fn n_k(&self) -> &Array1<usize> {
        &self.n_k
    }

    /// The converged output of the most recent successful solve, if any
    pub fn solution(&self) -> Option<&Solution> {
        self.solution.as_ref()
    }

    fn n_k_f(&self) -> Vec<f64> {
        self.n_k.iter().map(|&n| n as f64).collect()
    }

    fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            tolerance: self.tolerance,
            gradient_tolerance: self.gradient_tolerance,
            maximum_iterations: self.maximum_iterations,
            min_fixed_point_iterations: self.min_fixed_point_iterations,
            verbose: self.verbose,
        }
    }

    /// Solves the self-consistent equations for the dimensionless free
    /// energies, starting from the configured initial guess.
    ///
    /// On success the solution is stored on the estimator and returned. A
    /// failed solve leaves any previously converged solution untouched.
    pub fn solve(&mut self) -> Result<&Solution, SolveError> {
        let initial = match &self.initial_free_energies {
            InitialFreeEnergies::Zeros => Array1::zeros(self.k()),
            InitialFreeEnergies::Specified(f_k) => {
                if f_k.len() != self.k() {
                    return Err(SolveError::WarmStartLengthMismatch {
                        actual: f_k.len(),
                        expected: self.k(),
                    });
                }
                Array1::from(f_k.clone())
            }
            InitialFreeEnergies::Bar => self.bar_initial_guess()?,
        };
        self.solve_from(&initial)
    }

    /// Solves starting from the given warm start, for example a previous
    /// solve's result for a nearby problem.
    pub fn solve_from(&mut self, warm_start: &Array1<f64>) -> Result<&Solution, SolveError> {
        if warm_start.len() != self.k() {
            return Err(SolveError::WarmStartLengthMismatch {
                actual: warm_start.len(),
                expected: self.k(),
            });
        }

        let n_k = self.n_k_f();
        let sampled: Vec<usize> = (0..self.k()).filter(|&k| self.n_k[k] > 0).collect();

        // The nonlinear solve runs over the sampled states only; empty
        // states are recovered afterwards by one self-consistent pass.
        let u_sub = self.u_kn.select(Axis(0), &sampled);
        let n_sub: Vec<f64> = sampled.iter().map(|&k| n_k[k]).collect();
        let f_sub =
            Array1::from(sampled.iter().map(|&k| warm_start[k]).collect::<Vec<f64>>());

        let report = solver::solve(&u_sub, &n_sub, &f_sub, &self.solver_options()).map_err(
            |err| match err {
                SolveError::Diverged { state, last_f_k } => SolveError::Diverged {
                    state,
                    last_f_k: self.scatter(&sampled, &last_f_k, warm_start),
                },
                other => other,
            },
        )?;

        let mut f_k = Array1::from(self.scatter(&sampled, &report.f_k.to_vec(), warm_start));
        f_k = weights::self_consistent_update(&self.u_kn, &n_k, &f_k)?;
        let reference = f_k[self.reference_state];
        f_k.mapv_inplace(|f| f - reference);

        let log_denominator_n = weights::log_denominators(&self.u_kn, &n_k, &f_k)?;
        let log_w_nk =
            weights::log_weight_matrix_from_denominators(&self.u_kn, &f_k, &log_denominator_n);

        // Column normalization is a property of the converged solution;
        // check it rather than assume it.
        for &k in &sampled {
            let column_sum: f64 = log_w_nk
                .index_axis(Axis(1), k)
                .iter()
                .map(|&lw| lw.exp())
                .sum();
            let deviation = column_sum - 1.0;
            if deviation.abs() > 1.0e-6 {
                return Err(SolveError::Numeric(NumericError::WeightNormalization {
                    state: k,
                    deviation,
                }));
            }
        }

        if self.verbose {
            println!(
                "Converged in {} iterations ({:?} strategy)",
                report.iterations, report.strategy
            );
        }

        Ok(&*self.solution.insert(Solution {
            f_k,
            log_w_nk,
            log_denominator_n,
            iterations: report.iterations,
            strategy: report.strategy,
            state: report.state,
        }))
    }

    /// Scatters a sampled-subset vector back into a full-length one, keeping
    /// warm-start values for unsampled states.
    fn scatter(&self, sampled: &[usize], values: &[f64], fallback: &Array1<f64>) -> Vec<f64> {
        let mut full = fallback.to_vec();
        for (&k, &value) in sampled.iter().zip(values.iter()) {
            full[k] = value;
        }
        full
    }

    /// Chains two-state solves over adjacent sampled states to produce a BAR
    /// initial guess. Pairs involving an unsampled state carry the previous
    /// estimate forward unchanged.
    fn bar_initial_guess(&self) -> Result<Array1<f64>, SolveError> {
        let n_k = self.n_k_f();
        let mut offsets = vec![0usize; self.k() + 1];
        for k in 0..self.k() {
            offsets[k + 1] = offsets[k] + self.n_k[k];
        }

        let mut f_k = Array1::zeros(self.k());
        for k in 1..self.k() {
            if self.n_k[k - 1] == 0 || self.n_k[k] == 0 {
                f_k[k] = f_k[k - 1];
                continue;
            }

            let columns: Vec<usize> = (offsets[k - 1]..offsets[k + 1]).collect();
            let u_pair = self
                .u_kn
                .select(Axis(1), &columns)
                .select(Axis(0), &[k - 1, k]);
            let n_pair = [n_k[k - 1], n_k[k]];

            let report = solver::solve(
                &u_pair,
                &n_pair,
                &Array1::zeros(2),
                &self.solver_options(),
            )?;
            f_k[k] = f_k[k - 1] + (report.f_k[1] - report.f_k[0]);
        }
        Ok(f_k)
    }

    fn converged(&self) -> Result<&Solution, NumericError> {
        self.solution.as_ref().ok_or(NumericError::NotSolved)
    }

    /// Computes the K×K overlap matrix between the sampled states,
    /// $O_{ij} = \sqrt{N_i N_j} \sum_n W_{ni} W_{nj}$.
    ///
    /// Diagonal entries close to one indicate a state whose samples overlap
    /// little with any other state; off-diagonal entries measure shared
    /// phase space between pairs of states.
    pub fn overlap_matrix(&self) -> Result<Array2<f64>, NumericError> {
        let solution = self.converged()?;
        Ok(covariance::overlap_matrix(&solution.w_nk(), &self.n_k_f()))
    }

    /// Computes the asymptotic covariance of the free-energy estimates.
    ///
    /// Poor overlap shows up here as large variances and a small
    /// `condition_number` diagnostic, not as an error; the computation only
    /// fails if the eigen-decomposition does not converge or produces
    /// non-finite entries.
    pub fn covariance(&self) -> Result<Covariance, NumericError> {
        let solution = self.converged()?;
        let theta = covariance::asymptotic_covariance(&solution.w_nk(), &self.n_k_f())?;
        let projected = covariance::project_onto_reference(&theta.matrix, self.reference_state);
        Ok(Covariance {
            theta: theta.matrix,
            projected,
            condition_number: theta.condition_number,
        })
    }

    /// Computes the matrix of free energy differences $f_j - f_i$ and their
    /// one-sigma uncertainties for all pairs of states.
    pub fn free_energy_differences(&self) -> Result<FreeEnergyDifferences, NumericError> {
        let solution = self.converged()?;
        let theta = covariance::asymptotic_covariance(&solution.w_nk(), &self.n_k_f())?;
        let states = self.k();

        let mut delta_f = Array2::zeros((states, states));
        let mut d_delta_f = Array2::zeros((states, states));
        for i in 0..states {
            for j in 0..states {
                delta_f[[i, j]] = solution.f_k[j] - solution.f_k[i];
                let variance =
                    theta.matrix[[i, i]] + theta.matrix[[j, j]] - 2.0 * theta.matrix[[i, j]];
                d_delta_f[[i, j]] = variance.max(0.0).sqrt();
            }
        }
        Ok(FreeEnergyDifferences { delta_f, d_delta_f })
    }

    /// Compute the expectation of an observable of a phase space function.
    ///
    /// Computes $\langle A \rangle_k = \sum_n W_{nk} A_n$ at every sampled
    /// state, or, if `target_u_ln` is given, at each of its target states
    /// (which need not have been sampled), together with one-sigma
    /// uncertainties propagated jointly with the free energies.
    ///
    /// # Parameters
    ///
    /// * `a_n[n]` is the observable evaluated at sample `n` in concatenated
    ///   indexing; every entry must be finite.
    /// * `target_u_ln[l][n]`, if given, is the reduced potential of sample
    ///   `n` under target state `l`.
    ///
    /// References: see Section IV of [1] in the [`MBar`] docs.
    pub fn expectations(
        &self,
        a_n: &Array1<f64>,
        target_u_ln: Option<&Array2<f64>>,
    ) -> Result<Expectations, NumericError> {
        let solution = self.converged()?;
        if a_n.len() != self.n_tot() {
            return Err(NumericError::ObservableLengthMismatch {
                actual: a_n.len(),
                expected: self.n_tot(),
            });
        }
        if let Some(u_ln) = target_u_ln {
            if u_ln.len_of(Axis(1)) != self.n_tot() {
                return Err(NumericError::TargetShapeMismatch {
                    actual: u_ln.len_of(Axis(1)),
                    expected: self.n_tot(),
                });
            }
        }

        let out = expectation::expectations(
            &solution.log_w_nk,
            &solution.log_denominator_n,
            &self.n_k_f(),
            a_n,
            target_u_ln,
        )?;
        Ok(Expectations {
            mu: out.mu,
            sigma: out.sigma,
            theta: out.theta,
        })
    }

    /// Computes the free energies of perturbed target states that were never
    /// sampled, by reweighting the existing mixture of samples.
    ///
    /// `target_u_ln[l][n]` is the reduced potential of sample `n` under
    /// target state `l`. The returned values share the solution's scale with
    /// the reference state pinned at zero; uncertainties are relative to the
    /// reference state.
    pub fn perturbed_free_energies(
        &self,
        target_u_ln: &Array2<f64>,
    ) -> Result<PerturbedFreeEnergies, NumericError> {
        let solution = self.converged()?;
        if target_u_ln.len_of(Axis(1)) != self.n_tot() {
            return Err(NumericError::TargetShapeMismatch {
                actual: target_u_ln.len_of(Axis(1)),
                expected: self.n_tot(),
            });
        }

        let out = expectation::perturbed_free_energies(
            &solution.log_w_nk,
            &solution.log_denominator_n,
            &self.n_k_f(),
            target_u_ln,
            self.reference_state,
        )?;
        Ok(PerturbedFreeEnergies {
            f_l: out.f_l,
            df_l: out.df_l,
        })
    }

    /// Compute the effective sample number of each state.
    ///
    /// The effective sample number is an estimate of how many samples are
    /// contributing to the average at a given state, using the Kish (1965)
    /// formula $n_\mathrm{eff}(k) = 1 / \sum_n W_{nk}^2$.
    ///
    /// As the weights become more concentrated in fewer observations, the
    /// effective sample size shrinks. It is most useful to diagnose when
    /// there are only a few samples contributing to the averages.
    pub fn effective_sample_numbers(&self) -> Result<Array1<f64>, NumericError> {
        let solution = self.converged()?;
        let w_nk = solution.w_nk();
        let mut n_eff = Array1::zeros(self.k());
        for k in 0..self.k() {
            let sum_sq: f64 = w_nk.index_axis(Axis(1), k).iter().map(|w| w * w).sum();
            n_eff[k] = 1.0 / sum_sq;
        }
        Ok(n_eff)
    }
}
