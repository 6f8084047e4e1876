//! Error taxonomy: construction, numeric kernel, and solver failures are
//! distinct enums so every API method has a precise error signature.

use crate::solver::SolverState;
use thiserror::Error;

/// Errors raised while constructing an estimator from user input.
///
/// These are always fatal to the construction attempt; nothing is retried
/// internally.
#[derive(Error, Debug)]
pub enum ConstructionError {
    /// Error returned when `MBarBuilder::build()` was called with a field missing
    #[error("Could not build MBar: {0}")]
    Builder(String),

    /// Error returned when `n_k` does not have one entry per row of `u_kn`
    #[error("n_k has {n_k} entries but u_kn has {states} rows; they must match")]
    StateCountMismatch {
        /// Number of entries in `n_k`
        n_k: usize,
        /// Number of rows of `u_kn`
        states: usize,
    },

    /// Error returned when the sample counts do not add up to the number of columns of `u_kn`
    #[error("n_k sums to {total} but u_kn has {samples} columns; they must match")]
    SampleCountMismatch {
        /// Sum of `n_k`
        total: usize,
        /// Number of columns of `u_kn`
        samples: usize,
    },

    /// Error returned when a reduced potential is NaN or infinite
    #[error("u_kn[{state}][{sample}] is not finite")]
    NonFinitePotential {
        /// Row (state) index of the offending entry
        state: usize,
        /// Column (sample) index of the offending entry
        sample: usize,
    },

    /// Error returned when every state has a zero sample count
    #[error("At least one state must have a nonzero sample count")]
    NoSamples,

    /// Error returned when the reference state index is out of range
    #[error("Reference state {reference} is out of range for {states} states")]
    ReferenceOutOfRange {
        /// The requested reference state
        reference: usize,
        /// The number of states
        states: usize,
    },
}

impl From<String> for ConstructionError {
    fn from(s: String) -> Self {
        Self::Builder(s)
    }
}

/// Errors raised by the numeric kernels.
///
/// These carry enough context (which computation, which indices) to diagnose
/// the failure; no default value is ever silently substituted.
#[derive(Error, Debug)]
pub enum NumericError {
    /// Error returned when a log-sum-exp reduction had zero total weight
    /// and the caller did not explicitly permit a `-inf` result
    #[error("log-sum-exp over {terms} terms had zero total weight")]
    ZeroWeightSum {
        /// Number of terms in the reduction
        terms: usize,
    },

    /// Error returned when the mixture denominator for a sample vanished
    #[error("Mixture denominator for sample {sample} had zero total weight")]
    ZeroWeightDenominator {
        /// Concatenated index of the offending sample
        sample: usize,
    },

    /// Error returned when a symmetric eigen-decomposition did not converge
    #[error("Symmetric eigen-decomposition of the {context} matrix did not converge")]
    EigenDecomposition {
        /// Which matrix was being decomposed
        context: &'static str,
    },

    /// Error returned when the asymptotic covariance contains NaN or infinite entries
    #[error("Covariance entry ({row}, {col}) is not finite")]
    NonFiniteCovariance {
        /// Row index of the offending entry
        row: usize,
        /// Column index of the offending entry
        col: usize,
    },

    /// Error returned when a converged weight column does not sum to one
    #[error("Weight column for state {state} deviates from 1 by {deviation:e}; solve output is inconsistent")]
    WeightNormalization {
        /// The state whose column failed the check
        state: usize,
        /// Deviation of the column sum from one
        deviation: f64,
    },

    /// Error returned when an observable array is the wrong length
    #[error("Observable has {actual} entries; expected one per sample ({expected})")]
    ObservableLengthMismatch {
        /// Length of the supplied observable
        actual: usize,
        /// Total number of samples
        expected: usize,
    },

    /// Error returned when an observable value is NaN or infinite
    #[error("Observable value for sample {sample} is not finite")]
    NonFiniteObservable {
        /// Concatenated index of the offending sample
        sample: usize,
    },

    /// Error returned when a target potential matrix has the wrong number of columns
    #[error("Target potentials have {actual} columns; expected one per sample ({expected})")]
    TargetShapeMismatch {
        /// Number of columns of the supplied matrix
        actual: usize,
        /// Total number of samples
        expected: usize,
    },

    /// Error returned when a derived quantity is requested before a successful solve
    #[error("Estimator has no converged solution; call solve() first")]
    NotSolved,
}

/// Errors raised when the self-consistent solve fails.
///
/// The estimator performs exactly one internal strategy downgrade (Newton to
/// fixed-point-only) before surfacing this; a previously converged solution,
/// if any, remains intact on the estimator.
#[derive(Error, Debug)]
pub enum SolveError {
    /// Error returned when the solver reached its terminal Diverged state
    ///
    /// Carries the terminal state machine phase and the last finite
    /// free-energy estimate, so callers can retry with a different warm
    /// start or a relaxed tolerance.
    #[error("Solver reached {state:?}; last finite estimate retained")]
    Diverged {
        /// The terminal phase of the failed attempt
        state: SolverState,
        /// The last finite free-energy estimate, one entry per state
        last_f_k: Vec<f64>,
    },

    /// Error returned when a warm start has the wrong number of entries
    #[error("Warm start has {actual} entries but there are {expected} states")]
    WarmStartLengthMismatch {
        /// Length of the supplied warm start
        actual: usize,
        /// Number of states
        expected: usize,
    },

    /// Error returned when a numeric kernel failed during the solve
    #[error(transparent)]
    Numeric(#[from] NumericError),
}
