#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]

//! The multistate Bennett acceptance ratio (MBAR) method for the analysis of
//! equilibrium samples from multiple arbitrary thermodynamic states in
//! computing equilibrium expectations, free energy differences, and overlap
//! diagnostics.
//!
//! All computations are performed in the log domain so that reduced
//! potentials spanning hundreds of natural-log units neither overflow nor
//! underflow. Free energies are dimensionless (multiplied by the inverse
//! temperature); only differences between them are meaningful.
//!
//! Please reference the following if you use this code in your research:
//!
//! [1] Shirts MR and Chodera JD. Statistically optimal analysis of samples
//! from multiple equilibrium states. J. Chem. Phys. 129:124105, 2008.
//! <http://dx.doi.org/10.1063/1.2978177>
//!
//! # Examples
//!
//! ```
//! use mbar::{MBar, testsystems::HarmonicOscillator};
//! use ndarray::array;
//!
//! let testcase = HarmonicOscillator::default();
//! let sample = testcase.sample_with_seed(array![50, 50, 50, 50, 50], 1);
//!
//! let mut mbar = MBar::builder()
//!     .u_kn(sample.u_kn)
//!     .n_k(sample.n_k)
//!     .build()
//!     .unwrap();
//! let solution = mbar.solve().unwrap();
//! assert_eq!(solution.f_k()[0], 0.0);
//! ```

#[macro_use]
extern crate derive_builder;

pub mod errors;
pub mod logsumexp;
pub mod mbar;
pub mod solver;
pub mod testsystems;

mod covariance;
mod expectation;
mod weights;

pub use crate::mbar::{
    Covariance, Expectations, FreeEnergyDifferences, InitialFreeEnergies, MBar, MBarBuilder,
    PerturbedFreeEnergies, Solution,
};
pub use crate::solver::{SolverState, Strategy};
