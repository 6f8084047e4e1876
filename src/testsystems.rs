//! Analytically solvable model systems for validating the estimator.

use crate::errors::ConstructionError;
use ndarray::{array, Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

/// Test cases using harmonic oscillators.
///
/// Each state `k` is a one-dimensional harmonic oscillator with equilibrium
/// position `o_k` and force constant `k_k`, so the equilibrium distribution
/// is a Gaussian with mean `o_k` and variance $1 / (\beta K_k)$ and every
/// analytical property is available in closed form.
///
/// # Examples
///
/// Generate energy samples with default parameters.
///
/// ```
/// use mbar::testsystems::*;
/// use ndarray::array;
///
/// let testcase = HarmonicOscillator::default();
/// let Sample { x_n, u_kn, n_k, s_n } = testcase.sample(array![10, 20, 30, 40, 50]);
/// ```
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct HarmonicOscillator {
    /// Offset parameters for each state.
    #[builder(default = "array![0.0, 1.0, 2.0, 3.0, 4.0]")]
    o_k: Array1<f64>,

    /// Force constants for each state.
    #[builder(default = "array![1.0, 2.0, 4.0, 8.0, 16.0]")]
    k_k: Array1<f64>,

    /// Inverse temperature
    #[builder(default = "1.0")]
    beta: f64,
}

impl HarmonicOscillatorBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(o_k), Some(k_k)) = (&self.o_k, &self.k_k) {
            if o_k.len() != k_k.len() {
                return Err(format!(
                    "o_k and k_k must have equal lengths (not {} and {})",
                    o_k.len(),
                    k_k.len()
                ));
            }
        }

        if let Some(k_k) = &self.k_k {
            if k_k.iter().any(|&k| !(k > 0.0)) {
                return Err("force constants must be positive".to_string());
            }
        }
        if let Some(beta) = self.beta {
            if !(beta > 0.0) {
                return Err("beta must be positive".to_string());
            }
        }

        Ok(())
    }

    /// Build and validate the test case
    pub fn build(&self) -> Result<HarmonicOscillator, ConstructionError> {
        self.build_inner().map_err(ConstructionError::from)
    }
}

impl HarmonicOscillator {
    /// Get a new builder for the `HarmonicOscillator` struct. It can only be
    /// constructed via the builder.
    pub fn builder() -> HarmonicOscillatorBuilder {
        HarmonicOscillatorBuilder::default()
    }

    /// $K$, the number of states
    pub fn k(&self) -> usize {
        self.o_k.len()
    }

    /// Draw samples from the distribution with a random seed
    pub fn sample(&self, n_k: Array1<usize>) -> Sample {
        self.sample_inner(n_k, StdRng::from_entropy())
    }

    /// Draw samples from the distribution with a specified seed
    pub fn sample_with_seed(&self, n_k: Array1<usize>, seed: u64) -> Sample {
        self.sample_inner(n_k, StdRng::seed_from_u64(seed))
    }

    fn sample_inner(&self, n_k: Array1<usize>, mut rng: StdRng) -> Sample {
        assert_eq!(
            n_k.len(),
            self.k(),
            "n_k must have one entry per oscillator"
        );
        let n_tot: usize = n_k.iter().sum();
        let states = self.k();

        let mut x_n = Array1::zeros(n_tot);
        let mut s_n = Array1::zeros(n_tot);
        let mut n = 0;
        for (k, &count) in n_k.iter().enumerate() {
            let sigma = (self.beta * self.k_k[k]).recip().sqrt();
            let normal = Normal::new(self.o_k[k], sigma)
                .expect("oscillator widths are positive and finite");
            for _ in 0..count {
                x_n[n] = rng.sample(normal);
                s_n[n] = k;
                n += 1;
            }
        }

        let mut u_kn = Array2::zeros((states, n_tot));
        for l in 0..states {
            for n in 0..n_tot {
                let displacement = x_n[n] - self.o_k[l];
                u_kn[[l, n]] = 0.5 * self.beta * self.k_k[l] * displacement * displacement;
            }
        }

        Sample { x_n, u_kn, n_k, s_n }
    }

    /// The analytical dimensionless free energy of each state, relative to
    /// state 0: $f_k = \frac{1}{2} \ln (\beta K_k / 2 \pi)$, recentered.
    pub fn analytical_free_energies(&self) -> Array1<f64> {
        let mut f_k: Array1<f64> = self
            .k_k
            .iter()
            .map(|&k| 0.5 * (self.beta * k / (2.0 * std::f64::consts::PI)).ln())
            .collect();
        let reference = f_k[0];
        f_k.mapv_inplace(|f| f - reference);
        f_k
    }

    /// The analytical expectation of the position at each state
    pub fn analytical_means(&self) -> Array1<f64> {
        self.o_k.clone()
    }

    /// The analytical variance of the position at each state,
    /// $1 / (\beta K_k)$
    pub fn analytical_variances(&self) -> Array1<f64> {
        self.k_k.iter().map(|&k| (self.beta * k).recip()).collect()
    }
}

impl Default for HarmonicOscillator {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("HarmonicOscillator should not fail with default params")
    }
}

/// A sample from a test case
#[derive(Debug)]
pub struct Sample {
    /// `x_n[n]` is sample n (in concatenated indexing)
    pub x_n: Array1<f64>,
    /// `u_kn[k,n]` is the reduced potential of sample n (in concatenated indexing) evaluated at state k.
    pub u_kn: Array2<f64>,
    /// `n_k[k]` is the number of samples generated from state k
    pub n_k: Array1<usize>,
    /// `s_n[n]` is the state of origin of `x_n[n]`
    pub s_n: Array1<usize>,
}
