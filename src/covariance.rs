//! Overlap diagnostics and the asymptotic covariance of the free-energy
//! estimates.
//!
//! The covariance follows the eigen-decomposition route of Appendix D.1 of
//! the MBAR paper (eqs. D4 and D5): with $W = U \Sigma V^T$, the covariance
//! of the log partition-function estimates is
//! $\Theta = V \Sigma (I - \Sigma V^T N V \Sigma)^{+} \Sigma V^T$,
//! where $N$ is the diagonal matrix of sample counts. The singular values
//! come from a symmetric eigen-decomposition of $W^T W$, which avoids
//! forming the SVD of the full N×K weight matrix.

use crate::errors::NumericError;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, Axis};

/// Relative eigenvalue cutoff for the pseudo-inverse.
const PINV_CUTOFF: f64 = 1.0e-12;

/// Asymptotic covariance of the free energies, with a conditioning
/// diagnostic for the weight Gram matrix.
#[derive(Debug, Clone)]
pub(crate) struct Theta {
    /// Covariance of the (unprojected) log partition-function estimates.
    pub matrix: Array2<f64>,
    /// Smallest over largest eigenvalue of $W^T W$. Small values mean poor
    /// overlap between states and large (but legitimate) uncertainties.
    pub condition_number: f64,
}

/// Computes the asymptotic covariance matrix from a converged weight matrix
/// (N×K, columns may include appended zero-count states) and the per-column
/// sample counts.
pub(crate) fn asymptotic_covariance(
    w_nk: &Array2<f64>,
    n_k: &[f64],
) -> Result<Theta, NumericError> {
    let states = w_nk.len_of(Axis(1));
    debug_assert_eq!(states, n_k.len());

    let gram = w_nk.t().dot(w_nk);
    let gram = DMatrix::from_fn(states, states, |i, j| 0.5 * (gram[[i, j]] + gram[[j, i]]));

    let eigen = SymmetricEigen::try_new(gram, 1.0e-13, 100 * states.max(10))
        .ok_or(NumericError::EigenDecomposition { context: "W'W" })?;
    let v = eigen.eigenvectors;
    let sigma: Vec<f64> = eigen
        .eigenvalues
        .iter()
        .map(|&lambda| lambda.max(0.0).sqrt())
        .collect();

    let lambda_max = sigma.iter().fold(0.0_f64, |a, &s| a.max(s * s));
    let lambda_min = sigma.iter().fold(f64::INFINITY, |a, &s| a.min(s * s));
    let condition_number = if lambda_max > 0.0 {
        lambda_min / lambda_max
    } else {
        0.0
    };

    // inner = I - S V' N V S
    let mut inner = DMatrix::identity(states, states);
    for i in 0..states {
        for j in 0..states {
            let mut dot = 0.0;
            for (k, n) in n_k.iter().enumerate() {
                dot += v[(k, i)] * n * v[(k, j)];
            }
            inner[(i, j)] -= sigma[i] * dot * sigma[j];
        }
    }

    let pinv = pseudo_inverse(inner)?;

    // Theta = V S pinv S V'
    let mut scaled = pinv;
    for i in 0..states {
        for j in 0..states {
            scaled[(i, j)] *= sigma[i] * sigma[j];
        }
    }
    let theta = &v * scaled * v.transpose();

    let mut matrix = Array2::zeros((states, states));
    for i in 0..states {
        for j in 0..states {
            let entry = theta[(i, j)];
            if !entry.is_finite() {
                return Err(NumericError::NonFiniteCovariance { row: i, col: j });
            }
            matrix[[i, j]] = entry;
        }
    }

    Ok(Theta {
        matrix,
        condition_number,
    })
}

/// Moore-Penrose pseudo-inverse of a symmetric matrix, dropping eigenvalues
/// below `PINV_CUTOFF` relative to the largest magnitude. The dropped
/// directions are exactly the additive-constant degree of freedom of the
/// free energies.
fn pseudo_inverse(matrix: DMatrix<f64>) -> Result<DMatrix<f64>, NumericError> {
    let dim = matrix.nrows();
    let symmetric = DMatrix::from_fn(dim, dim, |i, j| 0.5 * (matrix[(i, j)] + matrix[(j, i)]));
    let eigen = SymmetricEigen::try_new(symmetric, 1.0e-13, 100 * dim.max(10)).ok_or(
        NumericError::EigenDecomposition {
            context: "covariance pseudo-inverse",
        },
    )?;

    let max_magnitude = eigen
        .eigenvalues
        .iter()
        .fold(0.0_f64, |a, &l| a.max(l.abs()));
    let cutoff = PINV_CUTOFF * max_magnitude;

    let mut inverse = DMatrix::zeros(dim, dim);
    for (index, &lambda) in eigen.eigenvalues.iter().enumerate() {
        if lambda.abs() > cutoff {
            let column = eigen.eigenvectors.column(index);
            let scale = 1.0 / lambda;
            for i in 0..dim {
                for j in 0..dim {
                    inverse[(i, j)] += scale * column[i] * column[j];
                }
            }
        }
    }
    Ok(inverse)
}

/// The K×K state overlap matrix,
/// $O_{ij} = \sqrt{N_i N_j} \sum_n W_{ni} W_{nj}$.
///
/// Symmetric with entries in [0, 1]; diagonal entries near one indicate a
/// state whose samples overlap little with any other state.
pub(crate) fn overlap_matrix(w_nk: &Array2<f64>, n_k: &[f64]) -> Array2<f64> {
    let states = w_nk.len_of(Axis(1));
    let gram = w_nk.t().dot(w_nk);

    let mut overlap = Array2::zeros((states, states));
    for i in 0..states {
        for j in 0..states {
            overlap[[i, j]] = (n_k[i] * n_k[j]).sqrt() * 0.5 * (gram[[i, j]] + gram[[j, i]]);
        }
    }
    overlap
}

/// Projects a covariance onto the subspace orthogonal to the reference
/// state: entry (i, j) becomes $\mathrm{cov}(f_i - f_r,\ f_j - f_r)$.
pub(crate) fn project_onto_reference(theta: &Array2<f64>, reference: usize) -> Array2<f64> {
    let states = theta.len_of(Axis(0));
    let mut projected = Array2::zeros((states, states));
    for i in 0..states {
        for j in 0..states {
            projected[[i, j]] = theta[[i, j]] - theta[[i, reference]] - theta[[reference, j]]
                + theta[[reference, reference]];
        }
    }
    projected
}
