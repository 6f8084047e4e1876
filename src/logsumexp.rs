//! Numerically stable log-domain reductions.
//!
//! Every reweighting sum in this crate goes through one of these functions:
//! the running maximum is subtracted before exponentiating and added back
//! afterwards, so inputs spanning hundreds of natural-log units of range
//! neither overflow nor underflow.
//!
//! All functions here are pure and safe to call concurrently.

use crate::errors::NumericError;

/// Computes $\log \sum_i e^{x_i}$ without overflow or underflow.
///
/// Fails with [`NumericError::ZeroWeightSum`] when the total weight is zero,
/// i.e. when the input is empty or every entry is `-inf`. Callers that want
/// a `-inf` result in that case should use [`logsumexp_allowing_empty`]
/// instead.
pub fn logsumexp(values: &[f64]) -> Result<f64, NumericError> {
    let total = logsumexp_allowing_empty(values);
    if total == f64::NEG_INFINITY {
        Err(NumericError::ZeroWeightSum {
            terms: values.len(),
        })
    } else {
        Ok(total)
    }
}

/// Computes $\log \sum_i e^{x_i}$, returning `-inf` for zero total weight.
pub fn logsumexp_allowing_empty(values: &[f64]) -> f64 {
    let max = values
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }

    let sum: f64 = values.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Computes $\log \sum_i b_i e^{x_i}$ for non-negative linear weights $b_i$.
///
/// Terms with zero weight are skipped entirely, so their `x_i` may be any
/// value (including `-inf`). Fails with [`NumericError::ZeroWeightSum`] when
/// no term carries weight; use [`logsumexp_weighted_allowing_empty`] to
/// permit a `-inf` result instead.
pub fn logsumexp_weighted(values: &[f64], weights: &[f64]) -> Result<f64, NumericError> {
    let total = logsumexp_weighted_allowing_empty(values, weights);
    if total == f64::NEG_INFINITY {
        Err(NumericError::ZeroWeightSum {
            terms: values.len(),
        })
    } else {
        Ok(total)
    }
}

/// Computes $\log \sum_i b_i e^{x_i}$, returning `-inf` for zero total weight.
pub fn logsumexp_weighted_allowing_empty(values: &[f64], weights: &[f64]) -> f64 {
    debug_assert_eq!(values.len(), weights.len());

    let max = values
        .iter()
        .zip(weights)
        .filter(|(_, &b)| b > 0.0)
        .map(|(&x, _)| x)
        .fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }

    let sum: f64 = values
        .iter()
        .zip(weights)
        .filter(|(_, &b)| b > 0.0)
        .map(|(&x, &b)| b * (x - max).exp())
        .sum();
    max + sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_naive_sum_for_small_inputs() {
        let values: [f64; 4] = [0.3, -1.2, 0.0, 2.5];
        let naive: f64 = values.iter().map(|x| x.exp()).sum::<f64>().ln();
        assert!((logsumexp(&values).unwrap() - naive).abs() < 1e-14);
    }

    #[test]
    fn single_element_is_identity() {
        assert_eq!(logsumexp(&[-17.25]).unwrap(), -17.25);
    }

    #[test]
    fn identical_inputs_reduce_to_log_count() {
        let values = [3.5; 8];
        let expected = 3.5 + (8.0_f64).ln();
        assert!((logsumexp(&values).unwrap() - expected).abs() < 1e-14);
    }

    #[test]
    fn survives_huge_dynamic_range() {
        // exp(800) overflows f64; the result must still be finite and
        // dominated by the largest term.
        let values = [800.0, 0.0, -800.0];
        let result = logsumexp(&values).unwrap();
        assert!(result.is_finite());
        assert!((result - 800.0).abs() < 1e-12);

        let values = [-745.0, -746.0];
        let result = logsumexp(&values).unwrap();
        assert!(result.is_finite());
        assert!(result < -744.0 && result > -745.0);
    }

    #[test]
    fn all_neg_inf_is_an_error_unless_permitted() {
        let values = [f64::NEG_INFINITY, f64::NEG_INFINITY];
        assert!(matches!(
            logsumexp(&values),
            Err(NumericError::ZeroWeightSum { terms: 2 })
        ));
        assert_eq!(logsumexp_allowing_empty(&values), f64::NEG_INFINITY);
        assert_eq!(logsumexp_allowing_empty(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn weighted_sum_matches_naive() {
        let values: [f64; 3] = [0.1, 1.3, -0.7];
        let weights = [2.0, 0.5, 3.0];
        let naive: f64 = values
            .iter()
            .zip(&weights)
            .map(|(x, b)| b * x.exp())
            .sum::<f64>()
            .ln();
        assert!((logsumexp_weighted(&values, &weights).unwrap() - naive).abs() < 1e-14);
    }

    #[test]
    fn zero_weight_terms_are_skipped() {
        // The -inf entry carries no weight, so it must not poison the sum.
        let values = [f64::NEG_INFINITY, 1.0];
        let weights = [0.0, 2.0];
        let expected = 1.0 + (2.0_f64).ln();
        assert!((logsumexp_weighted(&values, &weights).unwrap() - expected).abs() < 1e-14);

        let all_zero = logsumexp_weighted(&values, &[0.0, 0.0]);
        assert!(matches!(
            all_zero,
            Err(NumericError::ZeroWeightSum { .. })
        ));
    }
}
