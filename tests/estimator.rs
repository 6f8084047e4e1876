//! End-to-end checks against the harmonic oscillator test case, for which
//! every quantity the estimator produces is known in closed form.

use itertools::izip;
use mbar::testsystems::HarmonicOscillator;
use mbar::MBar;
use ndarray::{array, Array1, Array2, Axis};

fn solved_oscillator(seed: u64) -> (HarmonicOscillator, Array1<f64>, MBar) {
    let testcase = HarmonicOscillator::default();
    let sample = testcase.sample_with_seed(array![200, 200, 200, 200, 200], seed);
    let x_n = sample.x_n;
    let mut mbar = MBar::builder()
        .u_kn(sample.u_kn)
        .n_k(sample.n_k)
        .build()
        .unwrap();
    mbar.solve().unwrap();
    (testcase, x_n, mbar)
}

#[test]
fn free_energies_match_the_analytical_values() {
    let (testcase, _, mbar) = solved_oscillator(1234);
    let f_k = mbar.solution().unwrap().f_k();
    let analytical = testcase.analytical_free_energies();

    assert_eq!(f_k[0], 0.0);
    for (estimated, exact) in izip!(f_k.iter(), analytical.iter()) {
        assert!(
            (estimated - exact).abs() < 0.35,
            "estimated {} too far from analytical {}",
            estimated,
            exact
        );
    }
}

#[test]
fn estimates_fall_within_reported_uncertainties() {
    let (testcase, _, mbar) = solved_oscillator(77);
    let f_k = mbar.solution().unwrap().f_k().clone();
    let analytical = testcase.analytical_free_energies();
    let covariance = mbar.covariance().unwrap();

    for k in 1..mbar.k() {
        let sigma = covariance.projected[[k, k]].max(0.0).sqrt();
        assert!(sigma > 0.0);
        // Six sigma plus a floor keeps this robust to the seed while still
        // catching any gross miscalibration of the error estimate.
        assert!((f_k[k] - analytical[k]).abs() < 6.0 * sigma + 0.05);
    }
}

#[test]
fn weight_columns_normalize_after_the_solve() {
    let (_, _, mbar) = solved_oscillator(5);
    let w_nk = mbar.solution().unwrap().w_nk();
    for k in 0..mbar.k() {
        let column_sum: f64 = w_nk.index_axis(Axis(1), k).iter().sum();
        assert!(
            (column_sum - 1.0).abs() < 1e-8,
            "column {} sums to {}",
            k,
            column_sum
        );
    }
}

#[test]
fn reference_state_choice_does_not_change_differences() {
    let testcase = HarmonicOscillator::default();
    let sample = testcase.sample_with_seed(array![150, 150, 150, 150, 150], 9);

    let mut first = MBar::builder()
        .u_kn(sample.u_kn.clone())
        .n_k(sample.n_k.clone())
        .build()
        .unwrap();
    let mut second = MBar::builder()
        .u_kn(sample.u_kn)
        .n_k(sample.n_k)
        .reference_state(2)
        .build()
        .unwrap();

    let f_first = first.solve().unwrap().f_k().clone();
    let f_second = second.solve().unwrap().f_k().clone();

    assert_eq!(f_first[0], 0.0);
    assert_eq!(f_second[2], 0.0);

    let diff_first = first.free_energy_differences().unwrap();
    let diff_second = second.free_energy_differences().unwrap();
    for i in 0..5 {
        for j in 0..5 {
            assert!((diff_first.delta_f[[i, j]] - diff_second.delta_f[[i, j]]).abs() < 1e-8);
            assert!((diff_first.d_delta_f[[i, j]] - diff_second.d_delta_f[[i, j]]).abs() < 1e-8);
        }
    }

    // The two solutions agree up to the additive constant fixed by the
    // reference choice.
    let offset = f_first[2];
    for (a, b) in izip!(f_first.iter(), f_second.iter()) {
        assert!((a - offset - b).abs() < 1e-8);
    }
}

#[test]
fn warm_start_from_the_solution_converges_immediately() {
    let (_, _, mut mbar) = solved_oscillator(31);
    let f_first = mbar.solution().unwrap().f_k().clone();

    let second = mbar.solve_from(&f_first).unwrap();
    assert!(second.iterations() <= 1);
    for (a, b) in izip!(f_first.iter(), second.f_k().iter()) {
        assert!((a - b).abs() < 1e-8);
    }
}

#[test]
fn overlap_matrix_is_symmetric_and_bounded() {
    let (_, _, mbar) = solved_oscillator(13);
    let overlap = mbar.overlap_matrix().unwrap();

    for i in 0..5 {
        for j in 0..5 {
            assert!(overlap[[i, j]] >= -1e-12);
            assert!(overlap[[i, j]] <= 1.0 + 1e-12);
            assert!((overlap[[i, j]] - overlap[[j, i]]).abs() < 1e-12);
        }
    }

    // Adjacent oscillators share phase space; the ends of the ladder barely
    // overlap at all.
    assert!(overlap[[0, 1]] > overlap[[0, 4]]);
}

#[test]
fn expectations_match_the_analytical_means() {
    let (testcase, x_n, mbar) = solved_oscillator(21);
    let means = mbar.expectations(&x_n, None).unwrap();
    let analytical = testcase.analytical_means();

    for (mu, sigma, exact) in izip!(means.mu.iter(), means.sigma.iter(), analytical.iter()) {
        assert!(sigma.is_finite() && *sigma >= 0.0);
        assert!(
            (mu - exact).abs() < 0.2,
            "estimated mean {} too far from {}",
            mu,
            exact
        );
    }
}

#[test]
fn perturbed_free_energy_interpolates_the_ladder() {
    let (_, x_n, mbar) = solved_oscillator(55);

    // An unsampled oscillator halfway between states 0 and 1, with force
    // constant 1.5; its analytical free energy relative to state 0 is
    // (1/2) ln 1.5.
    let o_target = 0.5;
    let k_target = 1.5;
    let mut u_ln = Array2::zeros((1, x_n.len()));
    for (n, &x) in x_n.iter().enumerate() {
        u_ln[[0, n]] = 0.5 * k_target * (x - o_target) * (x - o_target);
    }

    let perturbed = mbar.perturbed_free_energies(&u_ln).unwrap();
    let exact = 0.5 * 1.5_f64.ln();
    assert!((perturbed.f_l[0] - exact).abs() < 0.2);
    assert!(perturbed.df_l[0].is_finite() && perturbed.df_l[0] >= 0.0);
}

#[test]
fn effective_sample_numbers_are_sensible() {
    let (_, _, mbar) = solved_oscillator(3);
    let n_eff = mbar.effective_sample_numbers().unwrap();
    let n_tot = mbar.n_tot() as f64;

    for &n in n_eff.iter() {
        assert!(n >= 1.0 - 1e-9);
        assert!(n <= n_tot + 1e-9);
    }
    // The broad state 0 reweights more of the pool than the narrow state 4.
    assert!(n_eff[0] > n_eff[4]);
}
