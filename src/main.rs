use anyhow::Result;
use mbar::testsystems::HarmonicOscillator;
use mbar::MBar;
use ndarray::array;

fn main() -> Result<()> {
    let testcase = HarmonicOscillator::default();
    let sample = testcase.sample(array![100, 100, 100, 100, 100]);

    let mut mbar = MBar::builder()
        .u_kn(sample.u_kn)
        .n_k(sample.n_k)
        .build()?;
    let solution = mbar.solve()?;
    println!(
        "Converged in {} iterations ({:?} strategy)",
        solution.iterations(),
        solution.strategy()
    );

    let f_k = solution.f_k().clone();
    let analytical = testcase.analytical_free_energies();
    let covariance = mbar.covariance()?;

    println!("\n{:>5} {:>12} {:>12} {:>12}", "state", "estimated", "sigma", "analytical");
    for k in 0..mbar.k() {
        let sigma = covariance.projected[[k, k]].max(0.0).sqrt();
        println!(
            "{:>5} {:>12.6} {:>12.6} {:>12.6}",
            k, f_k[k], sigma, analytical[k]
        );
    }

    let n_eff = mbar.effective_sample_numbers()?;
    let n_eff: Vec<String> = n_eff.iter().map(|n| format!("{:.1}", n)).collect();
    println!("\neffective sample numbers: [{}]", n_eff.join(", "));

    let means = mbar.expectations(&sample.x_n, None)?;
    println!("\n{:>5} {:>12} {:>12} {:>12}", "state", "<x>", "sigma", "analytical");
    for k in 0..mbar.k() {
        println!(
            "{:>5} {:>12.6} {:>12.6} {:>12.6}",
            k,
            means.mu[k],
            means.sigma[k],
            testcase.analytical_means()[k]
        );
    }

    Ok(())
}
