use anyhow::Result;
use itertools::izip;
use mbar::testsystems::*;
use mbar::MBar;
use ndarray::{array, Array2};

fn main() -> Result<()> {
    // Generate some sample data
    let testcase = HarmonicOscillator::default();

    let Sample {
        x_n,
        u_kn,
        n_k,
        s_n: _,
    } = testcase.sample(array![100, 200, 300, 400, 500]);

    // Build the mbar struct and solve for the sampled free energies
    let mut mbar = MBar::builder().u_kn(u_kn).n_k(n_k).build()?;
    mbar.solve()?;

    // Reweight into a ladder of oscillators that were never sampled:
    // offsets halfway between the sampled ones, intermediate stiffness.
    let o_l = [0.5, 1.5, 2.5, 3.5];
    let k_l = [1.5, 3.0, 6.0, 12.0];
    let mut u_ln = Array2::zeros((o_l.len(), x_n.len()));
    for (l, (&o, &k)) in o_l.iter().zip(&k_l).enumerate() {
        for (n, &x) in x_n.iter().enumerate() {
            u_ln[[l, n]] = 0.5 * k * (x - o) * (x - o);
        }
    }

    let perturbed = mbar.perturbed_free_energies(&u_ln)?;
    println!("{:>8} {:>8} {:>12} {:>12}", "O", "K", "f", "df");
    for (o, k, f, df) in izip!(&o_l, &k_l, perturbed.f_l.iter(), perturbed.df_l.iter()) {
        println!("{:>8.2} {:>8.2} {:>12.6} {:>12.6}", o, k, f, df);
    }

    // Position expectations at the same targets
    let means = mbar.expectations(&x_n, Some(&u_ln))?;
    println!("\n{:>8} {:>12} {:>12}", "O", "<x>", "sigma");
    for (o, mu, sigma) in izip!(&o_l, means.mu.iter(), means.sigma.iter()) {
        println!("{:>8.2} {:>12.6} {:>12.6}", o, mu, sigma);
    }

    Ok(())
}
