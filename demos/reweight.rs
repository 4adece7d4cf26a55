use anyhow::Result;
use itertools::izip;
use mbar_rs::prelude::*;
use ndarray::{array, Array1};

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let testcase = HarmonicOscillator::default();
    let Sample { x_n, u_kn, n_k, .. } =
        testcase.sample_with_seed(array![500, 500, 500, 500, 500], 1)?;

    let mbar = MBar::builder().u_kn(u_kn).n_k(n_k).build_verbose()?;
    println!("converged in {} iterations", mbar.iterations());

    let differences = mbar.free_energy_differences();
    let analytical = testcase.analytical_free_energies();
    for k in 0..mbar.k() {
        println!(
            "f_{} = {:.4} +- {:.4} (analytical {:.4})",
            k,
            differences.delta_f[[0, k]],
            differences.d_delta_f[[0, k]],
            analytical[k] - analytical[0]
        );
    }

    // Reweight to oscillators that were never sampled
    let x_sq = x_n.mapv(|x| x * x);
    let offsets = [0.5, 1.5, 2.5];
    let force_constants = [1.5, 3.0, 6.0];
    let mut observer = Verbose;
    for (&o, &k) in izip!(&offsets, &force_constants) {
        let u_n: Array1<f64> = x_n.mapv(|x| 0.5 * k * (x - o).powi(2));
        let result = mbar.reweight_observed(&u_n, &[x_n.clone(), x_sq.clone()], 0, &mut observer)?;
        let sigma = result.covariance.diag().mapv(f64::sqrt);
        println!(
            "O = {}, K = {}: f = {:.4} +- {:.4}, <x> = {:.4} +- {:.4}, <x^2> = {:.4} +- {:.4}",
            o, k, result.values[0], sigma[0], result.values[1], sigma[1], result.values[2], sigma[2]
        );
    }

    Ok(())
}
