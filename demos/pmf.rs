use anyhow::Result;
use itertools::Itertools;
use mbar_rs::prelude::*;
use ndarray::{array, s, Array1};

/// Produce a sorted copy of an array
fn sorted(s: &Array1<f64>) -> Array1<f64> {
    let mut new = s.to_vec();
    new.sort_by(|a, b| a.partial_cmp(b).expect("Tried to compare a NaN"));
    Array1::from(new)
}

/// Return the indices of the bins to which each value in input array belongs.
fn digitise<T: PartialOrd>(x_n: &[T], bin_edges: &[T]) -> Vec<usize> {
    x_n.iter()
        .map(|x| {
            bin_edges.iter().enumerate().find_map(
                |(i, left)| {
                    if x < left {
                        Some(i - 1)
                    } else {
                        None
                    }
                },
            )
        })
        .map(|opt| opt.expect("Value didn't get a bin"))
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    // Generate some sample data
    let testcase = HarmonicOscillator::default();

    let Sample { x_n, u_kn, n_k, .. } = testcase.sample_with_seed(array![100, 200, 300, 400, 500], 0)?;

    println!("{:?}", n_k);

    // Build the mbar struct
    let mbar = MBar::builder()
        .u_kn(u_kn.clone())
        .n_k(n_k)
        .build_verbose()?;

    // Divide x_n into equally populated bins
    let n_bins = 10;
    let n_tot = x_n.len();
    let x_n_sorted = sorted(&x_n);
    let bin_size = n_tot / n_bins;
    let mut bin_edges = x_n_sorted.slice(s![..;bin_size]).to_vec();
    bin_edges.push(x_n_sorted[n_tot - 1] + 0.001);

    let bin_n = digitise(x_n.as_slice().expect("x_n is contiguous"), &bin_edges);

    let bin_widths: Array1<f64> = bin_edges
        .iter()
        .tuple_windows()
        .map(|(left, right)| (right - left).abs())
        .collect();

    // Compute the PMF at state 0
    let pmf = mbar.compute_pmf(
        &u_kn.row(0).to_vec(),
        &bin_n,
        n_bins,
        PmfUncertainties::FromLowest,
    )?;

    println!("{:?}", &pmf);

    // Correct for unequally spaced bins to get a PMF on uniform measure
    let f_i_corrected: Vec<_> = pmf
        .f_i
        .iter()
        .zip(bin_widths.iter())
        .map(|(f, w)| f - w.ln())
        .collect();

    println!("{:?}", &f_i_corrected);

    println!("{:?}", bin_edges);

    Ok(())
}
