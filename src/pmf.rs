//! Potentials of mean force over a binned coordinate.

use crate::covariance::difference_variance;
use crate::errors::*;
use crate::logsumexp::logsumexp;
use crate::mbar::MBar;
use ndarray::{Array1, ArrayView1};

/// Method for reporting uncertainties for PMFs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmfUncertainties {
    /// The uncertainties in the free energy difference with lowest point on PMF are reported
    FromLowest,
    /// The uncertainties in the free energy difference with the specified bin are reported
    FromSpecified(usize),
    /// The nbins × nbins matrix $df_{ij}$ of uncertainties in free energy differences is returned
    /// instead of $df_i$
    AllDifferences,
}

impl Default for PmfUncertainties {
    fn default() -> Self {
        Self::FromLowest
    }
}

/// A Potential of Mean Force
#[derive(Debug, Clone, PartialEq)]
pub struct Pmf {
    /// `f_i[i]` is the dimensionless free energy of bin `i`, relative to the reference bin (the
    /// specified one for `FromSpecified`, otherwise the lowest)
    pub f_i: Vec<f64>,
    /// `df_i[i]` is the uncertainty in the difference of `f_i` for uncertainty options other than AllDifferences
    pub df_i: Option<Vec<f64>>,
    /// `df_ij[i][j]` is the uncertainty in the difference of `f_i` for AllDifferences
    pub df_ij: Option<Vec<Vec<f64>>>,
}

impl MBar {
    /// Compute the free energy of occupying a number of bins.
    ///
    /// This implementation computes the expectation of an indicator-function observable for each bin.
    ///
    /// # Parameters
    ///
    /// * `u_n[n]` is the reduced potential energy of snapshot `n` of state `k`
    /// for which the PMF is to be computed.
    ///
    /// * `bin_n[n]` is the bin index of snapshot `n` of state `k` and is in `0..n_bins`
    ///
    /// * `n_bins` is the number of bins. No bin may be empty of snapshots
    ///
    /// * `uncertainties` is the method for reporting uncertainties
    ///
    /// # Notes
    ///
    /// - All bins must have some samples in them from at least one of the states. Empty bins
    ///   should be removed before calling `compute_pmf()`.
    /// - This method works by computing the free energy of localizing the system to each bin for
    ///   the given potential by aggregating the log weights for the given potential.
    /// - To estimate uncertainties, the N×K weight matrix $W_{nk}$ is augmented to be N×(K+`n_bins`)
    ///   in order to accomodate the normalized weights of states where the potential is given by
    ///   `u_n` within each bin and infinite potential outside the bin. The uncertainties with
    ///   respect to the reference bin are then computed in the standard way.
    pub fn compute_pmf(
        &self,
        u_n: &[f64],
        bin_n: &[usize],
        n_bins: usize,
        uncertainties: PmfUncertainties,
    ) -> Result<Pmf> {
        if u_n.len() != self.n_tot() {
            return Err(MBarError::DimensionMismatch(u_n.len(), self.n_tot()));
        }
        if bin_n.len() != self.n_tot() {
            return Err(MBarError::DimensionMismatch(bin_n.len(), self.n_tot()));
        }
        if let Some(&bin) = bin_n.iter().find(|&&bin| bin >= n_bins) {
            return Err(MBarError::InvalidInput(format!(
                "bin index {} is out of range for {} bins",
                bin, n_bins
            )));
        }
        if let PmfUncertainties::FromSpecified(reference) = uncertainties {
            if reference >= n_bins {
                return Err(MBarError::InvalidInput(format!(
                    "reference bin {} is out of range for {} bins",
                    reference, n_bins
                )));
            }
        }
        if u_n.iter().any(|u| !u.is_finite()) {
            return Err(MBarError::InvalidInput("u_n is not finite".to_string()));
        }

        let (_, log_w_n) = self.normalised_log_weights(ArrayView1::from(u_n));

        let mut f_i = Vec::with_capacity(n_bins);
        for i in 0..n_bins {
            let f = -logsumexp(
                log_w_n
                    .iter()
                    .zip(bin_n)
                    .filter(|&(_, &bin)| bin == i)
                    .map(|(&lw, _)| lw),
            );
            if f.is_infinite() {
                return Err(MBarError::InvalidInput(format!("bin {} has no samples", i)));
            }
            f_i.push(f);
        }

        // Weights of the state confined to each bin
        let columns: Vec<Array1<f64>> = f_i
            .iter()
            .enumerate()
            .map(|(i, f)| {
                log_w_n
                    .iter()
                    .zip(bin_n)
                    .map(|(lw, &bin)| if bin == i { lw + f } else { f64::NEG_INFINITY })
                    .collect()
            })
            .collect();
        let theta = self.augmented_covariance(&columns)?;

        let reference = match uncertainties {
            PmfUncertainties::FromSpecified(reference) => reference,
            _ => lowest(&f_i),
        };
        let f_ref = f_i[reference];
        let f_i: Vec<f64> = f_i.iter().map(|f| f - f_ref).collect();

        Ok(match uncertainties {
            PmfUncertainties::AllDifferences => {
                let df_ij = (0..n_bins)
                    .map(|i| {
                        (0..n_bins)
                            .map(|j| difference_variance(&theta, i, j).sqrt())
                            .collect()
                    })
                    .collect();
                Pmf {
                    f_i,
                    df_ij: Some(df_ij),
                    df_i: None,
                }
            }
            _ => {
                let df_i = (0..n_bins)
                    .map(|i| difference_variance(&theta, i, reference).sqrt())
                    .collect();
                Pmf {
                    f_i,
                    df_i: Some(df_i),
                    df_ij: None,
                }
            }
        })
    }
}

fn lowest(f_i: &[f64]) -> usize {
    f_i.iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(best, min), (i, &f)| {
            if f < min {
                (i, f)
            } else {
                (best, min)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsystems::{HarmonicOscillator, Sample};
    use approx::assert_abs_diff_eq;

    fn fitted() -> (MBar, Sample) {
        let sample = HarmonicOscillator::default()
            .sample_with_seed(Array1::from_elem(5, 400), 41)
            .unwrap();
        let mbar = MBar::builder()
            .u_kn(sample.u_kn.clone())
            .n_k(sample.n_k.clone())
            .build()
            .unwrap();
        (mbar, sample)
    }

    /// Bin by position into `n_bins` equal-width bins over [lo, hi); outliers go to the ends
    fn bins(x_n: &Array1<f64>, lo: f64, hi: f64, n_bins: usize) -> Vec<usize> {
        let width = (hi - lo) / n_bins as f64;
        x_n.iter()
            .map(|&x| (((x - lo) / width).floor().max(0.0) as usize).min(n_bins - 1))
            .collect()
    }

    #[test]
    fn bin_probabilities_match_weights() {
        let (mbar, sample) = fitted();
        let u_n = mbar.u_kn().row(2).to_vec();
        let bin_n = bins(&sample.x_n, 0.0, 4.0, 4);
        let pmf = mbar
            .compute_pmf(&u_n, &bin_n, 4, PmfUncertainties::FromLowest)
            .unwrap();

        let (_, log_w) = mbar.normalised_log_weights(ArrayView1::from(&u_n[..]));
        let mut direct = vec![0.0; 4];
        for (lw, &bin) in log_w.iter().zip(&bin_n) {
            direct[bin] += lw.exp();
        }

        let total: f64 = pmf.f_i.iter().map(|f| (-f).exp()).sum();
        for i in 0..4 {
            assert_abs_diff_eq!((-pmf.f_i[i]).exp() / total, direct[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn reference_bin_is_zero() {
        let (mbar, sample) = fitted();
        let u_n = mbar.u_kn().row(0).to_vec();
        let bin_n = bins(&sample.x_n, -2.0, 2.0, 4);

        let pmf = mbar
            .compute_pmf(&u_n, &bin_n, 4, PmfUncertainties::FromLowest)
            .unwrap();
        let lowest = lowest(&pmf.f_i);
        assert_eq!(pmf.f_i[lowest], 0.0);
        assert!(pmf.f_i.iter().all(|&f| f >= 0.0));
        let df_i = pmf.df_i.unwrap();
        assert_abs_diff_eq!(df_i[lowest], 0.0, epsilon = 1e-10);
        assert!(df_i.iter().enumerate().all(|(i, &d)| i == lowest || d > 0.0));

        let pmf = mbar
            .compute_pmf(&u_n, &bin_n, 4, PmfUncertainties::FromSpecified(3))
            .unwrap();
        assert_eq!(pmf.f_i[3], 0.0);
        assert_abs_diff_eq!(pmf.df_i.unwrap()[3], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn symmetric_well_has_flat_halves() {
        let (mbar, sample) = fitted();
        let u_n = mbar.u_kn().row(0).to_vec();
        let bin_n: Vec<usize> = sample.x_n.iter().map(|&x| (x >= 0.0) as usize).collect();
        let pmf = mbar
            .compute_pmf(&u_n, &bin_n, 2, PmfUncertainties::FromSpecified(0))
            .unwrap();
        let sigma = pmf.df_i.unwrap()[1];
        assert!(pmf.f_i[1].abs() < 6.0 * sigma);
    }

    #[test]
    fn all_differences_agree_with_lowest() {
        let (mbar, sample) = fitted();
        let u_n = mbar.u_kn().row(1).to_vec();
        let bin_n = bins(&sample.x_n, -1.0, 3.0, 5);

        let from_lowest = mbar
            .compute_pmf(&u_n, &bin_n, 5, PmfUncertainties::FromLowest)
            .unwrap();
        let all = mbar
            .compute_pmf(&u_n, &bin_n, 5, PmfUncertainties::AllDifferences)
            .unwrap();
        assert_eq!(from_lowest.f_i, all.f_i);

        let df_ij = all.df_ij.unwrap();
        let df_i = from_lowest.df_i.unwrap();
        let lowest = lowest(&all.f_i);
        for i in 0..5 {
            assert_abs_diff_eq!(df_ij[i][i], 0.0, epsilon = 1e-10);
            assert_abs_diff_eq!(df_ij[lowest][i], df_i[i], epsilon = 1e-12);
            for j in 0..5 {
                assert_abs_diff_eq!(df_ij[i][j], df_ij[j][i], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn rejects_bad_bins() {
        let (mbar, sample) = fitted();
        let u_n = mbar.u_kn().row(0).to_vec();
        let bin_n = bins(&sample.x_n, -2.0, 2.0, 4);

        let err = mbar
            .compute_pmf(&u_n[1..], &bin_n, 4, PmfUncertainties::FromLowest)
            .unwrap_err();
        assert_eq!(err, MBarError::DimensionMismatch(1999, 2000));

        let err = mbar
            .compute_pmf(&u_n, &bin_n, 3, PmfUncertainties::FromLowest)
            .unwrap_err();
        assert!(matches!(err, MBarError::InvalidInput(_)));

        // Bin 4 is never populated
        let err = mbar
            .compute_pmf(&u_n, &bin_n, 5, PmfUncertainties::FromLowest)
            .unwrap_err();
        assert_eq!(
            err,
            MBarError::InvalidInput("bin 4 has no samples".to_string())
        );

        let err = mbar
            .compute_pmf(&u_n, &bin_n, 4, PmfUncertainties::FromSpecified(4))
            .unwrap_err();
        assert!(matches!(err, MBarError::InvalidInput(_)));
    }
}
