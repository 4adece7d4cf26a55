//! Free energy differences and expectations at new states, with their joint covariance.

use crate::covariance;
use crate::errors::*;
use crate::logsumexp::logsumexp;
use crate::mbar::MBar;
use crate::observer::{Observer, Silent};
use ndarray::{s, Array1, Array2, ArrayView1, Axis};

/// Result of a reweighting query
#[derive(Debug, Clone, PartialEq)]
pub struct Reweighted {
    /// `values[0]` is $f_\mathrm{target} - f_\mathrm{ref}$; `values[1 + i]` is the expectation of
    /// observable `i` at the target state
    pub values: Array1<f64>,
    /// Covariance matrix of `values`
    pub covariance: Array2<f64>,
}

impl MBar {
    /// Compute the free energy of a new state relative to an existing one, together with the
    /// expectations of any number of observables at the new state.
    ///
    /// # Parameters
    ///
    /// * `u_n[n]` is the reduced potential of pooled sample `n` at the target state
    ///
    /// * `a_n[i][n]` is the value of observable `i` at pooled sample `n`
    ///
    /// * `reference` is the index of the fitted state the free energy is measured from
    ///
    /// # Notes
    ///
    /// The query is itself an MBAR problem over augmented states. For the target state and the
    /// reference state, and for every observable, a state whose Boltzmann factor is the target's
    /// multiplied by the (shifted, strictly positive) observable is appended to the fitted states
    /// with no samples. An expectation is then the ratio of two normalising constants, and the
    /// covariance of the logarithms of all those constants follows from the same asymptotic
    /// covariance as the fitted free energies. The delta method turns that into the covariance of
    /// the returned values.
    ///
    /// Each observable is shifted by one less than its minimum so that every shifted value is at
    /// least one. The shift is added back to the expectation and does not change the estimate.
    pub fn reweight(
        &self,
        u_n: &Array1<f64>,
        a_n: &[Array1<f64>],
        reference: usize,
    ) -> Result<Reweighted> {
        self.reweight_observed(u_n, a_n, reference, &mut Silent)
    }

    /// As [`MBar::reweight`], reporting the result to `observer`
    pub fn reweight_observed(
        &self,
        u_n: &Array1<f64>,
        a_n: &[Array1<f64>],
        reference: usize,
        observer: &mut dyn Observer,
    ) -> Result<Reweighted> {
        let n_tot = self.n_tot();
        if u_n.len() != n_tot {
            return Err(MBarError::DimensionMismatch(u_n.len(), n_tot));
        }
        if let Some(a) = a_n.iter().find(|a| a.len() != n_tot) {
            return Err(MBarError::DimensionMismatch(a.len(), n_tot));
        }
        if reference >= self.k() {
            return Err(MBarError::InvalidInput(format!(
                "reference state {} does not exist; there are {} states",
                reference,
                self.k()
            )));
        }
        if u_n.iter().any(|u| !u.is_finite()) {
            return Err(MBarError::InvalidInput("target potential is not finite".to_string()));
        }
        if a_n.iter().flatten().any(|a| !a.is_finite()) {
            return Err(MBarError::InvalidInput("observable is not finite".to_string()));
        }

        let (f_target, target) = self.normalised_log_weights(u_n.view());
        let (f_ref, ref_log_w) = self.normalised_log_weights(self.u_kn().row(reference));
        let f_diff = f_target - f_ref;

        let result = if a_n.is_empty() {
            let theta = self.augmented_covariance(&[target, ref_log_w])?;
            Reweighted {
                values: Array1::from(vec![f_diff]),
                covariance: Array2::from_elem(
                    (1, 1),
                    covariance::difference_variance(&theta, 0, 1),
                ),
            }
        } else {
            let n = a_n.len();
            let shift: Vec<f64> = a_n
                .iter()
                .map(|a| a.fold(f64::INFINITY, |m, &x| m.min(x)) - 1.0)
                .collect();

            // Entries 0..n are the observables at the target, entry n is the first observable at
            // the reference state
            let state_map: Vec<(&Array1<f64>, usize)> = std::iter::repeat(&target)
                .zip(0..n)
                .chain(std::iter::once((&ref_log_w, 0)))
                .collect();

            let mut ratios = Vec::with_capacity(n + 1);
            let mut columns = Vec::with_capacity(2 * (n + 1));
            for &(log_w, i) in &state_map {
                let log_numerator: Array1<f64> = log_w
                    .iter()
                    .zip(a_n[i].iter())
                    .map(|(lw, a)| lw + (a - shift[i]).ln())
                    .collect();
                let f_numerator = -logsumexp(log_numerator.iter().copied());
                ratios.push((-f_numerator).exp());
                columns.push(log_numerator + f_numerator);
            }
            columns.extend(state_map.iter().map(|&(log_w, _)| log_w.clone()));

            let theta = self.augmented_covariance(&columns)?;

            let mut values = Array1::<f64>::zeros(n + 1);
            values[0] = f_diff;
            let mut g = Array2::<f64>::zeros((2 * (n + 1), n + 1));
            g[[n + 1, 0]] = -1.0;
            g[[2 * n + 1, 0]] = 1.0;
            for i in 0..n {
                values[i + 1] = ratios[i] + shift[i];
                g[[i, i + 1]] = ratios[i];
                g[[n + 1 + i, i + 1]] = -ratios[i];
            }

            let covariance = g.t().dot(&theta).dot(&g);
            let covariance = (&covariance + &covariance.t()) * 0.5;
            Reweighted { values, covariance }
        };

        observer.reweighted(&result);
        Ok(result)
    }

    /// Log weights $-u_n - c_n + f$ of a state over the pooled samples, normalised so that the
    /// weights sum to one, together with the free energy $f$ that normalises them
    pub(crate) fn normalised_log_weights(&self, u_n: ArrayView1<'_, f64>) -> (f64, Array1<f64>) {
        let log_w = &u_n.mapv(|u| -u) - self.log_denominator_n();
        let f = -logsumexp(log_w.iter().copied());
        (f, log_w + f)
    }

    /// Covariance of the free energies of extra states, given by their normalised log weights,
    /// estimated jointly with the fitted states
    ///
    /// The extra states carry no samples. Only the block belonging to the extra states is
    /// returned.
    pub(crate) fn augmented_covariance(&self, log_w: &[Array1<f64>]) -> Result<Array2<f64>> {
        let k = self.k();
        let extra = log_w.len();

        let mut w_nk = Array2::<f64>::zeros((self.n_tot(), k + extra));
        w_nk.slice_mut(s![.., ..k]).assign(&self.w_nk());
        let mut extra_w = w_nk.slice_mut(s![.., k..]);
        for (mut column, lw) in extra_w.axis_iter_mut(Axis(1)).zip(log_w) {
            column.assign(&lw.mapv(f64::exp));
        }

        let mut n_k = Array1::<f64>::zeros(k + extra);
        n_k.slice_mut(s![..k]).assign(&self.n_k().mapv(|n| n as f64));

        let theta = covariance::asymptotic_covariance(&w_nk, &n_k, self.covariance_method())?;
        Ok(theta.slice(s![k.., k..]).to_owned())
    }
}
