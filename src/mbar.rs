use crate::covariance::{self, CovarianceMethod};
use crate::errors::*;
use crate::logsumexp::logsumexp;
use crate::observer::{Observer, Silent, Step, Verbose};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};

/// Define the initial guess for free energies
#[derive(Debug, Clone, PartialEq)]
pub enum InitialFreeEnergies {
    /// Use the specified free energy values
    Specified(Vec<f64>),
    /// Initialize all free energies to zero
    Zeros,
}

impl Default for InitialFreeEnergies {
    fn default() -> Self {
        Self::Zeros
    }
}

impl From<&[f64]> for InitialFreeEnergies {
    fn from(slice: &[f64]) -> Self {
        Self::Specified(Vec::from(slice))
    }
}

/// Multistate Bennett acceptance ratio method (MBAR) for the analysis of multiple equilibrium
/// samples.
///
/// An `MBar` is always solved: building one runs the self-consistent solution of the MBAR
/// equations to convergence and computes the asymptotic covariance and overlap matrices. The
/// result is immutable afterwards, so any number of queries (see [`MBar::reweight`] and
/// [`MBar::compute_pmf`]) can share it.
///
/// # Notes
///
/// Note that this method assumes the data are uncorrelated.
///
/// Correlated data must be subsampled to extract uncorrelated (effectively independent) samples.
///
/// # Examples
///
/// ```
/// use mbar_rs::mbar::MBar;
/// use ndarray::array;
///
/// let mbar = MBar::builder()
///     .u_kn(array![
///         [1.4, 2.3, 3.7, 4.1, 7.7, 9.1],
///         [-1.6, -2.3, 9.7, 34.1, 27.7, 19.1],
///         [4.4, 7.3, 9.7, 8.1, 4.7, 3.1],
///     ])
///     .n_k(array![2, 2, 2])
///     .build()
///     .unwrap();
///
/// assert_eq!(mbar.f_k()[0], 0.0);
/// assert_eq!(mbar.theta().dim(), (3, 3));
/// ```
///
/// # References
///
/// 1. Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
/// equilibrium states. J. Chem. Phys. 129:124105, 2008 <http://dx.doi.org/10.1063/1.2978177>
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct MBar {
    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    u_kn: Array2<f64>,

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    ///
    /// The samples are pooled in state order: the first `n_k[0]` columns of `u_kn` come from
    /// state 0, the next `n_k[1]` from state 1, and so forth. States with no samples are allowed
    /// as long as some state is sampled.
    n_k: Array1<usize>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "10000")]
    maximum_iterations: usize,

    /// Set to determine the tolerance convergence criteria
    #[builder(default = "1.0e-12")]
    relative_tolerance: f64,

    /// Set to the initial dimensionless free energies to use as a guess
    #[builder(default)]
    initial_free_energies: InitialFreeEnergies,

    /// How to compute the asymptotic covariance of the free energies
    #[builder(default)]
    covariance_method: CovarianceMethod,

    /// Converged free energies, with `f_k[0] == 0`
    #[builder(setter(skip), default = "Array1::zeros(0)")]
    f_k: Array1<f64>,

    /// `log_denominator_n[n]` is $c_n = \ln \sum_j N_j e^{f_j - u_{jn}}$ at the converged `f_k`
    #[builder(setter(skip), default = "Array1::zeros(0)")]
    log_denominator_n: Array1<f64>,

    /// `log_w_nk[n][k]` is $\ln W_{nk} = f_k - u_{kn} - c_n$
    #[builder(setter(skip), default = "Array2::zeros((0, 0))")]
    log_w_nk: Array2<f64>,

    /// Asymptotic covariance matrix of `f_k`
    #[builder(setter(skip), default = "Array2::zeros((0, 0))")]
    theta: Array2<f64>,

    /// Overlap matrix
    #[builder(setter(skip), default = "Array2::zeros((0, 0))")]
    overlap: Array2<f64>,

    /// Iterations taken by the solve
    #[builder(setter(skip), default = "0")]
    iterations: usize,
}

impl MBarBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(u_kn), Some(n_k)) = (&self.u_kn, &self.n_k) {
            let k = u_kn.len_of(Axis(0));
            let n_tot = u_kn.len_of(Axis(1));

            if k == 0 {
                return Err("there must be at least one state".to_string());
            }

            if k != n_k.len() {
                return Err(format!(
                    "n_k's length must equal the number of states ({})",
                    k
                ));
            }

            if n_tot != n_k.sum() {
                return Err(format!(
                    "n_k.sum() must equal the total number of samples ({})",
                    n_tot
                ));
            }

            if n_tot == 0 {
                return Err("there must be at least one sample".to_string());
            }

            if let Some(((k, n), _)) = u_kn.indexed_iter().find(|(_, u)| !u.is_finite()) {
                return Err(format!("u_kn[{}][{}] is not finite", k, n));
            }

            if let Some(InitialFreeEnergies::Specified(f)) = &self.initial_free_energies {
                if f.len() != k {
                    return Err(format!(
                        "initial free energies must have one entry per state ({}), not {}",
                        k,
                        f.len()
                    ));
                }
                if f.iter().any(|x| !x.is_finite()) {
                    return Err("initial free energies must be finite".to_string());
                }
            }
        }

        if let Some(tol) = self.relative_tolerance {
            if !(tol > 0.0) {
                return Err(format!("relative_tolerance must be positive, not {}", tol));
            }
        }

        Ok(())
    }

    /// Build and solve the MBAR equations, reporting progress through `tracing`
    pub fn build_verbose(&self) -> Result<MBar> {
        self.build_observed(&mut Verbose)
    }

    /// Build and solve the MBAR equations
    pub fn build(&self) -> Result<MBar> {
        self.build_observed(&mut Silent)
    }

    /// Build and solve the MBAR equations, reporting progress to `observer`
    pub fn build_observed(&self, observer: &mut dyn Observer) -> Result<MBar> {
        let new = self.build_inner()?;
        new.init(observer)
    }
}

impl MBar {
    /// Solve the MBAR equations; called by build methods
    fn init(mut self, observer: &mut dyn Observer) -> Result<Self> {
        let f_k = match &self.initial_free_energies {
            InitialFreeEnergies::Specified(energies) => Array1::from(energies.clone()),
            InitialFreeEnergies::Zeros => Array1::zeros(self.k()),
        };

        let (f_k, iterations) = self.solve(f_k, observer)?;
        let f_k = &f_k - f_k[0];

        self.log_denominator_n = self.log_denominators(&f_k);
        self.f_k = f_k;
        self.log_w_nk = self.log_weights(&self.f_k, &self.log_denominator_n);
        self.iterations = iterations;

        let w_nk = self.w_nk();
        let n_k = self.n_k.mapv(|n| n as f64);
        self.theta = covariance::asymptotic_covariance(&w_nk, &n_k, self.covariance_method)?;
        self.overlap = covariance::overlap(&w_nk, &n_k);

        observer.solved(&self);
        Ok(self)
    }

    /// Get a new builder for the `MBar` struct. `MBar` can only be constructed via the builder.
    pub fn builder() -> MBarBuilder {
        MBarBuilder::default()
    }

    /// $N_{tot}$, the total number of snapshots from all states
    pub fn n_tot(&self) -> usize {
        self.u_kn.len_of(Axis(1))
    }

    /// $K$, the total number of thermodynamic states
    pub fn k(&self) -> usize {
        self.u_kn.len_of(Axis(0))
    }

    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    pub fn u_kn(&self) -> &Array2<f64> {
        &self.u_kn
    }

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    pub fn n_k(&self) -> &Array1<usize> {
        &self.n_k
    }

    /// The relative dimensionless free energy $f_k$ of states $k$, with $f_0 = 0$
    pub fn f_k(&self) -> &Array1<f64> {
        &self.f_k
    }

    /// The log weight matrix $\ln(W_{nk})$
    pub fn log_w_nk(&self) -> &Array2<f64> {
        &self.log_w_nk
    }

    /// A copy of the weight matrix $W_{nk}$
    ///
    /// Each column sums to one, and $\sum_k N_k W_{nk} = 1$ for every sample.
    pub fn w_nk(&self) -> Array2<f64> {
        self.log_w_nk.mapv(f64::exp)
    }

    /// $c_n = \ln \sum_k N_k e^{f_k - u_{kn}}$, the normalising log-denominator of every sample
    pub fn log_denominator_n(&self) -> &Array1<f64> {
        &self.log_denominator_n
    }

    /// Asymptotic covariance matrix $\Theta$ of the free energies
    pub fn theta(&self) -> &Array2<f64> {
        &self.theta
    }

    /// Overlap matrix, $O_{ij} = N_j \sum_n W_{ni} W_{nj}$
    ///
    /// Rows sum to one. $O_{ii}$ approaches one for a state that shares no configurations with the
    /// others; an off-diagonal entry close to zero flags a poorly connected pair of states.
    pub fn overlap(&self) -> &Array2<f64> {
        &self.overlap
    }

    /// Number of iterations the solve took
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// How the covariance matrix was computed
    pub fn covariance_method(&self) -> CovarianceMethod {
        self.covariance_method
    }

    /// Compute the effective sample number of each state
    ///
    /// The effective sample number $n_\mathrm{eff}(k)$ is an estimate of how many samples are
    /// contributing to the average at a given state.
    ///
    /// # Returns
    ///
    /// `n_eff[k]` is the estimated number of samples contributing to estimates at each
    /// state k. An estimate to how many samples collected just at state k would result
    /// in similar statistical efficiency as the MBAR simulation. Valid for both sampled
    /// states, in which the weight will be greater than `N_k[k]`, and unsampled states.
    ///
    /// # Notes
    ///
    /// Using Kish (1965) formula (Kish, Leslie (1965). Survey Sampling. New York: Wiley)
    ///
    /// $$
    ///     n_\mathrm{eff}(k)
    ///         =  \frac{(\sum_{n=1}^N w_{kn})^2}{\sum_{n=1}^N w_{kn}^2}
    ///         =  \frac{1}{\sum_{n=1}^N w_{kn}^2}
    /// $$
    pub fn n_eff(&self) -> Array1<f64> {
        self.log_w_nk
            .axis_iter(Axis(1))
            .map(|log_w| {
                let sum = log_w.mapv(f64::exp).sum();
                sum * sum / log_w.mapv(|x| (2.0 * x).exp()).sum()
            })
            .collect()
    }

    /// Free energy differences between every pair of states and their uncertainties
    pub fn free_energy_differences(&self) -> FreeEnergyDifferences {
        let k = self.k();
        let delta_f = Array2::from_shape_fn((k, k), |(i, j)| self.f_k[j] - self.f_k[i]);
        let d_delta_f = Array2::from_shape_fn((k, k), |(i, j)| {
            covariance::difference_variance(&self.theta, i, j).sqrt()
        });
        FreeEnergyDifferences { delta_f, d_delta_f }
    }

    /// Calculate the variance of a weighted sum of free energies, $\mathrm{Var}(\sum_k a_k f_k)$
    ///
    /// With `a` holding +1 and -1 this is the variance of a sum of free energy differences.
    pub fn variance_of_sum(&self, a: &Array1<f64>) -> Result<f64> {
        if a.len() != self.k() {
            return Err(MBarError::DimensionMismatch(a.len(), self.k()));
        }
        Ok(a.dot(&self.theta.dot(a)).max(0.0))
    }

    /// The reduced potential of the mixture distribution at every pooled sample
    ///
    /// $u^0_n = -\ln \sum_k \frac{N_k}{N} e^{f_k - u_{kn}}$, which is $\ln N - c_n$.
    pub fn mixture_potential(&self) -> Array1<f64> {
        let ln_n_tot = (self.n_tot() as f64).ln();
        self.log_denominator_n.mapv(|c| ln_n_tot - c)
    }

    /// `p_kn[k][n]` is the probability that sample `n` was drawn from state `k`
    ///
    /// $P_{kn} = \frac{N_k}{N} e^{f_k - u_{kn} + u^0_n} = N_k W_{nk}$. Every column sums to one.
    pub fn state_probabilities(&self) -> Array2<f64> {
        let mut p_kn = self.w_nk().reversed_axes();
        for (mut row, &n) in p_kn.axis_iter_mut(Axis(0)).zip(self.n_k.iter()) {
            row *= n as f64;
        }
        p_kn
    }

    /// Right-hand side of the MBAR equations: $f_k$ recomputed from the current
    /// log-denominators for every state
    pub fn self_consistent_free_energies(&self) -> Array1<f64> {
        self.u_kn
            .axis_iter(Axis(0))
            .map(|u_n| free_energy_of(u_n, &self.log_denominator_n))
            .collect()
    }

    /// $c_n = \ln \sum_j N_j e^{f_j - u_{jn}}$ over the sampled states
    pub(crate) fn log_denominators(&self, f_k: &Array1<f64>) -> Array1<f64> {
        let sampled: Vec<(usize, f64)> = self
            .n_k
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n > 0)
            .map(|(k, &n)| (k, (n as f64).ln() + f_k[k]))
            .collect();

        self.u_kn
            .axis_iter(Axis(1))
            .map(|u_k| logsumexp(sampled.iter().map(|&(k, a)| a - u_k[k])))
            .collect()
    }

    fn log_weights(&self, f_k: &Array1<f64>, log_denominator_n: &Array1<f64>) -> Array2<f64> {
        let mut log_w_nk = self.u_kn.t().mapv(|u| -u);
        for (mut row, &c) in log_w_nk.axis_iter_mut(Axis(0)).zip(log_denominator_n.iter()) {
            Zip::from(&mut row).and(f_k).for_each(|lw, &f| *lw += f - c);
        }
        log_w_nk
    }

    /// $r_k = \ln \sum_n W_{nk}$ for every state, given the log-denominators
    fn residuals(&self, f_k: &Array1<f64>, log_denominator_n: &Array1<f64>) -> Array1<f64> {
        self.u_kn
            .axis_iter(Axis(0))
            .zip(f_k.iter())
            .map(|(u_n, &f)| f - free_energy_of(u_n, log_denominator_n))
            .collect()
    }

    /// Largest residual over the sampled states
    fn max_residual(&self, r_k: &Array1<f64>) -> f64 {
        r_k.iter()
            .zip(self.n_k.iter())
            .filter(|&(_, &n)| n > 0)
            .fold(0.0_f64, |acc, (r, _)| acc.max(r.abs()))
    }

    /// Iterate the MBAR equations to self-consistency.
    ///
    /// Each iteration computes both the self-consistent update and a Newton-Raphson step and keeps
    /// whichever lands closer to the fixed point. The free energies float; nothing here pins a
    /// gauge except the Newton step holding the first sampled state still.
    fn solve(
        &self,
        mut f_k: Array1<f64>,
        observer: &mut dyn Observer,
    ) -> Result<(Array1<f64>, usize)> {
        let tolerance = self.relative_tolerance;
        let mut c_n = self.log_denominators(&f_k);
        let mut r_k = self.residuals(&f_k, &c_n);
        let mut residual = self.max_residual(&r_k);

        for iteration in 0..self.maximum_iterations {
            if residual < tolerance {
                // Unsampled states sit exactly on their self-consistent values
                return Ok((&f_k - &r_k, iteration));
            }

            let f_sc = &f_k - &r_k;
            let c_sc = self.log_denominators(&f_sc);
            let r_sc = self.residuals(&f_sc, &c_sc);
            let res_sc = self.max_residual(&r_sc);

            let newton = self.newton_step(&f_k, &r_k, &c_n).map(|f_nr| {
                let c_nr = self.log_denominators(&f_nr);
                let r_nr = self.residuals(&f_nr, &c_nr);
                let res_nr = self.max_residual(&r_nr);
                (f_nr, c_nr, r_nr, res_nr)
            });

            let step = match newton {
                Some((f_nr, c_nr, r_nr, res_nr)) if res_nr.is_finite() && res_nr < res_sc => {
                    f_k = f_nr;
                    c_n = c_nr;
                    r_k = r_nr;
                    residual = res_nr;
                    Step::Newton
                }
                _ => {
                    f_k = f_sc;
                    c_n = c_sc;
                    r_k = r_sc;
                    residual = res_sc;
                    Step::SelfConsistent
                }
            };

            observer.iteration(iteration, residual, step);
        }

        if residual < tolerance {
            return Ok((&f_k - &r_k, self.maximum_iterations));
        }

        Err(MBarError::Convergence {
            iterations: self.maximum_iterations,
            residual,
            f_k: (&f_k - f_k[0]).to_vec(),
        })
    }

    /// One Newton-Raphson step on the MBAR objective
    /// $\sum_n c_n - \sum_k N_k f_k$, whose gradient is $N_k (e^{r_k} - 1)$ and whose Hessian is
    /// $H_{kl} = \delta_{kl} N_k \sum_n W_{nk} - N_k N_l \sum_n W_{nk} W_{nl}$.
    ///
    /// Only sampled states take part; the first of them is held fixed to remove the gauge
    /// freedom. Returns `None` when the reduced Hessian is singular.
    fn newton_step(
        &self,
        f_k: &Array1<f64>,
        r_k: &Array1<f64>,
        log_denominator_n: &Array1<f64>,
    ) -> Option<Array1<f64>> {
        let sampled: Vec<usize> = (0..self.k()).filter(|&k| self.n_k[k] > 0).collect();
        let free = &sampled[1..];
        if free.is_empty() {
            return None;
        }

        let log_w_nk = self.log_weights(f_k, log_denominator_n);
        let n_k = |k: usize| self.n_k[k] as f64;

        let m = free.len();
        let hessian = DMatrix::from_fn(m, m, |a, b| {
            let (k, l) = (free[a], free[b]);
            let cross: f64 = log_w_nk
                .column(k)
                .iter()
                .zip(log_w_nk.column(l).iter())
                .map(|(x, y)| (x + y).exp())
                .sum();
            let diag = if a == b { n_k(k) * r_k[k].exp() } else { 0.0 };
            diag - n_k(k) * n_k(l) * cross
        });
        let gradient = DVector::from_iterator(m, free.iter().map(|&k| n_k(k) * r_k[k].exp_m1()));

        let delta = hessian.lu().solve(&gradient)?;
        if delta.iter().any(|d| !d.is_finite()) {
            return None;
        }

        let mut f_new = f_k - r_k;
        f_new[sampled[0]] = f_k[sampled[0]];
        for (a, &k) in free.iter().enumerate() {
            f_new[k] = f_k[k] - delta[a];
        }
        Some(f_new)
    }
}

/// $-\ln \sum_n e^{-u_n - c_n}$
pub(crate) fn free_energy_of(u_n: ArrayView1<'_, f64>, log_denominator_n: &Array1<f64>) -> f64 {
    -logsumexp(
        u_n.iter()
            .zip(log_denominator_n.iter())
            .map(|(u, c)| -u - c),
    )
}

/// Free energy differences between all pairs of states
#[derive(Debug, Clone)]
pub struct FreeEnergyDifferences {
    /// `delta_f[i, j]` is the dimensionless free energy difference $f_j - f_i$
    pub delta_f: Array2<f64>,
    /// `d_delta_f[i, j]` is the uncertainty in the dimensionless free energy difference $f_j - f_i$
    pub d_delta_f: Array2<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Recorder;
    use crate::testsystems::{HarmonicOscillator, Sample};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn small() -> MBarBuilder {
        let mut builder = MBar::builder();
        builder
            .u_kn(array![
                [1.4, 2.3, 3.7, 4.1, 7.7, 9.1],
                [-1.6, -2.3, 9.7, 34.1, 27.7, 19.1],
                [4.4, 7.3, 9.7, 8.1, 4.7, 3.1],
            ])
            .n_k(array![2, 2, 2]);
        builder
    }

    fn oscillators(n: usize, seed: u64) -> Sample {
        HarmonicOscillator::default()
            .sample_with_seed(Array1::from_elem(5, n), seed)
            .unwrap()
    }

    #[test]
    fn build_mbar() {
        let mbar = small().build_inner().unwrap();

        assert_eq!(
            mbar.u_kn,
            array![
                [1.4, 2.3, 3.7, 4.1, 7.7, 9.1],
                [-1.6, -2.3, 9.7, 34.1, 27.7, 19.1],
                [4.4, 7.3, 9.7, 8.1, 4.7, 3.1],
            ]
        );
        assert_eq!(mbar.n_k, array![2, 2, 2]);
        assert_eq!(mbar.maximum_iterations, 10000);
        assert_eq!(mbar.relative_tolerance, 1.0e-12);
        assert_eq!(mbar.initial_free_energies, InitialFreeEnergies::Zeros);
        assert_eq!(mbar.covariance_method, CovarianceMethod::SvdEw);
    }

    #[test]
    fn rejects_bad_shapes() {
        let err = small().n_k(array![2, 2]).build().unwrap_err();
        assert!(matches!(err, MBarError::InvalidInput(_)));

        let err = small().n_k(array![2, 2, 1]).build().unwrap_err();
        assert!(matches!(err, MBarError::InvalidInput(_)));

        let err = MBar::builder()
            .u_kn(Array2::zeros((1, 0)))
            .n_k(array![0])
            .build()
            .unwrap_err();
        assert!(matches!(err, MBarError::InvalidInput(_)));
    }

    #[test]
    fn rejects_non_finite_potentials_and_bad_tolerance() {
        let err = MBar::builder()
            .u_kn(array![[0.0, f64::NAN], [1.0, 2.0]])
            .n_k(array![1, 1])
            .build()
            .unwrap_err();
        assert!(matches!(err, MBarError::InvalidInput(_)));

        let err = small().relative_tolerance(0.0).build().unwrap_err();
        assert!(matches!(err, MBarError::InvalidInput(_)));

        let err = small()
            .initial_free_energies(InitialFreeEnergies::Specified(vec![0.0]))
            .build()
            .unwrap_err();
        assert!(matches!(err, MBarError::InvalidInput(_)));
    }

    #[test]
    fn missing_field_is_invalid_input() {
        let err = MBar::builder().n_k(array![1]).build().unwrap_err();
        assert!(matches!(err, MBarError::InvalidInput(_)));
    }

    #[test]
    fn self_consistency_residual() {
        let mbar = small().build().unwrap();
        let rhs = mbar.self_consistent_free_energies();
        let rhs = &rhs - rhs[0];
        for (f, g) in mbar.f_k().iter().zip(rhs.iter()) {
            assert_abs_diff_eq!(f, g, epsilon = 1e-10);
        }
        for col in mbar.w_nk().axis_iter(Axis(1)) {
            assert_abs_diff_eq!(col.sum(), 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn mixture_weights_sum_to_one_per_sample() {
        let mbar = small().build().unwrap();
        let p_kn = mbar.state_probabilities();
        for col in p_kn.axis_iter(Axis(1)) {
            assert_abs_diff_eq!(col.sum(), 1.0, epsilon = 1e-10);
        }
        let u0 = mbar.mixture_potential();
        let expected = -logsumexp(
            (0..3).map(|k| mbar.f_k()[k] + (2.0f64 / 6.0).ln() - mbar.u_kn()[[k, 0]]),
        );
        assert_abs_diff_eq!(u0[0], expected, epsilon = 1e-10);
    }

    #[test]
    fn gauge_invariance() {
        let Sample { u_kn, n_k, .. } = oscillators(50, 7);
        let shifted = &u_kn + 37.5;

        let a = MBar::builder().u_kn(u_kn).n_k(n_k.clone()).build().unwrap();
        let b = MBar::builder().u_kn(shifted).n_k(n_k).build().unwrap();

        for (x, y) in a.f_k().iter().zip(b.f_k().iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-8);
        }
        for (x, y) in a.theta().iter().zip(b.theta().iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-8);
        }
    }

    #[test]
    fn initial_guess_does_not_change_answer() {
        let Sample { u_kn, n_k, .. } = oscillators(40, 3);
        let a = MBar::builder()
            .u_kn(u_kn.clone())
            .n_k(n_k.clone())
            .build()
            .unwrap();
        let b = MBar::builder()
            .u_kn(u_kn)
            .n_k(n_k)
            .initial_free_energies(InitialFreeEnergies::from(&[3.0, -1.0, 2.0, 0.5, 9.0][..]))
            .build()
            .unwrap();
        for (x, y) in a.f_k().iter().zip(b.f_k().iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-8);
        }
    }

    #[test]
    fn recovers_analytical_free_energies() {
        let testcase = HarmonicOscillator::default();
        let Sample { u_kn, n_k, .. } = testcase
            .sample_with_seed(Array1::from_elem(5, 2000), 11)
            .unwrap();
        let mbar = MBar::builder().u_kn(u_kn).n_k(n_k).build().unwrap();

        let analytical = testcase.analytical_free_energies();
        let analytical = &analytical - analytical[0];
        let differences = mbar.free_energy_differences();
        for k in 1..5 {
            let error = (mbar.f_k()[k] - analytical[k]).abs();
            let sigma = differences.d_delta_f[[0, k]];
            assert!(sigma > 0.0);
            assert!(error < 6.0 * sigma, "state {}: error {} sigma {}", k, error, sigma);
        }
    }

    #[test]
    fn shared_samples_with_pure_shift() {
        // The same samples evaluated under a potential shifted by 5
        let Sample { u_kn, .. } = HarmonicOscillator::builder()
            .o_k(array![0.0])
            .k_k(array![1.0])
            .build()
            .unwrap()
            .sample_with_seed(array![2000], 5)
            .unwrap();
        let u0 = u_kn.row(0).to_owned();
        let u1 = &u0 + 5.0;
        let mut u_kn = Array2::<f64>::zeros((2, 2000));
        u_kn.row_mut(0).assign(&u0);
        u_kn.row_mut(1).assign(&u1);

        let mbar = MBar::builder()
            .u_kn(u_kn)
            .n_k(array![1000, 1000])
            .build()
            .unwrap();

        assert_abs_diff_eq!(mbar.f_k()[1] - mbar.f_k()[0], 5.0, epsilon = 1e-6);
        let var = covariance::difference_variance(mbar.theta(), 0, 1);
        assert_abs_diff_eq!(var, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn symmetric_covariance_and_overlap() {
        let Sample { u_kn, n_k, .. } = oscillators(100, 1);
        let mbar = MBar::builder().u_kn(u_kn).n_k(n_k).build().unwrap();
        let (theta, overlap) = (mbar.theta(), mbar.overlap());
        for i in 0..5 {
            assert_abs_diff_eq!(overlap.row(i).sum(), 1.0, epsilon = 1e-10);
            for j in 0..5 {
                assert_abs_diff_eq!(theta[[i, j]], theta[[j, i]], epsilon = 1e-12);
                assert_abs_diff_eq!(overlap[[i, j]], overlap[[j, i]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn self_overlap_of_separated_states() {
        let Sample { u_kn, n_k, .. } = HarmonicOscillator::builder()
            .o_k(array![0.0, 40.0])
            .k_k(array![1.0, 1.0])
            .build()
            .unwrap()
            .sample_with_seed(array![200, 200], 2)
            .unwrap();
        let mbar = MBar::builder()
            .u_kn(u_kn)
            .n_k(n_k)
            .covariance_method(CovarianceMethod::Approximate)
            .build()
            .unwrap();
        assert_abs_diff_eq!(mbar.overlap()[[0, 0]], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(mbar.overlap()[[1, 1]], 1.0, epsilon = 1e-8);
    }

    #[test]
    fn disconnected_states_are_singular() {
        let Sample { u_kn, n_k, .. } = HarmonicOscillator::builder()
            .o_k(array![0.0, 40.0])
            .k_k(array![1.0, 1.0])
            .build()
            .unwrap()
            .sample_with_seed(array![200, 200], 2)
            .unwrap();
        let err = MBar::builder().u_kn(u_kn).n_k(n_k).build().unwrap_err();
        assert_eq!(err, MBarError::SingularCovariance { states: vec![1] });
    }

    #[test]
    fn unsampled_state_is_evaluated() {
        let Sample { u_kn, .. } = oscillators(100, 9);
        let mut n_k = Array1::from_elem(5, 100);
        // Pretend state 4's samples came from state 3
        n_k[3] = 200;
        n_k[4] = 0;
        let mbar = MBar::builder().u_kn(u_kn).n_k(n_k).build().unwrap();
        let rhs = mbar.self_consistent_free_energies();
        assert_abs_diff_eq!(mbar.f_k()[4], rhs[4] - rhs[0], epsilon = 1e-10);
        assert_abs_diff_eq!(mbar.w_nk().column(4).sum(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn runs_out_of_iterations() {
        let Sample { u_kn, n_k, .. } = oscillators(50, 4);
        let err = MBar::builder()
            .u_kn(u_kn)
            .n_k(n_k)
            .maximum_iterations(1)
            .build()
            .unwrap_err();
        match err {
            MBarError::Convergence {
                iterations, f_k, ..
            } => {
                assert_eq!(iterations, 1);
                assert_eq!(f_k.len(), 5);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn observer_sees_iterations() {
        let Sample { u_kn, n_k, .. } = oscillators(50, 8);
        let mut recorder = Recorder::default();
        let mbar = MBar::builder()
            .u_kn(u_kn)
            .n_k(n_k)
            .build_observed(&mut recorder)
            .unwrap();
        assert_eq!(recorder.solves, 1);
        assert_eq!(recorder.iterations.len(), mbar.iterations());
        assert!(recorder.iterations.iter().any(|(_, step)| *step == Step::Newton));
    }

    #[test]
    fn variance_of_a_difference() {
        let Sample { u_kn, n_k, .. } = oscillators(100, 31);
        let mbar = MBar::builder().u_kn(u_kn).n_k(n_k).build().unwrap();
        let var = mbar
            .variance_of_sum(&array![-1.0, 0.0, 0.0, 1.0, 0.0])
            .unwrap();
        let expected = mbar.free_energy_differences().d_delta_f[[0, 3]].powi(2);
        assert_abs_diff_eq!(var, expected, epsilon = 1e-12);

        let err = mbar.variance_of_sum(&array![1.0]).unwrap_err();
        assert_eq!(err, MBarError::DimensionMismatch(1, 5));
    }

    #[test]
    fn single_state() {
        let mbar = MBar::builder()
            .u_kn(array![[0.3, 1.2, -0.4]])
            .n_k(array![3])
            .build()
            .unwrap();
        assert_eq!(mbar.f_k(), &array![0.0]);
        assert_abs_diff_eq!(mbar.theta()[[0, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mbar.n_eff()[0], 3.0, epsilon = 1e-12);
    }
}
