use crate::errors::*;
use ndarray::{array, Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

/// Test cases using harmonic oscillators.
///
/// State `k` has the reduced potential $u_k(x) = \frac{\beta K_k}{2} (x - O_k)^2$, so its samples
/// are normally distributed and its free energy is known exactly.
///
/// # Examples
///
/// Generate energy samples with default parameters.
///
/// ```
/// use mbar_rs::testsystems::*;
/// use ndarray::array;
///
/// let testcase = HarmonicOscillator::default();
/// let Sample {x_n, u_kn, n_k, s_n} = testcase.sample(array![10, 20, 30, 40, 50]).unwrap();
/// assert_eq!(u_kn.dim(), (5, 150));
/// ```
///
/// Retrieve analytical properties.
///
/// ```
/// # use mbar_rs::testsystems::*;
/// let testcase = HarmonicOscillator::default();
/// let analytical_means = testcase.analytical_means();
/// let analytical_variances = testcase.analytical_variances();
/// let analytical_standard_deviations = testcase.analytical_standard_deviations();
/// let analytical_free_energies = testcase.analytical_free_energies();
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct HarmonicOscillator {
    /// Offset parameters for each state.
    #[builder(default = "array![0.0, 1.0, 2.0, 3.0, 4.0]")]
    o_k: Array1<f64>,

    /// Force constants for each state.
    #[builder(default = "array![1.0, 2.0, 4.0, 8.0, 16.0]")]
    k_k: Array1<f64>,

    /// Inverse temperature
    #[builder(default = "1.0")]
    beta: f64,
}

impl HarmonicOscillatorBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(o_k), Some(k_k)) = (&self.o_k, &self.k_k) {
            if o_k.len() != k_k.len() {
                return Err(format!(
                    "o_k and k_k must have equal lengths (not {} and {})",
                    o_k.len(),
                    k_k.len()
                ));
            }
        }
        if let Some(k_k) = &self.k_k {
            if k_k.iter().any(|&k| !(k > 0.0)) {
                return Err("force constants must be positive".to_string());
            }
        }
        if let Some(beta) = self.beta {
            if !(beta > 0.0) {
                return Err(format!("beta must be positive, not {}", beta));
            }
        }

        Ok(())
    }

    /// Build the test case
    pub fn build(&self) -> Result<HarmonicOscillator> {
        Ok(self.build_inner()?)
    }
}

impl HarmonicOscillator {
    /// Get a new builder for the `HarmonicOscillator` struct.
    pub fn builder() -> HarmonicOscillatorBuilder {
        HarmonicOscillatorBuilder::default()
    }

    /// Number of states
    pub fn k(&self) -> usize {
        self.o_k.len()
    }

    /// Draw samples from the distribution with a random seed
    pub fn sample(&self, n_k: Array1<usize>) -> Result<Sample> {
        self.sample_inner(n_k, &mut StdRng::from_entropy())
    }

    /// Draw samples from the distribution with a specified seed
    pub fn sample_with_seed(&self, n_k: Array1<usize>, seed: u64) -> Result<Sample> {
        self.sample_inner(n_k, &mut StdRng::seed_from_u64(seed))
    }

    fn sample_inner<R: Rng>(&self, n_k: Array1<usize>, rng: &mut R) -> Result<Sample> {
        if n_k.len() != self.k() {
            return Err(MBarError::DimensionMismatch(n_k.len(), self.k()));
        }

        let sigma_k = self.analytical_standard_deviations();
        let n_tot = n_k.sum();
        let mut x_n = Vec::with_capacity(n_tot);
        let mut s_n = Vec::with_capacity(n_tot);
        for (k, &n) in n_k.iter().enumerate() {
            let normal = Normal::new(self.o_k[k], sigma_k[k])
                .map_err(|e| MBarError::InvalidInput(e.to_string()))?;
            x_n.extend(normal.sample_iter(&mut *rng).take(n));
            s_n.extend(std::iter::repeat(k).take(n));
        }

        let x_n = Array1::from(x_n);
        let u_kn = Array2::from_shape_fn((self.k(), n_tot), |(k, n)| {
            self.reduced_potential(k, x_n[n])
        });

        Ok(Sample {
            x_n,
            u_kn,
            n_k,
            s_n: Array1::from(s_n),
        })
    }

    /// Reduced potential of position `x` at state `k`
    pub fn reduced_potential(&self, k: usize, x: f64) -> f64 {
        0.5 * self.beta * self.k_k[k] * (x - self.o_k[k]).powi(2)
    }

    /// Mean position at each state
    pub fn analytical_means(&self) -> Array1<f64> {
        self.o_k.clone()
    }

    /// Variance of the position at each state
    pub fn analytical_variances(&self) -> Array1<f64> {
        self.k_k.mapv(|k| 1.0 / (self.beta * k))
    }

    /// Standard deviation of the position at each state
    pub fn analytical_standard_deviations(&self) -> Array1<f64> {
        self.analytical_variances().mapv(f64::sqrt)
    }

    /// Dimensionless free energy of each state, $f_k = -\ln \sqrt{2 \pi / (\beta K_k)}$
    pub fn analytical_free_energies(&self) -> Array1<f64> {
        self.analytical_standard_deviations()
            .mapv(|sigma| -(sigma * (2.0 * PI).sqrt()).ln())
    }
}

impl Default for HarmonicOscillator {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("HarmonicOscillator should not fail with default params")
    }
}

/// A sample from a test case
#[derive(Debug, Clone)]
pub struct Sample {
    /// `x_n[n]` is sample n (in concatenated indexing)
    pub x_n: Array1<f64>,
    /// `u_kn[k,n]` is the reduced potential of sample n (in concatenated indexing) evaluated at state k.
    pub u_kn: Array2<f64>,
    /// `n_k[k]` is the number of samples generated from state k
    pub n_k: Array1<usize>,
    /// `s_n[n]` is the state of origin of `x_n[n]`
    pub s_n: Array1<usize>,
}
