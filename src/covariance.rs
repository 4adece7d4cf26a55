//! Asymptotic covariance of MBAR free energies and the overlap matrix.
//!
//! Everything here works from a weight matrix $W_{nk}$ whose columns are normalised over the
//! pooled samples, plus the sample counts $N_k$. Columns with $N_k = 0$ are states that were
//! never sampled (or augmented states built for a query); they still get a covariance.

use crate::errors::*;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use std::collections::VecDeque;

/// Eigenvalues of $I - \Sigma V^T N V \Sigma$ below this are treated as zero
const RANK_TOLERANCE: f64 = 1.0e-10;

/// Two states overlapping less than this are not considered connected
const CONNECTIVITY_TOLERANCE: f64 = 1.0e-10;

/// Method used to compute the asymptotic covariance matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovarianceMethod {
    /// Use fast approximate expression from Kong et al.
    ///
    /// This underestimates the true covariance, but may be a good approximation in some cases and
    /// requires no matrix inversions
    Approximate,
    /// Use singular value decomposition based approach to efficiently compute uncertainty
    ///
    /// See Appendix D.1, Eq. D4 in [1].
    Svd,
    /// Use eigenvalue decomposition of W'W in a SVD-based approach to efficiently compute uncertainty
    ///
    /// The eigenvalue decomposition of W'W is used to forego computing the SVD.
    /// See Appendix D.1, Eqs. D4 and D5 of [1].
    SvdEw,
}

impl Default for CovarianceMethod {
    fn default() -> Self {
        Self::SvdEw
    }
}

/// Compute the asymptotic covariance matrix $\Theta$ of the free energies of the columns of
/// `w_nk`.
///
/// With the thin decomposition $W = U \Sigma V^T$,
///
/// $$
///     \Theta = V \Sigma \left[I - \Sigma V^T N V \Sigma\right]^+ \Sigma V^T
/// $$
///
/// where $N = \mathrm{diag}(N_k)$ and $^+$ is the Moore-Penrose pseudo-inverse. The bracketed
/// matrix always has one zero eigenvalue from the arbitrary additive constant in the free
/// energies; any further zero eigenvalue means some sampled states share no configurations with
/// the rest, and the covariance is undetermined.
///
/// The result is symmetrised.
pub fn asymptotic_covariance(
    w_nk: &Array2<f64>,
    n_k: &Array1<f64>,
    method: CovarianceMethod,
) -> Result<Array2<f64>> {
    let w = to_dmatrix(w_nk);

    let theta = match method {
        CovarianceMethod::Approximate => w.transpose() * &w,
        CovarianceMethod::SvdEw => {
            let eigen = (w.transpose() * &w).symmetric_eigen();
            let sigma = eigen.eigenvalues.map(|s2| s2.max(0.0).sqrt());
            spectral_covariance(&eigen.eigenvectors, &sigma, w_nk, n_k)?
        }
        CovarianceMethod::Svd => {
            let svd = w.svd(false, true);
            let v = svd
                .v_t
                .ok_or_else(|| {
                    MBarError::InvalidInput("SVD of the weight matrix failed".to_string())
                })?
                .transpose();
            spectral_covariance(&v, &svd.singular_values, w_nk, n_k)?
        }
    };

    Ok(symmetrise(&to_array2(&theta)))
}

fn spectral_covariance(
    v: &DMatrix<f64>,
    sigma: &DVector<f64>,
    w_nk: &Array2<f64>,
    n_k: &Array1<f64>,
) -> Result<DMatrix<f64>> {
    let rank = sigma.len();
    let mut v_sigma = v.clone();
    for (mut column, s) in v_sigma.column_iter_mut().zip(sigma.iter()) {
        column *= *s;
    }

    let n_diag = DMatrix::from_diagonal(&DVector::from_iterator(n_k.len(), n_k.iter().copied()));
    let inner = DMatrix::identity(rank, rank) - v_sigma.transpose() * n_diag * &v_sigma;

    let eigen = inner.symmetric_eigen();
    let nullity = eigen
        .eigenvalues
        .iter()
        .filter(|l| l.abs() < RANK_TOLERANCE)
        .count();
    if nullity > 1 {
        return Err(MBarError::SingularCovariance {
            states: disconnected_states(&overlap(w_nk, n_k), n_k),
        });
    }

    let inverse = eigen
        .eigenvalues
        .map(|l| if l.abs() < RANK_TOLERANCE { 0.0 } else { 1.0 / l });
    let pinv =
        &eigen.eigenvectors * DMatrix::from_diagonal(&inverse) * eigen.eigenvectors.transpose();

    Ok(&v_sigma * pinv * v_sigma.transpose())
}

/// Overlap matrix, $O_{ij} = N_j \sum_n W_{ni} W_{nj}$
///
/// Each row sums to one when every sample's weights satisfy $\sum_k N_k W_{nk} = 1$. The matrix
/// is symmetric only when the sample counts are equal.
pub fn overlap(w_nk: &Array2<f64>, n_k: &Array1<f64>) -> Array2<f64> {
    let mut o = w_nk.t().dot(w_nk);
    for mut row in o.rows_mut() {
        row *= n_k;
    }
    o
}

/// $\mathrm{Var}(f_j - f_i) = \Theta_{ii} + \Theta_{jj} - 2 \Theta_{ij}$, clamped at zero
pub fn difference_variance(theta: &Array2<f64>, i: usize, j: usize) -> f64 {
    (theta[[i, i]] + theta[[j, j]] - 2.0 * theta[[i, j]]).max(0.0)
}

/// Sampled states that cannot be reached from the first sampled state through pairs with
/// non-negligible overlap
fn disconnected_states(overlap: &Array2<f64>, n_k: &Array1<f64>) -> Vec<usize> {
    let sampled: Vec<usize> = (0..n_k.len()).filter(|&k| n_k[k] > 0.0).collect();
    let first = match sampled.first() {
        Some(&k) => k,
        None => return Vec::new(),
    };

    let mut reached = vec![false; n_k.len()];
    reached[first] = true;
    let mut queue = VecDeque::from(vec![first]);
    while let Some(i) = queue.pop_front() {
        for &j in &sampled {
            if !reached[j] && overlap[[i, j]].max(overlap[[j, i]]) > CONNECTIVITY_TOLERANCE {
                reached[j] = true;
                queue.push_back(j);
            }
        }
    }

    sampled.into_iter().filter(|&k| !reached[k]).collect()
}

fn symmetrise(a: &Array2<f64>) -> Array2<f64> {
    (a + &a.t()) * 0.5
}

fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    let (rows, cols) = a.dim();
    DMatrix::from_fn(rows, cols, |i, j| a[[i, j]])
}

fn to_array2(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(m.shape(), |(i, j)| m[(i, j)])
}
