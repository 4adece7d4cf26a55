//! Hooks for watching a solve or a reweighting query.
//!
//! Observers only ever see results; nothing they do can change the numbers. Pass [`Silent`]
//! (what [`MBarBuilder::build`](crate::mbar::MBarBuilder::build) uses) to see nothing, or
//! [`Verbose`] to have progress and diagnostics emitted through `tracing`.

use crate::mbar::MBar;
use crate::reweight::Reweighted;
use tracing::{debug, info};

/// Which update the solver accepted on an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The plain self-consistent update $f_k \leftarrow -\ln \sum_n e^{-u_{kn} - c_n}$
    SelfConsistent,
    /// A Newton-Raphson step on the MBAR objective
    Newton,
}

/// Receives progress and diagnostics from the estimator
///
/// Every method has a no-op default, so implementors pick only what they care about.
pub trait Observer {
    /// Called once per solver iteration with the residual of the iterate before the update
    fn iteration(&mut self, _iteration: usize, _residual: f64, _step: Step) {}

    /// Called once the free energies have converged and the covariance has been computed
    fn solved(&mut self, _mbar: &MBar) {}

    /// Called after each reweighting query
    fn reweighted(&mut self, _result: &Reweighted) {}
}

/// An observer that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl Observer for Silent {}

/// An observer that reports through `tracing`
///
/// Iterations are logged at `DEBUG`; free energies, the covariance matrix, the overlap matrix
/// and the effective sample numbers are logged at `INFO` after each solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verbose;

impl Observer for Verbose {
    fn iteration(&mut self, iteration: usize, residual: f64, step: Step) {
        debug!(iteration, residual, ?step, "MBAR iteration");
    }

    fn solved(&mut self, mbar: &MBar) {
        info!("Free energies after convergence: {}", mbar.f_k());
        info!("Free-energy covariance matrix:\n{}", mbar.theta());
        info!("Overlap matrix:\n{}", mbar.overlap());
        info!("Effective sample numbers: {}", mbar.n_eff());
    }

    fn reweighted(&mut self, result: &Reweighted) {
        info!("Reweighted values: {}", result.values);
        debug!("Reweighted covariance:\n{}", result.covariance);
    }
}

/// An observer that remembers what it was told; handy in tests
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    /// Residual and accepted step of every iteration, in order
    pub iterations: Vec<(f64, Step)>,
    /// Number of completed solves
    pub solves: usize,
    /// Number of completed reweighting queries
    pub queries: usize,
}

impl Observer for Recorder {
    fn iteration(&mut self, _iteration: usize, residual: f64, step: Step) {
        self.iterations.push((residual, step));
    }

    fn solved(&mut self, _mbar: &MBar) {
        self.solves += 1;
    }

    fn reweighted(&mut self, _result: &Reweighted) {
        self.queries += 1;
    }
}
