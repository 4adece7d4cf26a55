#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]

//! The multistate Bennett acceptance ratio (MBAR) method for the analysis of equilibrium samples
//! from multiple arbitrary thermodynamic states in computing equilibrium expectations, free energy
//! differences and potentials of mean force, with asymptotic uncertainties.
//!
//! Build an [`MBar`](mbar::MBar) from the reduced potentials of pooled samples; building solves the
//! MBAR equations. Query the solved estimator with [`MBar::reweight`](mbar::MBar::reweight) for
//! free energies and expectations at new states, or with
//! [`MBar::compute_pmf`](mbar::MBar::compute_pmf) for potentials of mean force.
//!
//! ```
//! use mbar_rs::prelude::*;
//! use ndarray::Array1;
//!
//! let testcase = HarmonicOscillator::default();
//! let sample = testcase.sample_with_seed(Array1::from_elem(5, 100), 0).unwrap();
//!
//! let mbar = MBar::builder()
//!     .u_kn(sample.u_kn.clone())
//!     .n_k(sample.n_k.clone())
//!     .build()
//!     .unwrap();
//!
//! // Mean position at state 2, and the free energy of state 2 relative to state 0
//! let u_n = mbar.u_kn().row(2).to_owned();
//! let result = mbar.reweight(&u_n, &[sample.x_n.clone()], 0).unwrap();
//! assert!((result.values[0] - mbar.f_k()[2]).abs() < 1e-8);
//! assert_eq!(result.covariance.dim(), (2, 2));
//! ```
//!
//! Please reference the following if you use this code in your research:
//!
//! [1] Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
//! equilibrium states. J. Chem. Phys. 129:124105, 2008. <http://dx.doi.org/10.1063/1.2978177>

#[macro_use]
extern crate derive_builder;

pub mod covariance;
pub mod errors;
pub mod logsumexp;
pub mod mbar;
pub mod observer;
pub mod pmf;
pub mod reweight;
pub mod testsystems;

/// The types needed for most uses of this crate
pub mod prelude {
    pub use crate::covariance::CovarianceMethod;
    pub use crate::errors::{MBarError, Result};
    pub use crate::mbar::{FreeEnergyDifferences, InitialFreeEnergies, MBar, MBarBuilder};
    pub use crate::observer::{Observer, Silent, Verbose};
    pub use crate::pmf::{Pmf, PmfUncertainties};
    pub use crate::reweight::Reweighted;
    pub use crate::testsystems::{HarmonicOscillator, Sample};
}
