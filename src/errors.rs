use thiserror::Error;

/// Enum for errors in this crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MBarError {
    /// Error returned when the inputs are malformed: wrong shapes, non-finite values, a
    /// non-positive tolerance or an out-of-range state index
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Error returned when an array is the wrong length
    #[error("Array of length {0} is incorrect; length should be {1}")]
    DimensionMismatch(usize, usize),

    /// Error returned when the self-consistent solve runs out of iterations
    #[error("MBAR did not converge in {iterations} iterations (residual {residual:e})")]
    Convergence {
        /// Number of iterations performed
        iterations: usize,
        /// Largest self-consistency residual at the last iterate
        residual: f64,
        /// The last iterate of the free energies
        f_k: Vec<f64>,
    },

    /// Error returned when the overlap structure leaves the covariance undetermined
    #[error("Covariance matrix is singular; states {states:?} have no overlap with the rest")]
    SingularCovariance {
        /// States disconnected from the first sampled state, where these could be identified
        states: Vec<usize>,
    },
}

impl From<String> for MBarError {
    fn from(s: String) -> Self {
        Self::InvalidInput(s)
    }
}

/// Result type for the mbar-rs crate
pub type Result<T> = std::result::Result<T, MBarError>;
