//! Black-box variational inference for differentiable probabilistic models.
//!
//! Fits a Gaussian approximating distribution (mean-field or full-rank) by
//! stochastic gradient ascent on a Monte-Carlo estimate of the evidence
//! lower bound (ELBO), using the reparameterization trick for pathwise
//! gradients. The step size is scaled per coordinate by an exponentially
//! weighted moving average of squared gradients, and an initial tuning
//! phase can pick the base learning rate from a coarse ladder. Convergence
//! is declared from rolling-window statistics of the ELBO trajectory.
//!
//! # References
//!
//! Kucukelbir et al. (2015). "Automatic variational inference in Stan."
//! NeurIPS 28.

/// Error taxonomy for configuration and Monte-Carlo failures
pub mod errors;

/// Model and variational-family traits
pub mod traits;

/// Diagonal-covariance Gaussian family with log-scale parameterization
pub mod meanfield;

/// Multivariate Gaussian family with Cholesky-factor parameterization
pub mod fullrank;

/// Monte-Carlo ELBO estimation
pub mod estimators;

/// Optional output sinks: progress, posterior samples, diagnostics
pub mod io;

/// Step-size tuning and adaptive stochastic gradient ascent
pub mod optimize;

pub use errors::AdviError;
pub use fullrank::FullRankGaussian;
pub use io::OutputWriters;
pub use meanfield::MeanFieldGaussian;
pub use optimize::{Advi, AdviOptions, AdviStatus};
pub use traits::{Model, VariationalFamily};
