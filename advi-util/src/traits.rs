use nalgebra::DVector;
use rand::rngs::SmallRng;

use crate::errors::AdviError;

/// A differentiable log-density on an unconstrained parameter space.
///
/// The density is the joint log-likelihood plus log-prior, already
/// transformed to unconstrained coordinates with the log-absolute-Jacobian
/// term folded in. Evaluation may fail recoverably on pathological inputs
/// (overflow, out-of-domain); callers treat a failure or a non-finite
/// return the same way.
pub trait Model {
    /// Number of unconstrained parameters.
    fn num_params(&self) -> usize;

    /// Joint log-density at `z`.
    fn log_prob(&self, z: &DVector<f32>) -> anyhow::Result<f32>;

    /// Joint log-density at `z`, writing its gradient into `grad`.
    ///
    /// `grad` has length `num_params()`. How the gradient is obtained is
    /// the model's business (analytic, autodiff, ...).
    fn log_prob_grad(&self, z: &DVector<f32>, grad: &mut DVector<f32>) -> anyhow::Result<f32>;
}

/// A location-scale variational family over the model's unconstrained space.
///
/// The family owns one flat parameter vector. Scale parameters live in
/// log-space (mean-field) or Cholesky-factor space (full-rank) inside that
/// vector, so the optimizer can apply additive element-wise updates without
/// ever producing an invalid distribution.
pub trait VariationalFamily {
    /// Fresh family located at `cont_params` with unit scales.
    fn from_initial(cont_params: &DVector<f32>) -> Self;

    /// Re-center at `cont_params` and restore unit scales in place.
    fn reset(&mut self, cont_params: &DVector<f32>);

    /// Length of the flat parameter vector.
    fn dimension(&self) -> usize;

    /// Number of model parameters `D` this family approximates.
    fn num_model_params(&self) -> usize;

    /// Location parameter (length `D`).
    fn mean(&self) -> DVector<f32>;

    /// Draw one `z` from the current distribution into `out` using the
    /// reparameterization `z = μ + σ ⊙ ε` or `z = μ + Lε`.
    fn sample(&self, rng: &mut SmallRng, out: &mut DVector<f32>);

    /// Differential entropy in closed form.
    fn entropy(&self) -> f32;

    /// Accumulate a Monte-Carlo estimate of `∇ ELBO` over `n_mc` draws
    /// into `out` (length `dimension()`), including the analytic entropy
    /// gradient. Draws with a failed or non-finite evaluation are dropped
    /// and redrawn; once `n_mc` draws have been dropped the estimate is
    /// abandoned with [`AdviError::IllConditioned`].
    ///
    /// Does not mutate the family.
    fn elbo_grad<M: Model>(
        &self,
        model: &M,
        n_mc: usize,
        rng: &mut SmallRng,
        out: &mut DVector<f32>,
    ) -> Result<(), AdviError>;

    /// Flat parameter vector.
    fn params(&self) -> &DVector<f32>;

    /// Mutable flat parameter vector for optimizer updates.
    fn params_mut(&mut self) -> &mut DVector<f32>;
}
