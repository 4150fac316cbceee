use thiserror::Error;

/// Failures raised by the variational inference engine.
///
/// Only `InvalidArgument` and `IllConditioned` abort a run. Individual
/// Monte-Carlo draws that fail are dropped and retried locally; everything
/// else is reported as an informational message.
#[derive(Debug, Error)]
pub enum AdviError {
    /// A configuration value violated its range constraint.
    #[error("invalid value for {what}: {value}")]
    InvalidArgument { what: &'static str, value: f64 },

    /// A Monte-Carlo evaluation dropped as many draws as it was asked to
    /// average. The model is likely severely ill-conditioned or
    /// misspecified in the region the approximation currently covers.
    #[error(
        "the number of dropped evaluations has reached its maximum amount ({dropped}); \
         the model may be either severely ill-conditioned or misspecified"
    )]
    IllConditioned { dropped: usize },

    /// Every candidate on the step-size ladder left the ELBO at or below
    /// its initial value.
    #[error("all step sizes failed")]
    AllStepSizesFailed,
}
