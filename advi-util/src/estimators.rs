use log::warn;
use nalgebra::DVector;
use rand::rngs::SmallRng;

use crate::errors::AdviError;
use crate::traits::{Model, VariationalFamily};

/// Monte-Carlo estimate of the ELBO at the current `q`.
///
/// Averages the model log-density over `n_mc` draws from `q`, then adds
/// the closed-form entropy. Draws on which the model fails or returns a
/// non-finite value are dropped rather than averaged in as zeros; once
/// `n_mc` draws have been dropped the estimate is abandoned with
/// [`AdviError::IllConditioned`], which bounds the retry loop when `q`
/// sits entirely in a bad region.
pub fn monte_carlo_elbo<M: Model, Q: VariationalFamily>(
    q: &Q,
    model: &M,
    n_mc: usize,
    rng: &mut SmallRng,
) -> Result<f32, AdviError> {
    let mut z = DVector::<f32>::zeros(q.num_model_params());
    let mut elbo = 0.0f32;
    let mut accepted = 0;
    let mut dropped = 0;

    while accepted < n_mc {
        q.sample(rng, &mut z);
        let energy = match model.log_prob(&z) {
            Ok(lp) if lp.is_finite() => Some(lp),
            Ok(_) => None,
            Err(err) => {
                warn!("ignoring Monte Carlo draw for the ELBO: {err:#}");
                None
            }
        };
        match energy {
            Some(lp) => {
                elbo += lp;
                accepted += 1;
            }
            None => {
                dropped += 1;
                if dropped >= n_mc {
                    return Err(AdviError::IllConditioned { dropped });
                }
            }
        }
    }

    Ok(elbo / n_mc as f32 + q.entropy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meanfield::MeanFieldGaussian;
    use rand::SeedableRng;

    /// Standard normal target: log p(z) = -||z||²/2 (up to a constant).
    struct StdNormal {
        dim: usize,
    }

    impl Model for StdNormal {
        fn num_params(&self) -> usize {
            self.dim
        }
        fn log_prob(&self, z: &DVector<f32>) -> anyhow::Result<f32> {
            Ok(-0.5 * z.dot(z))
        }
        fn log_prob_grad(&self, z: &DVector<f32>, grad: &mut DVector<f32>) -> anyhow::Result<f32> {
            grad.copy_from(&(-z));
            Ok(-0.5 * z.dot(z))
        }
    }

    /// A target that always fails to evaluate.
    struct NeverFinite {
        dim: usize,
    }

    impl Model for NeverFinite {
        fn num_params(&self) -> usize {
            self.dim
        }
        fn log_prob(&self, _z: &DVector<f32>) -> anyhow::Result<f32> {
            Ok(f32::NAN)
        }
        fn log_prob_grad(
            &self,
            _z: &DVector<f32>,
            _grad: &mut DVector<f32>,
        ) -> anyhow::Result<f32> {
            anyhow::bail!("log density overflowed")
        }
    }

    /// For q = N(0, I) and a standard normal target the ELBO is analytic:
    /// E_q[-z²/2] + H(q) = -D/2 + (D/2)(1 + log 2π).
    #[test]
    fn elbo_estimate_is_unbiased_on_conjugate_target() {
        let dim = 2;
        let model = StdNormal { dim };
        let q = MeanFieldGaussian::new(dim);
        let mut rng = SmallRng::seed_from_u64(42);

        let analytic =
            -0.5 * dim as f32 + 0.5 * dim as f32 * (1.0 + (2.0 * std::f32::consts::PI).ln());

        let k = 50;
        let mut acc = 0.0f32;
        for _ in 0..k {
            acc += monte_carlo_elbo(&q, &model, 200, &mut rng).unwrap();
        }
        acc /= k as f32;

        assert!(
            (acc - analytic).abs() < 0.05,
            "estimate {acc} vs analytic {analytic}"
        );
    }

    #[test]
    fn single_failed_draw_is_ill_conditioned_at_budget_one() {
        let model = NeverFinite { dim: 1 };
        let q = MeanFieldGaussian::new(1);
        let mut rng = SmallRng::seed_from_u64(1);

        let err = monte_carlo_elbo(&q, &model, 1, &mut rng).unwrap_err();
        assert!(matches!(err, AdviError::IllConditioned { dropped: 1 }));
    }

    #[test]
    fn drop_budget_matches_requested_draws() {
        let model = NeverFinite { dim: 3 };
        let q = MeanFieldGaussian::new(3);
        let mut rng = SmallRng::seed_from_u64(2);

        let err = monte_carlo_elbo(&q, &model, 25, &mut rng).unwrap_err();
        assert!(matches!(err, AdviError::IllConditioned { dropped: 25 }));
    }
}
