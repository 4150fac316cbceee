use log::warn;
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand_distr::{Distribution, StandardNormal};

use crate::errors::AdviError;
use crate::traits::{Model, VariationalFamily};

/// Diagonal-covariance Gaussian `q(z) = N(μ, diag(σ²))`.
///
/// The flat parameter vector is `[μ, ω]` with `σ = exp(ω)`, so additive
/// updates to `ω` can never drive a scale to zero or below.
#[derive(Debug, Clone)]
pub struct MeanFieldGaussian {
    dim: usize,
    params: DVector<f32>,
}

impl MeanFieldGaussian {
    /// Zero-located family with unit scales over `dim` model parameters.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            params: DVector::zeros(2 * dim),
        }
    }

    /// Marginal standard deviations `σ = exp(ω)`.
    pub fn stddev(&self) -> DVector<f32> {
        DVector::from_fn(self.dim, |i, _| self.params[self.dim + i].exp())
    }

    fn omega(&self, i: usize) -> f32 {
        self.params[self.dim + i]
    }
}

impl VariationalFamily for MeanFieldGaussian {
    fn from_initial(cont_params: &DVector<f32>) -> Self {
        let mut q = Self::new(cont_params.len());
        q.params.rows_mut(0, q.dim).copy_from(cont_params);
        q
    }

    fn reset(&mut self, cont_params: &DVector<f32>) {
        self.params.fill(0.0);
        self.params.rows_mut(0, self.dim).copy_from(cont_params);
    }

    fn dimension(&self) -> usize {
        2 * self.dim
    }

    fn num_model_params(&self) -> usize {
        self.dim
    }

    fn mean(&self) -> DVector<f32> {
        self.params.rows(0, self.dim).into_owned()
    }

    fn sample(&self, rng: &mut SmallRng, out: &mut DVector<f32>) {
        for i in 0..self.dim {
            let eps: f32 = StandardNormal.sample(rng);
            out[i] = self.params[i] + self.omega(i).exp() * eps;
        }
    }

    /// `H(q) = Σᵢ ωᵢ + (D/2)(1 + log 2π)`
    fn entropy(&self) -> f32 {
        let half_const = 0.5 * (1.0 + (2.0 * std::f32::consts::PI).ln());
        self.params.rows(self.dim, self.dim).sum() + self.dim as f32 * half_const
    }

    fn elbo_grad<M: Model>(
        &self,
        model: &M,
        n_mc: usize,
        rng: &mut SmallRng,
        out: &mut DVector<f32>,
    ) -> Result<(), AdviError> {
        let d = self.dim;
        let mut eps = DVector::<f32>::zeros(d);
        let mut z = DVector::<f32>::zeros(d);
        let mut g = DVector::<f32>::zeros(d);

        out.fill(0.0);
        let mut accepted = 0;
        let mut dropped = 0;
        while accepted < n_mc {
            for i in 0..d {
                eps[i] = StandardNormal.sample(rng);
                z[i] = self.params[i] + self.omega(i).exp() * eps[i];
            }

            let finite = match model.log_prob_grad(&z, &mut g) {
                Ok(lp) => lp.is_finite() && g.iter().all(|v| v.is_finite()),
                Err(err) => {
                    warn!("ignoring Monte Carlo draw for the ELBO gradient: {err:#}");
                    false
                }
            };
            if !finite {
                dropped += 1;
                if dropped >= n_mc {
                    return Err(AdviError::IllConditioned { dropped });
                }
                continue;
            }

            // Backpropagate through z = μ + exp(ω) ⊙ ε:
            //   ∂/∂μᵢ = gᵢ,  ∂/∂ωᵢ = gᵢ εᵢ exp(ωᵢ)
            for i in 0..d {
                out[i] += g[i];
                out[d + i] += g[i] * eps[i] * self.omega(i).exp();
            }
            accepted += 1;
        }

        *out /= n_mc as f32;

        // Analytic entropy gradient: ∂H/∂ωᵢ = 1
        for i in 0..d {
            out[d + i] += 1.0;
        }
        Ok(())
    }

    fn params(&self) -> &DVector<f32> {
        &self.params
    }

    fn params_mut(&mut self) -> &mut DVector<f32> {
        &mut self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn entropy_matches_closed_form() {
        let mut q = MeanFieldGaussian::new(3);
        q.params_mut()
            .copy_from_slice(&[0.5, -1.0, 2.0, 0.1, -0.3, 0.7]);

        let expected = (0.1 - 0.3 + 0.7) + 1.5 * (1.0 + (2.0 * std::f32::consts::PI).ln());
        assert!((q.entropy() - expected).abs() < 1e-5);
    }

    #[test]
    fn unit_scale_entropy_is_standard_normal_entropy() {
        let q = MeanFieldGaussian::from_initial(&DVector::from_element(1, 4.0));
        // H(N(μ, 1)) = 0.5 (1 + log 2π), independent of μ
        let expected = 0.5 * (1.0 + (2.0 * std::f32::consts::PI).ln());
        assert!((q.entropy() - expected).abs() < 1e-6);
    }

    #[test]
    fn sample_mean_converges_to_location() {
        let loc = DVector::from_vec(vec![2.0f32, -1.0]);
        let q = MeanFieldGaussian::from_initial(&loc);
        let mut rng = SmallRng::seed_from_u64(7);

        let n = 20_000;
        let mut z = DVector::zeros(2);
        let mut acc = DVector::<f32>::zeros(2);
        for _ in 0..n {
            q.sample(&mut rng, &mut z);
            acc += &z;
        }
        acc /= n as f32;

        assert!((acc[0] - 2.0).abs() < 0.05, "mean[0] = {}", acc[0]);
        assert!((acc[1] + 1.0).abs() < 0.05, "mean[1] = {}", acc[1]);
    }

    #[test]
    fn reinit_from_own_mean_is_idempotent() {
        let loc = DVector::from_vec(vec![0.3f32, -2.5, 1.1]);
        let mut q = MeanFieldGaussian::from_initial(&loc);
        q.params_mut()[3] = 0.9; // perturb a scale

        let q2 = MeanFieldGaussian::from_initial(&q.mean());
        assert_eq!(q2.mean(), loc);
        assert_eq!(q2.stddev(), DVector::from_element(3, 1.0));
    }
}
