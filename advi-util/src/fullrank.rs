use log::warn;
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand_distr::{Distribution, StandardNormal};

use crate::errors::AdviError;
use crate::traits::{Model, VariationalFamily};

/// Multivariate Gaussian `q(z) = N(μ, LLᵀ)` with `L` lower triangular.
///
/// The flat parameter vector is `[μ, vech L]` with the triangle packed row
/// by row, `D + D(D+1)/2` entries in total. `L` starts at the identity and
/// is updated additively; its diagonal is kept away from zero by the
/// entropy gradient `1/Lᵢᵢ`.
#[derive(Debug, Clone)]
pub struct FullRankGaussian {
    dim: usize,
    params: DVector<f32>,
}

/// Flat offset of `L[i][j]` (`j <= i`) within the packed triangle.
fn tri_index(i: usize, j: usize) -> usize {
    i * (i + 1) / 2 + j
}

impl FullRankGaussian {
    /// Zero-located family with `L = I` over `dim` model parameters.
    pub fn new(dim: usize) -> Self {
        let mut q = Self {
            dim,
            params: DVector::zeros(dim + dim * (dim + 1) / 2),
        };
        for i in 0..dim {
            q.params[dim + tri_index(i, i)] = 1.0;
        }
        q
    }

    /// Entry `L[i][j]` of the Cholesky factor (`j <= i`).
    pub fn chol(&self, i: usize, j: usize) -> f32 {
        self.params[self.dim + tri_index(i, j)]
    }

    /// The Cholesky factor as a dense lower-triangular matrix.
    pub fn chol_factor(&self) -> DMatrix<f32> {
        let mut l = DMatrix::zeros(self.dim, self.dim);
        for i in 0..self.dim {
            for j in 0..=i {
                l[(i, j)] = self.chol(i, j);
            }
        }
        l
    }

    /// Covariance `LLᵀ` of the current distribution.
    pub fn covariance(&self) -> DMatrix<f32> {
        let l = self.chol_factor();
        &l * l.transpose()
    }
}

impl VariationalFamily for FullRankGaussian {
    fn from_initial(cont_params: &DVector<f32>) -> Self {
        let mut q = Self::new(cont_params.len());
        q.params.rows_mut(0, q.dim).copy_from(cont_params);
        q
    }

    fn reset(&mut self, cont_params: &DVector<f32>) {
        self.params.fill(0.0);
        self.params.rows_mut(0, self.dim).copy_from(cont_params);
        for i in 0..self.dim {
            self.params[self.dim + tri_index(i, i)] = 1.0;
        }
    }

    fn dimension(&self) -> usize {
        self.dim + self.dim * (self.dim + 1) / 2
    }

    fn num_model_params(&self) -> usize {
        self.dim
    }

    fn mean(&self) -> DVector<f32> {
        self.params.rows(0, self.dim).into_owned()
    }

    fn sample(&self, rng: &mut SmallRng, out: &mut DVector<f32>) {
        let eps = DVector::from_fn(self.dim, |_, _| -> f32 { StandardNormal.sample(rng) });
        for i in 0..self.dim {
            let mut acc = self.params[i];
            for j in 0..=i {
                acc += self.chol(i, j) * eps[j];
            }
            out[i] = acc;
        }
    }

    /// `H(q) = Σᵢ log |Lᵢᵢ| + (D/2)(1 + log 2π)`
    fn entropy(&self) -> f32 {
        let half_const = 0.5 * (1.0 + (2.0 * std::f32::consts::PI).ln());
        let log_det: f32 = (0..self.dim).map(|i| self.chol(i, i).abs().ln()).sum();
        log_det + self.dim as f32 * half_const
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
            }
            for i in 0..d {
                let mut acc = self.params[i];
                for j in 0..=i {
                    acc += self.chol(i, j) * eps[j];
                }
                z[i] = acc;
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

            // Backpropagate through z = μ + Lε:
            //   ∂/∂μᵢ = gᵢ,  ∂/∂Lᵢⱼ = gᵢ εⱼ
            for i in 0..d {
                out[i] += g[i];
                for j in 0..=i {
                    out[d + tri_index(i, j)] += g[i] * eps[j];
                }
            }
            accepted += 1;
        }

        *out /= n_mc as f32;

        // Analytic entropy gradient: ∂H/∂Lᵢᵢ = 1/Lᵢᵢ
        for i in 0..d {
            out[d + tri_index(i, i)] += 1.0 / self.chol(i, i);
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
