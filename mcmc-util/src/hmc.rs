use advi_util::Model;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::chain::McmcChain;

/// Options for the static-integration-time HMC sampler.
#[derive(Debug, Clone)]
pub struct HmcOptions {
    /// Leapfrog step size. Default: 0.1
    pub step_size: f32,
    /// Total integration time per transition; the number of leapfrog
    /// steps is `max(⌊int_time / step_size⌋, 1)`. Default: 1.0
    pub int_time: f32,
    /// Number of post-warmup samples to collect. Default: 1000
    pub n_samples: usize,
    /// Number of warmup transitions to discard. Default: 1000
    pub warmup: usize,
    /// Random seed. Default: 42
    pub seed: u64,
    /// Draw a progress bar while sampling. Default: false
    pub show_progress: bool,
}

impl Default for HmcOptions {
    fn default() -> Self {
        HmcOptions {
            step_size: 0.1,
            int_time: 1.0,
            n_samples: 1000,
            warmup: 1000,
            seed: 42,
            show_progress: false,
        }
    }
}

/// Hamiltonian Monte Carlo with a unit Euclidean metric and a fixed
/// integration time.
///
/// Momentum is refreshed from `N(0, I)` before every transition; a failed
/// or non-finite log-density along the trajectory is treated as an
/// infinite-energy state and the transition is rejected.
pub struct StaticHmc<'a, M> {
    model: &'a M,
    options: HmcOptions,
}

impl<'a, M: Model + Sync> StaticHmc<'a, M> {
    pub fn new(model: &'a M, options: HmcOptions) -> Self {
        StaticHmc { model, options }
    }

    /// Run a single chain from `init`.
    pub fn run(&self, init: &DVector<f32>) -> anyhow::Result<McmcChain> {
        let mut rng = SmallRng::seed_from_u64(self.options.seed);
        self.run_with_rng(init, &mut rng)
    }

    /// Run `n_chains` independent chains in parallel via rayon. Each
    /// chain is seeded with `seed + chain_idx` for reproducibility.
    pub fn run_parallel(
        &self,
        n_chains: usize,
        init: &DVector<f32>,
    ) -> anyhow::Result<Vec<McmcChain>> {
        (0..n_chains)
            .into_par_iter()
            .map(|i| {
                let mut rng =
                    SmallRng::seed_from_u64(self.options.seed.wrapping_add(i as u64));
                self.run_with_rng(init, &mut rng)
            })
            .collect()
    }

    fn run_with_rng(&self, init: &DVector<f32>, rng: &mut SmallRng) -> anyhow::Result<McmcChain> {
        let total = self.options.warmup + self.options.n_samples;
        let pb = ProgressBar::new(total as u64);
        if !self.options.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut q = init.clone();
        let mut grad = DVector::<f32>::zeros(q.len());
        let mut lp = self.model.log_prob_grad(&q, &mut grad)?;
        anyhow::ensure!(lp.is_finite(), "log density is not finite at the initial point");

        let mut samples = Vec::with_capacity(self.options.n_samples);
        let mut log_densities = Vec::with_capacity(self.options.n_samples);
        let mut accepted = 0usize;

        for i in 0..total {
            let (q_next, lp_next, grad_next, moved) = self.transition(q, lp, grad, rng);
            q = q_next;
            lp = lp_next;
            grad = grad_next;
            if moved {
                accepted += 1;
            }
            if i >= self.options.warmup {
                samples.push(q.clone());
                log_densities.push(lp);
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        let accept_rate = accepted as f32 / total as f32;
        info!(
            "HMC done: {} samples, accept rate {:.3}",
            samples.len(),
            accept_rate
        );
        Ok(McmcChain {
            samples,
            log_densities,
            accept_rate,
        })
    }

    /// One HMC transition from `(q, lp, grad)`. Returns the next state,
    /// its gradient, and whether the proposal was accepted.
    fn transition(
        &self,
        q: DVector<f32>,
        lp: f32,
        grad: DVector<f32>,
        rng: &mut SmallRng,
    ) -> (DVector<f32>, f32, DVector<f32>, bool) {
        let eps = self.options.step_size;
        let n_leapfrog = ((self.options.int_time / eps) as usize).max(1);

        let mut p = DVector::from_fn(q.len(), |_, _| -> f32 { StandardNormal.sample(rng) });
        let h0 = -lp + 0.5 * p.dot(&p);

        let mut q_new = q.clone();
        let mut grad_new = grad.clone();
        let mut lp_new = lp;
        let mut diverged = false;

        // leapfrog with half-step momentum updates at both ends
        p += 0.5 * eps * &grad_new;
        for l in 0..n_leapfrog {
            q_new += eps * &p;
            match self.model.log_prob_grad(&q_new, &mut grad_new) {
                Ok(v) if v.is_finite() => lp_new = v,
                _ => {
                    diverged = true;
                    break;
                }
            }
            let weight = if l + 1 < n_leapfrog { 1.0 } else { 0.5 };
            p += weight * eps * &grad_new;
        }

        let h = if diverged {
            f32::INFINITY
        } else {
            -lp_new + 0.5 * p.dot(&p)
        };
        let h = if h.is_nan() { f32::INFINITY } else { h };

        let accept_prob = (h0 - h).exp().min(1.0);
        if rng.random::<f32>() < accept_prob {
            (q_new, lp_new, grad_new, true)
        } else {
            (q, lp, grad, false)
        }
    }
}
