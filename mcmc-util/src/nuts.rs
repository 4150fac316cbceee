use advi_util::Model;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::chain::McmcChain;

/// Energy error beyond which a leapfrog state is declared divergent.
const DIVERGENCE_THRESHOLD: f32 = 1000.0;

/// Options for the No-U-Turn Sampler.
#[derive(Debug, Clone)]
pub struct NutsOptions {
    /// Leapfrog step size. Default: 0.1
    pub step_size: f32,
    /// Maximum tree depth per transition. Default: 10
    pub max_treedepth: usize,
    /// Number of post-warmup samples to collect. Default: 1000
    pub n_samples: usize,
    /// Number of warmup transitions to discard. Default: 1000
    pub warmup: usize,
    /// Random seed. Default: 42
    pub seed: u64,
    /// Draw a progress bar while sampling. Default: false
    pub show_progress: bool,
}

impl Default for NutsOptions {
    fn default() -> Self {
        NutsOptions {
            step_size: 0.1,
            max_treedepth: 10,
            n_samples: 1000,
            warmup: 1000,
            seed: 42,
            show_progress: false,
        }
    }
}

/// A point in phase space with its cached log-density and gradient.
#[derive(Clone)]
struct PhasePoint {
    q: DVector<f32>,
    p: DVector<f32>,
    grad: DVector<f32>,
    lp: f32,
}

impl PhasePoint {
    fn hamiltonian(&self) -> f32 {
        let h = -self.lp + 0.5 * self.p.dot(&self.p);
        if h.is_nan() {
            f32::INFINITY
        } else {
            h
        }
    }
}

/// A balanced subtree built by doubling: its two ends, the summed momentum
/// `ρ` over its states, the proposal selected uniformly among slice-valid
/// states, and the stop flags.
struct Subtree {
    minus: PhasePoint,
    plus: PhasePoint,
    rho: DVector<f32>,
    proposal_q: DVector<f32>,
    proposal_lp: f32,
    n_valid: usize,
    keep_going: bool,
}

/// No-U-turn check against the summed momentum `ρ` of the trajectory: the
/// doubling stops unless `p · (ρ − p) > 0` holds at both ends.
fn is_turning(minus: &PhasePoint, plus: &PhasePoint, rho: &DVector<f32>) -> bool {
    minus.p.dot(&(rho - &minus.p)) <= 0.0 || plus.p.dot(&(rho - &plus.p)) <= 0.0
}

/// The No-U-Turn Sampler with a unit Euclidean metric.
///
/// Uses the slice variant with tree doubling: each transition draws a
/// slice level under the initial energy, grows a trajectory by doubling
/// until it turns back on itself or diverges, and proposes uniformly
/// among the states that fall inside the slice.
pub struct Nuts<'a, M> {
    model: &'a M,
    options: NutsOptions,
}

impl<'a, M: Model + Sync> Nuts<'a, M> {
    pub fn new(model: &'a M, options: NutsOptions) -> Self {
        Nuts { model, options }
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
            "NUTS done: {} samples, accept rate {:.3}",
            samples.len(),
            accept_rate
        );
        Ok(McmcChain {
            samples,
            log_densities,
            accept_rate,
        })
    }

    /// One leapfrog step of size `eps` (signed for direction).
    fn leapfrog(&self, from: &PhasePoint, eps: f32) -> Option<PhasePoint> {
        let mut next = from.clone();
        next.p += 0.5 * eps * &next.grad;
        next.q += eps * &next.p;
        match self.model.log_prob_grad(&next.q, &mut next.grad) {
            Ok(lp) if lp.is_finite() => next.lp = lp,
            _ => return None,
        }
        next.p += 0.5 * eps * &next.grad;
        Some(next)
    }

    /// Build a subtree of `2^depth` states extending `from` in the given
    /// direction. `log_u` is the slice level; `h0` the initial energy.
    fn build_tree(
        &self,
        from: &PhasePoint,
        log_u: f32,
        eps: f32,
        depth: usize,
        h0: f32,
        rng: &mut SmallRng,
    ) -> Subtree {
        if depth == 0 {
            // Base case: a single leapfrog step. A failed step counts as
            // an immediately divergent state.
            return match self.leapfrog(from, eps) {
                Some(point) => {
                    let h = point.hamiltonian();
                    let energy_error = h - h0;
                    let n_valid = usize::from(log_u <= -h);
                    let keep_going = energy_error.abs() <= DIVERGENCE_THRESHOLD;
                    Subtree {
                        rho: point.p.clone(),
                        proposal_q: point.q.clone(),
                        proposal_lp: point.lp,
                        minus: point.clone(),
                        plus: point,
                        n_valid,
                        keep_going,
                    }
                }
                None => Subtree {
                    minus: from.clone(),
                    plus: from.clone(),
                    rho: DVector::zeros(from.q.len()),
                    proposal_q: from.q.clone(),
                    proposal_lp: from.lp,
                    n_valid: 0,
                    keep_going: false,
                },
            };
        }

        let mut inner = self.build_tree(from, log_u, eps, depth - 1, h0, rng);
        if !inner.keep_going {
            return inner;
        }

        let outer_start = if eps > 0.0 { &inner.plus } else { &inner.minus };
        let outer = self.build_tree(outer_start, log_u, eps, depth - 1, h0, rng);

        let n_total = inner.n_valid + outer.n_valid;
        if outer.n_valid > 0 && rng.random::<f32>() < outer.n_valid as f32 / n_total as f32 {
            inner.proposal_q = outer.proposal_q;
            inner.proposal_lp = outer.proposal_lp;
        }
        if eps > 0.0 {
            inner.plus = outer.plus;
        } else {
            inner.minus = outer.minus;
        }
        inner.rho += &outer.rho;
        inner.n_valid = n_total;
        inner.keep_going =
            outer.keep_going && !is_turning(&inner.minus, &inner.plus, &inner.rho);
        inner
    }

    /// One NUTS transition. Returns the next state, its gradient, and
    /// whether it differs from the current one.
    fn transition(
        &self,
        q: DVector<f32>,
        lp: f32,
        grad: DVector<f32>,
        rng: &mut SmallRng,
    ) -> (DVector<f32>, f32, DVector<f32>, bool) {
        let eps = self.options.step_size;
        let p = DVector::from_fn(q.len(), |_, _| -> f32 { StandardNormal.sample(rng) });

        let start = PhasePoint {
            q: q.clone(),
            p,
            grad: grad.clone(),
            lp,
        };
        let h0 = start.hamiltonian();
        let log_u = rng.random::<f32>().ln() - h0;

        let mut minus = start.clone();
        let mut plus = start;
        let mut rho = minus.p.clone();
        let mut proposal_q = q.clone();
        let mut proposal_lp = lp;
        let mut n_valid = 1usize;
        let mut moved = false;

        for depth in 0..self.options.max_treedepth {
            let forward: bool = rng.random();
            let subtree = if forward {
                self.build_tree(&plus, log_u, eps, depth, h0, rng)
            } else {
                self.build_tree(&minus, log_u, -eps, depth, h0, rng)
            };

            if subtree.keep_going && subtree.n_valid > 0 {
                let ratio = subtree.n_valid as f32 / n_valid as f32;
                if rng.random::<f32>() < ratio.min(1.0) {
                    proposal_q = subtree.proposal_q.clone();
                    proposal_lp = subtree.proposal_lp;
                    moved = true;
                }
            }
            n_valid += subtree.n_valid;

            let stop = !subtree.keep_going;
            rho += &subtree.rho;
            if forward {
                plus = subtree.plus;
            } else {
                minus = subtree.minus;
            }
            if stop || is_turning(&minus, &plus, &rho) {
                break;
            }
        }

        if moved {
            let mut grad_new = grad.clone();
            match self.model.log_prob_grad(&proposal_q, &mut grad_new) {
                Ok(_) => (proposal_q, proposal_lp, grad_new, true),
                // the proposal evaluated fine inside the tree; a failure
                // here means the model is not deterministic, fall back
                Err(_) => (q, lp, grad, false),
            }
        } else {
            (q, lp, grad, false)
        }
    }
}
