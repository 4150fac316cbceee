use std::collections::VecDeque;
use std::marker::PhantomData;
use std::time::Instant;

use log::{info, warn};
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::errors::AdviError;
use crate::estimators::monte_carlo_elbo;
use crate::io::OutputWriters;
use crate::traits::{Model, VariationalFamily};

/// Damping offset in the per-coordinate step denominator.
const TAU: f32 = 1.0;
/// Decay of the squared-gradient moving average.
const PRE_FACTOR: f32 = 0.9;
/// Weight of the incoming squared gradient.
const POST_FACTOR: f32 = 0.1;
/// Iterations spent on each step-size candidate during tuning.
const TUNING_ITERATIONS: usize = 50;
/// Candidate base step sizes, tried in order.
const ETA_LADDER: [f32; 5] = [1.0, 0.5, 0.1, 0.05, 0.01];

/// Options for a variational inference run.
#[derive(Debug, Clone)]
pub struct AdviOptions {
    /// Monte-Carlo draws per ELBO gradient estimate. Default: 10
    pub n_monte_carlo_grad: usize,
    /// Monte-Carlo draws per ELBO evaluation. Default: 100
    pub n_monte_carlo_elbo: usize,
    /// Iterations between ELBO evaluations. Default: 100
    pub eval_elbo: usize,
    /// Draws from the fitted approximation written at the end. Default: 1000
    pub n_posterior_samples: usize,
    /// Random seed. Default: 42
    pub seed: u64,
}

impl Default for AdviOptions {
    fn default() -> Self {
        AdviOptions {
            n_monte_carlo_grad: 10,
            n_monte_carlo_elbo: 100,
            eval_elbo: 100,
            n_posterior_samples: 1000,
            seed: 42,
        }
    }
}

impl AdviOptions {
    fn validate(&self) -> Result<(), AdviError> {
        let checks = [
            ("number of Monte Carlo samples for gradients", self.n_monte_carlo_grad),
            ("number of Monte Carlo samples for ELBO", self.n_monte_carlo_elbo),
            ("evaluation period", self.eval_elbo),
            ("number of posterior samples for output", self.n_posterior_samples),
        ];
        for (what, value) in checks {
            if value == 0 {
                return Err(AdviError::InvalidArgument {
                    what,
                    value: value as f64,
                });
            }
        }
        Ok(())
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdviStatus {
    /// The optimizer ran and posterior samples were written.
    Done,
    /// Step-size tuning exhausted its ladder without improving on the
    /// initial ELBO; no samples were written.
    StepSizeSearchFailed,
}

/// Fixed-capacity rolling window of ELBO relative differences.
struct ElboDiffWindow {
    buf: VecDeque<f32>,
    cap: usize,
}

impl ElboDiffWindow {
    fn new(cap: usize) -> Self {
        ElboDiffWindow {
            buf: VecDeque::with_capacity(cap),
            cap,
        }
    }

    fn push(&mut self, delta: f32) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(delta);
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn mean(&self) -> f32 {
        self.buf.iter().sum::<f32>() / self.buf.len() as f32
    }

    /// Element at index `⌊n/2⌋` of the sorted window, found by O(n)
    /// selection on a copy.
    fn median(&self) -> f32 {
        let mut v: Vec<f32> = self.buf.iter().copied().collect();
        let mid = v.len() / 2;
        let (_, m, _) = v.select_nth_unstable_by(mid, f32::total_cmp);
        *m
    }
}

/// `|curr − prev| / |prev|`
fn rel_difference(prev: f32, curr: f32) -> f32 {
    (curr - prev).abs() / prev.abs()
}

/// One adaptive gradient-ascent step on the flat parameter vector.
///
/// The squared-gradient average `s` is accumulated raw on the first
/// iteration and exponentially smoothed afterwards; starting the moving
/// average from zero would make the first denominator `τ` alone and the
/// first step enormous.
fn adaptive_step<Q: VariationalFamily>(
    q: &mut Q,
    grad: &DVector<f32>,
    s: &mut DVector<f32>,
    eta: f32,
    iter: usize,
) {
    if iter == 1 {
        *s += grad.component_mul(grad);
    } else {
        *s = &*s * PRE_FACTOR + grad.component_mul(grad) * POST_FACTOR;
    }
    let eta_scaled = eta / (iter as f32).sqrt();
    let denom = s.map(|v| TAU + v.sqrt());
    *q.params_mut() += grad.component_div(&denom) * eta_scaled;
}

fn validate_run_args(eta: f32, tol_rel_obj: f32, max_iterations: usize) -> Result<(), AdviError> {
    if eta < 0.0 {
        return Err(AdviError::InvalidArgument {
            what: "eta stepsize",
            value: eta as f64,
        });
    }
    if tol_rel_obj <= 0.0 {
        return Err(AdviError::InvalidArgument {
            what: "relative objective tolerance",
            value: tol_rel_obj as f64,
        });
    }
    if max_iterations == 0 {
        return Err(AdviError::InvalidArgument {
            what: "maximum iterations",
            value: 0.0,
        });
    }
    Ok(())
}

/// Automatic differentiation variational inference.
///
/// Maximizes the ELBO for `model` over the variational family `Q` by
/// stochastic gradient ascent with per-coordinate adaptive step sizes.
/// Generic over the family exactly like the samplers are generic over the
/// model; use [`AdviMeanField`] / [`AdviFullRank`] for the common cases.
#[derive(Debug)]
pub struct Advi<'a, M, Q> {
    model: &'a M,
    cont_params: DVector<f32>,
    options: AdviOptions,
    rng: SmallRng,
    _family: PhantomData<Q>,
}

/// ADVI with the diagonal-covariance family.
pub type AdviMeanField<'a, M> = Advi<'a, M, crate::meanfield::MeanFieldGaussian>;
/// ADVI with the Cholesky-factor family.
pub type AdviFullRank<'a, M> = Advi<'a, M, crate::fullrank::FullRankGaussian>;

impl<'a, M: Model, Q: VariationalFamily> Advi<'a, M, Q> {
    /// Set up a run starting from `cont_params`.
    ///
    /// Fails with [`AdviError::InvalidArgument`] when any count in
    /// `options` is zero.
    pub fn new(
        model: &'a M,
        cont_params: DVector<f32>,
        options: AdviOptions,
    ) -> Result<Self, AdviError> {
        options.validate()?;
        debug_assert_eq!(cont_params.len(), model.num_params());
        let rng = SmallRng::seed_from_u64(options.seed);
        Ok(Advi {
            model,
            cont_params,
            options,
            rng,
            _family: PhantomData,
        })
    }

    /// Location of the approximation: the starting point before [`run`]
    /// completes, the posterior mean afterwards.
    ///
    /// [`run`]: Advi::run
    pub fn posterior_mean(&self) -> &DVector<f32> {
        &self.cont_params
    }

    /// Pick the base step size from a coarse ladder.
    ///
    /// Each candidate optimizes for 50 iterations from the initial point
    /// with a fresh preconditioner, and is scored by the
    /// ELBO it reaches. The ladder is walked downwards until a candidate
    /// scores worse than an already-recorded one that had improved on the
    /// initial ELBO; that recorded candidate wins. `q` is reset to the
    /// initial point before this returns.
    pub fn tune(&mut self, q: &mut Q, writers: &mut OutputWriters) -> anyhow::Result<f32> {
        let dim = q.dimension();
        let mut grad = DVector::<f32>::zeros(dim);
        let mut s = DVector::<f32>::zeros(dim);

        let n_grad = self.options.n_monte_carlo_grad;
        let n_elbo = self.options.n_monte_carlo_elbo;

        let elbo_init = monte_carlo_elbo(q, self.model, n_elbo, &mut self.rng)?;
        let mut elbo_best = f32::MIN;
        let mut eta_best = 0.0f32;

        let mut next = 1;
        let mut eta = ETA_LADDER[0];
        loop {
            writers.progress(&format!(
                "ADVI TUNING: trying eta = {:>4} for {} iterations... ",
                eta, TUNING_ITERATIONS
            ))?;

            for t in 1..=TUNING_ITERATIONS {
                q.elbo_grad(self.model, n_grad, &mut self.rng, &mut grad)?;
                adaptive_step(q, &grad, &mut s, eta, t);
            }
            let elbo = monte_carlo_elbo(q, self.model, n_elbo, &mut self.rng)?;

            // A candidate wins retroactively once a later one scores worse,
            // provided it had actually improved on the initial ELBO.
            if elbo < elbo_best && elbo_best > elbo_init {
                writers.progress_line("SUCCESS. USING PREVIOUS ONE")?;
                info!("step size tuning selected eta = {eta_best}");
                q.reset(&self.cont_params);
                return Ok(eta_best);
            }

            if next < ETA_LADDER.len() {
                writers.progress_line("FAILED.")?;
                elbo_best = elbo;
                eta_best = eta;
                eta = ETA_LADDER[next];
                next += 1;
            } else if elbo > elbo_init {
                writers.progress_line("SUCCESS. USING CURRENT ONE")?;
                info!("step size tuning selected eta = {eta}");
                q.reset(&self.cont_params);
                return Ok(eta);
            } else {
                writers.progress_line("FAILED.")?;
                q.reset(&self.cont_params);
                return Err(AdviError::AllStepSizesFailed.into());
            }

            s.fill(0.0);
            q.reset(&self.cont_params);
        }
    }

    /// Run adaptive stochastic gradient ascent on `q` until the rolling
    /// mean or median of ELBO relative differences drops below
    /// `tol_rel_obj`, or `max_iterations` is reached.
    pub fn stochastic_gradient_ascent(
        &mut self,
        q: &mut Q,
        eta: f32,
        tol_rel_obj: f32,
        max_iterations: usize,
        writers: &mut OutputWriters,
    ) -> anyhow::Result<()> {
        validate_run_args(eta, tol_rel_obj, max_iterations)?;

        let dim = q.dimension();
        let mut grad = DVector::<f32>::zeros(dim);
        let mut s = DVector::<f32>::zeros(dim);

        let n_grad = self.options.n_monte_carlo_grad;
        let n_elbo = self.options.n_monte_carlo_elbo;
        let eval_elbo = self.options.eval_elbo;

        // Look roughly a tenth of the run back when judging convergence.
        let cap = ((0.1 * max_iterations as f64 / eval_elbo as f64).ceil() as usize).max(2);
        let mut window = ElboDiffWindow::new(cap);

        let mut elbo = 0.0f32;
        let mut elbo_best = f32::MIN;

        let start = Instant::now();
        writers.progress_line("  iter       ELBO   delta_ELBO_mean   delta_ELBO_med   notes ")?;

        let mut converged = false;
        for t in 1..=max_iterations {
            q.elbo_grad(self.model, n_grad, &mut self.rng, &mut grad)?;
            adaptive_step(q, &grad, &mut s, eta, t);

            if t % eval_elbo == 0 {
                let elbo_prev = elbo;
                elbo = monte_carlo_elbo(q, self.model, n_elbo, &mut self.rng)?;
                if elbo > elbo_best {
                    elbo_best = elbo;
                }
                window.push(rel_difference(elbo_prev, elbo));
                let delta_mean = window.mean();
                let delta_med = window.median();

                let mut line = format!(
                    "  {:>4}  {:>9.1}  {:>16.3}  {:>15.3}",
                    t, elbo, delta_mean, delta_med
                );
                if delta_mean < tol_rel_obj {
                    line.push_str("   MEAN ELBO CONVERGED");
                    converged = true;
                }
                if delta_med < tol_rel_obj {
                    line.push_str("   MEDIAN ELBO CONVERGED");
                    converged = true;
                }
                if delta_med > 0.5 || delta_mean > 0.5 {
                    line.push_str("   MAY BE DIVERGING... INSPECT ELBO");
                    warn!(
                        "ELBO trajectory may be diverging: mean delta {delta_mean}, \
                         median delta {delta_med}"
                    );
                }
                writers.progress_line(&line)?;
                writers.diagnostic_row(t, start.elapsed().as_secs_f32(), elbo)?;

                if converged {
                    if (elbo - elbo_best).abs() > 0.5 {
                        writers.progress_line(
                            "Informational Message: The ELBO at a previous iteration is larger \
                             than the ELBO upon convergence!",
                        )?;
                        writers.progress_line(
                            "This means that the variational approximation has not converged \
                             to the global optima.",
                        )?;
                        warn!(
                            "converged at ELBO {elbo} but a previous iteration reached {elbo_best}"
                        );
                    }
                    info!("converged after {t} iterations, ELBO {elbo}");
                }
            }

            // Reaching the iteration cap is reported unconditionally, even
            // when convergence fired on this very iteration.
            if t == max_iterations {
                writers.progress_line(
                    "Informational Message: The maximum number of iterations is reached! \
                     The algorithm has not converged.",
                )?;
                writers.progress_line(
                    "Values from this variational approximation are not guaranteed \
                     to be meaningful.",
                )?;
                warn!("maximum number of iterations ({max_iterations}) reached");
            }

            if converged {
                break;
            }
        }
        Ok(())
    }

    /// Run the full algorithm and write the outputs.
    ///
    /// With `eta == 0` the step size is tuned first; when tuning fails the
    /// run ends early with [`AdviStatus::StepSizeSearchFailed`] and no
    /// samples. Otherwise the optimizer runs to convergence and the sample
    /// sink receives the posterior mean row followed by
    /// `n_posterior_samples` draws from the fitted approximation.
    pub fn run(
        &mut self,
        eta: f32,
        tol_rel_obj: f32,
        max_iterations: usize,
        writers: &mut OutputWriters,
    ) -> anyhow::Result<AdviStatus> {
        validate_run_args(eta, tol_rel_obj, max_iterations)?;
        writers.diagnostic_header()?;

        let mut q = Q::from_initial(&self.cont_params);

        let eta = if eta == 0.0 {
            match self.tune(&mut q, writers) {
                Ok(eta_best) => eta_best,
                Err(err) => {
                    if matches!(
                        err.downcast_ref::<AdviError>(),
                        Some(AdviError::AllStepSizesFailed)
                    ) {
                        writers.progress_line("ALL STEP SIZES FAILED.")?;
                        warn!("all step sizes failed; no posterior samples were drawn");
                        return Ok(AdviStatus::StepSizeSearchFailed);
                    }
                    return Err(err);
                }
            }
        } else {
            eta
        };

        self.stochastic_gradient_ascent(&mut q, eta, tol_rel_obj, max_iterations, writers)?;

        self.cont_params = q.mean();
        if writers.samples.is_some() {
            let lp = self.model.log_prob(&self.cont_params)?;
            writers.sample_row(lp, &self.cont_params)?;

            writers.progress(&format!(
                "\nDrawing {} samples from the approximate posterior... ",
                self.options.n_posterior_samples
            ))?;
            let mut z = DVector::<f32>::zeros(q.num_model_params());
            for _ in 0..self.options.n_posterior_samples {
                q.sample(&mut self.rng, &mut z);
                let lp = self.model.log_prob(&z)?;
                writers.sample_row(lp, &z)?;
            }
            writers.progress_line("DONE.")?;
        }

        Ok(AdviStatus::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meanfield::MeanFieldGaussian;

    #[test]
    fn window_length_is_min_of_pushes_and_capacity() {
        let mut window = ElboDiffWindow::new(3);
        for k in 1..=10 {
            window.push(k as f32);
            assert_eq!(window.len(), k.min(3));
        }
        // oldest entries were evicted
        assert_eq!(window.mean(), 9.0);
    }

    #[test]
    fn median_takes_upper_element_of_even_window() {
        let mut window = ElboDiffWindow::new(4);
        for v in [4.0, 1.0, 3.0, 2.0] {
            window.push(v);
        }
        // sorted: [1, 2, 3, 4], index 4/2 = 2
        assert_eq!(window.median(), 3.0);
    }

    #[test]
    fn median_of_single_element() {
        let mut window = ElboDiffWindow::new(5);
        window.push(0.7);
        assert_eq!(window.median(), 0.7);
    }

    #[test]
    fn rel_difference_of_zero_previous_is_infinite() {
        assert!(rel_difference(0.0, -3.0).is_infinite());
        assert!((rel_difference(-2.0, -1.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn preconditioner_cold_start_uses_raw_accumulation() {
        let mut q = MeanFieldGaussian::new(1);
        let grad = DVector::from_vec(vec![2.0f32, 0.0]);
        let mut s = DVector::<f32>::zeros(2);

        adaptive_step(&mut q, &grad, &mut s, 0.0, 1);
        assert_eq!(s[0], 4.0);

        adaptive_step(&mut q, &grad, &mut s, 0.0, 2);
        assert!((s[0] - (0.9 * 4.0 + 0.1 * 4.0)).abs() < 1e-6);
    }

    #[test]
    fn step_moves_against_preconditioned_gradient() {
        let mut q = MeanFieldGaussian::new(1);
        let grad = DVector::from_vec(vec![1.0f32, 0.0]);
        let mut s = DVector::<f32>::zeros(2);

        adaptive_step(&mut q, &grad, &mut s, 0.5, 1);
        // s = 1, step = 0.5 * 1 / (1 + 1) = 0.25
        assert!((q.params()[0] - 0.25).abs() < 1e-6);
        assert_eq!(q.params()[1], 0.0);
    }

    #[test]
    fn options_reject_zero_counts() {
        let options = AdviOptions {
            n_monte_carlo_grad: 0,
            ..AdviOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(AdviError::InvalidArgument { .. })
        ));
        assert!(AdviOptions::default().validate().is_ok());
    }

    #[test]
    fn run_args_must_be_in_range() {
        assert!(validate_run_args(0.1, 0.01, 100).is_ok());
        assert!(validate_run_args(0.0, 0.01, 100).is_ok());
        assert!(validate_run_args(-0.1, 0.01, 100).is_err());
        assert!(validate_run_args(0.1, 0.0, 100).is_err());
        assert!(validate_run_args(0.1, 0.01, 0).is_err());
    }
}
