use nalgebra::DVector;

/// Collected MCMC samples with log-densities.
pub struct McmcChain {
    pub samples: Vec<DVector<f32>>,
    pub log_densities: Vec<f32>,
    /// Fraction of accepted transitions over the whole run.
    pub accept_rate: f32,
}

impl McmcChain {
    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Element-wise posterior mean across samples.
    pub fn posterior_mean(&self) -> DVector<f32> {
        let n = self.n_samples();
        if n == 0 {
            return DVector::zeros(0);
        }
        let mut mean = DVector::zeros(self.samples[0].len());
        for sample in &self.samples {
            mean += sample;
        }
        mean / n as f32
    }

    /// Element-wise posterior variance across samples.
    pub fn posterior_variance(&self) -> DVector<f32> {
        let n = self.n_samples();
        if n < 2 {
            return DVector::zeros(0);
        }
        let mean = self.posterior_mean();
        let mut var = DVector::zeros(mean.len());
        for sample in &self.samples {
            let diff = sample - &mean;
            var += diff.component_mul(&diff);
        }
        var / (n - 1) as f32
    }

    /// Element-wise quantile (`0 <= q <= 1`) across samples, with linear
    /// interpolation between order statistics.
    pub fn quantile(&self, q: f32) -> DVector<f32> {
        let n = self.n_samples();
        if n == 0 {
            return DVector::zeros(0);
        }
        let d = self.samples[0].len();
        let mut result = DVector::zeros(d);

        let mut vals = vec![0.0f32; n];
        for i in 0..d {
            for (v, sample) in vals.iter_mut().zip(self.samples.iter()) {
                *v = sample[i];
            }
            vals.sort_unstable_by(f32::total_cmp);
            let idx = (q * (n - 1) as f32).clamp(0.0, (n - 1) as f32);
            let lo = idx.floor() as usize;
            let hi = idx.ceil() as usize;
            result[i] = if lo == hi {
                vals[lo]
            } else {
                let frac = idx - lo as f32;
                vals[lo] * (1.0 - frac) + vals[hi] * frac
            };
        }
        result
    }
}
