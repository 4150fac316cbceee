//! Markov chain Monte Carlo samplers over the same differentiable model
//! interface the variational engine consumes.
//!
//! Two gradient-based samplers are provided: Hamiltonian Monte Carlo with
//! a static integration time, and the No-U-Turn Sampler (slice variant
//! with tree doubling). Both use a unit Euclidean metric and treat a
//! failed or non-finite log-density as an infinite-energy state.

/// Collected samples with posterior summaries
pub mod chain;

/// Hamiltonian Monte Carlo with static integration time
pub mod hmc;

/// No-U-Turn Sampler
pub mod nuts;

pub use chain::McmcChain;
pub use hmc::{HmcOptions, StaticHmc};
pub use nuts::{Nuts, NutsOptions};
