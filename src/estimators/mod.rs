//! Estimators - consumers of the per-step walker population.

mod block;

pub use block::{autocorrelation_time, blocking_error, BlockEstimator, BlockRecord, EnergyStats};

use crate::sampling::Walker;

/// Receives the walker population once per step. The only thing that flows back into the
/// sampler is what the driver reads off the sink itself.
pub trait EstimatorSink {
    fn start_block(&mut self);
    fn accumulate(&mut self, walkers: &[Walker]);
    fn stop_block(&mut self, accept_ratio: f64);
}
