//! Weighted local-energy blocks and their statistics.

use serde::Serialize;

use crate::sampling::{Communicator, Walker};
use super::EstimatorSink;

/// Raw sums for one block, kept unnormalized so blocks from several ranks can be added.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct BlockRecord {
    pub sum_we: f64,
    pub sum_we2: f64,
    pub sum_w: f64,
    /// Walker-steps accumulated.
    pub samples: usize,
    pub steps: usize,
    pub acceptance: f64,
}

impl BlockRecord {
    /// Σ w E / Σ w
    pub fn energy(&self) -> f64 {
        if self.sum_w > 0.0 {
            self.sum_we / self.sum_w
        } else {
            f64::NAN
        }
    }

    /// Weighted variance of the local energy within the block.
    pub fn variance(&self) -> f64 {
        if self.sum_w > 0.0 {
            (self.sum_we2 / self.sum_w - self.energy().powi(2)).max(0.0)
        } else {
            0.0
        }
    }

    /// Mean number of walkers per step.
    pub fn population(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.samples as f64 / self.steps as f64
        }
    }
}

/// Summary over the retained blocks.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct EnergyStats {
    pub mean: f64,
    /// Standard error; `None` when too few blocks remain to estimate it.
    pub error: Option<f64>,
    pub variance: f64,
    /// Integrated autocorrelation time of the block series, in blocks.
    pub autocorrelation_time: f64,
    pub blocks: usize,
}

#[derive(Debug, Default)]
pub struct BlockEstimator {
    discard: usize,
    blocks: Vec<BlockRecord>,
    current: BlockRecord,
}

impl BlockEstimator {
    /// `discard` leading blocks are left out of `stats`.
    pub fn new(discard: usize) -> Self {
        Self { discard, ..Default::default() }
    }

    pub fn blocks(&self) -> &[BlockRecord] {
        &self.blocks
    }

    pub fn last_block(&self) -> Option<&BlockRecord> {
        self.blocks.last()
    }

    /// Replace the last finished block by its sum over all ranks.
    pub fn reduce_block(&mut self, comm: &dyn Communicator) {
        if comm.size() == 1 {
            return;
        }
        if let Some(block) = self.blocks.last_mut() {
            let sum = |v: Vec<f64>| v.iter().sum::<f64>();
            block.sum_we = sum(comm.all_gather_f64(block.sum_we));
            block.sum_we2 = sum(comm.all_gather_f64(block.sum_we2));
            block.sum_w = sum(comm.all_gather_f64(block.sum_w));
            block.samples = comm.all_gather_usize(block.samples).iter().sum();
            block.acceptance = sum(comm.all_gather_f64(block.acceptance)) / comm.size() as f64;
        }
    }

    pub fn stats(&self) -> EnergyStats {
        let kept: Vec<&BlockRecord> = self
            .blocks
            .iter()
            .skip(self.discard)
            .filter(|b| b.sum_w > 0.0)
            .collect();
        if kept.is_empty() {
            return EnergyStats::default();
        }
        let energies: Vec<f64> = kept.iter().map(|b| b.energy()).collect();
        let n = energies.len() as f64;
        let mean = energies.iter().sum::<f64>() / n;
        let variance = kept.iter().map(|b| b.variance()).sum::<f64>() / n;
        let autocorrelation_time = autocorrelation_time(&energies);
        let error = blocking_error(&energies, autocorrelation_time);
        EnergyStats { mean, error, variance, autocorrelation_time, blocks: kept.len() }
    }
}

impl EstimatorSink for BlockEstimator {
    fn start_block(&mut self) {
        self.current = BlockRecord::default();
    }

    fn accumulate(&mut self, walkers: &[Walker]) {
        for w in walkers {
            let we = w.weight * w.local_energy;
            self.current.sum_we += we;
            self.current.sum_we2 += we * w.local_energy;
            self.current.sum_w += w.weight;
        }
        self.current.samples += walkers.len();
        self.current.steps += 1;
    }

    fn stop_block(&mut self, accept_ratio: f64) {
        let mut block = std::mem::take(&mut self.current);
        block.acceptance = accept_ratio;
        self.blocks.push(block);
    }
}

/// Estimate autocorrelation time using initial positive sequence.
pub fn autocorrelation_time(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return 1.0;
    }
    let mean = series.iter().sum::<f64>() / n as f64;
    let var = series.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n as f64;

    if var == 0.0 {
        return 1.0;
    }

    let mut autocorr = 1.0;
    for t in 1..n / 2 {
        let auto_t: f64 = series[..n - t]
            .iter()
            .zip(series[t..].iter())
            .map(|(&x, &y)| (x - mean) * (y - mean))
            .sum::<f64>()
            / ((n - t) as f64 * var);

        if auto_t < 0.0 {
            break;
        }
        autocorr += 2.0 * auto_t;
    }
    autocorr
}

/// Standard error of the mean from blocks of length ⌈2τ⌉, or `None` with fewer than two
/// such blocks.
pub fn blocking_error(series: &[f64], autocorrelation_time: f64) -> Option<f64> {
    let block_size = ((2.0 * autocorrelation_time).ceil() as usize).max(1);
    let n_blocks = series.len() / block_size;

    if n_blocks < 2 {
        return None;
    }

    let block_means: Vec<f64> = series
        .chunks_exact(block_size)
        .map(|chunk| chunk.iter().sum::<f64>() / block_size as f64)
        .collect();

    let mean = block_means.iter().sum::<f64>() / n_blocks as f64;
    let variance =
        block_means.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n_blocks - 1) as f64;

    Some((variance / n_blocks as f64).sqrt())
}
