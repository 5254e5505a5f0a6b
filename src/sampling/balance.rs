//! Walker load balancing between ranks.
//!
//! Branching only ever creates or removes walkers where they already live, so over many
//! generations the population wanders between ranks and can pile up on one of them. After each
//! branching pass the crowded ranks ship their surplus, bincode-encoded, to the sparse ones.

use log::debug;
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{QmcError, Result};
use crate::io::WalkerSnapshot;
use crate::systems::System;
use super::comm::{collective, Communicator};
use super::walker::WalkerPopulation;

/// `count` walkers moving from rank `from` to rank `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub from: usize,
    pub to: usize,
    pub count: usize,
}

/// Walkers rank `rank` holds when `total` are spread as evenly as possible over `size` ranks.
pub fn fair_share(total: usize, rank: usize, size: usize) -> usize {
    total / size + usize::from(rank < total % size)
}

/// Moves bringing every rank to its fair share. Surplus ranks are paired with deficit ranks in
/// rank order, so the plan is the same on every rank and each (from, to) pair appears at most
/// once.
pub fn transfer_plan(counts: &[usize]) -> Vec<Transfer> {
    let size = counts.len();
    let total: usize = counts.iter().sum();
    let mut surplus = Vec::new();
    let mut deficit = Vec::new();
    for (rank, &count) in counts.iter().enumerate() {
        let share = fair_share(total, rank, size);
        if count > share {
            surplus.push((rank, count - share));
        } else if count < share {
            deficit.push((rank, share - count));
        }
    }

    let mut plan = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < surplus.len() && j < deficit.len() {
        let count = surplus[i].1.min(deficit[j].1);
        plan.push(Transfer { from: surplus[i].0, to: deficit[j].0, count });
        surplus[i].1 -= count;
        deficit[j].1 -= count;
        if surplus[i].1 == 0 {
            i += 1;
        }
        if deficit[j].1 == 0 {
            j += 1;
        }
    }
    plan
}

/// Even out walker counts over the ranks of `comm`. Arriving walkers get their caches rebuilt
/// for `system` and a fresh stream drawn from `rng`. Returns how many walkers this rank sent.
///
/// Collective: every rank must call it, and a failure on any rank is an error on all of them.
pub fn balance_population(
    population: &mut WalkerPopulation,
    comm: &dyn Communicator,
    system: &System,
    rng: &mut StdRng,
) -> Result<usize> {
    if comm.size() == 1 {
        return Ok(0);
    }
    let counts = comm.all_gather_usize(population.len());
    let plan = transfer_plan(&counts);
    if plan.is_empty() {
        return Ok(0);
    }

    let rank = comm.rank();
    let mut walkers = population.take();
    let mut send = vec![Vec::new(); comm.size()];
    let mut outcome = Ok(());
    let mut sent = 0;
    for transfer in plan.iter().filter(|t| t.from == rank) {
        let start = walkers.len() - transfer.count;
        let outgoing: Vec<WalkerSnapshot> =
            walkers.drain(start..).map(|w| WalkerSnapshot::capture(&w)).collect();
        match bincode::serialize(&outgoing) {
            Ok(bytes) => send[transfer.to] = bytes,
            Err(e) => {
                let msg = format!("encoding walkers for rank {}: {e}", transfer.to);
                outcome = Err(QmcError::Checkpoint(msg));
            }
        }
        sent += transfer.count;
    }

    let received = comm.all_to_all_bytes(send);
    for transfer in plan.iter().filter(|t| t.to == rank) {
        let arrived = bincode::deserialize::<Vec<WalkerSnapshot>>(&received[transfer.from])
            .map_err(|e| {
                QmcError::Checkpoint(format!("decoding walkers from rank {}: {e}", transfer.from))
            })
            .and_then(|stored| {
                stored
                    .iter()
                    .map(|s| s.restore(system, rng.gen()))
                    .collect::<Result<Vec<_>>>()
            });
        match arrived {
            Ok(arrived) => walkers.extend(arrived),
            Err(err) => outcome = Err(err),
        }
    }
    population.replace(walkers);
    collective(comm, outcome, |n| {
        QmcError::Checkpoint(format!("walker transfer failed on {n} rank(s)"))
    })?;
    debug!("rank {rank}: sent {sent} walkers, now holding {}", population.len());
    Ok(sent)
}
