//! Collective operations needed by population control.
//!
//! Only population control talks across ranks: it needs every rank's weight sum and walker count
//! before a comb can be laid over the global population, and it ships serialized walkers from
//! crowded ranks to sparse ones afterwards. `SingleProcess` is the trivial group;
//! `LocalGroup` runs ranks as threads of one process and is what the multi-rank code paths are
//! exercised with.

use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use crate::error::{QmcError, Result};

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Every rank's `value`, indexed by rank.
    fn all_gather_f64(&self, value: f64) -> Vec<f64>;
    fn all_gather_usize(&self, value: usize) -> Vec<usize>;
    /// The value passed by `root` on every rank.
    fn broadcast_f64(&self, value: f64, root: usize) -> f64;
    /// Personalized exchange: `send[dest]` goes to rank `dest`; the result holds what each
    /// rank sent here, indexed by source. Missing trailing entries of `send` count as empty.
    fn all_to_all_bytes(&self, send: Vec<Vec<u8>>) -> Vec<Vec<u8>>;
    fn barrier(&self);

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather_f64(&self, value: f64) -> Vec<f64> {
        vec![value]
    }

    fn all_gather_usize(&self, value: usize) -> Vec<usize> {
        vec![value]
    }

    fn broadcast_f64(&self, value: f64, _root: usize) -> f64 {
        value
    }

    fn all_to_all_bytes(&self, mut send: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        send.truncate(1);
        send.resize(1, Vec::new());
        send
    }

    fn barrier(&self) {}
}

/// Make a per-rank outcome collective: if any rank failed, every rank returns an error, so no
/// rank is left waiting in a later gather.
pub fn collective<T>(
    comm: &dyn Communicator,
    outcome: Result<T>,
    fail: impl FnOnce(usize) -> QmcError,
) -> Result<T> {
    let failed: usize = comm.all_gather_usize(usize::from(outcome.is_err())).iter().sum();
    match outcome {
        Err(err) => Err(err),
        Ok(_) if failed > 0 => Err(fail(failed)),
        Ok(value) => Ok(value),
    }
}

/// Check that every rank holds the same `value`. All ranks see the same gathered values, so
/// either all of them return `Desync` or none does.
pub fn check_agreement(comm: &dyn Communicator, what: &'static str, value: f64) -> Result<()> {
    let values = comm.all_gather_f64(value);
    match values.iter().find(|v| v.to_bits() != values[0].to_bits()) {
        Some(&other) => Err(QmcError::Desync { what, local: value, global: other }),
        None => Ok(()),
    }
}

struct Shared {
    barrier: Barrier,
    reals: Mutex<Vec<f64>>,
    counts: Mutex<Vec<usize>>,
    /// `mailbox[dest][src]`
    mailbox: Mutex<Vec<Vec<Vec<u8>>>>,
}

/// One rank of an in-process group; create the whole group with `LocalGroup::create` and hand
/// one member to each thread.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A rank that panicked has already failed the run; the data itself is still usable.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocalGroup {
    pub fn create(size: usize) -> Vec<LocalGroup> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            reals: Mutex::new(vec![0.0; size]),
            counts: Mutex::new(vec![0; size]),
            mailbox: Mutex::new(vec![vec![Vec::new(); size]; size]),
        });
        (0..size).map(|rank| LocalGroup { rank, size, shared: Arc::clone(&shared) }).collect()
    }

    fn gather<T: Copy>(&self, slots: &Mutex<Vec<T>>, value: T) -> Vec<T> {
        lock(slots)[self.rank] = value;
        self.shared.barrier.wait();
        let all = lock(slots).clone();
        // Nobody may overwrite a slot before every rank has read it.
        self.shared.barrier.wait();
        all
    }
}

impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather_f64(&self, value: f64) -> Vec<f64> {
        self.gather(&self.shared.reals, value)
    }

    fn all_gather_usize(&self, value: usize) -> Vec<usize> {
        self.gather(&self.shared.counts, value)
    }

    fn broadcast_f64(&self, value: f64, root: usize) -> f64 {
        self.all_gather_f64(value)[root]
    }

    fn all_to_all_bytes(&self, send: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        {
            let mut mailbox = lock(&self.shared.mailbox);
            for (dest, bytes) in send.into_iter().enumerate().take(self.size) {
                mailbox[dest][self.rank] = bytes;
            }
        }
        self.shared.barrier.wait();
        let received: Vec<Vec<u8>> = lock(&self.shared.mailbox)[self.rank]
            .iter_mut()
            .map(std::mem::take)
            .collect();
        self.shared.barrier.wait();
        received
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_is_identity() {
        let comm = SingleProcess;
        assert_eq!(comm.all_gather_f64(2.5), vec![2.5]);
        assert_eq!(comm.broadcast_f64(1.0, 0), 1.0);
        assert!(comm.is_root());
    }

    #[test]
    fn test_local_group_gathers_in_rank_order() {
        let group = LocalGroup::create(4);
        let results: Vec<(Vec<usize>, f64)> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let mut last = (Vec::new(), 0.0);
                        // Repeated rounds must not bleed into each other.
                        for round in 0..10 {
                            let counts = comm.all_gather_usize(comm.rank() * 10 + round);
                            let root = comm.broadcast_f64(comm.rank() as f64 + 0.5, 2);
                            last = (counts, root);
                        }
                        last
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (counts, root) in results {
            assert_eq!(counts, vec![9, 19, 29, 39]);
            assert_eq!(root, 2.5);
        }
    }

    #[test]
    fn test_all_to_all_routes_by_destination() {
        let group = LocalGroup::create(3);
        let received: Vec<Vec<Vec<u8>>> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let mut last = Vec::new();
                        for round in 0..5u8 {
                            // Rank r sends [r, dest, round] to every rank except itself.
                            let send = (0..comm.size())
                                .map(|dest| {
                                    if dest == comm.rank() {
                                        Vec::new()
                                    } else {
                                        vec![comm.rank() as u8, dest as u8, round]
                                    }
                                })
                                .collect();
                            last = comm.all_to_all_bytes(send);
                        }
                        last
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (rank, inbox) in received.iter().enumerate() {
            assert_eq!(inbox.len(), 3);
            for (src, bytes) in inbox.iter().enumerate() {
                if src == rank {
                    assert!(bytes.is_empty());
                } else {
                    assert_eq!(bytes, &vec![src as u8, rank as u8, 4]);
                }
            }
        }
        assert_eq!(SingleProcess.all_to_all_bytes(vec![vec![1, 2]]), vec![vec![1, 2]]);
    }

    #[test]
    fn test_disagreement_is_reported_on_every_rank() {
        let group = LocalGroup::create(3);
        let outcomes: Vec<(bool, bool)> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let same = check_agreement(comm, "step", 12.0).is_ok();
                        let value = if comm.rank() == 2 { -1.25 } else { -1.0 };
                        let split = matches!(
                            check_agreement(comm, "trial energy", value),
                            Err(QmcError::Desync { what: "trial energy", .. })
                        );
                        (same, split)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(outcomes.iter().all(|&(same, split)| same && split));
    }

    #[test]
    fn test_collective_fails_everywhere() {
        let group = LocalGroup::create(2);
        let failed: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let outcome = if comm.rank() == 1 {
                            Err(QmcError::Config("bad".into()))
                        } else {
                            Ok(())
                        };
                        collective(comm, outcome, |n| QmcError::Checkpoint(format!("{n} failed")))
                            .is_err()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(failed, vec![true, true]);
    }
}
