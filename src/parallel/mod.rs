//! Rank-parallel execution model
//!
//! Every rank holds the elements that contain at least one of the vertices it owns,
//! so that the full ball of an owned vertex is always available locally. The
//! communication needed by the remesher goes through the [`Communicator`] trait.
mod halo;
mod partition;

use crate::Rank;
use std::fmt::Debug;
use std::sync::{Arc, Barrier, Mutex};

pub(crate) use halo::{EditVertex, HaloEdit, exchange_edits, sync_halo_metrics};
pub(crate) use partition::{assign_global_ids, prune_halo};
pub use partition::{owning_rank_for, partition_mesh};

/// Collective operations between the ranks
///
/// All the ranks must call the collective operations in the same order
pub trait Communicator: Debug + Send + Sync {
    /// Rank of the current process
    fn rank(&self) -> Rank;

    /// Number of ranks
    fn size(&self) -> usize;

    /// Gather `data` from all the ranks; the i-th item of the result comes from rank i
    fn all_gather_u64(&self, data: &[u64]) -> Vec<Vec<u64>>;

    /// Wait for all the ranks
    fn barrier(&self);

    /// Maximum of `v` over all the ranks
    fn all_reduce_max(&self, v: f64) -> f64 {
        if self.size() == 1 {
            return v;
        }
        self.all_gather_u64(&[v.to_bits()])
            .iter()
            .map(|x| f64::from_bits(x[0]))
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Sum of `v` over all the ranks
    fn all_reduce_sum(&self, v: u64) -> u64 {
        if self.size() == 1 {
            return v;
        }
        self.all_gather_u64(&[v]).iter().map(|x| x[0]).sum()
    }

    /// Sum of `v` over all the ranks, added in rank order
    fn all_reduce_sum_f64(&self, v: f64) -> f64 {
        if self.size() == 1 {
            return v;
        }
        self.all_gather_u64(&[v.to_bits()])
            .iter()
            .map(|x| f64::from_bits(x[0]))
            .sum()
    }
}

/// Single rank
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather_u64(&self, data: &[u64]) -> Vec<Vec<u64>> {
        vec![data.to_vec()]
    }

    fn barrier(&self) {}
}

#[derive(Debug)]
struct Shared {
    slots: Mutex<Vec<Vec<u64>>>,
    barrier: Barrier,
}

/// In-process ranks, each one running in its own thread
#[derive(Debug, Clone)]
pub struct ThreadComm {
    rank: Rank,
    size: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Create the communicators for `n` ranks; the i-th one must be moved to the
    /// thread running rank i
    #[must_use]
    pub fn world(n: usize) -> Vec<Self> {
        let shared = Arc::new(Shared {
            slots: Mutex::new(vec![Vec::new(); n]),
            barrier: Barrier::new(n),
        });
        (0..n)
            .map(|rank| Self {
                rank,
                size: n,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather_u64(&self, data: &[u64]) -> Vec<Vec<u64>> {
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slots[self.rank] = data.to_vec();
        }
        self.shared.barrier.wait();
        let res = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        // nobody may overwrite its slot before everyone has read
        self.shared.barrier.wait();
        res
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::{Communicator, SerialComm, ThreadComm};

    #[test]
    fn test_serial() {
        let comm = SerialComm;
        assert_eq!(comm.all_gather_u64(&[1, 2]), vec![vec![1, 2]]);
        assert_eq!(comm.all_reduce_sum(3), 3);
    }

    #[test]
    fn test_threads() {
        let world = ThreadComm::world(3);
        std::thread::scope(|s| {
            let handles = world
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let r = comm.rank() as u64;
                        let all = comm.all_gather_u64(&[r, 10 * r]);
                        assert_eq!(all, vec![vec![0, 0], vec![1, 10], vec![2, 20]]);
                        let m = comm.all_reduce_max(r as f64 - 0.5);
                        assert!((m - 1.5).abs() < 1e-12);
                        comm.all_reduce_sum(r + 1)
                    })
                })
                .collect::<Vec<_>>();
            for h in handles {
                assert_eq!(h.join().unwrap(), 6);
            }
        });
    }
}
