//! Dividing the model × confrontation matrix between workers.
//!
//! Every worker builds the same work list independently and cuts its own
//! slice from it; the only messages exchanged are a digest check of the list
//! and one ownership reduction per confrontation to pick its leader.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::ops::Range;

use crate::fabric::WorkerContext;

/// One (model, confrontation) pair, by index into the run's model and
/// confrontation lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub model: usize,
    pub confrontation: usize,
}

/// The full cross product, confrontation-major.
pub fn build_work_list(n_models: usize, n_confrontations: usize) -> Vec<WorkItem> {
    (0..n_confrontations)
        .flat_map(|confrontation| {
            (0..n_models).map(move |model| WorkItem {
                model,
                confrontation,
            })
        })
        .collect()
}

/// Fingerprint of the work list by name, used to check that all workers
/// agree on its content and order.
pub fn work_list_digest(items: &[WorkItem], models: &[&str], confrontations: &[&str]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(confrontations[item.confrontation].as_bytes());
        hasher.update([0u8]);
        hasher.update(models[item.model].as_bytes());
        hasher.update([b'\n']);
    }
    hasher.finalize().into()
}

fn digest_words(digest: &[u8; 32]) -> Vec<i64> {
    digest
        .chunks(8)
        .map(|c| {
            let mut word = [0u8; 8];
            word.copy_from_slice(c);
            i64::from_be_bytes(word)
        })
        .collect()
}

/// Fails unless rank 0 computed the same work-list digest.
pub fn verify_work_list(ctx: &dyn WorkerContext, digest: &[u8; 32]) -> Result<()> {
    let local = digest_words(digest);
    let root = ctx.broadcast(0, &local)?;
    if root != local {
        return Err(anyhow!(
            "work list mismatch: rank {} built sha256:{} but rank 0 built a different list",
            ctx.rank(),
            hex::encode(digest)
        ));
    }
    Ok(())
}

/// Index range of the work list owned by `rank`:
/// `[round(rank·n/W), round((rank+1)·n/W))`, rounding halves up.
pub fn partition(n: usize, workers: usize, rank: usize) -> Result<Range<usize>> {
    if workers == 0 {
        return Err(anyhow!("worker count must be at least 1"));
    }
    if rank >= workers {
        return Err(anyhow!("rank {} out of range for {} workers", rank, workers));
    }
    let bound = |r: usize| (2 * r * n + workers) / (2 * workers);
    Ok(bound(rank)..bound(rank + 1))
}

/// This worker's contribution to the ownership reduction for one
/// confrontation: its local count in its own slot, zeros elsewhere.
pub fn ownership_counts(
    local: &[WorkItem],
    confrontation: usize,
    rank: usize,
    workers: usize,
) -> Vec<i64> {
    let mut counts = vec![0i64; workers];
    counts[rank] = local
        .iter()
        .filter(|w| w.confrontation == confrontation)
        .count() as i64;
    counts
}

/// The worker owning the most items; the lowest rank wins ties.
pub fn elect_leader(counts: &[i64]) -> usize {
    let mut best = 0;
    for (rank, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = rank;
        }
    }
    best
}

/// Elected leader per confrontation, fixed for the whole run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderTable {
    rank: usize,
    leaders: Vec<usize>,
}

impl LeaderTable {
    pub fn is_master(&self, confrontation: usize) -> bool {
        self.leaders[confrontation] == self.rank
    }

    pub fn leaders(&self) -> &[usize] {
        &self.leaders
    }
}

/// Runs one ownership reduction per confrontation. Every worker must call
/// this with the same `n_confrontations`.
pub fn elect_leaders(
    ctx: &dyn WorkerContext,
    local: &[WorkItem],
    n_confrontations: usize,
) -> Result<LeaderTable> {
    let mut leaders = Vec::with_capacity(n_confrontations);
    for c in 0..n_confrontations {
        let counts = ctx.reduce_sum(&ownership_counts(local, c, ctx.rank(), ctx.size()))?;
        leaders.push(elect_leader(&counts));
    }
    Ok(LeaderTable {
        rank: ctx.rank(),
        leaders,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{thread_fabric, SoloContext};
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn work_list_is_confrontation_major() {
        let items = build_work_list(2, 2);
        let pairs: Vec<_> = items.iter().map(|w| (w.confrontation, w.model)).collect();
        assert_eq!(pairs, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn partition_matches_rounded_bounds() {
        // 7 items over 3 workers: 7/3 = 2.33 → [0,2) [2,5) [5,7)
        let slices: Vec<_> = (0..3).map(|r| partition(7, 3, r).expect("slice")).collect();
        assert_eq!(slices, vec![0..2, 2..5, 5..7]);
        // halves round up: 5 items over 2 workers splits at 3
        assert_eq!(partition(5, 2, 0).expect("slice"), 0..3);
        assert!(partition(2, 4, 0).expect("slice").len() <= 1);
        assert!(partition(3, 0, 0).is_err());
        assert!(partition(3, 2, 2).is_err());
    }

    #[test]
    fn leader_ties_go_to_lowest_rank() {
        assert_eq!(elect_leader(&[1, 3, 3, 0]), 1);
        assert_eq!(elect_leader(&[0, 0, 0]), 0);
        assert_eq!(elect_leader(&[2, 1, 2]), 0);
    }

    #[test]
    fn election_over_threads_is_consistent_and_repeatable() {
        // 3 models x 2 confrontations over 4 workers:
        // slices [0,2) [2,3) [3,5) [5,6); rank 0 owns two of confrontation 0,
        // rank 2 owns two of confrontation 1.
        let items = build_work_list(3, 2);
        let workers = thread_fabric(4).expect("fabric");
        let handles: Vec<_> = workers
            .into_iter()
            .map(|ctx| {
                let items = items.clone();
                thread::spawn(move || {
                    let range = partition(items.len(), ctx.size(), ctx.rank()).expect("slice");
                    let local = &items[range];
                    let first = elect_leaders(&ctx, local, 2).expect("elect");
                    let second = elect_leaders(&ctx, local, 2).expect("elect again");
                    (ctx.rank(), first, second)
                })
            })
            .collect();
        let mut masters = vec![Vec::new(); 2];
        for h in handles {
            let (rank, first, second) = h.join().expect("worker");
            assert_eq!(first, second);
            assert_eq!(first.leaders(), &[0, 2]);
            for (c, list) in masters.iter_mut().enumerate() {
                if first.is_master(c) {
                    list.push(rank);
                }
            }
        }
        assert_eq!(masters, vec![vec![0], vec![2]]);
    }

    #[test]
    fn digest_depends_on_order() {
        let models = ["a", "b"];
        let confs = ["c1", "c2"];
        let items = build_work_list(2, 2);
        let mut reversed = items.clone();
        reversed.reverse();
        assert_ne!(
            work_list_digest(&items, &models, &confs),
            work_list_digest(&reversed, &models, &confs)
        );
        verify_work_list(&SoloContext, &work_list_digest(&items, &models, &confs))
            .expect("solo always agrees");
    }

    proptest! {
        #[test]
        fn slices_partition_the_work_list(n in 0usize..500, workers in 1usize..64) {
            let mut next = 0;
            for rank in 0..workers {
                let range = partition(n, workers, rank).expect("slice");
                prop_assert_eq!(range.start, next);
                prop_assert!(range.start <= range.end);
                next = range.end;
            }
            prop_assert_eq!(next, n);
        }
    }
}
