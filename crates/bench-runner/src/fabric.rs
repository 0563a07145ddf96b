//! Collective communication between the workers of one run.
//!
//! Workers only ever exchange small integer vectors (ownership counts, the
//! work-list digest) and wait on barriers; bulk results travel through the
//! shared output directory. Every coordination function takes the context
//! explicitly.

use anyhow::{anyhow, Context, Result};
use bench_core::{atomic_write_bytes, ensure_dir};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub trait WorkerContext {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Element-wise sum of `local` over all workers; every worker receives
    /// the same result.
    fn reduce_sum(&self, local: &[i64]) -> Result<Vec<i64>>;
    /// Returns `root`'s `values` on every worker.
    fn broadcast(&self, root: usize, values: &[i64]) -> Result<Vec<i64>>;
    /// Blocks until every worker has reached the same barrier.
    fn barrier(&self) -> Result<()>;
}

fn sum_vectors(rank_vectors: &[Vec<i64>]) -> Result<Vec<i64>> {
    let len = rank_vectors.first().map_or(0, Vec::len);
    let mut total = vec![0i64; len];
    for (rank, v) in rank_vectors.iter().enumerate() {
        if v.len() != len {
            return Err(anyhow!(
                "reduce length mismatch: rank {} sent {} values, expected {}",
                rank,
                v.len(),
                len
            ));
        }
        for (t, x) in total.iter_mut().zip(v) {
            *t += x;
        }
    }
    Ok(total)
}

/// A run with a single worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloContext;

impl WorkerContext for SoloContext {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn reduce_sum(&self, local: &[i64]) -> Result<Vec<i64>> {
        Ok(local.to_vec())
    }

    fn broadcast(&self, _root: usize, values: &[i64]) -> Result<Vec<i64>> {
        Ok(values.to_vec())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

struct SharedSlots {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<i64>>>,
}

/// One worker of an in-process fabric; move each into its own thread.
pub struct ThreadWorker {
    rank: usize,
    size: usize,
    shared: Arc<SharedSlots>,
}

/// Creates `size` connected in-process workers.
pub fn thread_fabric(size: usize) -> Result<Vec<ThreadWorker>> {
    if size == 0 {
        return Err(anyhow!("worker count must be at least 1"));
    }
    let shared = Arc::new(SharedSlots {
        barrier: Barrier::new(size),
        slots: Mutex::new(vec![Vec::new(); size]),
    });
    Ok((0..size)
        .map(|rank| ThreadWorker {
            rank,
            size,
            shared: Arc::clone(&shared),
        })
        .collect())
}

impl ThreadWorker {
    fn slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<Vec<i64>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| anyhow!("fabric slots poisoned by a panicked worker"))
    }
}

impl WorkerContext for ThreadWorker {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn reduce_sum(&self, local: &[i64]) -> Result<Vec<i64>> {
        self.slots()?[self.rank] = local.to_vec();
        self.shared.barrier.wait();
        let result = sum_vectors(&self.slots()?);
        // nobody may overwrite a slot until every worker has read them all
        self.shared.barrier.wait();
        result
    }

    fn broadcast(&self, root: usize, values: &[i64]) -> Result<Vec<i64>> {
        if root >= self.size {
            return Err(anyhow!("broadcast root {} out of range", root));
        }
        if self.rank == root {
            self.slots()?[root] = values.to_vec();
        }
        self.shared.barrier.wait();
        let result = self.slots()?[root].clone();
        self.shared.barrier.wait();
        Ok(result)
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FabricMessage {
    rank: usize,
    generation: u64,
    values: Vec<i64>,
}

/// One worker process of a fabric built on a shared directory.
///
/// Each collective is a numbered generation: the worker atomically writes
/// `op<gen>.<rank>.json`, then polls until every rank's file for that
/// generation exists. All workers must issue the same sequence of
/// collectives, and each launch needs a fresh directory.
pub struct FileFabric {
    dir: PathBuf,
    rank: usize,
    size: usize,
    generation: Cell<u64>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl FileFabric {
    pub fn new(dir: &Path, rank: usize, size: usize) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(anyhow!("invalid worker rank {} for {} workers", rank, size));
        }
        ensure_dir(dir)?;
        let fabric = Self {
            dir: dir.to_path_buf(),
            rank,
            size,
            generation: Cell::new(0),
            poll_interval: Duration::from_millis(50),
            timeout: None,
        };
        let first = fabric.message_path(0, rank);
        if first.exists() {
            return Err(anyhow!(
                "stale fabric directory {}: rank {} already has messages from an earlier launch",
                dir.display(),
                rank
            ));
        }
        Ok(fabric)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn message_path(&self, generation: u64, rank: usize) -> PathBuf {
        self.dir.join(format!("op{:06}.{}.json", generation, rank))
    }

    fn exchange(&self, values: &[i64]) -> Result<Vec<Vec<i64>>> {
        let generation = self.generation.get();
        self.generation.set(generation + 1);
        let message = FabricMessage {
            rank: self.rank,
            generation,
            values: values.to_vec(),
        };
        atomic_write_bytes(
            &self.message_path(generation, self.rank),
            &serde_json::to_vec(&message)?,
        )?;

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut received = Vec::with_capacity(self.size);
        for rank in 0..self.size {
            let path = self.message_path(generation, rank);
            loop {
                if path.exists() {
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(anyhow!(
                        "fabric_timeout: rank {} waited for rank {} at generation {} in {}",
                        self.rank,
                        rank,
                        generation,
                        self.dir.display()
                    ));
                }
                thread::sleep(self.poll_interval);
            }
            let bytes = fs::read(&path)
                .with_context(|| format!("reading fabric message {}", path.display()))?;
            let parsed: FabricMessage = serde_json::from_slice(&bytes)?;
            if parsed.generation != generation || parsed.rank != rank {
                return Err(anyhow!(
                    "fabric message {} is out of sequence (rank {}, generation {})",
                    path.display(),
                    parsed.rank,
                    parsed.generation
                ));
            }
            received.push(parsed.values);
        }
        Ok(received)
    }
}

impl WorkerContext for FileFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn reduce_sum(&self, local: &[i64]) -> Result<Vec<i64>> {
        sum_vectors(&self.exchange(local)?)
    }

    fn broadcast(&self, root: usize, values: &[i64]) -> Result<Vec<i64>> {
        if root >= self.size {
            return Err(anyhow!("broadcast root {} out of range", root));
        }
        let payload = if self.rank == root { values } else { &[] };
        let mut all = self.exchange(payload)?;
        Ok(std::mem::take(&mut all[root]))
    }

    fn barrier(&self) -> Result<()> {
        self.exchange(&[]).map(|_| ())
    }
}
