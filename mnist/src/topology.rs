use std::env;

use log::info;
use serde::{Deserialize, Serialize};

use crate::{Result, WorkloadErr};

/// How the global batch reaches the model replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One process per worker, batches are broadcast from rank 0 and sliced locally.
    Collective,
    /// A single process drives every device, the worker axis is folded into the batch axis.
    LocalReshape,
}

/// The set of workers taking part in a run, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    rank: usize,
    num_workers: usize,
    mode: ExecutionMode,
}

impl Topology {
    /// Creates a new `Topology`.
    ///
    /// # Arguments
    /// * `rank` - This process' rank, in `0..num_workers`.
    /// * `num_workers` - The amount of workers (devices) sharing the global batch.
    /// * `mode` - The execution mode.
    ///
    /// # Errors
    /// `WorkloadErr::Config` if `num_workers` is zero, `rank` is out of range or a local run is
    /// asked to act as anything other than rank 0.
    pub fn new(rank: usize, num_workers: usize, mode: ExecutionMode) -> Result<Self> {
        if num_workers == 0 {
            return Err(WorkloadErr::Config("there must be at least one worker".into()));
        }

        if rank >= num_workers {
            return Err(WorkloadErr::Config(format!(
                "rank {rank} is out of range for {num_workers} workers"
            )));
        }

        if mode == ExecutionMode::LocalReshape && rank != 0 {
            return Err(WorkloadErr::Config(format!(
                "a local run has a single process, got rank {rank}"
            )));
        }

        Ok(Self {
            rank,
            num_workers,
            mode,
        })
    }

    /// A local run on a single device.
    pub fn single() -> Self {
        Self {
            rank: 0,
            num_workers: 1,
            mode: ExecutionMode::LocalReshape,
        }
    }

    /// Reads the topology from the process environment.
    ///
    /// `LOCAL_RANK` selects the collective mode with `WORLD_SIZE` workers, otherwise the run is
    /// local over `NUM_DEVICES` devices (one by default).
    pub fn from_env() -> Result<Self> {
        let topology = Self::from_vars(|key| env::var(key).ok())?;
        info!(
            rank = topology.rank,
            num_workers = topology.num_workers;
            "topology is {:?}", topology.mode
        );
        Ok(topology)
    }

    fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<usize>> {
            var(key)
                .map(|raw| {
                    raw.trim().parse().map_err(|e| {
                        WorkloadErr::Config(format!("{key} must be a non-negative integer: {e}"))
                    })
                })
                .transpose()
        };

        match parse("LOCAL_RANK")? {
            Some(rank) => {
                let world_size = parse("WORLD_SIZE")?.ok_or_else(|| {
                    WorkloadErr::Config("WORLD_SIZE must be set along with LOCAL_RANK".into())
                })?;
                Self::new(rank, world_size, ExecutionMode::Collective)
            }
            None => Self::new(
                0,
                parse("NUM_DEVICES")?.unwrap_or(1),
                ExecutionMode::LocalReshape,
            ),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the amount of workers the global batch is split among.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Whether this process loads the data.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn local_rank_selects_collective_mode() {
        let t = Topology::from_vars(vars(&[("LOCAL_RANK", "2"), ("WORLD_SIZE", "4")])).unwrap();
        assert_eq!(t.mode(), ExecutionMode::Collective);
        assert_eq!(t.rank(), 2);
        assert_eq!(t.num_workers(), 4);
        assert!(!t.is_coordinator());
    }

    #[test]
    fn no_rank_means_a_local_run() {
        let t = Topology::from_vars(vars(&[("NUM_DEVICES", "8")])).unwrap();
        assert_eq!(t.mode(), ExecutionMode::LocalReshape);
        assert_eq!(t.num_workers(), 8);

        assert_eq!(Topology::from_vars(vars(&[])).unwrap(), Topology::single());
    }

    #[test]
    fn bad_environments_are_rejected() {
        assert!(Topology::from_vars(vars(&[("LOCAL_RANK", "0")])).is_err());
        assert!(Topology::from_vars(vars(&[("LOCAL_RANK", "4"), ("WORLD_SIZE", "4")])).is_err());
        assert!(Topology::from_vars(vars(&[("NUM_DEVICES", "zero")])).is_err());
        assert!(Topology::new(1, 2, ExecutionMode::LocalReshape).is_err());
        assert!(Topology::new(0, 0, ExecutionMode::Collective).is_err());
    }
}
