//! Splits every global batch among the workers.
//!
//! Only the coordinator (rank 0) pulls from the input pipeline. Depending on the strategy the
//! batch is either broadcast to every worker, which then keeps its own slice, or folded whole
//! into a single local batch.

mod strategy;

use comms::ProcessGroup;
use futures::{Stream, stream};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    Result, WorkloadErr,
    batch::{Batch, BatchShape, RawBatch, StagedBatch},
};
pub use strategy::{Collective, Distribution, LocalDistribution, LocalReshape};

/// What a participant does with the input pipeline.
#[derive(Debug)]
pub enum Role<S> {
    /// Owns the pipeline and stages every global batch.
    Coordinator { source: S },
    /// Never reads data, only receives it.
    Worker,
}

impl<S> Role<S>
where
    S: Iterator<Item = RawBatch>,
{
    /// Prepares the buffers of the next global batch.
    ///
    /// # Returns
    /// The staged batch, or `None` once the coordinator's source is exhausted. Workers always
    /// get zeroed destination buffers.
    fn stage(&mut self, shape: BatchShape) -> Result<Option<StagedBatch>> {
        match self {
            Role::Coordinator { source } => source
                .next()
                .map(|raw| StagedBatch::from_raw(raw, shape))
                .transpose(),
            Role::Worker => Ok(Some(StagedBatch::zeroed(shape))),
        }
    }
}

/// Hands every participant its share of each global batch.
pub struct BatchDistributor<S, D> {
    role: Role<S>,
    strategy: D,
    shape: BatchShape,
    steps: usize,
}

impl<S> BatchDistributor<S, LocalReshape>
where
    S: Iterator<Item = RawBatch>,
{
    /// Builds the distributor of a single process driving `num_devices` devices.
    ///
    /// # Arguments
    /// * `source` - The input pipeline.
    /// * `global_batch_size` - The amount of examples of every batch, over every device.
    /// * `num_devices` - The amount of devices sharing the batch.
    ///
    /// # Errors
    /// `WorkloadErr::IndivisibleBatch` if the batch can't be split evenly among the devices.
    pub fn local(source: S, global_batch_size: usize, num_devices: usize) -> Result<Self> {
        let shape = BatchShape::new(global_batch_size, num_devices)?;
        info!(
            global_batch_size = global_batch_size,
            num_devices = num_devices;
            "local batch distributor ready"
        );

        Ok(Self::new(Role::Coordinator { source }, LocalReshape, shape))
    }
}

impl<S, R, W> BatchDistributor<S, Collective<R, W>>
where
    S: Iterator<Item = RawBatch>,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Builds the distributor of one process of a collective run.
    ///
    /// # Arguments
    /// * `group` - The process group, one rank per worker.
    /// * `global_batch_size` - The amount of examples of every batch, over every worker.
    /// * `make_source` - Builds the input pipeline, only ever called on rank 0.
    ///
    /// # Errors
    /// `WorkloadErr::IndivisibleBatch` if the batch can't be split evenly among the workers.
    pub fn collective<F>(
        group: ProcessGroup<R, W>,
        global_batch_size: usize,
        make_source: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> S,
    {
        let shape = BatchShape::new(global_batch_size, group.world_size())?;
        let role = if group.is_root() {
            Role::Coordinator {
                source: make_source(),
            }
        } else {
            Role::Worker
        };

        info!(
            rank = group.rank(),
            world_size = group.world_size(),
            global_batch_size = global_batch_size;
            "collective batch distributor ready"
        );

        Ok(Self::new(role, Collective::new(group), shape))
    }
}

impl<S, D> BatchDistributor<S, D> {
    pub fn new(role: Role<S>, strategy: D, shape: BatchShape) -> Self {
        Self {
            role,
            strategy,
            shape,
            steps: 0,
        }
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    /// Returns the amount of batches handed out so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Drops the pipeline and returns the strategy.
    pub fn into_strategy(self) -> D {
        self.strategy
    }
}

impl<S, D> BatchDistributor<S, D>
where
    S: Iterator<Item = RawBatch> + Send,
    D: Distribution + Send,
{
    /// Produces this participant's next batch, laid out channels-first.
    ///
    /// # Returns
    /// The batch, or `None` on every participant once the coordinator's source is exhausted.
    ///
    /// # Errors
    /// `WorkloadErr::ShapeMismatch` if the source yields a malformed batch, and communication
    /// errors. A malformed batch also aborts the group, failing the workers with
    /// `CommErr::Peer` instead of leaving them waiting.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>> {
        let staged = match self.role.stage(self.shape) {
            Ok(staged) => staged,
            Err(err) => {
                if let Err(abort_err) = self.strategy.abort(&err.to_string()).await {
                    warn!("failed to abort the group: {abort_err}");
                }
                return Err(err);
            }
        };

        let Some(host) = self.strategy.distribute(staged).await? else {
            info!(rank = self.strategy.rank(), steps = self.steps; "input stream exhausted");
            return Ok(None);
        };

        debug!(rank = self.strategy.rank(), step = self.steps; "batch distributed");
        self.steps += 1;
        Ok(Some(host.into_batch()))
    }

    /// Returns this participant's rank, `comms::ROOT` for a local distributor.
    pub fn rank(&self) -> usize {
        self.strategy.rank()
    }

    /// Returns the amount of model replicas taking part, one per process.
    pub fn replicas(&self) -> usize {
        self.strategy.world_size()
    }

    /// Sums `values` element-wise over every participant, in place.
    pub async fn reduce_sum(&mut self, values: &mut [f32]) -> Result<()> {
        self.strategy.reduce_sum(values).await
    }

    /// Turns the distributor into a lazy stream of batches.
    pub fn into_stream(self) -> impl Stream<Item = Result<Batch>> + Send {
        stream::try_unfold(self, |mut distributor| async move {
            Ok::<_, WorkloadErr>(distributor
                .next_batch()
                .await?
                .map(|batch| (batch, distributor)))
        })
    }
}
