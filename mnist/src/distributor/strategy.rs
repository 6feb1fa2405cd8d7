use comms::{Delivery, ProcessGroup, ROOT};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    Result, WorkloadErr,
    batch::{HostBatch, StagedBatch},
};

/// Moves a staged global batch to this participant's model replica.
///
/// The strategy is chosen once, when the distributor is built.
#[allow(unused)]
#[trait_variant::make(Distribution: Send)]
pub trait LocalDistribution {
    /// Returns this participant's rank.
    fn rank(&self) -> usize;

    /// Returns the amount of participants, each holding a model replica.
    fn world_size(&self) -> usize;

    /// Hands out this participant's share of a global batch.
    ///
    /// # Arguments
    /// * `staged` - The global batch on the coordinator, `None` once its source is exhausted.
    ///   Workers pass the zeroed destination buffers.
    ///
    /// # Returns
    /// The local batch or `None` at the end of the stream.
    async fn distribute(&mut self, staged: Option<StagedBatch>) -> Result<Option<HostBatch>>;

    /// Sums `values` element-wise over every participant, in place.
    async fn reduce_sum(&mut self, values: &mut [f32]) -> Result<()>;

    /// Called on the coordinator when it can't stage a batch, so no participant is left waiting
    /// for one.
    async fn abort(&mut self, reason: &str) -> Result<()>;
}

/// One process drives every device: the global batch is kept whole.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalReshape;

impl Distribution for LocalReshape {
    fn rank(&self) -> usize {
        ROOT
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn distribute(&mut self, staged: Option<StagedBatch>) -> Result<Option<HostBatch>> {
        staged.map(StagedBatch::flatten).transpose()
    }

    async fn reduce_sum(&mut self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    async fn abort(&mut self, _reason: &str) -> Result<()> {
        Ok(())
    }
}

/// One process per worker: rank `ROOT` broadcasts every global batch and each rank keeps its
/// own slice.
pub struct Collective<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    group: ProcessGroup<R, W>,
}

impl<R, W> Collective<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(group: ProcessGroup<R, W>) -> Self {
        Self { group }
    }

    /// Gives the process group back, so it can carry another stream.
    pub fn into_group(self) -> ProcessGroup<R, W> {
        self.group
    }
}

fn expect_tensor(delivery: Delivery) -> Result<()> {
    match delivery {
        Delivery::Tensor => Ok(()),
        Delivery::EndOfStream => Err(WorkloadErr::UnexpectedEndOfStream),
    }
}

impl<R, W> Distribution for Collective<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn rank(&self) -> usize {
        self.group.rank()
    }

    fn world_size(&self) -> usize {
        self.group.world_size()
    }

    async fn distribute(&mut self, staged: Option<StagedBatch>) -> Result<Option<HostBatch>> {
        let Some(mut staged) = staged else {
            self.group.end_stream().await?;
            return Ok(None);
        };

        let (inputs, targets, weights) = staged.buffers_mut()?;
        if self.group.broadcast(inputs, ROOT).await? == Delivery::EndOfStream {
            return Ok(None);
        }
        expect_tensor(self.group.broadcast(targets, ROOT).await?)?;
        expect_tensor(self.group.broadcast(weights, ROOT).await?)?;

        staged.select(self.group.rank()).map(Some)
    }

    async fn reduce_sum(&mut self, values: &mut [f32]) -> Result<()> {
        Ok(self.group.all_reduce_sum(values).await?)
    }

    async fn abort(&mut self, reason: &str) -> Result<()> {
        Ok(self.group.abort(reason).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchShape, IMAGE_SIDE};
    use comms::collective;

    #[tokio::test]
    async fn stream_ending_inside_a_batch_is_an_error() {
        let shape = BatchShape::new(4, 2).unwrap();
        let mut groups = collective::in_memory(2, 1 << 16).unwrap();
        let mut worker = Collective::new(groups.pop().unwrap());
        let mut root = groups.pop().unwrap();

        let handle = tokio::spawn(async move {
            Distribution::distribute(&mut worker, Some(StagedBatch::zeroed(shape))).await
        });

        let mut inputs = vec![0f32; 4 * IMAGE_SIDE * IMAGE_SIDE];
        let _ = root.broadcast(&mut inputs, ROOT).await.unwrap();
        root.end_stream().await.unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(WorkloadErr::UnexpectedEndOfStream)
        ));
    }

    #[tokio::test]
    async fn stream_ending_between_batches_is_not_an_error() {
        let shape = BatchShape::new(4, 2).unwrap();
        let mut groups = collective::in_memory(2, 1 << 16).unwrap();
        let mut worker = Collective::new(groups.pop().unwrap());
        let mut root = Collective::new(groups.pop().unwrap());

        let handle = tokio::spawn(async move {
            Distribution::distribute(&mut worker, Some(StagedBatch::zeroed(shape))).await
        });

        assert!(Distribution::distribute(&mut root, None).await.unwrap().is_none());
        assert!(handle.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn local_reshape_ignores_aborts() {
        let mut local = LocalReshape;
        Distribution::abort(&mut local, "anything").await.unwrap();
        assert!(Distribution::distribute(&mut local, None).await.unwrap().is_none());
    }
}
