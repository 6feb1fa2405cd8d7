use comms::CommErr;
use ndarray::{Array1, Array2, Array4, Array5, ArrayD, Axis, Ix2, Ix5, s};

use crate::{Result, WorkloadErr};

/// The side of every MNIST image, in pixels.
pub const IMAGE_SIDE: usize = 28;
pub const CHANNELS: usize = 1;
pub const NUM_CLASSES: usize = 10;

/// How a global batch is laid out among the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchShape {
    num_workers: usize,
    per_worker: usize,
}

impl BatchShape {
    /// Splits `global_batch_size` examples evenly among `num_workers`.
    ///
    /// # Errors
    /// `WorkloadErr::IndivisibleBatch` if the batch is empty or the split would be uneven.
    pub fn new(global_batch_size: usize, num_workers: usize) -> Result<Self> {
        if num_workers == 0 || global_batch_size == 0 || global_batch_size % num_workers != 0 {
            return Err(WorkloadErr::IndivisibleBatch {
                global: global_batch_size,
                workers: num_workers,
            });
        }

        Ok(Self {
            num_workers,
            per_worker: global_batch_size / num_workers,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Returns the amount of examples every worker gets.
    pub fn per_worker(&self) -> usize {
        self.per_worker
    }

    pub fn global(&self) -> usize {
        self.num_workers * self.per_worker
    }
}

/// A global batch as the input pipeline produces it.
///
/// Every array leads with a worker axis and a per-worker batch axis: inputs are
/// `[N, P, 28, 28, 1]` and targets and weights are `[N, P]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBatch {
    pub inputs: ArrayD<f32>,
    pub targets: ArrayD<i32>,
    pub weights: ArrayD<f32>,
}

/// A global batch in the dtypes that go over the wire, ready to be broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBatch {
    inputs: Array5<f32>,
    targets: Array2<i64>,
    weights: Array2<u8>,
}

fn check_shape(what: &'static str, got: &[usize], expected: &[usize]) -> Result<()> {
    if got != expected {
        return Err(WorkloadErr::ShapeMismatch {
            what,
            got: got.to_vec(),
            expected: expected.to_vec(),
        });
    }

    Ok(())
}

impl StagedBatch {
    /// Validates a raw batch against `shape` and converts it: targets widen to `i64` and weights
    /// become a one byte validity flag.
    ///
    /// # Errors
    /// `WorkloadErr::ShapeMismatch` if any array does not match `shape`.
    pub fn from_raw(raw: RawBatch, shape: BatchShape) -> Result<Self> {
        let (n, p) = (shape.num_workers(), shape.per_worker());

        check_shape(
            "inputs",
            raw.inputs.shape(),
            &[n, p, IMAGE_SIDE, IMAGE_SIDE, CHANNELS],
        )?;
        check_shape("targets", raw.targets.shape(), &[n, p])?;
        check_shape("weights", raw.weights.shape(), &[n, p])?;

        let mut inputs = raw.inputs.into_dimensionality::<Ix5>()?;
        if !inputs.is_standard_layout() {
            inputs = inputs.as_standard_layout().into_owned();
        }

        Ok(Self {
            inputs,
            targets: raw.targets.mapv(i64::from).into_dimensionality::<Ix2>()?,
            weights: raw
                .weights
                .mapv(|w| u8::from(w != 0.))
                .into_dimensionality::<Ix2>()?,
        })
    }

    /// A batch of zeroes, the destination of a broadcast on every worker.
    pub fn zeroed(shape: BatchShape) -> Self {
        let (n, p) = (shape.num_workers(), shape.per_worker());

        Self {
            inputs: Array5::zeros((n, p, IMAGE_SIDE, IMAGE_SIDE, CHANNELS)),
            targets: Array2::zeros((n, p)),
            weights: Array2::zeros((n, p)),
        }
    }

    /// Returns the inputs, targets and weights buffers, in broadcast order.
    pub(crate) fn buffers_mut(&mut self) -> Result<(&mut [f32], &mut [i64], &mut [u8])> {
        let inputs = self
            .inputs
            .as_slice_mut()
            .ok_or(WorkloadErr::NonContiguous { what: "inputs" })?;
        let targets = self
            .targets
            .as_slice_mut()
            .ok_or(WorkloadErr::NonContiguous { what: "targets" })?;
        let weights = self
            .weights
            .as_slice_mut()
            .ok_or(WorkloadErr::NonContiguous { what: "weights" })?;

        Ok((inputs, targets, weights))
    }

    /// Keeps the slice of the worker at `rank`.
    ///
    /// # Errors
    /// `CommErr::InvalidRank` if there is no such worker.
    pub fn select(self, rank: usize) -> Result<HostBatch> {
        let workers = self.targets.nrows();
        if rank >= workers {
            return Err(CommErr::InvalidRank {
                rank,
                world_size: workers,
            }
            .into());
        }

        Ok(HostBatch {
            inputs: self.inputs.index_axis_move(Axis(0), rank),
            targets: self.targets.index_axis_move(Axis(0), rank),
            weights: self.weights.index_axis_move(Axis(0), rank).mapv(|w| w != 0),
        })
    }

    /// Folds the worker axis into the batch axis, keeping the whole global batch.
    pub fn flatten(self) -> Result<HostBatch> {
        let (n, p) = self.targets.dim();

        Ok(HostBatch {
            inputs: self
                .inputs
                .into_shape_with_order((n * p, IMAGE_SIDE, IMAGE_SIDE, CHANNELS))?,
            targets: self.targets.into_shape_with_order(n * p)?,
            weights: self.weights.into_shape_with_order(n * p)?.mapv(|w| w != 0),
        })
    }
}

/// The batch of a single participant, still channels-last.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBatch {
    pub inputs: Array4<f32>,
    pub targets: Array1<i64>,
    pub weights: Array1<bool>,
}

impl HostBatch {
    /// Moves the channel axis: `[B, H, W, C]` becomes `[B, C, H, W]`.
    pub fn into_batch(self) -> Batch {
        Batch {
            inputs: self.inputs.permuted_axes([0, 3, 1, 2]),
            targets: self.targets,
            weights: Some(self.weights),
        }
    }
}

/// The batch a model replica consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Images as `[B, 1, 28, 28]`.
    pub inputs: Array4<f32>,
    pub targets: Array1<i64>,
    /// Whether every example is real data; absent means all of them are.
    pub weights: Option<Array1<bool>>,
}

impl Batch {
    /// Creates a new `Batch`.
    ///
    /// # Errors
    /// `WorkloadErr::ShapeMismatch` if the arrays disagree on the batch size or the images are
    /// not `[1, 28, 28]`.
    pub fn new(
        inputs: Array4<f32>,
        targets: Array1<i64>,
        weights: Option<Array1<bool>>,
    ) -> Result<Self> {
        let b = inputs.len_of(Axis(0));
        check_shape("inputs", inputs.shape(), &[b, CHANNELS, IMAGE_SIDE, IMAGE_SIDE])?;
        check_shape("targets", targets.shape(), &[b])?;
        if let Some(weights) = &weights {
            check_shape("weights", weights.shape(), &[b])?;
        }

        Ok(Self {
            inputs,
            targets,
            weights,
        })
    }

    /// Returns the amount of examples, padding included.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Turns every example from index `keep` onwards into padding.
    pub fn keep_first(&mut self, keep: usize) {
        let len = self.len();
        if keep >= len {
            return;
        }

        self.weights
            .get_or_insert_with(|| Array1::from_elem(len, true))
            .slice_mut(s![keep..])
            .fill(false);
    }

    /// The weights as a `0.`/`1.` mask, all ones when there are none.
    pub fn mask(&self) -> Array1<f32> {
        match &self.weights {
            Some(weights) => weights.mapv(f32::from),
            None => Array1::ones(self.len()),
        }
    }
}
