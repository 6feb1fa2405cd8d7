use std::sync::Arc;

use log::debug;
use ndarray::{ArrayD, IxDyn};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::{IMAGE_PIXELS, InMemoryDataset, TRAIN_MEAN, TRAIN_STDDEV};
use crate::batch::{BatchShape, CHANNELS, IMAGE_SIDE, RawBatch};

/// How an `InputPipeline` walks its dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Shuffles the examples every epoch with this seed.
    pub shuffle_seed: Option<u64>,
    /// Cycles over the dataset forever instead of stopping after one pass.
    pub repeat: bool,
    /// Stops after this many batches.
    pub num_batches: Option<usize>,
}

/// Produces normalized global batches out of an `InMemoryDataset`.
///
/// A single pass ends with a partial batch padded with zero-weight examples, a repeating
/// pipeline never pads.
#[derive(Debug, Clone)]
pub struct InputPipeline {
    dataset: Arc<InMemoryDataset>,
    shape: BatchShape,
    options: PipelineOptions,
    rng: Option<StdRng>,
    order: Vec<usize>,
    cursor: usize,
    emitted: usize,
}

impl InputPipeline {
    /// Creates a new `InputPipeline`.
    ///
    /// # Arguments
    /// * `dataset` - The examples to walk.
    /// * `shape` - The layout of every produced batch.
    /// * `options` - Shuffling, repetition and length.
    pub fn new(dataset: Arc<InMemoryDataset>, shape: BatchShape, options: PipelineOptions) -> Self {
        let mut pipeline = Self {
            order: (0..dataset.len()).collect(),
            dataset,
            shape,
            options,
            rng: options.shuffle_seed.map(StdRng::seed_from_u64),
            cursor: 0,
            emitted: 0,
        };

        pipeline.shuffle();
        pipeline
    }

    fn shuffle(&mut self) {
        if let Some(rng) = &mut self.rng {
            self.order.shuffle(rng);
        }
    }

    /// Picks the dataset indices of the next batch, fewer than a full batch only at the end
    /// of a single pass.
    fn next_indices(&mut self) -> Vec<usize> {
        let global = self.shape.global();
        let mut indices = Vec::with_capacity(global);

        while indices.len() < global {
            if self.cursor == self.order.len() {
                if !self.options.repeat {
                    break;
                }

                self.cursor = 0;
                self.shuffle();
            }

            indices.push(self.order[self.cursor]);
            self.cursor += 1;
        }

        indices
    }
}

fn normalize(px: u8) -> f32 {
    (f32::from(px) / 255. - TRAIN_MEAN) / TRAIN_STDDEV
}

impl Iterator for InputPipeline {
    type Item = RawBatch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dataset.is_empty()
            || self.options.num_batches.is_some_and(|limit| self.emitted >= limit)
        {
            return None;
        }

        let indices = self.next_indices();
        if indices.is_empty() {
            return None;
        }

        let (n, p) = (self.shape.num_workers(), self.shape.per_worker());
        let dataset = &self.dataset;
        let example = |ix: &IxDyn| indices.get(ix[0] * p + ix[1]).copied();

        let inputs = ArrayD::from_shape_fn(
            IxDyn(&[n, p, IMAGE_SIDE, IMAGE_SIDE, CHANNELS]),
            |ix| match example(&ix) {
                Some(idx) => normalize(dataset.image(idx)[ix[2] * IMAGE_SIDE + ix[3]]),
                None => 0.,
            },
        );
        let targets = ArrayD::from_shape_fn(IxDyn(&[n, p]), |ix| {
            example(&ix).map_or(0, |idx| i32::from(dataset.label(idx)))
        });
        let weights =
            ArrayD::from_shape_fn(IxDyn(&[n, p]), |ix| f32::from(u8::from(example(&ix).is_some())));

        debug!(
            batch = self.emitted,
            examples = indices.len(),
            padding = self.shape.global() - indices.len();
            "built input batch"
        );
        self.emitted += 1;

        Some(RawBatch {
            inputs,
            targets,
            weights,
        })
    }
}
