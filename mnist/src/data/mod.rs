mod dataset;
mod pipeline;

pub use dataset::{IMAGE_PIXELS, InMemoryDataset};
pub use pipeline::{InputPipeline, PipelineOptions};

/// Mean pixel intensity of the train split, after scaling to `[0, 1]`.
pub const TRAIN_MEAN: f32 = 0.1307;
/// Standard deviation of the scaled pixel intensities of the train split.
pub const TRAIN_STDDEV: f32 = 0.3081;
