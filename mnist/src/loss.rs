use machine_learning::arch::loss::{CrossEntropy, LossFn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::{Result, WorkloadErr};

/// The loss of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput {
    /// The summed loss over the number of valid examples.
    pub mean: f32,
    /// Every example's loss, already multiplied by its mask.
    pub per_example: Array1<f32>,
}

fn check_mask(mask: Option<ArrayView1<f32>>, len: usize) -> Result<()> {
    match mask {
        Some(mask) if mask.len() != len => Err(WorkloadErr::ShapeMismatch {
            what: "mask",
            got: vec![mask.len()],
            expected: vec![len],
        }),
        _ => Ok(()),
    }
}

fn check_smoothing(label_smoothing: f32) -> Result<()> {
    if !(0. ..=1.).contains(&label_smoothing) {
        return Err(WorkloadErr::Config(format!(
            "label_smoothing must be in [0, 1], got {label_smoothing}"
        )));
    }

    Ok(())
}

/// Returns the amount of valid examples: the sum of the mask, or every example without one.
fn n_valid(mask: Option<ArrayView1<f32>>, len: usize) -> f32 {
    mask.map_or(len as f32, |mask| mask.sum())
}

/// Masked softmax cross-entropy with label smoothing.
///
/// An all-zero mask has no valid example and yields a `NaN` mean.
///
/// # Arguments
/// * `targets` - The class of every example.
/// * `scores` - The model's unnormalized class scores, one example per row.
/// * `mask` - Whether every example counts, `1.` or `0.`.
/// * `label_smoothing` - Mass moved from the target class onto every class, in `[0, 1]`.
///
/// # Errors
/// `WorkloadErr::ShapeMismatch` if the mask doesn't cover the batch, `WorkloadErr::Config` for
/// an invalid smoothing and model errors for out of range targets.
pub fn cross_entropy(
    targets: ArrayView1<i64>,
    scores: ArrayView2<f32>,
    mask: Option<ArrayView1<f32>>,
    label_smoothing: f32,
) -> Result<LossOutput> {
    check_smoothing(label_smoothing)?;
    check_mask(mask, scores.nrows())?;

    let mut per_example = CrossEntropy::new(label_smoothing).loss(scores, targets)?;
    if let Some(mask) = mask {
        per_example *= &mask;
    }

    Ok(LossOutput {
        mean: per_example.sum() / n_valid(mask, scores.nrows()),
        per_example,
    })
}

/// The derivative of `cross_entropy(..).mean` with respect to `scores`.
///
/// # Errors
/// The same as `cross_entropy`.
pub fn cross_entropy_grad(
    targets: ArrayView1<i64>,
    scores: ArrayView2<f32>,
    mask: Option<ArrayView1<f32>>,
    label_smoothing: f32,
) -> Result<Array2<f32>> {
    check_smoothing(label_smoothing)?;
    check_mask(mask, scores.nrows())?;

    let mut d = CrossEntropy::new(label_smoothing).loss_prime(scores, targets)?;
    if let Some(mask) = mask {
        d *= &mask.insert_axis(Axis(1));
    }

    d /= n_valid(mask, scores.nrows());
    Ok(d)
}
