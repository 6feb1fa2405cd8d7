use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::Result;

/// A classification loss computed independently for every example of a batch.
pub trait LossFn {
    /// Returns the loss of every example.
    ///
    /// # Arguments
    /// * `logits` - Raw class scores, one example per row.
    /// * `targets` - The class id of every example.
    fn loss(&self, logits: ArrayView2<f32>, targets: ArrayView1<i64>) -> Result<Array1<f32>>;

    /// Returns the derivative of every example's loss with respect to its own row of `logits`.
    fn loss_prime(&self, logits: ArrayView2<f32>, targets: ArrayView1<i64>)
    -> Result<Array2<f32>>;
}
