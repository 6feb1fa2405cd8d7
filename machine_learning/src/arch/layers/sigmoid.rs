use ndarray::{Array2, ArrayView2};

use crate::{MlErr, Result, arch::activations::Sigmoid};

/// An element-wise sigmoid activation, it has no parameters.
#[derive(Debug, Clone, Default)]
pub struct SigmoidLayer {
    act_fn: Sigmoid,
}

impl SigmoidLayer {
    pub fn new(amp: f32) -> Self {
        Self {
            act_fn: Sigmoid::new(amp),
        }
    }

    pub fn forward(&self, z: ArrayView2<f32>) -> Array2<f32> {
        z.mapv(|z| self.act_fn.f(z))
    }

    /// Scales the incoming delta by the derivative of the sigmoid at the forward input `z`.
    pub fn backward(&self, z: ArrayView2<f32>, mut d: Array2<f32>) -> Result<Array2<f32>> {
        if z.dim() != d.dim() {
            return Err(MlErr::SizeMismatch {
                what: "sigmoid delta",
                got: d.len(),
                expected: z.len(),
            });
        }

        d.zip_mut_with(&z, |d, &z| *d *= self.act_fn.df(z));
        Ok(d)
    }
}
