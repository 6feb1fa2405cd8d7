use std::{cell::RefCell, rc::Rc};

use ndarray::{linalg, prelude::*};
use rand::Rng;

use crate::{
    MlErr, Result,
    initialization::{ConstParamGen, ParamGen, RandParamGen},
};

/// A fully connected layer: `z = x · wᵀ + b`.
///
/// The layer owns no parameters, they live in a flat slice laid out as the row-major weights of
/// shape `[fan_out, fan_in]` followed by the `fan_out` biases.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    size: usize,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The `(fan_in, fan_out)` dimensions of the layer.
    pub fn new(dim: (usize, usize)) -> Self {
        Self {
            dim,
            size: (dim.0 + 1) * dim.1,
        }
    }

    /// Returns the size of this layer.
    ///
    /// # Returns
    /// The amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fan_in(&self) -> usize {
        self.dim.0
    }

    pub fn fan_out(&self) -> usize {
        self.dim.1
    }

    /// Makes a forward pass through the layer.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of parameters.
    /// * `x` - The input, one example per row.
    ///
    /// # Returns
    /// The pre-activations of shape `[x.nrows(), fan_out]`.
    pub fn forward(&self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_input(x.ncols())?;
        let (w, b) = self.view_params(params)?;

        let mut z = Array2::zeros((x.nrows(), self.fan_out()));
        linalg::general_mat_mul(1.0, &x, &w.t(), 0.0, &mut z);
        z += &b;

        Ok(z)
    }

    /// Computes this layer's gradient and the delta for the previous layer.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of parameters.
    /// * `grad` - This layer's slice of the gradient, overwritten.
    /// * `x` - The input the forward pass was made with.
    /// * `d` - The derivative of the loss with respect to this layer's output.
    ///
    /// # Returns
    /// The derivative of the loss with respect to `x`.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        x: ArrayView2<f32>,
        d: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        self.check_input(x.ncols())?;
        if d.dim() != (x.nrows(), self.fan_out()) {
            return Err(MlErr::SizeMismatch {
                what: "dense delta",
                got: d.len(),
                expected: x.nrows() * self.fan_out(),
            });
        }

        let (mut dw, mut db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &d.t(), &x, 0.0, &mut dw);
        db.assign(&d.sum_axis(Axis(0)));

        let (w, _) = self.view_params(params)?;
        Ok(d.dot(&w))
    }

    /// Samples this layer's initial parameters.
    ///
    /// Weights follow a LeCun truncated normal, biases start at zero.
    ///
    /// # Arguments
    /// * `rng` - The random number generator shared by every layer of the model.
    pub fn init_params<R: Rng>(&self, rng: Rc<RefCell<R>>) -> Result<Vec<f32>> {
        let w_size = self.size - self.fan_out();

        let mut params = RandParamGen::lecun_truncated(rng, w_size, self.fan_in())?
            .sample(w_size)
            .unwrap_or_default();
        params.extend(
            ConstParamGen::new(0., self.fan_out())
                .sample(self.fan_out())
                .unwrap_or_default(),
        );

        Ok(params)
    }

    fn check_input(&self, ncols: usize) -> Result<()> {
        if ncols != self.fan_in() {
            return Err(MlErr::SizeMismatch {
                what: "dense input features",
                got: ncols,
                expected: self.fan_in(),
            });
        }

        Ok(())
    }

    fn check_slice(&self, len: usize) -> Result<()> {
        if len != self.size {
            return Err(MlErr::SizeMismatch {
                what: "dense parameters",
                got: len,
                expected: self.size,
            });
        }

        Ok(())
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    ///
    /// # Arguments
    /// * `grad` - A gradient slice.
    ///
    /// # Returns
    /// A tuple containing the delta weights and delta biases.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        self.check_slice(grad.len())?;

        let w_size = self.size - self.fan_out();
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape((self.fan_out(), self.fan_in()), dw_raw)?;
        let db = ArrayViewMut1::from_shape(self.fan_out(), db_raw)?;
        Ok((dw, db))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    ///
    /// # Arguments
    /// * `params` - A slice of parameters.
    ///
    /// # Returns
    /// A tuple containing the weights and biases.
    fn view_params<'a>(&self, params: &'a [f32]) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        self.check_slice(params.len())?;

        let w_size = self.size - self.fan_out();
        let (w_raw, b_raw) = params.split_at(w_size);
        let w = ArrayView2::from_shape((self.fan_out(), self.fan_in()), w_raw)?;
        let b = ArrayView1::from_shape(self.fan_out(), b_raw)?;
        Ok((w, b))
    }
}
