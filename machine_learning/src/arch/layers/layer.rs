use std::{cell::RefCell, rc::Rc};

use ndarray::{Array2, ArrayView2};
use rand::Rng;

use super::{Dense, SigmoidLayer};
use crate::Result;

#[derive(Debug, Clone)]
pub enum Layer {
    Dense(Dense),
    Sigmoid(SigmoidLayer),
}

impl Layer {
    /// A dense layer of `(fan_in, fan_out)` dimensions.
    pub fn dense(dim: (usize, usize)) -> Self {
        Self::Dense(Dense::new(dim))
    }

    pub fn sigmoid(amp: f32) -> Self {
        Self::Sigmoid(SigmoidLayer::new(amp))
    }

    /// Returns the amount of parameters of the layer.
    pub fn size(&self) -> usize {
        match self {
            Layer::Dense(l) => l.size(),
            Layer::Sigmoid(_) => 0,
        }
    }

    pub fn forward(&self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        match self {
            Layer::Dense(l) => l.forward(params, x),
            Layer::Sigmoid(l) => Ok(l.forward(x)),
        }
    }

    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        x: ArrayView2<f32>,
        d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        match self {
            Layer::Dense(l) => l.backward(params, grad, x, d.view()),
            Layer::Sigmoid(l) => l.backward(x, d),
        }
    }

    pub fn init_params<R: Rng>(&self, rng: Rc<RefCell<R>>) -> Result<Vec<f32>> {
        match self {
            Layer::Dense(l) => l.init_params(rng),
            Layer::Sigmoid(_) => Ok(Vec::new()),
        }
    }
}
