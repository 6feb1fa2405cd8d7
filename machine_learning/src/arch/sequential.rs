use std::{cell::RefCell, ops::Range, rc::Rc};

use log::debug;
use ndarray::{Array2, ArrayView2};
use rand::Rng;

use super::layers::Layer;
use crate::{MlErr, Result};

/// Whether a parameter tensor is a weight matrix or a bias vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Weight,
    Bias,
}

/// Where a named parameter tensor lives inside the flat parameter buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSlot {
    pub key: String,
    pub shape: Vec<usize>,
    pub kind: ParamKind,
    pub range: Range<usize>,
}

/// The input of every layer, recorded by a forward pass that tracks gradients.
#[derive(Debug, Clone)]
pub struct Tape {
    inputs: Vec<Array2<f32>>,
}

impl Tape {
    /// Returns the amount of recorded layer inputs.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// A sequential model: information flows forward when computing an output and backward when
/// computing the *deltas* of its layers.
///
/// The model holds no parameters, they are given on every pass as one flat slice where each
/// layer's parameters follow the previous layer's.
#[derive(Debug, Clone)]
pub struct Sequential {
    layers: Vec<(String, Layer)>,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `layers` - The named layers the sequential is composed of.
    ///
    /// # Returns
    /// A new `Sequential` instance.
    pub fn new<I, S>(layers: I) -> Self
    where
        I: IntoIterator<Item = (S, Layer)>,
        S: Into<String>,
    {
        Self {
            layers: layers
                .into_iter()
                .map(|(name, layer)| (name.into(), layer))
                .collect(),
        }
    }

    /// Returns the amount of parameters in the model.
    pub fn size(&self) -> usize {
        self.layers.iter().map(|(_, layer)| layer.size()).sum()
    }

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `x` - The input data, one example per row.
    /// * `record` - Whether to keep the tape needed by `backward`.
    ///
    /// # Returns
    /// The prediction for the given input and the tape if it was requested.
    pub fn forward(
        &self,
        params: &[f32],
        x: ArrayView2<f32>,
        record: bool,
    ) -> Result<(Array2<f32>, Option<Tape>)> {
        self.check_params(params.len(), "params")?;

        let mut inputs = Vec::with_capacity(if record { self.layers.len() } else { 0 });
        let mut out = x.to_owned();

        for ((_, layer), range) in self.layers.iter().zip(self.ranges()) {
            let next = layer.forward(&params[range], out.view())?;

            if record {
                inputs.push(out);
            }

            out = next;
        }

        Ok((out, record.then_some(Tape { inputs })))
    }

    /// Backpropagates `d_out` through the network.
    ///
    /// # Arguments
    /// * `params` - The parameters the forward pass was made with.
    /// * `tape` - The tape recorded by that forward pass.
    /// * `d_out` - The derivative of the loss with respect to the model's output.
    ///
    /// # Returns
    /// The gradient of the loss with respect to `params`, laid out like `params`.
    pub fn backward(&self, params: &[f32], tape: &Tape, d_out: Array2<f32>) -> Result<Vec<f32>> {
        self.check_params(params.len(), "params")?;

        if tape.len() != self.layers.len() {
            return Err(MlErr::SizeMismatch {
                what: "tape",
                got: tape.len(),
                expected: self.layers.len(),
            });
        }

        let mut grad = vec![0.; params.len()];
        let mut d = d_out;

        let ranges: Vec<_> = self.ranges().collect();
        for (((_, layer), range), x) in self
            .layers
            .iter()
            .zip(ranges)
            .zip(&tape.inputs)
            .rev()
        {
            d = layer.backward(&params[range.clone()], &mut grad[range], x.view(), d)?;
        }

        Ok(grad)
    }

    /// Samples a fresh set of parameters, layer by layer.
    ///
    /// # Arguments
    /// * `rng` - The random number generator.
    pub fn init_params<R: Rng>(&self, rng: Rc<RefCell<R>>) -> Result<Vec<f32>> {
        let mut params = Vec::with_capacity(self.size());

        for (name, layer) in &self.layers {
            let layer_params = layer.init_params(rng.clone())?;
            debug!(layer = name.as_str(), size = layer_params.len(); "initialized layer");
            params.extend(layer_params);
        }

        self.check_params(params.len(), "initialized params")?;
        Ok(params)
    }

    /// Lists every parameter tensor of the model as `<prefix>.<layer>.<weight|bias>`.
    ///
    /// # Arguments
    /// * `prefix` - The name of the container the layers live in.
    pub fn param_slots(&self, prefix: &str) -> Vec<ParamSlot> {
        let mut slots = Vec::new();

        for ((name, layer), range) in self.layers.iter().zip(self.ranges()) {
            let Layer::Dense(dense) = layer else {
                continue;
            };

            let (fan_in, fan_out) = (dense.fan_in(), dense.fan_out());
            let split = range.start + fan_in * fan_out;

            slots.push(ParamSlot {
                key: format!("{prefix}.{name}.weight"),
                shape: vec![fan_out, fan_in],
                kind: ParamKind::Weight,
                range: range.start..split,
            });
            slots.push(ParamSlot {
                key: format!("{prefix}.{name}.bias"),
                shape: vec![fan_out],
                kind: ParamKind::Bias,
                range: split..range.end,
            });
        }

        slots
    }

    /// Returns the name of the last layer that holds parameters.
    pub fn output_layer(&self) -> Option<&str> {
        self.layers
            .iter()
            .rev()
            .find(|(_, layer)| layer.size() > 0)
            .map(|(name, _)| name.as_str())
    }

    fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.layers.iter().scan(0, |offset, (_, layer)| {
            let start = *offset;
            *offset += layer.size();
            Some(start..*offset)
        })
    }

    fn check_params(&self, got: usize, what: &'static str) -> Result<()> {
        let expected = self.size();
        if got != expected {
            return Err(MlErr::SizeMismatch {
                what,
                got,
                expected,
            });
        }

        Ok(())
    }
}
