use std::ops::AddAssign;

use serde::Serialize;

/// The evaluation metrics of a batch, or of a split once normalized.
///
/// Per batch both fields are sums over the valid examples: `accuracy` counts the correct
/// predictions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct EvalMetrics {
    pub accuracy: f32,
    pub loss: f32,
}

impl EvalMetrics {
    /// Divides every metric by `n`.
    pub fn averaged(self, n: f32) -> Self {
        Self {
            accuracy: self.accuracy / n,
            loss: self.loss / n,
        }
    }

    pub(crate) fn to_array(self) -> [f32; 2] {
        [self.accuracy, self.loss]
    }

    pub(crate) fn from_array([accuracy, loss]: [f32; 2]) -> Self {
        Self { accuracy, loss }
    }
}

impl AddAssign for EvalMetrics {
    fn add_assign(&mut self, rhs: Self) {
        self.accuracy += rhs.accuracy;
        self.loss += rhs.loss;
    }
}
