use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Zip};

use super::LossFn;
use crate::{MlErr, Result};

/// Softmax cross-entropy against integer targets with optional label smoothing.
///
/// With smoothing `e` and `C` classes the target distribution is
/// `q = (1 - e) * onehot(target) + e / C`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropy {
    label_smoothing: f32,
}

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    ///
    /// # Arguments
    /// * `label_smoothing` - The smoothing coefficient, in `[0, 1]`.
    pub fn new(label_smoothing: f32) -> Self {
        Self { label_smoothing }
    }

    fn check(&self, logits: &ArrayView2<f32>, targets: &ArrayView1<i64>) -> Result<()> {
        if logits.nrows() != targets.len() {
            return Err(MlErr::SizeMismatch {
                what: "targets",
                got: targets.len(),
                expected: logits.nrows(),
            });
        }

        let classes = logits.ncols();
        if let Some(&target) = targets
            .iter()
            .find(|&&t| t < 0 || t as usize >= classes)
        {
            return Err(MlErr::TargetOutOfRange { target, classes });
        }

        Ok(())
    }

    /// Writes the smoothed target distribution of `target` into `q`.
    fn smoothed(&self, target: usize, mut q: ArrayViewMut1<f32>) {
        let e = self.label_smoothing;
        let classes = q.len() as f32;
        q.fill(e / classes);
        q[target] += 1. - e;
    }
}

/// Returns `log(sum(exp(row)))`, shifted by the row maximum for stability.
fn log_sum_exp(row: ArrayView1<f32>) -> f32 {
    let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
    max + row.fold(0., |acc, &x| acc + (x - max).exp()).ln()
}

impl LossFn for CrossEntropy {
    fn loss(&self, logits: ArrayView2<f32>, targets: ArrayView1<i64>) -> Result<Array1<f32>> {
        self.check(&logits, &targets)?;

        let mut q = Array1::zeros(logits.ncols());
        let mut losses = Array1::zeros(logits.nrows());

        Zip::from(&mut losses)
            .and(logits.rows())
            .and(&targets)
            .for_each(|loss, row, &target| {
                self.smoothed(target as usize, q.view_mut());
                let lse = log_sum_exp(row);
                *loss = Zip::from(&q)
                    .and(&row)
                    .fold(0., |acc, &q, &l| acc + q * (lse - l));
            });

        Ok(losses)
    }

    fn loss_prime(
        &self,
        logits: ArrayView2<f32>,
        targets: ArrayView1<i64>,
    ) -> Result<Array2<f32>> {
        self.check(&logits, &targets)?;

        let mut q = Array1::zeros(logits.ncols());
        let mut d = Array2::zeros(logits.dim());

        Zip::from(d.rows_mut())
            .and(logits.rows())
            .and(&targets)
            .for_each(|mut d, row, &target| {
                self.smoothed(target as usize, q.view_mut());
                let lse = log_sum_exp(row);
                Zip::from(&mut d)
                    .and(&row)
                    .and(&q)
                    .for_each(|d, &l, &q| *d = (l - lse).exp() - q);
            });

        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const TOL: f32 = 1e-5;

    #[test]
    fn uniform_logits_cost_log_classes() {
        let logits: Array2<f32> = Array2::zeros((2, 10));
        let targets = array![3i64, 9];

        let losses = CrossEntropy::default().loss(logits.view(), targets.view()).unwrap();

        for loss in losses.iter() {
            assert!((loss - 10f32.ln()).abs() < TOL);
        }
    }

    #[test]
    fn matches_hand_computed_value() {
        let logits: Array2<f32> = array![[1., 2., 3.]];
        let targets = array![0i64];

        let lse = (1f32.exp() + 2f32.exp() + 3f32.exp()).ln();
        let losses = CrossEntropy::default().loss(logits.view(), targets.view()).unwrap();

        assert!((losses[0] - (lse - 1.)).abs() < TOL);
    }

    #[test]
    fn smoothing_mixes_in_the_uniform_loss() {
        let logits: Array2<f32> = array![[1., 2., 3.]];
        let targets = array![0i64];
        let lse = (1f32.exp() + 2f32.exp() + 3f32.exp()).ln();

        let e = 0.3;
        let losses = CrossEntropy::new(e).loss(logits.view(), targets.view()).unwrap();

        let hard = lse - 1.;
        let uniform = lse - 2.;
        assert!((losses[0] - ((1. - e) * hard + e * uniform)).abs() < TOL);
    }

    #[test]
    fn stable_for_large_logits() {
        let logits: Array2<f32> = array![[1000., 0.]];
        let targets = array![0i64];

        let losses = CrossEntropy::default().loss(logits.view(), targets.view()).unwrap();

        assert!(losses[0].is_finite());
        assert!(losses[0].abs() < TOL);
    }

    #[test]
    fn prime_is_softmax_minus_target() {
        let logits: Array2<f32> = array![[0., 0.], [0., 0.]];
        let targets = array![1i64, 0];

        let d = CrossEntropy::default()
            .loss_prime(logits.view(), targets.view())
            .unwrap();

        let expected: Array2<f32> = array![[0.5, -0.5], [-0.5, 0.5]];
        assert!((&d - &expected).iter().all(|x| x.abs() < TOL));
    }

    #[test]
    fn prime_rows_sum_to_zero() {
        let logits: Array2<f32> = array![[0.2, -1.3, 4.], [2., 2., 0.5]];
        let targets = array![2i64, 0];

        let d = CrossEntropy::new(0.1)
            .loss_prime(logits.view(), targets.view())
            .unwrap();

        for row in d.rows() {
            assert!(row.sum().abs() < TOL);
        }
    }

    #[test]
    fn rejects_out_of_range_targets() {
        let logits: Array2<f32> = Array2::zeros((1, 10));

        let err = CrossEntropy::default()
            .loss(logits.view(), array![10i64].view())
            .unwrap_err();
        assert!(matches!(err, MlErr::TargetOutOfRange { target: 10, classes: 10 }));

        assert!(CrossEntropy::default()
            .loss(logits.view(), array![-1i64].view())
            .is_err());
    }

    #[test]
    fn rejects_length_mismatch() {
        let logits: Array2<f32> = Array2::zeros((2, 10));
        assert!(CrossEntropy::default()
            .loss(logits.view(), array![1i64].view())
            .is_err());
    }
}
