use std::{cell::RefCell, rc::Rc};

use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::ParamGen;
use crate::Result;

/// Standard deviation of a unit normal truncated to `[-2, 2]`.
const TRUNCATED_STD_CORRECTION: f32 = 0.879_625_66;

/// A normal distribution restricted to `[mean - 2 * std_dev, mean + 2 * std_dev]`.
///
/// Samples outside the interval are redrawn.
#[derive(Debug, Clone, Copy)]
pub struct TruncatedNormal {
    normal: Normal<f32>,
    low: f32,
    high: f32,
}

impl TruncatedNormal {
    /// Creates a new `TruncatedNormal`.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite or negative.
    pub fn new(mean: f32, std_dev: f32) -> Result<Self> {
        let normal = Normal::new(mean, std_dev)?;

        Ok(Self {
            normal,
            low: mean - 2. * std_dev,
            high: mean + 2. * std_dev,
        })
    }
}

impl Distribution<f32> for TruncatedNormal {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        loop {
            let x = self.normal.sample(rng);
            if (self.low..=self.high).contains(&x) {
                return x;
            }
        }
    }
}

/// A parameter generator that follows a certain probabilistic distribution.
pub struct RandParamGen<R: Rng, D: Distribution<f32>> {
    rng: Rc<RefCell<R>>,
    distribution: D,
    remaining: usize,
}

impl<R: Rng, D: Distribution<f32>> RandParamGen<R, D> {
    /// Creates a new `RandParamGen` generator.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `distribution` - The distribution to sample the random numbers from.
    /// * `limit` - The maximum amount of numbers to generate.
    pub fn new(rng: Rc<RefCell<R>>, distribution: D, limit: usize) -> Self {
        Self {
            rng,
            distribution,
            remaining: limit,
        }
    }
}

impl<R: Rng> RandParamGen<R, Normal<f32>> {
    /// Creates a new `RandParamGen` generator with a normal distribution.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `limit` - The maximum amount of numbers to generate.
    /// * `mean` - The mean of the distribution.
    /// * `std_dev` - The standard deviation of the distribution.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite (Nan or infinite).
    pub fn normal(rng: Rc<RefCell<R>>, limit: usize, mean: f32, std_dev: f32) -> Result<Self> {
        Ok(Self::new(rng, Normal::new(mean, std_dev)?, limit))
    }
}

impl<R: Rng> RandParamGen<R, TruncatedNormal> {
    /// Creates a new `RandParamGen` generator using LeCun truncated normal initialization.
    ///
    /// The standard deviation is corrected so that the truncated samples end up with a variance
    /// of `1 / fan_in`.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `limit` - The maximum amount of numbers to generate.
    /// * `fan_in` - The number of input units in the weight tensor.
    ///
    /// # Returns
    /// An error if the calculated standard deviation is not finite (Nan or infinite).
    pub fn lecun_truncated(rng: Rc<RefCell<R>>, limit: usize, fan_in: usize) -> Result<Self> {
        let std_dev = (1. / fan_in as f32).sqrt() / TRUNCATED_STD_CORRECTION;
        Ok(Self::new(rng, TruncatedNormal::new(0., std_dev)?, limit))
    }
}

impl<R: Rng, D: Distribution<f32>> ParamGen for RandParamGen<R, D> {
    fn sample(&mut self, mut n: usize) -> Option<Vec<f32>> {
        if self.remaining == 0 {
            return None;
        }

        n = n.min(self.remaining);
        self.remaining -= n;

        let mut rng = self.rng.borrow_mut();
        let sample = (0..n).map(|_| self.distribution.sample(&mut *rng)).collect();
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn seeded_rng() -> Rc<RefCell<StdRng>> {
        Rc::new(RefCell::new(StdRng::seed_from_u64(42)))
    }

    #[test]
    fn empty() {
        let mut param_gen = RandParamGen::normal(seeded_rng(), 0, 0., 1.).unwrap();
        assert!(param_gen.sample(1).is_none());
    }

    #[test]
    fn partial() {
        let mut param_gen = RandParamGen::normal(seeded_rng(), 10, 0., 1.).unwrap();

        assert_eq!(param_gen.sample(7).unwrap().len(), 7);
        assert_eq!(param_gen.sample(7).unwrap().len(), 3);
        assert!(param_gen.sample(1).is_none());
    }

    #[test]
    fn lecun_truncated_stays_within_two_std() {
        const FAN_IN: usize = 784;
        let bound = 2. * (1. / FAN_IN as f32).sqrt() / TRUNCATED_STD_CORRECTION;

        let mut param_gen = RandParamGen::lecun_truncated(seeded_rng(), 10_000, FAN_IN).unwrap();
        let sample = param_gen.sample(10_000).unwrap();

        assert!(sample.iter().all(|x| x.abs() <= bound));

        let mean = sample.iter().sum::<f32>() / sample.len() as f32;
        let var = sample.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / sample.len() as f32;
        let expected = 1. / FAN_IN as f32;
        assert!((var - expected).abs() < 0.1 * expected, "{var} vs {expected}");
    }

    #[test]
    fn same_seed_same_sample() {
        let a = RandParamGen::lecun_truncated(seeded_rng(), 5, 10)
            .unwrap()
            .sample(5);
        let b = RandParamGen::lecun_truncated(seeded_rng(), 5, 10)
            .unwrap()
            .sample(5);
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_std_is_rejected() {
        assert!(TruncatedNormal::new(0., f32::NAN).is_err());
    }
}
