use rand::Rng;

use crate::{
    Result, WorkloadErr,
    batch::{IMAGE_SIDE, NUM_CLASSES},
};

/// The amount of pixels in every image.
pub const IMAGE_PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;

/// A labeled image split held in memory, in its raw 8-bit form.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    images: Vec<u8>,
    labels: Vec<u8>,
}

impl InMemoryDataset {
    /// Creates a new dataset from owned buffers.
    ///
    /// # Arguments
    /// * `images` - Row-major 28x28 images, one after the other.
    /// * `labels` - The class of every image.
    ///
    /// # Errors
    /// `WorkloadErr::ShapeMismatch` if the buffers disagree on the amount of examples and
    /// `WorkloadErr::Config` for a label that is not a class.
    pub fn new(images: Vec<u8>, labels: Vec<u8>) -> Result<Self> {
        if images.len() != labels.len() * IMAGE_PIXELS {
            return Err(WorkloadErr::ShapeMismatch {
                what: "images",
                got: vec![images.len()],
                expected: vec![labels.len() * IMAGE_PIXELS],
            });
        }

        if let Some(label) = labels.iter().find(|&&l| usize::from(l) >= NUM_CLASSES) {
            return Err(WorkloadErr::Config(format!("label {label} is not a digit")));
        }

        Ok(Self { images, labels })
    }

    /// Generates `len` examples whose class is drawn as a bright horizontal band over noise,
    /// so that a model can actually fit them.
    pub fn synthetic<R: Rng>(len: usize, rng: &mut R) -> Self {
        let mut images = Vec::with_capacity(len * IMAGE_PIXELS);
        let mut labels = Vec::with_capacity(len);

        for _ in 0..len {
            let label = rng.random_range(0..NUM_CLASSES as u8);
            let band = 4 + 2 * usize::from(label);

            images.extend((0..IMAGE_PIXELS).map(|px| {
                if px / IMAGE_SIDE == band {
                    rng.random_range(200..=255)
                } else {
                    rng.random_range(0..64)
                }
            }));
            labels.push(label);
        }

        Self { images, labels }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns the pixels of the image at `idx` (panics if out of bounds).
    #[inline]
    pub fn image(&self, idx: usize) -> &[u8] {
        &self.images[idx * IMAGE_PIXELS..(idx + 1) * IMAGE_PIXELS]
    }

    /// Returns the label at `idx` (panics if out of bounds).
    #[inline]
    pub fn label(&self, idx: usize) -> u8 {
        self.labels[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn dataset_basic() {
        let mut images = vec![0; 2 * IMAGE_PIXELS];
        images[IMAGE_PIXELS] = 255;
        let ds = InMemoryDataset::new(images, vec![3, 9]).unwrap();

        assert_eq!(ds.len(), 2);
        assert_eq!(ds.label(1), 9);
        assert_eq!(ds.image(1)[0], 255);
        assert_eq!(ds.image(0).len(), IMAGE_PIXELS);
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        assert!(InMemoryDataset::new(vec![0; IMAGE_PIXELS], vec![1, 2]).is_err());
        assert!(InMemoryDataset::new(vec![0; IMAGE_PIXELS], vec![10]).is_err());
    }

    #[test]
    fn synthetic_is_seeded() {
        let a = InMemoryDataset::synthetic(8, &mut StdRng::seed_from_u64(1));
        let b = InMemoryDataset::synthetic(8, &mut StdRng::seed_from_u64(1));

        assert_eq!(a.len(), 8);
        assert_eq!(a.images, b.images);
        assert_eq!(a.labels, b.labels);
    }
}
