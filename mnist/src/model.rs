use machine_learning::arch::{Sequential, layers::Layer};

use crate::{batch::NUM_CLASSES, data::IMAGE_PIXELS};

/// The width of the hidden layer.
pub const HIDDEN_SIZE: usize = 128;
/// The container every parameter key starts with.
pub const PARAM_PREFIX: &str = "net";
/// The layer that produces the class scores.
pub const OUTPUT_LAYER: &str = "layer2";

/// Builds the two layer perceptron: `784 -> 128 -> sigmoid -> 10`.
pub fn mnist_net() -> Sequential {
    Sequential::new([
        ("layer1", Layer::dense((IMAGE_PIXELS, HIDDEN_SIZE))),
        ("layer1_sig", Layer::sigmoid(1.)),
        (OUTPUT_LAYER, Layer::dense((HIDDEN_SIZE, NUM_CLASSES))),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_count() {
        assert_eq!(mnist_net().size(), 784 * 128 + 128 + 128 * 10 + 10);
        assert_eq!(mnist_net().output_layer(), Some(OUTPUT_LAYER));
    }
}
