use std::f32;

/// The logistic function scaled by `amp`.
#[derive(Clone, Debug)]
pub struct Sigmoid {
    amp: f32,
}

impl Default for Sigmoid {
    fn default() -> Self {
        Self::new(1.)
    }
}

impl Sigmoid {
    pub fn new(amp: f32) -> Self {
        Self { amp }
    }

    pub fn f(&self, z: f32) -> f32 {
        self.amp / (1. + (-z).exp())
    }

    pub fn df(&self, z: f32) -> f32 {
        // Written in terms of s(z) so that very negative inputs don't produce inf / inf.
        let s = 1. / (1. + (-z).exp());
        self.amp * s * (1. - s)
    }
}
