/// A source of initial parameter values.
pub trait ParamGen {
    /// Samples at most `n` values.
    ///
    /// # Arguments
    /// * `n` - The amount of values wanted.
    ///
    /// # Returns
    /// Up to `n` values, or `None` once the generator's limit has been reached.
    fn sample(&mut self, n: usize) -> Option<Vec<f32>>;
}
