use candle_nn::Module;

/// A single-input feature transform with a statically known output width.
pub trait Block: Module {
    /// Number of channels produced by [`Module::forward`].
    fn out_channels(&self) -> usize;
}
