use thiserror::Error;

/// An error type for block construction and evaluation.
#[derive(Error, Debug)]
pub enum BlockError {
    /// The block's transform does not preserve the channel count required by the identity path.
    #[error("Channel mismatch: expected {expected} channels, got {got}")]
    ChannelMismatch {
        /// The number of channels required.
        expected: usize,
        /// The number of channels configured.
        got: usize,
    },

    /// A derived channel width collapsed to zero.
    #[error("Non-positive width for `{0}`: {1}")]
    NonPositiveWidth(&'static str, usize),

    /// A channel count is not divisible as the block layout requires.
    #[error("{what} ({value}) is not divisible by {divisor}")]
    Indivisible {
        /// What is being divided.
        what: &'static str,
        /// The dividend.
        value: usize,
        /// The required divisor.
        divisor: usize,
    },

    /// A configuration argument is outside its valid range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Error raised by the tensor engine.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Fails with [`BlockError::NonPositiveWidth`] if `value` is zero.
pub(crate) fn ensure_positive(name: &'static str, value: usize) -> Result<usize, BlockError> {
    if value == 0 {
        return Err(BlockError::NonPositiveWidth(name, value));
    }
    Ok(value)
}

/// Fails with [`BlockError::Indivisible`] unless `value % divisor == 0`.
pub(crate) fn ensure_divisible(
    what: &'static str,
    value: usize,
    divisor: usize,
) -> Result<(), BlockError> {
    if divisor == 0 || value % divisor != 0 {
        return Err(BlockError::Indivisible {
            what,
            value,
            divisor,
        });
    }
    Ok(())
}

/// Fails with [`BlockError::ChannelMismatch`] unless `expected == got`.
pub(crate) fn ensure_channels(expected: usize, got: usize) -> Result<(), BlockError> {
    if expected != got {
        return Err(BlockError::ChannelMismatch { expected, got });
    }
    Ok(())
}
